//! Multi-tunnel orchestration
//!
//! Owns one supervisor per configured tunnel, fans start/stop out across all
//! of them, and aggregates status. A failure on one tunnel never aborts its
//! siblings; it is logged and surfaced as an error event instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::config::{AppConfig, TunnelSpec};
use crate::error::{Result, TunnelError};
use crate::provider::{build_provider, ProviderKind, TunnelProvider};
use crate::supervisor::{ProviderFactory, TunnelEvent, TunnelStatus, TunnelSupervisor};

/// Builds a provider for a given tunnel spec and ring slot; injectable so
/// tests can substitute scripted providers.
pub type SpecProviderFactory =
    Arc<dyn Fn(&TunnelSpec, ProviderKind) -> Box<dyn TunnelProvider> + Send + Sync>;

/// Owns a collection of named tunnel supervisors
pub struct Orchestrator {
    config: AppConfig,
    factory: SpecProviderFactory,
    supervisors: RwLock<HashMap<String, Arc<TunnelSupervisor>>>,
    event_tx: broadcast::Sender<TunnelEvent>,
}

impl Orchestrator {
    /// Create an orchestrator with the real provider backends. Fails fast on
    /// invalid configuration, before any process is spawned.
    pub fn new(config: AppConfig) -> Result<Self> {
        let start_timeout = Duration::from_millis(config.supervisor.start_timeout_ms);
        let factory: SpecProviderFactory = Arc::new(move |spec: &TunnelSpec, kind| {
            build_provider(kind, spec.port, &spec.options, start_timeout)
        });
        Self::with_provider_factory(config, factory)
    }

    /// Create an orchestrator with a custom provider factory
    pub fn with_provider_factory(config: AppConfig, factory: SpecProviderFactory) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| TunnelError::Validation(errors.join("; ")))?;
        let (event_tx, _) = broadcast::channel(64);
        Ok(Self {
            config,
            factory,
            supervisors: RwLock::new(HashMap::new()),
            event_tx,
        })
    }

    /// Subscribe to tunnel events from all supervisors
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    /// Start every configured tunnel. Failures are isolated per tunnel and
    /// surfaced as error events; returns the (name, url) pairs that came up.
    pub async fn start_all(&self) -> Vec<(String, String)> {
        let mut ready = Vec::new();
        for spec in self.config.tunnels.clone() {
            match self.start_tunnel(&spec).await {
                Ok(url) => ready.push((spec.name.clone(), url)),
                Err(e) => {
                    error!(tunnel = %spec.name, error = %e, "failed to start tunnel");
                    let _ = self.event_tx.send(TunnelEvent::Error {
                        context: spec.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        ready
    }

    async fn start_tunnel(&self, spec: &TunnelSpec) -> Result<String> {
        // A live entry under this name wins; no duplicate providers
        if let Some(existing) = self.supervisors.read().await.get(&spec.name) {
            if let Some(url) = existing.url() {
                warn!(tunnel = %spec.name, url = %url, "tunnel already running");
                return Ok(url);
            }
        }

        let spec_for_factory = spec.clone();
        let factory = Arc::clone(&self.factory);
        let provider_factory: ProviderFactory =
            Arc::new(move |kind| factory(&spec_for_factory, kind));

        let supervisor = TunnelSupervisor::new(
            spec,
            self.config.health.clone(),
            self.config.supervisor.clone(),
            provider_factory,
            self.event_tx.clone(),
        );

        let url = supervisor.start().await?;

        if let Some(stale) = self
            .supervisors
            .write()
            .await
            .insert(spec.name.clone(), supervisor)
        {
            // Replaced a dead entry; make sure it holds no resources
            stale.stop().await;
        }
        Ok(url)
    }

    /// Stop every tunnel in parallel and clear internal state. Always safe,
    /// even if nothing ever started.
    pub async fn stop_all(&self) {
        let supervisors: Vec<Arc<TunnelSupervisor>> = {
            let mut map = self.supervisors.write().await;
            map.drain().map(|(_, s)| s).collect()
        };

        if supervisors.is_empty() {
            return;
        }

        info!("stopping {} tunnels", supervisors.len());
        futures::future::join_all(supervisors.iter().map(|s| s.stop())).await;
        info!("all tunnels stopped");
    }

    /// Aggregate status across all managed tunnels
    pub async fn status(&self) -> HashMap<String, TunnelStatus> {
        let supervisors = self.supervisors.read().await;
        let mut out = HashMap::with_capacity(supervisors.len());
        for (name, supervisor) in supervisors.iter() {
            out.insert(name.clone(), supervisor.status().await);
        }
        out
    }

    /// Currently active public URLs
    pub async fn urls(&self) -> Vec<String> {
        let supervisors = self.supervisors.read().await;
        supervisors.values().filter_map(|s| s.url()).collect()
    }
}
