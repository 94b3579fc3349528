//! Per-tunnel lifecycle supervision
//!
//! A `TunnelSupervisor` owns one managed tunnel: it starts a provider from
//! its ring, attaches the health probe to the advertised URL, and reacts to
//! critical health escalations or unexpected process exits by restarting the
//! provider — failing over to the next ring entry once the current one has
//! exhausted its start-attempt budget.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{HealthCheckPolicy, SupervisorConfig, TunnelSpec};
use crate::error::{Result, TunnelError};
use crate::health::{HealthEvent, HealthProbe, HealthSnapshot};
use crate::provider::{ProviderExit, ProviderKind, TunnelProvider};

/// Events emitted by supervisors, fanned out through the orchestrator
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A tunnel came up (initially or after a restart)
    Ready { name: String, url: String },
    /// A tunnel was detected down and recovery is starting
    Down { name: String, error: String },
    /// Failover advanced the provider ring
    ProviderChanged {
        name: String,
        provider: ProviderKind,
    },
    /// A failure that was not recovered automatically
    Error { context: String, error: String },
}

/// Builds a fresh provider instance for a ring slot
pub type ProviderFactory = Arc<dyn Fn(ProviderKind) -> Box<dyn TunnelProvider> + Send + Sync>;

/// Ordered, wrapping list of provider kinds used for failover
#[derive(Debug, Clone)]
pub struct ProviderRing {
    kinds: Vec<ProviderKind>,
    index: usize,
}

impl ProviderRing {
    /// Empty rings are rejected by config validation before this is reached.
    pub fn new(kinds: Vec<ProviderKind>) -> Self {
        debug_assert!(!kinds.is_empty());
        Self { kinds, index: 0 }
    }

    pub fn current(&self) -> ProviderKind {
        self.kinds[self.index]
    }

    /// Advance to the next entry, wrapping modulo length.
    pub fn advance(&mut self) -> ProviderKind {
        self.index = (self.index + 1) % self.kinds.len();
        self.current()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Status snapshot for one managed tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub running: bool,
    pub url: Option<String>,
    pub provider: ProviderKind,
    pub attempts: u32,
    pub transitioning: bool,
    pub health: HealthSnapshot,
}

/// Supervises one tunnel: provider lifecycle, health probing, restart and
/// ring failover. Used behind an `Arc`; the monitor task holds a clone.
pub struct TunnelSupervisor {
    name: String,
    config: SupervisorConfig,
    factory: ProviderFactory,
    ring: std::sync::Mutex<ProviderRing>,
    provider: tokio::sync::Mutex<Option<Box<dyn TunnelProvider>>>,
    probe: HealthProbe,
    url: std::sync::RwLock<Option<String>>,
    restart_attempts: AtomicU32,
    /// Serializes restart/failover: a trigger arriving while a transition is
    /// in flight is dropped, not queued.
    transitioning: AtomicBool,
    /// Set during an explicit stop so recovery paths stand down
    stopping: AtomicBool,
    event_tx: broadcast::Sender<TunnelEvent>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelSupervisor {
    pub fn new(
        spec: &TunnelSpec,
        policy: HealthCheckPolicy,
        config: SupervisorConfig,
        factory: ProviderFactory,
        event_tx: broadcast::Sender<TunnelEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name.clone(),
            config,
            factory,
            ring: std::sync::Mutex::new(ProviderRing::new(spec.providers.clone())),
            provider: tokio::sync::Mutex::new(None),
            probe: HealthProbe::new(policy),
            url: std::sync::RwLock::new(None),
            restart_attempts: AtomicU32::new(0),
            transitioning: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            event_tx,
            monitor: std::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current public URL, if the tunnel is up
    pub fn url(&self) -> Option<String> {
        self.url.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Start the tunnel with the ring's current provider. A failure here is
    /// surfaced to the caller and not auto-retried; recovery only kicks in
    /// for tunnels that came up once.
    pub async fn start(self: &Arc<Self>) -> Result<String> {
        self.stopping.store(false, Ordering::SeqCst);

        if let Some(existing) = self.url() {
            let running = {
                let provider = self.provider.lock().await;
                provider.as_ref().map(|p| p.is_running()).unwrap_or(false)
            };
            if running {
                warn!(tunnel = %self.name, url = %existing, "tunnel already running");
                return Ok(existing);
            }
        }

        let kind = self.ring().current();
        let url = self.start_provider(kind).await?;
        Ok(url)
    }

    /// Stop everything this supervisor owns. Always honored regardless of
    /// state, idempotent, and guarantees the tunnel process is terminated.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = monitor {
            handle.abort();
            // Wait for the task to wind down: an in-flight recovery drops
            // its half-started provider here, which terminates its process.
            let _ = handle.await;
        }

        self.probe.stop();

        if let Some(mut provider) = self.provider.lock().await.take() {
            if let Err(e) = provider.stop().await {
                warn!(tunnel = %self.name, error = %e, "provider stop failed");
            }
        }

        *self.url.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.restart_attempts.store(0, Ordering::SeqCst);
        self.transitioning.store(false, Ordering::SeqCst);
        debug!(tunnel = %self.name, "supervisor stopped");
    }

    pub async fn status(&self) -> TunnelStatus {
        let running = {
            let provider = self.provider.lock().await;
            provider.as_ref().map(|p| p.is_running()).unwrap_or(false)
        };
        TunnelStatus {
            running,
            url: self.url(),
            provider: self.ring().current(),
            attempts: self.restart_attempts.load(Ordering::SeqCst),
            transitioning: self.transitioning.load(Ordering::SeqCst),
            health: self.probe.snapshot(),
        }
    }

    fn ring(&self) -> std::sync::MutexGuard<'_, ProviderRing> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Build, start (bounded by the start timeout) and install a provider,
    /// then attach the probe and the monitor task.
    async fn start_provider(self: &Arc<Self>, kind: ProviderKind) -> Result<String> {
        info!(tunnel = %self.name, provider = %kind, "starting tunnel");

        let mut provider = (self.factory)(kind);
        // Subscribe before starting so an exit racing the handoff to the
        // monitor task is buffered instead of dropped.
        let exit_rx = provider.subscribe_exits();
        let start_timeout = Duration::from_millis(self.config.start_timeout_ms);
        let url = match tokio::time::timeout(start_timeout, provider.start()).await {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                let _ = provider.stop().await;
                return Err(e);
            }
            Err(_) => {
                let _ = provider.stop().await;
                return Err(TunnelError::StartTimeout {
                    provider: kind,
                    timeout_ms: self.config.start_timeout_ms,
                });
            }
        };

        let registry = provider.registry();
        let health_rx = self.probe.subscribe();

        *self.provider.lock().await = Some(provider);
        *self.url.write().unwrap_or_else(|e| e.into_inner()) = Some(url.clone());
        self.restart_attempts.store(0, Ordering::SeqCst);
        self.probe.start(url.clone(), registry);
        self.spawn_monitor(health_rx, exit_rx);

        info!(tunnel = %self.name, url = %url, "tunnel ready");
        self.emit(TunnelEvent::Ready {
            name: self.name.clone(),
            url: url.clone(),
        });
        Ok(url)
    }

    /// Watch the probe and the provider process; either a critical health
    /// escalation or an unexpected exit triggers recovery. The task ends
    /// after handing off to `recover`, which installs a fresh monitor.
    fn spawn_monitor(
        self: &Arc<Self>,
        mut health_rx: broadcast::Receiver<HealthEvent>,
        mut exit_rx: broadcast::Receiver<ProviderExit>,
    ) {
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let trigger: Option<String> = tokio::select! {
                    event = health_rx.recv() => match event {
                        Ok(HealthEvent::Critical { error }) => Some(error),
                        Ok(_) => None,
                        Err(broadcast::error::RecvError::Lagged(_)) => None,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    exit = exit_rx.recv() => match exit {
                        Ok(exit) => {
                            Some(TunnelError::UnexpectedExit { code: exit.code }.to_string())
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => None,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let Some(reason) = trigger else { continue };
                if supervisor.stopping.load(Ordering::SeqCst) {
                    break;
                }

                warn!(tunnel = %supervisor.name, reason = %reason, "tunnel is down");
                supervisor.emit(TunnelEvent::Down {
                    name: supervisor.name.clone(),
                    error: reason,
                });
                supervisor.recover().await;
                break;
            }
        });

        // Replace, don't abort: recovery runs inside the old monitor task,
        // which ends on its own right after.
        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Restart the tunnel, failing over through the provider ring. Guarded so
    /// that near-simultaneous triggers (a probe escalation racing a process
    /// exit) perform exactly one transition.
    async fn recover(self: &Arc<Self>) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if self
            .transitioning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(tunnel = %self.name, "transition already in flight, dropping trigger");
            return;
        }

        let outcome = self.recover_inner().await;
        self.transitioning.store(false, Ordering::SeqCst);

        if let Err(e) = outcome {
            error!(tunnel = %self.name, error = %e, "giving up on tunnel");
            self.emit(TunnelEvent::Error {
                context: self.name.clone(),
                error: e.to_string(),
            });
        }
    }

    async fn recover_inner(self: &Arc<Self>) -> Result<()> {
        self.probe.stop();
        if let Some(mut provider) = self.provider.lock().await.take() {
            if let Err(e) = provider.stop().await {
                warn!(tunnel = %self.name, error = %e, "provider stop failed during recovery");
            }
        }
        *self.url.write().unwrap_or_else(|e| e.into_inner()) = None;

        // Cool down before hammering a backend that just failed
        tokio::time::sleep(Duration::from_millis(self.config.cooldown_ms)).await;

        let ring_len = self.ring().len();
        let mut exhausted_slots = 0usize;
        let mut total_attempts = 0u32;

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Ok(());
            }

            let attempt = self.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_start_attempts {
                // Current ring slot is out of budget
                exhausted_slots += 1;
                if exhausted_slots >= ring_len {
                    return Err(TunnelError::ExhaustedRetries {
                        name: self.name.clone(),
                        attempts: total_attempts,
                    });
                }
                let next = self.ring().advance();
                self.restart_attempts.store(0, Ordering::SeqCst);
                info!(tunnel = %self.name, provider = %next, "failing over to next provider");
                self.emit(TunnelEvent::ProviderChanged {
                    name: self.name.clone(),
                    provider: next,
                });
                continue;
            }

            total_attempts += 1;
            let kind = self.ring().current();
            info!(
                tunnel = %self.name,
                provider = %kind,
                attempt,
                max = self.config.max_start_attempts,
                "restarting tunnel"
            );

            match self.start_provider(kind).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(tunnel = %self.name, error = %e, "restart attempt failed");
                    tokio::time::sleep(Duration::from_millis(self.config.cooldown_ms)).await;
                }
            }
        }
    }
}
