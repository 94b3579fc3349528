//! Periodic tunnel health probing
//!
//! Decides from the outside whether an advertised public URL is actually
//! serving traffic. Each cycle optionally cross-checks the provider's
//! endpoint registry, then issues a bounded-timeout request against the URL
//! itself. Any HTTP response counts as liveness evidence; only transport
//! failures, timeouts and registry mismatches count as failures.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthCheckPolicy;
use crate::provider::EndpointRegistry;

/// Events emitted by the probe, one per cycle
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// The URL responded; failure counter was reset
    Healthy,
    /// One more failed cycle
    Unhealthy { error: String, failures: u32 },
    /// Consecutive failures reached the threshold. Re-emitted on every
    /// cycle at or above the threshold; subscribers must be idempotent.
    Critical { error: String },
}

/// Point-in-time view of a probe's state
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub failure_count: u32,
    pub last_success_at: DateTime<Utc>,
    pub time_since_last_success_ms: u64,
}

/// Periodic reachability prober for one tunnel URL
pub struct HealthProbe {
    policy: HealthCheckPolicy,
    client: reqwest::Client,
    failure_count: Arc<AtomicU32>,
    last_success: Arc<std::sync::RwLock<DateTime<Utc>>>,
    event_tx: broadcast::Sender<HealthEvent>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HealthProbe {
    pub fn new(policy: HealthCheckPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            policy,
            client: reqwest::Client::new(),
            failure_count: Arc::new(AtomicU32::new(0)),
            last_success: Arc::new(std::sync::RwLock::new(Utc::now())),
            event_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Subscribe to probe events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Begin probing a URL. Idempotent: calling while already running
    /// cancels the previous timer and starts fresh against the new URL.
    /// No-op when the policy is disabled.
    pub fn start(&self, url: String, registry: Option<Arc<dyn EndpointRegistry>>) {
        if !self.policy.enabled {
            return;
        }

        self.stop();
        self.failure_count.store(0, Ordering::SeqCst);
        *self
            .last_success
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Utc::now();

        debug!(url = %url, interval_ms = self.policy.interval_ms, "health probe started");

        let policy = self.policy.clone();
        let client = self.client.clone();
        let failure_count = Arc::clone(&self.failure_count);
        let last_success = Arc::clone(&self.last_success);
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(policy.interval_ms));
            // Cycles must never overlap: the next one is only scheduled
            // after the current one completes.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                match run_cycle(&client, &url, registry.as_deref(), policy.timeout_ms).await {
                    Ok(()) => {
                        let previous = failure_count.swap(0, Ordering::SeqCst);
                        if previous > 0 {
                            info!(url = %url, "health probe recovered after {previous} failures");
                        }
                        *last_success.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
                        let _ = event_tx.send(HealthEvent::Healthy);
                    }
                    Err(error) => {
                        let failures = failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(url = %url, failures, error = %error, "health probe cycle failed");
                        let _ = event_tx.send(HealthEvent::Unhealthy {
                            error: error.clone(),
                            failures,
                        });
                        if failures >= policy.max_consecutive_failures {
                            let _ = event_tx.send(HealthEvent::Critical { error });
                        }
                    }
                }
            }
        });

        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        *task = Some(handle);
    }

    /// Cancel the probe timer. Safe to call when not running.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            debug!("health probe stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let failures = self.failure_count.load(Ordering::SeqCst);
        let last = *self
            .last_success
            .read()
            .unwrap_or_else(|e| e.into_inner());
        HealthSnapshot {
            healthy: failures < self.policy.max_consecutive_failures,
            failure_count: failures,
            last_success_at: last,
            time_since_last_success_ms: (Utc::now() - last).num_milliseconds().max(0) as u64,
        }
    }
}

impl Drop for HealthProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One probe cycle. Never panics; every failure is folded into the
/// returned error string.
async fn run_cycle(
    client: &reqwest::Client,
    url: &str,
    registry: Option<&dyn EndpointRegistry>,
    timeout_ms: u64,
) -> std::result::Result<(), String> {
    if let Some(registry) = registry {
        match registry.active_endpoints().await {
            Ok(endpoints) => {
                if !endpoints.iter().any(|e| e.public_url == url) {
                    return Err(format!("{url} is no longer registered with the provider"));
                }
            }
            Err(e) => return Err(format!("registry check failed: {e}")),
        }
    }

    match client
        .get(url)
        .timeout(Duration::from_millis(timeout_ms))
        .send()
        .await
    {
        // Any response, 4xx and 5xx included, proves the tunnel is forwarding
        Ok(response) => {
            debug!(url = %url, status = %response.status(), "probe response");
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}
