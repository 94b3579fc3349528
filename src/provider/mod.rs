//! Tunnel provider abstraction
//!
//! A provider wraps one external tunnel-creation mechanism (an ngrok child
//! process, an ssh session against localhost.run) behind a narrow contract:
//! start it to get a public URL, stop it, and get notified when its process
//! dies outside of an explicit stop.

pub mod localhost_run;
pub mod ngrok;

pub use localhost_run::LocalhostRunProvider;
pub use ngrok::NgrokProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ProviderOptions;
use crate::error::{Result, TunnelError};

/// Supported tunnel backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ngrok,
    LocalhostRun,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ngrok => "ngrok",
            Self::LocalhostRun => "localhost_run",
        }
    }

    pub fn all() -> &'static [ProviderKind] {
        &[Self::Ngrok, Self::LocalhostRun]
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ngrok" => Ok(Self::Ngrok),
            "localhost_run" | "localhost.run" | "lhr" => Ok(Self::LocalhostRun),
            _ => Err("invalid provider; expected ngrok|localhost_run"),
        }
    }
}

pub fn parse_provider_kind(raw: &str) -> Result<ProviderKind> {
    ProviderKind::from_str(raw).map_err(|e| TunnelError::Validation(e.to_string()))
}

/// Notification that a provider's underlying process terminated outside `stop()`
#[derive(Debug, Clone)]
pub struct ProviderExit {
    pub code: Option<i32>,
}

/// One active public endpoint as reported by a provider's control surface
#[derive(Debug, Clone)]
pub struct ActiveEndpoint {
    pub public_url: String,
    pub local_addr: String,
}

/// Listing of currently active public endpoints, used by the health probe to
/// cross-check that a URL is still registered with its backend.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    async fn active_endpoints(&self) -> Result<Vec<ActiveEndpoint>>;
}

/// Contract every tunnel backend implements.
///
/// Exactly one public URL is active per provider instance at a time.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Establish the tunnel and resolve to its public URL.
    async fn start(&mut self) -> Result<String>;

    /// Tear the tunnel down. Idempotent; resolves once the underlying
    /// process is fully terminated.
    async fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Receiver for unexpected process-exit notifications.
    fn subscribe_exits(&self) -> broadcast::Receiver<ProviderExit>;

    /// Control surface for the registry cross-check, when the backend has one.
    fn registry(&self) -> Option<Arc<dyn EndpointRegistry>> {
        None
    }
}

/// Build the concrete backend for a provider kind.
pub fn build_provider(
    kind: ProviderKind,
    port: u16,
    options: &ProviderOptions,
    start_timeout: Duration,
) -> Box<dyn TunnelProvider> {
    match kind {
        ProviderKind::Ngrok => Box::new(NgrokProvider::new(port, options.clone(), start_timeout)),
        ProviderKind::LocalhostRun => Box::new(LocalhostRunProvider::new(port, start_timeout)),
    }
}

/// Grace window between SIGTERM and SIGKILL when stopping a tunnel process
const STOP_GRACE: Duration = Duration::from_secs(5);
/// How often the exit watcher polls the child
const EXIT_POLL: Duration = Duration::from_millis(250);

/// Shared child-process plumbing for process-backed providers: exit watching,
/// unexpected-exit broadcast, and graceful SIGTERM-then-SIGKILL stop.
pub(crate) struct ManagedChild {
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    exit_tx: broadcast::Sender<ProviderExit>,
    running: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ManagedChild {
    pub fn new() -> Self {
        let (exit_tx, _) = broadcast::channel(8);
        Self {
            child: Arc::new(tokio::sync::Mutex::new(None)),
            exit_tx,
            running: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            watcher: std::sync::Mutex::new(None),
        }
    }

    pub fn subscribe_exits(&self) -> broadcast::Receiver<ProviderExit> {
        self.exit_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Adopt a freshly spawned child and watch it for unexpected exits.
    /// Callers spawn with `kill_on_drop` so that dropping this struct,
    /// even mid-start, still terminates the process.
    pub async fn adopt(&self, child: Child) {
        self.stopping.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        *self.child.lock().await = Some(child);

        let child = Arc::clone(&self.child);
        let exit_tx = self.exit_tx.clone();
        let running = Arc::clone(&self.running);
        let stopping = Arc::clone(&self.stopping);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXIT_POLL).await;
                let mut guard = child.lock().await;
                let Some(proc) = guard.as_mut() else { break };
                match proc.try_wait() {
                    Ok(Some(status)) => {
                        *guard = None;
                        drop(guard);
                        running.store(false, Ordering::SeqCst);
                        if !stopping.load(Ordering::SeqCst) {
                            warn!(?status, "tunnel process exited unexpectedly");
                            let _ = exit_tx.send(ProviderExit {
                                code: status.code(),
                            });
                        }
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to poll tunnel process");
                        break;
                    }
                }
            }
        });

        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = watcher.replace(handle) {
            old.abort();
        }
    }

    /// Terminate the child: graceful signal first, forced kill after the
    /// grace window. Safe to call when no child is running.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);

        let mut guard = self.child.lock().await;
        let Some(proc) = guard.as_mut() else {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        };

        #[cfg(unix)]
        if let Some(pid) = proc.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed, process may already be gone");
            }
        }
        #[cfg(not(unix))]
        proc.start_kill()?;

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        loop {
            if proc.try_wait()?.is_some() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("tunnel process ignored graceful stop, killing it");
                proc.start_kill()?;
                proc.wait().await?;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *guard = None;
        drop(guard);
        self.running.store(false, Ordering::SeqCst);

        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        // The watcher holds the last clone of the child handle; aborting it
        // lets the kill_on_drop child drop and terminate.
        if let Some(handle) = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_display() {
        assert_eq!(ProviderKind::Ngrok.to_string(), "ngrok");
        assert_eq!(ProviderKind::LocalhostRun.to_string(), "localhost_run");
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(
            "ngrok".parse::<ProviderKind>().unwrap(),
            ProviderKind::Ngrok
        );
        assert_eq!(
            "localhost.run".parse::<ProviderKind>().unwrap(),
            ProviderKind::LocalhostRun
        );
        assert_eq!(
            " LHR ".parse::<ProviderKind>().unwrap(),
            ProviderKind::LocalhostRun
        );
        assert!("serveo".parse::<ProviderKind>().is_err());
        assert!(parse_provider_kind("serveo").is_err());
    }

    #[tokio::test]
    async fn test_managed_child_stop_without_child() {
        let child = ManagedChild::new();
        assert!(!child.is_running());
        // Stop with nothing running never errors
        child.stop().await.unwrap();
        child.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_managed_child_unexpected_exit_broadcast() {
        use tokio::process::Command;

        let managed = ManagedChild::new();
        let mut exits = managed.subscribe_exits();
        let child = Command::new("true").spawn().unwrap();
        managed.adopt(child).await;

        let exit = tokio::time::timeout(Duration::from_secs(2), exits.recv())
            .await
            .expect("exit watcher should notice the process dying")
            .unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(!managed.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_managed_child_kills_the_process() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        use tokio::process::Command;

        let managed = ManagedChild::new();
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);
        managed.adopt(child).await;
        drop(managed);

        // The runtime kills and reaps the child in the background
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while kill(pid, None).is_ok() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "process outlived its ManagedChild"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_managed_child_stop_suppresses_exit_event() {
        use tokio::process::Command;

        let managed = ManagedChild::new();
        let mut exits = managed.subscribe_exits();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        managed.adopt(child).await;
        assert!(managed.is_running());

        managed.stop().await.unwrap();
        assert!(!managed.is_running());

        // An explicit stop must not look like an unexpected exit
        let got = tokio::time::timeout(Duration::from_millis(600), exits.recv()).await;
        assert!(got.is_err(), "no exit event expected after explicit stop");
    }
}
