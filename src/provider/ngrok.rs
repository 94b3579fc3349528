//! ngrok tunnel backend
//!
//! Spawns the `ngrok` binary and polls its local control API until the https
//! tunnel appears. The control API doubles as the endpoint registry the
//! health probe cross-checks against.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::ProviderOptions;
use crate::error::{Result, TunnelError};
use crate::provider::{
    ActiveEndpoint, EndpointRegistry, ManagedChild, ProviderExit, ProviderKind, TunnelProvider,
};

/// Default address of the local ngrok control API
pub const NGROK_API_URL: &str = "http://127.0.0.1:4040";

/// How often the control API is polled while waiting for the tunnel
const API_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Deserialize)]
struct TunnelsResponse {
    tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TunnelEntry {
    public_url: String,
    proto: String,
    config: TunnelEntryConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct TunnelEntryConfig {
    addr: String,
}

/// Client for the local ngrok control API
pub struct NgrokApi {
    client: reqwest::Client,
    base_url: String,
}

impl NgrokApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn tunnels(&self) -> Result<Vec<TunnelEntry>> {
        let response = self
            .client
            .get(format!("{}/api/tunnels", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await?
            .error_for_status()?;
        let body: TunnelsResponse = response.json().await?;
        Ok(body.tunnels)
    }
}

#[async_trait]
impl EndpointRegistry for NgrokApi {
    async fn active_endpoints(&self) -> Result<Vec<ActiveEndpoint>> {
        Ok(self
            .tunnels()
            .await?
            .into_iter()
            .map(|t| ActiveEndpoint {
                public_url: t.public_url,
                local_addr: t.config.addr,
            })
            .collect())
    }
}

pub struct NgrokProvider {
    port: u16,
    options: ProviderOptions,
    start_timeout: Duration,
    api: Arc<NgrokApi>,
    child: ManagedChild,
    current_url: Option<String>,
}

impl NgrokProvider {
    pub fn new(port: u16, options: ProviderOptions, start_timeout: Duration) -> Self {
        Self {
            port,
            options,
            start_timeout,
            api: Arc::new(NgrokApi::new(NGROK_API_URL)),
            child: ManagedChild::new(),
            current_url: None,
        }
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        match &self.options.command {
            Some(command) => args.extend(command.split_whitespace().map(String::from)),
            None => {
                args.push("http".to_string());
                args.push(self.port.to_string());
            }
        }

        if let Some(region) = &self.options.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        if let Some(subdomain) = &self.options.subdomain {
            args.push("--subdomain".to_string());
            args.push(subdomain.clone());
        }
        if let Some(auth) = &self.options.auth {
            args.push("--auth".to_string());
            args.push(auth.clone());
        }

        args
    }

    fn start_error(&self, reason: impl Into<String>) -> TunnelError {
        TunnelError::Start {
            provider: ProviderKind::Ngrok,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TunnelProvider for NgrokProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ngrok
    }

    async fn start(&mut self) -> Result<String> {
        let args = self.build_args();
        debug!(?args, "spawning ngrok");

        let mut child = Command::new("ngrok")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.start_error(format!("failed to spawn ngrok: {e}")))?;

        let stderr = child.stderr.take();
        let mut exit_rx = self.child.subscribe_exits();
        self.child.adopt(child).await;

        // ngrok reports fatal start problems on stderr before exiting
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "ngrok", "{line}");
                    if line.contains("failed to start tunnel") {
                        let _ = fatal_tx.send(line).await;
                    }
                }
            });
        }

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        let mut poll = tokio::time::interval(API_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.api.tunnels().await {
                        Ok(tunnels) => {
                            if let Some(tunnel) = tunnels.iter().find(|t| t.proto == "https") {
                                info!(url = %tunnel.public_url, "ngrok tunnel ready");
                                self.current_url = Some(tunnel.public_url.clone());
                                return Ok(tunnel.public_url.clone());
                            }
                        }
                        // API comes up slightly after the process; keep polling
                        Err(e) => debug!(error = %e, "ngrok control API not ready yet"),
                    }
                    if tokio::time::Instant::now() >= deadline {
                        let _ = self.child.stop().await;
                        return Err(TunnelError::StartTimeout {
                            provider: ProviderKind::Ngrok,
                            timeout_ms: self.start_timeout.as_millis() as u64,
                        });
                    }
                }
                Some(line) = fatal_rx.recv() => {
                    let _ = self.child.stop().await;
                    return Err(self.start_error(line));
                }
                exit = exit_rx.recv() => {
                    let code = exit.ok().and_then(|e| e.code);
                    return Err(self.start_error(format!(
                        "ngrok exited with code {code:?} before the tunnel came up"
                    )));
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.current_url = None;
        self.child.stop().await
    }

    fn is_running(&self) -> bool {
        self.child.is_running()
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ProviderExit> {
        self.child.subscribe_exits()
    }

    fn registry(&self) -> Option<Arc<dyn EndpointRegistry>> {
        Some(Arc::clone(&self.api) as Arc<dyn EndpointRegistry>)
    }
}
