//! localhost.run tunnel backend
//!
//! Opens an ssh reverse tunnel against ssh.localhost.run and scrapes the
//! assigned public URL from the session output. No control API, so this
//! backend offers no registry cross-check.

use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::error::{Result, TunnelError};
use crate::provider::{ManagedChild, ProviderExit, ProviderKind, TunnelProvider};

/// Assigned URLs look like https://<id>.lhr.life (or the older .lhr.run)
const URL_PATTERN: &str = r"https?://[A-Za-z0-9-]+\.lhr\.(life|run)";

pub struct LocalhostRunProvider {
    port: u16,
    start_timeout: Duration,
    url_re: Regex,
    child: ManagedChild,
    current_url: Option<String>,
}

impl LocalhostRunProvider {
    pub fn new(port: u16, start_timeout: Duration) -> Self {
        Self {
            port,
            start_timeout,
            url_re: Regex::new(URL_PATTERN).expect("static pattern compiles"),
            child: ManagedChild::new(),
            current_url: None,
        }
    }

    fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "localhost_run", "{line}");
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl TunnelProvider for LocalhostRunProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalhostRun
    }

    async fn start(&mut self) -> Result<String> {
        let args = vec![
            "-R".to_string(),
            format!("80:localhost:{}", self.port),
            "ssh.localhost.run".to_string(),
            "-T".to_string(),
            "-n".to_string(),
        ];
        debug!(?args, "spawning ssh for localhost.run");

        let mut child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Start {
                provider: ProviderKind::LocalhostRun,
                reason: format!("failed to spawn ssh: {e}"),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut exit_rx = self.child.subscribe_exits();
        self.child.adopt(child).await;

        // The URL can land on either stream
        let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
        if let Some(stdout) = stdout {
            Self::spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = stderr {
            Self::spawn_line_reader(stderr, line_tx.clone());
        }
        drop(line_tx);

        let timeout = tokio::time::sleep(self.start_timeout);
        tokio::pin!(timeout);
        let mut streams_open = true;

        loop {
            tokio::select! {
                line = line_rx.recv(), if streams_open => match line {
                    Some(line) => {
                        if let Some(m) = self.url_re.find(&line) {
                            let url = m.as_str().to_string();
                            info!(url = %url, "localhost.run tunnel ready");
                            self.current_url = Some(url.clone());
                            return Ok(url);
                        }
                    }
                    None => streams_open = false,
                },
                exit = exit_rx.recv() => {
                    let code = exit.ok().and_then(|e| e.code);
                    return Err(TunnelError::Start {
                        provider: ProviderKind::LocalhostRun,
                        reason: format!("ssh exited with code {code:?} before providing a URL"),
                    });
                }
                _ = &mut timeout => {
                    let _ = self.child.stop().await;
                    return Err(TunnelError::StartTimeout {
                        provider: ProviderKind::LocalhostRun,
                        timeout_ms: self.start_timeout.as_millis() as u64,
                    });
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
}
