#![allow(dead_code)]

//! Shared test harness: scripted tunnel providers with observable call
//! counts, plus event helpers.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tunnelkeeper::error::{Result, TunnelError};
use tunnelkeeper::provider::{ProviderExit, ProviderKind, TunnelProvider};
use tunnelkeeper::supervisor::TunnelEvent;

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Up(String),
    Fail(String),
}

/// Shared script for every provider instance a factory hands out: start
/// outcomes are consumed from a queue, then the fallback repeats forever.
pub struct ProviderPlan {
    kind: ProviderKind,
    outcomes: Mutex<VecDeque<StartOutcome>>,
    fallback: StartOutcome,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    running: AtomicBool,
    exit_tx: broadcast::Sender<ProviderExit>,
}

impl ProviderPlan {
    pub fn new(kind: ProviderKind, outcomes: Vec<StartOutcome>, fallback: StartOutcome) -> Arc<Self> {
        let (exit_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            kind,
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            running: AtomicBool::new(false),
            exit_tx,
        })
    }

    /// Every start succeeds with the given URL
    pub fn always_up(kind: ProviderKind, url: &str) -> Arc<Self> {
        Self::new(kind, vec![], StartOutcome::Up(url.to_string()))
    }

    /// Every start fails
    pub fn always_failing(kind: ProviderKind) -> Arc<Self> {
        Self::new(kind, vec![], StartOutcome::Fail("backend rejected".to_string()))
    }

    /// First start succeeds, every later one fails
    pub fn up_once_then_failing(kind: ProviderKind, url: &str) -> Arc<Self> {
        Self::new(
            kind,
            vec![StartOutcome::Up(url.to_string())],
            StartOutcome::Fail("backend rejected".to_string()),
        )
    }

    pub fn provider(self: &Arc<Self>) -> Box<dyn TunnelProvider> {
        Box::new(ScriptedProvider {
            plan: Arc::clone(self),
        })
    }

    /// Simulate the tunnel process dying outside an explicit stop
    pub fn send_exit(&self, code: Option<i32>) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.exit_tx.send(ProviderExit { code });
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct ScriptedProvider {
    plan: Arc<ProviderPlan>,
}

#[async_trait]
impl TunnelProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.plan.kind
    }

    async fn start(&mut self) -> Result<String> {
        self.plan.start_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .plan
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.plan.fallback.clone());
        match outcome {
            StartOutcome::Up(url) => {
                self.plan.running.store(true, Ordering::SeqCst);
                Ok(url)
            }
            StartOutcome::Fail(reason) => Err(TunnelError::Start {
                provider: self.plan.kind,
                reason,
            }),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.plan.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.plan.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.plan.is_running()
    }

    fn subscribe_exits(&self) -> broadcast::Receiver<ProviderExit> {
        self.plan.exit_tx.subscribe()
    }
}

/// Receive events until one matches, failing the test after the timeout.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<TunnelEvent>,
    timeout: Duration,
    matches: impl Fn(&TunnelEvent) -> bool,
) -> TunnelEvent {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for tunnel event");
        let event = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for tunnel event")
            .expect("event channel closed");
        if matches(&event) {
            return event;
        }
    }
}
