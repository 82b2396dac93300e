//! Ingestion pipeline: encode -> batch/compress -> publish.
//!
//! Each stage is a long-running task owned by a [`StageHandle`]. The handle
//! starts and stops the task, and carries a live parameter map the task reads
//! on every iteration.

pub mod batcher;
pub mod broker;
pub mod encoder;
pub mod pitcher;
pub mod record;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub type StageParams = HashMap<String, Value>;

/// What a running stage sees: its cancellation signal and current params.
pub struct StageContext {
    pub cancel: CancellationToken,
    params: watch::Receiver<StageParams>,
}

impl StageContext {
    pub fn new(cancel: CancellationToken, params: watch::Receiver<StageParams>) -> Self {
        Self { cancel, params }
    }

    pub fn param(&self, key: &str) -> Option<Value> {
        self.params.borrow().get(key).cloned()
    }

    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.param(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    /// Seconds-valued param; negative or non-numeric values fall back to `default`.
    pub fn param_secs(&self, key: &str, default: Duration) -> Duration {
        self.param(key)
            .and_then(|v| v.as_f64())
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(default)
    }

    /// Sleep unless cancelled first. Returns false when cancelled.
    pub async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}

#[async_trait]
pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;

    /// Runs until `ctx.cancel` fires or the input queue closes.
    async fn run(&mut self, ctx: &StageContext);
}

enum Slot<S> {
    Idle(S),
    Running { task: JoinHandle<S>, cancel: CancellationToken },
    Lost,
}

pub struct StageHandle<S: Stage> {
    name: &'static str,
    slot: Slot<S>,
    params: watch::Sender<StageParams>,
}

impl<S: Stage> StageHandle<S> {
    pub fn new(stage: S) -> Self {
        let (params, _) = watch::channel(StageParams::new());
        Self {
            name: stage.name(),
            slot: Slot::Idle(stage),
            params,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.params.send_modify(|p| {
            p.insert(key.to_string(), value);
        });
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.params.borrow().get(key).cloned()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.slot, Slot::Running { .. })
    }

    /// Spawn the run loop. A second call while running is a no-op.
    pub fn start(&mut self) {
        self.slot = match std::mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Idle(mut stage) => {
                let cancel = CancellationToken::new();
                let ctx = StageContext::new(cancel.clone(), self.params.subscribe());
                let task = tokio::spawn(async move {
                    stage.run(&ctx).await;
                    stage
                });
                info!(stage = self.name, "stage started");
                Slot::Running { task, cancel }
            }
            other => other,
        };
    }

    /// Cancel the run loop and wait for it to finish.
    pub async fn stop(&mut self) {
        self.slot = match std::mem::replace(&mut self.slot, Slot::Lost) {
            Slot::Running { task, cancel } => {
                cancel.cancel();
                match task.await {
                    Ok(stage) => {
                        info!(stage = self.name, "stage stopped");
                        Slot::Idle(stage)
                    }
                    Err(e) => {
                        error!(stage = self.name, error = %e, "stage task failed");
                        Slot::Lost
                    }
                }
            }
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        async fn run(&mut self, ctx: &StageContext) {
            let every = ctx.param_secs("every", Duration::from_secs(1));
            while ctx.pause(every).await {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_recovers_the_stage() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut h = StageHandle::new(Ticker { ticks: ticks.clone() });
        h.set("every", 0.5);
        assert_eq!(h.get("every"), Some(Value::from(0.5)));

        h.start();
        h.start();
        assert!(h.is_running());
        tokio::time::sleep(Duration::from_millis(1250)).await;
        h.stop().await;
        assert!(!h.is_running());
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        // restartable after stop
        h.start();
        assert!(h.is_running());
        h.stop().await;
    }

    #[tokio::test]
    async fn stop_on_idle_stage_is_a_no_op() {
        let mut h = StageHandle::new(Ticker { ticks: Arc::default() });
        h.stop().await;
        assert!(!h.is_running());
    }
}
