// Stage 3: hand compressed batches to the external broker
use super::broker::Broker;
use super::{Stage, StageContext};
use crate::errors::DaqError;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(10);
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_secs(1);

pub struct PublishStage<B: Broker> {
    input: mpsc::Receiver<Bytes>,
    broker: B,
    topic: String,
    connected: bool,
}

impl<B: Broker> PublishStage<B> {
    pub fn new(input: mpsc::Receiver<Bytes>, broker: B, topic: impl Into<String>) -> Self {
        Self { input, broker, topic: topic.into(), connected: false }
    }

    async fn publish(&mut self, payload: Bytes) -> Result<usize, DaqError> {
        if !self.connected {
            self.broker.connect().await?;
            self.connected = true;
        }
        let size = payload.len();
        self.broker.publish(&self.topic, payload).await?;
        Ok(size)
    }
}

#[async_trait]
impl<B: Broker> Stage for PublishStage<B> {
    fn name(&self) -> &'static str {
        "publish"
    }

    async fn run(&mut self, ctx: &StageContext) {
        if !self.connected {
            // an unreachable broker is retried lazily on the first item
            match self.broker.connect().await {
                Ok(()) => self.connected = true,
                Err(e) => error!(error = %e, "broker connect failed"),
            }
        }

        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                next = time::timeout(POLL, self.input.recv()) => next,
            };
            let payload = match next {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(_elapsed) => continue,
            };

            let pause = match self.publish(payload).await {
                Ok(size) => {
                    debug!(topic = %self.topic, size, "batch published");
                    ctx.param_secs("throttle_delay", DEFAULT_THROTTLE)
                }
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "publish failed, dropping batch");
                    ctx.param_secs("backoff", DEFAULT_BACKOFF)
                }
            };
            if !ctx.pause(pause).await {
                break;
            }
        }

        if self.connected {
            self.broker.close().await;
            self.connected = false;
        }
        info!("publisher disconnected");
    }
}
