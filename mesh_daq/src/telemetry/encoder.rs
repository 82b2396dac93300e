// Stage 1: structured record -> compact MessagePack bytes
use super::{Stage, StageContext};
use crate::errors::DaqError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub fn encode(record: &Map<String, Value>) -> Result<Vec<u8>, DaqError> {
    rmp_serde::to_vec_named(record).map_err(|e| DaqError::Compression(format!("encode: {e}")))
}

pub struct EncodeStage {
    input: mpsc::Receiver<Value>,
    output: mpsc::Sender<Vec<u8>>,
}

impl EncodeStage {
    pub fn new(input: mpsc::Receiver<Value>, output: mpsc::Sender<Vec<u8>>) -> Self {
        Self { input, output }
    }
}

#[async_trait]
impl Stage for EncodeStage {
    fn name(&self) -> &'static str {
        "encode"
    }

    async fn run(&mut self, ctx: &StageContext) {
        loop {
            let item = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                next = self.input.recv() => match next {
                    Some(v) => v,
                    None => break,
                },
            };

            let Value::Object(record) = item else {
                warn!(value = %item, "dropping non-mapping record");
                continue;
            };

            let bytes = match encode(&record) {
                Ok(b) => b,
                Err(e) => {
                    error!(error = %e, "encode failed");
                    continue;
                }
            };
            debug!(size = bytes.len(), "record encoded");

            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                res = self.output.send(bytes) => if res.is_err() {
                    warn!("batch queue closed");
                    break;
                },
            }
        }
    }
}
