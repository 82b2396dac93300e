// Stage 2: accumulate encoded records, flush as one bzip2 container
use super::{Stage, StageContext};
use crate::errors::DaqError;
use async_trait::async_trait;
use bytes::Bytes;
use bzip2::{Compression, read::BzDecoder, write::BzEncoder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info};

/// Used when the handle carries no `batch_on` / `batch_at`.
pub const DEFAULT_BATCH_ON: u64 = 500;
pub const DEFAULT_BATCH_AT: Duration = Duration::from_secs(60);

/// How long one receive waits before the time trigger is re-checked.
const POLL: Duration = Duration::from_secs(1);

/// What goes over the wire once decompressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchContainer {
    pub cache: Vec<ByteBuf>,
    /// Unix seconds of the previous flush.
    pub last_processed: f64,
}

pub fn compress(container: &BatchContainer) -> Result<Vec<u8>, DaqError> {
    let packed = rmp_serde::to_vec_named(container).map_err(|e| DaqError::Compression(format!("pack: {e}")))?;
    let mut enc = BzEncoder::new(Vec::with_capacity(packed.len() / 2), Compression::default());
    enc.write_all(&packed)?;
    Ok(enc.finish()?)
}

pub fn decompress(bytes: &[u8]) -> Result<BatchContainer, DaqError> {
    let mut packed = Vec::new();
    BzDecoder::new(bytes).read_to_end(&mut packed)?;
    rmp_serde::from_slice(&packed).map_err(|e| DaqError::Compression(format!("unpack: {e}")))
}

struct Pending {
    cache: Vec<Vec<u8>>,
    since: Instant,
    last_processed: f64,
}

impl Pending {
    fn fresh() -> Self {
        Self {
            cache: Vec::new(),
            since: Instant::now(),
            last_processed: Utc::now().timestamp_micros() as f64 / 1e6,
        }
    }

    fn due(&self, batch_on: u64, batch_at: Duration) -> Option<&'static str> {
        if self.cache.is_empty() {
            return None;
        }
        if self.cache.len() as u64 >= batch_on {
            Some("count")
        } else if self.since.elapsed() >= batch_at {
            Some("age")
        } else {
            None
        }
    }

    fn take(&mut self) -> BatchContainer {
        let done = std::mem::replace(self, Pending::fresh());
        BatchContainer {
            cache: done.cache.into_iter().map(ByteBuf::from).collect(),
            last_processed: done.last_processed,
        }
    }
}

pub struct BatchStage {
    input: mpsc::Receiver<Vec<u8>>,
    output: mpsc::Sender<Bytes>,
}

impl BatchStage {
    pub fn new(input: mpsc::Receiver<Vec<u8>>, output: mpsc::Sender<Bytes>) -> Self {
        Self { input, output }
    }

    /// Compress and hand off. False once the publish queue is gone or we are cancelled.
    async fn flush(&self, pending: &mut Pending, reason: &str, ctx: &StageContext) -> bool {
        let container = pending.take();
        let records = container.cache.len();
        let bytes = match compress(&container) {
            Ok(b) => b,
            Err(e) => {
                // the batch is dropped; state is already reset
                error!(records, error = %e, "batch compression failed");
                return true;
            }
        };
        info!(records, size = bytes.len(), reason, "batch compressed");

        tokio::select! {
            _ = ctx.cancel.cancelled() => false,
            res = self.output.send(Bytes::from(bytes)) => res.is_ok(),
        }
    }
}

#[async_trait]
impl Stage for BatchStage {
    fn name(&self) -> &'static str {
        "compress"
    }

    async fn run(&mut self, ctx: &StageContext) {
        let mut pending = Pending::fresh();
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                next = time::timeout(POLL, self.input.recv()) => next,
            };
            match next {
                Ok(Some(item)) => pending.cache.push(item),
                Ok(None) => {
                    debug!("encode queue closed");
                    if !pending.cache.is_empty() {
                        self.flush(&mut pending, "drain", ctx).await;
                    }
                    break;
                }
                Err(_elapsed) => {}
            }

            let batch_on = ctx.param_u64("batch_on", DEFAULT_BATCH_ON);
            let batch_at = ctx.param_secs("batch_at", DEFAULT_BATCH_AT);
            if let Some(reason) = pending.due(batch_on, batch_at) {
                if !self.flush(&mut pending, reason, ctx).await {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StageHandle;

    fn handle(batch_on: u64, batch_at: f64) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Bytes>, StageHandle<BatchStage>) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let h = StageHandle::new(BatchStage::new(in_rx, out_tx));
        h.set("batch_on", batch_on);
        h.set("batch_at", batch_at);
        (in_tx, out_rx, h)
    }

    #[test]
    fn container_survives_compression() {
        let c = BatchContainer {
            cache: vec![ByteBuf::from(b"one".to_vec()), ByteBuf::from(b"two".to_vec())],
            last_processed: 1_700_000_000.5,
        };
        assert_eq!(decompress(&compress(&c).unwrap()).unwrap(), c);
    }

    #[tokio::test(start_paused = true)]
    async fn count_trigger_flushes_exactly_batch_on_items() {
        let (tx, mut rx, mut h) = handle(4, 60.0);
        h.start();
        for i in 0..5u8 {
            tx.send(vec![i]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let batch = decompress(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(batch.cache.len(), 4);
        assert_eq!(&batch.cache[3][..], &[3u8][..]);
        // fifth item is still waiting for either trigger
        assert!(rx.try_recv().is_err());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn age_trigger_flushes_a_partial_batch() {
        let (tx, mut rx, mut h) = handle(4, 0.5);
        h.start();
        tx.send(b"lonely".to_vec()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let batch = decompress(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(batch.cache.len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cache_never_flushes() {
        let (_tx, mut rx, mut h) = handle(1, 0.1);
        h.start();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        h.stop().await;
    }

    #[test]
    fn defaults_apply_when_params_are_unset() {
        let (_, params) = tokio::sync::watch::channel(Default::default());
        let ctx = StageContext::new(tokio_util::sync::CancellationToken::new(), params);
        assert_eq!(ctx.param_u64("batch_on", DEFAULT_BATCH_ON), 500);
        assert_eq!(ctx.param_secs("batch_at", DEFAULT_BATCH_AT), Duration::from_secs(60));
    }
}
