use super::framing::MiCodec;
use super::{GatewayFrame, Inbound};
use crate::errors::DaqError;
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use mesh_protocol::{Message, MessageKind};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long one outbound frame may sit blocked on a device that is not reading.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn serve_stream(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    outbound: broadcast::Sender<Bytes>,
    tasks: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => match res {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    super::pause_after_error().await;
                    continue;
                }
            },
        };

        info!(%peer, "device connected");
        let inbound = inbound.clone();
        let outbound = outbound.subscribe();
        let cancel = cancel.child_token();
        tasks.spawn(async move {
            let (rd, wr) = stream.into_split();
            match handle_connection(peer.to_string(), rd, wr, inbound, outbound, cancel).await {
                Ok(()) => info!(%peer, "device disconnected"),
                Err(e) => warn!(%peer, error = %e, "connection closed with error"),
            }
        });
    }
    debug!("stream listener stopped");
}

/// Pump one device connection: frames in go to `inbound`, frames broadcast
/// on `outbound` are written back out.
pub async fn handle_connection<R, W>(
    source: String,
    rd: R,
    wr: W,
    inbound: mpsc::Sender<Inbound>,
    mut outbound: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<(), DaqError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(rd, MiCodec);
    let mut sink = FramedWrite::new(wr, MiCodec);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = frames.next() => {
                let Some(frame) = next else { return Ok(()) };
                let frame = frame?;
                let received_at = Utc::now();

                // decode here only to reject garbage early; the orchestrator re-parses
                if let Err(e) = Message::decode(MessageKind::MeshIndication, frame.length, &frame.payload, received_at) {
                    warn!(%source, error = %e, "dropping undecodable frame");
                    continue;
                }

                let item = Inbound::Frame(GatewayFrame {
                    source: source.clone(),
                    kind: MessageKind::MeshIndication,
                    length: frame.length,
                    raw: frame.payload,
                    received_at,
                });
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = inbound.send(item) => if res.is_err() {
                        debug!(%source, "inbound queue closed");
                        return Ok(());
                    },
                }
            }
            out = outbound.recv() => match out {
                Ok(payload) => tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    res = timeout(WRITE_TIMEOUT, sink.send(payload)) => match res {
                        Ok(sent) => sent?,
                        Err(_) => {
                            // a half-written frame leaves the stream unusable
                            warn!(%source, "device stopped reading, closing connection");
                            return Ok(());
                        }
                    },
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(%source, skipped = n, "outbound frames lagged"),
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}
