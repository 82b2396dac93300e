//! Gateway: the device-facing stream listener plus the discovery responder.
//!
//! Every connection decodes MI frames onto the shared inbound queue and
//! writes back whatever is broadcast on the outbound channel.

pub mod framing;
pub mod tcp;
pub mod udp;

use crate::config::GatewayConfig;
use crate::errors::DaqError;
use bytes::Bytes;
use mesh_protocol::{MessageKind, Timestamp};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::commands::CommandRequest;

const OUTBOUND_CAPACITY: usize = 64;
const ERROR_RETRY: Duration = Duration::from_millis(100);

/// Hold off after a socket error so a persistent one cannot spin the loop.
pub(crate) async fn pause_after_error() {
    tokio::time::sleep(ERROR_RETRY).await;
}

/// Raw frame as pushed by a connection. `raw` is the undecoded payload.
#[derive(Debug, Clone)]
pub struct GatewayFrame {
    pub source: String,
    pub kind: MessageKind,
    pub length: u8,
    pub raw: Bytes,
    pub received_at: Timestamp,
}

/// Anything the orchestrator's run loop accepts.
#[derive(Debug)]
pub enum Inbound {
    /// Already-structured record, forwarded straight to the encode stage.
    Structured(Value),
    Frame(GatewayFrame),
    /// In-process control call; the result goes back on `reply`.
    Request {
        request: CommandRequest,
        reply: oneshot::Sender<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub stream: SocketAddr,
    pub discovery: SocketAddr,
}

pub struct GatewayManager {
    cfg: GatewayConfig,
    inbound: mpsc::Sender<Inbound>,
    outbound: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    bound: Option<BoundAddrs>,
}

impl GatewayManager {
    pub fn new(cfg: GatewayConfig, inbound: mpsc::Sender<Inbound>) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self {
            cfg,
            inbound,
            outbound,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            bound: None,
        }
    }

    /// Binds both sockets and spawns their tasks. Idempotent.
    pub async fn start(&mut self) -> Result<BoundAddrs, DaqError> {
        if let Some(bound) = self.bound {
            return Ok(bound);
        }

        let listener = TcpListener::bind((self.cfg.comm_host.as_str(), self.cfg.comm_port)).await?;
        let discovery_addr: SocketAddr = tokio::net::lookup_host((self.cfg.ad_host.as_str(), self.cfg.ad_listen_port))
            .await?
            .next()
            .ok_or_else(|| DaqError::InvalidConfig(format!("gateway.ad_host {} does not resolve", self.cfg.ad_host)))?;
        let discovery = udp::bind_discovery(discovery_addr)?;

        let bound = BoundAddrs {
            stream: listener.local_addr()?,
            discovery: discovery.local_addr()?,
        };

        self.tasks.spawn(tcp::serve_stream(
            listener,
            self.inbound.clone(),
            self.outbound.clone(),
            self.tasks.clone(),
            self.cancel.clone(),
        ));
        self.tasks.spawn(udp::serve_discovery(discovery, self.cfg.ad_respond_port, self.cancel.clone()));

        info!(stream = %bound.stream, discovery = %bound.discovery, "gateway listening");
        self.bound = Some(bound);
        Ok(bound)
    }

    /// Cancels the listener, the responder and every open connection, then waits for them.
    pub async fn stop(&mut self) {
        if self.bound.take().is_none() {
            return;
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.cancel = CancellationToken::new();
        self.tasks = TaskTracker::new();
        info!("gateway stopped");
    }

    pub fn is_running(&self) -> bool {
        self.bound.is_some()
    }

    pub fn outbound(&self) -> broadcast::Sender<Bytes> {
        self.outbound.clone()
    }
}
