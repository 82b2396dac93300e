use crate::errors::DaqError;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

/// External message bus the publish stage hands batches to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + 'static {
    async fn connect(&mut self) -> Result<(), DaqError>;
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), DaqError>;
    async fn close(&mut self);
}

pub struct NatsBroker {
    server: String,
    client: Option<async_nats::Client>,
}

impl NatsBroker {
    pub fn new(server: impl Into<String>) -> Self {
        Self { server: server.into(), client: None }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn connect(&mut self) -> Result<(), DaqError> {
        let client = async_nats::connect(self.server.as_str())
            .await
            .map_err(|e| DaqError::Publish(format!("connect {}: {e}", self.server)))?;
        info!(server = %self.server, "connected to broker");
        self.client = Some(client);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), DaqError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DaqError::Publish("not connected".into()))?;
        client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| DaqError::Publish(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.flush().await {
                warn!(server = %self.server, error = %e, "flush on close failed");
            }
            info!(server = %self.server, "broker connection closed");
        }
    }
}
