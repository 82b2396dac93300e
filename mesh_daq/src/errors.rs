//thiserror-based error types
use mesh_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("IO: {0}")] Io(#[from] std::io::Error),
    #[error("Protocol: {0}")] Protocol(#[from] ProtocolError),
    #[error("JSON: {0}")] Json(#[from] serde_json::Error),
    #[error("Dispatch: {0}")] Dispatch(String),
    #[error("Publish: {0}")] Publish(String),
    #[error("Compression: {0}")] Compression(String),
    #[error("Config: {0}")] Config(#[from] config::ConfigError),
    #[error("Invalid config: {0}")] InvalidConfig(String),
    #[error("Lock: {0}")] Lock(String),
}
