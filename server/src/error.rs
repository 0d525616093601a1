//! Error types shared across the server crate

use crate::registry::ConnectionId;
use shared::Code;
use thiserror::Error;

/// Failure while writing to or closing a connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} is not open")]
    NotOpen(ConnectionId),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A drain tick that could not deliver its frame
#[derive(Debug, Error)]
#[error("delivery to {connection} failed: {source}")]
pub struct DeliveryError {
    pub connection: ConnectionId,
    #[source]
    pub source: TransportError,
}

/// Configuration errors raised while assembling the dispatch table
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("protocol code {code} registered by both `{existing}` and `{provider}`")]
    DuplicateCode {
        code: Code,
        existing: &'static str,
        provider: &'static str,
    },
    #[error("provider `{provider}` failed to initialise: {reason}")]
    Init {
        provider: &'static str,
        reason: String,
    },
}

/// Failures of the durable entity store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("entity encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failures starting or running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
