//! Frame transport seam
//!
//! The client talks to the worker through a [`Connector`] that yields a
//! sink/stream pair. Production uses [`websocket::WebSocketConnector`];
//! tests and in-process hosts use [`memory::channel_connector`].

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::NodetoolError;

pub use memory::{channel_connector, ChannelConnector, MockServer};
pub use websocket::WebSocketConnector;

/// One discrete message on the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// Opaque auth material presented at connect time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
}

impl Credentials {
    pub fn new(auth_token: Option<String>, user_id: Option<String>) -> Self {
        Self {
            auth_token,
            user_id,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("handshake rejected: {reason}")]
    Handshake { reason: String },

    #[error("transport disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("send failed: {error}")]
    SendFailed { error: String },

    #[error("receive failed: {error}")]
    ReceiveFailed { error: String },
}

impl From<TransportError> for NodetoolError {
    fn from(error: TransportError) -> Self {
        NodetoolError::connection(error.to_string())
    }
}

/// Outgoing half of a connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close gracefully. Safe to call more than once.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Incoming half of a connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame in receipt order; `None` once the peer closed
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;
}

pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Connection, TransportError>;
}
