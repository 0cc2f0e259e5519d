//! In-process transport
//!
//! [`channel_connector`] returns a connector plus the [`MockServer`] end of
//! every connection it opens. Each connect replaces the previous link, which
//! closes the old client stream the way a real server restart would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{Connection, Connector, Credentials, Frame, FrameSink, FrameStream, TransportError};
use crate::error::DecodeError;
use crate::registry::decode_value;
use crate::value::Value;

type ToClient = mpsc::UnboundedSender<Result<Frame, TransportError>>;

struct Link {
    to_client: ToClient,
    from_client: Arc<AsyncMutex<mpsc::UnboundedReceiver<Frame>>>,
}

#[derive(Default)]
struct Shared {
    link: Option<Link>,
    reject: Option<String>,
    handshake_delay: Option<Duration>,
    connects: usize,
    last_credentials: Option<Credentials>,
    last_endpoint: Option<String>,
}

pub fn channel_connector() -> (ChannelConnector, MockServer) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    (
        ChannelConnector {
            shared: shared.clone(),
        },
        MockServer { shared },
    )
}

#[derive(Clone)]
pub struct ChannelConnector {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Connection, TransportError> {
        let delay = {
            let shared = self.shared.lock();
            if let Some(reason) = &shared.reject {
                return Err(TransportError::Handshake {
                    reason: reason.clone(),
                });
            }
            shared.handshake_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        let mut shared = self.shared.lock();
        shared.link = Some(Link {
            to_client: server_tx,
            from_client: Arc::new(AsyncMutex::new(server_rx)),
        });
        shared.connects += 1;
        shared.last_credentials = Some(credentials.clone());
        shared.last_endpoint = Some(endpoint.to_string());

        Ok(Connection {
            sink: Box::new(ChannelSink {
                tx: Some(client_tx),
            }),
            stream: Box::new(ChannelStream { rx: client_rx }),
        })
    }
}

struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or_else(|| TransportError::Disconnected {
            reason: "sink closed".to_string(),
        })?;
        tx.send(frame).map_err(|_| TransportError::Disconnected {
            reason: "server dropped the connection".to_string(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await
    }
}

/// Server end of the in-process transport
#[derive(Clone)]
pub struct MockServer {
    shared: Arc<Mutex<Shared>>,
}

impl MockServer {
    /// Refuse further handshakes with `reason`; `None` accepts again
    pub fn reject_handshakes(&self, reason: Option<&str>) {
        self.shared.lock().reject = reason.map(str::to_string);
    }

    /// Stall every handshake by `delay`
    pub fn delay_handshakes(&self, delay: Option<Duration>) {
        self.shared.lock().handshake_delay = delay;
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock().connects
    }

    pub fn last_credentials(&self) -> Option<Credentials> {
        self.shared.lock().last_credentials.clone()
    }

    pub fn last_endpoint(&self) -> Option<String> {
        self.shared.lock().last_endpoint.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .link
            .as_ref()
            .map(|link| !link.to_client.is_closed())
            .unwrap_or(false)
    }

    /// Deliver `frame` to the client. False when nobody is connected.
    pub fn push(&self, frame: Frame) -> bool {
        match &self.shared.lock().link {
            Some(link) => link.to_client.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Encode `value` as a binary frame and deliver it
    pub fn push_value(&self, value: &Value) -> bool {
        let mut bytes = Vec::new();
        if rmpv::encode::write_value(&mut bytes, &value.to_payload()).is_err() {
            return false;
        }
        self.push(Frame::Binary(bytes))
    }

    /// Surface a transport-level receive error on the client stream
    pub fn push_error(&self, error: &str) -> bool {
        match &self.shared.lock().link {
            Some(link) => link
                .to_client
                .send(Err(TransportError::ReceiveFailed {
                    error: error.to_string(),
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Drop the current connection; the client sees its stream end
    pub fn drop_connection(&self) {
        self.shared.lock().link = None;
    }

    /// Next frame the client sent on the current connection
    pub async fn recv(&self) -> Option<Frame> {
        let from_client = self
            .shared
            .lock()
            .link
            .as_ref()
            .map(|link| link.from_client.clone())?;
        let mut rx = from_client.lock().await;
        rx.recv().await
    }

    /// Next client frame, decoded
    pub async fn recv_value(&self) -> Option<Result<Value, DecodeError>> {
        match self.recv().await? {
            Frame::Binary(bytes) => Some(decode_value(&bytes)),
            Frame::Text(text) => Some(Ok(Value::from(text))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (connector, server) = channel_connector();
        let mut conn = connector
            .connect("ws://mock/ws", &Credentials::new(Some("t".into()), None))
            .await
            .unwrap();

        conn.sink.send(Frame::Text("hi".into())).await.unwrap();
        assert_eq!(server.recv().await, Some(Frame::Text("hi".into())));

        assert!(server.push(Frame::Binary(vec![1, 2])));
        assert_eq!(conn.stream.next().await, Some(Ok(Frame::Binary(vec![1, 2]))));
        assert_eq!(server.last_credentials().unwrap().auth_token.as_deref(), Some("t"));
        assert_eq!(server.last_endpoint().as_deref(), Some("ws://mock/ws"));
    }

    #[tokio::test]
    async fn test_drop_connection_ends_stream() {
        let (connector, server) = channel_connector();
        let mut conn = connector
            .connect("ws://mock/ws", &Credentials::anonymous())
            .await
            .unwrap();
        assert!(server.is_connected());
        server.drop_connection();
        assert_eq!(conn.stream.next().await, None);
        assert!(conn.sink.send(Frame::Binary(vec![0])).await.is_err());
        assert!(!server.push(Frame::Binary(vec![0])));
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (connector, server) = channel_connector();
        server.reject_handshakes(Some("401 unauthorized"));
        let err = connector
            .connect("ws://mock/ws", &Credentials::anonymous())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            TransportError::Handshake {
                reason: "401 unauthorized".into()
            }
        );
        assert_eq!(server.connection_count(), 0);
    }
}
