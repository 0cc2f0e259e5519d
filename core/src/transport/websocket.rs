use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Connection, Connector, Credentials, Frame, FrameSink, FrameStream, TransportError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport. The auth token, when present, travels as a
/// bearer `Authorization` header on the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Connection, TransportError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::Handshake {
                reason: format!("invalid endpoint {}: {}", endpoint, e),
            })?;

        if let Some(token) = credentials.auth_token.as_deref().filter(|t| !t.is_empty()) {
            let header = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                TransportError::Handshake {
                    reason: format!("invalid auth token: {}", e),
                }
            })?;
            request.headers_mut().insert("Authorization", header);
        }

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Handshake {
                reason: e.to_string(),
            })?;
        crate::debug_log!("websocket connected to {} ({})", endpoint, response.status());

        let (write, read) = socket.split();
        Ok(Connection {
            sink: Box::new(WebSocketSink {
                inner: write,
                closed: false,
            }),
            stream: Box::new(WebSocketFrames { inner: read }),
        })
    }
}

struct WebSocketSink {
    inner: SplitSink<Socket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected {
                reason: "sink closed".to_string(),
            });
        }
        let message = match frame {
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Text(text) => Message::Text(text),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed {
                error: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed {
                error: e.to_string(),
            })
    }
}

struct WebSocketFrames {
    inner: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Close(frame)) => {
                    crate::debug_log!("websocket closed by peer: {:?}", frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite itself
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(TransportError::ReceiveFailed {
                        error: e.to_string(),
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_endpoint_is_handshake_error() {
        let connector = WebSocketConnector::new();
        let result = connector.connect("not a url", &Credentials::anonymous()).await;
        assert!(matches!(result, Err(TransportError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_refused_connection_is_handshake_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new();
        let result = connector
            .connect(&format!("ws://{}/ws", addr), &Credentials::anonymous())
            .await;
        assert!(matches!(result, Err(TransportError::Handshake { .. })));
    }
}
