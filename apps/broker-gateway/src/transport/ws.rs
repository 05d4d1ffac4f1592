//! tokio-tungstenite implementation of [`BrokerStream`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{AuthScheme, BrokerStream, StreamMessage, TransportError};

/// An open WebSocket connection to a broker streaming endpoint.
#[derive(Debug)]
pub struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsStream {
    /// Connect and perform the TLS + WebSocket handshake, attaching
    /// the broker's auth headers to the upgrade request.
    ///
    /// # Errors
    ///
    /// Fails with [`TransportError`]; an HTTP 401/403 during the
    /// upgrade maps to `AuthRejected`.
    pub async fn connect(endpoint: &str, auth: &AuthScheme) -> Result<Self, TransportError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        for (name, value) in auth.headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (inner, _response) = connect_async(request).await.map_err(map_ws_error)?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl BrokerStream for WsStream {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(StreamMessage::Text(text.to_string())));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(StreamMessage::Binary(data.to_vec())));
                }
                Some(Ok(Message::Ping(data))) => {
                    // Answer transport pings inline; brokers treat them
                    // as connection-liveness only.
                    self.inner
                        .send(Message::Pong(data))
                        .await
                        .map_err(map_ws_error)?;
                    return Ok(Some(StreamMessage::Ping));
                }
                Some(Ok(Message::Pong(_))) => return Ok(Some(StreamMessage::Pong)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
            }
        }
    }

    async fn send(&mut self, message: StreamMessage) -> Result<(), TransportError> {
        let frame = match message {
            StreamMessage::Text(text) => Message::Text(text.into()),
            StreamMessage::Binary(data) => Message::Binary(data.into()),
            StreamMessage::Ping => Message::Ping(Vec::new().into()),
            StreamMessage::Pong => Message::Pong(Vec::new().into()),
        };
        self.inner.send(frame).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close(None).await.map_err(map_ws_error)
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::StreamClosed("websocket closed".to_string())
        }
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::ConnectionRefused(e.to_string())
        }
        tungstenite::Error::Io(e) => TransportError::StreamClosed(e.to_string()),
        tungstenite::Error::Tls(e) => TransportError::TlsFailure(e.to_string()),
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::AuthRejected(format!("handshake rejected: {status}"))
            } else {
                TransportError::Protocol(format!("handshake failed: {status}"))
            }
        }
        other => TransportError::Protocol(other.to_string()),
    }
}
