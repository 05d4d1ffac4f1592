//! Low-level transport adapter: per-broker HTTP plus streaming.
//!
//! The adapter handles auth headers, TLS, and raw request/response
//! framing. Every outbound call carries a caller-supplied timeout and
//! the adapter never retries internally; retry policy lives in the
//! reconnection supervisor and the rate governor above it.

mod error;
mod http;
mod ws;

pub use error::TransportError;
pub use http::HttpTransport;
pub use ws::WsStream;

use std::time::Duration;

use async_trait::async_trait;

use crate::rate::EndpointClass;

/// HTTP method for broker REST calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET request.
    Get,
    /// POST request.
    Post,
    /// PUT request.
    Put,
    /// DELETE request.
    Delete,
}

/// An outbound REST request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Path relative to the broker's REST base URL.
    pub path: String,
    /// JSON body, when present.
    pub body: Option<serde_json::Value>,
    /// Caller-supplied timeout; mandatory on every call.
    pub timeout: Duration,
    /// Endpoint class for rate governance.
    pub class: EndpointClass,
}

impl HttpRequest {
    /// Build a GET request.
    #[must_use]
    pub fn get(path: impl Into<String>, class: EndpointClass, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            body: None,
            timeout,
            class,
        }
    }

    /// Build a POST request with a JSON body.
    #[must_use]
    pub fn post(
        path: impl Into<String>,
        body: serde_json::Value,
        class: EndpointClass,
        timeout: Duration,
    ) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body: Some(body),
            timeout,
            class,
        }
    }

    /// Build a DELETE request.
    #[must_use]
    pub fn delete(path: impl Into<String>, class: EndpointClass, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Delete,
            path: path.into(),
            body: None,
            timeout,
            class,
        }
    }
}

/// Raw response from a broker REST call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed JSON body; `null` when the body was empty.
    pub body: serde_json::Value,
}

/// Per-broker authentication scheme applied to outbound calls.
#[derive(Clone)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>` (Oanda).
    Bearer(String),
    /// Single session-token header (TastyTrade).
    SessionToken {
        /// Header name, e.g. `Authorization`.
        header: String,
        /// Token value.
        token: String,
    },
    /// Key/secret header pair.
    KeyPair {
        /// Header carrying the key.
        key_header: String,
        /// Key value.
        key: String,
        /// Header carrying the secret.
        secret_header: String,
        /// Secret value.
        secret: String,
    },
    /// No authentication (public endpoints, tests).
    None,
}

impl AuthScheme {
    /// Header name/value pairs to attach to a request.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            Self::Bearer(token) => {
                vec![("Authorization".to_string(), format!("Bearer {token}"))]
            }
            Self::SessionToken { header, token } => vec![(header.clone(), token.clone())],
            Self::KeyPair {
                key_header,
                key,
                secret_header,
                secret,
            } => vec![
                (key_header.clone(), key.clone()),
                (secret_header.clone(), secret.clone()),
            ],
            Self::None => vec![],
        }
    }
}

impl std::fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => f.write_str("AuthScheme::Bearer([REDACTED])"),
            Self::SessionToken { header, .. } => f
                .debug_struct("AuthScheme::SessionToken")
                .field("header", header)
                .field("token", &"[REDACTED]")
                .finish(),
            Self::KeyPair {
                key_header,
                secret_header,
                ..
            } => f
                .debug_struct("AuthScheme::KeyPair")
                .field("key_header", key_header)
                .field("secret_header", secret_header)
                .field("key", &"[REDACTED]")
                .field("secret", &"[REDACTED]")
                .finish(),
            Self::None => f.write_str("AuthScheme::None"),
        }
    }
}

/// A message on a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// Text frame (JSON for all supported brokers).
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Transport-level ping.
    Ping,
    /// Transport-level pong.
    Pong,
}

/// Request/response side of a broker connection.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Send a single REST request.
    ///
    /// # Errors
    ///
    /// Fails with [`TransportError`]; never retries internally.
    async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Open a streaming connection to the given endpoint URL.
    ///
    /// # Errors
    ///
    /// Fails with [`TransportError`]; `AuthRejected` propagates
    /// immediately and must not be retried.
    async fn open_stream(&self, endpoint: &str) -> Result<Box<dyn BrokerStream>, TransportError>;
}

/// An open streaming connection.
#[async_trait]
pub trait BrokerStream: Send {
    /// Receive the next message. `Ok(None)` means the peer closed the
    /// stream cleanly.
    async fn next_message(&mut self) -> Result<Option<StreamMessage>, TransportError>;

    /// Send a control message (subscribe/unsubscribe/keepalive).
    async fn send(&mut self, message: StreamMessage) -> Result<(), TransportError>;

    /// Close the stream deliberately.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_auth_header() {
        let auth = AuthScheme::Bearer("abc123".to_string());
        let headers = auth.headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        assert_eq!(headers[0].1, "Bearer abc123");
    }

    #[test]
    fn key_pair_auth_headers() {
        let auth = AuthScheme::KeyPair {
            key_header: "API-KEY".to_string(),
            key: "k".to_string(),
            secret_header: "API-SECRET".to_string(),
            secret: "s".to_string(),
        };
        assert_eq!(auth.headers().len(), 2);
    }

    #[test]
    fn debug_redacts_credentials() {
        let auth = AuthScheme::Bearer("topsecret".to_string());
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn request_builders_carry_class_and_timeout() {
        let req = HttpRequest::get(
            "/v3/accounts",
            EndpointClass::Account,
            Duration::from_secs(5),
        );
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.class, EndpointClass::Account);
        assert_eq!(req.timeout, Duration::from_secs(5));
        assert!(req.body.is_none());
    }
}
