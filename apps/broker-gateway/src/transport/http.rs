//! reqwest-based implementation of the transport ports.

use async_trait::async_trait;
use reqwest::{Client, Method};

use super::ws::WsStream;
use super::{
    AuthScheme, BrokerStream, BrokerTransport, HttpMethod, HttpRequest, HttpResponse,
    TransportError,
};

/// HTTP + WebSocket transport for one broker account.
///
/// Owns its credentials; no process-wide session state is shared, so
/// multiple accounts and brokers can coexist in one process.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth: AuthScheme,
}

impl HttpTransport {
    /// Create a transport for the given REST base URL and auth scheme.
    ///
    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, auth: AuthScheme) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth,
        })
    }

    const fn method_for(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn map_request_error(err: &reqwest::Error, request: &HttpRequest) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout(request.timeout);
        }
        if err.is_connect() {
            let detail = err.to_string();
            if detail.contains("certificate") || detail.contains("tls") {
                return TransportError::TlsFailure(detail);
            }
            return TransportError::ConnectionRefused(detail);
        }
        TransportError::Protocol(err.to_string())
    }
}

#[async_trait]
impl BrokerTransport for HttpTransport {
    async fn send_request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(Self::method_for(request.method), &url)
            .timeout(request.timeout);

        for (name, value) in self.auth.headers() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_request_error(&e, &request))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::AuthRejected(body));
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let body = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| TransportError::Protocol(e.to_string()))?
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn open_stream(&self, endpoint: &str) -> Result<Box<dyn BrokerStream>, TransportError> {
        let stream = WsStream::connect(endpoint, &self.auth).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::EndpointClass;
    use std::time::Duration;

    #[test]
    fn method_mapping() {
        assert_eq!(HttpTransport::method_for(HttpMethod::Get), Method::GET);
        assert_eq!(HttpTransport::method_for(HttpMethod::Post), Method::POST);
        assert_eq!(
            HttpTransport::method_for(HttpMethod::Delete),
            Method::DELETE
        );
    }

    #[tokio::test]
    async fn connection_refused_maps_to_transport_error() {
        // Nothing listens on this port.
        let transport = HttpTransport::new("http://127.0.0.1:1", AuthScheme::None).unwrap();
        let request = HttpRequest::get(
            "/anything",
            EndpointClass::MarketData,
            Duration::from_secs(1),
        );

        let err = transport.send_request(request).await.unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::ConnectionRefused(_) | TransportError::Timeout(_)
            ),
            "unexpected error: {err:?}"
        );
    }
}
