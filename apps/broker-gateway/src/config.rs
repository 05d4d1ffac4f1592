//! Construction-time configuration for one broker account.
//!
//! Everything here is supplied when the client is built and never
//! mutated at runtime. Credential loading itself (env files, vaults)
//! is a caller concern.

use std::collections::HashMap;
use std::time::Duration;

use crate::brokers::BrokerKind;
use crate::normalize::NormalizerConfig;
use crate::rate::{EndpointClass, RateLimit};
use crate::stream::{BackoffConfig, HeartbeatConfig};

/// Broker credentials. Redacted in Debug output.
#[derive(Clone)]
pub enum Credentials {
    /// Bearer token (Oanda personal access token).
    BearerToken(String),
    /// Session token obtained by a prior login (TastyTrade).
    SessionToken(String),
    /// API key/secret pair.
    KeyPair {
        /// API key.
        key: String,
        /// API secret.
        secret: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BearerToken(_) => f.write_str("Credentials::BearerToken([REDACTED])"),
            Self::SessionToken(_) => f.write_str("Credentials::SessionToken([REDACTED])"),
            Self::KeyPair { .. } => f.write_str("Credentials::KeyPair([REDACTED])"),
        }
    }
}

/// Configuration for one broker account.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Which backend to bind.
    pub kind: BrokerKind,
    /// Account credentials.
    pub credentials: Credentials,
    /// REST base URL, e.g. `https://api-fxpractice.oanda.com`.
    pub rest_base_url: String,
    /// Streaming endpoint URL.
    pub stream_url: String,
    /// Broker account identifier, where the API requires one.
    pub account_id: Option<String>,
    /// Rate limits per endpoint class, from the broker's published
    /// numbers.
    pub rate_limits: HashMap<EndpointClass, RateLimit>,
    /// Reconnect backoff parameters.
    pub backoff: BackoffConfig,
    /// Heartbeat supervision parameters.
    pub heartbeat: HeartbeatConfig,
    /// Normalizer parameters (provisional confirmation grace).
    pub normalizer: NormalizerConfig,
    /// Default timeout applied to REST calls issued by the facade.
    pub request_timeout: Duration,
}

impl BrokerConfig {
    /// Minimal config with defaults for backoff, heartbeat, limits,
    /// and normalization.
    #[must_use]
    pub fn new(
        kind: BrokerKind,
        credentials: Credentials,
        rest_base_url: impl Into<String>,
        stream_url: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            credentials,
            rest_base_url: rest_base_url.into(),
            stream_url: stream_url.into(),
            account_id: None,
            rate_limits: HashMap::new(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            normalizer: NormalizerConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Set the broker account identifier.
    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Set the limit for one endpoint class.
    #[must_use]
    pub fn with_rate_limit(mut self, class: EndpointClass, limit: RateLimit) -> Self {
        self.rate_limits.insert(class, limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secrets() {
        let config = BrokerConfig::new(
            BrokerKind::Oanda,
            Credentials::BearerToken("super-secret-token".to_string()),
            "https://api-fxpractice.oanda.com",
            "wss://stream-fxpractice.oanda.com/v3/pricing/stream",
        );
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn builder_sets_account_and_limits() {
        let config = BrokerConfig::new(
            BrokerKind::Oanda,
            Credentials::BearerToken("t".to_string()),
            "https://example.test",
            "wss://example.test/stream",
        )
        .with_account("001-001-1234567-001")
        .with_rate_limit(EndpointClass::Orders, RateLimit::blocking(100.0, 120.0));

        assert_eq!(config.account_id.as_deref(), Some("001-001-1234567-001"));
        assert!(config.rate_limits.contains_key(&EndpointClass::Orders));
    }
}
