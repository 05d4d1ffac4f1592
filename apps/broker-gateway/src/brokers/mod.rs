//! Broker bindings: the capability-set abstraction.
//!
//! Each backend implements the same small operation set — build
//! requests, shape stream control messages, normalize payloads —
//! rather than a deep adapter hierarchy. Broker-specific order fields
//! are passed through, never reinterpreted.

mod dxlink;
mod oanda;
mod tastytrade;

pub use dxlink::DxLinkBinding;
pub use oanda::OandaBinding;
pub use tastytrade::TastyTradeBinding;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{BrokerConfig, Credentials};
use crate::execution::BrokerOrderSnapshot;
use crate::models::{Candle, Instrument, InstrumentRegistry, MarketRecord, Order, OrderEvent, Position};
use crate::normalize::NormalizeError;
use crate::stream::ChannelKind;
use crate::transport::{AuthScheme, HttpRequest, StreamMessage};

/// Supported brokerage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerKind {
    /// Oanda v20 (FX).
    Oanda,
    /// TastyTrade (equities/options, dxLink market data).
    TastyTrade,
    /// CME futures via dxLink.
    DxLink,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oanda => f.write_str("oanda"),
            Self::TastyTrade => f.write_str("tastytrade"),
            Self::DxLink => f.write_str("dxlink"),
        }
    }
}

/// One parsed element of a raw stream message.
#[derive(Debug, Clone)]
pub enum StreamPayload {
    /// Normalized market data.
    Market(MarketRecord),
    /// Order lifecycle event. Sequence is assigned by the supervisor
    /// on receipt, not by the binding.
    Order(OrderEvent),
    /// Broker heartbeat.
    Heartbeat,
    /// Broker confirmed a subscription.
    SubscriptionAck {
        /// Canonical instrument symbol.
        instrument: String,
        /// Confirmed channel.
        channel: ChannelKind,
    },
    /// Recognized but irrelevant message.
    Ignored,
}

/// The capability set every backend implements.
///
/// Implementations are pure with respect to the network: they build
/// requests and parse payloads deterministically; all I/O goes through
/// the transport adapter.
pub trait BrokerBinding: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BrokerKind;

    /// Auth scheme applied to REST and stream handshakes.
    fn auth(&self) -> AuthScheme;

    /// Streaming endpoint URL.
    fn stream_url(&self) -> &str;

    /// Control messages sent once per connection, before any
    /// subscriptions (protocol setup, channel negotiation).
    fn handshake_messages(&self) -> Vec<StreamMessage> {
        Vec::new()
    }

    /// Control message subscribing to one instrument/channel.
    fn subscribe_message(&self, instrument: &Instrument, channel: ChannelKind) -> StreamMessage;

    /// Control message unsubscribing, where the protocol has one.
    fn unsubscribe_message(
        &self,
        instrument: &Instrument,
        channel: ChannelKind,
    ) -> Option<StreamMessage>;

    /// Client-side keepalive, for brokers that require one.
    fn keepalive_message(&self) -> Option<StreamMessage>;

    /// Parse one raw stream message into canonical payloads.
    ///
    /// Must be deterministic: the same raw input always yields the
    /// same payloads.
    ///
    /// # Errors
    ///
    /// [`NormalizeError`] on malformed input; the caller logs and
    /// drops, never fabricates.
    fn parse_stream_payload(
        &self,
        registry: &InstrumentRegistry,
        raw: &str,
    ) -> Result<Vec<StreamPayload>, NormalizeError>;

    /// REST request fetching historic candles for `[from, to)`.
    fn historic_request(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        timeout: Duration,
    ) -> HttpRequest;

    /// Parse a historic-candles response body.
    ///
    /// # Errors
    ///
    /// [`NormalizeError`] on malformed input.
    fn parse_historic(
        &self,
        instrument: &Instrument,
        body: &serde_json::Value,
    ) -> Result<Vec<Candle>, NormalizeError>;

    /// REST request submitting an order.
    fn order_request(
        &self,
        order: &Order,
        instrument: &Instrument,
        timeout: Duration,
    ) -> HttpRequest;

    /// REST request cancelling an order.
    fn cancel_request(&self, order: &Order, timeout: Duration) -> HttpRequest;

    /// REST request querying order status by client order id, used for
    /// ambiguous-submission reconciliation.
    fn order_status_request(&self, client_order_id: &str, timeout: Duration) -> HttpRequest;

    /// Parse an order-status response into a broker snapshot; `None`
    /// means the broker has no such order.
    ///
    /// # Errors
    ///
    /// [`NormalizeError`] on malformed input.
    fn parse_order_status(
        &self,
        body: &serde_json::Value,
    ) -> Result<Option<BrokerOrderSnapshot>, NormalizeError>;

    /// REST request listing open positions.
    fn positions_request(&self, timeout: Duration) -> HttpRequest;

    /// Parse a positions response.
    ///
    /// # Errors
    ///
    /// [`NormalizeError`] on malformed input.
    fn parse_positions(
        &self,
        registry: &InstrumentRegistry,
        body: &serde_json::Value,
    ) -> Result<Vec<Position>, NormalizeError>;
}

/// Build the binding selected by the configuration.
///
/// Broker selection happens here, once, at construction time; calling
/// code never branches on the backend.
#[must_use]
pub fn binding_for(config: &BrokerConfig) -> Arc<dyn BrokerBinding> {
    match config.kind {
        BrokerKind::Oanda => Arc::new(OandaBinding::new(config)),
        BrokerKind::TastyTrade => Arc::new(TastyTradeBinding::new(config)),
        BrokerKind::DxLink => Arc::new(DxLinkBinding::new(config)),
    }
}

// ============================================================================
// Shared payload-field helpers
// ============================================================================

pub(crate) fn json_str<'a>(
    value: &'a serde_json::Value,
    field: &str,
    context: &str,
) -> Result<&'a str, NormalizeError> {
    value
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| NormalizeError::MissingField {
            field: field.to_string(),
            context: context.to_string(),
        })
}

/// Decimal field that may arrive as a JSON string or number.
pub(crate) fn json_decimal(
    value: &serde_json::Value,
    field: &str,
    context: &str,
) -> Result<rust_decimal::Decimal, NormalizeError> {
    let raw = value
        .get(field)
        .ok_or_else(|| NormalizeError::MissingField {
            field: field.to_string(),
            context: context.to_string(),
        })?;
    let rendered = match raw {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => {
            return Err(NormalizeError::OutOfRange {
                field: field.to_string(),
                value: other.to_string(),
            });
        }
    };
    rendered
        .parse()
        .map_err(|_| NormalizeError::OutOfRange {
            field: field.to_string(),
            value: rendered,
        })
}

/// RFC 3339 timestamp field.
pub(crate) fn json_time(
    value: &serde_json::Value,
    field: &str,
    context: &str,
) -> Result<DateTime<Utc>, NormalizeError> {
    let raw = json_str(value, field, context)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| NormalizeError::OutOfRange {
            field: field.to_string(),
            value: raw.to_string(),
        })
}

pub(crate) fn auth_from_credentials(credentials: &Credentials) -> AuthScheme {
    match credentials {
        Credentials::BearerToken(token) => AuthScheme::Bearer(token.clone()),
        Credentials::SessionToken(token) => AuthScheme::SessionToken {
            header: "Authorization".to_string(),
            token: token.clone(),
        },
        Credentials::KeyPair { key, secret } => AuthScheme::KeyPair {
            key_header: "API-KEY".to_string(),
            key: key.clone(),
            secret_header: "API-SECRET".to_string(),
            secret: secret.clone(),
        },
    }
}
