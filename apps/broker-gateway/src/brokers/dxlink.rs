//! dxLink binding (CME futures).
//!
//! Market data uses the dxLink websocket protocol with COMPACT feed
//! events; the field order is pinned by the FEED_SETUP we send, so the
//! flat arrays decode positionally. Order routing goes to the paired
//! futures execution service over REST, which pushes ORDER_UPDATE
//! messages on the same socket.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::{Value, json};

use super::{
    BrokerBinding, BrokerKind, StreamPayload, auth_from_credentials, json_decimal, json_str,
};
use crate::config::BrokerConfig;
use crate::execution::BrokerOrderSnapshot;
use crate::models::{
    Candle, Fill, Instrument, InstrumentRegistry, MarketRecord, Order, OrderEvent, OrderEventKind,
    OrderStatus, Position, Quote, RecordSource, TradeTick,
};
use crate::normalize::NormalizeError;
use crate::rate::EndpointClass;
use crate::stream::ChannelKind;
use crate::transport::{AuthScheme, HttpRequest, StreamMessage};

/// Feed channel number negotiated in the handshake.
const FEED_CHANNEL: u32 = 1;

/// Binding for CME futures over dxLink.
pub struct DxLinkBinding {
    auth: AuthScheme,
    stream_url: String,
    account_id: String,
}

impl DxLinkBinding {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            auth: auth_from_credentials(&config.credentials),
            stream_url: config.stream_url.clone(),
            account_id: config.account_id.clone().unwrap_or_default(),
        }
    }
}

// ============================================================================
// dxLink protocol helpers, shared with the TastyTrade binding
// ============================================================================

/// SETUP + FEED_SETUP + CHANNEL_REQUEST sent once per connection.
pub(super) fn dxlink_handshake() -> Vec<StreamMessage> {
    vec![
        StreamMessage::Text(
            json!({
                "type": "SETUP",
                "channel": 0,
                "version": "0.1",
                "keepaliveTimeout": 60,
                "acceptKeepaliveTimeout": 60,
            })
            .to_string(),
        ),
        StreamMessage::Text(
            json!({
                "type": "CHANNEL_REQUEST",
                "channel": FEED_CHANNEL,
                "service": "FEED",
                "parameters": { "contract": "AUTO" },
            })
            .to_string(),
        ),
        StreamMessage::Text(
            json!({
                "type": "FEED_SETUP",
                "channel": FEED_CHANNEL,
                "acceptDataFormat": "COMPACT",
                "acceptEventFields": {
                    "Quote": ["eventSymbol", "time", "bidPrice", "askPrice"],
                    "Trade": ["eventSymbol", "time", "price", "size"],
                    "Candle": ["eventSymbol", "time", "open", "high", "low", "close", "volume"],
                },
            })
            .to_string(),
        ),
    ]
}

pub(super) fn dxlink_subscribe(symbol: &str, channel: ChannelKind, add: bool) -> StreamMessage {
    let verb = if add { "add" } else { "remove" };
    StreamMessage::Text(
        json!({
            "type": "FEED_SUBSCRIPTION",
            "channel": FEED_CHANNEL,
            verb: [{ "type": event_type(channel), "symbol": wire_symbol(symbol, channel) }],
        })
        .to_string(),
    )
}

pub(super) fn dxlink_keepalive() -> StreamMessage {
    StreamMessage::Text(json!({ "type": "KEEPALIVE", "channel": 0 }).to_string())
}

const fn event_type(channel: ChannelKind) -> &'static str {
    match channel {
        ChannelKind::Quotes => "Quote",
        ChannelKind::Trades => "Trade",
        ChannelKind::Candles => "Candle",
    }
}

/// Candle subscriptions carry an aggregation suffix on the wire.
fn wire_symbol(symbol: &str, channel: ChannelKind) -> String {
    match channel {
        ChannelKind::Candles => format!("{symbol}{{=1m}}"),
        ChannelKind::Quotes | ChannelKind::Trades => symbol.to_string(),
    }
}

fn strip_aggregation(symbol: &str) -> &str {
    symbol.split('{').next().unwrap_or(symbol)
}

/// Decode one FEED_DATA message into canonical records.
///
/// COMPACT framing: `data` is `[eventType, [flat values...]]`, where
/// the flat array holds one or more events of `field_count` values
/// each, in the field order fixed by FEED_SETUP.
pub(super) fn parse_feed_data(
    broker: BrokerKind,
    registry: &InstrumentRegistry,
    value: &Value,
) -> Result<Vec<StreamPayload>, NormalizeError> {
    let data = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| NormalizeError::MissingField {
            field: "data".to_string(),
            context: "FEED_DATA".to_string(),
        })?;
    let event_kind = data
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| NormalizeError::Malformed("FEED_DATA without event type".to_string()))?;
    let flat = data
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| NormalizeError::Malformed("FEED_DATA without value array".to_string()))?;

    let field_count = match event_kind {
        "Quote" | "Trade" => 4,
        "Candle" => 7,
        _ => return Ok(vec![StreamPayload::Ignored]),
    };
    if flat.len() % field_count != 0 {
        return Err(NormalizeError::Malformed(format!(
            "FEED_DATA {event_kind} payload of {} values not divisible by {field_count}",
            flat.len()
        )));
    }

    let mut payloads = Vec::with_capacity(flat.len() / field_count);
    for event in flat.chunks(field_count) {
        let wire = event[0]
            .as_str()
            .ok_or_else(|| NormalizeError::Malformed("non-string event symbol".to_string()))?;
        let Some(instrument) = registry.resolve_broker_symbol(broker, strip_aggregation(wire))
        else {
            tracing::debug!(symbol = %wire, "feed data for unregistered instrument");
            payloads.push(StreamPayload::Ignored);
            continue;
        };
        let timestamp = compact_time(&event[1])?;
        let record = match event_kind {
            "Quote" => MarketRecord::Quote(Quote {
                instrument: instrument.symbol.clone(),
                timestamp,
                bid: compact_decimal(&event[2], "bidPrice")?,
                ask: compact_decimal(&event[3], "askPrice")?,
                provisional: true,
                source: RecordSource::Live,
            }),
            "Trade" => MarketRecord::Trade(TradeTick {
                instrument: instrument.symbol.clone(),
                timestamp,
                price: compact_decimal(&event[2], "price")?,
                size: compact_decimal(&event[3], "size")?,
                provisional: true,
                source: RecordSource::Live,
            }),
            "Candle" => MarketRecord::Candle(Candle {
                instrument: instrument.symbol.clone(),
                timestamp,
                open: compact_decimal(&event[2], "open")?,
                high: compact_decimal(&event[3], "high")?,
                low: compact_decimal(&event[4], "low")?,
                close: compact_decimal(&event[5], "close")?,
                volume: compact_decimal(&event[6], "volume")?,
                provisional: true,
                source: RecordSource::Live,
            }),
            _ => unreachable!(),
        };
        payloads.push(StreamPayload::Market(record));
    }
    Ok(payloads)
}

fn compact_decimal(value: &Value, field: &str) -> Result<Decimal, NormalizeError> {
    let rendered = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(NormalizeError::OutOfRange {
                field: field.to_string(),
                value: other.to_string(),
            });
        }
    };
    rendered.parse().map_err(|_| NormalizeError::OutOfRange {
        field: field.to_string(),
        value: rendered,
    })
}

fn compact_time(value: &Value) -> Result<DateTime<Utc>, NormalizeError> {
    let millis = value.as_i64().ok_or_else(|| NormalizeError::OutOfRange {
        field: "time".to_string(),
        value: value.to_string(),
    })?;
    DateTime::from_timestamp_millis(millis).ok_or_else(|| NormalizeError::OutOfRange {
        field: "time".to_string(),
        value: millis.to_string(),
    })
}

/// Decode an ORDER_UPDATE pushed by the execution service.
pub(super) fn parse_order_update(value: &Value) -> Result<StreamPayload, NormalizeError> {
    let context = "ORDER_UPDATE";
    let timestamp = super::json_time(value, "time", context)?;
    let broker_order_id = value
        .get("broker_order_id")
        .and_then(Value::as_str)
        .map(String::from);
    let client_order_id = value
        .get("client_order_id")
        .and_then(Value::as_str)
        .map(String::from);

    let status = json_str(value, "status", context)?;
    let kind = match status {
        "ACKNOWLEDGED" => OrderEventKind::Acknowledged {
            broker_order_id: broker_order_id.clone().ok_or_else(|| {
                NormalizeError::MissingField {
                    field: "broker_order_id".to_string(),
                    context: context.to_string(),
                }
            })?,
        },
        "FILLED" | "PARTIALLY_FILLED" => {
            let fill = value.get("fill").ok_or_else(|| NormalizeError::MissingField {
                field: "fill".to_string(),
                context: context.to_string(),
            })?;
            OrderEventKind::Fill(Fill {
                fill_id: json_str(fill, "fill_id", context)?.to_string(),
                quantity: json_decimal(fill, "quantity", context)?,
                price: json_decimal(fill, "price", context)?,
                timestamp,
            })
        }
        "CANCELLED" => OrderEventKind::Cancelled,
        "REJECTED" => OrderEventKind::Rejected {
            reason: value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("rejected")
                .to_string(),
        },
        "EXPIRED" => OrderEventKind::Expired,
        "REVERSED" => OrderEventKind::Reversal {
            reason: value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("reversed")
                .to_string(),
        },
        other => {
            return Err(NormalizeError::OutOfRange {
                field: "status".to_string(),
                value: other.to_string(),
            });
        }
    };
    Ok(StreamPayload::Order(OrderEvent {
        client_order_id,
        broker_order_id,
        sequence: 0,
        kind,
        timestamp,
    }))
}

pub(super) fn snapshot_status(status: &str) -> Result<OrderStatus, NormalizeError> {
    match status {
        "ACKNOWLEDGED" => Ok(OrderStatus::Acknowledged),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELLED" => Ok(OrderStatus::Cancelled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "EXPIRED" => Ok(OrderStatus::Expired),
        other => Err(NormalizeError::OutOfRange {
            field: "status".to_string(),
            value: other.to_string(),
        }),
    }
}

impl BrokerBinding for DxLinkBinding {
    fn kind(&self) -> BrokerKind {
        BrokerKind::DxLink
    }

    fn auth(&self) -> AuthScheme {
        self.auth.clone()
    }

    fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn handshake_messages(&self) -> Vec<StreamMessage> {
        dxlink_handshake()
    }

    fn subscribe_message(&self, instrument: &Instrument, channel: ChannelKind) -> StreamMessage {
        dxlink_subscribe(instrument.symbol_for(BrokerKind::DxLink), channel, true)
    }

    fn unsubscribe_message(
        &self,
        instrument: &Instrument,
        channel: ChannelKind,
    ) -> Option<StreamMessage> {
        Some(dxlink_subscribe(
            instrument.symbol_for(BrokerKind::DxLink),
            channel,
            false,
        ))
    }

    fn keepalive_message(&self) -> Option<StreamMessage> {
        Some(dxlink_keepalive())
    }

    fn parse_stream_payload(
        &self,
        registry: &InstrumentRegistry,
        raw: &str,
    ) -> Result<Vec<StreamPayload>, NormalizeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| NormalizeError::Malformed(format!("dxlink message: {e}")))?;
        match json_str(&value, "type", "dxlink message")? {
            "FEED_DATA" => parse_feed_data(BrokerKind::DxLink, registry, &value),
            "KEEPALIVE" => Ok(vec![StreamPayload::Heartbeat]),
            "ORDER_UPDATE" => Ok(vec![parse_order_update(&value)?]),
            "SETUP" | "AUTH_STATE" | "CHANNEL_OPENED" | "FEED_CONFIG" => {
                Ok(vec![StreamPayload::Ignored])
            }
            other => {
                tracing::debug!(message_type = %other, "unhandled dxlink message");
                Ok(vec![StreamPayload::Ignored])
            }
        }
    }

    fn historic_request(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        timeout: Duration,
    ) -> HttpRequest {
        let path = format!(
            "/v1/candles/{}?interval=1m&from={}&to={}",
            instrument.symbol_for(BrokerKind::DxLink),
            from.to_rfc3339_opts(SecondsFormat::Secs, true),
            to.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        HttpRequest::get(path, EndpointClass::MarketData, timeout)
    }

    fn parse_historic(
        &self,
        instrument: &Instrument,
        body: &Value,
    ) -> Result<Vec<Candle>, NormalizeError> {
        let items = body
            .get("candles")
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField {
                field: "candles".to_string(),
                context: "candles response".to_string(),
            })?;
        let mut candles = Vec::with_capacity(items.len());
        for item in items {
            candles.push(Candle {
                instrument: instrument.symbol.clone(),
                timestamp: super::json_time(item, "time", "candle")?,
                open: json_decimal(item, "open", "candle")?,
                high: json_decimal(item, "high", "candle")?,
                low: json_decimal(item, "low", "candle")?,
                close: json_decimal(item, "close", "candle")?,
                volume: json_decimal(item, "volume", "candle")?,
                provisional: !item
                    .get("settled")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                source: RecordSource::Historic,
            });
        }
        Ok(candles)
    }

    fn order_request(
        &self,
        order: &Order,
        instrument: &Instrument,
        timeout: Duration,
    ) -> HttpRequest {
        let mut body = json!({
            "client_order_id": order.client_order_id,
            "account": self.account_id,
            "symbol": instrument.symbol_for(BrokerKind::DxLink),
            "side": order.side,
            "quantity": order.quantity.to_string(),
            "order_type": order.order_type,
            "time_in_force": order.time_in_force,
        });
        if let Some(price) = order.limit_price {
            body["limit_price"] = Value::String(price.to_string());
        }
        if let Some(price) = order.stop_price {
            body["stop_price"] = Value::String(price.to_string());
        }
        if let Some(Value::Object(extras)) = &order.broker_extras {
            for (key, val) in extras {
                body[key] = val.clone();
            }
        }
        HttpRequest::post("/v1/orders", body, EndpointClass::Orders, timeout)
    }

    fn cancel_request(&self, order: &Order, timeout: Duration) -> HttpRequest {
        let broker_id = order.broker_order_id.as_deref().unwrap_or("-");
        HttpRequest::delete(
            format!("/v1/orders/{broker_id}"),
            EndpointClass::Orders,
            timeout,
        )
    }

    fn order_status_request(&self, client_order_id: &str, timeout: Duration) -> HttpRequest {
        HttpRequest::get(
            format!("/v1/orders?client_order_id={client_order_id}"),
            EndpointClass::Orders,
            timeout,
        )
    }

    fn parse_order_status(
        &self,
        body: &Value,
    ) -> Result<Option<BrokerOrderSnapshot>, NormalizeError> {
        let Some(order) = body.get("order").filter(|o| !o.is_null()) else {
            return Ok(None);
        };
        Ok(Some(BrokerOrderSnapshot {
            broker_order_id: json_str(order, "broker_order_id", "order")?.to_string(),
            client_order_id: order
                .get("client_order_id")
                .and_then(Value::as_str)
                .map(String::from),
            status: snapshot_status(json_str(order, "status", "order")?)?,
            filled_quantity: order
                .get("filled_quantity")
                .map(|_| json_decimal(order, "filled_quantity", "order"))
                .transpose()?
                .unwrap_or_default(),
            avg_fill_price: order
                .get("avg_fill_price")
                .filter(|v| !v.is_null())
                .map(|_| json_decimal(order, "avg_fill_price", "order"))
                .transpose()?,
            updated_at: order
                .get("updated_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        }))
    }

    fn positions_request(&self, timeout: Duration) -> HttpRequest {
        HttpRequest::get(
            format!("/v1/positions?account={}", self.account_id),
            EndpointClass::Account,
            timeout,
        )
    }

    fn parse_positions(
        &self,
        registry: &InstrumentRegistry,
        body: &Value,
    ) -> Result<Vec<Position>, NormalizeError> {
        let items = body
            .get("positions")
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField {
                field: "positions".to_string(),
                context: "positions response".to_string(),
            })?;
        let mut positions = Vec::with_capacity(items.len());
        for item in items {
            let wire = json_str(item, "symbol", "position")?;
            let symbol = registry
                .resolve_broker_symbol(BrokerKind::DxLink, wire)
                .map_or_else(|| wire.to_string(), |i| i.symbol.clone());
            positions.push(Position {
                instrument: symbol,
                quantity: json_decimal(item, "quantity", "position")?,
                avg_price: json_decimal(item, "avg_price", "position")?,
            });
        }
        Ok(positions)
    }
}
