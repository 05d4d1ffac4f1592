//! TastyTrade binding (equities and options).
//!
//! Market data rides the dxLink feed protocol; account activity
//! (order updates, fills) arrives as account-streamer messages on the
//! same socket. REST bodies use the API's kebab-case field names.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::dxlink::{
    dxlink_handshake, dxlink_keepalive, dxlink_subscribe, parse_feed_data,
};
use super::{
    BrokerBinding, BrokerKind, StreamPayload, auth_from_credentials, json_decimal, json_str,
    json_time,
};
use crate::config::{BrokerConfig, Credentials};
use crate::execution::BrokerOrderSnapshot;
use crate::models::{
    AssetClass, Candle, Fill, Instrument, InstrumentRegistry, Order, OrderEvent, OrderEventKind,
    OrderStatus, Position, RecordSource, Side,
};
use crate::normalize::NormalizeError;
use crate::rate::EndpointClass;
use crate::stream::ChannelKind;
use crate::transport::{AuthScheme, HttpRequest, StreamMessage};

/// Binding for the TastyTrade API.
pub struct TastyTradeBinding {
    auth: AuthScheme,
    stream_url: String,
    account_id: String,
    session_token: String,
}

impl TastyTradeBinding {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        let session_token = match &config.credentials {
            Credentials::SessionToken(token) | Credentials::BearerToken(token) => token.clone(),
            Credentials::KeyPair { .. } => String::new(),
        };
        Self {
            auth: auth_from_credentials(&config.credentials),
            stream_url: config.stream_url.clone(),
            account_id: config.account_id.clone().unwrap_or_default(),
            session_token,
        }
    }

    fn parse_account_order(&self, data: &Value) -> Result<Vec<StreamPayload>, NormalizeError> {
        let context = "account order message";
        let broker_order_id = json_str(data, "id", context)?.to_string();
        let client_order_id = data
            .get("external-id")
            .and_then(Value::as_str)
            .map(String::from);
        let timestamp = json_time(data, "updated-at", context)?;
        let status = json_str(data, "status", context)?;

        let make = |kind: OrderEventKind| {
            StreamPayload::Order(OrderEvent {
                client_order_id: client_order_id.clone(),
                broker_order_id: Some(broker_order_id.clone()),
                sequence: 0,
                kind,
                timestamp,
            })
        };

        match status {
            "Received" | "Routed" | "Live" => Ok(vec![make(OrderEventKind::Acknowledged {
                broker_order_id: broker_order_id.clone(),
            })]),
            "Filled" => {
                // Fills are nested per leg; emit one event per fill.
                let mut payloads = Vec::new();
                for leg in data
                    .get("legs")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    for fill in leg.get("fills").and_then(Value::as_array).into_iter().flatten() {
                        payloads.push(make(OrderEventKind::Fill(Fill {
                            fill_id: json_str(fill, "ext-exec-id", context)?.to_string(),
                            quantity: json_decimal(fill, "quantity", context)?,
                            price: json_decimal(fill, "fill-price", context)?,
                            timestamp: json_time(fill, "filled-at", context)?,
                        })));
                    }
                }
                if payloads.is_empty() {
                    return Err(NormalizeError::MissingField {
                        field: "legs.fills".to_string(),
                        context: context.to_string(),
                    });
                }
                Ok(payloads)
            }
            "Cancelled" => Ok(vec![make(OrderEventKind::Cancelled)]),
            "Rejected" => Ok(vec![make(OrderEventKind::Rejected {
                reason: data
                    .get("reject-reason")
                    .and_then(Value::as_str)
                    .unwrap_or("rejected")
                    .to_string(),
            })]),
            "Expired" => Ok(vec![make(OrderEventKind::Expired)]),
            other => {
                tracing::debug!(status = %other, "unhandled account order status");
                Ok(vec![StreamPayload::Ignored])
            }
        }
    }
}

const fn instrument_type(asset_class: AssetClass) -> &'static str {
    match asset_class {
        AssetClass::Equity | AssetClass::Fx => "Equity",
        AssetClass::Option => "Equity Option",
        AssetClass::Future => "Future",
    }
}

fn order_status_from(status: &str) -> Result<OrderStatus, NormalizeError> {
    match status {
        "Received" | "Routed" | "Live" => Ok(OrderStatus::Acknowledged),
        "Filled" => Ok(OrderStatus::Filled),
        "Cancelled" => Ok(OrderStatus::Cancelled),
        "Rejected" => Ok(OrderStatus::Rejected),
        "Expired" => Ok(OrderStatus::Expired),
        other => Err(NormalizeError::OutOfRange {
            field: "status".to_string(),
            value: other.to_string(),
        }),
    }
}

impl BrokerBinding for TastyTradeBinding {
    fn kind(&self) -> BrokerKind {
        BrokerKind::TastyTrade
    }

    fn auth(&self) -> AuthScheme {
        self.auth.clone()
    }

    fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn handshake_messages(&self) -> Vec<StreamMessage> {
        let mut messages = dxlink_handshake();
        // Account-streamer connect rides the same socket.
        messages.push(StreamMessage::Text(
            json!({
                "action": "connect",
                "value": [self.account_id],
                "auth-token": self.session_token,
            })
            .to_string(),
        ));
        messages
    }

    fn subscribe_message(&self, instrument: &Instrument, channel: ChannelKind) -> StreamMessage {
        dxlink_subscribe(instrument.symbol_for(BrokerKind::TastyTrade), channel, true)
    }

    fn unsubscribe_message(
        &self,
        instrument: &Instrument,
        channel: ChannelKind,
    ) -> Option<StreamMessage> {
        Some(dxlink_subscribe(
            instrument.symbol_for(BrokerKind::TastyTrade),
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
            .map_err(|e| NormalizeError::Malformed(format!("tastytrade message: {e}")))?;
        match json_str(&value, "type", "tastytrade message")? {
            "FEED_DATA" => parse_feed_data(BrokerKind::TastyTrade, registry, &value),
            "KEEPALIVE" => Ok(vec![StreamPayload::Heartbeat]),
            "Order" => {
                let data = value.get("data").ok_or_else(|| NormalizeError::MissingField {
                    field: "data".to_string(),
                    context: "account order message".to_string(),
                })?;
                self.parse_account_order(data)
            }
            "SETUP" | "AUTH_STATE" | "CHANNEL_OPENED" | "FEED_CONFIG" => {
                Ok(vec![StreamPayload::Ignored])
            }
            other => {
                tracing::debug!(message_type = %other, "unhandled tastytrade message");
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
            "/market-data/candles/{}?interval=1m&from={}&to={}",
            instrument.symbol_for(BrokerKind::TastyTrade),
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
            .get("data")
            .and_then(|d| d.get("items"))
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField {
                field: "data.items".to_string(),
                context: "candles response".to_string(),
            })?;
        let mut candles = Vec::with_capacity(items.len());
        for item in items {
            candles.push(Candle {
                instrument: instrument.symbol.clone(),
                timestamp: json_time(item, "time", "candle")?,
                open: json_decimal(item, "open", "candle")?,
                high: json_decimal(item, "high", "candle")?,
                low: json_decimal(item, "low", "candle")?,
                close: json_decimal(item, "close", "candle")?,
                volume: json_decimal(item, "volume", "candle")?,
                provisional: false,
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
        let action = match order.side {
            Side::Buy => "Buy to Open",
            Side::Sell => "Sell to Close",
        };
        let order_type = match order.order_type {
            crate::models::OrderType::Market => "Market",
            crate::models::OrderType::Limit => "Limit",
            crate::models::OrderType::Stop => "Stop",
            crate::models::OrderType::StopLimit => "Stop Limit",
        };
        let time_in_force = match order.time_in_force {
            crate::models::TimeInForce::Day => "Day",
            crate::models::TimeInForce::Gtc => "GTC",
            crate::models::TimeInForce::Ioc => "IOC",
            crate::models::TimeInForce::Fok => "FOK",
        };
        let mut body = json!({
            "external-id": order.client_order_id,
            "time-in-force": time_in_force,
            "order-type": order_type,
            "legs": [{
                "instrument-type": instrument_type(instrument.asset_class),
                "symbol": instrument.symbol_for(BrokerKind::TastyTrade),
                "quantity": order.quantity.to_string(),
                "action": action,
            }],
        });
        if let Some(price) = order.limit_price {
            body["price"] = Value::String(price.to_string());
        }
        if let Some(price) = order.stop_price {
            body["stop-trigger"] = Value::String(price.to_string());
        }
        if let Some(Value::Object(extras)) = &order.broker_extras {
            for (key, val) in extras {
                body[key] = val.clone();
            }
        }
        HttpRequest::post(
            format!("/accounts/{}/orders", self.account_id),
            body,
            EndpointClass::Orders,
            timeout,
        )
    }

    fn cancel_request(&self, order: &Order, timeout: Duration) -> HttpRequest {
        let broker_id = order.broker_order_id.as_deref().unwrap_or("-");
        HttpRequest::delete(
            format!("/accounts/{}/orders/{broker_id}", self.account_id),
            EndpointClass::Orders,
            timeout,
        )
    }

    fn order_status_request(&self, client_order_id: &str, timeout: Duration) -> HttpRequest {
        HttpRequest::get(
            format!(
                "/accounts/{}/orders?external-id={client_order_id}",
                self.account_id
            ),
            EndpointClass::Orders,
            timeout,
        )
    }

    fn parse_order_status(
        &self,
        body: &Value,
    ) -> Result<Option<BrokerOrderSnapshot>, NormalizeError> {
        let items = body
            .get("data")
            .and_then(|d| d.get("items"))
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField {
                field: "data.items".to_string(),
                context: "orders response".to_string(),
            })?;
        let Some(order) = items.first() else {
            return Ok(None);
        };
        Ok(Some(BrokerOrderSnapshot {
            broker_order_id: json_str(order, "id", "order")?.to_string(),
            client_order_id: order
                .get("external-id")
                .and_then(Value::as_str)
                .map(String::from),
            status: order_status_from(json_str(order, "status", "order")?)?,
            filled_quantity: order
                .get("filled-quantity")
                .map(|_| json_decimal(order, "filled-quantity", "order"))
                .transpose()?
                .unwrap_or_default(),
            avg_fill_price: None,
            updated_at: order
                .get("updated-at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        }))
    }

    fn positions_request(&self, timeout: Duration) -> HttpRequest {
        HttpRequest::get(
            format!("/accounts/{}/positions", self.account_id),
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
            .get("data")
            .and_then(|d| d.get("items"))
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField {
                field: "data.items".to_string(),
                context: "positions response".to_string(),
            })?;
        let mut positions = Vec::with_capacity(items.len());
        for item in items {
            let wire = json_str(item, "symbol", "position")?;
            let symbol = registry
                .resolve_broker_symbol(BrokerKind::TastyTrade, wire)
                .map_or_else(|| wire.to_string(), |i| i.symbol.clone());
            let mut quantity = json_decimal(item, "quantity", "position")?;
            if item.get("quantity-direction").and_then(Value::as_str) == Some("Short") {
                quantity = -quantity;
            }
            positions.push(Position {
                instrument: symbol,
                quantity,
                avg_price: json_decimal(item, "average-open-price", "position")?,
            });
        }
        Ok(positions)
    }
}
