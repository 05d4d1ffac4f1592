//! Oanda v20 binding (spot FX).
//!
//! REST paths follow the v20 API; the pricing/transaction stream is
//! newline-delimited JSON. Prices arrive as strings and are parsed
//! into decimals without going through floats.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use super::{
    BrokerBinding, BrokerKind, StreamPayload, auth_from_credentials, json_decimal, json_str,
    json_time,
};
use crate::config::BrokerConfig;
use crate::execution::BrokerOrderSnapshot;
use crate::models::{
    Candle, Fill, Instrument, InstrumentRegistry, MarketRecord, Order, OrderEvent, OrderEventKind,
    OrderStatus, Position, Quote, RecordSource, Side,
};
use crate::normalize::NormalizeError;
use crate::rate::EndpointClass;
use crate::stream::ChannelKind;
use crate::transport::{AuthScheme, HttpMethod, HttpRequest, StreamMessage};

/// Binding for the Oanda v20 API.
pub struct OandaBinding {
    auth: AuthScheme,
    stream_url: String,
    account_id: String,
}

impl OandaBinding {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            auth: auth_from_credentials(&config.credentials),
            stream_url: config.stream_url.clone(),
            account_id: config.account_id.clone().unwrap_or_default(),
        }
    }

    fn parse_line(
        &self,
        registry: &InstrumentRegistry,
        value: &Value,
    ) -> Result<StreamPayload, NormalizeError> {
        let msg_type = json_str(value, "type", "oanda stream message")?;
        match msg_type {
            "HEARTBEAT" => Ok(StreamPayload::Heartbeat),
            "PRICE" => self.parse_price(registry, value),
            "MARKET_ORDER" | "LIMIT_ORDER" | "STOP_ORDER" | "STOP_LIMIT_ORDER" => {
                Ok(StreamPayload::Order(OrderEvent {
                    client_order_id: client_id_of(value),
                    broker_order_id: Some(json_str(value, "id", msg_type)?.to_string()),
                    sequence: 0,
                    kind: OrderEventKind::Acknowledged {
                        broker_order_id: json_str(value, "id", msg_type)?.to_string(),
                    },
                    timestamp: json_time(value, "time", msg_type)?,
                }))
            }
            "ORDER_FILL" => Ok(StreamPayload::Order(OrderEvent {
                client_order_id: client_id_of(value),
                broker_order_id: Some(json_str(value, "orderID", msg_type)?.to_string()),
                sequence: 0,
                kind: OrderEventKind::Fill(Fill {
                    fill_id: json_str(value, "id", msg_type)?.to_string(),
                    quantity: json_decimal(value, "units", msg_type)?.abs(),
                    price: json_decimal(value, "price", msg_type)?,
                    timestamp: json_time(value, "time", msg_type)?,
                }),
                timestamp: json_time(value, "time", msg_type)?,
            })),
            "ORDER_CANCEL" => Ok(StreamPayload::Order(OrderEvent {
                client_order_id: client_id_of(value),
                broker_order_id: Some(json_str(value, "orderID", msg_type)?.to_string()),
                sequence: 0,
                kind: OrderEventKind::Cancelled,
                timestamp: json_time(value, "time", msg_type)?,
            })),
            "MARKET_ORDER_REJECT" | "LIMIT_ORDER_REJECT" | "STOP_ORDER_REJECT" => {
                Ok(StreamPayload::Order(OrderEvent {
                    client_order_id: client_id_of(value),
                    broker_order_id: None,
                    sequence: 0,
                    kind: OrderEventKind::Rejected {
                        reason: value
                            .get("rejectReason")
                            .and_then(Value::as_str)
                            .unwrap_or("rejected")
                            .to_string(),
                    },
                    timestamp: json_time(value, "time", msg_type)?,
                }))
            }
            _ => Ok(StreamPayload::Ignored),
        }
    }

    fn parse_price(
        &self,
        registry: &InstrumentRegistry,
        value: &Value,
    ) -> Result<StreamPayload, NormalizeError> {
        let broker_symbol = json_str(value, "instrument", "PRICE")?;
        let Some(instrument) = registry.resolve_broker_symbol(BrokerKind::Oanda, broker_symbol)
        else {
            tracing::debug!(%broker_symbol, "price for unregistered instrument");
            return Ok(StreamPayload::Ignored);
        };

        let bid = first_price(value, "bids")?;
        let ask = first_price(value, "asks")?;
        Ok(StreamPayload::Market(MarketRecord::Quote(Quote {
            instrument: instrument.symbol.clone(),
            timestamp: json_time(value, "time", "PRICE")?,
            bid,
            ask,
            provisional: true,
            source: RecordSource::Live,
        })))
    }
}

fn client_id_of(value: &Value) -> Option<String> {
    if let Some(id) = value
        .get("clientExtensions")
        .and_then(|ext| ext.get("id"))
        .and_then(Value::as_str)
    {
        return Some(id.to_string());
    }
    value
        .get("clientOrderID")
        .and_then(Value::as_str)
        .map(String::from)
}

fn first_price(value: &Value, side: &str) -> Result<rust_decimal::Decimal, NormalizeError> {
    let entry = value
        .get(side)
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .ok_or_else(|| NormalizeError::MissingField {
            field: side.to_string(),
            context: "PRICE".to_string(),
        })?;
    json_decimal(entry, "price", "PRICE")
}

fn signed_units(order: &Order) -> String {
    match order.side {
        Side::Buy => order.quantity.to_string(),
        Side::Sell => (-order.quantity).to_string(),
    }
}

impl BrokerBinding for OandaBinding {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Oanda
    }

    fn auth(&self) -> AuthScheme {
        self.auth.clone()
    }

    fn stream_url(&self) -> &str {
        &self.stream_url
    }

    fn subscribe_message(&self, instrument: &Instrument, _channel: ChannelKind) -> StreamMessage {
        StreamMessage::Text(
            json!({
                "type": "SUBSCRIBE",
                "instruments": [instrument.symbol_for(BrokerKind::Oanda)],
            })
            .to_string(),
        )
    }

    fn unsubscribe_message(
        &self,
        instrument: &Instrument,
        _channel: ChannelKind,
    ) -> Option<StreamMessage> {
        Some(StreamMessage::Text(
            json!({
                "type": "UNSUBSCRIBE",
                "instruments": [instrument.symbol_for(BrokerKind::Oanda)],
            })
            .to_string(),
        ))
    }

    fn keepalive_message(&self) -> Option<StreamMessage> {
        // The server heartbeats; the client never does.
        None
    }

    fn parse_stream_payload(
        &self,
        registry: &InstrumentRegistry,
        raw: &str,
    ) -> Result<Vec<StreamPayload>, NormalizeError> {
        // The stream is newline-delimited JSON; a read may carry
        // several lines.
        let mut payloads = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let value: Value = serde_json::from_str(line)
                .map_err(|e| NormalizeError::Malformed(format!("oanda stream: {e}")))?;
            payloads.push(self.parse_line(registry, &value)?);
        }
        Ok(payloads)
    }

    fn historic_request(
        &self,
        instrument: &Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        timeout: Duration,
    ) -> HttpRequest {
        let path = format!(
            "/v3/instruments/{}/candles?granularity=M1&price=M&from={}&to={}",
            instrument.symbol_for(BrokerKind::Oanda),
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
                context: "oanda candles response".to_string(),
            })?;

        let mut candles = Vec::with_capacity(items.len());
        for item in items {
            let mid = item.get("mid").ok_or_else(|| NormalizeError::MissingField {
                field: "mid".to_string(),
                context: "oanda candle".to_string(),
            })?;
            let complete = item
                .get("complete")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            candles.push(Candle {
                instrument: instrument.symbol.clone(),
                timestamp: json_time(item, "time", "oanda candle")?,
                open: json_decimal(mid, "o", "oanda candle")?,
                high: json_decimal(mid, "h", "oanda candle")?,
                low: json_decimal(mid, "l", "oanda candle")?,
                close: json_decimal(mid, "c", "oanda candle")?,
                volume: json_decimal(item, "volume", "oanda candle")?,
                // The still-forming last candle stays provisional even
                // from the REST endpoint.
                provisional: !complete,
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
            "order": {
                "type": order_type_str(order),
                "instrument": instrument.symbol_for(BrokerKind::Oanda),
                "units": signed_units(order),
                "timeInForce": tif_str(order),
                "clientExtensions": { "id": order.client_order_id },
            }
        });
        if let Some(price) = order.limit_price {
            body["order"]["price"] = Value::String(price.to_string());
        }
        if let Some(price) = order.stop_price {
            body["order"]["priceBound"] = Value::String(price.to_string());
        }
        if let Some(Value::Object(extras)) = &order.broker_extras {
            for (key, val) in extras {
                body["order"][key] = val.clone();
            }
        }
        HttpRequest::post(
            format!("/v3/accounts/{}/orders", self.account_id),
            body,
            EndpointClass::Orders,
            timeout,
        )
    }

    fn cancel_request(&self, order: &Order, timeout: Duration) -> HttpRequest {
        let broker_id = order.broker_order_id.as_deref().unwrap_or("-");
        HttpRequest {
            method: HttpMethod::Put,
            path: format!(
                "/v3/accounts/{}/orders/{broker_id}/cancel",
                self.account_id
            ),
            body: None,
            timeout,
            class: EndpointClass::Orders,
        }
    }

    fn order_status_request(&self, client_order_id: &str, timeout: Duration) -> HttpRequest {
        // `@` addresses an order by its client id.
        HttpRequest::get(
            format!("/v3/accounts/{}/orders/@{client_order_id}", self.account_id),
            EndpointClass::Orders,
            timeout,
        )
    }

    fn parse_order_status(
        &self,
        body: &Value,
    ) -> Result<Option<BrokerOrderSnapshot>, NormalizeError> {
        let Some(order) = body.get("order") else {
            return Ok(None);
        };
        let state = json_str(order, "state", "oanda order")?;
        let status = match state {
            "PENDING" | "TRIGGERED" => OrderStatus::Acknowledged,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" => OrderStatus::Cancelled,
            other => {
                return Err(NormalizeError::OutOfRange {
                    field: "state".to_string(),
                    value: other.to_string(),
                });
            }
        };
        Ok(Some(BrokerOrderSnapshot {
            broker_order_id: json_str(order, "id", "oanda order")?.to_string(),
            client_order_id: client_id_of(order),
            status,
            filled_quantity: order
                .get("filledUnits")
                .map_or(Ok(rust_decimal::Decimal::ZERO), |_| {
                    json_decimal(order, "filledUnits", "oanda order").map(|d| d.abs())
                })?,
            avg_fill_price: order
                .get("averageFillPrice")
                .map(|_| json_decimal(order, "averageFillPrice", "oanda order"))
                .transpose()?,
            updated_at: None,
        }))
    }

    fn positions_request(&self, timeout: Duration) -> HttpRequest {
        HttpRequest::get(
            format!("/v3/accounts/{}/openPositions", self.account_id),
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
                context: "oanda positions response".to_string(),
            })?;

        let mut positions = Vec::new();
        for item in items {
            let broker_symbol = json_str(item, "instrument", "oanda position")?;
            let symbol = registry
                .resolve_broker_symbol(BrokerKind::Oanda, broker_symbol)
                .map_or_else(|| broker_symbol.to_string(), |i| i.symbol.clone());

            // Long and short sides are reported separately; net them.
            let long_units = side_units(item, "long")?;
            let short_units = side_units(item, "short")?;
            let quantity = long_units + short_units;
            if quantity.is_zero() {
                continue;
            }
            let side = if long_units.is_zero() { "short" } else { "long" };
            let avg_price = item
                .get(side)
                .map(|s| json_decimal(s, "averagePrice", "oanda position"))
                .transpose()?
                .unwrap_or_default();
            positions.push(Position {
                instrument: symbol,
                quantity,
                avg_price,
            });
        }
        Ok(positions)
    }
}

fn side_units(item: &Value, side: &str) -> Result<rust_decimal::Decimal, NormalizeError> {
    item.get(side)
        .map(|s| json_decimal(s, "units", "oanda position"))
        .transpose()
        .map(Option::unwrap_or_default)
}

const fn order_type_str(order: &Order) -> &'static str {
    match order.order_type {
        crate::models::OrderType::Market => "MARKET",
        crate::models::OrderType::Limit => "LIMIT",
        crate::models::OrderType::Stop => "STOP",
        crate::models::OrderType::StopLimit => "STOP_LIMIT",
    }
}

const fn tif_str(order: &Order) -> &'static str {
    match order.time_in_force {
        crate::models::TimeInForce::Day => "GFD",
        crate::models::TimeInForce::Gtc => "GTC",
        crate::models::TimeInForce::Ioc => "IOC",
        crate::models::TimeInForce::Fok => "FOK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::models::AssetClass;
    use rust_decimal_macros::dec;

    fn binding() -> OandaBinding {
        let config = BrokerConfig::new(
            BrokerKind::Oanda,
            Credentials::BearerToken("t".to_string()),
            "https://api-fxpractice.oanda.com",
            "wss://stream-fxpractice.oanda.com/v3/pricing/stream",
        )
        .with_account("001-001-1234567-001");
        OandaBinding::new(&config)
    }

    fn registry() -> InstrumentRegistry {
        let registry = InstrumentRegistry::new();
        registry
            .register(
                Instrument::new("EURUSD", AssetClass::Fx, "OTC")
                    .with_broker_symbol(BrokerKind::Oanda, "EUR_USD"),
            )
            .unwrap();
        registry
    }

    #[test]
    fn price_line_becomes_provisional_quote() {
        let raw = r#"{"type":"PRICE","instrument":"EUR_USD","time":"2026-03-02T09:00:01.123456789Z","bids":[{"price":"1.08490","liquidity":1000000}],"asks":[{"price":"1.08502","liquidity":1000000}]}"#;
        let payloads = binding().parse_stream_payload(&registry(), raw).unwrap();
        assert_eq!(payloads.len(), 1);
        let StreamPayload::Market(MarketRecord::Quote(quote)) = &payloads[0] else {
            panic!("expected quote, got {:?}", payloads[0]);
        };
        assert_eq!(quote.instrument, "EURUSD");
        assert_eq!(quote.bid, dec!(1.08490));
        assert_eq!(quote.ask, dec!(1.08502));
        assert!(quote.provisional);
        assert_eq!(quote.source, RecordSource::Live);
    }

    #[test]
    fn heartbeat_line_recognized() {
        let raw = r#"{"type":"HEARTBEAT","time":"2026-03-02T09:00:05.000000000Z"}"#;
        let payloads = binding().parse_stream_payload(&registry(), raw).unwrap();
        assert!(matches!(payloads[0], StreamPayload::Heartbeat));
    }

    #[test]
    fn multiple_lines_parse_in_order() {
        let raw = concat!(
            r#"{"type":"HEARTBEAT","time":"2026-03-02T09:00:05Z"}"#,
            "\n",
            r#"{"type":"PRICE","instrument":"EUR_USD","time":"2026-03-02T09:00:06Z","bids":[{"price":"1.0849"}],"asks":[{"price":"1.0850"}]}"#,
        );
        let payloads = binding().parse_stream_payload(&registry(), raw).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(matches!(payloads[0], StreamPayload::Heartbeat));
        assert!(matches!(payloads[1], StreamPayload::Market(_)));
    }

    #[test]
    fn unregistered_instrument_ignored() {
        let raw = r#"{"type":"PRICE","instrument":"USD_JPY","time":"2026-03-02T09:00:06Z","bids":[{"price":"150.1"}],"asks":[{"price":"150.2"}]}"#;
        let payloads = binding().parse_stream_payload(&registry(), raw).unwrap();
        assert!(matches!(payloads[0], StreamPayload::Ignored));
    }

    #[test]
    fn malformed_line_is_error_not_panic() {
        let err = binding()
            .parse_stream_payload(&registry(), "not json")
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Malformed(_)));
    }

    #[test]
    fn fill_transaction_becomes_fill_event() {
        let raw = r#"{"type":"ORDER_FILL","id":"6789","orderID":"6788","clientOrderID":"ord-1","units":"-100","price":"1.08495","time":"2026-03-02T09:01:00Z"}"#;
        let payloads = binding().parse_stream_payload(&registry(), raw).unwrap();
        let StreamPayload::Order(event) = &payloads[0] else {
            panic!("expected order event");
        };
        assert_eq!(event.broker_order_id.as_deref(), Some("6788"));
        let OrderEventKind::Fill(fill) = &event.kind else {
            panic!("expected fill");
        };
        assert_eq!(fill.fill_id, "6789");
        // Units are signed on the wire; fills carry magnitude.
        assert_eq!(fill.quantity, dec!(100));
    }

    #[test]
    fn historic_candles_flag_incomplete_as_provisional() {
        let body = serde_json::json!({
            "instrument": "EUR_USD",
            "candles": [
                {"complete": true, "time": "2026-03-02T09:00:00Z", "volume": 1250,
                 "mid": {"o": "1.0840", "h": "1.0855", "l": "1.0838", "c": "1.0850"}},
                {"complete": false, "time": "2026-03-02T09:01:00Z", "volume": 312,
                 "mid": {"o": "1.0850", "h": "1.0852", "l": "1.0849", "c": "1.0851"}},
            ]
        });
        let instrument = Instrument::new("EURUSD", AssetClass::Fx, "OTC")
            .with_broker_symbol(BrokerKind::Oanda, "EUR_USD");
        let candles = binding().parse_historic(&instrument, &body).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(!candles[0].provisional);
        assert!(candles[1].provisional);
        assert_eq!(candles[0].close, dec!(1.0850));
        assert_eq!(candles[0].source, RecordSource::Historic);
    }

    #[test]
    fn order_request_signs_units_and_carries_client_id() {
        let instrument = Instrument::new("EURUSD", AssetClass::Fx, "OTC")
            .with_broker_symbol(BrokerKind::Oanda, "EUR_USD");
        let order = Order {
            client_order_id: "ord-1".to_string(),
            broker_order_id: None,
            instrument: "EURUSD".to_string(),
            side: Side::Sell,
            quantity: dec!(100),
            order_type: crate::models::OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: crate::models::TimeInForce::Fok,
            status: OrderStatus::New,
            fills: Vec::new(),
            seen_fill_ids: std::collections::HashSet::new(),
            ambiguous: false,
            last_sequence: 0,
            submitted_at: Utc::now(),
            acknowledged_at: None,
            terminal_at: None,
            status_reason: None,
            broker_extras: None,
        };
        let request = binding().order_request(&order, &instrument, Duration::from_secs(5));
        assert_eq!(request.path, "/v3/accounts/001-001-1234567-001/orders");
        assert_eq!(request.class, EndpointClass::Orders);
        let body = request.body.unwrap();
        assert_eq!(body["order"]["units"], "-100");
        assert_eq!(body["order"]["instrument"], "EUR_USD");
        assert_eq!(body["order"]["clientExtensions"]["id"], "ord-1");
        assert_eq!(body["order"]["timeInForce"], "FOK");
    }

    #[test]
    fn order_status_parses_snapshot_or_none() {
        let body = serde_json::json!({
            "order": {
                "id": "6788",
                "state": "FILLED",
                "filledUnits": "-100",
                "averageFillPrice": "1.08495",
                "clientExtensions": {"id": "ord-1"}
            }
        });
        let snapshot = binding().parse_order_status(&body).unwrap().unwrap();
        assert_eq!(snapshot.status, OrderStatus::Filled);
        assert_eq!(snapshot.filled_quantity, dec!(100));
        assert_eq!(snapshot.client_order_id.as_deref(), Some("ord-1"));

        let missing = binding()
            .parse_order_status(&serde_json::json!({"errorMessage": "not found"}))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn positions_net_long_and_short() {
        let body = serde_json::json!({
            "positions": [{
                "instrument": "EUR_USD",
                "long": {"units": "300", "averagePrice": "1.0840"},
                "short": {"units": "0"}
            }]
        });
        let positions = binding().parse_positions(&registry(), &body).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].instrument, "EURUSD");
        assert_eq!(positions[0].quantity, dec!(300));
        assert_eq!(positions[0].avg_price, dec!(1.0840));
    }
}
