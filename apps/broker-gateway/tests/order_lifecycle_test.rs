//! Order lifecycle integration tests.
//!
//! Full path from `place_order` through the broker binding and back in
//! via stream transaction events: idempotent submission, fill
//! deduplication, cancellation, and both branches of
//! ambiguous-submission reconciliation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::sync::broadcast;

use broker_gateway::transport::{HttpMethod, StreamMessage, TransportError};
use broker_gateway::{
    AssetClass, BrokerConfig, BrokerKind, ClientError, ClientEvent, Credentials, Instrument,
    InstrumentRegistry, Order, OrderRequest, OrderStatus, OrderType, Side, TimeInForce,
    UnifiedClient,
};
use common::ScriptedTransport;

fn registry() -> Arc<InstrumentRegistry> {
    let registry = Arc::new(InstrumentRegistry::new());
    registry
        .register(
            Instrument::new("EURUSD", AssetClass::Fx, "OTC")
                .with_broker_symbol(BrokerKind::Oanda, "EUR_USD"),
        )
        .unwrap();
    registry
}

fn config() -> BrokerConfig {
    BrokerConfig::new(
        BrokerKind::Oanda,
        Credentials::BearerToken("token".to_string()),
        "https://api-fxpractice.oanda.test",
        "wss://stream-fxpractice.oanda.test/v3/pricing/stream",
    )
    .with_account("001-001-1234567-001")
}

fn order_request(id: &str, quantity: rust_decimal::Decimal) -> OrderRequest {
    OrderRequest {
        client_order_id: Some(id.to_string()),
        instrument: "EURUSD".to_string(),
        side: Side::Buy,
        quantity,
        order_type: OrderType::Market,
        limit_price: None,
        stop_price: None,
        time_in_force: TimeInForce::Fok,
        broker_extras: None,
    }
}

fn ack_txn(client_id: &str, broker_id: &str) -> common::StreamItem {
    Ok(Some(StreamMessage::Text(format!(
        r#"{{"type":"MARKET_ORDER","id":"{broker_id}","time":"2026-03-02T14:30:00Z","clientExtensions":{{"id":"{client_id}"}}}}"#
    ))))
}

fn fill_txn(broker_id: &str, fill_id: &str, units: &str) -> common::StreamItem {
    Ok(Some(StreamMessage::Text(format!(
        r#"{{"type":"ORDER_FILL","id":"{fill_id}","orderID":"{broker_id}","units":"{units}","price":"1.08495","time":"2026-03-02T14:30:01Z"}}"#
    ))))
}

fn cancel_txn(broker_id: &str) -> common::StreamItem {
    Ok(Some(StreamMessage::Text(format!(
        r#"{{"type":"ORDER_CANCEL","id":"9999","orderID":"{broker_id}","time":"2026-03-02T14:32:00Z"}}"#
    ))))
}

async fn wait_for_status(
    rx: &mut broadcast::Receiver<ClientEvent>,
    client_order_id: &str,
    status: OrderStatus,
) -> Order {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for order event")
            .expect("event channel closed");
        if let ClientEvent::Order(order) = event {
            if order.client_order_id == client_order_id && order.status == status {
                return order;
            }
        }
    }
}

fn post_count(transport: &ScriptedTransport) -> usize {
    transport
        .requests
        .lock()
        .iter()
        .filter(|r| r.method == HttpMethod::Post)
        .count()
}

#[tokio::test]
async fn submit_ack_partial_fills_and_duplicate_fill() {
    let transport = ScriptedTransport::new();
    let stream = transport.push_live_stream();
    let client =
        UnifiedClient::connect_with_transport(config(), registry(), Arc::clone(&transport) as _);
    let mut rx = client.events();

    let order = client.place_order(order_request("ord-1", dec!(100))).await.unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(post_count(&transport), 1);

    stream.send(ack_txn("ord-1", "6788")).unwrap();
    let order = wait_for_status(&mut rx, "ord-1", OrderStatus::Acknowledged).await;
    assert_eq!(order.broker_order_id.as_deref(), Some("6788"));

    // Same client id while outstanding: idempotent, no second POST.
    let again = client.place_order(order_request("ord-1", dec!(100))).await.unwrap();
    assert_eq!(again.status, OrderStatus::Acknowledged);
    assert_eq!(post_count(&transport), 1);

    // Two partial fills, with the first redelivered in between. Fill
    // events route by the broker order id alone.
    stream.send(fill_txn("6788", "7001", "60")).unwrap();
    let order = wait_for_status(&mut rx, "ord-1", OrderStatus::PartiallyFilled).await;
    assert_eq!(order.filled_quantity(), dec!(60));

    stream.send(fill_txn("6788", "7001", "60")).unwrap();
    stream.send(fill_txn("6788", "7002", "40")).unwrap();
    let order = wait_for_status(&mut rx, "ord-1", OrderStatus::Filled).await;
    assert_eq!(order.filled_quantity(), dec!(100));
    assert_eq!(order.fills.len(), 2, "duplicate fill id must be dropped");

    // Terminal ids are never reused.
    let err = client
        .place_order(order_request("ord-1", dec!(100)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Execution(broker_gateway::execution::ExecutionError::DuplicateOrder { .. })
    ));

    client.close().await;
}

#[tokio::test]
async fn ambiguous_submission_broker_never_saw_it() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_live_stream();
    let client =
        UnifiedClient::connect_with_transport(config(), registry(), Arc::clone(&transport) as _);

    // The submit POST times out: receipt unknown.
    transport.fail("/orders", TransportError::Timeout(Duration::from_secs(10)));
    let err = client
        .place_order(order_request("ord-2", dec!(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AmbiguousSubmission { .. }));

    // Blind retry is refused until reconciliation.
    let err = client
        .place_order(order_request("ord-2", dec!(50)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Execution(
            broker_gateway::execution::ExecutionError::ReconciliationRequired { .. }
        )
    ));

    // The broker has no record: safe to resubmit under the same id.
    transport.respond_json(
        "/orders/@ord-2",
        200,
        serde_json::json!({"errorMessage": "order not found"}),
    );
    let order = client.reconcile_order("ord-2").await.unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert!(!order.ambiguous);

    let posts_before = post_count(&transport);
    let order = client.place_order(order_request("ord-2", dec!(50))).await.unwrap();
    assert_eq!(order.status, OrderStatus::New);
    assert_eq!(post_count(&transport), posts_before + 1, "resubmission must hit the broker");

    client.close().await;
}

#[tokio::test]
async fn ambiguous_submission_broker_did_receive_it() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_live_stream();
    let client =
        UnifiedClient::connect_with_transport(config(), registry(), Arc::clone(&transport) as _);

    transport.fail("/orders", TransportError::Timeout(Duration::from_secs(10)));
    let err = client
        .place_order(order_request("ord-3", dec!(25)))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AmbiguousSubmission { .. }));

    // The broker did receive (and fill) it: adopt, never resubmit.
    transport.respond_json(
        "/orders/@ord-3",
        200,
        serde_json::json!({"order": {
            "id": "9001",
            "state": "FILLED",
            "filledUnits": "25",
            "averageFillPrice": "1.08490",
            "clientExtensions": {"id": "ord-3"}
        }}),
    );
    let order = client.reconcile_order("ord-3").await.unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.broker_order_id.as_deref(), Some("9001"));
    assert!(order.terminal_at.is_some());

    let posts_before = post_count(&transport);
    let err = client
        .place_order(order_request("ord-3", dec!(25)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Execution(broker_gateway::execution::ExecutionError::DuplicateOrder { .. })
    ));
    assert_eq!(post_count(&transport), posts_before, "no resubmission after adoption");

    client.close().await;
}

#[tokio::test]
async fn cancel_roundtrip_and_terminal_cancel_refused() {
    let transport = ScriptedTransport::new();
    let stream = transport.push_live_stream();
    let client =
        UnifiedClient::connect_with_transport(config(), registry(), Arc::clone(&transport) as _);
    let mut rx = client.events();

    client.place_order(order_request("ord-4", dec!(10))).await.unwrap();
    stream.send(ack_txn("ord-4", "6790")).unwrap();
    wait_for_status(&mut rx, "ord-4", OrderStatus::Acknowledged).await;

    client.cancel_order("ord-4").await.unwrap();
    assert_eq!(transport.request_count("/cancel"), 1);

    stream.send(cancel_txn("6790")).unwrap();
    let order = wait_for_status(&mut rx, "ord-4", OrderStatus::Cancelled).await;
    assert!(order.terminal_at.is_some());

    let err = client.cancel_order("ord-4").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Execution(
            broker_gateway::execution::ExecutionError::OrderNotCancelable { .. }
        )
    ));

    client.close().await;
}

#[tokio::test]
async fn broker_rejection_is_reflected_in_order_state() {
    let transport = ScriptedTransport::new();
    let _stream = transport.push_live_stream();
    let client =
        UnifiedClient::connect_with_transport(config(), registry(), Arc::clone(&transport) as _);

    transport.respond_json(
        "/orders",
        400,
        serde_json::json!({"errorMessage": "INSUFFICIENT_MARGIN"}),
    );
    let order = client.place_order(order_request("ord-5", dec!(1000))).await.unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(
        order
            .status_reason
            .as_deref()
            .is_some_and(|r| r.contains("INSUFFICIENT_MARGIN"))
    );

    client.close().await;
}
