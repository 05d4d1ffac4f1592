//! Reconnection supervisor for one streaming connection.
//!
//! Owns the connection state machine, the backoff policy, heartbeat
//! supervision, and subscription replay. Market data and order events
//! flow out through a single channel; the facade merges them into the
//! canonical series and the execution engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffConfig, BackoffPolicy};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use super::subscription::{ChannelKind, SubscriptionBook};
use crate::brokers::{BrokerBinding, StreamPayload};
use crate::models::{InstrumentRegistry, MarketRecord, OrderEvent};
use crate::transport::{BrokerStream, BrokerTransport, StreamMessage};

/// Connection state visible to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No connection; not trying (initial, or gave up, or shut down).
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Stream is healthy.
    Connected,
    /// Stream is up but heartbeats or reads are failing.
    Degraded,
}

/// Everything the supervisor surfaces to the facade.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Normalized market data for an active subscription.
    Market(MarketRecord),
    /// Sequenced order event.
    Order(OrderEvent),
    /// Connection state change.
    State(ConnectionState),
}

/// Commands from the facade into the running supervisor.
#[derive(Debug)]
pub enum StreamCommand {
    /// Issue the subscribe control message for a book entry.
    Subscribe(u64),
    /// Issue the unsubscribe control message and close the entry.
    Unsubscribe(u64),
}

/// Fills the gap between the last confirmed record and now before a
/// subscription reactivates.
#[async_trait]
pub trait GapBackfill: Send + Sync {
    /// Fetch and merge whatever the subscription missed.
    ///
    /// # Errors
    ///
    /// Backfill failures are logged by the caller; the subscription
    /// still activates so live flow resumes.
    async fn backfill(&self, instrument: &str, channel: ChannelKind) -> anyhow::Result<()>;
}

const fn channel_of(record: &MarketRecord) -> ChannelKind {
    match record {
        MarketRecord::Quote(_) => ChannelKind::Quotes,
        MarketRecord::Trade(_) => ChannelKind::Trades,
        MarketRecord::Candle(_) => ChannelKind::Candles,
    }
}

/// Why the per-connection loop ended.
enum ConnectionEnd {
    /// Reconnect after backoff.
    Retry,
    /// Stop the supervisor entirely.
    Fatal,
    /// Deliberate shutdown.
    Cancelled,
}

/// Supervises one streaming connection for its whole lifetime.
pub struct StreamSupervisor {
    binding: Arc<dyn BrokerBinding>,
    transport: Arc<dyn BrokerTransport>,
    registry: Arc<InstrumentRegistry>,
    book: Arc<SubscriptionBook>,
    backfill: Arc<dyn GapBackfill>,
    backoff_config: BackoffConfig,
    heartbeat_config: HeartbeatConfig,
    events: mpsc::Sender<StreamEvent>,
    commands: mpsc::Receiver<StreamCommand>,
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl StreamSupervisor {
    /// Wire up a supervisor; `run` drives it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        binding: Arc<dyn BrokerBinding>,
        transport: Arc<dyn BrokerTransport>,
        registry: Arc<InstrumentRegistry>,
        book: Arc<SubscriptionBook>,
        backfill: Arc<dyn GapBackfill>,
        backoff_config: BackoffConfig,
        heartbeat_config: HeartbeatConfig,
        events: mpsc::Sender<StreamEvent>,
        commands: mpsc::Receiver<StreamCommand>,
        sequence: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            binding,
            transport,
            registry,
            book,
            backfill,
            backoff_config,
            heartbeat_config,
            events,
            commands,
            sequence,
            cancel,
        }
    }

    /// Connect, serve, reconnect. Returns when cancelled, when a
    /// non-retryable failure occurs, or when backoff attempts are
    /// exhausted.
    pub async fn run(mut self) {
        let mut backoff = BackoffPolicy::new(self.backoff_config.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.emit_state(ConnectionState::Connecting).await;

            let stream = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.transport.open_stream(self.binding.stream_url()) => result,
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) if !err.is_retryable() => {
                    tracing::error!(error = %err, "connection failed fatally");
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "connection attempt failed");
                    if !self.wait_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let connected_at = Instant::now();
            match self.serve_connection(stream).await {
                ConnectionEnd::Cancelled | ConnectionEnd::Fatal => break,
                ConnectionEnd::Retry => {
                    self.book.mark_all_stale();
                    if backoff.reset_if_stable(connected_at.elapsed()) {
                        tracing::debug!("connection was stable, backoff reset");
                    }
                    if !self.wait_backoff(&mut backoff).await {
                        break;
                    }
                }
            }
        }

        self.book.mark_all_stale();
        self.emit_state(ConnectionState::Disconnected).await;
    }

    /// Sleep out the next backoff delay. Returns false when attempts
    /// are exhausted or the supervisor was cancelled.
    async fn wait_backoff(&self, backoff: &mut BackoffPolicy) -> bool {
        let Some(delay) = backoff.next_delay() else {
            tracing::error!("reconnect attempts exhausted, giving up");
            return false;
        };
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempt_count(),
            "reconnecting after backoff"
        );
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn serve_connection(&mut self, mut stream: Box<dyn BrokerStream>) -> ConnectionEnd {
        for message in self.binding.handshake_messages() {
            if let Err(err) = stream.send(message).await {
                tracing::warn!(error = %err, "handshake send failed");
                return ConnectionEnd::Retry;
            }
        }

        // Replay every surviving subscription in original order; each
        // re-activates (with backfill) when the broker confirms it or
        // its data starts flowing again.
        for sub in self.book.replay_order() {
            if let Ok(instrument) = self.registry.get(&sub.instrument) {
                let message = self.binding.subscribe_message(&instrument, sub.channel);
                if let Err(err) = stream.send(message).await {
                    tracing::warn!(error = %err, "subscription replay failed");
                    return ConnectionEnd::Retry;
                }
            }
        }

        self.emit_state(ConnectionState::Connected).await;

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(16);
        let heartbeat_cancel = self.cancel.child_token();
        let monitor = HeartbeatMonitor::new(
            self.heartbeat_config.clone(),
            Arc::clone(&heartbeat_state),
            heartbeat_tx,
            heartbeat_cancel.clone(),
        );
        let monitor_handle = tokio::spawn(monitor.run());

        let mut read_errors: u32 = 0;
        let end = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = stream.close().await;
                    break ConnectionEnd::Cancelled;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Facade dropped; shut down.
                        let _ = stream.close().await;
                        break ConnectionEnd::Cancelled;
                    };
                    if let Err(err) = self.handle_command(command, stream.as_mut()).await {
                        tracing::warn!(error = %err, "control send failed");
                        break ConnectionEnd::Retry;
                    }
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendKeepalive) => {
                            if let Some(message) = self.binding.keepalive_message() {
                                if let Err(err) = stream.send(message).await {
                                    tracing::warn!(error = %err, "keepalive send failed");
                                    break ConnectionEnd::Retry;
                                }
                            }
                        }
                        Some(HeartbeatEvent::Degraded) => {
                            self.emit_state(ConnectionState::Degraded).await;
                        }
                        Some(HeartbeatEvent::Recovered) => {
                            self.emit_state(ConnectionState::Connected).await;
                        }
                        Some(HeartbeatEvent::Expired) | None => {
                            tracing::warn!("heartbeat expired, tearing connection down");
                            let _ = stream.close().await;
                            break ConnectionEnd::Retry;
                        }
                    }
                }
                message = stream.next_message() => {
                    match message {
                        Ok(Some(message)) => {
                            heartbeat_state.record();
                            if read_errors > 0 {
                                read_errors = 0;
                                self.emit_state(ConnectionState::Connected).await;
                            }
                            self.handle_message(&message).await;
                        }
                        Ok(None) => {
                            tracing::info!("stream closed by peer");
                            break ConnectionEnd::Retry;
                        }
                        Err(err) if !err.is_retryable() => {
                            tracing::error!(error = %err, "stream failed fatally");
                            break ConnectionEnd::Fatal;
                        }
                        Err(err) => {
                            read_errors += 1;
                            // First read error degrades; the second in a
                            // row forces a reconnect.
                            if read_errors == 1 {
                                tracing::warn!(error = %err, "stream read error, degrading");
                                self.emit_state(ConnectionState::Degraded).await;
                            } else {
                                tracing::warn!(error = %err, "repeated stream read error");
                                break ConnectionEnd::Retry;
                            }
                        }
                    }
                }
            }
        };

        heartbeat_cancel.cancel();
        let _ = monitor_handle.await;
        end
    }

    async fn handle_command(
        &self,
        command: StreamCommand,
        stream: &mut dyn BrokerStream,
    ) -> Result<(), crate::transport::TransportError> {
        match command {
            StreamCommand::Subscribe(id) => {
                if let Some(sub) = self.book.get(id) {
                    if let Ok(instrument) = self.registry.get(&sub.instrument) {
                        let message = self.binding.subscribe_message(&instrument, sub.channel);
                        stream.send(message).await?;
                    }
                }
            }
            StreamCommand::Unsubscribe(id) => {
                if let Some(sub) = self.book.get(id) {
                    self.book.close(id);
                    if let Ok(instrument) = self.registry.get(&sub.instrument) {
                        if let Some(message) =
                            self.binding.unsubscribe_message(&instrument, sub.channel)
                        {
                            stream.send(message).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: &StreamMessage) {
        let raw = match message {
            StreamMessage::Text(text) => text.as_str(),
            // All supported brokers speak JSON text; anything else
            // only refreshes the heartbeat.
            StreamMessage::Binary(_) | StreamMessage::Ping | StreamMessage::Pong => return,
        };

        let payloads = match self.binding.parse_stream_payload(&self.registry, raw) {
            Ok(payloads) => payloads,
            Err(err) => {
                // Malformed data is dropped, never fabricated.
                tracing::warn!(error = %err, "malformed stream payload dropped");
                return;
            }
        };

        for payload in payloads {
            match payload {
                StreamPayload::Market(record) => self.deliver_market(record).await,
                StreamPayload::Order(mut event) => {
                    event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = self.events.send(StreamEvent::Order(event)).await;
                }
                StreamPayload::SubscriptionAck {
                    instrument,
                    channel,
                } => {
                    self.activate(&instrument, channel).await;
                }
                StreamPayload::Heartbeat | StreamPayload::Ignored => {}
            }
        }
    }

    async fn deliver_market(&self, record: MarketRecord) {
        let channel = channel_of(&record);
        let instrument = record.instrument().to_string();

        if !self.book.is_deliverable(&instrument, channel) {
            if self.book.find(&instrument, channel).is_none() {
                tracing::debug!(%instrument, ?channel, "data for unknown subscription dropped");
                return;
            }
            // Data flowing is itself the broker's confirmation for
            // protocols without an explicit subscription ack.
            self.activate(&instrument, channel).await;
        }
        let _ = self.events.send(StreamEvent::Market(record)).await;
    }

    /// Backfill the gap, then flip the subscription to `Active`.
    async fn activate(&self, instrument: &str, channel: ChannelKind) {
        let Some(sub) = self.book.find(instrument, channel) else {
            return;
        };
        if let Err(err) = self.backfill.backfill(instrument, channel).await {
            tracing::warn!(
                %instrument,
                ?channel,
                error = %err,
                "gap backfill failed, activating without it"
            );
        }
        self.book.mark_active(sub.id);
        tracing::info!(%instrument, ?channel, "subscription active");
    }

    async fn emit_state(&self, state: ConnectionState) {
        tracing::debug!(?state, "connection state");
        let _ = self.events.send(StreamEvent::State(state)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::{BrokerKind, OandaBinding, binding_for};
    use crate::config::{BrokerConfig, Credentials};
    use crate::models::{AssetClass, Instrument};
    use crate::transport::{HttpRequest, HttpResponse, TransportError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    // Scripted transport: each open_stream hands out the next scripted
    // stream; reads pop scripted results.
    struct ScriptedStream {
        inbound: VecDeque<Result<Option<StreamMessage>, TransportError>>,
        sent: Arc<Mutex<Vec<StreamMessage>>>,
    }

    #[async_trait]
    impl BrokerStream for ScriptedStream {
        async fn next_message(&mut self) -> Result<Option<StreamMessage>, TransportError> {
            match self.inbound.pop_front() {
                Some(result) => result,
                // Script exhausted: park forever so shutdown paths win.
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn send(&mut self, message: StreamMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct ScriptedTransport {
        streams: Mutex<VecDeque<VecDeque<Result<Option<StreamMessage>, TransportError>>>>,
        sent: Arc<Mutex<Vec<StreamMessage>>>,
        connect_errors: Mutex<VecDeque<TransportError>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                streams: Mutex::new(VecDeque::new()),
                sent: Arc::new(Mutex::new(Vec::new())),
                connect_errors: Mutex::new(VecDeque::new()),
            }
        }

        fn push_stream(&self, inbound: Vec<Result<Option<StreamMessage>, TransportError>>) {
            self.streams.lock().push_back(inbound.into());
        }
    }

    #[async_trait]
    impl BrokerTransport for ScriptedTransport {
        async fn send_request(&self, _: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 200,
                body: serde_json::Value::Null,
            })
        }

        async fn open_stream(
            &self,
            _endpoint: &str,
        ) -> Result<Box<dyn BrokerStream>, TransportError> {
            if let Some(err) = self.connect_errors.lock().pop_front() {
                return Err(err);
            }
            match self.streams.lock().pop_front() {
                Some(inbound) => Ok(Box::new(ScriptedStream {
                    inbound,
                    sent: Arc::clone(&self.sent),
                })),
                None => Err(TransportError::ConnectionRefused(
                    "script exhausted".to_string(),
                )),
            }
        }
    }

    #[derive(Default)]
    struct RecordingBackfill {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GapBackfill for RecordingBackfill {
        async fn backfill(&self, instrument: &str, _channel: ChannelKind) -> anyhow::Result<()> {
            self.calls.lock().push(instrument.to_string());
            Ok(())
        }
    }

    fn text(json: &str) -> Result<Option<StreamMessage>, TransportError> {
        Ok(Some(StreamMessage::Text(json.to_string())))
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 3,
            stable_uptime: Duration::from_secs(60),
        }
    }

    struct Harness {
        transport: Arc<ScriptedTransport>,
        book: Arc<SubscriptionBook>,
        backfill: Arc<RecordingBackfill>,
        events: mpsc::Receiver<StreamEvent>,
        commands: mpsc::Sender<StreamCommand>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(transport: Arc<ScriptedTransport>, book: Arc<SubscriptionBook>) -> Harness {
        let config = BrokerConfig::new(
            BrokerKind::Oanda,
            Credentials::BearerToken("t".to_string()),
            "https://api.test",
            "wss://stream.test",
        );
        let binding: Arc<dyn BrokerBinding> = Arc::new(OandaBinding::new(&config));
        let registry = Arc::new(InstrumentRegistry::new());
        registry
            .register(
                Instrument::new("EURUSD", AssetClass::Fx, "OTC")
                    .with_broker_symbol(BrokerKind::Oanda, "EUR_USD"),
            )
            .unwrap();
        let backfill = Arc::new(RecordingBackfill::default());
        let (event_tx, event_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let supervisor = StreamSupervisor::new(
            Arc::clone(&binding),
            Arc::clone(&transport) as Arc<dyn BrokerTransport>,
            registry,
            Arc::clone(&book),
            Arc::clone(&backfill) as Arc<dyn GapBackfill>,
            fast_backoff(),
            HeartbeatConfig {
                interval: Duration::from_secs(5),
                grace_window: Duration::from_secs(5),
            },
            event_tx,
            command_rx,
            Arc::new(AtomicU64::new(0)),
            cancel.clone(),
        );
        let handle = tokio::spawn(supervisor.run());
        Harness {
            transport,
            book,
            backfill: Arc::clone(&backfill),
            events: event_rx,
            commands: command_tx,
            cancel,
            handle,
        }
    }

    async fn next_market(harness: &mut Harness) -> MarketRecord {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
                .await
                .expect("timed out waiting for market event")
                .expect("event channel closed");
            if let StreamEvent::Market(record) = event {
                return record;
            }
        }
    }

    fn price_line(time: &str, bid: &str) -> String {
        format!(
            r#"{{"type":"PRICE","instrument":"EUR_USD","time":"{time}","bids":[{{"price":"{bid}"}}],"asks":[{{"price":"1.0851"}}]}}"#
        )
    }

    #[tokio::test]
    async fn delivers_market_data_and_activates_subscription() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_stream(vec![text(&price_line("2026-03-02T09:00:01Z", "1.0849"))]);
        let book = Arc::new(SubscriptionBook::new());
        book.add("EURUSD", ChannelKind::Quotes);

        let mut harness = start(transport, Arc::clone(&book));
        let record = next_market(&mut harness).await;
        assert_eq!(record.instrument(), "EURUSD");
        assert!(book.is_deliverable("EURUSD", ChannelKind::Quotes));
        assert_eq!(harness.backfill.calls.lock().as_slice(), ["EURUSD"]);

        harness.cancel.cancel();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_peer_close_and_replays_subscriptions() {
        let transport = Arc::new(ScriptedTransport::new());
        // First connection closes immediately; second delivers data.
        transport.push_stream(vec![Ok(None)]);
        transport.push_stream(vec![text(&price_line("2026-03-02T09:01:00Z", "1.0850"))]);
        let book = Arc::new(SubscriptionBook::new());
        let id = book.add("EURUSD", ChannelKind::Quotes);
        book.mark_active(id);

        let mut harness = start(Arc::clone(&transport), Arc::clone(&book));
        let record = next_market(&mut harness).await;
        assert_eq!(record.instrument(), "EURUSD");

        // The replacement connection re-issued the subscribe message.
        let sent = transport.sent.lock();
        let subscribes = sent
            .iter()
            .filter(|m| matches!(m, StreamMessage::Text(t) if t.contains("SUBSCRIBE")))
            .count();
        assert!(subscribes >= 2, "expected replay on reconnect, saw {subscribes}");
        drop(sent);

        harness.cancel.cancel();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn auth_rejection_stops_without_retry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .connect_errors
            .lock()
            .push_back(TransportError::AuthRejected("bad token".to_string()));
        // A scripted stream is available, but it must never be used.
        transport.push_stream(vec![text(&price_line("2026-03-02T09:00:01Z", "1.0849"))]);
        let book = Arc::new(SubscriptionBook::new());

        let mut harness = start(Arc::clone(&transport), book);
        harness.handle.await.unwrap();

        let mut last_state = None;
        while let Ok(event) = harness.events.try_recv() {
            if let StreamEvent::State(state) = event {
                last_state = Some(state);
            }
        }
        assert_eq!(last_state, Some(ConnectionState::Disconnected));
        assert!(!transport.streams.lock().is_empty(), "must not retry past auth failure");
    }

    #[tokio::test]
    async fn unsubscribe_command_closes_and_notifies_broker() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_stream(vec![text(&price_line("2026-03-02T09:00:01Z", "1.0849"))]);
        let book = Arc::new(SubscriptionBook::new());
        let id = book.add("EURUSD", ChannelKind::Quotes);

        let mut harness = start(Arc::clone(&transport), Arc::clone(&book));
        let _ = next_market(&mut harness).await;

        harness
            .commands
            .send(StreamCommand::Unsubscribe(id))
            .await
            .unwrap();

        // Closed is terminal; wait for it to land.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if book.get(id).unwrap().state == super::super::SubscriptionState::Closed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let sent = transport.sent.lock();
        assert!(
            sent.iter()
                .any(|m| matches!(m, StreamMessage::Text(t) if t.contains("UNSUBSCRIBE")))
        );
        drop(sent);

        harness.cancel.cancel();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn binding_for_is_used_by_facade_not_supervisor() {
        // Guard: supervisor is binding-agnostic; selection lives in
        // `binding_for`.
        let config = BrokerConfig::new(
            BrokerKind::DxLink,
            Credentials::BearerToken("t".to_string()),
            "https://api.test",
            "wss://stream.test",
        );
        assert_eq!(binding_for(&config).kind(), BrokerKind::DxLink);
    }
}
