//! Unified client facade.
//!
//! One [`UnifiedClient`] per broker account. It wires the binding,
//! transport, rate governor, reconnection supervisor, normalizer, and
//! execution engine together; callers see canonical types only and
//! never branch on the backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::brokers::{BrokerBinding, binding_for};
use crate::config::BrokerConfig;
use crate::execution::{ExecutionEngine, ExecutionError};
use crate::models::{
    Candle, InstrumentRegistry, MarketRecord, Order, OrderEvent, OrderEventKind, OrderRequest,
    Position, RegistryError,
};
use crate::normalize::{
    CanonicalSeries, MarketSnapshot, MergeOutcome, NormalizeError, NormalizerConfig,
};
use crate::rate::{EndpointClass, RateError, RateGovernor};
use crate::stream::{
    ChannelKind, ConnectionState, GapBackfill, StreamCommand, StreamEvent, StreamSupervisor,
    SubscriptionBook,
};
use crate::transport::{BrokerTransport, HttpTransport, TransportError};

/// Errors surfaced by the facade.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Rate governor refused the call (rejecting mode).
    #[error("rate limit: {0}")]
    Rate(#[from] RateError),

    /// Order state machine violation.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Unknown or duplicate instrument.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Broker payload could not be normalized.
    #[error("normalize: {0}")]
    Normalize(#[from] NormalizeError),

    /// Broker answered with a non-success HTTP status.
    #[error("broker returned HTTP {status}")]
    Broker {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: serde_json::Value,
    },

    /// Submit failed in a way that leaves broker receipt unknown.
    /// The order is parked; reconcile before retrying.
    #[error("submission outcome unknown for {client_order_id}, reconcile before retrying")]
    AmbiguousSubmission {
        /// Parked order id.
        client_order_id: String,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The client has been closed.
    #[error("client closed")]
    Closed,
}

/// Events delivered to consumers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Canonical market record (live emission or correction).
    Market(MarketRecord),
    /// Updated order snapshot after a broker event.
    Order(Order),
    /// Connection state change.
    Connection(ConnectionState),
}

type SeriesMap = Mutex<HashMap<String, CanonicalSeries>>;

/// Shared internals used by the facade, the event pump, and the gap
/// backfiller.
struct Core {
    binding: Arc<dyn BrokerBinding>,
    transport: Arc<dyn BrokerTransport>,
    registry: Arc<InstrumentRegistry>,
    governor: RateGovernor,
    engine: ExecutionEngine,
    series: SeriesMap,
    emissions: broadcast::Sender<ClientEvent>,
    normalizer: NormalizerConfig,
    request_timeout: Duration,
}

impl Core {
    /// Merge one record into its canonical series; returns the record
    /// to surface, if any.
    fn merge(&self, record: MarketRecord) -> Option<MarketRecord> {
        let mut map = self.series.lock();
        let series = map
            .entry(record.instrument().to_string())
            .or_insert_with(|| {
                CanonicalSeries::new(record.instrument().to_string(), self.normalizer.clone())
            });
        match series.ingest(record) {
            MergeOutcome::Emit(record) | MergeOutcome::Correct(record) => Some(record),
            MergeOutcome::Confirm | MergeOutcome::Drop(_) => None,
        }
    }

    fn last_timestamp(&self, instrument: &str) -> Option<DateTime<Utc>> {
        self.series
            .lock()
            .get(instrument)
            .and_then(CanonicalSeries::last_timestamp)
    }

    /// Governed historic fetch, merged into the canonical series.
    /// Corrections the merge produces are broadcast to consumers.
    async fn fetch_historic(
        &self,
        instrument: &crate::models::Instrument,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ClientError> {
        self.governor.acquire(EndpointClass::MarketData, 1.0).await?;
        let request = self
            .binding
            .historic_request(instrument, from, to, self.request_timeout);
        let response = self.transport.send_request(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Broker {
                status: response.status,
                body: response.body,
            });
        }
        let candles = self.binding.parse_historic(instrument, &response.body)?;
        for candle in &candles {
            if let Some(out) = self.merge(MarketRecord::Candle(candle.clone())) {
                let _ = self.emissions.send(ClientEvent::Market(out));
            }
        }
        Ok(candles)
    }
}

/// Gap backfill for resuming candle subscriptions: fetch everything
/// since the last known record before the subscription reactivates.
struct Backfiller {
    core: Arc<Core>,
}

#[async_trait]
impl GapBackfill for Backfiller {
    async fn backfill(&self, instrument: &str, channel: ChannelKind) -> anyhow::Result<()> {
        // Ticks have no historic source; only candle gaps are
        // recoverable.
        if channel != ChannelKind::Candles {
            return Ok(());
        }
        let Some(from) = self.core.last_timestamp(instrument) else {
            return Ok(());
        };
        let instrument = self.core.registry.get(instrument)?;
        let candles = self.core.fetch_historic(&instrument, from, Utc::now()).await?;
        tracing::info!(
            instrument = %instrument.symbol,
            count = candles.len(),
            "gap backfill complete"
        );
        Ok(())
    }
}

/// One client per broker account.
pub struct UnifiedClient {
    core: Arc<Core>,
    book: Arc<SubscriptionBook>,
    commands: mpsc::Sender<StreamCommand>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnifiedClient {
    /// Connect to a broker.
    ///
    /// Returns immediately; the streaming connection is established in
    /// the background and progress is reported through
    /// [`ClientEvent::Connection`] events. Must be called from within
    /// a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP transport cannot be constructed.
    pub fn connect(
        config: BrokerConfig,
        registry: Arc<InstrumentRegistry>,
    ) -> Result<Self, ClientError> {
        let binding = binding_for(&config);
        let transport: Arc<dyn BrokerTransport> = Arc::new(HttpTransport::new(
            config.rest_base_url.clone(),
            binding.auth(),
        )?);
        Ok(Self::connect_with_transport(config, registry, transport))
    }

    /// Connect over an externally supplied transport (tests, proxies).
    #[must_use]
    pub fn connect_with_transport(
        config: BrokerConfig,
        registry: Arc<InstrumentRegistry>,
        transport: Arc<dyn BrokerTransport>,
    ) -> Self {
        let binding = binding_for(&config);
        let (emissions, _) = broadcast::channel(1024);
        let core = Arc::new(Core {
            binding: Arc::clone(&binding),
            transport: Arc::clone(&transport),
            registry: Arc::clone(&registry),
            governor: RateGovernor::new(config.rate_limits.clone()),
            engine: ExecutionEngine::new(),
            series: Mutex::new(HashMap::new()),
            emissions,
            normalizer: config.normalizer.clone(),
            request_timeout: config.request_timeout,
        });

        let book = Arc::new(SubscriptionBook::new());
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(64);

        let supervisor = StreamSupervisor::new(
            binding,
            transport,
            registry,
            Arc::clone(&book),
            Arc::new(Backfiller {
                core: Arc::clone(&core),
            }),
            config.backoff.clone(),
            config.heartbeat.clone(),
            event_tx,
            command_rx,
            Arc::new(AtomicU64::new(0)),
            cancel.clone(),
        );
        let supervisor_task = tokio::spawn(supervisor.run());
        let pump_task = tokio::spawn(event_pump(
            Arc::clone(&core),
            event_rx,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Self {
            core,
            book,
            commands: command_tx,
            state,
            cancel,
            tasks: Mutex::new(vec![supervisor_task, pump_task]),
        }
    }

    /// Subscribe to a channel for one instrument and receive the
    /// client's event feed.
    ///
    /// Data starts flowing once the broker confirms the subscription;
    /// it survives reconnects.
    ///
    /// # Errors
    ///
    /// [`ClientError::Registry`] for unknown instruments,
    /// [`ClientError::Closed`] after shutdown.
    pub async fn subscribe(
        &self,
        symbol: &str,
        channel: ChannelKind,
    ) -> Result<broadcast::Receiver<ClientEvent>, ClientError> {
        let _ = self.core.registry.get(symbol)?;
        let id = self.book.add(symbol, channel);
        self.commands
            .send(StreamCommand::Subscribe(id))
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(self.core.emissions.subscribe())
    }

    /// Unsubscribe from a channel; the subscription closes terminally.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] after shutdown.
    pub async fn unsubscribe(&self, symbol: &str, channel: ChannelKind) -> Result<(), ClientError> {
        if let Some(sub) = self.book.find(symbol, channel) {
            self.commands
                .send(StreamCommand::Unsubscribe(sub.id))
                .await
                .map_err(|_| ClientError::Closed)?;
        }
        Ok(())
    }

    /// A fresh receiver for the event feed without subscribing to
    /// anything new.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.emissions.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Fetch historic candles for `[from, to)` and merge them into the
    /// canonical series as confirmed records. Corrections produced by
    /// the merge are broadcast to subscribers.
    ///
    /// # Errors
    ///
    /// Transport, rate, or normalization failures.
    pub async fn historic(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ClientError> {
        let instrument = self.core.registry.get(symbol)?;
        self.core.fetch_historic(&instrument, from, to).await
    }

    /// The canonical candle series accumulated for an instrument.
    #[must_use]
    pub fn candles(&self, symbol: &str) -> Vec<Candle> {
        self.core
            .series
            .lock()
            .get(symbol)
            .map(CanonicalSeries::candles)
            .unwrap_or_default()
    }

    /// Read-only confirmed view of an instrument's series over
    /// `[from, to)`, for external pricing and volatility consumers.
    /// Provisional candles are excluded.
    #[must_use]
    pub fn snapshot(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> MarketSnapshot {
        self.core.series.lock().get(symbol).map_or_else(
            || MarketSnapshot {
                instrument: symbol.to_string(),
                from,
                to,
                candles: Vec::new(),
                taken_at: Utc::now(),
            },
            |series| series.snapshot(from, to),
        )
    }

    /// Place an order, idempotently by `client_order_id`.
    ///
    /// Returns the tracked order; lifecycle updates arrive as
    /// [`ClientEvent::Order`] events. A definitive broker rejection is
    /// reflected in the returned order's status.
    ///
    /// # Errors
    ///
    /// [`ClientError::AmbiguousSubmission`] parks the order when
    /// broker receipt is unknown; [`ClientError::Execution`] for state
    /// machine violations.
    pub async fn place_order(&self, request: OrderRequest) -> Result<Order, ClientError> {
        let disposition = self.core.engine.prepare_submit(request)?;
        let order = disposition.order().clone();
        if !disposition.needs_send() {
            tracing::debug!(
                client_order_id = %order.client_order_id,
                "order already submitted, returning tracked state"
            );
            return Ok(order);
        }

        self.core.governor.acquire(EndpointClass::Orders, 1.0).await?;
        let instrument = self.core.registry.get(&order.instrument)?;
        let request = self
            .core
            .binding
            .order_request(&order, &instrument, self.core.request_timeout);

        match self.core.transport.send_request(request).await {
            Ok(response) if (200..300).contains(&response.status) => Ok(self
                .core
                .engine
                .get(&order.client_order_id)
                .unwrap_or(order)),
            Ok(response) => {
                // Definitive refusal: the broker saw it and said no.
                tracing::warn!(
                    client_order_id = %order.client_order_id,
                    status = response.status,
                    "order rejected by broker"
                );
                let event = OrderEvent {
                    client_order_id: Some(order.client_order_id.clone()),
                    broker_order_id: None,
                    sequence: 0,
                    kind: OrderEventKind::Rejected {
                        reason: response.body.to_string(),
                    },
                    timestamp: Utc::now(),
                };
                Ok(self.core.engine.apply_event(&event).unwrap_or(order))
            }
            Err(err) => match err {
                // The request may have reached the broker: receipt is
                // unknown, so park the order.
                TransportError::Timeout(_) | TransportError::StreamClosed(_) => {
                    self.core.engine.mark_ambiguous(&order.client_order_id);
                    Err(ClientError::AmbiguousSubmission {
                        client_order_id: order.client_order_id,
                        source: err,
                    })
                }
                other => Err(ClientError::Transport(other)),
            },
        }
    }

    /// Cancel an outstanding order. Confirmation arrives via the
    /// stream as a `Cancelled` event.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::OrderNotCancelable`] for terminal orders.
    pub async fn cancel_order(&self, client_order_id: &str) -> Result<Order, ClientError> {
        let order = self.core.engine.check_cancelable(client_order_id)?;
        self.core.governor.acquire(EndpointClass::Orders, 1.0).await?;
        let request = self
            .core
            .binding
            .cancel_request(&order, self.core.request_timeout);
        let response = self.core.transport.send_request(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Broker {
                status: response.status,
                body: response.body,
            });
        }
        Ok(self
            .core
            .engine
            .get(client_order_id)
            .unwrap_or(order))
    }

    /// Resolve an ambiguous submission by querying the broker.
    ///
    /// # Errors
    ///
    /// Transport or rate failures; [`ExecutionError::UnknownOrder`]
    /// for untracked ids.
    pub async fn reconcile_order(&self, client_order_id: &str) -> Result<Order, ClientError> {
        self.core.governor.acquire(EndpointClass::Orders, 1.0).await?;
        let request = self
            .core
            .binding
            .order_status_request(client_order_id, self.core.request_timeout);
        let response = self.core.transport.send_request(request).await?;
        let snapshot = if response.status == 404 {
            None
        } else if (200..300).contains(&response.status) {
            self.core.binding.parse_order_status(&response.body)?
        } else {
            return Err(ClientError::Broker {
                status: response.status,
                body: response.body,
            });
        };
        Ok(self.core.engine.reconcile(client_order_id, snapshot)?)
    }

    /// Current state of a tracked order.
    #[must_use]
    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.core.engine.get(client_order_id)
    }

    /// All non-terminal orders.
    #[must_use]
    pub fn active_orders(&self) -> Vec<Order> {
        self.core.engine.active_orders()
    }

    /// Open positions as the broker reports them.
    ///
    /// # Errors
    ///
    /// Transport, rate, or normalization failures.
    pub async fn positions(&self) -> Result<Vec<Position>, ClientError> {
        self.core.governor.acquire(EndpointClass::Account, 1.0).await?;
        let request = self.core.binding.positions_request(self.core.request_timeout);
        let response = self.core.transport.send_request(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Broker {
                status: response.status,
                body: response.body,
            });
        }
        Ok(self
            .core
            .binding
            .parse_positions(&self.core.registry, &response.body)?)
    }

    /// Shut down deliberately: close subscriptions, stop the
    /// supervisor, and wait for background tasks.
    pub async fn close(&self) {
        self.book.close_all();
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("client closed");
    }
}

/// Routes supervisor events into the series, the execution engine,
/// and the consumer broadcast. Also ages provisional records past
/// their confirmation grace.
async fn event_pump(
    core: Arc<Core>,
    mut events: mpsc::Receiver<StreamEvent>,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
) {
    let mut expiry = tokio::time::interval(Duration::from_secs(30));
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = expiry.tick() => {
                let now = Utc::now();
                let mut promoted = 0;
                for series in core.series.lock().values_mut() {
                    promoted += series.expire_provisional(now);
                }
                if promoted > 0 {
                    tracing::debug!(promoted, "provisional records aged to confirmed");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    StreamEvent::Market(record) => {
                        if let Some(out) = core.merge(record) {
                            let _ = core.emissions.send(ClientEvent::Market(out));
                        }
                    }
                    StreamEvent::Order(order_event) => {
                        if let Some(order) = core.engine.apply_event(&order_event) {
                            let _ = core.emissions.send(ClientEvent::Order(order));
                        }
                    }
                    StreamEvent::State(new_state) => {
                        *state.write() = new_state;
                        let _ = core.emissions.send(ClientEvent::Connection(new_state));
                    }
                }
            }
        }
    }
}
