//! Order execution state machine.
//!
//! Tracks every order by its caller-generated `client_order_id`,
//! reconciles local state against broker acknowledgments and fills,
//! and serializes all transitions behind a single-writer lock so
//! concurrent fill/cancel events cannot race.

mod reconcile;

pub use reconcile::BrokerOrderSnapshot;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::{Order, OrderEvent, OrderEventKind, OrderRequest, OrderStatus};

/// Errors surfaced by the execution engine. These are caller logic
/// errors; none of them is retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The client order id was already used by a terminal order; ids
    /// are never reused.
    #[error("client order id already used: {client_order_id}")]
    DuplicateOrder {
        /// Offending id.
        client_order_id: String,
    },

    /// Cancel requested for an order in a terminal state.
    #[error("order {client_order_id} not cancelable in state {status:?}")]
    OrderNotCancelable {
        /// Order id.
        client_order_id: String,
        /// State that made the cancel illegal.
        status: OrderStatus,
    },

    /// No order with this id.
    #[error("unknown order: {client_order_id}")]
    UnknownOrder {
        /// Requested id.
        client_order_id: String,
    },

    /// The order's broker receipt is unknown; reconcile before
    /// resubmitting to avoid duplicate execution.
    #[error("order {client_order_id} has an ambiguous submission; reconcile first")]
    ReconciliationRequired {
        /// Order id.
        client_order_id: String,
    },
}

/// Outcome of preparing a submission.
#[derive(Debug, Clone)]
pub enum SubmitDisposition {
    /// The id is already tracked; no new order was created. The order
    /// still needs a broker send only if it is `New`.
    Existing(Order),
    /// A new order was created in `New`.
    Created(Order),
}

impl SubmitDisposition {
    /// The tracked order either way.
    #[must_use]
    pub const fn order(&self) -> &Order {
        match self {
            Self::Existing(order) | Self::Created(order) => order,
        }
    }

    /// Whether the facade should (re)send this order to the broker.
    #[must_use]
    pub fn needs_send(&self) -> bool {
        self.order().status == OrderStatus::New && !self.order().ambiguous
    }
}

#[derive(Debug, Default)]
struct OrderStore {
    orders: HashMap<String, Order>,
    /// broker_order_id -> client_order_id
    broker_index: HashMap<String, String>,
}

impl OrderStore {
    fn locate_mut(&mut self, event: &OrderEvent) -> Option<&mut Order> {
        if let Some(id) = &event.client_order_id {
            if self.orders.contains_key(id) {
                return self.orders.get_mut(id);
            }
        }
        let client_id = event
            .broker_order_id
            .as_ref()
            .and_then(|bid| self.broker_index.get(bid).cloned())?;
        self.orders.get_mut(&client_id)
    }
}

/// Single-writer order store and state machine.
#[derive(Debug, Default)]
pub struct ExecutionEngine {
    store: Mutex<OrderStore>,
}

impl ExecutionEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a submission, idempotently.
    ///
    /// Re-submitting a `client_order_id` while the order is `New` or
    /// `Acknowledged` returns the existing order instead of creating a
    /// duplicate.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::ReconciliationRequired`] while the order is
    /// ambiguous; [`ExecutionError::DuplicateOrder`] when the id
    /// belonged to a terminal order.
    pub fn prepare_submit(
        &self,
        request: OrderRequest,
    ) -> Result<SubmitDisposition, ExecutionError> {
        let client_order_id = request
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut store = self.store.lock();
        if let Some(existing) = store.orders.get(&client_order_id) {
            if existing.ambiguous {
                return Err(ExecutionError::ReconciliationRequired { client_order_id });
            }
            if existing.status.is_terminal() {
                return Err(ExecutionError::DuplicateOrder { client_order_id });
            }
            tracing::debug!(%client_order_id, "idempotent resubmission, returning existing order");
            return Ok(SubmitDisposition::Existing(existing.clone()));
        }

        let order = Order {
            client_order_id: client_order_id.clone(),
            broker_order_id: None,
            instrument: request.instrument,
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            time_in_force: request.time_in_force,
            status: OrderStatus::New,
            fills: Vec::new(),
            seen_fill_ids: HashSet::new(),
            ambiguous: false,
            last_sequence: 0,
            submitted_at: Utc::now(),
            acknowledged_at: None,
            terminal_at: None,
            status_reason: None,
            broker_extras: request.broker_extras,
        };
        store.orders.insert(client_order_id, order.clone());
        Ok(SubmitDisposition::Created(order))
    }

    /// Mark an order ambiguous after a transport failure during
    /// submit: the broker may or may not have received it.
    pub fn mark_ambiguous(&self, client_order_id: &str) {
        let mut store = self.store.lock();
        if let Some(order) = store.orders.get_mut(client_order_id) {
            order.ambiguous = true;
            tracing::warn!(%client_order_id, "submission ambiguous, reconciliation required");
        }
    }

    /// Verify that a cancel is legal and return the current order.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::OrderNotCancelable`] for terminal orders,
    /// [`ExecutionError::UnknownOrder`] for unknown ids.
    pub fn check_cancelable(&self, client_order_id: &str) -> Result<Order, ExecutionError> {
        let store = self.store.lock();
        let order =
            store
                .orders
                .get(client_order_id)
                .ok_or_else(|| ExecutionError::UnknownOrder {
                    client_order_id: client_order_id.to_string(),
                })?;
        if order.status.is_terminal() {
            return Err(ExecutionError::OrderNotCancelable {
                client_order_id: client_order_id.to_string(),
                status: order.status,
            });
        }
        Ok(order.clone())
    }

    /// Apply one broker event.
    ///
    /// Events carry the sequence number assigned by the connection
    /// that received them and are applied in that order; stale
    /// sequences and duplicate fill ids are detected and ignored.
    /// Returns the updated order when the event changed anything.
    pub fn apply_event(&self, event: &OrderEvent) -> Option<Order> {
        let mut store = self.store.lock();
        let Some(order) = store.locate_mut(event) else {
            tracing::warn!(
                client_order_id = ?event.client_order_id,
                broker_order_id = ?event.broker_order_id,
                "broker event for unknown order, ignoring"
            );
            return None;
        };

        if event.sequence != 0 && event.sequence <= order.last_sequence {
            tracing::debug!(
                client_order_id = %order.client_order_id,
                sequence = event.sequence,
                last_sequence = order.last_sequence,
                "stale or duplicate event sequence, ignoring"
            );
            return None;
        }

        let changed = match &event.kind {
            OrderEventKind::Acknowledged { broker_order_id } => {
                Self::apply_ack(order, broker_order_id, event)
            }
            OrderEventKind::Fill(fill) => Self::apply_fill(order, fill, event),
            OrderEventKind::Cancelled => {
                Self::apply_terminal(order, OrderStatus::Cancelled, None, event)
            }
            OrderEventKind::Rejected { reason } => {
                Self::apply_terminal(order, OrderStatus::Rejected, Some(reason.clone()), event)
            }
            OrderEventKind::Expired => {
                Self::apply_terminal(order, OrderStatus::Expired, None, event)
            }
            OrderEventKind::Reversal { reason } => {
                // The only path allowed to regress order state.
                tracing::warn!(
                    client_order_id = %order.client_order_id,
                    %reason,
                    from = ?order.status,
                    "broker reversal applied"
                );
                order.status = OrderStatus::Rejected;
                order.status_reason = Some(reason.clone());
                order.terminal_at = Some(event.timestamp);
                true
            }
        };

        if !changed {
            return None;
        }
        if event.sequence != 0 {
            order.last_sequence = event.sequence;
        }
        let updated = order.clone();
        if let Some(broker_id) = updated.broker_order_id.clone() {
            store
                .broker_index
                .insert(broker_id, updated.client_order_id.clone());
        }
        Some(updated)
    }

    /// Look up an order by client id.
    #[must_use]
    pub fn get(&self, client_order_id: &str) -> Option<Order> {
        self.store.lock().orders.get(client_order_id).cloned()
    }

    /// Look up an order by broker id.
    #[must_use]
    pub fn get_by_broker_id(&self, broker_order_id: &str) -> Option<Order> {
        let store = self.store.lock();
        let client_id = store.broker_index.get(broker_order_id)?;
        store.orders.get(client_id).cloned()
    }

    /// All non-terminal orders.
    #[must_use]
    pub fn active_orders(&self) -> Vec<Order> {
        self.store
            .lock()
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect()
    }

    /// Total tracked orders.
    #[must_use]
    pub fn count(&self) -> usize {
        self.store.lock().orders.len()
    }

    fn apply_ack(order: &mut Order, broker_order_id: &str, event: &OrderEvent) -> bool {
        if !order.status.can_advance_to(OrderStatus::Acknowledged) {
            tracing::debug!(
                client_order_id = %order.client_order_id,
                status = ?order.status,
                "acknowledgment after later state, ignoring"
            );
            // Still learn the broker id when it was unknown.
            if order.broker_order_id.is_none() {
                order.broker_order_id = Some(broker_order_id.to_string());
                return true;
            }
            return false;
        }
        order.status = OrderStatus::Acknowledged;
        order.broker_order_id = Some(broker_order_id.to_string());
        order.acknowledged_at = Some(event.timestamp);
        order.ambiguous = false;
        true
    }

    fn apply_fill(order: &mut Order, fill: &crate::models::Fill, event: &OrderEvent) -> bool {
        if order.seen_fill_ids.contains(&fill.fill_id) {
            tracing::debug!(
                client_order_id = %order.client_order_id,
                fill_id = %fill.fill_id,
                "duplicate fill, ignoring"
            );
            return false;
        }
        if order.status.is_terminal() {
            tracing::warn!(
                client_order_id = %order.client_order_id,
                fill_id = %fill.fill_id,
                "fill for terminal order, ignoring"
            );
            return false;
        }
        let would_fill = order.filled_quantity() + fill.quantity;
        if would_fill > order.quantity {
            // Sum of fills must never exceed the requested quantity.
            tracing::warn!(
                client_order_id = %order.client_order_id,
                fill_id = %fill.fill_id,
                requested = %order.quantity,
                cumulative = %would_fill,
                "fill exceeds requested quantity, ignoring"
            );
            return false;
        }

        order.seen_fill_ids.insert(fill.fill_id.clone());
        order.fills.push(fill.clone());
        order.ambiguous = false;
        if would_fill == order.quantity {
            order.status = OrderStatus::Filled;
            order.terminal_at = Some(event.timestamp);
        } else {
            order.status = OrderStatus::PartiallyFilled;
        }
        true
    }

    fn apply_terminal(
        order: &mut Order,
        status: OrderStatus,
        reason: Option<String>,
        event: &OrderEvent,
    ) -> bool {
        if !order.status.can_advance_to(status) {
            tracing::debug!(
                client_order_id = %order.client_order_id,
                from = ?order.status,
                to = ?status,
                "illegal terminal transition, ignoring"
            );
            return false;
        }
        order.status = status;
        order.status_reason = reason;
        order.terminal_at = Some(event.timestamp);
        order.ambiguous = false;
        true
    }
}
