//! Ambiguous-submission reconciliation.
//!
//! When a submit call fails at the transport layer the broker may or
//! may not have received the order. The order is parked as ambiguous;
//! a status query against the broker then either adopts the broker's
//! state or clears the flag so the order can be safely resent.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExecutionEngine, ExecutionError};
use crate::models::{Order, OrderStatus};

/// A broker's view of one order, from a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderSnapshot {
    /// Broker-assigned order ID.
    pub broker_order_id: String,
    /// Caller idempotency key, when the broker echoes it.
    pub client_order_id: Option<String>,
    /// Lifecycle status as the broker reports it.
    pub status: OrderStatus,
    /// Cumulative filled quantity the broker reports.
    pub filled_quantity: Decimal,
    /// Average fill price, when any quantity filled.
    pub avg_fill_price: Option<Decimal>,
    /// Broker-side timestamp of the snapshot, when provided.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExecutionEngine {
    /// Resolve an ambiguous submission against a broker status query.
    ///
    /// `Some(snapshot)` means the broker did receive the order: local
    /// state adopts the broker's view and the order proceeds without
    /// resubmission. `None` means the broker never saw it: the
    /// ambiguity flag is cleared and the order may be resent under the
    /// same `client_order_id`.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::UnknownOrder`] when the id is not tracked.
    pub fn reconcile(
        &self,
        client_order_id: &str,
        snapshot: Option<BrokerOrderSnapshot>,
    ) -> Result<Order, ExecutionError> {
        let mut store = self.store.lock();
        let order =
            store
                .orders
                .get_mut(client_order_id)
                .ok_or_else(|| ExecutionError::UnknownOrder {
                    client_order_id: client_order_id.to_string(),
                })?;

        let Some(snapshot) = snapshot else {
            tracing::info!(
                %client_order_id,
                "broker has no record of order, safe to resubmit"
            );
            order.ambiguous = false;
            return Ok(order.clone());
        };

        tracing::info!(
            %client_order_id,
            broker_order_id = %snapshot.broker_order_id,
            status = ?snapshot.status,
            "adopting broker state for ambiguous order"
        );
        order.ambiguous = false;
        order.broker_order_id = Some(snapshot.broker_order_id.clone());
        if order.status == OrderStatus::New {
            order.acknowledged_at = snapshot.updated_at.or_else(|| Some(Utc::now()));
        }
        if order.status == snapshot.status || order.status.can_advance_to(snapshot.status) {
            order.status = snapshot.status;
            if snapshot.status.is_terminal() && order.terminal_at.is_none() {
                order.terminal_at = snapshot.updated_at.or_else(|| Some(Utc::now()));
            }
        } else {
            tracing::warn!(
                %client_order_id,
                local = ?order.status,
                broker = ?snapshot.status,
                "broker snapshot behind local state, keeping local"
            );
        }

        let updated = order.clone();
        store
            .broker_index
            .insert(snapshot.broker_order_id, updated.client_order_id.clone());
        Ok(updated)
    }
}
