//! Order vocabulary and lifecycle state.
//!
//! The order state machine only advances forward; the single exception
//! is an explicit broker-reported reversal (e.g. a fill later rejected
//! by clearing), which is modeled as its own event kind.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

/// Order type (market, limit, etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Market order - execute at best available price.
    Market,
    /// Limit order - execute at specified price or better.
    Limit,
    /// Stop order - becomes market order when stop price is reached.
    Stop,
    /// Stop-limit order - becomes limit order when stop price is reached.
    StopLimit,
}

/// Time in force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Valid for current trading day only.
    Day,
    /// Good-til-canceled.
    Gtc,
    /// Immediate-or-cancel (fill immediately, cancel remainder).
    Ioc,
    /// Fill-or-kill (all or nothing, immediate execution required).
    Fok,
}

/// Order status in the lifecycle.
///
/// `New → Acknowledged → {PartiallyFilled, Filled} | Rejected |
/// Cancelled | Expired`; the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order created locally, broker receipt not yet acknowledged.
    New,
    /// Order accepted by broker.
    Acknowledged,
    /// Order partially filled.
    PartiallyFilled,
    /// Order completely filled.
    Filled,
    /// Order rejected by broker.
    Rejected,
    /// Order cancelled.
    Cancelled,
    /// Order expired.
    Expired,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }

    /// Returns true if the order is still active (can be filled or cancelled).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::New | Self::Acknowledged | Self::PartiallyFilled)
    }

    /// Whether a forward transition to `next` is legal.
    ///
    /// Broker reversals bypass this check; they are applied only for an
    /// explicit [`OrderEventKind::Reversal`] event.
    #[must_use]
    pub const fn can_advance_to(&self, next: Self) -> bool {
        match self {
            Self::New => matches!(
                next,
                Self::Acknowledged
                    | Self::PartiallyFilled
                    | Self::Filled
                    | Self::Rejected
                    | Self::Cancelled
                    | Self::Expired
            ),
            Self::Acknowledged => matches!(
                next,
                Self::PartiallyFilled
                    | Self::Filled
                    | Self::Rejected
                    | Self::Cancelled
                    | Self::Expired
            ),
            // Repeated partial fills stay in PartiallyFilled.
            Self::PartiallyFilled => matches!(
                next,
                Self::PartiallyFilled | Self::Filled | Self::Cancelled | Self::Expired
            ),
            Self::Filled | Self::Rejected | Self::Cancelled | Self::Expired => false,
        }
    }
}

/// A single partial fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Broker-assigned fill identifier, used for deduplication.
    pub fill_id: String,
    /// Filled quantity.
    pub quantity: Decimal,
    /// Fill price.
    pub price: Decimal,
    /// Fill timestamp (UTC).
    pub timestamp: DateTime<Utc>,
}

/// Caller request to place an order.
///
/// Broker-specific order fields ride along in `broker_extras` and are
/// passed through unmodified, never reinterpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Caller-generated idempotency key; generated when absent.
    pub client_order_id: Option<String>,
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Buy or sell.
    pub side: Side,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price (if applicable).
    pub limit_price: Option<Decimal>,
    /// Stop price (if applicable).
    pub stop_price: Option<Decimal>,
    /// Time in force.
    pub time_in_force: TimeInForce,
    /// Broker-specific fields passed through verbatim.
    pub broker_extras: Option<serde_json::Value>,
}

/// Complete tracked order state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Caller-generated idempotency key; never reused.
    pub client_order_id: String,
    /// Broker's order ID, assigned on acknowledgment.
    pub broker_order_id: Option<String>,
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Buy or sell.
    pub side: Side,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price (if applicable).
    pub limit_price: Option<Decimal>,
    /// Stop price (if applicable).
    pub stop_price: Option<Decimal>,
    /// Time in force.
    pub time_in_force: TimeInForce,
    /// Current lifecycle status.
    pub status: OrderStatus,
    /// Ordered sequence of partial fills.
    pub fills: Vec<Fill>,
    /// Fill IDs already applied, for duplicate detection.
    pub seen_fill_ids: HashSet<String>,
    /// Broker receipt unknown after a transport failure during submit.
    pub ambiguous: bool,
    /// Highest stream sequence number applied to this order.
    pub last_sequence: u64,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// Acknowledgment timestamp.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Terminal-state timestamp.
    pub terminal_at: Option<DateTime<Utc>>,
    /// Reason attached to a rejection or reversal.
    pub status_reason: Option<String>,
    /// Broker-specific fields passed through verbatim.
    pub broker_extras: Option<serde_json::Value>,
}

impl Order {
    /// Sum of fill quantities applied so far.
    #[must_use]
    pub fn filled_quantity(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// Remaining unfilled quantity.
    #[must_use]
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity()
    }
}

/// Kind of broker-reported order event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventKind {
    /// Broker accepted the order.
    Acknowledged {
        /// Broker-assigned order ID.
        broker_order_id: String,
    },
    /// A partial or full fill.
    Fill(Fill),
    /// Order cancelled at the broker.
    Cancelled,
    /// Order rejected by the broker.
    Rejected {
        /// Broker-provided reason.
        reason: String,
    },
    /// Order expired at the broker.
    Expired,
    /// Explicit broker reversal, e.g. a fill later rejected by clearing.
    /// The only event allowed to regress order state.
    Reversal {
        /// Broker-provided reason.
        reason: String,
    },
}

/// A broker order event, sequenced by the connection that received it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Caller idempotency key, when the broker echoes it.
    pub client_order_id: Option<String>,
    /// Broker-assigned order ID.
    pub broker_order_id: Option<String>,
    /// Stream sequence number assigned on receipt; events are applied
    /// in this order and stale sequences are ignored.
    pub sequence: u64,
    /// What happened.
    pub kind: OrderEventKind,
    /// Event timestamp (UTC).
    pub timestamp: DateTime<Utc>,
}

/// An open position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Signed quantity; negative for short.
    pub quantity: Decimal,
    /// Average entry price.
    pub avg_price: Decimal,
}
