//! Subscription bookkeeping for one streaming connection.
//!
//! Subscriptions are owned by the reconnection supervisor. A
//! subscription delivers data only while `Active`; data arriving for a
//! `Stale` or `Closed` subscription is discarded and logged. On
//! reconnect the supervisor replays subscriptions in their original
//! order.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Channel kind delivered over a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelKind {
    /// Executed trades.
    Trades,
    /// Bid/ask quotes.
    Quotes,
    /// Interval candles.
    Candles,
}

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    /// Requested, awaiting broker confirmation.
    Pending,
    /// Confirmed; data is deliverable.
    Active,
    /// Connection lost; awaiting replay + backfill.
    Stale,
    /// Deliberately closed; terminal.
    Closed,
}

/// One instrument/channel subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Book-assigned identifier.
    pub id: u64,
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Channel kind.
    pub channel: ChannelKind,
    /// Current state.
    pub state: SubscriptionState,
}

/// Ordered set of subscriptions for one connection.
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    next_id: AtomicU64,
    // Insertion order is preserved: replay after reconnect must issue
    // subscriptions in their original order.
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription in `Pending` state; returns its id.
    pub fn add(&self, instrument: impl Into<String>, channel: ChannelKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().push(Subscription {
            id,
            instrument: instrument.into(),
            channel,
            state: SubscriptionState::Pending,
        });
        id
    }

    /// Mark a subscription `Active` once the broker confirms it and
    /// any gap backfill has completed.
    pub fn mark_active(&self, id: u64) {
        self.transition(id, SubscriptionState::Active);
    }

    /// Mark every non-closed subscription `Stale` (connection lost).
    pub fn mark_all_stale(&self) {
        let mut entries = self.entries.write();
        for sub in entries.iter_mut() {
            if sub.state != SubscriptionState::Closed {
                sub.state = SubscriptionState::Stale;
            }
        }
    }

    /// Close a subscription; terminal.
    pub fn close(&self, id: u64) {
        self.transition(id, SubscriptionState::Closed);
    }

    /// Close every subscription (facade shutdown).
    pub fn close_all(&self) {
        let mut entries = self.entries.write();
        for sub in entries.iter_mut() {
            sub.state = SubscriptionState::Closed;
        }
    }

    /// Subscriptions to replay after reconnect, in original order.
    /// Pending entries are included: they were requested but never
    /// confirmed before the connection dropped.
    #[must_use]
    pub fn replay_order(&self) -> Vec<Subscription> {
        self.entries
            .read()
            .iter()
            .filter(|s| {
                matches!(
                    s.state,
                    SubscriptionState::Pending
                        | SubscriptionState::Active
                        | SubscriptionState::Stale
                )
            })
            .cloned()
            .collect()
    }

    /// Whether data for (instrument, channel) may be surfaced to
    /// consumers right now.
    #[must_use]
    pub fn is_deliverable(&self, instrument: &str, channel: ChannelKind) -> bool {
        self.entries.read().iter().any(|s| {
            s.state == SubscriptionState::Active
                && s.instrument == instrument
                && s.channel == channel
        })
    }

    /// Look up a subscription by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Subscription> {
        self.entries.read().iter().find(|s| s.id == id).cloned()
    }

    /// Look up the non-closed subscription for (instrument, channel).
    #[must_use]
    pub fn find(&self, instrument: &str, channel: ChannelKind) -> Option<Subscription> {
        self.entries
            .read()
            .iter()
            .find(|s| {
                s.state != SubscriptionState::Closed
                    && s.instrument == instrument
                    && s.channel == channel
            })
            .cloned()
    }

    fn transition(&self, id: u64, next: SubscriptionState) {
        let mut entries = self.entries.write();
        if let Some(sub) = entries.iter_mut().find(|s| s.id == id) {
            if sub.state == SubscriptionState::Closed {
                // Closed is terminal.
                return;
            }
            sub.state = next;
        }
    }
}
