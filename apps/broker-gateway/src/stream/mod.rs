//! Streaming connection management.
//!
//! One supervisor per client owns the connection lifecycle:
//! `Disconnected → Connecting → Connected`, degrading on missed
//! heartbeats or read errors, and reconnecting with jittered
//! exponential backoff. Subscriptions survive reconnects and are
//! replayed in their original order.

mod backoff;
mod heartbeat;
mod subscription;
mod supervisor;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use subscription::{ChannelKind, Subscription, SubscriptionBook, SubscriptionState};
pub use supervisor::{
    ConnectionState, GapBackfill, StreamCommand, StreamEvent, StreamSupervisor,
};
