// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Broker Gateway - Unified Streaming and Execution Client
//!
//! One client abstraction over heterogeneous brokerage backends
//! (Oanda v20, TastyTrade, CME futures via dxLink). Callers work with
//! canonical instruments, market records, and orders; broker selection
//! happens once at construction and never leaks into calling code.
//!
//! # Architecture
//!
//! - **models**: canonical vocabulary - instruments, market records,
//!   orders, positions
//! - **transport**: per-broker HTTP + websocket adapter (auth, TLS,
//!   timeouts; no retries)
//! - **rate**: token-bucket governor per endpoint class, FIFO grants
//! - **stream**: reconnection supervisor, heartbeat monitor, backoff,
//!   subscription book
//! - **normalize**: canonical series merge of live and historic data,
//!   provisional/confirmed lifecycle
//! - **execution**: order state machine, fill deduplication,
//!   ambiguous-submission reconciliation
//! - **brokers**: the per-backend capability set (request builders and
//!   payload parsers)
//! - **client**: the facade that wires it all together

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod brokers;
pub mod client;
pub mod config;
pub mod execution;
pub mod models;
pub mod normalize;
pub mod observability;
pub mod rate;
pub mod stream;
pub mod transport;

pub use brokers::BrokerKind;
pub use client::{ClientError, ClientEvent, UnifiedClient};
pub use config::{BrokerConfig, Credentials};
pub use models::{
    AssetClass, Candle, Instrument, InstrumentRegistry, MarketRecord, Order, OrderRequest,
    OrderStatus, OrderType, Position, Quote, RecordSource, Side, TimeInForce, TradeTick,
};
pub use normalize::MarketSnapshot;
pub use rate::{EndpointClass, RateLimit, RatePolicy};
pub use stream::{BackoffConfig, ChannelKind, ConnectionState, HeartbeatConfig};
