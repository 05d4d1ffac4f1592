//! Canonical domain types shared across the gateway.

mod instrument;
mod marketdata;
mod order;

pub use instrument::{AssetClass, Instrument, InstrumentRegistry, RegistryError};
pub use marketdata::{Candle, MarketRecord, Quote, RecordSource, TradeTick};
pub use order::{
    Fill, Order, OrderEvent, OrderEventKind, OrderRequest, OrderStatus, OrderType, Position, Side,
    TimeInForce,
};
