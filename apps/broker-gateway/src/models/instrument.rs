//! Broker-agnostic instrument identification.
//!
//! An [`Instrument`] carries one canonical symbol plus the per-broker
//! symbol mappings needed to talk to each backend. Instruments are
//! immutable once registered.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::brokers::BrokerKind;

/// Asset class of a tradable instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetClass {
    /// Spot foreign exchange.
    Fx,
    /// Listed equity.
    Equity,
    /// Equity or index option.
    Option,
    /// Exchange-traded future.
    Future,
}

/// A tradable symbol normalized across brokers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// Canonical symbol, e.g. `EURUSD`.
    pub symbol: String,
    /// Asset class.
    pub asset_class: AssetClass,
    /// Exchange or venue identifier.
    pub venue: String,
    /// Broker-specific symbol per backend, e.g. `EUR_USD` for Oanda.
    pub broker_symbols: HashMap<BrokerKind, String>,
}

impl Instrument {
    /// Create an instrument with no broker mappings yet.
    #[must_use]
    pub fn new(symbol: impl Into<String>, asset_class: AssetClass, venue: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            asset_class,
            venue: venue.into(),
            broker_symbols: HashMap::new(),
        }
    }

    /// Add a broker-specific symbol mapping (builder style).
    #[must_use]
    pub fn with_broker_symbol(mut self, broker: BrokerKind, symbol: impl Into<String>) -> Self {
        self.broker_symbols.insert(broker, symbol.into());
        self
    }

    /// Resolve the symbol used by a given broker.
    ///
    /// Falls back to the canonical symbol when no mapping is registered.
    #[must_use]
    pub fn symbol_for(&self, broker: BrokerKind) -> &str {
        self.broker_symbols
            .get(&broker)
            .map_or(self.symbol.as_str(), String::as_str)
    }
}

/// Errors from the instrument registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The symbol is already registered; instruments are immutable.
    #[error("instrument already registered: {symbol}")]
    AlreadyRegistered {
        /// Canonical symbol that collided.
        symbol: String,
    },
    /// Lookup for an unknown symbol.
    #[error("unknown instrument: {symbol}")]
    Unknown {
        /// Canonical symbol that was requested.
        symbol: String,
    },
}

/// Thread-safe registry of instruments, immutable once registered.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    instruments: RwLock<HashMap<String, Arc<Instrument>>>,
}

impl InstrumentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the canonical
    /// symbol is taken; registered instruments are never replaced.
    pub fn register(&self, instrument: Instrument) -> Result<Arc<Instrument>, RegistryError> {
        let mut instruments = self.instruments.write();
        if instruments.contains_key(&instrument.symbol) {
            return Err(RegistryError::AlreadyRegistered {
                symbol: instrument.symbol,
            });
        }
        let arc = Arc::new(instrument);
        instruments.insert(arc.symbol.clone(), Arc::clone(&arc));
        Ok(arc)
    }

    /// Look up an instrument by canonical symbol.
    pub fn get(&self, symbol: &str) -> Result<Arc<Instrument>, RegistryError> {
        self.instruments
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown {
                symbol: symbol.to_string(),
            })
    }

    /// Reverse-lookup by the symbol a broker uses on the wire.
    #[must_use]
    pub fn resolve_broker_symbol(&self, broker: BrokerKind, broker_symbol: &str) -> Option<Arc<Instrument>> {
        self.instruments
            .read()
            .values()
            .find(|i| i.symbol_for(broker) == broker_symbol)
            .cloned()
    }

    /// Number of registered instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }
}
