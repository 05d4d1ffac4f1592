//! Market data normalization.
//!
//! Broker bindings convert raw payloads into canonical records
//! deterministically; this module owns the merge of live stream and
//! historic backfill into one canonical series per instrument, with no
//! gaps and no duplicates in the confirmed set.

mod series;

pub use series::{CanonicalSeries, DropReason, MarketSnapshot, MergeOutcome, SeriesStats};

use std::time::Duration;

/// Errors from payload normalization.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// Payload could not be parsed as the broker's documented format.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A required field was missing.
    #[error("missing field `{field}` in {context}")]
    MissingField {
        /// Field name.
        field: String,
        /// Payload context, e.g. the message type.
        context: String,
    },

    /// A field value was out of range (negative price, bad timestamp).
    #[error("out-of-range value for `{field}`: {value}")]
    OutOfRange {
        /// Field name.
        field: String,
        /// Offending value, rendered.
        value: String,
    },
}

/// Configuration for the normalizer.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// How long a live record stays provisional before it is treated
    /// as final without a confirming historic fetch.
    pub confirmation_grace: Duration,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            confirmation_grace: Duration::from_secs(300),
        }
    }
}
