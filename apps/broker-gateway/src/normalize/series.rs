//! Canonical per-instrument time series with live/historic merge.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::NormalizerConfig;
use crate::models::{Candle, MarketRecord};

/// Why an ingested record was not surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A confirmed record already exists for this timestamp.
    DuplicateConfirmed,
    /// A provisional record arrived after its confirmation.
    SupersededByConfirmed,
    /// Tick at or before the last accepted tick timestamp.
    StaleTick,
    /// Non-positive price or inverted high/low.
    OutOfRange,
}

/// Result of merging one record into the series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New record; surface it to consumers.
    Emit(MarketRecord),
    /// Confirmation that changed an earlier provisional emission;
    /// surface the corrected, non-provisional record.
    Correct(MarketRecord),
    /// Confirmation matching the earlier provisional emission; the
    /// series is updated but nothing new is surfaced.
    Confirm,
    /// Dropped; logged, never fabricated or surfaced.
    Drop(DropReason),
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeriesStats {
    /// Records surfaced to consumers.
    pub emitted: u64,
    /// Corrections surfaced to consumers.
    pub corrected: u64,
    /// Confirmations applied silently.
    pub confirmed_in_place: u64,
    /// Records dropped.
    pub dropped: u64,
}

/// Read-only view over the confirmed portion of one instrument's
/// series, for external pricing and volatility consumers.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    /// Canonical instrument symbol.
    pub instrument: String,
    /// Inclusive start of the requested range.
    pub from: DateTime<Utc>,
    /// Exclusive end of the requested range.
    pub to: DateTime<Utc>,
    /// Confirmed candles in `[from, to)`, ordered by timestamp.
    pub candles: Vec<Candle>,
    /// When the view was taken.
    pub taken_at: DateTime<Utc>,
}

/// Ordered canonical series for one instrument.
///
/// Candles are keyed by timestamp; the canonical record for a given
/// (instrument, timestamp) is the most recently *confirmed* one.
/// A live record is provisional until confirmed but is still emitted
/// immediately, so consumers may see a provisional record followed by
/// at most one correction.
#[derive(Debug)]
pub struct CanonicalSeries {
    instrument: String,
    config: NormalizerConfig,
    candles: BTreeMap<DateTime<Utc>, Candle>,
    last_tick_at: Option<DateTime<Utc>>,
    stats: SeriesStats,
}

impl CanonicalSeries {
    /// Create an empty series for one instrument.
    #[must_use]
    pub fn new(instrument: impl Into<String>, config: NormalizerConfig) -> Self {
        Self {
            instrument: instrument.into(),
            config,
            candles: BTreeMap::new(),
            last_tick_at: None,
            stats: SeriesStats::default(),
        }
    }

    /// Merge one canonical record into the series.
    pub fn ingest(&mut self, record: MarketRecord) -> MergeOutcome {
        let outcome = match record {
            MarketRecord::Candle(candle) => self.ingest_candle(candle),
            tick @ (MarketRecord::Quote(_) | MarketRecord::Trade(_)) => self.ingest_tick(tick),
        };
        match &outcome {
            MergeOutcome::Emit(_) => self.stats.emitted += 1,
            MergeOutcome::Correct(_) => self.stats.corrected += 1,
            MergeOutcome::Confirm => self.stats.confirmed_in_place += 1,
            MergeOutcome::Drop(reason) => {
                self.stats.dropped += 1;
                tracing::warn!(
                    instrument = %self.instrument,
                    reason = ?reason,
                    "dropped market record"
                );
            }
        }
        outcome
    }

    /// Promote provisional candles older than the confirmation grace
    /// window to final; no confirming fetch is coming for them.
    pub fn expire_provisional(&mut self, now: DateTime<Utc>) -> usize {
        let Ok(grace) = chrono::Duration::from_std(self.config.confirmation_grace) else {
            return 0;
        };
        let cutoff = now - grace;
        let mut promoted = 0;
        for candle in self.candles.values_mut() {
            if candle.provisional && candle.timestamp < cutoff {
                candle.provisional = false;
                promoted += 1;
            }
        }
        if promoted > 0 {
            tracing::debug!(
                instrument = %self.instrument,
                promoted,
                "promoted provisional candles past grace window"
            );
        }
        promoted
    }

    /// Confirmed candles in `[from, to)`, ordered by timestamp.
    #[must_use]
    pub fn confirmed_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Candle> {
        self.candles
            .range(from..to)
            .filter(|(_, c)| !c.provisional)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Confirmed-only view of `[from, to)`. Provisional candles are
    /// excluded; they may still change.
    #[must_use]
    pub fn snapshot(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            instrument: self.instrument.clone(),
            from,
            to,
            candles: self.confirmed_range(from, to),
            taken_at: Utc::now(),
        }
    }

    /// All candles, confirmed or provisional, ordered by timestamp.
    #[must_use]
    pub fn candles(&self) -> Vec<Candle> {
        self.candles.values().cloned().collect()
    }

    /// Timestamp of the newest record seen on any channel; the gap to
    /// backfill after a reconnect starts here.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        let last_candle = self.candles.keys().next_back().copied();
        match (last_candle, self.last_tick_at) {
            (Some(c), Some(t)) => Some(c.max(t)),
            (Some(c), None) => Some(c),
            (None, t) => t,
        }
    }

    /// Merge counters.
    #[must_use]
    pub const fn stats(&self) -> SeriesStats {
        self.stats
    }

    fn ingest_candle(&mut self, candle: Candle) -> MergeOutcome {
        if candle.open <= Decimal::ZERO
            || candle.high <= Decimal::ZERO
            || candle.low <= Decimal::ZERO
            || candle.close <= Decimal::ZERO
            || candle.high < candle.low
        {
            return MergeOutcome::Drop(DropReason::OutOfRange);
        }

        match self.candles.get(&candle.timestamp) {
            None => {
                self.candles.insert(candle.timestamp, candle.clone());
                MergeOutcome::Emit(MarketRecord::Candle(candle))
            }
            Some(existing) if existing.provisional => {
                if candle.provisional {
                    // Live update to a still-open interval; latest wins.
                    self.candles.insert(candle.timestamp, candle.clone());
                    MergeOutcome::Emit(MarketRecord::Candle(candle))
                } else if existing.same_values(&candle) {
                    // Confirmation agrees with what was already emitted.
                    self.candles.insert(candle.timestamp, candle);
                    MergeOutcome::Confirm
                } else {
                    self.candles.insert(candle.timestamp, candle.clone());
                    MergeOutcome::Correct(MarketRecord::Candle(candle))
                }
            }
            Some(_) => {
                if candle.provisional {
                    MergeOutcome::Drop(DropReason::SupersededByConfirmed)
                } else {
                    MergeOutcome::Drop(DropReason::DuplicateConfirmed)
                }
            }
        }
    }

    fn ingest_tick(&mut self, tick: MarketRecord) -> MergeOutcome {
        let timestamp = tick.timestamp();
        if let Some(last) = self.last_tick_at {
            if timestamp <= last {
                return MergeOutcome::Drop(DropReason::StaleTick);
            }
        }
        self.last_tick_at = Some(timestamp);
        MergeOutcome::Emit(tick)
    }
}
