//! Rate governor: token-bucket limiting per endpoint class.
//!
//! Each broker publishes separate limits for market-data, order, and
//! account endpoints, so buckets are keyed by [`EndpointClass`].
//! Grants are issued in request order: callers queue on a fair async
//! mutex, so a caller admitted later can never overtake one admitted
//! earlier.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Class of broker endpoint for rate-limiting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Historic candles, quotes, instrument metadata.
    MarketData,
    /// Order submission, amendment, cancellation.
    Orders,
    /// Account state: positions, balances, order status.
    Account,
    /// Stream control (subscribe handshakes over REST, where used).
    Streaming,
}

/// Behavior when the bucket has insufficient tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePolicy {
    /// Queue the caller until tokens refill (FIFO).
    #[default]
    Blocking,
    /// Fail immediately with the required wait.
    Rejecting,
}

/// Configured limit for one endpoint class.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Tokens added per second.
    pub refill_per_sec: f64,
    /// Maximum token balance (burst capacity).
    pub burst: f64,
    /// Blocking or rejecting mode.
    pub policy: RatePolicy,
}

impl RateLimit {
    /// A blocking limit of `refill_per_sec` with the given burst.
    #[must_use]
    pub const fn blocking(refill_per_sec: f64, burst: f64) -> Self {
        Self {
            refill_per_sec,
            burst,
            policy: RatePolicy::Blocking,
        }
    }

    /// A rejecting limit of `refill_per_sec` with the given burst.
    #[must_use]
    pub const fn rejecting(refill_per_sec: f64, burst: f64) -> Self {
        Self {
            refill_per_sec,
            burst,
            policy: RatePolicy::Rejecting,
        }
    }
}

/// Errors from the rate governor.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RateError {
    /// Rejecting mode and the bucket is empty.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateExceeded {
        /// Time until enough tokens will have refilled.
        retry_after: Duration,
    },
    /// The requested cost can never be satisfied by this bucket.
    #[error("cost {cost} exceeds burst capacity {burst}")]
    CostExceedsBurst {
        /// Requested token cost.
        cost: f64,
        /// Configured burst capacity.
        burst: f64,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct Bucket {
    limit: RateLimit,
    // tokio's Mutex wakes waiters in FIFO order, which is what gives
    // the governor its request-order grant guarantee.
    state: Mutex<BucketState>,
}

impl Bucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: limit.burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.limit.refill_per_sec).min(self.limit.burst);
        state.last_refill = now;
    }

    async fn acquire(&self, cost: f64) -> Result<(), RateError> {
        if cost > self.limit.burst {
            return Err(RateError::CostExceedsBurst {
                cost,
                burst: self.limit.burst,
            });
        }

        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());

        if state.tokens >= cost {
            state.tokens -= cost;
            return Ok(());
        }

        let deficit = cost - state.tokens;
        let wait = Duration::from_secs_f64(deficit / self.limit.refill_per_sec);

        match self.limit.policy {
            RatePolicy::Rejecting => Err(RateError::RateExceeded { retry_after: wait }),
            RatePolicy::Blocking => {
                // Sleep while holding the lock so queued callers behind
                // us keep their FIFO position.
                tokio::time::sleep(wait).await;
                self.refill(&mut state, Instant::now());
                state.tokens = (state.tokens - cost).max(0.0);
                Ok(())
            }
        }
    }
}

/// Token-bucket limiter over all endpoint classes of one broker.
#[derive(Debug)]
pub struct RateGovernor {
    buckets: HashMap<EndpointClass, Bucket>,
}

impl RateGovernor {
    /// Build a governor from per-class limits. Classes without a
    /// configured limit are unmetered.
    #[must_use]
    pub fn new(limits: HashMap<EndpointClass, RateLimit>) -> Self {
        let buckets = limits
            .into_iter()
            .map(|(class, limit)| (class, Bucket::new(limit)))
            .collect();
        Self { buckets }
    }

    /// Acquire `cost` tokens for an endpoint class.
    ///
    /// Blocking buckets queue the caller FIFO until the tokens refill;
    /// rejecting buckets fail immediately with the required wait.
    ///
    /// # Errors
    ///
    /// [`RateError::RateExceeded`] in rejecting mode,
    /// [`RateError::CostExceedsBurst`] when the cost can never fit.
    pub async fn acquire(&self, class: EndpointClass, cost: f64) -> Result<(), RateError> {
        match self.buckets.get(&class) {
            Some(bucket) => bucket.acquire(cost).await,
            None => Ok(()),
        }
    }
}
