use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::LimiterConfig;

/// Broker API operations with their token costs. Order placement and
/// history calls weigh more than read-only calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOperation {
    Login,
    Margins,
    Positions,
    Orders,
    PlaceOrder,
    CancelOrder,
    Logout,
}

impl ApiOperation {
    pub fn cost(&self) -> f64 {
        match self {
            ApiOperation::PlaceOrder | ApiOperation::CancelOrder | ApiOperation::Orders => 2.0,
            _ => 1.0,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket gate for outbound broker calls.
///
/// `consume` reserves its cost even when the bucket is short, so concurrent
/// callers each learn a wait that accounts for everyone queued ahead of them.
/// The balance is clamped to `capacity` on every lazy refill. The limiter
/// never rejects a call, it only delays it.
pub struct RateBucket {
    capacity: f64,
    rate: f64,
    max_wait: Duration,
    state: Mutex<BucketState>,
}

// Fallbacks for nonsensical limiter settings, matching the config defaults.
const FALLBACK_RATE: f64 = 3.0;
const FALLBACK_CAPACITY: f64 = 10.0;

/// Seconds value safe to hand to `Duration::from_secs_f64`, which panics on
/// negative or non-finite input.
pub(crate) fn sanitize_secs(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        warn!(value, "Invalid duration setting, using default");
        fallback
    }
}

impl RateBucket {
    /// A rate or capacity that is zero, negative, or non-finite would make
    /// the wait arithmetic meaningless (division by the rate), so such
    /// values are replaced with the defaults at construction.
    pub fn new(rate: f64, capacity: f64) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            warn!(rate, "Invalid refill rate, using default");
            FALLBACK_RATE
        };
        let capacity = if capacity.is_finite() && capacity > 0.0 {
            capacity
        } else {
            warn!(capacity, "Invalid bucket capacity, using default");
            FALLBACK_CAPACITY
        };

        Self {
            capacity,
            rate,
            max_wait: Duration::from_secs(30),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(cfg: &LimiterConfig) -> Self {
        let mut bucket = Self::new(cfg.rate, cfg.capacity);
        bucket.max_wait = Duration::from_secs_f64(sanitize_secs(cfg.max_wait_secs, 30.0));
        bucket
    }

    /// Consume `cost` tokens. Returns the time the caller must wait before
    /// the call may proceed; zero when the bucket covered the cost outright.
    pub fn consume(&self, cost: f64) -> Duration {
        let mut state = self.state.lock();

        // Lazy refill, clamped to capacity
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;

        if cost <= state.tokens {
            state.tokens -= cost;
            Duration::ZERO
        } else {
            let wait = (cost - state.tokens) / self.rate;
            state.tokens -= cost;
            Duration::from_secs_f64(wait)
        }
    }

    /// Consume tokens, sleeping out the computed wait. The sleep is capped at
    /// the configured maximum so a mis-sized burst cannot stall a handler
    /// indefinitely.
    pub async fn acquire(&self, cost: f64) {
        let wait = self.consume(cost);
        if wait > Duration::ZERO {
            let capped = wait.min(self.max_wait);
            if capped < wait {
                warn!(
                    computed_ms = wait.as_millis() as u64,
                    capped_ms = capped.as_millis() as u64,
                    "Rate limit wait exceeds cap, proceeding after capped sleep"
                );
            } else {
                debug!(wait_ms = wait.as_millis() as u64, "Rate limiting outbound call");
            }
            crate::metrics::RATE_LIMIT_WAITS.inc();
            sleep(capped).await;
        }
    }

    #[cfg(test)]
    fn balance(&self) -> f64 {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_costs() {
        assert_eq!(ApiOperation::PlaceOrder.cost(), 2.0);
        assert_eq!(ApiOperation::Orders.cost(), 2.0);
        assert_eq!(ApiOperation::Margins.cost(), 1.0);
        assert_eq!(ApiOperation::Login.cost(), 1.0);
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let bucket = RateBucket::new(100.0, 5.0);
        assert_eq!(bucket.consume(5.0), Duration::ZERO);

        // Refill far longer than needed to hit the cap
        std::thread::sleep(Duration::from_millis(200));
        assert!(bucket.balance() <= 5.0);
        assert!(bucket.balance() > 4.0);
    }

    #[test]
    fn test_wait_time_formula() {
        let bucket = RateBucket::new(2.0, 1.0);
        assert_eq!(bucket.consume(1.0), Duration::ZERO);

        // Bucket empty: (1 - ~0) / 2 tokens/s ~= 0.5 s
        let wait = bucket.consume(1.0);
        assert!(wait.as_secs_f64() > 0.4 && wait.as_secs_f64() <= 0.5);
    }

    #[test]
    fn test_repeated_consume_waits_grow() {
        let bucket = RateBucket::new(2.0, 1.0);
        bucket.consume(1.0);
        let first = bucket.consume(1.0);
        let second = bucket.consume(1.0);
        assert!(second > first, "queued consumers must see growing waits");
    }

    #[test]
    fn test_zero_rate_never_yields_an_unbounded_wait() {
        // SCANNER_LIMITER__RATE=0 must not poison the wait arithmetic
        let bucket = RateBucket::new(0.0, 1.0);
        assert_eq!(bucket.consume(1.0), Duration::ZERO);
        let wait = bucket.consume(1.0);
        assert!(wait.as_secs_f64().is_finite());
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn test_degenerate_limiter_config_falls_back() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let bucket = RateBucket::new(bad, bad);
            assert_eq!(bucket.rate, FALLBACK_RATE);
            assert_eq!(bucket.capacity, FALLBACK_CAPACITY);
        }
    }

    #[tokio::test]
    async fn test_acquire_sleeps() {
        let bucket = RateBucket::new(10.0, 1.0);
        bucket.acquire(1.0).await;

        let start = Instant::now();
        bucket.acquire(1.0).await; // ~100 ms refill needed
        assert!(start.elapsed().as_millis() >= 80);
    }

    #[tokio::test]
    async fn test_acquire_wait_is_capped() {
        let cfg = LimiterConfig {
            rate: 0.5,
            capacity: 1.0,
            max_wait_secs: 0.05,
            violation_backoff_secs: 1.0,
        };
        let bucket = RateBucket::from_config(&cfg);
        bucket.acquire(1.0).await;

        let start = Instant::now();
        bucket.acquire(1.0).await; // uncapped wait would be 2 s
        assert!(start.elapsed().as_millis() < 500);
    }
}
