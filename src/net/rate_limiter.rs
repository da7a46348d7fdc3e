//! Bandwidth control.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Default replenishment granularity of the token buckets.
pub const DEFAULT_TICK: Duration = Duration::from_millis(1);

/// Controls bandwidth usage on one direction of a connection.
///
/// `get_quota` is called before reading / writing and returns the number
/// of bytes the caller may move; `consume_bytes` feeds back what was
/// actually moved. The sum of consumptions after a `get_quota` never
/// exceeds its return value on a single connection; when a limiter is
/// shared between connections, over-consumption is possible (several
/// callers may query quota before any of them consumes) and the
/// implementation must tolerate it.
pub trait RateLimiter: Send {
    /// Maximum number of bytes allowed to read / write right now.
    fn get_quota(&mut self) -> usize;

    /// Feedback of how many bytes were actually read / written.
    fn consume_bytes(&mut self, consumed: usize);
}

/// Token-bucket limiter.
///
/// `burst_quota` caps how much can be moved at once; `quota_per_tick` is
/// replenished every `tick` up to that cap.
pub struct TokenBucketRateLimiter {
    max_quota: usize,
    quota_per_tick: usize,
    tick: Duration,
    over_consumption_allowed: bool,

    started: Instant,
    // Timestamp of the last refill, in ticks since `started`.
    last_refill: u64,
    // Negative when the quota was over-consumed.
    curr_quota: i64,
}

impl TokenBucketRateLimiter {
    pub fn new(
        burst_quota: usize,
        quota_per_tick: usize,
        tick: Duration,
        over_consumption_allowed: bool,
    ) -> TokenBucketRateLimiter {
        assert!(!tick.is_zero());
        TokenBucketRateLimiter {
            max_quota: burst_quota,
            quota_per_tick,
            tick,
            over_consumption_allowed,
            started: Instant::now(),
            last_refill: 0,
            // Start with a full burst.
            curr_quota: burst_quota as i64,
        }
    }
}

impl RateLimiter for TokenBucketRateLimiter {
    fn get_quota(&mut self) -> usize {
        let now = (Instant::now() - self.started).as_nanos() as u64 / self.tick.as_nanos() as u64;
        if now > self.last_refill {
            let refill = (now - self.last_refill).saturating_mul(self.quota_per_tick as u64);
            self.curr_quota = self
                .curr_quota
                .saturating_add(refill.min(i64::MAX as u64) as i64)
                .min(self.max_quota as i64);
            self.last_refill = now;
        }
        self.curr_quota.max(0) as usize
    }

    fn consume_bytes(&mut self, consumed: usize) {
        self.curr_quota -= consumed as i64;
        if !self.over_consumption_allowed && self.curr_quota < 0 {
            self.curr_quota = 0;
        }
    }
}

impl fmt::Debug for TokenBucketRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketRateLimiter")
            .field("max_quota", &self.max_quota)
            .field("quota_per_tick", &self.quota_per_tick)
            .field("curr_quota", &self.curr_quota)
            .finish()
    }
}

/// Serializes access to a limiter so it can be shared by several
/// connections. The wrapped limiter must tolerate over-consumption:
/// multiple callers may call `get_quota` before any of them consumes.
///
/// `burst_limit` caps `get_quota`'s return value, which mitigates
/// over-consumption spikes.
pub struct ThreadSafeRateLimiter {
    burst_limit: usize,
    inner: Mutex<Box<dyn RateLimiter>>,
}

impl ThreadSafeRateLimiter {
    pub fn new(inner: Box<dyn RateLimiter>, burst_limit: usize) -> ThreadSafeRateLimiter {
        ThreadSafeRateLimiter {
            burst_limit,
            inner: Mutex::new(inner),
        }
    }

    /// Shared-reference counterpart of [`RateLimiter::get_quota`].
    pub fn quota(&self) -> usize {
        self.inner.lock().unwrap().get_quota().min(self.burst_limit)
    }

    /// Shared-reference counterpart of [`RateLimiter::consume_bytes`].
    pub fn consume(&self, consumed: usize) {
        self.inner.lock().unwrap().consume_bytes(consumed);
    }
}

impl RateLimiter for ThreadSafeRateLimiter {
    fn get_quota(&mut self) -> usize {
        self.quota()
    }

    fn consume_bytes(&mut self, consumed: usize) {
        self.consume(consumed);
    }
}

/// A shared handle to a thread-safe limiter is itself a limiter. This is
/// what connection options default to: the process-wide rx / tx limiter.
impl RateLimiter for Arc<ThreadSafeRateLimiter> {
    fn get_quota(&mut self) -> usize {
        self.quota()
    }

    fn consume_bytes(&mut self, consumed: usize) {
        self.consume(consumed);
    }
}

impl fmt::Debug for ThreadSafeRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeRateLimiter")
            .field("burst_limit", &self.burst_limit)
            .finish_non_exhaustive()
    }
}

/// Respects both its own limit and an upper layer's.
///
/// Use this to cap a single connection's bandwidth while staying inside a
/// process-wide budget: `get_quota` returns the smaller of the two,
/// `consume_bytes` feeds back to both.
pub struct LayeredRateLimiter {
    upper: Arc<ThreadSafeRateLimiter>,
    ours: Box<dyn RateLimiter>,
}

impl LayeredRateLimiter {
    pub fn new(upper: Arc<ThreadSafeRateLimiter>, ours: Box<dyn RateLimiter>) -> LayeredRateLimiter {
        LayeredRateLimiter { upper, ours }
    }
}

impl RateLimiter for LayeredRateLimiter {
    fn get_quota(&mut self) -> usize {
        self.upper.quota().min(self.ours.get_quota())
    }

    fn consume_bytes(&mut self, consumed: usize) {
        self.upper.consume(consumed);
        self.ours.consume_bytes(consumed);
    }
}

impl fmt::Debug for LayeredRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredRateLimiter").finish_non_exhaustive()
    }
}

/// No limit. Used as the default global limiter when no bandwidth cap is
/// configured.
#[derive(Debug, Default)]
pub struct UnlimitedRateLimiter;

impl RateLimiter for UnlimitedRateLimiter {
    fn get_quota(&mut self) -> usize {
        usize::MAX / 2
    }

    fn consume_bytes(&mut self, _consumed: usize) {}
}

static RX_BANDWIDTH: OnceLock<Option<usize>> = OnceLock::new();
static TX_BANDWIDTH: OnceLock<Option<usize>> = OnceLock::new();
static DEFAULT_RX: OnceLock<Arc<ThreadSafeRateLimiter>> = OnceLock::new();
static DEFAULT_TX: OnceLock<Arc<ThreadSafeRateLimiter>> = OnceLock::new();

/// Caps the process-wide receive bandwidth (bytes per second). Takes
/// effect only if called before the default limiter's first use.
pub fn set_default_rx_bandwidth(bytes_per_second: usize) {
    let _ = RX_BANDWIDTH.set(Some(bytes_per_second));
}

/// Caps the process-wide transmit bandwidth (bytes per second).
pub fn set_default_tx_bandwidth(bytes_per_second: usize) {
    let _ = TX_BANDWIDTH.set(Some(bytes_per_second));
}

/// The process-wide receive limiter. Unlimited unless configured.
pub fn default_rx_rate_limiter() -> Arc<ThreadSafeRateLimiter> {
    Arc::clone(DEFAULT_RX.get_or_init(|| make_default(*RX_BANDWIDTH.get_or_init(|| None))))
}

/// The process-wide transmit limiter. Unlimited unless configured.
pub fn default_tx_rate_limiter() -> Arc<ThreadSafeRateLimiter> {
    Arc::clone(DEFAULT_TX.get_or_init(|| make_default(*TX_BANDWIDTH.get_or_init(|| None))))
}

fn make_default(bytes_per_second: Option<usize>) -> Arc<ThreadSafeRateLimiter> {
    match bytes_per_second {
        Some(bps) => {
            // Allow a 10 ms burst; replenish every tick.
            let per_tick = (bps / (Duration::from_secs(1).as_nanos() / DEFAULT_TICK.as_nanos()) as usize).max(1);
            let burst = (bps / 100).max(per_tick);
            Arc::new(ThreadSafeRateLimiter::new(
                Box::new(TokenBucketRateLimiter::new(burst, per_tick, DEFAULT_TICK, true)),
                burst,
            ))
        }
        None => Arc::new(ThreadSafeRateLimiter::new(
            Box::new(UnlimitedRateLimiter),
            usize::MAX,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_replenishes() {
        let mut limiter =
            TokenBucketRateLimiter::new(1000, 10, Duration::from_millis(1), true);
        assert_eq!(limiter.get_quota(), 1000);
        limiter.consume_bytes(1000);
        assert_eq!(limiter.get_quota(), 0);

        std::thread::sleep(Duration::from_millis(20));
        let quota = limiter.get_quota();
        assert!(quota >= 10, "no replenishment: {}", quota);
        assert!(quota <= 1000);
    }

    #[test]
    fn token_bucket_caps_at_burst() {
        let mut limiter = TokenBucketRateLimiter::new(100, 1000, Duration::from_millis(1), true);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(limiter.get_quota(), 100);
    }

    #[test]
    fn over_consumption_goes_negative() {
        let mut limiter = TokenBucketRateLimiter::new(100, 1, Duration::from_secs(3600), true);
        assert_eq!(limiter.get_quota(), 100);
        limiter.consume_bytes(300);
        // The deficit must be paid off before quota recovers.
        assert_eq!(limiter.get_quota(), 0);
    }

    #[test]
    fn over_consumption_clamped_when_disallowed() {
        let mut limiter = TokenBucketRateLimiter::new(100, 1, Duration::from_secs(3600), false);
        limiter.consume_bytes(300);
        limiter.consume_bytes(50);
        assert_eq!(limiter.get_quota(), 0);
    }

    #[test]
    fn layered_takes_the_minimum() {
        let upper = Arc::new(ThreadSafeRateLimiter::new(
            Box::new(TokenBucketRateLimiter::new(50, 1, Duration::from_secs(3600), true)),
            usize::MAX,
        ));
        let mut layered = LayeredRateLimiter::new(
            Arc::clone(&upper),
            Box::new(TokenBucketRateLimiter::new(80, 1, Duration::from_secs(3600), true)),
        );
        assert_eq!(layered.get_quota(), 50);
        layered.consume_bytes(50);
        assert_eq!(layered.get_quota(), 0);
        // The upper layer saw the consumption too.
        assert_eq!(upper.quota(), 0);
    }

    #[test]
    fn thread_safe_caps_burst() {
        let limiter = ThreadSafeRateLimiter::new(
            Box::new(TokenBucketRateLimiter::new(1000, 1, Duration::from_secs(3600), true)),
            64,
        );
        assert_eq!(limiter.quota(), 64);
    }
}
