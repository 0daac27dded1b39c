use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::*;
use std::net::IpAddr;
use std::num::NonZeroU32;


/// Sustained requests per second allowed for one client IP.
pub const REQUESTS_PER_SECOND: NonZeroU32 = nonzero!(10u32);
/// Requests one client IP may send in a single burst.
pub const BURST: NonZeroU32 = nonzero!(20u32);

type KeyedLimiter<C> =
    RateLimiter<IpAddr, DashMapStateStore<IpAddr>, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// One token bucket per client IP, created on first use.
///
/// Buckets live for the whole process. That is fine for a small, mostly
/// static client population and grows without bound otherwise.
pub struct RateLimiterRegistry<C: Clock = DefaultClock> {
    limiter: KeyedLimiter<C>,
}

impl RateLimiterRegistry<DefaultClock> {
    pub fn new(rps: NonZeroU32, burst: NonZeroU32) -> Self {
        tracing::info!("Rate limiting enabled: {} RPS, burst {}", rps, burst);
        Self::with_clock(rps, burst, &DefaultClock::default())
    }
}

impl Default for RateLimiterRegistry<DefaultClock> {
    fn default() -> Self {
        Self::new(REQUESTS_PER_SECOND, BURST)
    }
}

impl<C: Clock> RateLimiterRegistry<C> {
    pub fn with_clock(rps: NonZeroU32, burst: NonZeroU32, clock: &C) -> Self {
        let quota = Quota::per_second(rps).allow_burst(burst);
        Self {
            limiter: RateLimiter::new(quota, DashMapStateStore::default(), clock),
        }
    }

    /// Takes one token from `ip`'s bucket; false means the request must be
    /// rejected.
    pub fn allow(&self, ip: IpAddr) -> bool {
        match self.limiter.check_key(&ip) {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(client = %ip, "Rate limit exceeded for client");
                false
            }
        }
    }

    /// Number of client buckets created so far.
    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}
