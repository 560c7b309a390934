use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket parameters shared by every employer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Tokens added per second
    pub rate_per_sec: f64,
    /// Bucket capacity; at least one token
    pub burst: f64,
}

impl RateLimit {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst: f64::from(burst.max(1)),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(0.2, 2)
    }
}

/// Refill state for one employer
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn full(limit: &RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.burst,
            last_refill: now,
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Whether the bucket will have refilled to its burst by `now`
    pub fn is_full_at(&self, limit: &RateLimit, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * limit.rate_per_sec >= limit.burst
    }

    /// Take one token, or return how long until one will be available
    pub fn try_take(&mut self, limit: &RateLimit, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limit.rate_per_sec).min(limit.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / limit.rate_per_sec))
        }
    }
}

/// Per-employer token buckets, independent of the worker pool size
///
/// A burst of postings from one employer is throttled even while other
/// workers sit idle. Buckets that have refilled to their burst are dropped
/// at most once per refill period; a dropped employer starts from a full bucket.
#[derive(Debug)]
pub struct EmployerRateLimiter {
    limit: RateLimit,
    buckets: Mutex<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    by_employer: HashMap<String, TokenBucket>,
    last_pruned: Instant,
}

impl EmployerRateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            buckets: Mutex::new(Buckets {
                by_employer: HashMap::new(),
                last_pruned: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Number of employers with a partially drained bucket
    pub fn tracked(&self) -> usize {
        self.buckets.lock().by_employer.len()
    }

    /// Time for an empty bucket to refill completely
    fn refill_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.limit.burst / self.limit.rate_per_sec).unwrap_or(Duration::MAX)
    }

    /// Try to take a token for the employer without waiting
    pub fn try_acquire(&self, employer_id: &str) -> Result<(), Duration> {
        self.try_acquire_at(employer_id, Instant::now())
    }

    pub fn try_acquire_at(&self, employer_id: &str, now: Instant) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock();

        if now.saturating_duration_since(buckets.last_pruned) >= self.refill_period() {
            let limit = self.limit;
            buckets.by_employer.retain(|_, bucket| !bucket.is_full_at(&limit, now));
            buckets.last_pruned = now;
        }

        let bucket = buckets
            .by_employer
            .entry(employer_id.to_string())
            .or_insert_with(|| TokenBucket::full(&self.limit, now));
        bucket.try_take(&self.limit, now)
    }

    /// Wait until a token for the employer is available and take it
    pub async fn acquire(&self, employer_id: &str) {
        loop {
            match self.try_acquire(employer_id) {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!("Rate limited on employer {}, waiting {:?}", employer_id, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let limit = RateLimit::new(1.0, 3);
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&limit, now);

        assert!(bucket.try_take(&limit, now).is_ok());
        assert!(bucket.try_take(&limit, now).is_ok());
        assert!(bucket.try_take(&limit, now).is_ok());
        assert!(bucket.try_take(&limit, now).is_err());
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limit = RateLimit::new(2.0, 1);
        let start = Instant::now();
        let mut bucket = TokenBucket::full(&limit, start);

        assert!(bucket.try_take(&limit, start).is_ok());
        let wait = bucket.try_take(&limit, start).unwrap_err();
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-6);

        let later = start + Duration::from_millis(500);
        assert!(bucket.try_take(&limit, later).is_ok());
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let limit = RateLimit::new(10.0, 2);
        let start = Instant::now();
        let mut bucket = TokenBucket::full(&limit, start);
        bucket.try_take(&limit, start).unwrap();

        let much_later = start + Duration::from_secs(60);
        bucket.try_take(&limit, much_later).unwrap();

        assert!((bucket.available() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_employers_have_independent_buckets() {
        let limiter = EmployerRateLimiter::new(RateLimit::new(0.1, 1));

        assert!(limiter.try_acquire("acme").is_ok());
        assert!(limiter.try_acquire("acme").is_err());
        assert!(limiter.try_acquire("globex").is_ok());
    }

    #[test]
    fn test_refilled_buckets_are_dropped() {
        let limiter = EmployerRateLimiter::new(RateLimit::new(1.0, 1));
        let start = Instant::now();

        for i in 0..100 {
            assert!(limiter.try_acquire_at(&format!("employer_{}", i), start).is_ok());
        }
        assert_eq!(limiter.tracked(), 100);

        let later = start + Duration::from_secs(1);
        assert!(limiter.try_acquire_at("acme", later).is_ok());
        assert_eq!(limiter.tracked(), 1);

        // Pruning never hands out extra tokens
        assert!(limiter.try_acquire_at("acme", later + Duration::from_millis(500)).is_err());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = EmployerRateLimiter::new(RateLimit::new(20.0, 1));
        let start = std::time::Instant::now();

        limiter.acquire("acme").await;
        limiter.acquire("acme").await;

        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
