use crate::ids::CURRENT_RNG;
use rand::Rng;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Decides whether a root span (and hence its subtree) should be sampled.
///
/// The tracer consults the sampler only when it creates a root span;
/// non-root spans inherit their parent's decision.
pub trait Sampler: Send + Sync + fmt::Debug {
    /// Returns the sampling decision for the trace with the given id.
    fn sample(&self, id: u64) -> bool;
}

/// A sampler that always returns the same decision.
#[derive(Clone, Copy, Debug)]
pub struct ConstSampler {
    decision: bool,
}

impl ConstSampler {
    pub fn new(decision: bool) -> Self {
        ConstSampler { decision }
    }
}

impl Sampler for ConstSampler {
    fn sample(&self, _id: u64) -> bool {
        self.decision
    }
}

/// A sampler that samples each trace independently with a fixed chance,
/// which should be in `[0, 1]`.
#[derive(Clone, Copy, Debug)]
pub struct ProbabilisticSampler {
    chance: f64,
}

impl ProbabilisticSampler {
    pub fn new(chance: f64) -> Self {
        ProbabilisticSampler { chance }
    }
}

impl Sampler for ProbabilisticSampler {
    fn sample(&self, _id: u64) -> bool {
        CURRENT_RNG.with(|rng| rng.borrow_mut().gen::<f64>()) < self.chance
    }
}

type Clock = Box<dyn Fn() -> Instant + Send + Sync>;

/// Token bucket with capacity `rate`, refilled at `rate` tokens per second.
///
/// Refills happen at whole-millisecond granularity; the timestamp of the
/// last refill only advances when at least one token was added.
struct RateLimiter {
    rate: i64,
    tokens: i64,
    last: Instant,
}

impl RateLimiter {
    fn allow(&mut self, now: Instant) -> bool {
        if let Some(elapsed) = now.checked_duration_since(self.last) {
            let add = (elapsed.as_millis() as f64 / 1000.0 * self.rate as f64) as i64;
            if add > 0 {
                self.tokens = (self.tokens + add).min(self.rate);
                self.last = now;
            }
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// A sampler that samples up to `rate` traces per second.
pub struct RateSampler {
    limiter: Mutex<RateLimiter>,
    clock: Clock,
}

impl RateSampler {
    pub fn new(rate: u32) -> Self {
        Self::with_clock(rate, Box::new(Instant::now))
    }

    /// Like [`RateSampler::new`], but reads time from `clock`.
    pub fn with_clock(rate: u32, clock: Clock) -> Self {
        let rate = i64::from(rate);
        // The first refill window opens one second from now; the bucket
        // starts full.
        let last = clock() + Duration::from_secs(1);
        RateSampler {
            limiter: Mutex::new(RateLimiter {
                rate,
                tokens: rate,
                last,
            }),
            clock,
        }
    }
}

impl Sampler for RateSampler {
    fn sample(&self, _id: u64) -> bool {
        let now = (self.clock)();
        let mut limiter = match self.limiter.lock() {
            Ok(limiter) => limiter,
            Err(poisoned) => poisoned.into_inner(),
        };
        limiter.allow(now)
    }
}

impl fmt::Debug for RateSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateSampler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn const_sampler_returns_its_decision() {
        assert!(ConstSampler::new(true).sample(1));
        assert!(ConstSampler::new(true).sample(2));
        assert!(!ConstSampler::new(false).sample(1));
        assert!(!ConstSampler::new(false).sample(2));
    }

    #[test]
    fn probabilistic_sampler_extremes() {
        let never = ProbabilisticSampler::new(0.0);
        let always = ProbabilisticSampler::new(1.0);
        for id in 0..10_000 {
            assert!(!never.sample(id));
            assert!(always.sample(id));
        }
    }

    #[test]
    fn probabilistic_sampler_quartile() {
        const DRAWS: u32 = 1_000_000;
        let sampler = ProbabilisticSampler::new(0.25);
        let mut sampled = 0u32;
        for id in 0..DRAWS {
            if sampler.sample(u64::from(id)) {
                sampled += 1;
            }
        }
        let ratio = f64::from(sampled) / f64::from(DRAWS);
        assert!((ratio - 0.25).abs() < 0.01, "sampled ratio {ratio}");
    }

    fn fake_clock() -> (Arc<AtomicU64>, Clock) {
        let base = Instant::now();
        let offset_ms = Arc::new(AtomicU64::new(0));
        let handle = offset_ms.clone();
        let clock = Box::new(move || base + Duration::from_millis(handle.load(Ordering::Relaxed)));
        (offset_ms, clock)
    }

    #[test]
    fn rate_sampler_caps_each_window() {
        let (offset_ms, clock) = fake_clock();
        let sampler = RateSampler::with_clock(1000, clock);

        let first: usize = (0..5000).filter(|_| sampler.sample(0)).count();
        assert_eq!(first, 1000);

        // Two seconds in, the bucket has been refilled to capacity exactly
        // once.
        offset_ms.store(2000, Ordering::Relaxed);
        let second: usize = (0..5000).filter(|_| sampler.sample(0)).count();
        assert_eq!(second, 1000);
    }

    #[test]
    fn rate_sampler_does_not_refill_within_the_first_window() {
        let (offset_ms, clock) = fake_clock();
        let sampler = RateSampler::with_clock(10, clock);

        assert_eq!((0..100).filter(|_| sampler.sample(0)).count(), 10);
        offset_ms.store(500, Ordering::Relaxed);
        assert!(!sampler.sample(0));
    }
}
