use rand::{rngs, Rng, SeedableRng};
use std::cell::RefCell;
use std::fmt;

/// Generates identifiers for traces and spans.
///
/// The value 0 is reserved to mean "no parent span" and must never be
/// generated.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new non-zero 64-bit id.
    fn generate(&self) -> u64;
}

/// Default [`IdGenerator`] implementation.
///
/// Draws ids from a thread-local generator seeded from OS entropy.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> u64 {
        CURRENT_RNG.with(|rng| {
            let mut rng = rng.borrow_mut();
            loop {
                let id = rng.gen::<u64>();
                if id != 0 {
                    return id;
                }
            }
        })
    }
}

thread_local! {
    /// Store random number generator for each thread
    pub(crate) static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_never_zero() {
        let generator = RandomIdGenerator::default();
        for _ in 0..10_000 {
            assert_ne!(generator.generate(), 0);
        }
    }
}
