//! Random bit sources feeding the geometric random values of new traces.

use std::fmt;
use std::sync::Mutex;

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};

use crate::trace_state::MAX_DRAWN_GEOMETRIC_RANDOM_VALUE;

/// A source of fair random bits consumed by the consistent samplers.
pub trait RandomBitSource: Send + Sync + fmt::Debug {
    /// Returns the next random bit.
    fn next_bit(&self) -> bool;

    /// Draws a geometric random value in `[1, 62]`: the number of fair coin
    /// flips up to and including the first tail, capped at 62.
    fn geometric_random_value(&self) -> u8 {
        let mut count = 1;
        while count < MAX_DRAWN_GEOMETRIC_RANDOM_VALUE && self.next_bit() {
            count += 1;
        }
        count
    }
}

/// Random bits drawn from the thread-local generator of [`rand`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLocalRandomBits;

impl RandomBitSource for ThreadLocalRandomBits {
    fn next_bit(&self) -> bool {
        rand::rng().random()
    }
}

/// A seedable random bit source producing the same sequence for the same seed.
///
/// The generator sits behind a mutex, so a single instance is meant for
/// deterministic tests rather than contended hot paths. Use [`split`] to hand
/// independent, still reproducible, generators to other owners.
///
/// [`split`]: SeededRandomBits::split
pub struct SeededRandomBits {
    rng: Mutex<StdRng>,
}

impl SeededRandomBits {
    /// Creates a source seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        SeededRandomBits {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Derives a new generator from this one.
    ///
    /// The child is seeded from the parent's stream, so splitting the same
    /// parent in the same order always yields the same children.
    pub fn split(&self) -> Self {
        let seed = self.with_rng(|rng| rng.next_u64());
        SeededRandomBits::new(seed)
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        // a poisoned lock still holds a usable generator
        let mut guard = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl RandomBitSource for SeededRandomBits {
    fn next_bit(&self) -> bool {
        self.with_rng(|rng| rng.random())
    }
}

impl fmt::Debug for SeededRandomBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededRandomBits").finish_non_exhaustive()
    }
}
