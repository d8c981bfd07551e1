//! Utilities for adding a bit of jitter to reduce stampeding

use authkeep_clock::UnixTime;

/// A type that provides some jittering of time
///
/// Used to spread proactive refreshes of the same token across the
/// processes sharing a cache.
pub trait JitterSource: Send + Sync {
    /// Jitters a given input time
    fn jitter(&self, time: UnixTime) -> UnixTime;
}

/// A jitter source that does not do any jittering of time
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&self, time: UnixTime) -> UnixTime {
        time
    }
}

#[cfg(feature = "rand")]
mod random {
    use std::sync::{Mutex, PoisonError};

    use authkeep_clock::{DurationSecs, UnixTime};
    use rand::{Rng, SeedableRng};

    /// The default window for [`RandomEarlyJitter`]
    pub const DEFAULT_MAX_JITTER: DurationSecs = DurationSecs(300);

    /// Jitters a value earlier by a random amount
    ///
    /// Times jittered by this type will have a value with a uniform distribution
    /// in the interval `(time - max_jitter, time]`.
    #[derive(Debug)]
    pub struct RandomEarlyJitter<R> {
        max_jitter: DurationSecs,
        rand_source: Mutex<R>,
    }

    impl RandomEarlyJitter<rand::rngs::StdRng> {
        /// Constructs a new instance that will jitter times early up to `max_jitter`.
        pub fn new(max_jitter: DurationSecs) -> Self {
            Self::with_rng(max_jitter, rand::rngs::StdRng::from_entropy())
        }
    }

    impl Default for RandomEarlyJitter<rand::rngs::StdRng> {
        fn default() -> Self {
            Self::new(DEFAULT_MAX_JITTER)
        }
    }

    impl<R: Rng> RandomEarlyJitter<R> {
        /// Constructs a new instance drawing from `rng`
        pub fn with_rng(max_jitter: DurationSecs, rng: R) -> Self {
            Self {
                max_jitter,
                rand_source: Mutex::new(rng),
            }
        }
    }

    impl<R: Rng + Send> super::JitterSource for RandomEarlyJitter<R> {
        fn jitter(&self, time: UnixTime) -> UnixTime {
            if self.max_jitter.0 == 0 {
                return time;
            }
            let jitter = self
                .rand_source
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_range(0..(self.max_jitter.0));
            time - DurationSecs(jitter)
        }
    }
}

#[cfg(feature = "rand")]
pub use random::{RandomEarlyJitter, DEFAULT_MAX_JITTER};
