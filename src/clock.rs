/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Time source abstraction so every timed component can be tested with a
//! simulated clock.

use std::time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic time in seconds from an arbitrary origin.
    fn monotonic_time(&self) -> f64;

    /// Blocks the calling thread for about `seconds`.
    fn sleep(&self, seconds: f64);
}

/// The real wall clock.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A clock that only moves when told to.  `sleep` advances it so timed
    /// loops make progress deterministically under test.
    pub struct SimulatedClock {
        time: Mutex<f64>,
    }

    impl SimulatedClock {
        pub fn new() -> Self {
            Self {
                time: Mutex::new(0.0),
            }
        }

        pub fn advance(&self, seconds: f64) {
            *self.time.lock().unwrap() += seconds;
        }
    }

    impl Clock for SimulatedClock {
        fn monotonic_time(&self) -> f64 {
            *self.time.lock().unwrap()
        }

        fn sleep(&self, seconds: f64) {
            self.advance(seconds);
        }
    }
}
