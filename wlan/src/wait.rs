//! Bounded polling with backoff.

/// Time source supplied by the platform.
pub trait Clock {
    /// Monotonic microseconds.
    fn now_us(&self) -> u64;

    /// Sleep (or yield) for about `us` microseconds.
    fn sleep_us(&self, us: u64);
}

/// A wait that gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    /// Time spent waiting (µs).
    pub elapsed_us: u64,
}

/// Poll a condition with short sleeps until it holds or `timeout_us`
/// passes.
///
/// Sleeps start at `step_us` and double up to `max_step_us`. No sleep
/// overshoots the deadline, so the wait returns within `timeout_us` plus
/// one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedWait {
    timeout_us: u64,
    step_us: u64,
    max_step_us: u64,
}

impl BoundedWait {
    pub const fn new(timeout_us: u64, step_us: u64) -> Self {
        let step_us = if step_us == 0 { 1 } else { step_us };
        Self {
            timeout_us,
            step_us,
            max_step_us: step_us * 8,
        }
    }

    pub const fn with_max_step(mut self, max_step_us: u64) -> Self {
        self.max_step_us = if max_step_us < self.step_us {
            self.step_us
        } else {
            max_step_us
        };
        self
    }

    pub fn timeout_us(&self) -> u64 {
        self.timeout_us
    }

    /// Returns the elapsed time once `done` reports true.
    ///
    /// `done` is checked once more after the deadline, so a completion
    /// that landed during the last sleep is not reported as a timeout.
    pub fn until<C: Clock + ?Sized>(
        &self,
        clock: &C,
        mut done: impl FnMut() -> bool,
    ) -> Result<u64, WaitTimeout> {
        let start = clock.now_us();
        let mut step = self.step_us;
        loop {
            if done() {
                return Ok(clock.now_us().saturating_sub(start));
            }
            let elapsed = clock.now_us().saturating_sub(start);
            if elapsed >= self.timeout_us {
                return Err(WaitTimeout {
                    elapsed_us: elapsed,
                });
            }
            clock.sleep_us(step.min(self.timeout_us - elapsed));
            step = (step * 2).min(self.max_step_us);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use std::vec::Vec;

    /// Virtual clock: sleeping advances time.
    struct FakeClock {
        now: Cell<u64>,
        sleeps: core::cell::RefCell<Vec<u64>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Cell::new(0),
                sleeps: core::cell::RefCell::new(Vec::new()),
            }
        }
    }

    impl Clock for FakeClock {
        fn now_us(&self) -> u64 {
            self.now.get()
        }

        fn sleep_us(&self, us: u64) {
            self.sleeps.borrow_mut().push(us);
            self.now.set(self.now.get() + us);
        }
    }

    #[test]
    fn test_immediate_success() {
        let clock = FakeClock::new();
        assert_eq!(BoundedWait::new(1000, 10).until(&clock, || true), Ok(0));
        assert!(clock.sleeps.borrow().is_empty());
    }

    #[test]
    fn test_backoff_and_deadline() {
        let clock = FakeClock::new();
        let wait = BoundedWait::new(100, 10).with_max_step(40);
        let err = wait.until(&clock, || false).unwrap_err();
        assert_eq!(err.elapsed_us, 100);
        // 10, 20, 40, then clamped to the remaining 30.
        assert_eq!(*clock.sleeps.borrow(), [10, 20, 40, 30]);
    }

    #[test]
    fn test_condition_met_after_polls() {
        let clock = FakeClock::new();
        let polls = Cell::new(0);
        let res = BoundedWait::new(1_000, 5).until(&clock, || {
            polls.set(polls.get() + 1);
            polls.get() == 3
        });
        assert_eq!(res, Ok(15));
    }
}
