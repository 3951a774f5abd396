//! Time sources for station actors.
//!
//! Every real-time delay in the simulation (airtime, cadence waits, backoff)
//! goes through a `Clock` so it can be swapped:
//! - `EmbassyClock` follows the global embassy time driver, which the binary
//!   scales to run faster or slower than wall-clock time.
//! - `VirtualClock` never waits on the host. Time only moves when every sleeper
//!   is stuck, and then jumps straight to the earliest deadline, so tests are
//!   deterministic and finish immediately.

use core::cell::{Cell, RefCell};
use embassy_futures::yield_now;
use embassy_time::{Duration, Instant, Timer};

#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    /// Called by stations whenever they hand a message to, or take one from, a channel.
    fn mark_activity(&self) {}
}

/// Clock backed by `embassy_time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        Timer::after(duration).await;
    }
}

/// Polls the earliest sleeper must see without any clock activity before time jumps.
///
/// Channel traffic only counts as activity through `Clock::mark_activity`, so
/// every actor that can wake another one must report its sends and receives.
const QUIET_POLLS: u32 = 3;

/// Discrete-event clock for single-threaded tests.
///
/// Sleepers register their deadline and keep yielding. Registering, finishing
/// and advancing all count as activity; once the sleeper with the earliest
/// deadline has been polled `QUIET_POLLS` times with no activity anywhere, the
/// timeline jumps to that deadline. Every task reachable by a reply has had a
/// chance to run by then, so sleepers wake in deadline order.
#[derive(Debug, Default)]
pub struct VirtualClock {
    now_us: Cell<u64>,
    deadlines: RefCell<Vec<u64>>,
    activity: Cell<u64>,
    sleeps: Cell<u64>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now_us.set(self.now_us.get() + duration.as_micros());
        self.bump();
    }

    /// Number of completed sleeps.
    pub fn sleep_count(&self) -> u64 {
        self.sleeps.get()
    }

    fn bump(&self) {
        self.activity.set(self.activity.get().wrapping_add(1));
    }

    fn is_earliest(&self, deadline: u64) -> bool {
        self.deadlines.borrow().iter().all(|&other| other >= deadline)
    }

    fn unregister(&self, deadline: u64) {
        let mut deadlines = self.deadlines.borrow_mut();
        if let Some(pos) = deadlines.iter().position(|&d| d == deadline) {
            deadlines.swap_remove(pos);
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.now_us.get())
    }

    fn mark_activity(&self) {
        self.bump();
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now_us.get() + duration.as_micros();
        self.deadlines.borrow_mut().push(deadline);
        self.bump();

        let mut seen = self.activity.get();
        let mut quiet = 0;
        while self.now_us.get() < deadline {
            if self.activity.get() == seen {
                quiet += 1;
            } else {
                seen = self.activity.get();
                quiet = 0;
            }
            if quiet >= QUIET_POLLS && self.is_earliest(deadline) {
                self.now_us.set(deadline);
                self.bump();
                seen = self.activity.get();
                quiet = 0;
            }
            yield_now().await;
        }

        self.unregister(deadline);
        self.sleeps.set(self.sleeps.get() + 1);
        self.bump();
    }
}
