//! Scaled embassy time driver.
//!
//! Simulated time runs at `percent / 100` times the host clock. The mapping is
//! piecewise linear: every change of the scale re-anchors the timeline at the
//! current instant so simulated time never jumps. Wakers are kept in a
//! deadline-ordered queue served by one background thread.

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant as HostInstant};

const MIN_SCALE_PERCENT: u32 = 1;
const MAX_SCALE_PERCENT: u32 = 1000;

/// Longest uninterrupted wait of the timer thread, so a scale change is
/// picked up even if its notification is missed.
const MAX_TIMER_SLICE: Duration = Duration::from_millis(25);

/// Simulated tick `sim_origin` corresponds to host instant `host_origin`.
#[derive(Debug)]
struct Timeline {
    host_origin: HostInstant,
    sim_origin: u64,
    scale_percent: u32,
}

impl Timeline {
    fn to_sim(&self, host: HostInstant) -> u64 {
        let host_ticks = host.saturating_duration_since(self.host_origin).as_nanos() * TICK_HZ as u128 / 1_000_000_000;
        let sim_ticks = host_ticks * self.scale_percent as u128 / 100;
        self.sim_origin.saturating_add(sim_ticks.min(u64::MAX as u128) as u64)
    }

    /// Host instant at which `sim` is reached. Ticks before the origin are due
    /// at the origin.
    fn to_host(&self, sim: u64) -> HostInstant {
        let Some(sim_ticks) = sim.checked_sub(self.sim_origin) else {
            return self.host_origin;
        };
        let host_ticks = sim_ticks as u128 * 100 / self.scale_percent as u128;
        let host_ns = host_ticks * 1_000_000_000 / TICK_HZ as u128;
        self.host_origin + Duration::from_nanos(host_ns.min(u64::MAX as u128) as u64)
    }
}

#[derive(Default)]
struct WakeQueue {
    by_deadline: BTreeMap<u64, Vec<Waker>>,
    /// Bumped whenever the scale changes.
    generation: u64,
}

static TIMELINE: OnceLock<Mutex<Timeline>> = OnceLock::new();
static QUEUE: OnceLock<Mutex<WakeQueue>> = OnceLock::new();
static SIGNAL: Condvar = Condvar::new();
static TIMER_THREAD: OnceLock<()> = OnceLock::new();

/// Locks `mutex`, ignoring poisoning: the guarded data is always left consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn timeline() -> MutexGuard<'static, Timeline> {
    lock(TIMELINE.get_or_init(|| {
        Mutex::new(Timeline {
            host_origin: HostInstant::now(),
            sim_origin: 0,
            scale_percent: 100,
        })
    }))
}

fn queue() -> &'static Mutex<WakeQueue> {
    QUEUE.get_or_init(|| Mutex::new(WakeQueue::default()))
}

fn sim_now() -> u64 {
    timeline().to_sim(HostInstant::now())
}

fn ensure_timer_thread() {
    TIMER_THREAD.get_or_init(|| {
        if let Err(err) = std::thread::Builder::new().name("sim-timer".into()).spawn(timer_thread) {
            log::error!("failed to start timer thread: {}", err);
        }
    });
}

fn timer_thread() {
    loop {
        // The queue lock is never held while the timeline is locked.
        let (next, generation) = {
            let mut waiting = lock(queue());
            loop {
                if let Some((&next, _)) = waiting.by_deadline.first_key_value() {
                    break (next, waiting.generation);
                }
                waiting = SIGNAL.wait(waiting).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let due_at = timeline().to_host(next);
        let host_now = HostInstant::now();
        if due_at > host_now {
            let slice = (due_at - host_now).min(MAX_TIMER_SLICE);
            let waiting = lock(queue());
            if waiting.generation == generation {
                drop(SIGNAL.wait_timeout(waiting, slice).unwrap_or_else(PoisonError::into_inner));
            }
            continue;
        }

        let now = sim_now();
        let due: Vec<Waker> = {
            let mut waiting = lock(queue());
            let later = waiting.by_deadline.split_off(&(now + 1));
            let expired = std::mem::replace(&mut waiting.by_deadline, later);
            expired.into_values().flatten().collect()
        };
        for waker in due {
            waker.wake();
        }
    }
}

struct ScaledDriver;

impl Driver for ScaledDriver {
    fn now(&self) -> u64 {
        sim_now()
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        ensure_timer_thread();
        lock(queue()).by_deadline.entry(at).or_default().push(waker.clone());
        SIGNAL.notify_all();
    }
}

time_driver_impl!(static DRIVER: ScaledDriver = ScaledDriver);

/// Sets the speed of simulated time relative to the host, clamped to 1%..=1000%.
pub fn set_time_scale_percent(percent: u32) {
    let percent = percent.clamp(MIN_SCALE_PERCENT, MAX_SCALE_PERCENT);
    {
        let mut timeline = timeline();
        if timeline.scale_percent == percent {
            return;
        }
        let host_now = HostInstant::now();
        let sim_now = timeline.to_sim(host_now);
        timeline.host_origin = host_now;
        timeline.sim_origin = sim_now;
        timeline.scale_percent = percent;
    }
    {
        let mut waiting = lock(queue());
        waiting.generation = waiting.generation.wrapping_add(1);
    }
    SIGNAL.notify_all();
    log::debug!("simulated time runs at {}%", percent);
}

pub fn time_scale_percent() -> u32 {
    timeline().scale_percent
}
