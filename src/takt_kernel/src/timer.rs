//! Software timers.
use core::fmt;

use crate::{
    error::Error,
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CriticalSection},
    sched::SCHEDULER,
    time::{deadline_after, Duration, TickClock, TimePoint},
    timeout::Timeout,
};

/// A time-triggered timer, one-shot or periodic.
///
/// The action runs in interrupt context, from the tick handler, with the
/// kernel critical section released; it may use the interrupt-safe
/// subset of the kernel API (posts, signal generation, non-blocking
/// queue operations), but must not block.
pub struct SoftwareTimer {
    timeout: Timeout,
    /// Re-arm interval in ticks; `None` for a one-shot timer.
    period: CpuLockCell<Option<u64>>,
    active: CpuLockCell<bool>,
    action: fn(usize),
    action_param: usize,
}

impl SoftwareTimer {
    /// Create a stopped timer that will invoke `action(action_param)` on
    /// every expiration.
    pub const fn new(action: fn(usize), action_param: usize) -> Self {
        Self {
            timeout: Timeout::new(expiration_handler),
            period: CpuLockCell::new(None),
            active: CpuLockCell::new(false),
            action,
            action_param,
        }
    }

    /// Start as a one-shot timer firing at `at`. Restarting a running
    /// timer reschedules it.
    pub fn start_at(&'static self, at: TimePoint) -> Result<(), Error> {
        let guard = lock_cpu();
        let cs = guard.token();
        self.stop_locked(cs);
        self.arm(cs, at, None);
        Ok(())
    }

    /// Start as a one-shot timer firing after `delay` (plus one tick of
    /// slack).
    pub fn start_after(&'static self, delay: Duration) -> Result<(), Error> {
        self.start_at(deadline_after(delay))
    }

    /// Start as a periodic timer firing every `period`, the first time
    /// one period from now.
    pub fn start_periodic(&'static self, period: Duration) -> Result<(), Error> {
        if period.as_ticks() == 0 {
            return Err(Error::BadParam);
        }
        let guard = lock_cpu();
        let cs = guard.token();
        self.stop_locked(cs);
        let first = TickClock::now_locked(cs) + period;
        self.arm(cs, first, Some(period.as_ticks()));
        Ok(())
    }

    /// Stop the timer. A stopped timer does not fire; stopping a stopped
    /// timer has no effect.
    pub fn stop(&self) {
        let guard = lock_cpu();
        self.stop_locked(guard.token());
    }

    /// Whether the timer is armed. One-shot timers detach after firing.
    pub fn is_running(&self) -> bool {
        let guard = lock_cpu();
        self.active.get(guard.token())
    }

    fn arm(&'static self, cs: CriticalSection<'_>, at: TimePoint, period: Option<u64>) {
        self.timeout.set_param(cs, self as *const Self as usize);
        self.timeout.set_expiration(cs, at);
        self.period.set(cs, period);
        // Safety: `self` is `'static`, so the node outlives the list.
        unsafe { SCHEDULER.timeouts.insert(cs, &self.timeout) };
        self.active.set(cs, true);
    }

    fn stop_locked(&self, cs: CriticalSection<'_>) {
        SCHEDULER.timeouts.remove(cs, &self.timeout);
        self.active.set(cs, false);
    }
}

impl fmt::Debug for SoftwareTimer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SoftwareTimer")
            .field("self", &(self as *const _))
            .field("running", &self.is_running())
            .finish()
    }
}

/// The timeout callback of every software timer: re-arm if periodic,
/// then run the user action with the critical section released.
fn expiration_handler(param: usize, guard: CpuLockGuard) -> CpuLockGuard {
    // Safety: `arm` stored a pointer to a live `'static` timer.
    let timer = unsafe { &*(param as *const SoftwareTimer) };
    {
        let cs = guard.token();
        debug_assert!(timer.active.get(cs));
        debug_assert!(!timer.timeout.is_linked(cs));
        match timer.period.get(cs) {
            Some(period) => {
                // Advance from the previous expiration, not from `now`,
                // so the cadence does not drift.
                timer.timeout.advance_expiration(cs, period);
                // Safety: `'static` node, see `arm`.
                unsafe { SCHEDULER.timeouts.insert(cs, &timer.timeout) };
            }
            None => timer.active.set(cs, false),
        }
    }
    drop(guard);
    (timer.action)(timer.action_param);
    lock_cpu()
}
