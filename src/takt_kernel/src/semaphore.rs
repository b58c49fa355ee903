//! Semaphores.
use core::fmt;

use crate::{
    error::Error,
    klock::{lock_cpu, CpuLockCell, CriticalSection},
    list::ThreadList,
    sched,
    task::{TaskSt, UnblockReason},
    time::{deadline_after, Duration, TimePoint},
};

/// A counting semaphore with a maximum value.
///
/// Waiters are woken in (effective priority, FIFO within priority) order.
/// `post` may be called from interrupt context.
pub struct Semaphore {
    value: CpuLockCell<u32>,
    max_value: u32,
    blocked: ThreadList,
}

impl Semaphore {
    /// Create a semaphore with the given initial value and no practical
    /// maximum.
    pub const fn new(value: u32) -> Self {
        Self::with_max_value(value, u32::MAX)
    }

    /// Create a semaphore with the given initial and maximum values. The
    /// initial value is clamped to the maximum.
    pub const fn with_max_value(value: u32, max_value: u32) -> Self {
        Self {
            value: CpuLockCell::new(if value <= max_value { value } else { max_value }),
            max_value,
            blocked: ThreadList::new(TaskSt::BlockedOnSemaphore),
        }
    }

    /// Increment the value, or wake the highest-priority waiter. Fails
    /// with [`Error::Overflow`] when the value is already at the maximum;
    /// the post is not lost in any other case.
    pub fn post(&self) -> Result<(), Error> {
        let guard = lock_cpu();
        self.post_locked(guard.token())?;
        sched::unlock_and_check_preemption(guard);
        Ok(())
    }

    /// The core of [`post`](Self::post), usable under an already-held
    /// critical section. Does not re-evaluate preemption.
    pub(crate) fn post_locked(&self, cs: CriticalSection<'_>) -> Result<(), Error> {
        if self.value.get(cs) == self.max_value {
            return Err(Error::Overflow);
        }
        if let Some(head) = self.blocked.front(cs) {
            // Hand the permit straight to the waiter.
            sched::unblock(cs, head, UnblockReason::Request);
        } else {
            self.value.update(cs, |v| v + 1);
        }
        Ok(())
    }

    /// Decrement the value, blocking while it is zero.
    pub fn wait(&self) -> Result<(), Error> {
        let guard = lock_cpu();
        if self.try_wait_locked(guard.token()).is_ok() {
            return Ok(());
        }
        sched::block(guard, &self.blocked, None)
    }

    /// Decrement the value if it is positive, otherwise fail with
    /// [`Error::WouldBlock`].
    pub fn try_wait(&self) -> Result<(), Error> {
        let guard = lock_cpu();
        self.try_wait_locked(guard.token())
    }

    /// As [`wait`](Self::wait), giving up with [`Error::TimedOut`] after
    /// `duration` (plus one tick of slack).
    pub fn try_wait_for(&self, duration: Duration) -> Result<(), Error> {
        self.try_wait_until(deadline_after(duration))
    }

    /// As [`wait`](Self::wait), giving up with [`Error::TimedOut`] at
    /// `deadline`.
    pub fn try_wait_until(&self, deadline: TimePoint) -> Result<(), Error> {
        let guard = lock_cpu();
        if self.try_wait_locked(guard.token()).is_ok() {
            return Ok(());
        }
        sched::block_until(guard, &self.blocked, deadline, None)
    }

    /// The current value.
    pub fn value(&self) -> u32 {
        let guard = lock_cpu();
        self.value.get(guard.token())
    }

    #[inline]
    pub(crate) fn value_locked(&self, cs: CriticalSection<'_>) -> u32 {
        self.value.get(cs)
    }

    /// The maximum value.
    pub const fn max_value(&self) -> u32 {
        self.max_value
    }

    fn try_wait_locked(&self, cs: CriticalSection<'_>) -> Result<(), Error> {
        let value = self.value.get(cs);
        if value == 0 {
            return Err(Error::WouldBlock);
        }
        self.value.set(cs, value - 1);
        Ok(())
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.value())
            .field("max_value", &self.max_value)
            .finish()
    }
}
