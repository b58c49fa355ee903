//! Condition variables.
use core::fmt;

use crate::{
    error::Error,
    klock::lock_cpu,
    list::ThreadList,
    mutex::Mutex,
    sched,
    task::{TaskSt, UnblockReason},
    time::{deadline_after, Duration, TimePoint},
};

/// A condition variable.
///
/// Waiters are woken in (effective priority, FIFO within priority)
/// order and then compete for the mutex using its normal protocol. The
/// condition variable does not itself remember the mutex; the waiter
/// passes it.
pub struct ConditionVariable {
    blocked: ThreadList,
}

impl ConditionVariable {
    pub const fn new() -> Self {
        Self {
            blocked: ThreadList::new(TaskSt::BlockedOnConditionVariable),
        }
    }

    /// Atomically unlock `mutex` and block until notified; re-acquire
    /// `mutex` before returning.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), Error> {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            mutex.unlock_locked(cs)?;
        }
        sched::block(guard, &self.blocked, None)?;
        mutex.lock()
    }

    /// As [`wait`](Self::wait), giving up on the notification after
    /// `duration` (plus one tick of slack). The mutex is re-acquired
    /// regardless of the outcome; [`Error::TimedOut`] is reported once
    /// the re-acquisition has succeeded.
    pub fn wait_for(&self, mutex: &Mutex, duration: Duration) -> Result<(), Error> {
        self.wait_until(mutex, deadline_after(duration))
    }

    /// As [`wait_for`](Self::wait_for), with an absolute deadline.
    pub fn wait_until(&self, mutex: &Mutex, deadline: TimePoint) -> Result<(), Error> {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            mutex.unlock_locked(cs)?;
        }
        let wait_result = sched::block_until(guard, &self.blocked, deadline, None);
        mutex.lock()?;
        wait_result
    }

    /// Wake the highest-priority waiter, if any.
    pub fn notify_one(&self) {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            if let Some(head) = self.blocked.front(cs) {
                sched::unblock(cs, head, UnblockReason::Request);
            }
        }
        sched::unlock_and_check_preemption(guard);
    }

    /// Wake all waiters, in priority order.
    pub fn notify_all(&self) {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            while let Some(head) = self.blocked.front(cs) {
                sched::unblock(cs, head, UnblockReason::Request);
            }
        }
        sched::unlock_and_check_preemption(guard);
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConditionVariable").finish()
    }
}
