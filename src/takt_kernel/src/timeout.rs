//! Timed events.
//!
//! Outstanding timeouts form an intrusive list ordered by firing tick,
//! FIFO within a tick. The tick handler pops every due entry in order and
//! runs its callback. Blocking calls with a deadline plant a `Timeout` on
//! the waiting thread's stack; the node cannot go away while linked
//! because the frame cannot unwind while the thread is parked.
use core::fmt;
use core::ptr::NonNull;

use crate::{
    klock::{CpuLockCell, CpuLockGuard, CriticalSection},
    time::TimePoint,
};

/// Timeout callback function.
///
/// Called with the kernel critical section held, in an interrupt context,
/// when the associated [`Timeout`] expires. The callback may wake up
/// threads; the resulting context switch is taken care of on interrupt
/// exit. The callback takes the lock guard by value and returns one so
/// that it can release the critical section around non-trivial work.
pub(crate) type TimeoutFn = fn(usize, CpuLockGuard) -> CpuLockGuard;

/// A timed event: a firing tick and an action.
///
/// Once inserted, the `Timeout` must stay in the same memory location
/// until it is removed (or has fired).
pub(crate) struct Timeout {
    /// The firing tick.
    at: CpuLockCell<u64>,

    /// The next node in the list headed by [`TimeoutList::head`].
    next: CpuLockCell<Option<TimeoutRef>>,

    /// Whether this node is currently in the list.
    linked: CpuLockCell<bool>,

    callback: TimeoutFn,

    /// Parameter given to the callback function.
    param: CpuLockCell<usize>,
}

impl Timeout {
    pub(crate) const fn new(callback: TimeoutFn) -> Self {
        Self {
            at: CpuLockCell::new(0),
            next: CpuLockCell::new(None),
            linked: CpuLockCell::new(false),
            callback,
            param: CpuLockCell::new(0),
        }
    }

    #[inline]
    pub(crate) fn set_param(&self, cs: CriticalSection<'_>, param: usize) {
        self.param.set(cs, param);
    }

    #[inline]
    pub(crate) fn set_expiration(&self, cs: CriticalSection<'_>, at: TimePoint) {
        debug_assert!(!self.linked.get(cs));
        self.at.set(cs, at.as_ticks());
    }

    /// Push the expiration time forward. Used by periodic timers before
    /// re-insertion.
    #[inline]
    pub(crate) fn advance_expiration(&self, cs: CriticalSection<'_>, ticks: u64) {
        debug_assert!(!self.linked.get(cs));
        self.at.update(cs, |at| at + ticks);
    }

    #[inline]
    pub(crate) fn is_linked(&self, cs: CriticalSection<'_>) -> bool {
        self.linked.get(cs)
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("self", &(self as *const _))
            .finish()
    }
}

/// A reference to a [`Timeout`].
#[derive(Clone, Copy)]
pub(crate) struct TimeoutRef(NonNull<Timeout>);

// Safety: `Timeout` is only touched under the kernel critical section,
// and a linked node is kept valid by `insert`'s contract.
unsafe impl Send for TimeoutRef {}
unsafe impl Sync for TimeoutRef {}

impl PartialEq for TimeoutRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TimeoutRef {}

/// The time-ordered collection of pending timeouts.
pub(crate) struct TimeoutList {
    head: CpuLockCell<Option<TimeoutRef>>,
}

impl TimeoutList {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
        }
    }

    /// Register `timeout`, keeping the list ordered by firing tick with
    /// FIFO ordering among equal ticks.
    ///
    /// # Safety
    ///
    /// The node must stay valid and must not move until it is removed
    /// with [`remove`](Self::remove) or popped by
    /// [`pop_due`](Self::pop_due).
    pub(crate) unsafe fn insert(&self, cs: CriticalSection<'_>, timeout: &Timeout) {
        debug_assert!(!timeout.linked.get(cs));
        let at = timeout.at.get(cs);
        let node = TimeoutRef(NonNull::from(timeout));

        // Insert after every entry with an equal or earlier firing tick.
        let mut prev: Option<TimeoutRef> = None;
        let mut cursor = self.head.get(cs);
        while let Some(t) = cursor {
            // Safety: `t` is linked, hence valid per `insert`'s contract.
            let t_ref = unsafe { t.0.as_ref() };
            if t_ref.at.get(cs) > at {
                break;
            }
            prev = Some(t);
            cursor = t_ref.next.get(cs);
        }

        timeout.next.set(cs, cursor);
        match prev {
            // Safety: linked, hence valid.
            Some(p) => unsafe { p.0.as_ref() }.next.set(cs, Some(node)),
            None => self.head.set(cs, Some(node)),
        }
        timeout.linked.set(cs, true);
    }

    /// Unregister `timeout`. Does nothing if it is not registered.
    pub(crate) fn remove(&self, cs: CriticalSection<'_>, timeout: &Timeout) {
        if !timeout.linked.get(cs) {
            return;
        }
        let node = TimeoutRef(NonNull::from(timeout));

        let mut prev: Option<TimeoutRef> = None;
        let mut cursor = self.head.get(cs);
        while let Some(t) = cursor {
            if t == node {
                let next = timeout.next.get(cs);
                match prev {
                    // Safety: linked, hence valid.
                    Some(p) => unsafe { p.0.as_ref() }.next.set(cs, next),
                    None => self.head.set(cs, next),
                }
                timeout.next.set(cs, None);
                timeout.linked.set(cs, false);
                return;
            }
            // Safety: linked, hence valid.
            let t_ref = unsafe { t.0.as_ref() };
            prev = Some(t);
            cursor = t_ref.next.get(cs);
        }
        debug_assert!(false, "linked timeout not found in the list");
    }

    /// Pop the earliest timeout if it is due at `now`.
    ///
    /// Returns the callback and its parameter; the node is unlinked
    /// before the callback runs, so the callback may re-insert it.
    pub(crate) fn pop_due(
        &self,
        cs: CriticalSection<'_>,
        now: TimePoint,
    ) -> Option<(TimeoutFn, usize)> {
        let front = self.head.get(cs)?;
        // Safety: linked, hence valid.
        let front_ref = unsafe { front.0.as_ref() };
        if front_ref.at.get(cs) > now.as_ticks() {
            return None;
        }
        self.head.set(cs, front_ref.next.get(cs));
        front_ref.next.set(cs, None);
        front_ref.linked.set(cs, false);
        Some((front_ref.callback, front_ref.param.get(cs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::lock_cpu;

    fn nop(_: usize, guard: CpuLockGuard) -> CpuLockGuard {
        guard
    }

    #[test]
    fn pops_in_tick_order_fifo_within_tick() {
        let guard = lock_cpu();
        let cs = guard.token();
        let list = TimeoutList::new();
        let a = Timeout::new(nop);
        let b = Timeout::new(nop);
        let c = Timeout::new(nop);
        a.set_expiration(cs, TimePoint::from_ticks(5));
        a.set_param(cs, 1);
        b.set_expiration(cs, TimePoint::from_ticks(3));
        b.set_param(cs, 2);
        c.set_expiration(cs, TimePoint::from_ticks(5));
        c.set_param(cs, 3);
        // Safety: the nodes outlive the list operations in this test.
        unsafe {
            list.insert(cs, &a);
            list.insert(cs, &b);
            list.insert(cs, &c);
        }

        let now = TimePoint::from_ticks(5);
        let order: Vec<usize> = core::iter::from_fn(|| list.pop_due(cs, now).map(|x| x.1)).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn remove_unlinks_middle_entry() {
        let guard = lock_cpu();
        let cs = guard.token();
        let list = TimeoutList::new();
        let a = Timeout::new(nop);
        let b = Timeout::new(nop);
        a.set_expiration(cs, TimePoint::from_ticks(1));
        b.set_expiration(cs, TimePoint::from_ticks(2));
        // Safety: the nodes outlive the list operations in this test.
        unsafe {
            list.insert(cs, &a);
            list.insert(cs, &b);
        }
        list.remove(cs, &a);
        assert!(!a.is_linked(cs));
        assert!(list.pop_due(cs, TimePoint::from_ticks(1)).is_none());
        assert!(list.pop_due(cs, TimePoint::from_ticks(2)).is_some());
    }

    #[test]
    fn not_due_is_not_popped() {
        let guard = lock_cpu();
        let cs = guard.token();
        let list = TimeoutList::new();
        let a = Timeout::new(nop);
        a.set_expiration(cs, TimePoint::from_ticks(10));
        // Safety: the node outlives the list operations in this test.
        unsafe { list.insert(cs, &a) };
        assert!(list.pop_due(cs, TimePoint::from_ticks(9)).is_none());
        assert!(a.is_linked(cs));
        list.remove(cs, &a);
    }
}
