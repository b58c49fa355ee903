//! Mutexes with priority protocols.
use core::fmt;
use core::ptr::NonNull;

use crate::{
    cfg::MAX_BOOST_DEPTH,
    error::Error,
    klock::{lock_cpu, CpuLockCell, CriticalSection},
    list::ThreadList,
    sched,
    task::{self, TaskRef, TaskSt, UnblockReason},
    time::{deadline_after, Duration, TimePoint},
};

/// Whether a mutex may be re-locked by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Re-locking by the owner fails with [`Error::WouldDeadlock`].
    Normal,
    /// Re-locking by the owner increments a recursion depth; the mutex is
    /// released when `unlock` has been called as many times as `lock`.
    Recursive,
}

/// The priority protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustments.
    None,
    /// The owner inherits the effective priority of its highest-priority
    /// waiter, transitively across the waits-for chain.
    PriorityInheritance,
    /// The owner runs at no less than the mutex's ceiling priority while
    /// holding it. Locking with an effective priority above the ceiling
    /// is a contract violation.
    PriorityProtect,
}

/// A reference to a [`Mutex`], compared by identity.
#[derive(Clone, Copy)]
pub(crate) struct MutexRef(NonNull<Mutex>);

// Safety: only dereferenced under the kernel critical section, while the
// referent is kept alive by an owner or waiter (see `MutexRef::get`).
unsafe impl Send for MutexRef {}
unsafe impl Sync for MutexRef {}

impl MutexRef {
    #[inline]
    fn new(mutex: &Mutex) -> Self {
        Self(NonNull::from(mutex))
    }

    /// Dereference the mutex.
    ///
    /// # Safety
    ///
    /// The mutex must still be alive. This holds for every reference
    /// reachable from kernel state: a blocked waiter keeps a borrow of
    /// the mutex for the whole `lock` call, and an owning thread's chain
    /// entry is unlinked by `unlock` or by `Mutex::drop`.
    #[inline]
    pub(crate) unsafe fn get(&self) -> &Mutex {
        // Safety: upheld by the caller.
        unsafe { self.0.as_ref() }
    }
}

impl PartialEq for MutexRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for MutexRef {}

impl fmt::Debug for MutexRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MutexRef").field(&self.0).finish()
    }
}

/// A mutual-exclusion primitive with optional priority-inheritance or
/// priority-ceiling protocol.
pub struct Mutex {
    mutex_type: MutexType,
    protocol: MutexProtocol,
    /// Meaningful only with [`MutexProtocol::PriorityProtect`].
    ceiling: u8,
    owner: CpuLockCell<Option<TaskRef>>,
    recursion_depth: CpuLockCell<u32>,
    /// The next element in the chain headed by the owner's
    /// `last_owned_mutex`, containing every priority-protocol mutex the
    /// owner currently holds.
    next_owned: CpuLockCell<Option<MutexRef>>,
    blocked: ThreadList,
}

enum LockAction {
    Done(Result<(), Error>),
    Block,
}

impl Mutex {
    /// Create a mutex with [`MutexProtocol::None`] or
    /// [`MutexProtocol::PriorityInheritance`]. For the ceiling protocol
    /// use [`with_ceiling`](Self::with_ceiling).
    pub const fn new(mutex_type: MutexType, protocol: MutexProtocol) -> Self {
        Self {
            mutex_type,
            protocol,
            ceiling: 0,
            owner: CpuLockCell::new(None),
            recursion_depth: CpuLockCell::new(0),
            next_owned: CpuLockCell::new(None),
            blocked: ThreadList::new(TaskSt::BlockedOnMutex),
        }
    }

    /// Create a priority-ceiling mutex.
    pub const fn with_ceiling(mutex_type: MutexType, ceiling: u8) -> Self {
        Self {
            mutex_type,
            protocol: MutexProtocol::PriorityProtect,
            ceiling,
            owner: CpuLockCell::new(None),
            recursion_depth: CpuLockCell::new(0),
            next_owned: CpuLockCell::new(None),
            blocked: ThreadList::new(TaskSt::BlockedOnMutex),
        }
    }

    /// Acquire the mutex, blocking while another thread owns it.
    pub fn lock(&self) -> Result<(), Error> {
        self.lock_internal(None, false)
    }

    /// Acquire the mutex if it is free, failing with [`Error::Busy`] if
    /// another thread owns it.
    pub fn try_lock(&self) -> Result<(), Error> {
        self.lock_internal(None, true)
    }

    /// As [`lock`](Self::lock), giving up with [`Error::TimedOut`] after
    /// `duration` (plus one tick of slack).
    pub fn try_lock_for(&self, duration: Duration) -> Result<(), Error> {
        self.try_lock_until(deadline_after(duration))
    }

    /// As [`lock`](Self::lock), giving up with [`Error::TimedOut`] at
    /// `deadline`.
    pub fn try_lock_until(&self, deadline: TimePoint) -> Result<(), Error> {
        self.lock_internal(Some(deadline), false)
    }

    fn lock_internal(&self, deadline: Option<TimePoint>, try_only: bool) -> Result<(), Error> {
        let guard = lock_cpu();
        let action = {
            let cs = guard.token();
            let me = sched::current_task(cs).expect("mutex operations require a thread context");

            if let Some(owner) = self.owner.get(cs) {
                if owner == me {
                    match self.mutex_type {
                        MutexType::Recursive => {
                            self.recursion_depth.update(cs, |d| d + 1);
                            LockAction::Done(Ok(()))
                        }
                        MutexType::Normal => LockAction::Done(Err(Error::WouldDeadlock)),
                    }
                } else if self.protocol == MutexProtocol::PriorityProtect
                    && self.ceiling < me.effective_priority(cs)
                {
                    LockAction::Done(Err(Error::BadParam))
                } else if try_only {
                    LockAction::Done(Err(Error::Busy))
                } else {
                    if self.protocol == MutexProtocol::PriorityInheritance {
                        me.blocking_mutex.set(cs, Some(MutexRef::new(self)));
                        boost_owners(cs, self, me.effective_priority(cs));
                    }
                    LockAction::Block
                }
            } else if self.protocol == MutexProtocol::PriorityProtect
                && self.ceiling < me.effective_priority(cs)
            {
                LockAction::Done(Err(Error::BadParam))
            } else {
                self.grant(cs, me);
                LockAction::Done(Ok(()))
            }
        };

        match action {
            LockAction::Done(result) => result,
            LockAction::Block => {
                let result = match deadline {
                    None => sched::block(guard, &self.blocked, None),
                    Some(at) => sched::block_until(guard, &self.blocked, at, None),
                };
                if result.is_err() {
                    // The wait was abandoned; retract this thread's
                    // contribution to the owner's inherited priority.
                    let guard = lock_cpu();
                    let cs = guard.token();
                    let me =
                        sched::current_task(cs).expect("mutex operations require a thread context");
                    me.blocking_mutex.set(cs, None);
                    if self.protocol == MutexProtocol::PriorityInheritance {
                        if let Some(owner) = self.owner.get(cs) {
                            update_boosted_priority(cs, owner);
                        }
                    }
                    return result;
                }
                // Ownership was handed over by the releasing thread.
                result
            }
        }
    }

    /// Release the mutex and hand it to the highest-priority waiter, if
    /// any. Fails with [`Error::NotOwner`] when called by a thread that
    /// does not own the mutex.
    pub fn unlock(&self) -> Result<(), Error> {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            self.unlock_locked(cs)?;
        }
        sched::unlock_and_check_preemption(guard);
        Ok(())
    }

    /// The core of [`unlock`](Self::unlock), usable under an
    /// already-held critical section. Does not re-evaluate preemption.
    pub(crate) fn unlock_locked(&self, cs: CriticalSection<'_>) -> Result<(), Error> {
        let me = sched::current_task(cs).expect("mutex operations require a thread context");
        if self.owner.get(cs) != Some(me) {
            return Err(Error::NotOwner);
        }
        let depth = self.recursion_depth.get(cs);
        if depth > 0 {
            self.recursion_depth.set(cs, depth - 1);
            return Ok(());
        }

        if self.protocol != MutexProtocol::None {
            remove_from_owned_chain(cs, me, self);
            // May lower this thread's effective priority.
            update_boosted_priority(cs, me);
        }

        self.owner.set(cs, None);
        if let Some(next_owner) = self.blocked.front(cs) {
            sched::unblock(cs, next_owner, UnblockReason::Request);
            next_owner.blocking_mutex.set(cs, None);
            self.grant(cs, next_owner);
            if self.protocol == MutexProtocol::PriorityInheritance {
                // The new owner inherits from the waiters that remain.
                update_boosted_priority(cs, next_owner);
            }
        }
        Ok(())
    }

    /// Whether the mutex is currently locked.
    pub fn is_locked(&self) -> bool {
        let guard = lock_cpu();
        self.owner.get(guard.token()).is_some()
    }

    /// Give the ownership of the mutex to `task`.
    fn grant(&self, cs: CriticalSection<'_>, task: TaskRef) {
        debug_assert!(self.owner.get(cs).is_none());
        self.owner.set(cs, Some(task));
        self.recursion_depth.set(cs, 0);

        if self.protocol != MutexProtocol::None {
            let prev = task.last_owned_mutex.replace(cs, Some(MutexRef::new(self)));
            self.next_owned.set(cs, prev);
        }
        if self.protocol == MutexProtocol::PriorityProtect {
            let old_eff = task.effective_priority(cs);
            if self.ceiling > task.boosted_priority.get(cs) {
                task.boosted_priority.set(cs, self.ceiling);
            }
            if task.effective_priority(cs) != old_eff {
                task::reposition(cs, task, false);
            }
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let guard = lock_cpu();
        let cs = guard.token();
        debug_assert!(
            self.blocked.is_empty(cs),
            "dropping a mutex with blocked waiters"
        );
        if self.protocol != MutexProtocol::None {
            if let Some(owner) = self.owner.get(cs) {
                remove_from_owned_chain(cs, owner, self);
                update_boosted_priority(cs, owner);
            }
        }
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("mutex_type", &self.mutex_type)
            .field("protocol", &self.protocol)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

/// Propagate a waiter's effective priority along the chain of
/// priority-inheritance owners.
///
/// The walk ends at a thread that is not blocked on a PI mutex, or as
/// soon as no effective priority changes. The depth bound detects cyclic
/// acquisition, which is a programming error.
fn boost_owners(cs: CriticalSection<'_>, mutex: &Mutex, waiter_priority: u8) {
    let mut mutex_ref = MutexRef::new(mutex);
    let mut priority = waiter_priority;
    let mut depth = 0usize;
    loop {
        // Safety: the chain only reaches mutexes that currently have an
        // owner and at least one waiter, which keeps them alive.
        let m = unsafe { mutex_ref.get() };
        let Some(owner) = m.owner.get(cs) else {
            debug_assert!(false, "boosting through an unowned mutex");
            return;
        };
        if priority <= owner.boosted_priority.get(cs) {
            return;
        }
        let old_eff = owner.effective_priority(cs);
        owner.boosted_priority.set(cs, priority);
        let new_eff = owner.effective_priority(cs);
        if new_eff == old_eff {
            return;
        }
        task::reposition(cs, owner, false);

        match owner.blocking_mutex.get(cs) {
            // Safety: see above.
            Some(next) if unsafe { next.get() }.protocol == MutexProtocol::PriorityInheritance => {
                priority = new_eff;
                mutex_ref = next;
            }
            _ => return,
        }

        depth += 1;
        debug_assert!(
            depth <= MAX_BOOST_DEPTH,
            "priority-inheritance chain too deep (cyclic acquisition?)"
        );
        if depth > MAX_BOOST_DEPTH {
            return;
        }
    }
}

/// Recompute `task`'s boosted priority from the priority-protocol
/// mutexes it still owns (zero if none), and reposition it in its
/// containing list if its effective priority changed.
pub(crate) fn update_boosted_priority(cs: CriticalSection<'_>, task: TaskRef) {
    let mut boost: u8 = 0;
    let mut cursor = task.last_owned_mutex.get(cs);
    while let Some(m_ref) = cursor {
        // Safety: owned mutexes are unlinked from the chain before they
        // can go away (`unlock_locked`, `Mutex::drop`).
        let m = unsafe { m_ref.get() };
        match m.protocol {
            MutexProtocol::PriorityProtect => boost = boost.max(m.ceiling),
            MutexProtocol::PriorityInheritance => {
                if let Some(waiter) = m.blocked.front(cs) {
                    boost = boost.max(waiter.effective_priority(cs));
                }
            }
            MutexProtocol::None => {
                debug_assert!(false, "protocol-free mutex on the owned chain")
            }
        }
        cursor = m.next_owned.get(cs);
    }

    let old_eff = task.effective_priority(cs);
    task.boosted_priority.set(cs, boost);
    let new_eff = task.effective_priority(cs);
    if new_eff != old_eff {
        task::reposition(cs, task, new_eff < old_eff);
    }
}

/// Unlink `target` from `task`'s owned-protocol-mutex chain. Unlock
/// order is not required to be LIFO.
fn remove_from_owned_chain(cs: CriticalSection<'_>, task: TaskRef, target: &Mutex) {
    let target_ref = MutexRef::new(target);
    let mut cursor = task.last_owned_mutex.get(cs);
    if cursor == Some(target_ref) {
        task.last_owned_mutex.set(cs, target.next_owned.get(cs));
        target.next_owned.set(cs, None);
        return;
    }
    while let Some(m_ref) = cursor {
        // Safety: see `update_boosted_priority`.
        let m = unsafe { m_ref.get() };
        if m.next_owned.get(cs) == Some(target_ref) {
            m.next_owned.set(cs, target.next_owned.get(cs));
            target.next_owned.set(cs, None);
            return;
        }
        cursor = m.next_owned.get(cs);
    }
    debug_assert!(false, "owned mutex missing from the chain");
}
