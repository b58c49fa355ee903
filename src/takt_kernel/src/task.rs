//! Thread control blocks.
use core::fmt;
use core::ops::Deref;
use core::ptr::NonNull;

use crate::{
    cfg::QUANTUM_TICKS,
    klock::{CpuLockCell, CriticalSection},
    list::{ListLink, ListRef},
    mutex::MutexRef,
    port::PortThreadId,
    signal::{SignalSet, SignalSetRef},
};

/// The scheduling policy of a thread, applied among threads of equal
/// effective priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// The thread runs until it blocks or yields.
    Cooperative,
    /// The thread additionally yields whenever its time quantum is
    /// exhausted.
    RoundRobin,
}

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSt {
    /// Created, not yet added to the scheduler.
    New,
    Runnable,
    Sleeping,
    BlockedOnSemaphore,
    BlockedOnMutex,
    BlockedOnConditionVariable,
    WaitingForSignal,
    /// Reserved for explicit suspension, which no public operation
    /// currently triggers.
    #[allow(dead_code)]
    Suspended,
    Terminated,
}

impl TaskSt {
    /// Whether a thread in this state is on some blocking list, waiting
    /// to be unblocked.
    pub(crate) fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::Sleeping
                | Self::BlockedOnSemaphore
                | Self::BlockedOnMutex
                | Self::BlockedOnConditionVariable
                | Self::WaitingForSignal
                | Self::Suspended
        )
    }
}

/// The cause recorded when a thread leaves a blocking list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnblockReason {
    /// An explicit request (a post, an unlock, a notification, a signal).
    Request,
    /// The deadline timer fired.
    Timeout,
}

/// A functor executed inside [`unblock`] while the kernel critical
/// section is still held, before any other thread can observe the
/// unblock. Blocking primitives use it to snapshot their state at the
/// instant of wake.
///
/// [`unblock`]: crate::sched::unblock
pub(crate) trait UnblockFunctor {
    fn unblocked(&self, cs: CriticalSection<'_>, task: &TaskCb);
}

/// A type- and lifetime-erased reference to an [`UnblockFunctor`].
#[derive(Clone, Copy)]
pub(crate) struct UnblockFunctorRef(NonNull<dyn UnblockFunctor>);

// Safety: the functor is only invoked under the kernel critical section,
// and the referent outlives the blocked state (see `new`).
unsafe impl Send for UnblockFunctorRef {}
unsafe impl Sync for UnblockFunctorRef {}

impl UnblockFunctorRef {
    /// Erase the lifetime of `functor`.
    ///
    /// # Safety
    ///
    /// The referent must stay valid for as long as the reference is
    /// stored in a [`TaskCb`]'s unblock slot, i.e. until the blocked
    /// thread is unblocked. Functors live on the blocked thread's stack;
    /// the frame cannot unwind while the thread is parked, so this holds.
    pub(crate) unsafe fn new(functor: &(dyn UnblockFunctor + '_)) -> Self {
        // Safety: same layout; only the lifetime parameter differs.
        Self(unsafe {
            core::mem::transmute::<NonNull<dyn UnblockFunctor + '_>, NonNull<dyn UnblockFunctor>>(
                NonNull::from(functor),
            )
        })
    }

    pub(crate) fn call(&self, cs: CriticalSection<'_>, task: &TaskCb) {
        // Safety: validity upheld by `new`'s contract.
        unsafe { self.0.as_ref() }.unblocked(cs, task);
    }
}

/// The unblock slot of a thread: a functor reference while the thread is
/// blocked, the last unblock reason while it is not. The thread state
/// disambiguates which variant is meaningful.
#[derive(Clone, Copy)]
pub(crate) enum UnblockSlot {
    Blocked(Option<UnblockFunctorRef>),
    Reason(UnblockReason),
}

/// *Thread control block* - the state data of a thread.
pub(crate) struct TaskCb {
    /// Links into the one list this thread currently belongs to.
    pub(crate) link: ListLink,

    /// The list this thread currently belongs to, if any. Consistent with
    /// `link` at every kernel-visible state boundary.
    pub(crate) list: CpuLockCell<Option<ListRef>>,

    pub(crate) base_priority: CpuLockCell<u8>,

    /// Priority temporarily raised by a priority-protocol mutex this
    /// thread owns. Zero means no boost.
    pub(crate) boosted_priority: CpuLockCell<u8>,

    pub(crate) policy: SchedulingPolicy,

    pub(crate) state: CpuLockCell<TaskSt>,

    /// Remaining ticks in the current round-robin slice.
    pub(crate) quantum: CpuLockCell<u32>,

    pub(crate) unblock: CpuLockCell<UnblockSlot>,

    /// Head of the chain of mutexes owned by this thread that participate
    /// in a priority protocol, linked through `Mutex::next_owned`.
    pub(crate) last_owned_mutex: CpuLockCell<Option<MutexRef>>,

    /// The priority-inheritance mutex this thread is blocked on, if any.
    pub(crate) blocking_mutex: CpuLockCell<Option<MutexRef>>,

    /// Signals generated for this thread but not yet accepted.
    pub(crate) pending_signals: CpuLockCell<SignalSet>,

    /// The set this thread is currently waiting for, if any. Points into
    /// the waiting thread's stack.
    pub(crate) awaited_signals: CpuLockCell<Option<SignalSetRef>>,

    /// The execution context backing this thread, assigned at start.
    pub(crate) port_thread: CpuLockCell<Option<PortThreadId>>,
}

impl TaskCb {
    pub(crate) const fn new(priority: u8, policy: SchedulingPolicy) -> Self {
        Self {
            link: ListLink::new(),
            list: CpuLockCell::new(None),
            base_priority: CpuLockCell::new(priority),
            boosted_priority: CpuLockCell::new(0),
            policy,
            state: CpuLockCell::new(TaskSt::New),
            quantum: CpuLockCell::new(QUANTUM_TICKS),
            unblock: CpuLockCell::new(UnblockSlot::Reason(UnblockReason::Request)),
            last_owned_mutex: CpuLockCell::new(None),
            blocking_mutex: CpuLockCell::new(None),
            pending_signals: CpuLockCell::new(SignalSet::empty()),
            awaited_signals: CpuLockCell::new(None),
            port_thread: CpuLockCell::new(None),
        }
    }

    /// The priority used for every scheduling comparison.
    #[inline]
    pub(crate) fn effective_priority(&self, cs: CriticalSection<'_>) -> u8 {
        self.base_priority.get(cs).max(self.boosted_priority.get(cs))
    }

    /// Reload the round-robin quantum. Called on unblock and on yield.
    #[inline]
    pub(crate) fn reset_quantum(&self, cs: CriticalSection<'_>) {
        self.quantum.set(cs, QUANTUM_TICKS);
    }
}

impl fmt::Debug for TaskCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("policy", &self.policy)
            .finish()
    }
}

/// A reference to a [`TaskCb`], compared by identity.
///
/// All control blocks reachable through the scheduler belong to started
/// threads, which are required to be `'static`.
#[derive(Clone, Copy)]
pub(crate) struct TaskRef(&'static TaskCb);

impl TaskRef {
    #[inline]
    pub(crate) fn new(task: &'static TaskCb) -> Self {
        Self(task)
    }

    #[inline]
    pub(crate) fn get(self) -> &'static TaskCb {
        self.0
    }

    #[inline]
    pub(crate) fn as_usize(self) -> usize {
        self.0 as *const TaskCb as usize
    }

    /// Recover a reference from [`as_usize`](Self::as_usize).
    ///
    /// # Safety
    ///
    /// `raw` must have come from `as_usize` on a live `TaskRef`.
    #[inline]
    pub(crate) unsafe fn from_usize(raw: usize) -> Self {
        // Safety: upheld by the caller; the pointee is `'static`.
        Self(unsafe { &*(raw as *const TaskCb) })
    }
}

impl Deref for TaskRef {
    type Target = TaskCb;

    #[inline]
    fn deref(&self) -> &TaskCb {
        self.0
    }
}

impl PartialEq for TaskRef {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskRef")
            .field(&(self.0 as *const TaskCb))
            .finish()
    }
}

/// Reposition `task` in its containing sorted list after a change of its
/// effective priority.
///
/// With `lowering_before` set (only valid when the priority was lowered),
/// insertion is performed as if the new effective priority were one
/// higher, moving the thread to the *head* of its new priority group.
/// This preserves "has just been preempted" semantics.
pub(crate) fn reposition(cs: CriticalSection<'_>, task: TaskRef, lowering_before: bool) {
    let Some(list_ref) = task.list.get(cs) else {
        return;
    };
    // Safety: a list holding this thread is kept alive by the blocked
    // thread's borrow of its owning primitive (or is a scheduler list,
    // which is static).
    let list = unsafe { list_ref.get() };
    list.remove(cs, task);
    let mut key = task.effective_priority(cs) as u16;
    if lowering_before {
        key += 1;
    }
    list.insert_with_key(cs, task, key);
}
