//! The scheduler.
//!
//! A single long-lived object owning the runnable, sleeping and
//! terminated lists, the timeout set and the current-thread pointer. It
//! is initialized before any thread runs and never torn down; every entry
//! point takes the kernel critical section.
use crate::{
    error::Error,
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CriticalSection},
    list::ThreadList,
    port::port,
    semaphore::Semaphore,
    task::{SchedulingPolicy, TaskRef, TaskSt, UnblockFunctorRef, UnblockReason, UnblockSlot},
    time::{TickClock, TimePoint},
    timeout::{Timeout, TimeoutList},
};

pub(crate) struct Scheduler {
    /// Threads ready to run, including the current one.
    pub(crate) runnable: ThreadList,
    /// Threads waiting out a sleep; wakeup is keyed by each sleeper's
    /// timeout in `timeouts`.
    sleeping: ThreadList,
    terminated: ThreadList,
    /// The one thread that owns the processor.
    current: CpuLockCell<Option<TaskRef>>,
    /// A forced context switch was requested from interrupt context; it
    /// is honored on interrupt exit.
    switch_pending: CpuLockCell<bool>,
    context_switches: CpuLockCell<u64>,
    pub(crate) timeouts: TimeoutList,
}

pub(crate) static SCHEDULER: Scheduler = Scheduler {
    runnable: ThreadList::new(TaskSt::Runnable),
    sleeping: ThreadList::new(TaskSt::Sleeping),
    terminated: ThreadList::new(TaskSt::Terminated),
    current: CpuLockCell::new(None),
    switch_pending: CpuLockCell::new(false),
    context_switches: CpuLockCell::new(0),
    timeouts: TimeoutList::new(),
};

/// The thread that owns the processor. `None` only before the first
/// dispatch.
#[inline]
pub(crate) fn current_task(cs: CriticalSection<'_>) -> Option<TaskRef> {
    SCHEDULER.current.get(cs)
}

#[inline]
pub(crate) fn context_switch_count(cs: CriticalSection<'_>) -> u64 {
    SCHEDULER.context_switches.get(cs)
}

/// Insert a new thread into the runnable list. The caller checks that
/// the thread is in the `New` state and performs the preemption check.
pub(crate) fn add(cs: CriticalSection<'_>, task: TaskRef) {
    debug_assert_eq!(task.state.get(cs), TaskSt::New);
    task.reset_quantum(cs);
    SCHEDULER.runnable.insert(cs, task);
}

/// Hand the processor to `next` without leaving the critical section.
fn switch_to(cs: CriticalSection<'_>, next: TaskRef) {
    SCHEDULER.current.set(cs, Some(next));
    SCHEDULER.context_switches.update(cs, |x| x + 1);
    let id = next
        .port_thread
        .get(cs)
        .expect("a scheduled thread always has an execution context");
    port().resume(id);
}

/// Perform the first context switch. Called by the port once the idle
/// thread and the initial application threads have been started; the
/// calling (boot) context must not use kernel services afterwards.
pub fn dispatch_first() {
    let guard = lock_cpu();
    let cs = guard.token();
    assert!(
        SCHEDULER.current.get(cs).is_none(),
        "the first dispatch already happened"
    );
    let front = SCHEDULER
        .runnable
        .front(cs)
        .expect("no threads have been started");
    switch_to(cs, front);
}

/// Re-select the highest-effective-priority runnable thread and, if the
/// caller lost the processor, suspend the calling context until it is
/// scheduled again.
fn switch_away(guard: CpuLockGuard) {
    let lost_cpu = {
        let cs = guard.token();
        let me = SCHEDULER
            .current
            .get(cs)
            .expect("switching away from no thread");
        let front = SCHEDULER
            .runnable
            .front(cs)
            .expect("the runnable list is empty");
        if front == me {
            false
        } else {
            switch_to(cs, front);
            true
        }
    };
    drop(guard);
    if lost_cpu {
        port().suspend_current();
    }
}

/// Relinquish the critical section; first, if a runnable thread has a
/// strictly higher effective priority than the current one, switch to it.
///
/// System services that may have made a higher-priority thread runnable
/// call this before returning to the caller. In interrupt context the
/// switch is deferred to [`interrupt_exit`].
pub(crate) fn unlock_and_check_preemption(guard: CpuLockGuard) {
    let lost_cpu = {
        let cs = guard.token();
        if port().is_interrupt_context() {
            false
        } else {
            match (SCHEDULER.current.get(cs), SCHEDULER.runnable.front(cs)) {
                (Some(cur), Some(front))
                    if front != cur
                        && front.effective_priority(cs) > cur.effective_priority(cs) =>
                {
                    switch_to(cs, front);
                    true
                }
                _ => false,
            }
        }
    };
    drop(guard);
    if lost_cpu {
        port().suspend_current();
    }
}

/// Move the current thread to the tail of its priority group and
/// re-select.
pub(crate) fn yield_current(guard: CpuLockGuard) {
    {
        let cs = guard.token();
        let Some(me) = SCHEDULER.current.get(cs) else {
            return;
        };
        SCHEDULER.runnable.remove(cs, me);
        SCHEDULER.runnable.insert(cs, me);
        me.reset_quantum(cs);
    }
    switch_away(guard);
}

/// Block the current thread on `list`. Returns `Ok(())` when the thread
/// is later unblocked by request.
pub(crate) fn block(
    guard: CpuLockGuard,
    list: &ThreadList,
    functor: Option<UnblockFunctorRef>,
) -> Result<(), Error> {
    block_common(guard, list, None, functor)
}

/// As [`block`], with a deadline: a one-shot timeout scheduled in the
/// same critical section wakes the thread with reason `Timeout`, which is
/// translated to [`Error::TimedOut`]. If the thread is unblocked first,
/// the timeout is cancelled.
pub(crate) fn block_until(
    guard: CpuLockGuard,
    list: &ThreadList,
    deadline: TimePoint,
    functor: Option<UnblockFunctorRef>,
) -> Result<(), Error> {
    block_common(guard, list, Some(deadline), functor)
}

fn block_common(
    guard: CpuLockGuard,
    list: &ThreadList,
    deadline: Option<TimePoint>,
    functor: Option<UnblockFunctorRef>,
) -> Result<(), Error> {
    debug_assert!(!port().is_interrupt_context());

    let wait_timeout = Timeout::new(timeout_unblock);
    {
        let cs = guard.token();
        let me = SCHEDULER
            .current
            .get(cs)
            .expect("blocking with no current thread");
        SCHEDULER.runnable.remove(cs, me);
        list.insert(cs, me);
        me.unblock.set(cs, UnblockSlot::Blocked(functor));
        if let Some(at) = deadline {
            wait_timeout.set_expiration(cs, at);
            wait_timeout.set_param(cs, me.as_usize());
            // Safety: the node lives in this frame, which stays put until
            // the removal below; the thread is parked in between.
            unsafe { SCHEDULER.timeouts.insert(cs, &wait_timeout) };
        }
    }
    switch_away(guard);

    // Woken up. Unlink the deadline timer if it has not fired, and read
    // the recorded reason.
    let reason = {
        let guard = lock_cpu();
        let cs = guard.token();
        SCHEDULER.timeouts.remove(cs, &wait_timeout);
        let me = SCHEDULER.current.get(cs).expect("woken with no current thread");
        match me.unblock.get(cs) {
            UnblockSlot::Reason(reason) => reason,
            UnblockSlot::Blocked(_) => unreachable!("woken thread has no unblock reason"),
        }
    };
    match reason {
        UnblockReason::Request => Ok(()),
        UnblockReason::Timeout => Err(Error::TimedOut),
    }
}

/// The timeout callback planted by [`block_until`].
fn timeout_unblock(param: usize, guard: CpuLockGuard) -> CpuLockGuard {
    let cs = guard.token();
    // Safety: the parameter was stored from a live reference by
    // `block_common`.
    let task = unsafe { TaskRef::from_usize(param) };
    // The thread may have been unblocked by request in the same tick,
    // after this timeout became due but before it was cancelled.
    if task.state.get(cs).is_blocked() {
        unblock(cs, task, UnblockReason::Timeout);
    }
    guard
}

/// Remove `task` from its blocking list, run its unblock functor (which
/// observes the primitive's state before any other thread can), record
/// the reason, and make the thread runnable again.
///
/// The caller re-evaluates preemption afterwards
/// ([`unlock_and_check_preemption`] or interrupt exit).
pub(crate) fn unblock(cs: CriticalSection<'_>, task: TaskRef, reason: UnblockReason) {
    let Some(list_ref) = task.list.get(cs) else {
        debug_assert!(false, "unblocking a thread that is not blocked");
        return;
    };
    debug_assert!(task.state.get(cs).is_blocked());

    // Safety: a blocked thread's containing list is alive (kept so by the
    // blocked thread's borrow of the owning primitive).
    unsafe { list_ref.get() }.remove(cs, task);

    if let UnblockSlot::Blocked(Some(functor)) = task.unblock.get(cs) {
        functor.call(cs, task.get());
    }
    task.unblock.set(cs, UnblockSlot::Reason(reason));
    task.reset_quantum(cs);
    SCHEDULER.runnable.insert(cs, task);
}

/// Block the current thread until the given time point.
pub(crate) fn sleep_until(guard: CpuLockGuard, deadline: TimePoint) -> Result<(), Error> {
    match block_until(guard, &SCHEDULER.sleeping, deadline, None) {
        // Reaching the deadline is how a sleep completes.
        Err(Error::TimedOut) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Terminate the current thread: post its join semaphore, move it to the
/// terminated list and hand the processor over. The calling context never
/// runs again after this returns; the port reclaims it.
pub(crate) fn exit_current(join_sem: &Semaphore) {
    let guard = lock_cpu();
    let cs = guard.token();
    let me = SCHEDULER
        .current
        .get(cs)
        .expect("terminating with no current thread");
    debug_assert!(
        me.last_owned_mutex.get(cs).is_none(),
        "terminating while holding priority-protocol mutexes"
    );
    SCHEDULER.runnable.remove(cs, me);
    SCHEDULER.terminated.insert(cs, me);
    let _ = join_sem.post_locked(cs);
    let front = SCHEDULER
        .runnable
        .front(cs)
        .expect("the runnable list is empty");
    switch_to(cs, front);
}

/// The tick interrupt handler: advance the clock, charge the round-robin
/// quantum, then fire every due timer in order.
///
/// Must be called from interrupt context with the critical section
/// released.
pub fn tick() {
    debug_assert!(port().is_interrupt_context());

    let mut guard = lock_cpu();
    let now = {
        let cs = guard.token();
        let now = TickClock::advance(cs);
        if let Some(cur) = SCHEDULER.current.get(cs) {
            if cur.policy == SchedulingPolicy::RoundRobin {
                let quantum = cur.quantum.update(cs, |q| q.saturating_sub(1));
                if quantum == 0 {
                    // The slice is exhausted: rotate the thread behind its
                    // priority group and request a switch.
                    SCHEDULER.runnable.remove(cs, cur);
                    SCHEDULER.runnable.insert(cs, cur);
                    cur.reset_quantum(cs);
                    SCHEDULER.switch_pending.set(cs, true);
                }
            }
        }
        now
    };

    // Timer callbacks may release the critical section (software timer
    // actions run unmasked), so the list head is re-read every iteration.
    loop {
        let due = {
            let cs = guard.token();
            SCHEDULER.timeouts.pop_due(cs, now)
        };
        match due {
            Some((callback, param)) => guard = callback(param, guard),
            None => break,
        }
    }
    drop(guard);
}

/// Honor any context switch request accumulated during an interrupt.
/// Called by the port on every interrupt exit.
pub fn interrupt_exit() {
    let guard = lock_cpu();
    let cs = guard.token();
    let pending = SCHEDULER.switch_pending.replace(cs, false);
    let (Some(cur), Some(front)) = (SCHEDULER.current.get(cs), SCHEDULER.runnable.front(cs))
    else {
        return;
    };
    if front != cur && (pending || front.effective_priority(cs) > cur.effective_priority(cs)) {
        let old_id = cur
            .port_thread
            .get(cs)
            .expect("a scheduled thread always has an execution context");
        SCHEDULER.current.set(cs, Some(front));
        SCHEDULER.context_switches.update(cs, |x| x + 1);
        // Stop the preempted context before letting the new one run, so
        // that at most one thread owns the processor.
        port().preempt(old_id);
        port().resume(
            front
                .port_thread
                .get(cs)
                .expect("a scheduled thread always has an execution context"),
        );
    }
}
