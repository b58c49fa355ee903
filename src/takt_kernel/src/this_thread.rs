//! Operations on the calling thread.
use crate::{
    error::Error,
    klock::lock_cpu,
    sched,
    time::{deadline_after, Duration, TimePoint},
};

/// Move the calling thread behind every other runnable thread of its
/// effective priority and re-select.
pub fn yield_now() {
    sched::yield_current(lock_cpu());
}

/// Suspend the calling thread for `duration`, plus one tick of slack so
/// that the wakeup cannot land in the current tick; the thread resumes
/// exactly at `now() + duration + 1` ticks when nothing higher-priority
/// is running.
pub fn sleep_for(duration: Duration) -> Result<(), Error> {
    sleep_until(deadline_after(duration))
}

/// Suspend the calling thread until `deadline`.
pub fn sleep_until(deadline: TimePoint) -> Result<(), Error> {
    sched::sleep_until(lock_cpu(), deadline)
}

/// The calling thread's base priority.
pub fn priority() -> u8 {
    let guard = lock_cpu();
    let cs = guard.token();
    sched::current_task(cs)
        .expect("no current thread")
        .base_priority
        .get(cs)
}

/// The calling thread's effective priority.
pub fn effective_priority() -> u8 {
    let guard = lock_cpu();
    let cs = guard.token();
    sched::current_task(cs)
        .expect("no current thread")
        .effective_priority(cs)
}

/// Signal operations on the calling thread.
pub mod signals {
    use core::sync::atomic::{AtomicU32, Ordering};

    use crate::{
        error::Error,
        klock::{lock_cpu, CriticalSection},
        list::ThreadList,
        sched, signal,
        signal::{SignalSet, SignalSetRef},
        task::{TaskCb, TaskSt, UnblockFunctor, UnblockFunctorRef},
        time::{deadline_after, Duration, TimePoint},
    };

    /// Generate `signal` for the calling thread.
    pub fn generate_signal(signal: u8) -> Result<(), Error> {
        let guard = lock_cpu();
        let cs = guard.token();
        let me = sched::current_task(cs).expect("no current thread");
        signal::generate(cs, me, signal)
    }

    /// The set of signals generated for the calling thread but not yet
    /// accepted.
    pub fn pending_signal_set() -> SignalSet {
        let guard = lock_cpu();
        let cs = guard.token();
        sched::current_task(cs)
            .expect("no current thread")
            .pending_signals
            .get(cs)
    }

    /// Wait until a signal in `set` is pending, then accept (clear) the
    /// lowest-numbered one and return it.
    pub fn wait(set: SignalSet) -> Result<u8, Error> {
        wait_impl(set, false, None)
    }

    /// Accept a pending signal in `set` if there is one, otherwise fail
    /// with [`Error::WouldBlock`].
    pub fn try_wait(set: SignalSet) -> Result<u8, Error> {
        wait_impl(set, true, None)
    }

    /// As [`wait`], giving up with [`Error::TimedOut`] after `duration`
    /// (plus one tick of slack).
    pub fn try_wait_for(set: SignalSet, duration: Duration) -> Result<u8, Error> {
        wait_impl(set, false, Some(deadline_after(duration)))
    }

    /// As [`wait`], giving up with [`Error::TimedOut`] at `deadline`.
    pub fn try_wait_until(set: SignalSet, deadline: TimePoint) -> Result<u8, Error> {
        wait_impl(set, false, Some(deadline))
    }

    /// Snapshots the woken thread's pending set and clears its awaited
    /// set, inside the critical section of whoever performs the unblock.
    /// This way the waking thread observes the signal state *at wake
    /// time*, immune to a second generator racing in between.
    struct SignalsWaitUnblockFunctor<'a> {
        snapshot: &'a AtomicU32,
    }

    impl UnblockFunctor for SignalsWaitUnblockFunctor<'_> {
        fn unblocked(&self, cs: CriticalSection<'_>, task: &TaskCb) {
            self.snapshot
                .store(task.pending_signals.get(cs).bits(), Ordering::Release);
            task.awaited_signals.set(cs, None);
        }
    }

    fn wait_impl(
        set: SignalSet,
        non_blocking: bool,
        deadline: Option<TimePoint>,
    ) -> Result<u8, Error> {
        let guard = lock_cpu();
        let me = {
            let cs = guard.token();
            sched::current_task(cs).expect("signal operations require a thread context")
        };

        {
            let cs = guard.token();
            let hit = me.pending_signals.get(cs).intersection(set);
            if let Some(signal) = hit.lowest() {
                signal::accept(cs, me, signal)?;
                return Ok(signal);
            }
            if non_blocking {
                return Err(Error::WouldBlock);
            }
        }

        // Nothing pending: wait on a list planted in this frame, with a
        // functor that captures the pending set at the instant of wake.
        let snapshot = AtomicU32::new(0);
        let waiting_list = ThreadList::new(TaskSt::WaitingForSignal);
        let functor = SignalsWaitUnblockFunctor {
            snapshot: &snapshot,
        };
        {
            let cs = guard.token();
            // Safety: `set` lives in this frame, which stays put until
            // the wait completes; the functor clears the reference.
            me.awaited_signals
                .set(cs, Some(unsafe { SignalSetRef::new(&set) }));
        }
        // Safety: `functor` lives in this frame; see above.
        let functor_ref = unsafe { UnblockFunctorRef::new(&functor) };
        match deadline {
            None => sched::block(guard, &waiting_list, Some(functor_ref))?,
            Some(at) => sched::block_until(guard, &waiting_list, at, Some(functor_ref))?,
        }

        let woken_pending = SignalSet::from_bits(snapshot.load(Ordering::Acquire));
        let signal = match woken_pending.intersection(set).lowest() {
            Some(signal) => signal,
            None => unreachable!("woken without an awaited signal pending"),
        };
        let guard = lock_cpu();
        signal::accept(guard.token(), me, signal)?;
        Ok(signal)
    }
}
