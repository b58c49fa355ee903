//! Threads.
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;

use crate::{
    error::Error,
    klock::lock_cpu,
    port::port,
    sched,
    semaphore::Semaphore,
    signal,
    task::{SchedulingPolicy, TaskCb, TaskRef, TaskSt},
};

/// Caller-provided storage for a thread's stack.
///
/// The kernel never allocates stacks; the region is handed to the port
/// when the thread is started. A hosted port may ignore it.
pub struct StackStorage<const N: usize> {
    storage: UnsafeCell<[MaybeUninit<u8>; N]>,
}

// Safety: the contents are only written by the port while building the
// initial stack frame, and by the thread that runs on it afterwards.
unsafe impl<const N: usize> Sync for StackStorage<N> {}

impl<const N: usize> StackStorage<N> {
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([MaybeUninit::uninit(); N]),
        }
    }
}

impl<const N: usize> Default for StackStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread of execution.
///
/// A thread is constructed in the `New` state and enters the scheduler
/// with [`start`](Self::start). It terminates by returning from its
/// entry function, which releases its join semaphore.
pub struct Thread {
    task: TaskCb,
    join_sem: Semaphore,
    entry: fn(usize),
    entry_param: usize,
    stack_ptr: *mut u8,
    stack_len: usize,
}

// Safety: `TaskCb` and `Semaphore` are synchronized internally; the raw
// stack pointer is only handed to the port, once, at start.
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    /// Create a thread that will execute `entry(entry_param)` on the
    /// given stack once started.
    ///
    /// `priority` 0 is the lowest (reserved for the idle thread by
    /// convention), 255 the highest.
    pub const fn new<const N: usize>(
        stack: &'static StackStorage<N>,
        priority: u8,
        policy: SchedulingPolicy,
        entry: fn(usize),
        entry_param: usize,
    ) -> Self {
        Self {
            task: TaskCb::new(priority, policy),
            join_sem: Semaphore::with_max_value(0, 1),
            entry,
            entry_param,
            stack_ptr: stack.storage.get() as *mut u8,
            stack_len: N,
        }
    }

    /// Add the thread to the scheduler. Fails with [`Error::BadParam`]
    /// unless the thread is in the `New` state.
    pub fn start(&'static self) -> Result<(), Error> {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            if self.task.state.get(cs) != TaskSt::New {
                return Err(Error::BadParam);
            }
            let stack = core::ptr::slice_from_raw_parts_mut(self.stack_ptr, self.stack_len);
            let id = port().spawn(stack, thread_runner, self as *const Self as usize);
            self.task.port_thread.set(cs, Some(id));
            sched::add(cs, TaskRef::new(&self.task));
        }
        sched::unlock_and_check_preemption(guard);
        Ok(())
    }

    /// Wait until the thread terminates. Fails with
    /// [`Error::WouldDeadlock`] when a thread joins itself.
    ///
    /// The termination is signaled once; only one thread may join.
    pub fn join(&self) -> Result<(), Error> {
        {
            let guard = lock_cpu();
            let cs = guard.token();
            if let Some(current) = sched::current_task(cs) {
                if core::ptr::eq(current.get(), &self.task) {
                    return Err(Error::WouldDeadlock);
                }
            }
        }
        self.join_sem.wait()
    }

    /// The thread's base priority.
    pub fn priority(&self) -> u8 {
        let guard = lock_cpu();
        self.task.base_priority.get(guard.token())
    }

    /// The thread's effective priority: the base, possibly raised by a
    /// priority-protocol mutex it owns.
    pub fn effective_priority(&self) -> u8 {
        let guard = lock_cpu();
        self.task.effective_priority(guard.token())
    }

    /// Generate `signal` for this thread, waking it if it is currently
    /// waiting for that signal.
    pub fn generate_signal(&self, signal: u8) -> Result<(), Error> {
        let guard = lock_cpu();
        {
            let cs = guard.token();
            // Safety: the control block outlives its kernel visibility; a
            // thread can only be observed waiting after `start`, which
            // requires `'static`.
            let task = unsafe { TaskRef::from_usize(&self.task as *const TaskCb as usize) };
            signal::generate(cs, task, signal)?;
        }
        sched::unlock_and_check_preemption(guard);
        Ok(())
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("self", &(self as *const _))
            .field("priority", &self.priority())
            .finish()
    }
}

/// Every thread starts here: run the body, then run the termination
/// hook, which releases the join semaphore and hands the processor over.
fn thread_runner(param: usize) {
    // Safety: `start` passed a pointer to a live `'static Thread`.
    let thread = unsafe { &*(param as *const Thread) };
    (thread.entry)(thread.entry_param);
    sched::exit_current(&thread.join_sem);
}
