//! A preemptive, priority-based real-time kernel for single-core
//! embedded microcontrollers.
//!
//! The kernel provides fixed-priority threads with cooperative or
//! round-robin scheduling within a priority level, counting semaphores,
//! mutexes with priority-inheritance and priority-ceiling protocols,
//! condition variables, FIFO and priority message queues, time-triggered
//! software timers, POSIX-style per-thread signals, and a tick clock.
//! All kernel storage is caller-provided; blocking never allocates.
//!
//! Architecture-specific context switching and interrupt masking are
//! consumed through two seams: the [`Port`] trait and the
//! `critical-section` crate. A port drives the kernel by registering
//! itself ([`register_port`]), starting the initial threads, calling
//! [`dispatch_first`], invoking [`tick`] from the tick interrupt, and
//! calling [`interrupt_exit`] on the exit path of every interrupt.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cfg;
mod condvar;
mod error;
mod klock;
mod list;
mod mutex;
pub mod port;
mod queue;
mod sched;
mod semaphore;
mod signal;
pub mod statistics;
mod task;
pub mod this_thread;
mod thread;
mod time;
mod timeout;
mod timer;

pub use condvar::ConditionVariable;
pub use error::Error;
pub use mutex::{Mutex, MutexProtocol, MutexType};
pub use port::{register_port, Port, PortThreadId, ThreadEntry};
pub use queue::{FifoQueue, MessageQueue};
pub use sched::{dispatch_first, interrupt_exit, tick};
pub use semaphore::Semaphore;
pub use signal::{SignalSet, SIGNAL_COUNT};
pub use task::SchedulingPolicy;
pub use thread::{StackStorage, Thread};
pub use time::{Duration, TickClock, TimePoint};
pub use timer::SoftwareTimer;
