//! Simulator port of the takt kernel.
//!
//! Runs the kernel on top of a host OS: each kernel thread is backed by
//! a host thread that is parked whenever the kernel has scheduled
//! another one, interrupts (including the tick interrupt) are simulated
//! on a dedicated dispatcher thread, and the kernel critical section is
//! the `critical-section` crate's `std` implementation. Preempting a
//! busy thread from interrupt context uses the remote-park operation of
//! [`threading`].
//!
//! There is no way to restart the simulated system within one process;
//! run one kernel scenario per test binary.
use std::cell::Cell;
use std::sync::{mpsc, Condvar, Mutex as StdMutex};
use std::time::{Duration as StdDuration, Instant};

use takt_kernel::{
    cfg::TICK_RATE_HZ, register_port, Port, PortThreadId, SchedulingPolicy, StackStorage, Thread,
    ThreadEntry,
};

mod threading;

/// The role of a host thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The thread that called [`run`].
    Boot,
    /// The backing thread for all interrupt contexts.
    Interrupt,
    /// The backing thread for a kernel thread.
    Task,
}

thread_local! {
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };
}

/// A simulated interrupt request.
enum Irq {
    User(fn()),
    Shutdown,
}

/// The internal state of the port.
struct State {
    /// Backing threads, indexed by `PortThreadId`.
    threads: spin::Mutex<Vec<threading::Thread>>,
    irq_send: spin::Mutex<Option<mpsc::Sender<Irq>>>,
    shutdown: StdMutex<bool>,
    shutdown_cond: Condvar,
}

static PORT_STATE: State = State {
    threads: spin::Mutex::new(Vec::new()),
    irq_send: spin::Mutex::new(None),
    shutdown: StdMutex::new(false),
    shutdown_cond: Condvar::new(),
};

// Safety: `resume` deposits a counted token, so permits are never lost;
// `suspend_current` consumes one; `preempt` stops the target before
// returning (see `threading::Thread::park_remote`).
unsafe impl Port for State {
    fn spawn(&self, _stack: *mut [u8], entry: ThreadEntry, param: usize) -> PortThreadId {
        log::trace!("spawn({:#x})", entry as usize);
        let thread = threading::spawn(move || {
            THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
            // Wait to be scheduled for the first time.
            threading::park_current();
            log::trace!("thread {:?} starts", std::thread::current().id());
            entry(param);
            log::trace!("thread {:?} is done", std::thread::current().id());
        });
        let mut threads = self.threads.lock();
        threads.push(thread);
        PortThreadId(threads.len() - 1)
    }

    fn resume(&self, thread: PortThreadId) {
        log::trace!("resume({thread:?})");
        let t = self.threads.lock()[thread.0].clone();
        t.unpark();
    }

    fn suspend_current(&self) {
        log::trace!("suspend_current");
        threading::park_current();
    }

    fn preempt(&self, thread: PortThreadId) {
        log::trace!("preempt({thread:?})");
        debug_assert!(self.is_interrupt_context());
        let t = self.threads.lock()[thread.0].clone();
        t.park_remote();
    }

    fn is_interrupt_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Interrupt
    }
}

static IDLE_STACK: StackStorage<4096> = StackStorage::new();
static MAIN_STACK: StackStorage<65536> = StackStorage::new();

/// Boot the kernel and run `main` as the entry point of the main kernel
/// thread, at the given priority.
///
/// Starts the idle thread (priority 0), performs the first dispatch and
/// drives the tick interrupt at [`TICK_RATE_HZ`]. Returns once
/// [`shutdown`] has been called from kernel code.
///
/// Can only be called once per process.
pub fn run(main_priority: u8, main: fn()) {
    let _ = env_logger::try_init();

    register_port(&PORT_STATE);

    let (irq_send, irq_recv) = mpsc::channel();
    *PORT_STATE.irq_send.lock() = Some(irq_send);

    THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

    let idle = &*Box::leak(Box::new(Thread::new(
        &IDLE_STACK,
        0,
        SchedulingPolicy::Cooperative,
        idle_body,
        0,
    )));
    let main_thread = &*Box::leak(Box::new(Thread::new(
        &MAIN_STACK,
        main_priority,
        SchedulingPolicy::Cooperative,
        call_main,
        main as usize,
    )));
    idle.start().expect("failed to start the idle thread");
    main_thread.start().expect("failed to start the main thread");

    takt_kernel::dispatch_first();

    let dispatcher = std::thread::spawn(move || interrupt_dispatcher(irq_recv));

    // Wait for the shutdown request.
    let mut down = PORT_STATE.shutdown.lock().unwrap();
    while !*down {
        down = PORT_STATE.shutdown_cond.wait(down).unwrap();
    }
    drop(down);

    if let Some(sender) = PORT_STATE.irq_send.lock().take() {
        let _ = sender.send(Irq::Shutdown);
    }
    dispatcher.join().unwrap();
    log::trace!("shut down");
}

/// Initiate shutdown: [`run`] returns once the interrupt dispatcher has
/// stopped. Kernel threads still blocked or running are abandoned.
pub fn shutdown() {
    log::trace!("shutdown requested");
    *PORT_STATE.shutdown.lock().unwrap() = true;
    PORT_STATE.shutdown_cond.notify_all();
}

/// Simulate an interrupt: `handler` runs in interrupt context, where it
/// may use the interrupt-safe subset of the kernel API (posts, signal
/// generation, non-blocking queue operations) but must not block. A
/// context switch it causes is honored on interrupt exit.
///
/// Asynchronous: returns once the request is queued.
pub fn raise_interrupt(handler: fn()) {
    let sender = PORT_STATE.irq_send.lock();
    sender
        .as_ref()
        .expect("the kernel is not running")
        .send(Irq::User(handler))
        .expect("the interrupt dispatcher is gone");
}

/// The backing thread for every simulated interrupt. Ticks at
/// [`TICK_RATE_HZ`] with a `recv_timeout` loop, and executes injected
/// interrupts in between.
fn interrupt_dispatcher(irq_recv: mpsc::Receiver<Irq>) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));
    let tick_period = StdDuration::from_micros(1_000_000 / TICK_RATE_HZ as u64);
    let mut next_tick = Instant::now() + tick_period;
    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match irq_recv.recv_timeout(timeout) {
            Ok(Irq::User(handler)) => {
                log::trace!("interrupt");
                handler();
                takt_kernel::interrupt_exit();
            }
            Ok(Irq::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                takt_kernel::tick();
                takt_kernel::interrupt_exit();
                next_tick += tick_period;
            }
        }
    }
}

fn call_main(param: usize) {
    // Safety: `run` stored a plain `fn()` here.
    let main: fn() = unsafe { std::mem::transmute(param) };
    main();
}

/// The idle thread guarantees the runnable list is never empty. It owns
/// the processor only when nothing else is runnable; the short sleep
/// stands in for "wait for interrupt".
fn idle_body(_: usize) {
    loop {
        std::thread::sleep(StdDuration::from_micros(100));
    }
}
