//! Utilities shared by the kernel scenario tests.
#![allow(dead_code)]
use std::any::Any;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Checks the sequential execution of multiple threads.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Assert that the tracker reads `old` and replace it with `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        let got = self
            .counter
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst);
        assert_eq!(got, Ok(old), "unexpected sequence position");
    }
}

/// An execution-order recorder; safe to use from any kernel context.
pub struct OrderLog {
    entries: critical_section::Mutex<core::cell::RefCell<Vec<usize>>>,
}

impl OrderLog {
    pub const fn new() -> Self {
        Self {
            entries: critical_section::Mutex::new(core::cell::RefCell::new(Vec::new())),
        }
    }

    pub fn push(&self, value: usize) {
        critical_section::with(|cs| self.entries.borrow(cs).borrow_mut().push(value));
    }

    /// Append `value` only if it differs from the last recorded entry.
    pub fn push_transition(&self, value: usize) {
        critical_section::with(|cs| {
            let mut entries = self.entries.borrow(cs).borrow_mut();
            if entries.last() != Some(&value) {
                entries.push(value);
            }
        });
    }

    pub fn snapshot(&self) -> Vec<usize> {
        critical_section::with(|cs| self.entries.borrow(cs).borrow().clone())
    }
}

static SCENARIO_MAIN: AtomicUsize = AtomicUsize::new(0);
static SCENARIO_PANIC: Mutex<Option<Box<dyn Any + Send>>> = Mutex::new(None);

/// Boot the kernel, run `main` as the main kernel thread at the given
/// priority, shut down when it finishes, and propagate any panic to the
/// test harness.
///
/// Helper threads must not panic (a dead helper leaves its joiner
/// blocked forever); they record, and the main thread asserts.
pub fn run_scenario(priority: u8, main: fn()) {
    SCENARIO_MAIN.store(main as usize, Ordering::SeqCst);
    takt_port_std::run(priority, scenario_main);
    if let Some(payload) = SCENARIO_PANIC.lock().unwrap().take() {
        panic::resume_unwind(payload);
    }
}

fn scenario_main() {
    // Safety: `run_scenario` stored a plain `fn()`.
    let main: fn() = unsafe { std::mem::transmute(SCENARIO_MAIN.load(Ordering::SeqCst)) };
    if let Err(payload) = panic::catch_unwind(main) {
        *SCENARIO_PANIC.lock().unwrap() = Some(payload);
    }
    takt_port_std::shutdown();
}
