//! A semaphore post from interrupt context preempts the running thread
//! and resumes the blocked, higher-priority one on interrupt exit.
use std::sync::atomic::{AtomicBool, Ordering};

use takt_kernel::{statistics, SchedulingPolicy, Semaphore, StackStorage, Thread};

mod common;
use common::{run_scenario, SeqTracker};

static SEM: Semaphore = Semaphore::new(0);
static SEQ: SeqTracker = SeqTracker::new();
static STOP: AtomicBool = AtomicBool::new(false);

static LOW_STACK: StackStorage<16384> = StackStorage::new();
static LOW: Thread = Thread::new(&LOW_STACK, 10, SchedulingPolicy::Cooperative, low_body, 0);

fn post_isr() {
    SEM.post().unwrap();
}

fn low_body(_: usize) {
    SEQ.expect_and_replace(1, 2);
    let mut raised = false;
    loop {
        if !raised {
            raised = true;
            takt_port_std::raise_interrupt(post_isr);
        }
        if STOP.load(Ordering::SeqCst) {
            break;
        }
        std::hint::spin_loop();
    }
}

fn scenario() {
    LOW.start().unwrap();
    SEQ.expect_and_replace(0, 1);

    let switches_before = statistics::context_switch_count();
    SEM.wait().unwrap(); // blocks; `LOW` runs and raises the interrupt
    let switches_after = statistics::context_switch_count();

    // One switch into `LOW`, one back on interrupt exit.
    assert_eq!(switches_after - switches_before, 2);
    assert_eq!(SEQ.get(), 2);
    assert_eq!(SEM.value(), 0);

    STOP.store(true, Ordering::SeqCst);
    LOW.join().unwrap();
}

#[test]
fn preempt_on_post() {
    run_scenario(50, scenario);
}
