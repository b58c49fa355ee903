//! Four round-robin threads at one priority run in their start order,
//! one quantum each.
use std::sync::atomic::{AtomicBool, Ordering};

use takt_kernel::{cfg::QUANTUM_TICKS, Duration, SchedulingPolicy, StackStorage, Thread};

mod common;
use common::{run_scenario, OrderLog};

static TRANSITIONS: OrderLog = OrderLog::new();
static STOP: AtomicBool = AtomicBool::new(false);

static STACK_A: StackStorage<16384> = StackStorage::new();
static STACK_B: StackStorage<16384> = StackStorage::new();
static STACK_C: StackStorage<16384> = StackStorage::new();
static STACK_D: StackStorage<16384> = StackStorage::new();
static WORKERS: [Thread; 4] = [
    Thread::new(&STACK_A, 5, SchedulingPolicy::RoundRobin, spin_body, 0),
    Thread::new(&STACK_B, 5, SchedulingPolicy::RoundRobin, spin_body, 1),
    Thread::new(&STACK_C, 5, SchedulingPolicy::RoundRobin, spin_body, 2),
    Thread::new(&STACK_D, 5, SchedulingPolicy::RoundRobin, spin_body, 3),
];

fn spin_body(id: usize) {
    while !STOP.load(Ordering::SeqCst) {
        TRANSITIONS.push_transition(id);
    }
}

fn scenario() {
    for worker in &WORKERS {
        worker.start().unwrap();
    }

    // Sleep through two full rotations (plus slack); the workers take
    // turns below this thread's priority.
    let two_rounds = 2 * WORKERS.len() as u64 * QUANTUM_TICKS as u64;
    takt_kernel::this_thread::sleep_for(Duration::from_ticks(two_rounds + 2)).unwrap();

    STOP.store(true, Ordering::SeqCst);
    for worker in &WORKERS {
        worker.join().unwrap();
    }

    let transitions = TRANSITIONS.snapshot();
    assert!(
        transitions.len() >= 8,
        "expected two full rotations, got {transitions:?}"
    );
    for (i, &id) in transitions.iter().take(8).enumerate() {
        assert_eq!(id, i % 4, "unexpected rotation order: {transitions:?}");
    }
}

#[test]
fn round_robin() {
    run_scenario(50, scenario);
}
