//! Priority inheritance bounds priority inversion: the lock owner is
//! boosted over a middle-priority spinner, and the boost propagates
//! transitively across a chain of inheritance mutexes.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use takt_kernel::{
    this_thread, Duration, Mutex, MutexProtocol, MutexType, SchedulingPolicy, StackStorage, Thread,
};

mod common;
use common::run_scenario;

fn sleep_ticks(ticks: u64) {
    this_thread::sleep_for(Duration::from_ticks(ticks)).unwrap();
}

// --- direct inheritance: H (100) / M (50) / L (10) ---

static MX: Mutex = Mutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance);
static STOP_M: AtomicBool = AtomicBool::new(false);
static L_BOOSTED_TO: AtomicUsize = AtomicUsize::new(0);
static H_GOT_LOCK: AtomicBool = AtomicBool::new(false);

static L_STACK: StackStorage<16384> = StackStorage::new();
static M_STACK: StackStorage<16384> = StackStorage::new();
static H_STACK: StackStorage<16384> = StackStorage::new();
static L_THREAD: Thread = Thread::new(&L_STACK, 10, SchedulingPolicy::Cooperative, l_body, 0);
static M_THREAD: Thread = Thread::new(&M_STACK, 50, SchedulingPolicy::Cooperative, m_body, 0);
static H_THREAD: Thread = Thread::new(&H_STACK, 100, SchedulingPolicy::Cooperative, h_body, 0);

fn l_body(_: usize) {
    MX.lock().unwrap();
    // With `M` spinning above this thread's base priority, this loop
    // only makes progress once `H`'s lock attempt boosts it.
    loop {
        let effective = this_thread::effective_priority();
        if effective > 10 {
            L_BOOSTED_TO.store(effective as usize, Ordering::SeqCst);
            break;
        }
        std::hint::spin_loop();
    }
    MX.unlock().unwrap();
}

fn m_body(_: usize) {
    while !STOP_M.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
}

fn h_body(_: usize) {
    MX.lock().unwrap();
    H_GOT_LOCK.store(true, Ordering::SeqCst);
    MX.unlock().unwrap();
}

// --- transitive inheritance: H2 -> L2 -> L1 across two mutexes ---

static MX_A: Mutex = Mutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance);
static MX_B: Mutex = Mutex::new(MutexType::Normal, MutexProtocol::PriorityInheritance);
static RELEASE_A: AtomicBool = AtomicBool::new(false);

static L1_STACK: StackStorage<16384> = StackStorage::new();
static L2_STACK: StackStorage<16384> = StackStorage::new();
static H2_STACK: StackStorage<16384> = StackStorage::new();
static L1_THREAD: Thread = Thread::new(&L1_STACK, 10, SchedulingPolicy::Cooperative, l1_body, 0);
static L2_THREAD: Thread = Thread::new(&L2_STACK, 20, SchedulingPolicy::Cooperative, l2_body, 0);
static H2_THREAD: Thread = Thread::new(&H2_STACK, 100, SchedulingPolicy::Cooperative, h2_body, 0);

fn l1_body(_: usize) {
    MX_A.lock().unwrap();
    while !RELEASE_A.load(Ordering::SeqCst) {
        std::hint::spin_loop();
    }
    MX_A.unlock().unwrap();
}

fn l2_body(_: usize) {
    MX_B.lock().unwrap();
    MX_A.lock().unwrap(); // blocks on L1
    MX_A.unlock().unwrap();
    MX_B.unlock().unwrap();
}

fn h2_body(_: usize) {
    MX_B.lock().unwrap(); // blocks on L2, boosting L2 and then L1
    MX_B.unlock().unwrap();
}

fn scenario() {
    // Direct inheritance. `L` takes the lock, `M` saturates the
    // processor above `L`'s base priority, then `H` contends.
    L_THREAD.start().unwrap();
    sleep_ticks(2); // `L` locks and starts spinning
    assert!(MX.is_locked());

    M_THREAD.start().unwrap();
    H_THREAD.start().unwrap();
    H_THREAD.join().unwrap();

    assert_eq!(L_BOOSTED_TO.load(Ordering::SeqCst), 100);
    assert!(H_GOT_LOCK.load(Ordering::SeqCst));
    STOP_M.store(true, Ordering::SeqCst);
    M_THREAD.join().unwrap();
    L_THREAD.join().unwrap();
    assert_eq!(L_THREAD.effective_priority(), 10);

    // Transitive inheritance across two mutexes.
    L1_THREAD.start().unwrap();
    sleep_ticks(2); // L1 owns A
    L2_THREAD.start().unwrap();
    sleep_ticks(2); // L2 owns B, blocks on A; L1 boosted to 20
    assert_eq!(L1_THREAD.effective_priority(), 20);
    H2_THREAD.start().unwrap();
    sleep_ticks(2); // H2 blocks on B; the boost walks B's owner to A's
    assert_eq!(L2_THREAD.effective_priority(), 100);
    assert_eq!(L1_THREAD.effective_priority(), 100);

    RELEASE_A.store(true, Ordering::SeqCst);
    H2_THREAD.join().unwrap();
    L2_THREAD.join().unwrap();
    L1_THREAD.join().unwrap();
    assert_eq!(L1_THREAD.effective_priority(), 10);
    assert_eq!(L2_THREAD.effective_priority(), 20);
}

#[test]
fn mutex_priority_inheritance() {
    run_scenario(200, scenario);
}
