//! Ceiling-protocol boosts, recursion, and the mutex error contract.
use takt_kernel::{
    this_thread, Duration, Error, Mutex, MutexProtocol, MutexType, SchedulingPolicy, StackStorage,
    Thread,
};

mod common;
use common::{run_scenario, SeqTracker};

static SEQ: SeqTracker = SeqTracker::new();
static HELD: Mutex = Mutex::new(MutexType::Normal, MutexProtocol::None);

static HOLDER_STACK: StackStorage<16384> = StackStorage::new();
static HOLDER: Thread =
    Thread::new(&HOLDER_STACK, 60, SchedulingPolicy::Cooperative, holder_body, 0);

fn holder_body(_: usize) {
    HELD.lock().unwrap();
    SEQ.expect_and_replace(0, 1);
    this_thread::sleep_for(Duration::from_ticks(10)).unwrap();
    HELD.unlock().unwrap();
}

fn scenario() {
    // Ceiling boost while held, dropped on unlock.
    let ceiling = Mutex::with_ceiling(MutexType::Normal, 60);
    assert_eq!(this_thread::effective_priority(), 50);
    ceiling.lock().unwrap();
    assert_eq!(this_thread::effective_priority(), 60);
    ceiling.unlock().unwrap();
    assert_eq!(this_thread::effective_priority(), 50);

    // Locking above the ceiling is a contract violation.
    let low_ceiling = Mutex::with_ceiling(MutexType::Normal, 40);
    assert_eq!(low_ceiling.lock(), Err(Error::BadParam));

    // Self-deadlock is detected on a non-recursive mutex.
    let normal = Mutex::new(MutexType::Normal, MutexProtocol::None);
    normal.lock().unwrap();
    assert_eq!(normal.lock(), Err(Error::WouldDeadlock));
    normal.unlock().unwrap();
    assert_eq!(normal.unlock(), Err(Error::NotOwner));

    // Recursive locking releases at depth zero.
    let recursive = Mutex::new(MutexType::Recursive, MutexProtocol::None);
    recursive.lock().unwrap();
    recursive.lock().unwrap();
    recursive.unlock().unwrap();
    assert!(recursive.is_locked());
    recursive.unlock().unwrap();
    assert!(!recursive.is_locked());

    // Contention against another owner.
    HOLDER.start().unwrap(); // preempts, locks `HELD`, sleeps
    SEQ.expect_and_replace(1, 2);
    assert_eq!(HELD.unlock(), Err(Error::NotOwner));
    assert_eq!(HELD.try_lock(), Err(Error::Busy));
    assert_eq!(HELD.try_lock_for(Duration::from_ticks(2)), Err(Error::TimedOut));
    // The untimed lock succeeds once the holder wakes up and releases.
    HELD.lock().unwrap();
    HELD.unlock().unwrap();
    HOLDER.join().unwrap();
}

#[test]
fn mutex_ceiling() {
    run_scenario(50, scenario);
}
