//! Semaphore value accounting, saturation, timed waits and
//! priority-ordered wakeup.
use takt_kernel::{
    this_thread, Duration, Error, SchedulingPolicy, Semaphore, StackStorage, Thread, TickClock,
};

mod common;
use common::{run_scenario, OrderLog};

static GATE: Semaphore = Semaphore::new(0);
static WAKE_ORDER: OrderLog = OrderLog::new();

static W1_STACK: StackStorage<16384> = StackStorage::new();
static W2_STACK: StackStorage<16384> = StackStorage::new();
static W3_STACK: StackStorage<16384> = StackStorage::new();
static W1: Thread = Thread::new(&W1_STACK, 10, SchedulingPolicy::Cooperative, waiter_body, 1);
static W2: Thread = Thread::new(&W2_STACK, 30, SchedulingPolicy::Cooperative, waiter_body, 2);
static W3: Thread = Thread::new(&W3_STACK, 20, SchedulingPolicy::Cooperative, waiter_body, 3);

fn waiter_body(id: usize) {
    if GATE.wait().is_ok() {
        WAKE_ORDER.push(id);
    }
}

fn scenario() {
    // Saturation: the post is rejected, nothing is lost.
    let bounded = Semaphore::with_max_value(3, 3);
    assert_eq!(bounded.post(), Err(Error::Overflow));
    assert_eq!(bounded.value(), 3);

    // A post followed by a wait leaves the value unchanged.
    let sem = Semaphore::new(0);
    sem.post().unwrap();
    sem.wait().unwrap();
    assert_eq!(sem.value(), 0);

    // Contention and deadline outcomes.
    assert_eq!(sem.try_wait(), Err(Error::WouldBlock));
    let t0 = TickClock::now();
    assert_eq!(sem.try_wait_for(Duration::from_ticks(5)), Err(Error::TimedOut));
    // The deadline gets one tick of slack on top of the duration.
    assert_eq!(TickClock::now() - t0, Duration::from_ticks(6));

    // Wakeup picks the highest-priority, earliest-queued waiter.
    W1.start().unwrap();
    W2.start().unwrap();
    W3.start().unwrap();
    this_thread::sleep_for(Duration::from_ticks(3)).unwrap(); // let all three block
    for _ in 0..3 {
        GATE.post().unwrap();
    }
    W1.join().unwrap();
    W2.join().unwrap();
    W3.join().unwrap();
    assert_eq!(WAKE_ORDER.snapshot(), vec![2, 3, 1]);
}

#[test]
fn semaphore_misc() {
    run_scenario(50, scenario);
}
