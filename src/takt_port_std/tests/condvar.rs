//! Condition variable wakeup order and timeout behavior.
use takt_kernel::{
    ConditionVariable, Duration, Error, Mutex, MutexProtocol, MutexType, SchedulingPolicy,
    StackStorage, Thread, TickClock,
};

mod common;
use common::{run_scenario, OrderLog};

static MX: Mutex = Mutex::new(MutexType::Normal, MutexProtocol::None);
static CV: ConditionVariable = ConditionVariable::new();
static WAKE_ORDER: OrderLog = OrderLog::new();

static W1_STACK: StackStorage<16384> = StackStorage::new();
static W2_STACK: StackStorage<16384> = StackStorage::new();
static W3_STACK: StackStorage<16384> = StackStorage::new();
static W1: Thread = Thread::new(&W1_STACK, 10, SchedulingPolicy::Cooperative, waiter_body, 1);
static W2: Thread = Thread::new(&W2_STACK, 30, SchedulingPolicy::Cooperative, waiter_body, 2);
static W3: Thread = Thread::new(&W3_STACK, 20, SchedulingPolicy::Cooperative, waiter_body, 3);

fn waiter_body(id: usize) {
    if MX.lock().is_err() {
        return;
    }
    if CV.wait(&MX).is_ok() {
        WAKE_ORDER.push(id);
    }
    let _ = MX.unlock();
}

fn sleep_ticks(ticks: u64) {
    takt_kernel::this_thread::sleep_for(Duration::from_ticks(ticks)).unwrap();
}

fn scenario() {
    W1.start().unwrap();
    W2.start().unwrap();
    W3.start().unwrap();
    sleep_ticks(3); // all three release the mutex and block on the CV

    // One notification wakes only the highest-priority waiter.
    CV.notify_one();
    sleep_ticks(2);
    assert_eq!(WAKE_ORDER.snapshot(), vec![2]);

    // Waking everyone proceeds in priority order.
    CV.notify_all();
    sleep_ticks(2);
    assert_eq!(WAKE_ORDER.snapshot(), vec![2, 3, 1]);
    W1.join().unwrap();
    W2.join().unwrap();
    W3.join().unwrap();

    // A timed-out wait still re-acquires the mutex.
    MX.lock().unwrap();
    let t0 = TickClock::now();
    assert_eq!(
        CV.wait_until(&MX, t0 + Duration::from_ticks(4)),
        Err(Error::TimedOut)
    );
    assert_eq!(TickClock::now(), t0 + Duration::from_ticks(4));
    // Still the owner: releasing succeeds.
    MX.unlock().unwrap();
}

#[test]
fn condvar() {
    run_scenario(50, scenario);
}
