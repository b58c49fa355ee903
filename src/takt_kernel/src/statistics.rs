//! Scheduler statistics.
use crate::{klock::lock_cpu, sched};

/// The number of context switches performed since boot, including the
/// first dispatch.
pub fn context_switch_count() -> u64 {
    let guard = lock_cpu();
    sched::context_switch_count(guard.token())
}
