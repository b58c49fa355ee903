//! Compile-time kernel configuration.

/// The tick rate of [`TickClock`], in hertz.
///
/// [`TickClock`]: crate::TickClock
pub const TICK_RATE_HZ: u32 = 100;

/// The number of ticks a round-robin thread may run before yielding to
/// another round-robin thread of the same effective priority.
pub const QUANTUM_TICKS: u32 = 5;

/// The maximum length of a priority-inheritance propagation chain.
///
/// The waits-for graph is acyclic in correct programs, so the walk always
/// terminates. The bound exists to detect misuse.
pub(crate) const MAX_BOOST_DEPTH: usize = 64;
