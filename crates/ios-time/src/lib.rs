//! Virtual-clock scheduling primitives.
//!
//! Everything the IPC core does "later" is an event registered against a single monotonic
//! tick counter. There are no threads and no host clocks involved: two runs fed the same inputs
//! pop the same events at the same ticks, in the same order.

#![forbid(unsafe_code)]

mod queue;

pub use queue::{EventId, EventQueue, Scheduler};

/// Guest CPU core clock. One scheduler tick is one CPU cycle.
pub const CPU_TICKS_PER_SECOND: u64 = 729_000_000;

/// Ratio between CPU cycles and timebase ticks.
pub const TIMER_RATIO: u64 = 12;

/// Convert a timebase tick count (the unit hardware timings are usually measured in) to
/// scheduler ticks.
pub const fn tb_ticks(tb: u64) -> u64 {
    tb * TIMER_RATIO
}

/// Whole milliseconds elapsed after `ticks` scheduler ticks.
pub const fn ticks_to_ms(ticks: u64) -> u64 {
    ((ticks as u128) * 1_000 / (CPU_TICKS_PER_SECOND as u128)) as u64
}
