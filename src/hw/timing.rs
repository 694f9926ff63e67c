//! Event-timing collaborator interface.
//!
//! The timing subsystem owns the emulated cycle counter and a queue of
//! delayed callbacks. The kernel registers one event type for thread wakeups
//! and schedules it with the thread id as userdata; when the event fires the
//! host routes it back through
//! [`KernelSystem::dispatch_timing_event`](crate::kernel::KernelSystem::dispatch_timing_event).

/// Clock rate of the application core in cycles per second.
pub const BASE_CLOCK_RATE_ARM11: u64 = 268_111_856;

/// Handle for an event type registered with [`CoreTiming::register_event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimingEventType(pub u32);

/// Converts nanoseconds to cycles at `clock_rate`.
///
/// Negative durations convert to zero cycles and results that do not fit in an
/// `i64` saturate.
#[must_use]
pub fn ns_to_cycles(nanoseconds: i64, clock_rate: u64) -> i64 {
    if nanoseconds <= 0 {
        return 0;
    }
    let cycles = i128::from(nanoseconds) * i128::from(clock_rate) / 1_000_000_000;
    i64::try_from(cycles).unwrap_or(i64::MAX)
}

/// The event-timing subsystem.
pub trait CoreTiming {
    /// Returns the current emulated tick count.
    fn ticks(&self) -> u64;

    /// Registers a named event type and returns its handle.
    fn register_event(&mut self, name: &'static str) -> TimingEventType;

    /// Schedules `event` to fire `cycles_into_future` cycles from now.
    fn schedule_event(&mut self, cycles_into_future: i64, event: TimingEventType, userdata: u64);

    /// Removes every pending `event` with matching `userdata`.
    fn unschedule_event(&mut self, event: TimingEventType, userdata: u64);

    /// Advances the cycle counter to the end of the current slice.
    fn advance(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ns_to_cycles() {
        assert_eq!(ns_to_cycles(1_000_000_000, BASE_CLOCK_RATE_ARM11), 268_111_856);
        assert_eq!(ns_to_cycles(1_000_000, BASE_CLOCK_RATE_ARM11), 268_111);
        assert_eq!(ns_to_cycles(0, BASE_CLOCK_RATE_ARM11), 0);
        assert_eq!(ns_to_cycles(-5, BASE_CLOCK_RATE_ARM11), 0);
        assert_eq!(ns_to_cycles(i64::MAX, BASE_CLOCK_RATE_ARM11), i64::MAX);
    }
}
