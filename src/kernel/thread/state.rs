//! Thread status, priorities and processor ids.
//!
//! # State Machine
//!
//! ```text
//!   Dormant ---> Ready <------------.
//!                 |  ^              |
//!       schedule  |  | preempt      | wakeup (signal / timeout)
//!                 v  |              |
//!                Running ------> Wait* (SynchAny, SynchAll, HleEvent,
//!                                       Arb, Sleep, IPC)
//!
//!   any non-Dead state ---stop---> Dead
//! ```
//!
//! A preempted thread goes back to the front of its priority level. A woken
//! thread goes to the back.

use strum::{EnumCount, EnumIter, IntoStaticStr};

/// Thread priority. Numerically lower values are scheduled first.
pub type Priority = u32;

/// Highest (numerically lowest) thread priority.
pub const THREAD_PRIO_HIGHEST: Priority = 0;
/// Highest priority a userland thread may request.
pub const THREAD_PRIO_USERLAND_MAX: Priority = 24;
/// Priority used when none is given.
pub const THREAD_PRIO_DEFAULT: Priority = 48;
/// Lowest (numerically highest) thread priority.
pub const THREAD_PRIO_LOWEST: Priority = 63;

/// Number of distinct priority levels.
pub const PRIORITY_LEVELS: usize = (THREAD_PRIO_LOWEST + 1) as usize;

/// Processor id as passed by the guest.
pub type ProcessorId = i32;

/// Run on the owner process's ideal processor.
pub const THREAD_PROCESSOR_ID_DEFAULT: ProcessorId = -2;
/// Run on any processor.
pub const THREAD_PROCESSOR_ID_ALL: ProcessorId = -1;
/// The application core.
pub const THREAD_PROCESSOR_ID_0: ProcessorId = 0;
/// The system core.
pub const THREAD_PROCESSOR_ID_1: ProcessorId = 1;
/// Largest processor id accepted at thread creation.
pub const THREAD_PROCESSOR_ID_MAX: ProcessorId = 2;

/// Scheduling status of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
pub enum ThreadStatus {
    /// Created but not yet scheduled.
    Dormant,
    /// In the ready queue.
    Ready,
    /// Executing on the CPU.
    Running,
    /// Waiting for any one of its wait objects.
    WaitSynchAny,
    /// Waiting for all of its wait objects at once.
    WaitSynchAll,
    /// Waiting for an event raised by emulated system services.
    WaitHleEvent,
    /// Waiting on an address arbiter.
    WaitArb,
    /// Sleeping until a timeout fires.
    WaitSleep,
    /// Waiting for an IPC reply.
    WaitIpc,
    /// Stopped. Terminal.
    Dead,
}

impl ThreadStatus {
    /// Returns `true` for every `Wait*` status.
    #[must_use]
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ThreadStatus::WaitSynchAny
                | ThreadStatus::WaitSynchAll
                | ThreadStatus::WaitHleEvent
                | ThreadStatus::WaitArb
                | ThreadStatus::WaitSleep
                | ThreadStatus::WaitIpc
        )
    }

    /// Returns `true` for the statuses whose threads sit in wait-object
    /// waiter lists.
    #[must_use]
    pub fn is_waiting_on_objects(self) -> bool {
        matches!(
            self,
            ThreadStatus::WaitSynchAny | ThreadStatus::WaitSynchAll | ThreadStatus::WaitHleEvent
        )
    }

    /// Returns `true` for the statuses a wakeup timer may interrupt with a
    /// wakeup handler call.
    #[must_use]
    pub fn is_interruptible(self) -> bool {
        self.is_waiting_on_objects() || self == ThreadStatus::WaitArb
    }

    /// Returns the status name used in logs and traces.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_waiting_classification() {
        let waiting: Vec<_> = ThreadStatus::iter().filter(|s| s.is_waiting()).collect();
        assert_eq!(waiting.len(), 6);
        assert_eq!(ThreadStatus::COUNT, 10);

        assert!(ThreadStatus::WaitArb.is_interruptible());
        assert!(!ThreadStatus::WaitSleep.is_interruptible());
        assert!(!ThreadStatus::WaitIpc.is_waiting_on_objects());
        assert!(!ThreadStatus::Dead.is_waiting());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(ThreadStatus::WaitSynchAll.to_string(), "WaitSynchAll");
        assert_eq!(ThreadStatus::Dead.name(), "Dead");
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(PRIORITY_LEVELS, 64);
        assert!(THREAD_PRIO_USERLAND_MAX < THREAD_PRIO_DEFAULT);
    }
}
