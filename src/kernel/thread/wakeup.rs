//! Wakeup handlers run when a thread's wait resolves.

use strum::Display;

use crate::{
    error::{RESULT_SUCCESS, RESULT_TIMEOUT},
    kernel::{sync::WaitObjectId, thread::Thread},
};

/// Why a waiting thread is being woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum WakeupReason {
    /// A wait object it was waiting on became available.
    Signal,
    /// Its wakeup timer fired first.
    Timeout,
    /// The thread was stopped while waiting.
    Cancel,
}

/// Per-thread callback invoked at most once when a wait ends.
///
/// The kernel takes the handler out of the thread before calling it, so a
/// handler never observes itself in [`Thread::has_wakeup_handler`]. The
/// `object` argument names the object that signalled the thread and is
/// `None` for timeouts and cancellation.
pub trait WakeupHandler: std::fmt::Debug + Send {
    /// Handles the end of the wait.
    fn on_wakeup(&mut self, reason: WakeupReason, thread: &mut Thread, object: Option<WaitObjectId>);
}

/// Writes the outcome of a `WaitSynchronization` call into the guest registers.
///
/// `r0` receives the result code. For wait-any calls `r1` receives the index
/// of the object that signalled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitSynchronizationWakeup {
    output_index: bool,
}

impl WaitSynchronizationWakeup {
    /// Creates a handler. `output_index` is `false` for wait-all calls.
    #[must_use]
    pub fn new(output_index: bool) -> Self {
        Self { output_index }
    }
}

impl WakeupHandler for WaitSynchronizationWakeup {
    fn on_wakeup(&mut self, reason: WakeupReason, thread: &mut Thread, object: Option<WaitObjectId>) {
        match reason {
            WakeupReason::Timeout => thread.set_wait_synchronization_result(RESULT_TIMEOUT),
            WakeupReason::Signal => {
                thread.set_wait_synchronization_result(RESULT_SUCCESS);
                if self.output_index {
                    if let Some(object) = object {
                        let index = thread.wait_object_index(object);
                        thread.set_wait_synchronization_output(index);
                    }
                }
            }
            WakeupReason::Cancel => {}
        }
    }
}

/// Writes the outcome of an address-arbiter wait into `r0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArbitrationWakeup;

impl WakeupHandler for ArbitrationWakeup {
    fn on_wakeup(&mut self, reason: WakeupReason, thread: &mut Thread, _object: Option<WaitObjectId>) {
        match reason {
            WakeupReason::Timeout => thread.set_wait_synchronization_result(RESULT_TIMEOUT),
            WakeupReason::Signal => thread.set_wait_synchronization_result(RESULT_SUCCESS),
            WakeupReason::Cancel => {}
        }
    }
}
