//! Wait objects: the protocol threads block on, and the mutex and event
//! objects that implement it.
//!
//! Threads themselves are wait objects too (joining a thread waits until it
//! stops); that implementation sits next to the [`WaitObject`] trait.

mod event;
mod mutex;
mod wait;

pub use event::{Event, EventId, ResetType};
pub use mutex::{Mutex, MutexId};
pub use wait::{WaitObject, WaitObjectId, WaitQueue, WaitSynchronizationResult};
