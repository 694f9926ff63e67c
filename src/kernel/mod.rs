//! The HLE thread kernel.
//!
//! # Architecture
//!
//! [`KernelSystem`] is the single owner of all kernel state: the thread arena
//! and ready queue ([`ThreadManager`]), the processes, every wait object and
//! the three hardware collaborators from [`crate::hw`]. Objects refer to one
//! another by id ([`ThreadId`], [`ProcessId`], [`WaitObjectId`]); there are no
//! shared pointers between them.
//!
//! # Key Components
//!
//! - [`ThreadManager`] - thread arena, ready queue, priorities, load shedding
//! - [`KernelSystem::reschedule`] - picks the next thread and switches to it
//! - [`WaitObject`] - the protocol mutexes, events and threads implement
//! - [`TraceWriter`] - structured NDJSON scheduler traces
//!
//! # Driving the Kernel
//!
//! The host runs guest code through [`CpuCore`](crate::hw::CpuCore), forwards
//! fired timer events to [`KernelSystem::dispatch_timing_event`] and calls
//! [`KernelSystem::reschedule`] whenever the CPU asked for it.

mod config;
mod process;
mod sync;
mod system;
mod thread;
mod trace;

pub use config::{KernelConfig, MemoryConfig, SchedulerConfig, TracingConfig};
pub use process::{Process, ProcessId};
pub use sync::{
    Event, EventId, Mutex, MutexId, ResetType, WaitObject, WaitObjectId, WaitQueue,
    WaitSynchronizationResult,
};
pub use system::{KernelSystem, THREAD_WAKEUP_EVENT};
pub use thread::{
    ArbitrationWakeup, Priority, ProcessorId, ReadyQueue, Thread, ThreadId, ThreadManager,
    ThreadParams, ThreadStatus, WaitSynchronizationWakeup, WakeupHandler, WakeupReason,
    COMMAND_HEADER_OFFSET, PRIORITY_LEVELS, THREAD_PRIO_DEFAULT, THREAD_PRIO_HIGHEST,
    THREAD_PRIO_LOWEST, THREAD_PRIO_USERLAND_MAX, THREAD_PROCESSOR_ID_0, THREAD_PROCESSOR_ID_1,
    THREAD_PROCESSOR_ID_ALL, THREAD_PROCESSOR_ID_DEFAULT, THREAD_PROCESSOR_ID_MAX,
};
pub use trace::{SchedulerEvent, TraceWriter};
