//! # hle-kernel Prelude
//!
//! This module provides a convenient prelude for the most commonly used types
//! and traits of the kernel. Import it to get the kernel, its configuration,
//! the collaborator traits and the in-process collaborators in one line.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all kernel operations
pub use crate::Error;

/// The result type used throughout the crate
pub use crate::Result;

/// Guest-visible result codes
pub use crate::error::{ResultCode, RESULT_SUCCESS, RESULT_TIMEOUT};

// ================================================================================================
// Kernel
// ================================================================================================

/// The kernel instance and its configuration
pub use crate::kernel::{KernelConfig, KernelSystem, MemoryConfig, SchedulerConfig, TracingConfig};

/// Threads and their scheduling state
pub use crate::kernel::{
    Priority, ProcessorId, Thread, ThreadId, ThreadManager, ThreadParams, ThreadStatus,
    THREAD_PRIO_DEFAULT, THREAD_PRIO_HIGHEST, THREAD_PRIO_LOWEST, THREAD_PRIO_USERLAND_MAX,
    THREAD_PROCESSOR_ID_0, THREAD_PROCESSOR_ID_1, THREAD_PROCESSOR_ID_DEFAULT,
};

/// Wait objects
pub use crate::kernel::{EventId, MutexId, ResetType, WaitObject, WaitObjectId};

/// Wakeup handling
pub use crate::kernel::{WakeupHandler, WakeupReason};

/// Processes
pub use crate::kernel::{Process, ProcessId};

/// Scheduler tracing
pub use crate::kernel::{SchedulerEvent, TraceWriter};

// ================================================================================================
// Collaborators
// ================================================================================================

/// Collaborator traits
pub use crate::hw::{CoreTiming, CpuCore, GuestMemory, ThreadContext, VAddr};

/// Recording collaborators for tests and tools
pub use crate::hw::mock::{FlatMemory, ManualTiming, RecordingCpu};
