// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # hle-kernel
//!
//! A high-level emulation of a handheld console's thread kernel: guest
//! threads, their priority scheduler, wait objects and thread-local storage,
//! without emulating the kernel's own machine code.
//!
//! The crate owns the scheduling state and drives three collaborators the
//! embedding emulator supplies: a CPU core, a cycle-accurate timer queue and
//! guest memory. Everything is single-threaded and deterministic; the host
//! decides when a reschedule happens.
//!
//! ## Features
//!
//! - **64-level ready queue** - FIFO per level, bitmap lookup of the best level
//! - **Preemptive priority scheduling** - only a strictly better thread preempts
//! - **Priority inheritance** - mutex holders run at their best waiter's priority
//! - **Wait objects** - mutexes, events and thread joins with wait-any and
//!   wait-all semantics, plus timeouts
//! - **TLS allocation** - eight 0x200-byte entries per page, pages carved from
//!   a bounded physical region
//! - **System-core load shedding** - throttles system threads on request
//! - **Scheduler tracing** - NDJSON event streams for offline analysis
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hle_kernel::prelude::*;
//!
//! let mut kernel = KernelSystem::new(
//!     KernelConfig::default(),
//!     RecordingCpu::new(),
//!     ManualTiming::new(),
//!     FlatMemory::default(),
//! )?;
//! let app = kernel.create_process("app", THREAD_PROCESSOR_ID_0);
//! let main = kernel.setup_main_thread(0x0010_0000, THREAD_PRIO_DEFAULT, app)?;
//! let worker = kernel.create_thread(
//!     ThreadParams::new("worker", 0x0010_0400, 0x0F00_0000, app).with_priority(0x20),
//! )?;
//!
//! kernel.reschedule()?;
//! assert_eq!(kernel.current_thread_id(), Some(worker));
//!
//! // the worker sleeps for a millisecond and main takes over
//! kernel.sleep_current_thread(1_000_000)?;
//! kernel.reschedule()?;
//! assert_eq!(kernel.current_thread_id(), Some(main));
//! # Ok::<(), hle_kernel::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`hw`] - the collaborator traits and their recording implementations
//! - [`kernel`] - threads, scheduler, wait objects, processes, configuration
//!   and tracing
//! - [`error`] - the crate error type and the guest-visible result codes
//!
//! ## Error Handling
//!
//! Recoverable failures are returned as [`Error`], and every variant maps to
//! the [`ResultCode`] a guest would observe through
//! [`Error::result_code`]. Broken kernel invariants (running a thread that is
//! not ready, resuming a stopped one) panic.

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Error type and guest-visible result codes.
pub mod error;

/// Collaborator interfaces: CPU, timing and memory.
pub mod hw;

/// The thread kernel itself.
///
/// See [`kernel::KernelSystem`] for the entry point.
pub mod kernel;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use hle_kernel::prelude::*;
///
/// let config = KernelConfig::new().with_tracing(TracingConfig::memory(1024));
/// let kernel = KernelSystem::new(config, RecordingCpu::new(), ManualTiming::new(), FlatMemory::default())?;
/// assert!(kernel.thread_list().is_empty());
/// # Ok::<(), hle_kernel::Error>(())
/// ```
pub mod prelude;

/// `hle-kernel` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

pub use error::{Error, ResultCode, RESULT_SUCCESS, RESULT_TIMEOUT};
