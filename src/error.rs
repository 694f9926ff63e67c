use thiserror::Error;

use crate::kernel::{ProcessId, ThreadId, WaitObjectId};

/// Packed guest-visible result code.
///
/// The console kernel reports every service outcome as a single 32-bit word
/// built from four fields:
///
/// | Bits    | Field         |
/// |---------|---------------|
/// | 0..10   | description   |
/// | 10..18  | module        |
/// | 21..27  | summary       |
/// | 27..32  | level         |
///
/// Guest code compares these words directly, so the exact bit patterns
/// produced by [`Error::result_code`] matter for compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u32);

impl ResultCode {
    /// Builds a result code from its four fields.
    #[must_use]
    pub const fn new(
        description: u32,
        module: ErrorModule,
        summary: ErrorSummary,
        level: ErrorLevel,
    ) -> Self {
        Self(
            (description & 0x3FF)
                | ((module as u32 & 0xFF) << 10)
                | ((summary as u32 & 0x3F) << 21)
                | ((level as u32 & 0x1F) << 27),
        )
    }

    /// Returns the raw 32-bit value written into guest registers.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the description field.
    #[must_use]
    pub const fn description(self) -> u32 {
        self.0 & 0x3FF
    }

    /// Returns `true` if the level field marks a failure.
    ///
    /// Only the top bit of the word matters here; informational codes such as
    /// [`RESULT_TIMEOUT`] are not errors.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Module field of a [`ResultCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorModule {
    /// Shared/common errors.
    Common = 0,
    /// The kernel itself.
    Kernel = 1,
    /// The OS service layer.
    Os = 6,
}

/// Summary field of a [`ResultCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorSummary {
    /// The operation succeeded.
    Success = 0,
    /// A resource ran out.
    OutOfResource = 3,
    /// An argument was rejected.
    InvalidArgument = 7,
    /// The state the caller was waiting on changed.
    StatusChanged = 10,
}

/// Level field of a [`ResultCode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorLevel {
    /// The operation succeeded.
    Success = 0,
    /// Informational, not an error.
    Info = 1,
    /// Permanent failure.
    Permanent = 27,
    /// Caller misuse.
    Usage = 28,
}

/// Description values used by the thread kernel.
pub mod description {
    /// Mutex released by a thread that does not hold it.
    pub const WRONG_LOCKING_THREAD: u32 = 31;
    /// Allocation failed.
    pub const OUT_OF_MEMORY: u32 = 1011;
    /// Address is not mapped.
    pub const INVALID_ADDRESS: u32 = 1013;
    /// Value out of range.
    pub const OUT_OF_RANGE: u32 = 1021;
    /// Wait timed out.
    pub const TIMEOUT: u32 = 1022;
}

/// The operation completed successfully.
pub const RESULT_SUCCESS: ResultCode = ResultCode(0);

/// A wait ended because its timeout elapsed (`0x09401BFE`).
pub const RESULT_TIMEOUT: ResultCode = ResultCode::new(
    description::TIMEOUT,
    ErrorModule::Os,
    ErrorSummary::StatusChanged,
    ErrorLevel::Info,
);

/// The generic Error type covering every recoverable failure of the kernel.
///
/// Only guest-caused failures are represented here. Scheduler-internal
/// invariant violations (resuming a dead thread, running a thread that is not
/// ready, acquiring an object that is not available) are programming errors and
/// panic instead of producing an `Error`.
///
/// # Error Categories
///
/// ## Thread creation
/// - [`Error::OutOfRange`] - Priority outside `0..=63`
/// - [`Error::OutOfRangeKernel`] - Processor id outside the supported cores
/// - [`Error::InvalidAddress`] - Entry point not mapped in the owner process
/// - [`Error::OutOfMemory`] - No room for another TLS page
///
/// ## Synchronization
/// - [`Error::WrongLockingThread`] - Releasing a mutex owned by someone else
///
/// ## Lookup
/// - [`Error::InvalidHandle`], [`Error::InvalidProcess`], [`Error::InvalidThread`]
/// - [`Error::NoCurrentThread`] - Current-thread operation while idle
///
/// # Examples
///
/// ```rust,no_run
/// use hle_kernel::{Error, RESULT_SUCCESS};
///
/// fn to_guest(result: hle_kernel::Result<()>) -> u32 {
///     match result {
///         Ok(()) => RESULT_SUCCESS.raw(),
///         Err(e) => e.result_code().raw(),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The requested thread priority is outside the valid range.
    #[error("Invalid thread priority: {priority}")]
    OutOfRange {
        /// The rejected priority.
        priority: u32,
    },

    /// The requested processor id does not name a supported core.
    #[error("Invalid processor id: {processor_id}")]
    OutOfRangeKernel {
        /// The rejected processor id.
        processor_id: i32,
    },

    /// The address is not a valid virtual address of the owner process.
    #[error("Invalid entry address 0x{address:08X}")]
    InvalidAddress {
        /// The rejected address.
        address: u32,
    },

    /// The memory region backing TLS pages has no space left.
    #[error("Not enough space in region to allocate a new TLS page for thread")]
    OutOfMemory,

    /// A mutex was released by a thread other than its holder.
    #[error("Mutex released by a thread that does not hold it")]
    WrongLockingThread,

    /// The wait object does not exist.
    #[error("Invalid wait object {0}")]
    InvalidHandle(WaitObjectId),

    /// The process does not exist.
    #[error("Invalid process {0}")]
    InvalidProcess(ProcessId),

    /// The thread does not exist (never created or already purged).
    #[error("Invalid thread {0}")]
    InvalidThread(ThreadId),

    /// An operation on the running thread was requested while the CPU idles.
    #[error("No thread is running")]
    NoCurrentThread,

    /// Opening or writing the scheduler trace failed.
    #[error("{0}")]
    Trace(#[from] std::io::Error),
}

impl Error {
    /// Maps this error to the result code the guest observes.
    ///
    /// Host-side failures ([`Error::Trace`]) and lookups that a real kernel
    /// would have rejected at handle resolution map to the generic
    /// invalid-handle code.
    #[must_use]
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::OutOfRange { .. } => ResultCode::new(
                description::OUT_OF_RANGE,
                ErrorModule::Os,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Usage,
            ),
            Error::OutOfRangeKernel { .. } => ResultCode::new(
                description::OUT_OF_RANGE,
                ErrorModule::Kernel,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Permanent,
            ),
            Error::InvalidAddress { .. } => ResultCode::new(
                description::INVALID_ADDRESS,
                ErrorModule::Kernel,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Permanent,
            ),
            Error::OutOfMemory => ResultCode::new(
                description::OUT_OF_MEMORY,
                ErrorModule::Kernel,
                ErrorSummary::OutOfResource,
                ErrorLevel::Permanent,
            ),
            Error::WrongLockingThread => ResultCode::new(
                description::WRONG_LOCKING_THREAD,
                ErrorModule::Kernel,
                ErrorSummary::InvalidArgument,
                ErrorLevel::Permanent,
            ),
            Error::InvalidHandle(_)
            | Error::InvalidProcess(_)
            | Error::InvalidThread(_)
            | Error::NoCurrentThread
            | Error::Trace(_) => ResultCode(0xD8E0_07F7),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_layout() {
        assert_eq!(
            Error::OutOfRange { priority: 64 }.result_code().raw(),
            0xE0E0_1BFD
        );
        assert_eq!(
            Error::OutOfRangeKernel { processor_id: 5 }
                .result_code()
                .raw(),
            0xD8E0_07FD
        );
        assert_eq!(
            Error::InvalidAddress { address: 0 }.result_code().raw(),
            0xD8E0_07F5
        );
        assert_eq!(Error::OutOfMemory.result_code().raw(), 0xD860_07F3);
        assert_eq!(Error::WrongLockingThread.result_code().raw(), 0xD8E0_041F);
    }

    #[test]
    fn test_timeout_is_not_an_error() {
        assert_eq!(RESULT_TIMEOUT.raw(), 0x0940_1BFE);
        assert!(!RESULT_TIMEOUT.is_error());
        assert!(!RESULT_SUCCESS.is_error());
        assert!(Error::OutOfMemory.result_code().is_error());
        assert_eq!(RESULT_TIMEOUT.description(), description::TIMEOUT);
    }

    #[test]
    fn test_display() {
        let err = Error::InvalidAddress {
            address: 0xDEAD_BEEF,
        };
        assert_eq!(err.to_string(), "Invalid entry address 0xDEADBEEF");
        assert_eq!(RESULT_TIMEOUT.to_string(), "0x09401BFE");
    }
}
