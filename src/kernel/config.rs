//! Kernel configuration types.
//!
//! Configuration is split by subsystem:
//!
//! - [`KernelConfig`] - Top-level container handed to
//!   [`KernelSystem::new`](crate::kernel::KernelSystem::new)
//! - [`SchedulerConfig`] - System-core load shedding and the clock rate used
//!   to turn timeouts into cycles
//! - [`MemoryConfig`] - The physical region TLS pages are carved from
//! - [`TracingConfig`] - Structured scheduler tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use hle_kernel::kernel::{KernelConfig, SchedulerConfig, TracingConfig};
//!
//! let config = KernelConfig::new()
//!     .with_scheduler(SchedulerConfig::new().with_system_core_percent(50))
//!     .with_tracing(TracingConfig::file("scheduler.ndjson").with_context("boot"));
//! ```

use std::path::PathBuf;

use crate::{
    hw::BASE_CLOCK_RATE_ARM11,
    kernel::thread::{ProcessorId, THREAD_PROCESSOR_ID_1},
};

/// Top-level kernel configuration.
#[derive(Clone, Debug, Default)]
pub struct KernelConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Memory region settings.
    pub memory: MemoryConfig,
    /// Tracing settings.
    pub tracing: TracingConfig,
}

impl KernelConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the scheduler settings.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replaces the memory settings.
    #[must_use]
    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Replaces the tracing settings.
    #[must_use]
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

/// Scheduler settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Percentage of system-core threads that keep their priority when the
    /// host asks for load shedding.
    ///
    /// Default: 100
    pub system_core_percent: u32,

    /// First processor id treated as the system core. Threads created for
    /// this processor or above are counted as system-core threads, and a
    /// reschedule onto one of them runs an extra CPU slice inline.
    ///
    /// Default: 1
    pub system_core_base: ProcessorId,

    /// Clock rate used to convert nanosecond timeouts into cycles.
    ///
    /// Default: 268,111,856 Hz
    pub clock_rate: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            system_core_percent: 100,
            system_core_base: THREAD_PROCESSOR_ID_1,
            clock_rate: BASE_CLOCK_RATE_ARM11,
        }
    }
}

impl SchedulerConfig {
    /// Creates the default scheduler settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the system-core percentage.
    #[must_use]
    pub fn with_system_core_percent(mut self, percent: u32) -> Self {
        self.system_core_percent = percent;
        self
    }

    /// Sets the first system-core processor id.
    #[must_use]
    pub fn with_system_core_base(mut self, base: ProcessorId) -> Self {
        self.system_core_base = base;
        self
    }

    /// Sets the clock rate.
    #[must_use]
    pub fn with_clock_rate(mut self, clock_rate: u64) -> Self {
        self.clock_rate = clock_rate;
        self
    }
}

/// Physical memory settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Physical offset of the BASE region.
    pub base_region_offset: u32,
    /// Size of the BASE region in bytes. Every TLS page consumes one page of it.
    pub base_region_size: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_region_offset: 0x0700_0000,
            base_region_size: 0x0100_0000,
        }
    }
}

impl MemoryConfig {
    /// Creates the default memory settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size of the BASE region.
    #[must_use]
    pub fn with_base_region_size(mut self, size: u32) -> Self {
        self.base_region_size = size;
        self
    }

    /// Sets the physical offset of the BASE region.
    #[must_use]
    pub fn with_base_region_offset(mut self, offset: u32) -> Self {
        self.base_region_offset = offset;
        self
    }
}

/// Structured scheduler tracing.
///
/// When enabled, every thread creation, context switch, wakeup, priority
/// change, throttle and stop is recorded as one NDJSON line (file) or one
/// buffered [`SchedulerEvent`](crate::kernel::SchedulerEvent) (memory).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracingConfig {
    /// Master switch.
    pub enabled: bool,

    /// Output file. Opened in append mode; when unset, events are buffered
    /// in memory.
    pub output_path: Option<PathBuf>,

    /// Maximum events kept in memory, oldest dropped first. 0 for unlimited.
    /// Ignored for file output.
    pub max_entries: usize,

    /// Value of the `context` field added to every event.
    pub context: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TracingConfig {
    /// Tracing off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            output_path: None,
            max_entries: 10_000,
            context: None,
        }
    }

    /// Buffers up to `max_entries` events in memory.
    #[must_use]
    pub fn memory(max_entries: usize) -> Self {
        Self {
            enabled: true,
            output_path: None,
            max_entries,
            context: None,
        }
    }

    /// Streams events to `path`.
    #[must_use]
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            enabled: true,
            output_path: Some(path.into()),
            max_entries: 0,
            context: None,
        }
    }

    /// Sets the context field.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.scheduler.system_core_percent, 100);
        assert_eq!(config.scheduler.system_core_base, 1);
        assert_eq!(config.scheduler.clock_rate, 268_111_856);
        assert_eq!(config.memory.base_region_size, 0x0100_0000);
        assert!(!config.tracing.enabled);
    }

    #[test]
    fn test_builders() {
        let config = KernelConfig::new()
            .with_scheduler(SchedulerConfig::new().with_system_core_percent(25))
            .with_memory(MemoryConfig::new().with_base_region_size(0x2000))
            .with_tracing(TracingConfig::memory(16).with_context("boot"));
        assert_eq!(config.scheduler.system_core_percent, 25);
        assert_eq!(config.memory.base_region_size, 0x2000);
        assert_eq!(config.tracing.max_entries, 16);
        assert_eq!(config.tracing.context.as_deref(), Some("boot"));

        let file = TracingConfig::file("trace.ndjson");
        assert!(file.enabled);
        assert_eq!(file.output_path, Some(PathBuf::from("trace.ndjson")));
    }
}
