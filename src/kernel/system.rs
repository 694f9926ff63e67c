//! The kernel instance tying threads, wait objects and collaborators together.

use std::collections::BTreeMap;

use crate::{
    hw::{CoreTiming, CpuCore, GuestMemory, MemoryRegionInfo},
    kernel::{
        config::KernelConfig,
        process::{Process, ProcessId},
        sync::{Event, EventId, Mutex, MutexId},
        thread::{Thread, ThreadId, ThreadManager, ThreadStatus},
        trace::{SchedulerEvent, TraceWriter},
    },
    Result,
};

/// Name under which the wakeup timer event type is registered.
pub const THREAD_WAKEUP_EVENT: &str = "ThreadWakeupCallback";

/// One emulated kernel.
///
/// Owns the thread arena, every wait object, the processes and the three
/// collaborators. It is driven from a single host thread: it is `Send` when
/// the collaborators are, but never `Sync`.
///
/// # Example
///
/// ```rust,no_run
/// use hle_kernel::prelude::*;
///
/// let mut kernel = KernelSystem::new(
///     KernelConfig::default(),
///     RecordingCpu::new(),
///     ManualTiming::new(),
///     FlatMemory::default(),
/// )?;
/// let process = kernel.create_process("app", THREAD_PROCESSOR_ID_0);
/// let main = kernel.setup_main_thread(0x0010_0000, THREAD_PRIO_DEFAULT, process)?;
/// kernel.reschedule()?;
/// assert_eq!(kernel.current_thread_id(), Some(main));
/// # Ok::<(), hle_kernel::Error>(())
/// ```
#[derive(Debug)]
pub struct KernelSystem<C: CpuCore, T: CoreTiming, M: GuestMemory> {
    pub(crate) config: KernelConfig,
    pub(crate) cpu: C,
    pub(crate) timing: T,
    pub(crate) memory: M,
    pub(crate) thread_manager: ThreadManager,
    pub(crate) processes: BTreeMap<ProcessId, Process>,
    pub(crate) mutexes: BTreeMap<MutexId, Mutex>,
    pub(crate) events: BTreeMap<EventId, Event>,
    pub(crate) base_region: MemoryRegionInfo,
    pub(crate) current_process: Option<ProcessId>,
    pub(crate) next_process_id: u32,
    next_object_id: u32,
    trace: Option<TraceWriter>,
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    /// Creates a kernel and registers its wakeup timer with `timing`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trace`](crate::Error::Trace) if file tracing is
    /// configured and the file cannot be opened.
    pub fn new(config: KernelConfig, cpu: C, mut timing: T, memory: M) -> Result<Self> {
        let wakeup_event_type = timing.register_event(THREAD_WAKEUP_EVENT);
        let trace = TraceWriter::from_config(&config.tracing)?;
        let base_region = MemoryRegionInfo::new(
            config.memory.base_region_offset,
            config.memory.base_region_size,
        );

        Ok(Self {
            thread_manager: ThreadManager::new(&config.scheduler, wakeup_event_type),
            config,
            cpu,
            timing,
            memory,
            processes: BTreeMap::new(),
            mutexes: BTreeMap::new(),
            events: BTreeMap::new(),
            base_region,
            current_process: None,
            next_process_id: 1,
            next_object_id: 1,
            trace,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Returns the CPU.
    #[must_use]
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    /// Returns the CPU for modification.
    pub fn cpu_mut(&mut self) -> &mut C {
        &mut self.cpu
    }

    /// Returns the timing subsystem.
    #[must_use]
    pub fn timing(&self) -> &T {
        &self.timing
    }

    /// Returns the timing subsystem for modification.
    pub fn timing_mut(&mut self) -> &mut T {
        &mut self.timing
    }

    /// Returns the memory manager.
    #[must_use]
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Returns the thread manager.
    #[must_use]
    pub fn thread_manager(&self) -> &ThreadManager {
        &self.thread_manager
    }

    /// Returns the thread manager for direct priority and queue manipulation.
    pub fn thread_manager_mut(&mut self) -> &mut ThreadManager {
        &mut self.thread_manager
    }

    /// Returns a thread by id.
    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.thread_manager.thread(id)
    }

    /// Returns the id of the thread on the CPU.
    #[must_use]
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.thread_manager.current_thread_id()
    }

    /// Returns `true` if any thread is queued to run.
    #[must_use]
    pub fn have_ready_threads(&self) -> bool {
        self.thread_manager.have_ready_threads()
    }

    /// Returns the ids of every thread that has not been exited.
    #[must_use]
    pub fn thread_list(&self) -> Vec<ThreadId> {
        self.thread_manager.thread_list()
    }

    /// Logs the run queue at debug level.
    pub fn debug_thread_queue(&self) {
        self.thread_manager.debug_thread_queue();
    }

    /// Changes the share of system-core threads that keep their priority.
    pub fn update_system_core_percent(&mut self, percent: u32) {
        self.thread_manager.update_system_core_percent(percent);
    }

    /// Returns the BASE region TLS pages are allocated from.
    #[must_use]
    pub fn base_region(&self) -> &MemoryRegionInfo {
        &self.base_region
    }

    /// Returns the trace writer, if tracing is enabled.
    #[must_use]
    pub fn trace(&self) -> Option<&TraceWriter> {
        self.trace.as_ref()
    }

    /// Drains buffered trace events. `None` unless memory tracing is enabled.
    pub fn take_trace_events(&mut self) -> Option<Vec<SchedulerEvent>> {
        self.trace.as_mut().and_then(TraceWriter::take_buffer)
    }

    pub(crate) fn record(&mut self, event: SchedulerEvent) {
        if let Some(writer) = &mut self.trace {
            if let Err(e) = writer.write(event) {
                log::warn!("Failed to write scheduler trace: {e}");
            }
        }
    }

    pub(crate) fn next_object_id(&mut self) -> u32 {
        let id = self.next_object_id;
        self.next_object_id += 1;
        id
    }
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> Drop for KernelSystem<C, T, M> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let live: Vec<ThreadId> = self
            .thread_manager
            .threads()
            .filter(|t| t.status() != ThreadStatus::Dead)
            .map(Thread::id)
            .collect();
        for id in live {
            if let Err(e) = self.stop_thread(id) {
                log::error!("Failed to stop {id} during teardown: {e}");
            }
        }
        if let Some(writer) = &mut self.trace {
            let _ = writer.flush();
        }
    }
}
