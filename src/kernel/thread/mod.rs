//! Guest threads and the scheduler that runs them.
//!
//! # Architecture
//!
//! Every [`Thread`] lives in the [`ThreadManager`] arena, keyed by its
//! [`ThreadId`]. The ready queue, wait-object waiter lists, mutex holders and
//! the current-thread slot refer to threads by id only. Stopped threads stay
//! in the arena as [`ThreadStatus::Dead`] until the owner exits them, and
//! lookups of purged ids return `None`.
//!
//! # Key Components
//!
//! - [`ReadyQueue`] - per-priority FIFO lists with a bitmap of non-empty levels
//! - [`ThreadManager`] - the arena, the current thread, priority changes and
//!   system-core load shedding
//! - [`WakeupHandler`] - per-thread callback invoked when a wait resolves
//!
//! Operations that also need the CPU, the clock or guest memory (creation,
//! context switches, timers, stopping) are methods of
//! [`KernelSystem`](crate::kernel::KernelSystem).

mod lifecycle;
mod manager;
mod ready_queue;
mod scheduler;
mod state;
mod wakeup;

use std::collections::BTreeSet;

pub use lifecycle::ThreadParams;
pub use manager::ThreadManager;
pub use ready_queue::ReadyQueue;
pub use state::{
    Priority, ProcessorId, ThreadStatus, PRIORITY_LEVELS, THREAD_PRIO_DEFAULT,
    THREAD_PRIO_HIGHEST, THREAD_PRIO_LOWEST, THREAD_PRIO_USERLAND_MAX, THREAD_PROCESSOR_ID_0,
    THREAD_PROCESSOR_ID_1, THREAD_PROCESSOR_ID_ALL, THREAD_PROCESSOR_ID_DEFAULT,
    THREAD_PROCESSOR_ID_MAX,
};
pub use wakeup::{ArbitrationWakeup, WaitSynchronizationWakeup, WakeupHandler, WakeupReason};

use crate::{
    error::ResultCode,
    hw::{ThreadContext, VAddr, PAGE_SIZE, TLS_AREA_VADDR, TLS_ENTRY_SIZE},
    kernel::{
        process::ProcessId,
        sync::{MutexId, WaitObjectId, WaitQueue},
    },
};

/// Offset of the IPC command buffer inside a thread's TLS entry.
pub const COMMAND_HEADER_OFFSET: u32 = 0x80;

/// Unique identifier of a guest thread.
///
/// Ids are handed out sequentially starting at 1 and never reused within one
/// kernel instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Creates a thread id from its raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread {}", self.0)
    }
}

/// A guest thread.
#[derive(Debug)]
pub struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) status: ThreadStatus,
    pub(crate) nominal_priority: Priority,
    pub(crate) current_priority: Priority,
    pub(crate) processor_id: ProcessorId,
    pub(crate) owner_process: ProcessId,
    pub(crate) entry_point: VAddr,
    pub(crate) stack_top: VAddr,
    pub(crate) context: ThreadContext,
    pub(crate) tls_address: VAddr,
    /// Objects this thread waits on, in the order the guest passed them.
    pub(crate) wait_objects: Vec<WaitObjectId>,
    pub(crate) wait_address: VAddr,
    pub(crate) held_mutexes: BTreeSet<MutexId>,
    /// Mutexes this thread is queued on.
    pub(crate) pending_mutexes: BTreeSet<MutexId>,
    pub(crate) wakeup_callback: Option<Box<dyn WakeupHandler>>,
    pub(crate) last_running_ticks: u64,
    /// Threads joining on this one.
    pub(crate) waiters: WaitQueue,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        name: String,
        priority: Priority,
        processor_id: ProcessorId,
        owner_process: ProcessId,
        context: ThreadContext,
    ) -> Self {
        Self {
            id,
            name,
            status: ThreadStatus::Dormant,
            nominal_priority: priority,
            current_priority: priority,
            processor_id,
            owner_process,
            entry_point: 0,
            stack_top: 0,
            context,
            tls_address: 0,
            wait_objects: Vec::new(),
            wait_address: 0,
            held_mutexes: BTreeSet::new(),
            pending_mutexes: BTreeSet::new(),
            wakeup_callback: None,
            last_running_ticks: 0,
            waiters: WaitQueue::new(),
        }
    }

    /// Returns the thread id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the debug name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the scheduling status.
    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ThreadStatus) {
        self.status = status;
    }

    /// Returns the priority requested by the guest.
    #[must_use]
    pub fn nominal_priority(&self) -> Priority {
        self.nominal_priority
    }

    /// Returns the effective priority used for scheduling.
    #[must_use]
    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    /// Returns the processor the thread was created for.
    #[must_use]
    pub fn processor_id(&self) -> ProcessorId {
        self.processor_id
    }

    /// Returns the owning process.
    #[must_use]
    pub fn owner_process(&self) -> ProcessId {
        self.owner_process
    }

    /// Returns the entry point address.
    #[must_use]
    pub fn entry_point(&self) -> VAddr {
        self.entry_point
    }

    /// Returns the initial stack pointer.
    #[must_use]
    pub fn stack_top(&self) -> VAddr {
        self.stack_top
    }

    /// Returns the saved register snapshot.
    #[must_use]
    pub fn context(&self) -> &ThreadContext {
        &self.context
    }

    /// Returns the saved register snapshot for modification.
    pub fn context_mut(&mut self) -> &mut ThreadContext {
        &mut self.context
    }

    /// Returns the address of this thread's TLS entry.
    #[must_use]
    pub fn tls_address(&self) -> VAddr {
        self.tls_address
    }

    /// Returns the address of the IPC command buffer in TLS.
    #[must_use]
    pub fn command_buffer_address(&self) -> VAddr {
        self.tls_address + COMMAND_HEADER_OFFSET
    }

    /// Returns `(page, slot)` of the TLS entry within the owner's TLS area.
    #[must_use]
    pub fn tls_slot(&self) -> (usize, usize) {
        let offset = self.tls_address - TLS_AREA_VADDR;
        let page = offset / PAGE_SIZE;
        let slot = (offset % PAGE_SIZE) / TLS_ENTRY_SIZE;
        (page as usize, slot as usize)
    }

    /// Returns the objects the thread is waiting on.
    #[must_use]
    pub fn wait_objects(&self) -> &[WaitObjectId] {
        &self.wait_objects
    }

    /// Returns the arbiter address the thread waits on.
    #[must_use]
    pub fn wait_address(&self) -> VAddr {
        self.wait_address
    }

    /// Returns the mutexes currently held.
    #[must_use]
    pub fn held_mutexes(&self) -> &BTreeSet<MutexId> {
        &self.held_mutexes
    }

    /// Returns the mutexes the thread is queued on.
    #[must_use]
    pub fn pending_mutexes(&self) -> &BTreeSet<MutexId> {
        &self.pending_mutexes
    }

    /// Returns `true` while a wakeup handler is installed.
    #[must_use]
    pub fn has_wakeup_handler(&self) -> bool {
        self.wakeup_callback.is_some()
    }

    /// Installs the handler run when the current wait ends.
    pub fn set_wakeup_handler(&mut self, handler: Box<dyn WakeupHandler>) {
        self.wakeup_callback = Some(handler);
    }

    /// Returns the tick count at which the thread was last switched out.
    #[must_use]
    pub fn last_running_ticks(&self) -> u64 {
        self.last_running_ticks
    }

    /// Returns the threads joining on this one.
    #[must_use]
    pub fn waiters(&self) -> &WaitQueue {
        &self.waiters
    }

    /// Returns `true` if the thread waits for all of its objects at once.
    #[must_use]
    pub fn is_sleeping_on_wait_all(&self) -> bool {
        self.status == ThreadStatus::WaitSynchAll
    }

    /// Writes the result of a wait into `r0`.
    pub fn set_wait_synchronization_result(&mut self, result: ResultCode) {
        self.context.set_cpu_register(0, result.raw());
    }

    /// Writes the output of a wait (the signalled object index) into `r1`.
    pub fn set_wait_synchronization_output(&mut self, output: i32) {
        self.context.set_cpu_register(1, output as u32);
    }

    /// Returns the index of the last occurrence of `object` in the wait set,
    /// or `-1` if it is not there.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not waiting on anything.
    #[must_use]
    pub fn wait_object_index(&self, object: WaitObjectId) -> i32 {
        assert!(
            !self.wait_objects.is_empty(),
            "{} is not waiting for anything",
            self.id
        );
        self.wait_objects
            .iter()
            .rposition(|o| *o == object)
            .and_then(|index| i32::try_from(index).ok())
            .unwrap_or(-1)
    }

    /// Runs and clears the wakeup handler, if one is installed.
    pub(crate) fn invoke_wakeup(&mut self, reason: WakeupReason, object: Option<WaitObjectId>) {
        if let Some(mut handler) = self.wakeup_callback.take() {
            handler.on_wakeup(reason, self, object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::RESULT_TIMEOUT,
        kernel::sync::EventId,
        test::detached_thread,
    };

    #[test]
    fn test_wait_object_index_last_occurrence() {
        let mut thread = detached_thread(3, 20);
        let a = WaitObjectId::Event(EventId::new(1));
        let b = WaitObjectId::Event(EventId::new(2));
        thread.wait_objects = vec![a, b, a];
        assert_eq!(thread.wait_object_index(a), 2);
        assert_eq!(thread.wait_object_index(b), 1);
        assert_eq!(
            thread.wait_object_index(WaitObjectId::Event(EventId::new(9))),
            -1
        );
    }

    #[test]
    #[should_panic(expected = "is not waiting for anything")]
    fn test_wait_object_index_requires_wait() {
        let thread = detached_thread(3, 20);
        let _ = thread.wait_object_index(WaitObjectId::Event(EventId::new(1)));
    }

    #[test]
    fn test_tls_slot_and_command_buffer() {
        let mut thread = detached_thread(1, 20);
        thread.tls_address = TLS_AREA_VADDR + PAGE_SIZE + 3 * TLS_ENTRY_SIZE;
        assert_eq!(thread.tls_slot(), (1, 3));
        assert_eq!(thread.command_buffer_address(), thread.tls_address + 0x80);
    }

    #[test]
    fn test_wakeup_handler_runs_once() {
        let mut thread = detached_thread(1, 20);
        thread.set_wakeup_handler(Box::new(ArbitrationWakeup));
        assert!(thread.has_wakeup_handler());

        thread.invoke_wakeup(WakeupReason::Timeout, None);
        assert!(!thread.has_wakeup_handler());
        assert_eq!(thread.context().cpu_register(0), RESULT_TIMEOUT.raw());

        thread.set_wait_synchronization_result(ResultCode(7));
        thread.invoke_wakeup(WakeupReason::Timeout, None);
        assert_eq!(thread.context().cpu_register(0), 7);
    }

    #[test]
    fn test_thread_id_display() {
        assert_eq!(ThreadId::new(12).to_string(), "thread 12");
    }
}
