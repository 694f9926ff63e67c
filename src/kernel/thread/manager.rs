//! The thread arena and the scheduling state that does not touch hardware.
//!
//! # System-Core Load Shedding
//!
//! Threads created for processors at or above `system_core_base` count as
//! system-core threads. When the host reports that its performance counters
//! were reset, the next reschedule lets only `system_core_percent` percent of
//! them keep their priority; every further Ready system-core thread, in
//! creation order, is pushed 10 levels down (capped at the lowest priority).

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::{
    hw::TimingEventType,
    kernel::{
        config::SchedulerConfig,
        thread::{
            Priority, ProcessorId, ReadyQueue, Thread, ThreadId, ThreadStatus, THREAD_PRIO_HIGHEST,
            THREAD_PRIO_LOWEST,
        },
    },
    Error, Result,
};

/// Priority penalty applied to throttled system-core threads.
const SYSTEM_CORE_PENALTY: Priority = 10;

/// Owns every thread of a kernel instance and the ready queue.
///
/// Threads are kept in creation order. The manager only mutates its own
/// state; context switches and timers go through
/// [`KernelSystem`](crate::kernel::KernelSystem), which owns the collaborators.
#[derive(Debug)]
pub struct ThreadManager {
    pub(crate) threads: BTreeMap<ThreadId, Thread>,
    pub(crate) ready_queue: ReadyQueue<ThreadId>,
    pub(crate) current: Option<ThreadId>,
    /// Timer userdata to thread, for every thread that can still be woken.
    pub(crate) wakeup_callback_table: FxHashMap<u64, ThreadId>,
    pub(crate) wakeup_event_type: TimingEventType,
    system_core_percent: u32,
    pub(crate) system_thread_count: u32,
    run_system_threads: u32,
    system_core_base: ProcessorId,
    next_thread_id: u32,
    perf_stats_reset: bool,
}

impl ThreadManager {
    /// Creates an empty manager whose wakeup timers use `wakeup_event_type`.
    #[must_use]
    pub fn new(config: &SchedulerConfig, wakeup_event_type: TimingEventType) -> Self {
        Self {
            threads: BTreeMap::new(),
            ready_queue: ReadyQueue::new(),
            current: None,
            wakeup_callback_table: FxHashMap::default(),
            wakeup_event_type,
            system_core_percent: config.system_core_percent,
            system_thread_count: 0,
            run_system_threads: 0,
            system_core_base: config.system_core_base,
            next_thread_id: 1,
            perf_stats_reset: false,
        }
    }

    pub(crate) fn allocate_thread_id(&mut self) -> ThreadId {
        let id = ThreadId::new(self.next_thread_id);
        self.next_thread_id += 1;
        id
    }

    /// Returns a thread by id.
    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    /// Returns a thread by id for modification.
    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    /// Returns the id of the thread on the CPU, if any.
    #[must_use]
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.current
    }

    /// Returns the thread on the CPU, if any.
    #[must_use]
    pub fn current_thread(&self) -> Option<&Thread> {
        self.current.and_then(|id| self.threads.get(&id))
    }

    /// Iterates every thread that has not been exited, in creation order.
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// Returns the ids of every thread that has not been exited, in creation order.
    #[must_use]
    pub fn thread_list(&self) -> Vec<ThreadId> {
        self.threads.keys().copied().collect()
    }

    /// Returns the ready queue.
    #[must_use]
    pub fn ready_queue(&self) -> &ReadyQueue<ThreadId> {
        &self.ready_queue
    }

    /// Returns the event type wakeup timers are scheduled with.
    #[must_use]
    pub fn wakeup_event_type(&self) -> TimingEventType {
        self.wakeup_event_type
    }

    /// Returns `true` if any thread is queued to run.
    #[must_use]
    pub fn have_ready_threads(&self) -> bool {
        self.ready_queue.get_first().is_some()
    }

    /// Picks the thread that should run next.
    ///
    /// With a running thread, only a strictly better queued thread replaces
    /// it; otherwise the running thread itself is returned. Without one, the
    /// best queued thread is popped.
    pub fn pop_next_ready_thread(&mut self) -> Option<ThreadId> {
        let running = self
            .current_thread()
            .filter(|t| t.status == ThreadStatus::Running)
            .map(|t| (t.id, t.current_priority));

        match running {
            Some((id, priority)) => self.ready_queue.pop_first_better(priority).or(Some(id)),
            None => self.ready_queue.pop_first(),
        }
    }

    fn apply_priority(&mut self, id: ThreadId, priority: Priority, nominal: bool) -> Result<()> {
        let thread = self.threads.get_mut(&id).ok_or(Error::InvalidThread(id))?;

        if thread.status == ThreadStatus::Ready {
            self.ready_queue
                .move_thread(id, thread.current_priority, priority);
        } else {
            self.ready_queue.prepare(priority);
        }

        if nominal {
            thread.nominal_priority = priority;
        }
        thread.current_priority = priority;
        Ok(())
    }

    /// Sets both the nominal and the current priority of a thread, moving it
    /// to the tail of its new level if it is queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is outside `0..=63`.
    pub fn set_priority(&mut self, id: ThreadId, priority: Priority) -> Result<()> {
        assert!(
            (THREAD_PRIO_HIGHEST..=THREAD_PRIO_LOWEST).contains(&priority),
            "Invalid priority value {priority}"
        );
        self.apply_priority(id, priority, true)
    }

    /// Sets only the current priority of a thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    pub fn boost_priority(&mut self, id: ThreadId, priority: Priority) -> Result<()> {
        self.apply_priority(id, priority, false)
    }

    /// Puts a waiting thread back on the ready queue.
    ///
    /// Returns `true` if the thread was enqueued, `false` if it was already
    /// Ready (woken earlier by another object) or Running.
    ///
    /// # Panics
    ///
    /// Panics if the thread still has wait objects, is Dead, or is Ready with
    /// a wakeup handler still installed.
    pub(crate) fn resume_from_wait(&mut self, id: ThreadId) -> Result<bool> {
        let thread = self.threads.get_mut(&id).ok_or(Error::InvalidThread(id))?;
        assert!(
            thread.wait_objects.is_empty(),
            "{id} is waking up while waiting for objects"
        );

        match thread.status {
            ThreadStatus::Ready => {
                assert!(
                    thread.wakeup_callback.is_none(),
                    "{id} is Ready with a wakeup handler still installed"
                );
                return Ok(false);
            }
            ThreadStatus::Running => {
                debug_assert!(false, "{id} has already resumed");
                return Ok(false);
            }
            ThreadStatus::Dead => panic!("{id} cannot resume after being stopped"),
            _ => {}
        }

        thread.wakeup_callback = None;
        self.ready_queue.push_back(thread.current_priority, id);
        thread.status = ThreadStatus::Ready;
        Ok(true)
    }

    /// Returns `true` if `processor_id` belongs to the system core.
    #[must_use]
    pub fn is_system_core(&self, processor_id: ProcessorId) -> bool {
        processor_id >= self.system_core_base
    }

    /// Returns the first processor id treated as the system core.
    #[must_use]
    pub fn system_core_base(&self) -> ProcessorId {
        self.system_core_base
    }

    /// Returns the share of system-core threads allowed to keep their priority.
    #[must_use]
    pub fn system_core_percent(&self) -> u32 {
        self.system_core_percent
    }

    /// Returns the number of live system-core threads.
    #[must_use]
    pub fn system_thread_count(&self) -> u32 {
        self.system_thread_count
    }

    /// Returns the budget computed by the last load-shedding pass.
    #[must_use]
    pub fn run_system_threads(&self) -> u32 {
        self.run_system_threads
    }

    /// Changes the share of system-core threads allowed to keep their priority.
    pub fn update_system_core_percent(&mut self, percent: u32) {
        self.system_core_percent = percent;
    }

    /// Records that the host's performance counters were reset; the next
    /// reschedule runs a load-shedding pass.
    pub fn mark_perf_stats_reset(&mut self) {
        self.perf_stats_reset = true;
    }

    pub(crate) fn take_perf_stats_reset(&mut self) -> bool {
        std::mem::take(&mut self.perf_stats_reset)
    }

    /// Lowers the current priority of Ready system-core threads beyond the
    /// budget and returns `(thread, new priority)` for each one.
    pub fn reschedule_for_system_core(&mut self) -> Vec<(ThreadId, Priority)> {
        let budget = u64::from(self.system_thread_count) * u64::from(self.system_core_percent) / 100;
        self.run_system_threads = u32::try_from(budget).unwrap_or(u32::MAX);
        if self.run_system_threads == 0 {
            return Vec::new();
        }

        let candidates: Vec<(ThreadId, Priority)> = self
            .threads
            .values()
            .filter(|t| t.status == ThreadStatus::Ready && self.is_system_core(t.processor_id))
            .map(|t| (t.id, t.current_priority))
            .collect();

        let mut remaining = i64::from(self.run_system_threads);
        let mut throttled = Vec::new();
        for (id, priority) in candidates {
            if remaining <= 0 {
                let lowered = (priority + SYSTEM_CORE_PENALTY).min(THREAD_PRIO_LOWEST);
                if self.boost_priority(id, lowered).is_ok() {
                    log::warn!("Throttling system-core {id} to priority {lowered}");
                    throttled.push((id, lowered));
                }
            }
            remaining -= 1;
        }
        throttled
    }

    /// Logs the current thread and every queued thread with its level.
    pub fn debug_thread_queue(&self) {
        match self.current_thread() {
            Some(thread) => log::debug!("0x{:02X} {} (current)", thread.current_priority, thread.id),
            None => log::debug!("Current: NO CURRENT THREAD"),
        }
        for id in self.threads.keys() {
            if let Some(priority) = self.ready_queue.contains(*id) {
                log::debug!("0x{priority:02X} {id}");
            }
        }
    }
}
