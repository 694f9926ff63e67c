//! Context switching, rescheduling, wakeup timers and the waits the running
//! thread can enter.

use crate::{
    hw::{ns_to_cycles, Cp15Register, CoreTiming, CpuCore, GuestMemory, TimingEventType, VAddr},
    kernel::{
        thread::{
            ArbitrationWakeup, Priority, ProcessorId, ThreadId, ThreadStatus, WakeupReason,
            THREAD_PRIO_LOWEST,
        },
        trace::SchedulerEvent,
        KernelSystem,
    },
    Error, Result,
};

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    /// Switches the CPU from the current thread to `new_thread`.
    ///
    /// The outgoing thread's registers are saved along with the tick count;
    /// if it was still Running it goes back to the front of its level. The
    /// incoming thread has its wakeup timer cancelled, leaves the ready queue
    /// and becomes Running, with the page table switched when its process
    /// differs. `None` idles the CPU without touching the current process.
    ///
    /// Returns the processor id of the incoming thread, or `None` when idle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if `new_thread` does not exist; the
    /// running thread is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if `new_thread` is neither Ready nor the running thread.
    pub fn switch_context(&mut self, new_thread: Option<ThreadId>) -> Result<Option<ProcessorId>> {
        let ticks = self.timing.ticks();
        let previous = self.thread_manager.current;

        if let Some(id) = new_thread {
            let thread = self
                .thread_manager
                .threads
                .get(&id)
                .ok_or(Error::InvalidThread(id))?;
            let keeps_running = previous == Some(id) && thread.status == ThreadStatus::Running;
            assert!(
                thread.status == ThreadStatus::Ready || keeps_running,
                "{id} must be ready to become running, but is {}",
                thread.status
            );
        }

        if let Some(previous) = previous {
            if let Some(thread) = self.thread_manager.threads.get_mut(&previous) {
                thread.last_running_ticks = ticks;
                self.cpu.save_context(&mut thread.context);

                if thread.status == ThreadStatus::Running {
                    self.thread_manager
                        .ready_queue
                        .push_front(thread.current_priority, previous);
                    thread.status = ThreadStatus::Ready;
                }
            }
        }

        let Some(id) = new_thread else {
            self.thread_manager.current = None;
            self.record(SchedulerEvent::ContextSwitch {
                from: previous,
                to: None,
                ticks,
            });
            return Ok(None);
        };

        let thread = self
            .thread_manager
            .threads
            .get_mut(&id)
            .ok_or(Error::InvalidThread(id))?;

        self.timing
            .unschedule_event(self.thread_manager.wakeup_event_type, u64::from(id.value()));

        self.thread_manager.current = Some(id);
        self.thread_manager
            .ready_queue
            .remove(thread.current_priority, id);
        thread.status = ThreadStatus::Running;

        if self.current_process != Some(thread.owner_process) {
            self.current_process = Some(thread.owner_process);
            self.memory.set_current_page_table(thread.owner_process);
        }

        self.cpu.load_context(&thread.context);
        self.cpu
            .set_cp15_register(Cp15Register::ThreadUro, thread.tls_address);
        let processor_id = thread.processor_id;

        self.record(SchedulerEvent::ContextSwitch {
            from: previous,
            to: Some(id),
            ticks,
        });
        Ok(Some(processor_id))
    }

    /// Picks the next thread and switches to it.
    ///
    /// A pending performance-counter reset first runs a load-shedding pass.
    /// When the chosen thread belongs to the system core, the clock is
    /// advanced, the CPU runs one slice and a second pick-and-switch follows.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`switch_context`](Self::switch_context).
    pub fn reschedule(&mut self) -> Result<()> {
        if self.thread_manager.take_perf_stats_reset() {
            for (thread, priority) in self.thread_manager.reschedule_for_system_core() {
                self.record(SchedulerEvent::Throttle { thread, priority });
            }
        }

        let current = self.thread_manager.current_thread().map(|t| t.id);
        let next = self.thread_manager.pop_next_ready_thread();
        match (current, next) {
            (Some(cur), Some(next)) => log::trace!("context switch {cur} -> {next}"),
            (Some(cur), None) => log::trace!("context switch {cur} -> idle"),
            (None, Some(next)) => log::trace!("context switch idle -> {next}"),
            (None, None) => {}
        }

        let processor_id = self.switch_context(next)?;
        if processor_id.is_some_and(|p| self.thread_manager.is_system_core(p)) {
            self.timing.advance();
            self.cpu.run();
            let next = self.thread_manager.pop_next_ready_thread();
            self.switch_context(next)?;
        }
        Ok(())
    }

    /// Arms the wakeup timer of `thread` to fire after `nanoseconds`.
    /// `-1` means wait forever and schedules nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    pub fn wake_after_delay(&mut self, thread: ThreadId, nanoseconds: i64) -> Result<()> {
        if nanoseconds == -1 {
            return Ok(());
        }
        if !self.thread_manager.threads.contains_key(&thread) {
            return Err(Error::InvalidThread(thread));
        }

        let cycles = ns_to_cycles(nanoseconds, self.config.scheduler.clock_rate);
        self.timing.schedule_event(
            cycles,
            self.thread_manager.wakeup_event_type,
            u64::from(thread.value()),
        );
        Ok(())
    }

    /// Handles an expired wakeup timer.
    ///
    /// A thread blocked on objects or an arbiter has its wakeup handler run
    /// with [`WakeupReason::Timeout`] and is unlinked from every object; any
    /// thread is then resumed. Timers for threads that no longer exist are
    /// logged and ignored.
    ///
    /// # Errors
    ///
    /// Propagates failures from unlinking or resuming the thread.
    pub fn thread_wakeup_callback(&mut self, userdata: u64, cycles_late: i64) -> Result<()> {
        let Some(&id) = self.thread_manager.wakeup_callback_table.get(&userdata) else {
            log::error!("Callback fired for invalid thread {userdata:08X}");
            return Ok(());
        };
        let Some(thread) = self.thread_manager.threads.get_mut(&id) else {
            log::error!("Callback fired for purged {id}");
            return Ok(());
        };
        log::trace!("Wakeup timer for {id} fired {cycles_late} cycles late");

        let mut objects = Vec::new();
        if thread.status.is_interruptible() {
            thread.invoke_wakeup(WakeupReason::Timeout, None);
            objects = std::mem::take(&mut thread.wait_objects);
        }
        for object in objects {
            self.unlink_waiter(object, id)?;
        }

        self.record(SchedulerEvent::Wakeup {
            thread: id,
            reason: WakeupReason::Timeout,
            object: None,
        });
        self.resume_from_wait(id)
    }

    /// Routes a fired timing event to the kernel.
    ///
    /// Returns `false` when `event` is not one the kernel registered.
    ///
    /// # Errors
    ///
    /// Propagates errors from the event handler.
    pub fn dispatch_timing_event(
        &mut self,
        event: TimingEventType,
        userdata: u64,
        cycles_late: i64,
    ) -> Result<bool> {
        if event != self.thread_manager.wakeup_event_type {
            return Ok(false);
        }
        self.thread_wakeup_callback(userdata, cycles_late)?;
        Ok(true)
    }

    /// Puts a waiting thread back on the ready queue and asks the CPU to
    /// reschedule. Does nothing if the thread is already Ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    ///
    /// # Panics
    ///
    /// Panics if the thread still waits on objects or is Dead.
    pub fn resume_from_wait(&mut self, thread: ThreadId) -> Result<()> {
        if self.thread_manager.resume_from_wait(thread)? {
            self.cpu.prepare_reschedule();
        }
        Ok(())
    }

    /// Sets the nominal and current priority of `thread`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is outside `0..=63`.
    pub fn set_priority(&mut self, thread: ThreadId, priority: Priority) -> Result<()> {
        self.thread_manager.set_priority(thread, priority)
    }

    /// Sets only the current priority of `thread`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    pub fn boost_priority(&mut self, thread: ThreadId, priority: Priority) -> Result<()> {
        self.thread_manager.boost_priority(thread, priority)
    }

    /// Changes a thread's priority the way the guest's priority syscall does.
    ///
    /// The nominal priority is replaced, inherited priority is reapplied, and
    /// every mutex the thread is queued on recomputes what it donates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfRange`] if `priority` is above 63, or
    /// [`Error::InvalidThread`] if the thread does not exist.
    pub fn set_thread_priority(&mut self, thread: ThreadId, priority: Priority) -> Result<()> {
        if priority > THREAD_PRIO_LOWEST {
            return Err(Error::OutOfRange { priority });
        }
        self.thread_manager.set_priority(thread, priority)?;
        self.update_priority(thread)?;

        let pending: Vec<_> = self
            .thread_manager
            .thread(thread)
            .map(|t| t.pending_mutexes.iter().copied().collect())
            .unwrap_or_default();
        for mutex in pending {
            self.update_mutex_priority(mutex)?;
        }
        self.cpu.prepare_reschedule();
        Ok(())
    }

    /// Marks the host's performance counters as reset; the next
    /// [`reschedule`](Self::reschedule) sheds system-core load.
    pub fn mark_perf_stats_reset(&mut self) {
        self.thread_manager.mark_perf_stats_reset();
    }

    fn set_current_thread_status(&mut self, status: ThreadStatus) -> Result<ThreadId> {
        let id = self.current_thread_id().ok_or(Error::NoCurrentThread)?;
        let thread = self
            .thread_manager
            .threads
            .get_mut(&id)
            .ok_or(Error::NoCurrentThread)?;
        thread.status = status;
        Ok(id)
    }

    /// Puts the running thread to sleep until it is explicitly resumed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if no thread is running.
    pub fn wait_current_thread_sleep(&mut self) -> Result<ThreadId> {
        self.set_current_thread_status(ThreadStatus::WaitSleep)
    }

    /// Sleeps the running thread for `nanoseconds`.
    ///
    /// A zero-length sleep with nothing else ready returns at once without
    /// yielding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if no thread is running.
    pub fn sleep_current_thread(&mut self, nanoseconds: i64) -> Result<()> {
        if nanoseconds == 0 && !self.have_ready_threads() {
            return Ok(());
        }
        let id = self.wait_current_thread_sleep()?;
        self.wake_after_delay(id, nanoseconds)?;
        self.cpu.prepare_reschedule();
        Ok(())
    }

    /// Blocks the running thread on the address arbiter at `address`.
    ///
    /// A non-negative `timeout_ns` arms the wakeup timer; the thread then
    /// sees the timeout result in `r0`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if no thread is running.
    pub fn wait_current_thread_arbitration(
        &mut self,
        address: VAddr,
        timeout_ns: Option<i64>,
    ) -> Result<ThreadId> {
        let id = self.set_current_thread_status(ThreadStatus::WaitArb)?;
        if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
            thread.wait_address = address;
            thread.set_wakeup_handler(Box::new(ArbitrationWakeup));
        }
        if let Some(timeout) = timeout_ns {
            self.wake_after_delay(id, timeout)?;
        }
        self.cpu.prepare_reschedule();
        Ok(id)
    }

    /// Wakes threads blocked on the arbiter at `address`, best priority
    /// first. A negative `count` wakes all of them.
    ///
    /// Returns the woken threads in wake order.
    ///
    /// # Errors
    ///
    /// Propagates failures from resuming the threads.
    pub fn signal_arbitration(&mut self, address: VAddr, count: i32) -> Result<Vec<ThreadId>> {
        let mut waiting: Vec<(Priority, ThreadId)> = self
            .thread_manager
            .threads()
            .filter(|t| t.status == ThreadStatus::WaitArb && t.wait_address == address)
            .map(|t| (t.current_priority, t.id))
            .collect();
        waiting.sort_by_key(|(priority, _)| *priority);
        if let Ok(limit) = usize::try_from(count) {
            waiting.truncate(limit);
        }

        let mut woken = Vec::with_capacity(waiting.len());
        for (_, id) in waiting {
            if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
                thread.invoke_wakeup(WakeupReason::Signal, None);
                thread.wait_address = 0;
            }
            self.record(SchedulerEvent::Wakeup {
                thread: id,
                reason: WakeupReason::Signal,
                object: None,
            });
            self.resume_from_wait(id)?;
            woken.push(id);
        }
        Ok(woken)
    }

    /// Blocks the running thread until an IPC reply resumes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if no thread is running.
    pub fn wait_current_thread_ipc(&mut self) -> Result<ThreadId> {
        let id = self.set_current_thread_status(ThreadStatus::WaitIpc)?;
        self.cpu.prepare_reschedule();
        Ok(id)
    }
}
