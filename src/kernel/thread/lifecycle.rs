//! Thread creation, main-thread setup, stopping and exiting.
//!
//! # TLS Allocation
//!
//! Each thread owns one 0x200-byte TLS entry; eight entries share a page.
//! Creation takes the first free slot of the earliest page that has one. When
//! every mapped page is full, a fresh page is carved out of the kernel's BASE
//! region, charged to the owner process and mapped at
//! `TLS_AREA_VADDR + page * PAGE_SIZE`. Stopping a thread frees its slot but
//! never unmaps the page.

use crate::{
    hw::{
        CoreTiming, Cpsr, CpuCore, GuestMemory, VAddr, FPSCR_MAIN_THREAD, HEAP_VADDR_END,
        PAGE_SIZE, TLS_AREA_VADDR, TLS_ENTRY_SIZE,
    },
    kernel::{
        process::ProcessId,
        sync::WaitObjectId,
        thread::{
            Priority, ProcessorId, Thread, ThreadId, ThreadStatus, WakeupReason,
            THREAD_PRIO_DEFAULT, THREAD_PRIO_LOWEST, THREAD_PROCESSOR_ID_DEFAULT,
            THREAD_PROCESSOR_ID_MAX,
        },
        trace::SchedulerEvent,
        KernelSystem,
    },
    Error, Result,
};

/// Arguments of [`KernelSystem::create_thread`].
///
/// # Example
///
/// ```rust,no_run
/// use hle_kernel::kernel::{ProcessId, ThreadParams};
///
/// let params = ThreadParams::new("worker", 0x0010_0000, 0x0FFF_F000, ProcessId::new(1))
///     .with_priority(0x30)
///     .with_arg(7)
///     .with_processor(0);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadParams {
    /// Debug name.
    pub name: String,
    /// First instruction. Bit 0 selects Thumb mode.
    pub entry_point: VAddr,
    /// Initial stack pointer.
    pub stack_top: VAddr,
    /// Owning process.
    pub owner_process: ProcessId,
    /// Initial priority.
    ///
    /// Default: 48
    pub priority: Priority,
    /// Value placed in `r0`.
    ///
    /// Default: 0
    pub arg: u32,
    /// Processor to run on. `-2` picks the owner's ideal processor.
    ///
    /// Default: -2
    pub processor_id: ProcessorId,
}

impl ThreadParams {
    /// Creates parameters with the default priority, argument and processor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        entry_point: VAddr,
        stack_top: VAddr,
        owner_process: ProcessId,
    ) -> Self {
        Self {
            name: name.into(),
            entry_point,
            stack_top,
            owner_process,
            priority: THREAD_PRIO_DEFAULT,
            arg: 0,
            processor_id: THREAD_PROCESSOR_ID_DEFAULT,
        }
    }

    /// Sets the initial priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the value passed in `r0`.
    #[must_use]
    pub fn with_arg(mut self, arg: u32) -> Self {
        self.arg = arg;
        self
    }

    /// Sets the processor.
    #[must_use]
    pub fn with_processor(mut self, processor_id: ProcessorId) -> Self {
        self.processor_id = processor_id;
        self
    }
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    /// Creates a thread and queues it as Ready.
    ///
    /// The thread gets a zeroed TLS entry, a fresh register context with
    /// `r0 = arg`, `pc = entry_point`, `sp = stack_top` and user mode (Thumb
    /// when bit 0 of the entry point is set), and is appended to its priority
    /// level. It does not run until the next [`reschedule`](Self::reschedule).
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfRange`] if the priority is above 63
    /// - [`Error::OutOfRangeKernel`] if the processor id is outside `-2..=2`
    /// - [`Error::InvalidProcess`] if the owner does not exist
    /// - [`Error::InvalidAddress`] if the entry point is not mapped in the owner
    /// - [`Error::OutOfMemory`] if a new TLS page is needed and the BASE
    ///   region is exhausted
    ///
    /// No thread id is consumed when creation fails.
    pub fn create_thread(&mut self, params: ThreadParams) -> Result<ThreadId> {
        let ThreadParams {
            name,
            entry_point,
            stack_top,
            owner_process,
            priority,
            arg,
            processor_id,
        } = params;

        if priority > THREAD_PRIO_LOWEST {
            log::error!("Invalid thread priority: {priority}");
            return Err(Error::OutOfRange { priority });
        }
        if !(THREAD_PROCESSOR_ID_DEFAULT..=THREAD_PROCESSOR_ID_MAX).contains(&processor_id) {
            log::error!("Invalid processor id: {processor_id}");
            return Err(Error::OutOfRangeKernel { processor_id });
        }

        let process = self
            .processes
            .get(&owner_process)
            .ok_or(Error::InvalidProcess(owner_process))?;
        let processor_id = if processor_id == THREAD_PROCESSOR_ID_DEFAULT {
            process.ideal_processor()
        } else {
            processor_id
        };

        if !self.memory.is_valid_virtual_address(owner_process, entry_point) {
            log::error!("(name={name}): invalid entry {entry_point:08x}");
            return Err(Error::InvalidAddress {
                address: entry_point,
            });
        }

        let (page, slot) = self.find_tls_slot(owner_process)?;
        let tls_address = TLS_AREA_VADDR + page as u32 * PAGE_SIZE + slot as u32 * TLS_ENTRY_SIZE;
        if let Some(process) = self.processes.get_mut(&owner_process) {
            process.mark_tls_slot(page, slot);
        }
        self.memory
            .zero_block(owner_process, tls_address, TLS_ENTRY_SIZE);

        let id = self.thread_manager.allocate_thread_id();
        let mut thread = Thread::new(
            id,
            name,
            priority,
            processor_id,
            owner_process,
            self.cpu.new_context(),
        );
        thread.entry_point = entry_point;
        thread.stack_top = stack_top;
        thread.tls_address = tls_address;
        thread.last_running_ticks = self.timing.ticks();

        let context = &mut thread.context;
        context.reset();
        context.set_cpu_register(0, arg);
        context.set_program_counter(entry_point);
        context.set_stack_pointer(stack_top);
        let mut cpsr = Cpsr::USER32_MODE;
        if entry_point & 1 != 0 {
            cpsr |= Cpsr::THUMB;
        }
        context.set_cpsr(cpsr.bits());

        let manager = &mut self.thread_manager;
        manager
            .wakeup_callback_table
            .insert(u64::from(id.value()), id);
        if manager.is_system_core(processor_id) {
            manager.system_thread_count += 1;
        }
        manager.ready_queue.prepare(priority);
        manager.ready_queue.push_back(priority, id);
        thread.status = ThreadStatus::Ready;
        manager.threads.insert(id, thread);

        log::debug!("Created {id} for {owner_process} at 0x{entry_point:08X}, priority {priority}");
        self.record(SchedulerEvent::ThreadCreated {
            thread: id,
            process: owner_process,
            priority,
            processor_id,
            entry_point,
            tls_address,
        });
        Ok(id)
    }

    /// Returns a free `(page, slot)` in `process`, mapping a new TLS page
    /// when every existing one is full.
    fn find_tls_slot(&mut self, process: ProcessId) -> Result<(usize, usize)> {
        let owner = self
            .processes
            .get_mut(&process)
            .ok_or(Error::InvalidProcess(process))?;
        if let Some(free) = owner.free_tls_slot() {
            return Ok(free);
        }

        let Some(offset) = self.base_region.linear_allocate(PAGE_SIZE) else {
            log::error!("Not enough space in region to allocate a new TLS page for thread");
            return Err(Error::OutOfMemory);
        };
        let page = owner.add_tls_page(PAGE_SIZE);
        self.memory.map_backing_memory(
            process,
            TLS_AREA_VADDR + page as u32 * PAGE_SIZE,
            offset,
            PAGE_SIZE,
        );
        Ok((page, 0))
    }

    /// Creates the `"main"` thread of `process`.
    ///
    /// The thread runs on the process's ideal processor with its stack at the
    /// end of the heap and the FPSCR flags applications expect at startup.
    ///
    /// # Errors
    ///
    /// Same as [`create_thread`](Self::create_thread).
    pub fn setup_main_thread(
        &mut self,
        entry_point: VAddr,
        priority: Priority,
        process: ProcessId,
    ) -> Result<ThreadId> {
        let ideal = self
            .processes
            .get(&process)
            .ok_or(Error::InvalidProcess(process))?
            .ideal_processor();

        let id = self.create_thread(
            ThreadParams::new("main", entry_point, HEAP_VADDR_END, process)
                .with_priority(priority)
                .with_processor(ideal),
        )?;
        if let Some(thread) = self.thread_manager.threads.get_mut(&id) {
            thread.context.set_fpscr(FPSCR_MAIN_THREAD.bits());
        }
        Ok(id)
    }

    /// Stops a thread.
    ///
    /// Cancels its wakeup timer, takes it off the ready queue, marks it Dead,
    /// wakes the threads joining on it, unlinks it from every object it waited
    /// on, releases its mutexes and frees its TLS slot. A pending wakeup
    /// handler runs with [`WakeupReason::Cancel`]. The thread stays in the
    /// arena until [`exit_current_thread`](Self::exit_current_thread) purges it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidThread`] if the thread does not exist.
    pub fn stop_thread(&mut self, id: ThreadId) -> Result<()> {
        let userdata = u64::from(id.value());
        self.timing
            .unschedule_event(self.thread_manager.wakeup_event_type, userdata);
        self.thread_manager.wakeup_callback_table.remove(&userdata);

        let thread = self
            .thread_manager
            .threads
            .get_mut(&id)
            .ok_or(Error::InvalidThread(id))?;
        if thread.status == ThreadStatus::Ready {
            self.thread_manager
                .ready_queue
                .remove(thread.current_priority, id);
        }
        thread.status = ThreadStatus::Dead;

        self.wakeup_all_waiting_threads(WaitObjectId::Thread(id))?;

        let objects = match self.thread_manager.threads.get_mut(&id) {
            Some(thread) => {
                thread.invoke_wakeup(WakeupReason::Cancel, None);
                std::mem::take(&mut thread.wait_objects)
            }
            None => Vec::new(),
        };
        for object in objects {
            self.unlink_waiter(object, id)?;
        }

        self.release_thread_mutexes(id)?;

        if let Some(thread) = self.thread_manager.threads.get(&id) {
            let (page, slot) = thread.tls_slot();
            if let Some(process) = self.processes.get_mut(&thread.owner_process) {
                process.release_tls_slot(page, slot);
            }
        }

        self.record(SchedulerEvent::ThreadStopped { thread: id });
        Ok(())
    }

    /// Stops the running thread and removes it from the thread list.
    ///
    /// The CPU keeps pointing at the purged thread until the next
    /// [`reschedule`](Self::reschedule), which then skips saving its context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCurrentThread`] if no thread is running.
    pub fn exit_current_thread(&mut self) -> Result<()> {
        let id = self.current_thread_id().ok_or(Error::NoCurrentThread)?;
        self.stop_thread(id)?;

        let manager = &mut self.thread_manager;
        if let Some(thread) = manager.threads.remove(&id) {
            if manager.is_system_core(thread.processor_id) {
                manager.system_thread_count = manager.system_thread_count.saturating_sub(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::{
            mock::{FlatMemory, ManualTiming, RecordingCpu},
            TLS_SLOTS_PER_PAGE,
        },
        kernel::{
            config::{KernelConfig, MemoryConfig},
            sync::ResetType,
        },
        test::{kernel_with, kernel_with_process, spawn, spawn_on, ENTRY},
    };

    #[test]
    fn test_create_initial_state() {
        let (mut kernel, pid) = kernel_with_process();
        kernel.timing_mut().add_ticks(500);
        let id = kernel
            .create_thread(
                ThreadParams::new("t", ENTRY | 1, 0x0800_0000, pid)
                    .with_priority(40)
                    .with_arg(0xAB)
                    .with_processor(0),
            )
            .unwrap();

        let thread = kernel.thread(id).unwrap();
        assert_eq!(thread.status(), ThreadStatus::Ready);
        assert_eq!(thread.name(), "t");
        assert_eq!(thread.last_running_ticks(), 500);
        assert_eq!(thread.tls_address(), TLS_AREA_VADDR);
        assert_eq!(thread.command_buffer_address(), TLS_AREA_VADDR + 0x80);

        let context = thread.context();
        assert_eq!(context.cpu_register(0), 0xAB);
        assert_eq!(context.program_counter(), ENTRY | 1);
        assert_eq!(context.stack_pointer(), 0x0800_0000);
        assert_eq!(context.cpsr(), 0x30);

        assert_eq!(kernel.thread_manager().ready_queue().contains(id), Some(40));
        assert_eq!(kernel.memory().zeroed(), &[(pid, TLS_AREA_VADDR, TLS_ENTRY_SIZE)]);
    }

    #[test]
    fn test_create_rejects_bad_arguments() {
        let (mut kernel, pid) = kernel_with_process();

        let err = kernel
            .create_thread(ThreadParams::new("t", ENTRY, 0, pid).with_priority(64))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { priority: 64 }));

        let err = kernel
            .create_thread(ThreadParams::new("t", ENTRY, 0, pid).with_processor(3))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRangeKernel { processor_id: 3 }));

        let err = kernel
            .create_thread(ThreadParams::new("t", 0x10, 0, pid))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { address: 0x10 }));

        let missing = ProcessId::new(42);
        let err = kernel
            .create_thread(ThreadParams::new("t", ENTRY, 0, missing))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProcess(p) if p == missing));

        assert!(kernel.thread_list().is_empty());
        assert!(kernel.memory().mapped().is_empty());
    }

    #[test]
    fn test_default_processor_resolves_to_ideal() {
        let (mut kernel, _) = kernel_with_process();
        let sys = kernel.create_process("sys", 1);
        let id = kernel
            .create_thread(ThreadParams::new("t", ENTRY, 0, sys))
            .unwrap();
        assert_eq!(kernel.thread(id).unwrap().processor_id(), 1);
        assert_eq!(kernel.thread_manager().system_thread_count(), 1);
    }

    #[test]
    fn test_ninth_thread_maps_new_page() {
        let (mut kernel, pid) = kernel_with_process();
        let ids: Vec<_> = (0..=TLS_SLOTS_PER_PAGE)
            .map(|_| spawn(&mut kernel, pid, 30))
            .collect();

        let mapped = kernel.memory().mapped();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].address, TLS_AREA_VADDR);
        assert_eq!(mapped[1].address, TLS_AREA_VADDR + PAGE_SIZE);
        assert_eq!(mapped[1].fcram_offset, mapped[0].fcram_offset + PAGE_SIZE);

        assert_eq!(kernel.thread(ids[8]).unwrap().tls_slot(), (1, 0));
        assert_eq!(kernel.process(pid).unwrap().memory_used(), 2 * PAGE_SIZE);
        assert_eq!(kernel.base_region().used(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_stopped_slot_is_reused() {
        let (mut kernel, pid) = kernel_with_process();
        let ids: Vec<_> = (0..10).map(|_| spawn(&mut kernel, pid, 30)).collect();

        kernel.stop_thread(ids[9]).unwrap();
        kernel.stop_thread(ids[3]).unwrap();
        let reused = spawn(&mut kernel, pid, 30);
        assert_eq!(kernel.thread(reused).unwrap().tls_slot(), (0, 3));
        let next = spawn(&mut kernel, pid, 30);
        assert_eq!(kernel.thread(next).unwrap().tls_slot(), (1, 1));
        assert_eq!(kernel.memory().mapped().len(), 2);
    }

    #[test]
    fn test_tls_region_exhausted() {
        let mut kernel = kernel_with(
            KernelConfig::new().with_memory(MemoryConfig::new().with_base_region_size(PAGE_SIZE)),
        );
        let pid = kernel.create_process("p", 0);
        for _ in 0..TLS_SLOTS_PER_PAGE {
            spawn(&mut kernel, pid, 30);
        }
        let err = kernel
            .create_thread(ThreadParams::new("t", ENTRY, 0, pid))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
        assert_eq!(err.result_code().raw(), 0xD860_07F3);
        assert_eq!(kernel.thread_list().len(), 8);

        // a freed slot makes room again
        kernel.stop_thread(kernel.thread_list()[0]).unwrap();
        assert!(kernel.create_thread(ThreadParams::new("t", ENTRY, 0, pid)).is_ok());
    }

    #[test]
    fn test_setup_main_thread() {
        let mut kernel = KernelSystem::new(
            KernelConfig::default(),
            RecordingCpu::new(),
            ManualTiming::new(),
            FlatMemory::default(),
        )
        .unwrap();
        let pid = kernel.create_process("app", 0);
        let main = kernel.setup_main_thread(ENTRY, 0x30, pid).unwrap();

        let thread = kernel.thread(main).unwrap();
        assert_eq!(thread.name(), "main");
        assert_eq!(thread.processor_id(), 0);
        assert_eq!(thread.stack_top(), HEAP_VADDR_END);
        assert_eq!(thread.context().fpscr(), 0x03C0_0010);
        assert_eq!(thread.context().cpu_register(0), 0);
    }

    #[test]
    fn test_stop_all_leaves_queue_empty() {
        let (mut kernel, pid) = kernel_with_process();
        let ids: Vec<_> = (0..5).map(|i| spawn(&mut kernel, pid, 20 + i)).collect();
        let event = kernel.create_event(ResetType::Sticky, "ev");
        kernel.park_for_test(ids[1], ThreadStatus::WaitSynchAny, &[WaitObjectId::Event(event)]);

        for id in &ids {
            kernel.stop_thread(*id).unwrap();
        }
        assert!(kernel.thread_manager().ready_queue().is_empty());
        assert!(!kernel.have_ready_threads());
        for id in &ids {
            let thread = kernel.thread(*id).unwrap();
            assert_eq!(thread.status(), ThreadStatus::Dead);
            assert!(thread.wait_objects().is_empty());
        }
        assert!(kernel
            .waiting_threads(WaitObjectId::Event(event))
            .unwrap()
            .is_empty());
        assert_eq!(kernel.process(pid).unwrap().free_tls_slot(), Some((0, 0)));
    }

    #[test]
    fn test_stop_cancels_timer() {
        let (mut kernel, pid) = kernel_with_process();
        let a = spawn(&mut kernel, pid, 20);
        kernel.park_for_test(a, ThreadStatus::WaitSleep, &[]);
        kernel.wake_after_delay(a, 1_000).unwrap();
        let event = kernel.thread_manager().wakeup_event_type();
        assert!(kernel.timing().is_scheduled(event, 1));

        kernel.stop_thread(a).unwrap();
        assert!(kernel.timing().pending().is_empty());
        assert!(kernel.thread_manager().wakeup_callback_table.is_empty());
    }

    #[test]
    fn test_stop_wakes_joiners() {
        let (mut kernel, pid) = kernel_with_process();
        let target = spawn(&mut kernel, pid, 30);
        let joiner = spawn(&mut kernel, pid, 30);
        kernel.park_for_test(joiner, ThreadStatus::WaitSynchAny, &[WaitObjectId::Thread(target)]);

        kernel.stop_thread(target).unwrap();
        let thread = kernel.thread(joiner).unwrap();
        assert_eq!(thread.status(), ThreadStatus::Ready);
        assert!(thread.wait_objects().is_empty());
    }

    #[test]
    fn test_exit_current_thread_purges() {
        let (mut kernel, pid) = kernel_with_process();
        let sys = spawn_on(&mut kernel, pid, 10, 1);
        let app = spawn(&mut kernel, pid, 20);
        kernel.reschedule().unwrap();
        // the system-core branch ran a slice and popped again
        assert_eq!(kernel.current_thread_id(), Some(sys));

        kernel.exit_current_thread().unwrap();
        assert!(kernel.thread(sys).is_none());
        assert_eq!(kernel.thread_manager().system_thread_count(), 0);
        assert_eq!(kernel.thread_list(), vec![app]);

        let saves = kernel.cpu().saves();
        kernel.reschedule().unwrap();
        assert_eq!(kernel.current_thread_id(), Some(app));
        assert_eq!(kernel.cpu().saves(), saves);
    }

    #[test]
    fn test_exit_without_current_thread() {
        let (mut kernel, _) = kernel_with_process();
        assert!(matches!(
            kernel.exit_current_thread(),
            Err(Error::NoCurrentThread)
        ));
    }
}
