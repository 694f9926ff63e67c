use crate::{
    hw::{
        mock::{FlatMemory, ManualTiming, RecordingCpu},
        ThreadContext, VAddr,
    },
    kernel::{
        KernelConfig, KernelSystem, Priority, ProcessId, ProcessorId, Thread, ThreadId,
        ThreadParams, ThreadStatus, WaitObjectId,
    },
};

pub(crate) type TestKernel = KernelSystem<RecordingCpu, ManualTiming, FlatMemory>;

/// Entry point inside the default code range of [`FlatMemory`].
pub(crate) const ENTRY: VAddr = 0x0010_0000;

const STACK_TOP: VAddr = 0x0800_0000;

pub(crate) fn kernel_with(config: KernelConfig) -> TestKernel {
    KernelSystem::new(
        config,
        RecordingCpu::new(),
        ManualTiming::new(),
        FlatMemory::default(),
    )
    .unwrap()
}

pub(crate) fn kernel() -> TestKernel {
    kernel_with(KernelConfig::default())
}

/// A kernel with one application process on processor 0.
pub(crate) fn kernel_with_process() -> (TestKernel, ProcessId) {
    let mut kernel = kernel();
    let pid = kernel.create_process("test", 0);
    (kernel, pid)
}

pub(crate) fn spawn_on(
    kernel: &mut TestKernel,
    pid: ProcessId,
    priority: Priority,
    processor_id: ProcessorId,
) -> ThreadId {
    let name = format!("t{}", kernel.thread_list().len());
    kernel
        .create_thread(
            ThreadParams::new(name, ENTRY, STACK_TOP, pid)
                .with_priority(priority)
                .with_processor(processor_id),
        )
        .unwrap()
}

pub(crate) fn spawn(kernel: &mut TestKernel, pid: ProcessId, priority: Priority) -> ThreadId {
    spawn_on(kernel, pid, priority, 0)
}

/// A thread outside any kernel, for exercising `Thread` on its own.
pub(crate) fn detached_thread(id: u32, priority: Priority) -> Thread {
    Thread::new(
        ThreadId::new(id),
        format!("detached{id}"),
        priority,
        0,
        ProcessId::new(1),
        ThreadContext::default(),
    )
}

/// Fires every timer due at the current tick; returns how many the kernel handled.
pub(crate) fn fire_due_timers(kernel: &mut TestKernel) -> usize {
    let due = kernel.timing_mut().take_due();
    let mut fired = 0;
    for (event, userdata, late) in due {
        if kernel.dispatch_timing_event(event, userdata, late).unwrap() {
            fired += 1;
        }
    }
    fired
}

impl TestKernel {
    /// Blocks `id` with `status` on `objects` without going through a wait call.
    pub(crate) fn park_for_test(
        &mut self,
        id: ThreadId,
        status: ThreadStatus,
        objects: &[WaitObjectId],
    ) {
        let manager = &mut self.thread_manager;
        let thread = manager.threads.get_mut(&id).unwrap();
        if thread.status == ThreadStatus::Ready {
            manager.ready_queue.remove(thread.current_priority, id);
        }
        thread.status = status;

        for object in objects {
            self.add_waiting_thread(*object, id).unwrap();
        }
        self.thread_manager.threads.get_mut(&id).unwrap().wait_objects = objects.to_vec();
    }
}
