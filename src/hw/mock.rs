//! In-process collaborators for driving a kernel without a real emulator.
//!
//! These implementations record what the kernel asked of them so tests and
//! tools can inspect context switches, scheduled timeouts and TLS mappings.
//! [`ManualTiming`] never fires events on its own: advance the clock with
//! [`ManualTiming::add_ticks`], collect the due events with
//! [`ManualTiming::take_due`] and hand each one to
//! [`KernelSystem::dispatch_timing_event`](crate::kernel::KernelSystem::dispatch_timing_event).

use std::ops::Range;

use crate::{
    hw::{
        cpu::{Cp15Register, CpuCore, ThreadContext},
        memory::{GuestMemory, VAddr},
        timing::{CoreTiming, TimingEventType},
    },
    kernel::ProcessId,
};

/// A CPU that only holds one live register file.
#[derive(Debug, Default)]
pub struct RecordingCpu {
    live: ThreadContext,
    thread_uro: u32,
    saves: usize,
    loads: usize,
    runs: usize,
    reschedule_requests: usize,
}

impl RecordingCpu {
    /// Creates a CPU with zeroed registers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live register file.
    #[must_use]
    pub fn live(&self) -> &ThreadContext {
        &self.live
    }

    /// Returns the live register file for simulating guest execution.
    pub fn live_mut(&mut self) -> &mut ThreadContext {
        &mut self.live
    }

    /// Returns the last value written to the TLS base register.
    #[must_use]
    pub fn thread_uro(&self) -> u32 {
        self.thread_uro
    }

    /// Returns how many contexts were saved.
    #[must_use]
    pub fn saves(&self) -> usize {
        self.saves
    }

    /// Returns how many contexts were loaded.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// Returns how many execution slices ran.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Returns how many times a reschedule was requested.
    #[must_use]
    pub fn reschedule_requests(&self) -> usize {
        self.reschedule_requests
    }
}

impl CpuCore for RecordingCpu {
    fn save_context(&mut self, context: &mut ThreadContext) {
        self.saves += 1;
        context.clone_from(&self.live);
    }

    fn load_context(&mut self, context: &ThreadContext) {
        self.loads += 1;
        self.live.clone_from(context);
    }

    fn set_cp15_register(&mut self, register: Cp15Register, value: u32) {
        match register {
            Cp15Register::ThreadUro => self.thread_uro = value,
        }
    }

    fn run(&mut self) {
        self.runs += 1;
    }

    fn prepare_reschedule(&mut self) {
        self.reschedule_requests += 1;
    }
}

/// A timing event waiting in [`ManualTiming`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledEvent {
    /// Event type.
    pub event: TimingEventType,
    /// Userdata passed back on dispatch.
    pub userdata: u64,
    /// Absolute tick at which the event is due.
    pub due: u64,
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTiming {
    ticks: u64,
    names: Vec<&'static str>,
    pending: Vec<ScheduledEvent>,
    advances: usize,
}

impl ManualTiming {
    /// Creates a clock at tick zero with nothing scheduled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `ticks`.
    pub fn add_ticks(&mut self, ticks: u64) {
        self.ticks = self.ticks.saturating_add(ticks);
    }

    /// Returns the events not yet fired.
    #[must_use]
    pub fn pending(&self) -> &[ScheduledEvent] {
        &self.pending
    }

    /// Returns `true` if `event` is pending for `userdata`.
    #[must_use]
    pub fn is_scheduled(&self, event: TimingEventType, userdata: u64) -> bool {
        self.pending
            .iter()
            .any(|e| e.event == event && e.userdata == userdata)
    }

    /// Returns the name an event type was registered under.
    #[must_use]
    pub fn event_name(&self, event: TimingEventType) -> Option<&'static str> {
        self.names.get(event.0 as usize).copied()
    }

    /// Removes and returns every event due at the current tick, earliest
    /// first, together with how many cycles late it is.
    pub fn take_due(&mut self) -> Vec<(TimingEventType, u64, i64)> {
        let now = self.ticks;
        let (mut due, rest): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|e| e.due <= now);
        self.pending = rest;
        due.sort_by_key(|e| e.due);
        due.into_iter()
            .map(|e| {
                let late = i64::try_from(now - e.due).unwrap_or(i64::MAX);
                (e.event, e.userdata, late)
            })
            .collect()
    }

    /// Returns how many times the clock was asked to advance.
    #[must_use]
    pub fn advances(&self) -> usize {
        self.advances
    }
}

impl CoreTiming for ManualTiming {
    fn ticks(&self) -> u64 {
        self.ticks
    }

    fn register_event(&mut self, name: &'static str) -> TimingEventType {
        let id = u32::try_from(self.names.len()).unwrap_or(u32::MAX);
        self.names.push(name);
        TimingEventType(id)
    }

    fn schedule_event(&mut self, cycles_into_future: i64, event: TimingEventType, userdata: u64) {
        let delay = u64::try_from(cycles_into_future).unwrap_or(0);
        self.pending.push(ScheduledEvent {
            event,
            userdata,
            due: self.ticks.saturating_add(delay),
        });
    }

    fn unschedule_event(&mut self, event: TimingEventType, userdata: u64) {
        self.pending
            .retain(|e| !(e.event == event && e.userdata == userdata));
    }

    fn advance(&mut self) {
        self.advances += 1;
    }
}

/// A TLS page mapping recorded by [`FlatMemory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedRange {
    /// Process the page was mapped into.
    pub process: ProcessId,
    /// Virtual address of the mapping.
    pub address: VAddr,
    /// Physical offset backing the mapping.
    pub fcram_offset: u32,
    /// Mapping size in bytes.
    pub size: u32,
}

/// A memory manager with one shared code range and a log of mappings.
#[derive(Debug)]
pub struct FlatMemory {
    code: Range<VAddr>,
    mapped: Vec<MappedRange>,
    zeroed: Vec<(ProcessId, VAddr, u32)>,
    page_tables: Vec<ProcessId>,
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new(0x0010_0000..0x0400_0000)
    }
}

impl FlatMemory {
    /// Creates a memory manager where `code` is valid in every process.
    #[must_use]
    pub fn new(code: Range<VAddr>) -> Self {
        Self {
            code,
            mapped: Vec::new(),
            zeroed: Vec::new(),
            page_tables: Vec::new(),
        }
    }

    /// Returns every mapping made so far.
    #[must_use]
    pub fn mapped(&self) -> &[MappedRange] {
        &self.mapped
    }

    /// Returns every zeroed block as `(process, address, size)`.
    #[must_use]
    pub fn zeroed(&self) -> &[(ProcessId, VAddr, u32)] {
        &self.zeroed
    }

    /// Returns the sequence of page-table switches.
    #[must_use]
    pub fn page_tables(&self) -> &[ProcessId] {
        &self.page_tables
    }
}

impl GuestMemory for FlatMemory {
    fn is_valid_virtual_address(&self, process: ProcessId, address: VAddr) -> bool {
        self.code.contains(&address)
            || self.mapped.iter().any(|m| {
                m.process == process && address >= m.address && address - m.address < m.size
            })
    }

    fn map_backing_memory(&mut self, process: ProcessId, address: VAddr, fcram_offset: u32, size: u32) {
        self.mapped.push(MappedRange {
            process,
            address,
            fcram_offset,
            size,
        });
    }

    fn zero_block(&mut self, process: ProcessId, address: VAddr, size: u32) {
        self.zeroed.push((process, address, size));
    }

    fn set_current_page_table(&mut self, process: ProcessId) {
        self.page_tables.push(process);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timing_due_order() {
        let mut timing = ManualTiming::new();
        let ev = timing.register_event("wake");
        assert_eq!(timing.event_name(ev), Some("wake"));

        timing.schedule_event(100, ev, 2);
        timing.schedule_event(50, ev, 1);
        timing.schedule_event(500, ev, 3);
        timing.add_ticks(120);

        let due = timing.take_due();
        assert_eq!(due, vec![(ev, 1, 70), (ev, 2, 20)]);
        assert_eq!(timing.pending().len(), 1);

        timing.unschedule_event(ev, 3);
        assert!(timing.pending().is_empty());
    }

    #[test]
    fn test_flat_memory_mappings() {
        let mut memory = FlatMemory::default();
        let pid = ProcessId::new(1);
        let other = ProcessId::new(2);
        assert!(memory.is_valid_virtual_address(pid, 0x0010_0000));
        assert!(!memory.is_valid_virtual_address(pid, 0x1FF8_2000));

        memory.map_backing_memory(pid, 0x1FF8_2000, 0, 0x1000);
        assert!(memory.is_valid_virtual_address(pid, 0x1FF8_2FFF));
        assert!(!memory.is_valid_virtual_address(pid, 0x1FF8_3000));
        assert!(!memory.is_valid_virtual_address(other, 0x1FF8_2000));
    }

    #[test]
    fn test_recording_cpu_round_trip() {
        let mut cpu = RecordingCpu::new();
        let mut ctx = ThreadContext::default();
        ctx.set_cpu_register(3, 7);
        cpu.load_context(&ctx);
        cpu.live_mut().set_cpu_register(3, 9);

        let mut saved = ThreadContext::default();
        cpu.save_context(&mut saved);
        assert_eq!(saved.cpu_register(3), 9);
        assert_eq!((cpu.loads(), cpu.saves()), (1, 1));
    }
}
