//! Guest processes, as far as the thread kernel needs them.

use crate::{
    hw::{CoreTiming, CpuCore, GuestMemory, TLS_SLOTS_PER_PAGE},
    kernel::{thread::ProcessorId, KernelSystem},
};

/// Identifier of a guest process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Creates a process id from its raw value.
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

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process {}", self.0)
    }
}

const FULL_PAGE: u8 = u8::MAX >> (8 - TLS_SLOTS_PER_PAGE);

/// A guest process owning threads and their TLS pages.
#[derive(Clone, Debug)]
pub struct Process {
    id: ProcessId,
    name: String,
    ideal_processor: ProcessorId,
    /// One bit per TLS slot, one byte per mapped page.
    tls_slots: Vec<u8>,
    memory_used: u32,
}

impl Process {
    pub(crate) fn new(id: ProcessId, name: String, ideal_processor: ProcessorId) -> Self {
        Self {
            id,
            name,
            ideal_processor,
            tls_slots: Vec::new(),
            memory_used: 0,
        }
    }

    /// Returns the process id.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Returns the process name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the processor new threads default to.
    #[must_use]
    pub fn ideal_processor(&self) -> ProcessorId {
        self.ideal_processor
    }

    /// Returns the slot bitmap of every mapped TLS page.
    #[must_use]
    pub fn tls_pages(&self) -> &[u8] {
        &self.tls_slots
    }

    /// Returns the bytes of BASE region memory charged to this process.
    #[must_use]
    pub fn memory_used(&self) -> u32 {
        self.memory_used
    }

    /// Returns the first free `(page, slot)` in the earliest page that has
    /// one, or `None` if every mapped page is full.
    #[must_use]
    pub fn free_tls_slot(&self) -> Option<(usize, usize)> {
        self.tls_slots
            .iter()
            .position(|bits| *bits != FULL_PAGE)
            .map(|page| (page, (!self.tls_slots[page]).trailing_zeros() as usize))
    }

    /// Appends an empty TLS page and returns its index.
    pub(crate) fn add_tls_page(&mut self, size: u32) -> usize {
        self.memory_used += size;
        self.tls_slots.push(0);
        self.tls_slots.len() - 1
    }

    pub(crate) fn mark_tls_slot(&mut self, page: usize, slot: usize) {
        self.tls_slots[page] |= 1 << slot;
    }

    pub(crate) fn release_tls_slot(&mut self, page: usize, slot: usize) {
        if let Some(bits) = self.tls_slots.get_mut(page) {
            *bits &= !(1 << slot);
        }
    }
}

impl<C: CpuCore, T: CoreTiming, M: GuestMemory> KernelSystem<C, T, M> {
    /// Registers a new process whose threads default to `ideal_processor`.
    pub fn create_process(&mut self, name: impl Into<String>, ideal_processor: ProcessorId) -> ProcessId {
        let id = ProcessId::new(self.next_process_id);
        self.next_process_id += 1;
        self.processes
            .insert(id, Process::new(id, name.into(), ideal_processor));
        id
    }

    /// Returns a process by id.
    #[must_use]
    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    /// Returns the process whose page table is active.
    #[must_use]
    pub fn current_process(&self) -> Option<ProcessId> {
        self.current_process
    }
}
