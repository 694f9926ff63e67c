//! Guest memory collaborator interface and the physical region TLS pages come from.

use crate::kernel::ProcessId;

/// A guest virtual address.
pub type VAddr = u32;

/// Size of one guest page.
pub const PAGE_SIZE: u32 = 0x1000;

/// Size of one thread-local storage entry.
pub const TLS_ENTRY_SIZE: u32 = 0x200;

/// Number of TLS entries that fit in one page.
pub const TLS_SLOTS_PER_PAGE: u32 = PAGE_SIZE / TLS_ENTRY_SIZE;

/// Virtual address at which TLS pages are mapped into every process.
pub const TLS_AREA_VADDR: VAddr = 0x1FF8_2000;

/// Start of the application heap.
pub const HEAP_VADDR: VAddr = 0x0800_0000;

/// Size of the application heap area.
pub const HEAP_SIZE: u32 = 0x0800_0000;

/// End of the application heap, used as the main thread's stack top.
pub const HEAP_VADDR_END: VAddr = HEAP_VADDR + HEAP_SIZE;

/// The virtual memory manager as seen by the kernel.
pub trait GuestMemory {
    /// Returns `true` if `address` is mapped in `process`.
    fn is_valid_virtual_address(&self, process: ProcessId, address: VAddr) -> bool;

    /// Maps `size` bytes of physical memory starting at `fcram_offset` into
    /// `process` at `address`.
    fn map_backing_memory(&mut self, process: ProcessId, address: VAddr, fcram_offset: u32, size: u32);

    /// Fills `size` bytes at `address` in `process` with zeroes.
    fn zero_block(&mut self, process: ProcessId, address: VAddr, size: u32);

    /// Makes `process` the page table used for guest memory accesses.
    fn set_current_page_table(&mut self, process: ProcessId);
}

/// A contiguous physical memory region handing out pages front to back.
///
/// TLS pages are carved out of the BASE region. Pages are never returned
/// while the kernel runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegionInfo {
    base: u32,
    size: u32,
    used: u32,
}

impl MemoryRegionInfo {
    /// Creates a region covering `size` bytes starting at physical offset `base`.
    #[must_use]
    pub fn new(base: u32, size: u32) -> Self {
        Self { base, size, used: 0 }
    }

    /// Returns the physical offset of the region.
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Returns the total size of the region in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the number of bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Reserves `size` bytes and returns their physical offset, or `None` when
    /// the region is exhausted.
    pub fn linear_allocate(&mut self, size: u32) -> Option<u32> {
        let remaining = self.size - self.used;
        if size > remaining {
            return None;
        }
        let offset = self.base + self.used;
        self.used += size;
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_layout() {
        assert_eq!(TLS_SLOTS_PER_PAGE, 8);
        assert_eq!(HEAP_VADDR_END, 0x1000_0000);
    }

    #[test]
    fn test_linear_allocate() {
        let mut region = MemoryRegionInfo::new(0x0700_0000, 2 * PAGE_SIZE);
        assert_eq!(region.linear_allocate(PAGE_SIZE), Some(0x0700_0000));
        assert_eq!(region.linear_allocate(PAGE_SIZE), Some(0x0700_1000));
        assert_eq!(region.linear_allocate(PAGE_SIZE), None);
        assert_eq!(region.used(), 2 * PAGE_SIZE);
    }
}
