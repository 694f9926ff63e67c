//! Interfaces to the emulator components the kernel drives but does not own.
//!
//! The thread kernel talks to three collaborators:
//!
//! - [`CpuCore`] - saves and restores register state and runs guest code
//! - [`CoreTiming`] - the cycle counter and delayed callback queue
//! - [`GuestMemory`] - address validation, TLS page mapping and page tables
//!
//! [`mock`] provides small recording implementations of all three.

pub mod cpu;
pub mod memory;
pub mod mock;
pub mod timing;

pub use cpu::{Cp15Register, CpuCore, Cpsr, Fpscr, ThreadContext, FPSCR_MAIN_THREAD};
pub use memory::{
    GuestMemory, MemoryRegionInfo, VAddr, HEAP_VADDR_END, PAGE_SIZE, TLS_AREA_VADDR,
    TLS_ENTRY_SIZE, TLS_SLOTS_PER_PAGE,
};
pub use timing::{ns_to_cycles, CoreTiming, TimingEventType, BASE_CLOCK_RATE_ARM11};
