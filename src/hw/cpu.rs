//! CPU collaborator interface and saved register snapshots.
//!
//! The kernel never executes guest instructions itself. It only needs to park
//! and restore register state when switching threads, hand the TLS base to the
//! coprocessor register guest code reads it from, and occasionally run one
//! slice of guest execution for the system core.

use bitflags::bitflags;

bitflags! {
    /// Current program status register bits the kernel sets up for new threads.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Cpsr: u32 {
        /// User mode (`M[4:0] = 0b10000`).
        const USER32_MODE = 0x10;
        /// Thumb execution state.
        const THUMB = 1 << 5;
        /// FIQ disable.
        const FIQ_DISABLE = 1 << 6;
        /// IRQ disable.
        const IRQ_DISABLE = 1 << 7;
    }
}

bitflags! {
    /// Floating point status and control register bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Fpscr: u32 {
        /// Inexact cumulative exception.
        const IXC = 1 << 4;
        /// Round towards zero (`RMode = 0b11`).
        const ROUND_TOZERO = 3 << 22;
        /// Flush denormals to zero.
        const FLUSH_TO_ZERO = 1 << 24;
        /// Default NaN mode.
        const DEFAULT_NAN = 1 << 25;
    }
}

/// FPSCR value the main thread of every process starts with (`0x03C00010`).
pub const FPSCR_MAIN_THREAD: Fpscr = Fpscr::DEFAULT_NAN
    .union(Fpscr::FLUSH_TO_ZERO)
    .union(Fpscr::ROUND_TOZERO)
    .union(Fpscr::IXC);

/// Index of the stack pointer in the general purpose register file.
pub const REG_SP: usize = 13;
/// Index of the link register.
pub const REG_LR: usize = 14;
/// Index of the program counter.
pub const REG_PC: usize = 15;

/// Coprocessor 15 registers the kernel writes during a context switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cp15Register {
    /// User read-only thread id register, holds the TLS base address.
    ThreadUro,
}

/// Saved register state of a guest thread.
///
/// Each [`Thread`](crate::kernel::Thread) exclusively owns one snapshot. The
/// scheduler moves it into the CPU on switch-in and copies the live registers
/// back on switch-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadContext {
    cpu_registers: [u32; 16],
    fpu_registers: [u32; 64],
    cpsr: u32,
    fpscr: u32,
    fpexc: u32,
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self {
            cpu_registers: [0; 16],
            fpu_registers: [0; 64],
            cpsr: 0,
            fpscr: 0,
            fpexc: 0,
        }
    }
}

impl ThreadContext {
    /// Clears every register.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns general purpose register `index` (`r0`..`r15`).
    ///
    /// # Panics
    ///
    /// Panics if `index >= 16`.
    #[must_use]
    pub fn cpu_register(&self, index: usize) -> u32 {
        self.cpu_registers[index]
    }

    /// Sets general purpose register `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= 16`.
    pub fn set_cpu_register(&mut self, index: usize, value: u32) {
        self.cpu_registers[index] = value;
    }

    /// Returns VFP register word `index`.
    #[must_use]
    pub fn fpu_register(&self, index: usize) -> u32 {
        self.fpu_registers[index]
    }

    /// Sets VFP register word `index`.
    pub fn set_fpu_register(&mut self, index: usize, value: u32) {
        self.fpu_registers[index] = value;
    }

    /// Returns the program counter.
    #[must_use]
    pub fn program_counter(&self) -> u32 {
        self.cpu_registers[REG_PC]
    }

    /// Sets the program counter.
    pub fn set_program_counter(&mut self, value: u32) {
        self.cpu_registers[REG_PC] = value;
    }

    /// Returns the stack pointer.
    #[must_use]
    pub fn stack_pointer(&self) -> u32 {
        self.cpu_registers[REG_SP]
    }

    /// Sets the stack pointer.
    pub fn set_stack_pointer(&mut self, value: u32) {
        self.cpu_registers[REG_SP] = value;
    }

    /// Returns the link register.
    #[must_use]
    pub fn link_register(&self) -> u32 {
        self.cpu_registers[REG_LR]
    }

    /// Returns the raw CPSR.
    #[must_use]
    pub fn cpsr(&self) -> u32 {
        self.cpsr
    }

    /// Sets the CPSR.
    pub fn set_cpsr(&mut self, value: u32) {
        self.cpsr = value;
    }

    /// Returns the raw FPSCR.
    #[must_use]
    pub fn fpscr(&self) -> u32 {
        self.fpscr
    }

    /// Sets the FPSCR.
    pub fn set_fpscr(&mut self, value: u32) {
        self.fpscr = value;
    }

    /// Returns the raw FPEXC.
    #[must_use]
    pub fn fpexc(&self) -> u32 {
        self.fpexc
    }

    /// Sets the FPEXC.
    pub fn set_fpexc(&mut self, value: u32) {
        self.fpexc = value;
    }
}

/// The CPU execution engine as seen by the scheduler.
///
/// Implementations wrap an interpreter or JIT. The kernel drives it from the
/// single host thread that owns the [`KernelSystem`](crate::kernel::KernelSystem).
pub trait CpuCore {
    /// Creates a blank register snapshot for a new thread.
    fn new_context(&self) -> ThreadContext {
        ThreadContext::default()
    }

    /// Copies the live registers into `context`.
    fn save_context(&mut self, context: &mut ThreadContext);

    /// Replaces the live registers with `context`.
    fn load_context(&mut self, context: &ThreadContext);

    /// Writes a coprocessor 15 register.
    fn set_cp15_register(&mut self, register: Cp15Register, value: u32);

    /// Executes one slice of guest code on the loaded context.
    fn run(&mut self);

    /// Asks the engine to leave its execution loop at the next opportunity so
    /// the host can call [`reschedule`](crate::kernel::KernelSystem::reschedule).
    fn prepare_reschedule(&mut self) {}
}
