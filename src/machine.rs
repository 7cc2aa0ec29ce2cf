use crate::cpu::{CpuState, Register};
use crate::error::Result;
use crate::memory::Memory;

/// Per-session execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmuStats {
    pub instructions: u64,
    pub mem_reads: u64,
    pub mem_writes: u64,
}

/// Guest state reachable from hooks: registers, memory, counters and the
/// stop request flag.
#[derive(Debug, Default)]
pub struct Machine {
    pub cpu: CpuState,
    pub memory: Memory,
    pub(crate) stats: EmuStats,
    pub(crate) stop_requested: bool,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            cpu: CpuState::new(),
            memory: Memory::new(),
            stats: EmuStats::default(),
            stop_requested: false,
        }
    }

    pub fn reg_read(&self, reg: Register) -> u64 {
        self.cpu.read_reg(reg)
    }

    pub fn reg_write(&mut self, reg: Register, value: u64) {
        self.cpu.write_reg(reg, value)
    }

    /// Host-side read. Not counted and not hooked.
    pub fn mem_read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        Ok(self.memory.read(address, buf)?)
    }

    /// Host-side write. Not counted and not hooked.
    pub fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.memory.write(address, data)?)
    }

    /// Request that the current run stop. The instruction in flight is not
    /// executed when this is called from a code hook.
    pub fn emu_stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn stats(&self) -> EmuStats {
        self.stats
    }
}
