use crate::error::RegisterFault;
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

/// Architectural registers visible to the emulator.
///
/// General-purpose registers are listed in hardware encoding order, so the
/// ModRM/opcode register number is the index into [`CpuState::regs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    RIP,
    RFLAGS,
}

impl Register {
    const GPRS: [Register; 16] = [
        Register::RAX,
        Register::RCX,
        Register::RDX,
        Register::RBX,
        Register::RSP,
        Register::RBP,
        Register::RSI,
        Register::RDI,
        Register::R8,
        Register::R9,
        Register::R10,
        Register::R11,
        Register::R12,
        Register::R13,
        Register::R14,
        Register::R15,
    ];

    /// General-purpose register by encoding number (0-15).
    pub fn gpr(num: u8) -> Register {
        Self::GPRS[(num & 0x0F) as usize]
    }

    /// Encoding number for general-purpose registers, `None` for RIP/RFLAGS.
    pub fn gpr_index(&self) -> Option<usize> {
        match self {
            Register::RIP | Register::RFLAGS => None,
            gpr => Some(*gpr as usize),
        }
    }

    pub fn name(&self) -> &'static str {
        use Register::*;
        match self {
            RAX => "rax",
            RCX => "rcx",
            RDX => "rdx",
            RBX => "rbx",
            RSP => "rsp",
            RBP => "rbp",
            RSI => "rsi",
            RDI => "rdi",
            R8 => "r8",
            R9 => "r9",
            R10 => "r10",
            R11 => "r11",
            R12 => "r12",
            R13 => "r13",
            R14 => "r14",
            R15 => "r15",
            RIP => "rip",
            RFLAGS => "rflags",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = RegisterFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::GPRS
            .iter()
            .chain([Register::RIP, Register::RFLAGS].iter())
            .find(|reg| reg.name() == lower)
            .copied()
            .ok_or_else(|| RegisterFault(s.to_string()))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u64 {
        const CF = 1 << 0;     // Carry Flag
        const PF = 1 << 2;     // Parity Flag
        const AF = 1 << 4;     // Auxiliary Carry Flag
        const ZF = 1 << 6;     // Zero Flag
        const SF = 1 << 7;     // Sign Flag
        const TF = 1 << 8;     // Trap Flag
        const IF = 1 << 9;     // Interrupt Enable Flag
        const DF = 1 << 10;    // Direction Flag
        const OF = 1 << 11;    // Overflow Flag
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub regs: [u64; 16],
    pub rip: u64,
    pub rflags: Flags,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            rip: 0,
            rflags: Flags::empty(),
        }
    }

    pub fn read_reg(&self, reg: Register) -> u64 {
        match reg {
            Register::RIP => self.rip,
            Register::RFLAGS => self.rflags.bits(),
            gpr => self.regs[gpr as usize],
        }
    }

    pub fn write_reg(&mut self, reg: Register, value: u64) {
        match reg {
            Register::RIP => self.rip = value,
            Register::RFLAGS => self.rflags = Flags::from_bits_truncate(value),
            gpr => self.regs[gpr as usize] = value,
        }
    }
}

impl fmt::Display for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPU State:")?;
        for row in 0..8 {
            writeln!(
                f,
                "  {:<4}{:#018x}  {:<4}{:#018x}",
                Register::gpr(row as u8).name().to_uppercase() + ":",
                self.regs[row],
                Register::gpr(row as u8 + 8).name().to_uppercase() + ":",
                self.regs[row + 8]
            )?;
        }
        writeln!(f, "  RIP: {:#018x}", self.rip)?;
        writeln!(f, "  RFLAGS: {:#018x} {:?}", self.rflags.bits(), self.rflags)?;
        Ok(())
    }
}
