mod instructions;

use crate::cpu::{CpuState, Flags, Register};
use crate::decoder::{Decoder, Instruction, Opcode, Operand, OperandSize, MAX_INSTRUCTION_LEN};
use crate::error::{EmulatorError, Result};
use crate::hooks::{HookCallback, HookId, HookManager, HookType, MemAccess, MemAccessKind};
use crate::machine::{EmuStats, Machine};
use crate::memory::{MemoryRegion, Permission, RegionHandle};
use std::ops::Range;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// RIP reached the end address.
    Normal,
    /// `emu_stop` was called.
    Requested,
    /// A HLT instruction executed.
    Halted,
    Fault(EmulatorError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmuStatus {
    Idle,
    Running,
    Stopped(StopReason),
}

/// Result of a single step that did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Halted,
    /// A hook requested a stop. From a code hook the instruction was not
    /// executed; from a memory hook it completed.
    Stopped,
}

/// An emulation session: guest state, registered hooks and run status.
pub struct Engine {
    machine: Machine,
    hooks: HookManager,
    decoder: Decoder,
    status: EmuStatus,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            machine: Machine::new(),
            hooks: HookManager::new(),
            decoder: Decoder::new(),
            status: EmuStatus::Idle,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn mem_map(&mut self, address: u64, size: usize, perms: Permission) -> Result<RegionHandle> {
        let handle = self.machine.memory.map(address, size, perms)?;
        debug!(address = format_args!("{address:#x}"), size, ?perms, "mapped region");
        Ok(handle)
    }

    pub fn mem_unmap(&mut self, handle: RegionHandle) -> Result<()> {
        self.machine.memory.unmap(handle)?;
        debug!(address = format_args!("{:#x}", handle.base()), "unmapped region");
        Ok(())
    }

    pub fn mem_protect(&mut self, handle: RegionHandle, perms: Permission) -> Result<()> {
        self.machine.memory.protect(handle, perms)?;
        debug!(address = format_args!("{:#x}", handle.base()), ?perms, "changed region permissions");
        Ok(())
    }

    pub fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.machine.mem_write(address, data)
    }

    /// Place bytes into any mapped region regardless of its permissions.
    pub fn mem_load(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.machine.memory.load(address, data)?)
    }

    pub fn mem_read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.machine.mem_read(address, buf)
    }

    pub fn mem_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.machine.memory.regions()
    }

    pub fn reg_read(&self, reg: Register) -> u64 {
        self.machine.reg_read(reg)
    }

    pub fn reg_write(&mut self, reg: Register, value: u64) {
        self.machine.reg_write(reg, value)
    }

    pub fn context_save(&self) -> CpuState {
        self.machine.cpu.clone()
    }

    pub fn context_restore(&mut self, state: &CpuState) {
        self.machine.cpu = state.clone();
    }

    pub fn add_hook(
        &mut self,
        hook_type: HookType,
        range: Option<Range<u64>>,
        callback: HookCallback,
    ) -> Result<HookId> {
        self.hooks.add_hook(hook_type, range, callback)
    }

    pub fn add_code_hook<F>(&mut self, range: Option<Range<u64>>, callback: F) -> Result<HookId>
    where
        F: FnMut(&mut Machine, u64, usize) -> Result<()> + 'static,
    {
        self.add_hook(HookType::Code, range, HookCallback::code(callback))
    }

    pub fn add_mem_hook<F>(
        &mut self,
        hook_type: HookType,
        range: Option<Range<u64>>,
        callback: F,
    ) -> Result<HookId>
    where
        F: FnMut(&mut Machine, MemAccess) -> Result<()> + 'static,
    {
        self.add_hook(hook_type, range, HookCallback::mem(callback))
    }

    pub fn remove_hook(&mut self, id: HookId) -> bool {
        self.hooks.remove_hook(id)
    }

    pub fn set_hook_enabled(&mut self, id: HookId, enabled: bool) -> bool {
        self.hooks.set_enabled(id, enabled)
    }

    pub fn clear_hooks(&mut self) {
        self.hooks.clear()
    }

    pub fn status(&self) -> &EmuStatus {
        &self.status
    }

    pub fn stats(&self) -> EmuStats {
        self.machine.stats
    }

    pub fn emu_stop(&mut self) {
        self.machine.emu_stop()
    }

    /// Execute one instruction at RIP. Counters keep accumulating.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.machine.stop_requested = false;
        let outcome = ExecutionContext {
            machine: &mut self.machine,
            hooks: &mut self.hooks,
        }
        .step(&self.decoder)?;

        // A memory hook may have asked to stop while the instruction ran
        if outcome == StepOutcome::Continue && self.machine.stop_requested {
            return Ok(StepOutcome::Stopped);
        }
        Ok(outcome)
    }

    /// Run from `begin` until RIP equals `until`, a HLT, a stop request or a
    /// fault. Registers and memory persist across runs; counters do not.
    pub fn emu_start(&mut self, begin: u64, until: u64) -> StopReason {
        self.machine.cpu.rip = begin;
        self.machine.stop_requested = false;
        self.machine.stats = EmuStats::default();
        self.status = EmuStatus::Running;

        info!(
            begin = format_args!("{begin:#x}"),
            until = format_args!("{until:#x}"),
            "emulation started"
        );

        let reason = self.run_until(until);

        let stats = self.machine.stats;
        match &reason {
            StopReason::Fault(err) => warn!(
                rip = format_args!("{:#x}", self.machine.cpu.rip),
                instructions = stats.instructions,
                "emulation faulted: {err}"
            ),
            _ => info!(
                ?reason,
                instructions = stats.instructions,
                mem_reads = stats.mem_reads,
                mem_writes = stats.mem_writes,
                "emulation stopped"
            ),
        }

        self.status = EmuStatus::Stopped(reason.clone());
        reason
    }

    fn run_until(&mut self, until: u64) -> StopReason {
        let mut ctx = ExecutionContext {
            machine: &mut self.machine,
            hooks: &mut self.hooks,
        };

        loop {
            if ctx.machine.cpu.rip == until {
                return StopReason::Normal;
            }

            match ctx.step(&self.decoder) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halted) => return StopReason::Halted,
                Ok(StepOutcome::Stopped) => return StopReason::Requested,
                Err(err) => return StopReason::Fault(err),
            }

            if ctx.machine.stop_requested {
                return StopReason::Requested;
            }
        }
    }
}

pub(crate) struct ExecutionContext<'a> {
    machine: &'a mut Machine,
    hooks: &'a mut HookManager,
}

impl ExecutionContext<'_> {
    fn step(&mut self, decoder: &Decoder) -> Result<StepOutcome> {
        let rip = self.machine.cpu.rip;

        let bytes = self.machine.memory.fetch(rip, MAX_INSTRUCTION_LEN)?;
        let inst = decoder.decode(bytes, rip)?;

        self.hooks.run_code_hooks(self.machine, rip, inst.size)?;
        self.machine.stats.instructions += 1;

        if self.machine.stop_requested {
            return Ok(StepOutcome::Stopped);
        }

        // A code hook redirected execution; resume at the new RIP
        if self.machine.cpu.rip != rip {
            return Ok(StepOutcome::Continue);
        }

        // Branches overwrite RIP; a fault puts it back on the instruction.
        self.machine.cpu.rip = inst.next_address();
        let outcome = self.execute_instruction(&inst);
        if outcome.is_err() {
            self.machine.cpu.rip = rip;
        }
        outcome
    }

    fn execute_instruction(&mut self, inst: &Instruction) -> Result<StepOutcome> {
        let zf = self.machine.cpu.rflags.contains(Flags::ZF);
        match inst.opcode {
            Opcode::ADD => self.execute_add(inst)?,
            Opcode::SUB => self.execute_sub(inst)?,
            Opcode::CMP => self.execute_cmp(inst)?,
            Opcode::INC => self.execute_inc(inst)?,
            Opcode::DEC => self.execute_dec(inst)?,
            Opcode::MOV => self.execute_mov(inst)?,
            Opcode::PUSH => self.execute_push(inst)?,
            Opcode::POP => self.execute_pop(inst)?,
            Opcode::JMP => self.execute_jmp(inst)?,
            Opcode::JZ => self.execute_jcc(inst, zf)?,
            Opcode::JNZ => self.execute_jcc(inst, !zf)?,
            Opcode::NOP => {}
            Opcode::HLT => return Ok(StepOutcome::Halted),
        }
        Ok(StepOutcome::Continue)
    }

    fn operand(&self, inst: &Instruction, idx: usize) -> Result<Operand> {
        inst.operand(idx).ok_or_else(|| {
            EmulatorError::InvalidArgument(format!(
                "{:?} at {:#x} has no operand {idx}",
                inst.opcode, inst.address
            ))
        })
    }

    fn effective_address(&self, inst: &Instruction, operand: Operand) -> Result<u64> {
        match operand {
            Operand::Memory {
                base,
                index,
                scale,
                displacement,
            } => {
                let mut addr = displacement as u64;
                match base {
                    Some(Register::RIP) => addr = addr.wrapping_add(inst.next_address()),
                    Some(reg) => addr = addr.wrapping_add(self.machine.cpu.read_reg(reg)),
                    None => {}
                }
                if let Some(index) = index {
                    let scaled = self.machine.cpu.read_reg(index).wrapping_mul(scale as u64);
                    addr = addr.wrapping_add(scaled);
                }
                Ok(addr)
            }
            other => Err(EmulatorError::InvalidArgument(format!(
                "{other:?} is not a memory operand"
            ))),
        }
    }

    /// Operand value truncated to `size`. Immediates are already sign-extended.
    fn read_operand(&mut self, inst: &Instruction, idx: usize, size: OperandSize) -> Result<u64> {
        match self.operand(inst, idx)? {
            Operand::Register(reg) => Ok(self.machine.cpu.read_reg(reg) & size.mask()),
            Operand::Immediate(imm) => Ok(imm as u64 & size.mask()),
            Operand::Relative(rel) => Ok(inst.next_address().wrapping_add(rel as u64)),
            mem @ Operand::Memory { .. } => {
                let addr = self.effective_address(inst, mem)?;
                self.read_memory_sized(addr, size.bytes())
            }
        }
    }

    /// 32-bit register writes zero the upper half.
    fn write_operand(
        &mut self,
        inst: &Instruction,
        idx: usize,
        value: u64,
        size: OperandSize,
    ) -> Result<()> {
        match self.operand(inst, idx)? {
            Operand::Register(reg) => {
                self.machine.cpu.write_reg(reg, value & size.mask());
                Ok(())
            }
            mem @ Operand::Memory { .. } => {
                let addr = self.effective_address(inst, mem)?;
                self.write_memory_sized(addr, value & size.mask(), size.bytes())
            }
            other => Err(EmulatorError::InvalidArgument(format!(
                "cannot write to {other:?} at {:#x}",
                inst.address
            ))),
        }
    }

    fn read_memory_sized(&mut self, addr: u64, size: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.machine.memory.read(addr, &mut buf[..size])?;
        let value = u64::from_le_bytes(buf);

        self.machine.stats.mem_reads += 1;
        self.hooks.run_mem_hooks(
            self.machine,
            MemAccess {
                kind: MemAccessKind::Read,
                address: addr,
                size,
                value,
            },
        )?;
        Ok(value)
    }

    /// A failing write hook puts the overwritten bytes back.
    fn write_memory_sized(&mut self, addr: u64, value: u64, size: usize) -> Result<()> {
        let bytes = value.to_le_bytes();
        let mut previous = [0u8; 8];
        self.machine
            .memory
            .exchange(addr, &bytes[..size], &mut previous[..size])?;

        self.machine.stats.mem_writes += 1;
        let hooked = self.hooks.run_mem_hooks(
            self.machine,
            MemAccess {
                kind: MemAccessKind::Write,
                address: addr,
                size,
                value,
            },
        );
        if hooked.is_err() {
            // Fails only if the hook unmapped the region itself
            let _ = self.machine.memory.load(addr, &previous[..size]);
        }
        hooked
    }

    fn update_flags_arithmetic(
        &mut self,
        dst: u64,
        src: u64,
        result: u64,
        is_sub: bool,
        size: OperandSize,
    ) {
        let mask = size.mask();
        let sign = size.sign_bit();
        let (dst, src, result) = (dst & mask, src & mask, result & mask);

        let carry = if is_sub { dst < src } else { result < dst };
        let overflow = if is_sub {
            (dst ^ src) & (dst ^ result) & sign != 0
        } else {
            (dst ^ result) & (src ^ result) & sign != 0
        };

        let flags = &mut self.machine.cpu.rflags;
        flags.set(Flags::CF, carry);
        flags.set(Flags::OF, overflow);
        flags.set(Flags::ZF, result == 0);
        flags.set(Flags::SF, result & sign != 0);
        flags.set(Flags::AF, (dst ^ src ^ result) & 0x10 != 0);
        // Parity of the low byte only
        flags.set(Flags::PF, (result as u8).count_ones() % 2 == 0);
    }
}
