use crate::cpu::Register;
use crate::decoder::{Instruction, OperandSize};
use crate::engine::ExecutionContext;
use crate::error::Result;

impl ExecutionContext<'_> {
    pub(crate) fn execute_mov(&mut self, inst: &Instruction) -> Result<()> {
        let size = inst.operand_size;
        let value = self.read_operand(inst, 1, size)?;
        self.write_operand(inst, 0, value, size)
    }

    pub(crate) fn execute_push(&mut self, inst: &Instruction) -> Result<()> {
        let value = self.read_operand(inst, 0, OperandSize::QWord)?;
        let new_rsp = self.machine.cpu.read_reg(Register::RSP).wrapping_sub(8);

        // Store before moving RSP so a faulting push changes nothing
        self.write_memory_sized(new_rsp, value, 8)?;
        self.machine.cpu.write_reg(Register::RSP, new_rsp);
        Ok(())
    }

    pub(crate) fn execute_pop(&mut self, inst: &Instruction) -> Result<()> {
        let rsp = self.machine.cpu.read_reg(Register::RSP);
        let value = self.read_memory_sized(rsp, 8)?;

        // pop rsp keeps the loaded value, so RSP moves first
        self.machine.cpu.write_reg(Register::RSP, rsp.wrapping_add(8));
        self.write_operand(inst, 0, value, OperandSize::QWord)
    }
}
