use crate::cpu::Flags;
use crate::decoder::Instruction;
use crate::engine::ExecutionContext;
use crate::error::Result;

impl ExecutionContext<'_> {
    pub(crate) fn execute_add(&mut self, inst: &Instruction) -> Result<()> {
        let size = inst.operand_size;
        let dst_value = self.read_operand(inst, 0, size)?;
        let src_value = self.read_operand(inst, 1, size)?;
        let result = dst_value.wrapping_add(src_value);

        // Destination first so a faulting store leaves the flags alone
        self.write_operand(inst, 0, result, size)?;
        self.update_flags_arithmetic(dst_value, src_value, result, false, size);
        Ok(())
    }

    pub(crate) fn execute_sub(&mut self, inst: &Instruction) -> Result<()> {
        let size = inst.operand_size;
        let dst_value = self.read_operand(inst, 0, size)?;
        let src_value = self.read_operand(inst, 1, size)?;
        let result = dst_value.wrapping_sub(src_value);

        self.write_operand(inst, 0, result, size)?;
        self.update_flags_arithmetic(dst_value, src_value, result, true, size);
        Ok(())
    }

    pub(crate) fn execute_cmp(&mut self, inst: &Instruction) -> Result<()> {
        let size = inst.operand_size;
        let dst_value = self.read_operand(inst, 0, size)?;
        let src_value = self.read_operand(inst, 1, size)?;
        let result = dst_value.wrapping_sub(src_value);

        self.update_flags_arithmetic(dst_value, src_value, result, true, size);
        Ok(())
    }

    pub(crate) fn execute_inc(&mut self, inst: &Instruction) -> Result<()> {
        let size = inst.operand_size;
        let dst_value = self.read_operand(inst, 0, size)?;
        let result = dst_value.wrapping_add(1);

        self.write_operand(inst, 0, result, size)?;

        // INC doesn't affect CF
        let cf = self.machine.cpu.rflags.contains(Flags::CF);
        self.update_flags_arithmetic(dst_value, 1, result, false, size);
        self.machine.cpu.rflags.set(Flags::CF, cf);
        Ok(())
    }

    pub(crate) fn execute_dec(&mut self, inst: &Instruction) -> Result<()> {
        let size = inst.operand_size;
        let dst_value = self.read_operand(inst, 0, size)?;
        let result = dst_value.wrapping_sub(1);

        self.write_operand(inst, 0, result, size)?;

        let cf = self.machine.cpu.rflags.contains(Flags::CF);
        self.update_flags_arithmetic(dst_value, 1, result, true, size);
        self.machine.cpu.rflags.set(Flags::CF, cf);
        Ok(())
    }
}
