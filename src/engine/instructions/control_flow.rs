use crate::decoder::{Instruction, OperandSize};
use crate::engine::ExecutionContext;
use crate::error::Result;

impl ExecutionContext<'_> {
    pub(crate) fn execute_jmp(&mut self, inst: &Instruction) -> Result<()> {
        let target = self.read_operand(inst, 0, OperandSize::QWord)?;
        self.machine.cpu.rip = target;
        Ok(())
    }

    pub(crate) fn execute_jcc(&mut self, inst: &Instruction, condition: bool) -> Result<()> {
        if condition {
            self.execute_jmp(inst)?;
        }
        Ok(())
    }
}
