pub mod cpu;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod machine;
pub mod memory;

pub use cpu::{CpuState, Flags, Register};
pub use decoder::{Decoder, Instruction, Opcode, Operand, OperandSize};
pub use engine::{EmuStatus, Engine, StepOutcome, StopReason};
pub use error::{AccessFault, AccessKind, DecodeFault, EmulatorError, MapError, RegisterFault, Result};
pub use hooks::{HookCallback, HookId, HookType, MemAccess, MemAccessKind};
pub use machine::{EmuStats, Machine};
pub use memory::{Memory, MemoryRegion, Permission, RegionHandle};
