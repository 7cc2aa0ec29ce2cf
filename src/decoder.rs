use crate::cpu::Register;
use crate::error::DecodeFault;

/// Longest legal x86-64 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

type Result<T> = std::result::Result<T, DecodeFault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    DWord,
    QWord,
}

impl OperandSize {
    pub fn bytes(&self) -> usize {
        match self {
            OperandSize::DWord => 4,
            OperandSize::QWord => 8,
        }
    }

    pub fn mask(&self) -> u64 {
        match self {
            OperandSize::DWord => 0xFFFF_FFFF,
            OperandSize::QWord => u64::MAX,
        }
    }

    pub fn sign_bit(&self) -> u64 {
        match self {
            OperandSize::DWord => 1 << 31,
            OperandSize::QWord => 1 << 63,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    /// `[base + index * scale + displacement]`. A base of [`Register::RIP`]
    /// is relative to the end of the instruction.
    Memory {
        base: Option<Register>,
        index: Option<Register>,
        scale: u8,
        displacement: i64,
    },
    Immediate(i64),
    Relative(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ADD,
    SUB,
    CMP,
    MOV,
    INC,
    DEC,
    PUSH,
    POP,
    JMP,
    JZ,
    JNZ,
    NOP,
    HLT,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub opcode: Opcode,
    pub size: usize,
    pub operand_size: OperandSize,
    operands: [Operand; 2],
    operand_count: u8,
}

impl Instruction {
    pub fn operands(&self) -> &[Operand] {
        &self.operands[..self.operand_count as usize]
    }

    pub fn operand(&self, idx: usize) -> Option<Operand> {
        self.operands().get(idx).copied()
    }

    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.size as u64)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
}

impl Rex {
    fn from_byte(byte: u8) -> Self {
        Self {
            w: byte & 0x08 != 0,
            r: byte & 0x04 != 0,
            x: byte & 0x02 != 0,
            b: byte & 0x01 != 0,
        }
    }
}

/// Bounds-checked cursor over the instruction bytes. Running out of bytes is
/// a truncated instruction, never a panic.
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    address: u64,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8> {
        self.bytes
            .get(self.offset)
            .copied()
            .ok_or(DecodeFault::Truncated {
                address: self.address,
            })
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.offset += 1;
        Ok(byte)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.offset + N;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(DecodeFault::Truncated {
                address: self.address,
            })?;
        self.offset = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn i8(&mut self) -> Result<i64> {
        Ok(self.u8()? as i8 as i64)
    }

    fn i32(&mut self) -> Result<i64> {
        Ok(i32::from_le_bytes(self.take()?) as i64)
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take()?))
    }
}

struct ModRm {
    /// Raw reg field, used as an opcode extension by group opcodes.
    digit: u8,
    reg: Register,
    rm: Operand,
}

/// Decoder for the 64-bit mode integer subset the engine executes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one instruction from `bytes`, which start at guest `address`.
    /// Only the bytes the instruction occupies are consumed.
    pub fn decode(&self, bytes: &[u8], address: u64) -> Result<Instruction> {
        let mut cur = Cursor {
            bytes,
            offset: 0,
            address,
        };

        let mut rex = Rex::default();
        while let byte @ 0x40..=0x4F = cur.peek()? {
            rex = Rex::from_byte(byte);
            cur.offset += 1;
        }

        let size = if rex.w {
            OperandSize::QWord
        } else {
            OperandSize::DWord
        };

        let opcode_byte = cur.u8()?;
        let (opcode, operand_size, operands) = match opcode_byte {
            0x01 | 0x29 | 0x39 => {
                let modrm = self.decode_modrm(&mut cur, rex)?;
                let opcode = match opcode_byte {
                    0x01 => Opcode::ADD,
                    0x29 => Opcode::SUB,
                    _ => Opcode::CMP,
                };
                (opcode, size, two(modrm.rm, Operand::Register(modrm.reg)))
            }
            0x03 | 0x2B | 0x3B => {
                let modrm = self.decode_modrm(&mut cur, rex)?;
                let opcode = match opcode_byte {
                    0x03 => Opcode::ADD,
                    0x2B => Opcode::SUB,
                    _ => Opcode::CMP,
                };
                (opcode, size, two(Operand::Register(modrm.reg), modrm.rm))
            }
            0x50..=0x57 => {
                let reg = Register::gpr(opcode_byte - 0x50 + if rex.b { 8 } else { 0 });
                (Opcode::PUSH, OperandSize::QWord, one(Operand::Register(reg)))
            }
            0x58..=0x5F => {
                let reg = Register::gpr(opcode_byte - 0x58 + if rex.b { 8 } else { 0 });
                (Opcode::POP, OperandSize::QWord, one(Operand::Register(reg)))
            }
            0x68 => {
                let imm = cur.i32()?;
                (Opcode::PUSH, OperandSize::QWord, one(Operand::Immediate(imm)))
            }
            0x6A => {
                let imm = cur.i8()?;
                (Opcode::PUSH, OperandSize::QWord, one(Operand::Immediate(imm)))
            }
            0x74 => (Opcode::JZ, size, one(Operand::Relative(cur.i8()?))),
            0x75 => (Opcode::JNZ, size, one(Operand::Relative(cur.i8()?))),
            0x81 | 0x83 => {
                let modrm = self.decode_modrm(&mut cur, rex)?;
                let opcode = match modrm.digit {
                    0 => Opcode::ADD,
                    5 => Opcode::SUB,
                    7 => Opcode::CMP,
                    digit => return Err(unsupported(address, format!("{opcode_byte:02X} /{digit}"))),
                };
                let imm = if opcode_byte == 0x81 {
                    cur.i32()?
                } else {
                    cur.i8()?
                };
                (opcode, size, two(modrm.rm, Operand::Immediate(imm)))
            }
            0x89 => {
                // MOV r/m, r
                let modrm = self.decode_modrm(&mut cur, rex)?;
                (Opcode::MOV, size, two(modrm.rm, Operand::Register(modrm.reg)))
            }
            0x8B => {
                // MOV r, r/m
                let modrm = self.decode_modrm(&mut cur, rex)?;
                (Opcode::MOV, size, two(Operand::Register(modrm.reg), modrm.rm))
            }
            // With REX.B this is XCHG r8, rax
            0x90 if !rex.b => (Opcode::NOP, size, no_operands()),
            0xB8..=0xBF => {
                let reg = Register::gpr(opcode_byte - 0xB8 + if rex.b { 8 } else { 0 });
                let imm = match size {
                    OperandSize::QWord => cur.i64()?,
                    OperandSize::DWord => cur.i32()? as u32 as i64,
                };
                (Opcode::MOV, size, two(Operand::Register(reg), Operand::Immediate(imm)))
            }
            0xC7 => {
                let modrm = self.decode_modrm(&mut cur, rex)?;
                if modrm.digit != 0 {
                    return Err(unsupported(address, format!("C7 /{}", modrm.digit)));
                }
                // imm32 even with REX.W
                let imm = cur.i32()?;
                (Opcode::MOV, size, two(modrm.rm, Operand::Immediate(imm)))
            }
            0xE9 => (Opcode::JMP, size, one(Operand::Relative(cur.i32()?))),
            0xEB => (Opcode::JMP, size, one(Operand::Relative(cur.i8()?))),
            0xF4 => (Opcode::HLT, size, no_operands()),
            0xFF => {
                let modrm = self.decode_modrm(&mut cur, rex)?;
                match modrm.digit {
                    0 => (Opcode::INC, size, one(modrm.rm)),
                    1 => (Opcode::DEC, size, one(modrm.rm)),
                    6 => (Opcode::PUSH, OperandSize::QWord, one(modrm.rm)),
                    digit => return Err(unsupported(address, format!("FF /{digit}"))),
                }
            }
            0x0F => {
                let secondary = cur.u8()?;
                match secondary {
                    0x84 => (Opcode::JZ, size, one(Operand::Relative(cur.i32()?))),
                    0x85 => (Opcode::JNZ, size, one(Operand::Relative(cur.i32()?))),
                    _ => return Err(unsupported(address, format!("0F {secondary:02X}"))),
                }
            }
            _ => return Err(unsupported(address, format!("{opcode_byte:02X}"))),
        };

        let Operands(operands, operand_count) = operands;
        Ok(Instruction {
            address,
            opcode,
            size: cur.offset,
            operand_size,
            operands,
            operand_count,
        })
    }

    fn decode_modrm(&self, cur: &mut Cursor<'_>, rex: Rex) -> Result<ModRm> {
        let modrm = cur.u8()?;
        let mod_bits = modrm >> 6;
        let digit = (modrm >> 3) & 0x07;
        let rm_bits = modrm & 0x07;

        let reg = Register::gpr(digit + if rex.r { 8 } else { 0 });

        if mod_bits == 0b11 {
            let rm = Register::gpr(rm_bits + if rex.b { 8 } else { 0 });
            return Ok(ModRm {
                digit,
                reg,
                rm: Operand::Register(rm),
            });
        }

        let (base, index, scale) = match rm_bits {
            0b100 => {
                let sib = cur.u8()?;
                let scale = 1 << (sib >> 6);
                let index_bits = ((sib >> 3) & 0x07) + if rex.x { 8 } else { 0 };
                let base_bits = sib & 0x07;

                // Index 100 without REX.X means no index
                let index = (index_bits != 0b100).then(|| Register::gpr(index_bits));
                let base = if base_bits == 0b101 && mod_bits == 0 {
                    None
                } else {
                    Some(Register::gpr(base_bits + if rex.b { 8 } else { 0 }))
                };
                (base, index, scale)
            }
            0b101 if mod_bits == 0 => (Some(Register::RIP), None, 1),
            _ => (Some(Register::gpr(rm_bits + if rex.b { 8 } else { 0 })), None, 1),
        };

        let displacement = match mod_bits {
            0b01 => cur.i8()?,
            0b10 => cur.i32()?,
            _ if base.is_none() || base == Some(Register::RIP) => cur.i32()?,
            _ => 0,
        };

        Ok(ModRm {
            digit,
            reg,
            rm: Operand::Memory {
                base,
                index,
                scale,
                displacement,
            },
        })
    }
}

struct Operands([Operand; 2], u8);

const UNUSED: Operand = Operand::Immediate(0);

fn no_operands() -> Operands {
    Operands([UNUSED; 2], 0)
}

fn one(op: Operand) -> Operands {
    Operands([op, UNUSED], 1)
}

fn two(dst: Operand, src: Operand) -> Operands {
    Operands([dst, src], 2)
}

fn unsupported(address: u64, opcode: String) -> DecodeFault {
    DecodeFault::Unsupported { address, opcode }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Instruction {
        Decoder::new().decode(bytes, 0x1000).unwrap()
    }

    #[test]
    fn decodes_fib_loop_body() {
        // pop rax
        let inst = decode(&[0x58]);
        assert_eq!(inst.opcode, Opcode::POP);
        assert_eq!(inst.operands(), &[Operand::Register(Register::RAX)]);

        // mov rdx, rax
        let inst = decode(&[0x48, 0x89, 0xC2]);
        assert_eq!(inst.opcode, Opcode::MOV);
        assert_eq!(inst.size, 3);
        assert_eq!(inst.operand_size, OperandSize::QWord);
        assert_eq!(
            inst.operands(),
            &[
                Operand::Register(Register::RDX),
                Operand::Register(Register::RAX)
            ]
        );

        // inc rcx
        let inst = decode(&[0x48, 0xFF, 0xC1]);
        assert_eq!(inst.opcode, Opcode::INC);
        assert_eq!(inst.operands(), &[Operand::Register(Register::RCX)]);

        // cmp rcx, 0xffffff
        let inst = decode(&[0x48, 0x81, 0xF9, 0xFF, 0xFF, 0xFF, 0x00]);
        assert_eq!(inst.opcode, Opcode::CMP);
        assert_eq!(inst.size, 7);
        assert_eq!(inst.operand(1), Some(Operand::Immediate(0xFFFFFF)));

        // jne -27
        let inst = decode(&[0x75, 0xE5]);
        assert_eq!(inst.opcode, Opcode::JNZ);
        assert_eq!(inst.operands(), &[Operand::Relative(-27)]);
        assert_eq!(inst.next_address(), 0x1002);
    }

    #[test]
    fn decodes_memory_operands() {
        // mov rax, [rip + 0x10]
        let inst = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(
            inst.operand(1),
            Some(Operand::Memory {
                base: Some(Register::RIP),
                index: None,
                scale: 1,
                displacement: 0x10
            })
        );

        // mov [rsp + 8], rbx
        let inst = decode(&[0x48, 0x89, 0x5C, 0x24, 0x08]);
        assert_eq!(inst.size, 5);
        assert_eq!(
            inst.operand(0),
            Some(Operand::Memory {
                base: Some(Register::RSP),
                index: None,
                scale: 1,
                displacement: 8
            })
        );

        // mov [r13 + r12*4 - 4], eax
        let inst = decode(&[0x43, 0x89, 0x44, 0xA5, 0xFC]);
        assert_eq!(inst.operand_size, OperandSize::DWord);
        assert_eq!(
            inst.operand(0),
            Some(Operand::Memory {
                base: Some(Register::R13),
                index: Some(Register::R12),
                scale: 4,
                displacement: -4
            })
        );

        // mov eax, [0x2000] (SIB, no base)
        let inst = decode(&[0x8B, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00]);
        assert_eq!(inst.size, 7);
        assert_eq!(
            inst.operand(1),
            Some(Operand::Memory {
                base: None,
                index: None,
                scale: 1,
                displacement: 0x2000
            })
        );
    }

    #[test]
    fn immediates_are_sized_by_encoding() {
        // mov eax, 0xffffffff zero-extends
        let inst = decode(&[0xB8, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(inst.operand(1), Some(Operand::Immediate(0xFFFF_FFFF)));

        // mov r9, imm64
        let inst = decode(&[0x49, 0xB9, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(inst.size, 10);
        assert_eq!(inst.operand(0), Some(Operand::Register(Register::R9)));
        assert_eq!(
            inst.operand(1),
            Some(Operand::Immediate(0x0807060504030201))
        );

        // push -1
        let inst = decode(&[0x6A, 0xFF]);
        assert_eq!(inst.opcode, Opcode::PUSH);
        assert_eq!(inst.operand_size, OperandSize::QWord);
        assert_eq!(inst.operand(0), Some(Operand::Immediate(-1)));
    }

    #[test]
    fn only_consumes_instruction_bytes() {
        let inst = decode(&[0x90, 0xF4, 0xF4]);
        assert_eq!(inst.opcode, Opcode::NOP);
        assert_eq!(inst.size, 1);
        assert!(inst.operands().is_empty());
    }

    #[test]
    fn reports_truncated_and_unsupported_bytes() {
        let decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&[0x48, 0x81, 0xF9, 0xFF], 0x2000),
            Err(DecodeFault::Truncated { address: 0x2000 })
        );
        assert_eq!(
            decoder.decode(&[], 0x2000),
            Err(DecodeFault::Truncated { address: 0x2000 })
        );
        assert_eq!(
            decoder.decode(&[0x0F, 0x05], 0x2000),
            Err(DecodeFault::Unsupported {
                address: 0x2000,
                opcode: "0F 05".to_string()
            })
        );
        assert_eq!(
            decoder.decode(&[0xFF, 0xD0], 0x2000),
            Err(DecodeFault::Unsupported {
                address: 0x2000,
                opcode: "FF /2".to_string()
            })
        );
        assert!(matches!(
            decoder.decode(&[0x66, 0x90], 0x2000),
            Err(DecodeFault::Unsupported { .. })
        ));
        assert!(matches!(
            decoder.decode(&[0x41, 0x90], 0x2000),
            Err(DecodeFault::Unsupported { .. })
        ));
    }
}
