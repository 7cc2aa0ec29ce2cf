use std::fmt;
use thiserror::Error;

/// The kind of guest access that raised an [`AccessFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => f.write_str("read"),
            AccessKind::Write => f.write_str("write"),
            AccessKind::Fetch => f.write_str("fetch"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("Memory overlap at {start:#x}-{end:#x}")]
    Overlap { start: u64, end: u64 },

    #[error("Invalid region size {size:#x} at {address:#x}")]
    InvalidSize { address: u64, size: usize },

    #[error("No mapped region for handle at {0:#x}")]
    UnknownRegion(u64),
}

/// A guest access that could not be satisfied by a single mapped region.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessFault {
    #[error("Memory not mapped for {kind} of {size} bytes at address: {address:#x}")]
    Unmapped {
        address: u64,
        size: usize,
        kind: AccessKind,
    },

    #[error("Permission denied for {kind} of {size} bytes at address: {address:#x}")]
    ProtectionViolation {
        address: u64,
        size: usize,
        kind: AccessKind,
    },
}

impl AccessFault {
    pub fn address(&self) -> u64 {
        match self {
            AccessFault::Unmapped { address, .. }
            | AccessFault::ProtectionViolation { address, .. } => *address,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFault {
    #[error("Unsupported instruction {opcode} at address: {address:#x}")]
    Unsupported { address: u64, opcode: String },

    #[error("Truncated instruction at address: {address:#x}")]
    Truncated { address: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid register: {0}")]
pub struct RegisterFault(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmulatorError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Access(#[from] AccessFault),

    #[error(transparent)]
    Decode(#[from] DecodeFault),

    #[error(transparent)]
    Register(#[from] RegisterFault),

    #[error("Hook error: {0}")]
    HookError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
