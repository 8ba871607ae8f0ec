//! Bytecode errors

use thiserror::Error;

/// Errors produced while loading or validating bytecode
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// Invalid magic bytes
    #[error("invalid bytecode magic")]
    InvalidMagic,

    /// Unsupported version
    #[error("unsupported bytecode version: {0}")]
    UnsupportedVersion(u32),

    /// Truncated input
    #[error("unexpected end of bytecode")]
    UnexpectedEnd,

    /// Unknown opcode byte encountered during validation
    #[error("unknown opcode 0x{0:02x} at offset {1}")]
    UnknownOpcode(u8, usize),

    /// Index out of range (function, string, builtin, ...)
    #[error("{kind} index {index} out of range")]
    IndexOutOfRange {
        /// What kind of index was out of range
        kind: &'static str,
        /// The offending index
        index: u32,
    },

    /// Malformed literal buffer
    #[error("malformed literal buffer at offset {0}")]
    MalformedLiteral(usize),

    /// I/O error while reading or writing a module
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
