//! Bytecode module container.
//!
//! A module carries everything the runtime needs to execute a compiled
//! program: per-function code and headers, the string table backed by one
//! contiguous UTF-8 storage, precomputed identifier hashes, and the packed
//! literal buffers object/array construction opcodes iterate over.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{BytecodeError, Result};
use crate::opcode::validate_code;
use crate::{BYTECODE_MAGIC, BYTECODE_VERSION};

/// One exception-handler range of a function.
///
/// Ranges are stored sorted so that inner (more deeply nested) ranges come
/// before outer ones; the unwinder takes the first entry covering the
/// throwing ip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    /// First covered bytecode offset (inclusive)
    pub start: u32,
    /// End of the covered range (exclusive)
    pub end: u32,
    /// Handler entry offset; the instruction there is a `Catch`
    pub target: u32,
}

impl ExceptionEntry {
    /// Whether this entry covers the given bytecode offset.
    #[inline]
    pub fn covers(&self, ip: u32) -> bool {
        self.start <= ip && ip < self.end
    }
}

/// Per-function header: the fixed facts the interpreter needs to build a
/// frame before touching the code.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FunctionHeader {
    /// Number of local registers in the frame window
    pub frame_size: u8,
    /// Declared parameter count (callers may pass fewer or more)
    pub param_count: u8,
    /// Strict-mode flag
    pub strict: bool,
    /// Lazy marker: code is absent until the host compiles it on first call
    pub lazy: bool,
    /// Number of environment slots created by `CreateEnvironment`
    pub env_size: u8,
}

/// A compiled function: header, opcode bytes, exception table, and
/// optional bytecode-offset-to-source-offset pairs for error messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Index into the string table, or `u32::MAX` for anonymous
    pub name: u32,
    /// The fixed header
    pub header: FunctionHeader,
    /// Opcode bytes; empty when `header.lazy`
    pub code: Vec<u8>,
    /// Exception-handler table, inner ranges first
    pub exceptions: Vec<ExceptionEntry>,
    /// Optional `(bytecode offset, source offset)` pairs, ascending
    pub debug_offsets: Option<Vec<(u32, u32)>>,
}

impl FunctionDef {
    /// Source offset for a bytecode offset, from the debug table.
    pub fn source_offset(&self, ip: u32) -> Option<u32> {
        let table = self.debug_offsets.as_ref()?;
        match table.binary_search_by_key(&ip, |&(bc, _)| bc) {
            Ok(i) => Some(table[i].1),
            Err(0) => None,
            Err(i) => Some(table[i - 1].1),
        }
    }
}

/// One string table entry: a slice of the shared storage plus the
/// identifier flag that makes the runtime pre-intern it on module load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StringEntry {
    /// Byte offset into [`BytecodeModule::string_storage`]
    pub offset: u32,
    /// Byte length
    pub len: u32,
    /// True when the string is used as a property name somewhere
    pub is_identifier: bool,
}

/// A complete bytecode module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BytecodeModule {
    /// Source URL the module was compiled from, for error messages
    pub source_url: String,
    /// All functions; index 0 is not special, see `global_function`
    pub functions: Vec<FunctionDef>,
    /// Index of the designated global function
    pub global_function: u32,
    /// Contiguous UTF-8 storage for all strings
    pub string_storage: Vec<u8>,
    /// String table entries pointing into the storage
    pub strings: Vec<StringEntry>,
    /// One precomputed hash per identifier-flagged string entry, in table
    /// order, used to accelerate first interning
    pub identifier_hashes: Vec<u32>,
    /// Packed literal values for `NewArrayWithBuffer`
    pub array_buffer: Vec<u8>,
    /// Packed literal keys (string indices) for `NewObjectWithBuffer`
    pub object_key_buffer: Vec<u8>,
    /// Packed literal values for `NewObjectWithBuffer`
    pub object_value_buffer: Vec<u8>,
    /// Compiled regexp bytecode blobs, referenced by index
    pub regexp_table: Vec<Vec<u8>>,
    /// CommonJS module table: (filename string index, function index)
    pub cjs_module_table: Vec<(u32, u32)>,
}

impl BytecodeModule {
    /// Look up the raw bytes of a string table entry.
    pub fn string_bytes(&self, index: u32) -> Option<&[u8]> {
        let entry = self.strings.get(index as usize)?;
        let start = entry.offset as usize;
        let end = start + entry.len as usize;
        self.string_storage.get(start..end)
    }

    /// Validate internal consistency: every function's code decodes, the
    /// global function exists, string entries stay inside the storage.
    pub fn validate(&self) -> Result<()> {
        if self.global_function as usize >= self.functions.len() {
            return Err(BytecodeError::IndexOutOfRange {
                kind: "function",
                index: self.global_function,
            });
        }
        for (i, entry) in self.strings.iter().enumerate() {
            let end = entry.offset as u64 + entry.len as u64;
            if end > self.string_storage.len() as u64 {
                return Err(BytecodeError::IndexOutOfRange {
                    kind: "string",
                    index: i as u32,
                });
            }
        }
        for func in &self.functions {
            if !func.header.lazy {
                validate_code(&func.code)?;
            }
        }
        Ok(())
    }

    /// Serialize to the framed container: magic, version, payload length,
    /// serde payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&BYTECODE_MAGIC);
        bytes.extend_from_slice(&BYTECODE_VERSION.to_le_bytes());
        let data = serde_json::to_vec(self).map_err(|e| {
            BytecodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&data);
        Ok(bytes)
    }

    /// Deserialize from the framed container.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(BytecodeError::UnexpectedEnd);
        }
        if bytes[0..8] != BYTECODE_MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != BYTECODE_VERSION {
            return Err(BytecodeError::UnsupportedVersion(version));
        }
        let data_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        if bytes.len() < 16 + data_len {
            return Err(BytecodeError::UnexpectedEnd);
        }
        let module: BytecodeModule = serde_json::from_slice(&bytes[16..16 + data_len])
            .map_err(|e| {
                BytecodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
        module.validate()?;
        Ok(module)
    }

    /// Write the framed container to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()?)?;
        Ok(())
    }

    /// Read a framed container from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BytecodeBuilder;
    use crate::opcode::Opcode;

    #[test]
    fn module_roundtrip() {
        let mut builder = BytecodeBuilder::new("test.js");
        let mut f = builder.function("main", 1, 0);
        f.emit_op(Opcode::LoadTrue);
        f.emit_reg(0);
        f.emit_op(Opcode::Ret);
        f.emit_reg(0);
        let idx = f.finish();
        builder.set_global_function(idx);
        let module = builder.build();

        let bytes = module.to_bytes().unwrap();
        let restored = BytecodeModule::from_bytes(&bytes).unwrap();
        assert_eq!(restored.source_url, "test.js");
        assert_eq!(restored.functions.len(), 1);
        assert_eq!(restored.global_function, 0);
    }

    #[test]
    fn invalid_magic_rejected() {
        let bytes = b"NOTHERON........";
        assert!(matches!(
            BytecodeModule::from_bytes(bytes),
            Err(BytecodeError::InvalidMagic)
        ));
    }

    #[test]
    fn exception_entry_covers_half_open_range() {
        let entry = ExceptionEntry {
            start: 4,
            end: 10,
            target: 20,
        };
        assert!(!entry.covers(3));
        assert!(entry.covers(4));
        assert!(entry.covers(9));
        assert!(!entry.covers(10));
    }

    #[test]
    fn source_offset_uses_preceding_entry() {
        let func = FunctionDef {
            name: u32::MAX,
            header: FunctionHeader::default(),
            code: Vec::new(),
            exceptions: Vec::new(),
            debug_offsets: Some(vec![(0, 100), (8, 140), (20, 200)]),
        };
        assert_eq!(func.source_offset(0), Some(100));
        assert_eq!(func.source_offset(12), Some(140));
        assert_eq!(func.source_offset(25), Some(200));
    }
}
