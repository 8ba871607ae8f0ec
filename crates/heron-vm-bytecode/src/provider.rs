//! The provider interface the VM core consumes.
//!
//! The core never touches `BytecodeModule` directly; it sees a
//! [`BytecodeProvider`]. This keeps the on-disk format, lazy compilation
//! and test assembly behind one seam.

use crate::module::{BytecodeModule, ExceptionEntry, FunctionHeader};

/// Borrowed view of one function.
#[derive(Debug, Clone, Copy)]
pub struct FunctionView<'a> {
    /// Opcode bytes (empty when the function is lazy)
    pub code: &'a [u8],
    /// Fixed header
    pub header: FunctionHeader,
    /// Exception table, inner ranges first
    pub exceptions: &'a [ExceptionEntry],
    /// Name string index, `u32::MAX` when anonymous
    pub name: u32,
    /// Optional `(bytecode offset, source offset)` pairs
    pub debug_offsets: Option<&'a [(u32, u32)]>,
}

/// Borrowed view of one string table entry.
#[derive(Debug, Clone, Copy)]
pub struct StringView<'a> {
    /// UTF-8 bytes
    pub bytes: &'a [u8],
    /// True when flagged as a property-name identifier
    pub is_identifier: bool,
}

/// What the core needs from a compiled module.
pub trait BytecodeProvider {
    /// Number of functions in the module.
    fn function_count(&self) -> u32;

    /// Index of the designated global function.
    fn global_function_index(&self) -> u32;

    /// View of function `i`. Panics on out-of-range indices; the module was
    /// validated on load.
    fn function(&self, i: u32) -> FunctionView<'_>;

    /// Number of string table entries.
    fn string_count(&self) -> u32;

    /// View of string entry `i`.
    fn string(&self, i: u32) -> StringView<'_>;

    /// Precomputed hash for the identifier-flagged entry `i` of the string
    /// table, if the compiler provided one.
    fn identifier_hash(&self, i: u32) -> Option<u32>;

    /// Packed array-literal buffer.
    fn array_buffer(&self) -> &[u8];

    /// Packed object-literal key buffer.
    fn object_key_buffer(&self) -> &[u8];

    /// Packed object-literal value buffer.
    fn object_value_buffer(&self) -> &[u8];

    /// Compiled regexp bytecode blobs (consumed by the RegExp library
    /// collaborator, opaque to the core).
    fn regexp_table(&self) -> &[Vec<u8>];

    /// CommonJS module table: (filename string index, function index).
    fn cjs_module_table(&self) -> &[(u32, u32)];

    /// Source URL for error messages.
    fn source_url(&self) -> &str;
}

impl BytecodeProvider for BytecodeModule {
    fn function_count(&self) -> u32 {
        self.functions.len() as u32
    }

    fn global_function_index(&self) -> u32 {
        self.global_function
    }

    fn function(&self, i: u32) -> FunctionView<'_> {
        let f = &self.functions[i as usize];
        FunctionView {
            code: &f.code,
            header: f.header,
            exceptions: &f.exceptions,
            name: f.name,
            debug_offsets: f.debug_offsets.as_deref(),
        }
    }

    fn string_count(&self) -> u32 {
        self.strings.len() as u32
    }

    fn string(&self, i: u32) -> StringView<'_> {
        let entry = self.strings[i as usize];
        StringView {
            bytes: self.string_bytes(i).expect("validated string entry"),
            is_identifier: entry.is_identifier,
        }
    }

    fn identifier_hash(&self, i: u32) -> Option<u32> {
        self.identifier_hashes.get(i as usize).copied()
    }

    fn array_buffer(&self) -> &[u8] {
        &self.array_buffer
    }

    fn object_key_buffer(&self) -> &[u8] {
        &self.object_key_buffer
    }

    fn object_value_buffer(&self) -> &[u8] {
        &self.object_value_buffer
    }

    fn regexp_table(&self) -> &[Vec<u8>] {
        &self.regexp_table
    }

    fn cjs_module_table(&self) -> &[(u32, u32)] {
        &self.cjs_module_table
    }

    fn source_url(&self) -> &str {
        &self.source_url
    }
}
