//! Heap strings.
//!
//! Strings are variable-length cells: header, length, cached hash, then
//! the UTF-8 bytes. The value representation needs the layout here because
//! `===` compares strings by content; everything else about strings (the
//! identifier table, JS-visible operations) lives in the core crate.

use crate::cell::{
    ArrayElem, ArrayMetadata, CellHeader, CellMetadata, CellPtr, CellShape, align_size,
};

/// A heap-allocated immutable UTF-8 string.
#[repr(C)]
pub struct StringCell {
    /// Cell header
    pub header: CellHeader,
    /// Byte length
    pub len: u32,
    /// Content hash, computed by the creator
    pub hash: u32,
    // UTF-8 bytes follow.
}

impl StringCell {
    /// Allocation size for a string of `len` bytes.
    pub const fn alloc_size(len: usize) -> usize {
        align_size(std::mem::size_of::<StringCell>() + len)
    }

    /// Initialize a freshly allocated cell. The header was written by the
    /// allocator.
    ///
    /// # Safety
    /// `cell` must be an uninitialized allocation of at least
    /// `alloc_size(bytes.len())` bytes whose header is already in place.
    pub unsafe fn init(cell: CellPtr, bytes: &[u8], hash: u32) {
        let s = cell.cast::<StringCell>();
        // SAFETY: per contract.
        unsafe {
            (*s).len = bytes.len() as u32;
            (*s).hash = hash;
            let data = (s as *mut u8).add(std::mem::size_of::<StringCell>());
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
        }
    }

    /// The string bytes.
    ///
    /// # Safety
    /// The cell must be live.
    pub unsafe fn bytes(&self) -> &[u8] {
        // SAFETY: the bytes trail the struct and len was set at init.
        unsafe {
            let data = (self as *const StringCell as *const u8)
                .add(std::mem::size_of::<StringCell>());
            std::slice::from_raw_parts(data, self.len as usize)
        }
    }

    /// The string content.
    ///
    /// # Safety
    /// The cell must be live; contents were validated UTF-8 at creation.
    pub unsafe fn as_str(&self) -> &str {
        // SAFETY: creation only accepts &str.
        unsafe { std::str::from_utf8_unchecked(self.bytes()) }
    }

    /// Collector descriptor for the string kind.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "String",
            shape: CellShape::Variable,
            value_slots: &[],
            pointer_slots: &[],
            symbol_slots: &[],
            array: Some(ArrayMetadata {
                len_offset: std::mem::offset_of!(StringCell, len),
                data_offset: std::mem::size_of::<StringCell>(),
                elem: ArrayElem::Bytes,
            }),
            finalize: None,
            custom_visit: None,
        }
    }
}
