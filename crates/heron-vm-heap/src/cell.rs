//! Heap cells: headers, pointers, and metadata descriptors.
//!
//! Every allocation starts with an 8-byte [`CellHeader`] packing the cell
//! kind, flag bits, and size. During collection a cell's header word may be
//! replaced wholesale by a forwarding address with bit 0 set; live headers
//! always have bit 0 clear because sizes are rounded to 8 bytes.
//!
//! Kind-specific structure is described by immutable [`CellMetadata`]
//! descriptors registered once before the first allocation. The collector
//! visits a cell's owning pointers, `Value` slots, symbol slots and
//! trailing array through its descriptor; there is no dynamic dispatch on
//! cells.

use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::roots::SlotAcceptor;
use crate::value::Value;

/// Cell alignment. Pointer-kind values rely on the low three bits being
/// free.
pub const HEAP_ALIGN: usize = 8;

/// Round a size up to [`HEAP_ALIGN`].
#[inline]
pub const fn align_size(size: usize) -> usize {
    (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

const SIZE_MASK: u64 = 0xFFFF_FFFF;
const KIND_SHIFT: u32 = 32;
const FLAG_MARK: u64 = 1 << 40;
const FLAG_FINALIZER: u64 = 1 << 41;
const FORWARD_BIT: u64 = 1;

/// The 8-byte header at the start of every heap cell.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellHeader {
    raw: u64,
}

impl CellHeader {
    /// Build a live header. `size` must already be 8-byte aligned.
    #[inline]
    pub fn new(kind: u8, size: usize, finalizable: bool) -> CellHeader {
        debug_assert_eq!(size % HEAP_ALIGN, 0, "cell size must be aligned");
        debug_assert!(size as u64 <= SIZE_MASK, "cell size exceeds header field");
        let mut raw = size as u64 | (kind as u64) << KIND_SHIFT;
        if finalizable {
            raw |= FLAG_FINALIZER;
        }
        CellHeader { raw }
    }

    /// The cell kind byte.
    #[inline]
    pub fn kind(self) -> u8 {
        debug_assert!(!self.is_forwarded());
        (self.raw >> KIND_SHIFT) as u8
    }

    /// Allocated size in bytes, header included.
    #[inline]
    pub fn size(self) -> usize {
        debug_assert!(!self.is_forwarded());
        (self.raw & SIZE_MASK) as usize
    }

    /// Mark bit, used by full collection.
    #[inline]
    pub fn is_marked(self) -> bool {
        debug_assert!(!self.is_forwarded());
        self.raw & FLAG_MARK != 0
    }

    /// Set the mark bit.
    #[inline]
    pub fn set_mark(&mut self) {
        self.raw |= FLAG_MARK;
    }

    /// Clear the mark bit.
    #[inline]
    pub fn clear_mark(&mut self) {
        self.raw &= !FLAG_MARK;
    }

    /// Finalizer flag set at allocation time.
    #[inline]
    pub fn has_finalizer(self) -> bool {
        debug_assert!(!self.is_forwarded());
        self.raw & FLAG_FINALIZER != 0
    }

    /// Whether the header word has been replaced by a forwarding address.
    #[inline]
    pub fn is_forwarded(self) -> bool {
        self.raw & FORWARD_BIT != 0
    }

    /// The forwarding target installed by a collection.
    #[inline]
    pub fn forwarding(self) -> CellPtr {
        debug_assert!(self.is_forwarded());
        // SAFETY: forwarding addresses are produced from valid cell
        // allocations during collection.
        unsafe { CellPtr::from_addr_unchecked((self.raw & !FORWARD_BIT) as usize) }
    }

    /// Overwrite this header with a forwarding address.
    #[inline]
    pub fn forward_to(&mut self, target: CellPtr) {
        debug_assert_eq!(target.addr() & 7, 0);
        self.raw = target.addr() as u64 | FORWARD_BIT;
    }

    /// Raw header word (displaced-header side lists).
    #[inline]
    pub fn raw(self) -> u64 {
        self.raw
    }

    /// Rebuild from a raw header word.
    #[inline]
    pub fn from_raw(raw: u64) -> CellHeader {
        CellHeader { raw }
    }
}

/// A pointer to a heap cell. The pointee always begins with a
/// [`CellHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellPtr(NonNull<CellHeader>);

impl CellPtr {
    /// Wrap a non-null header pointer.
    #[inline]
    pub fn new(ptr: NonNull<CellHeader>) -> CellPtr {
        CellPtr(ptr)
    }

    /// Wrap a raw address known to be a valid cell.
    ///
    /// # Safety
    /// `addr` must be non-zero, 8-byte aligned, and point at a cell header.
    #[inline]
    pub unsafe fn from_addr_unchecked(addr: usize) -> CellPtr {
        // SAFETY: caller guarantees non-null.
        CellPtr(unsafe { NonNull::new_unchecked(addr as *mut CellHeader) })
    }

    /// The cell's address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The raw header pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut CellHeader {
        self.0.as_ptr()
    }

    /// Read the header.
    ///
    /// # Safety
    /// The cell must be live (or forwarded) heap memory.
    #[inline]
    pub unsafe fn header(self) -> CellHeader {
        // SAFETY: per contract.
        unsafe { *self.0.as_ptr() }
    }

    /// Write the header.
    ///
    /// # Safety
    /// As [`CellPtr::header`].
    #[inline]
    pub unsafe fn set_header(self, header: CellHeader) {
        // SAFETY: per contract.
        unsafe { *self.0.as_ptr() = header }
    }

    /// View the cell as its concrete kind struct. The struct's first field
    /// must be the [`CellHeader`].
    #[inline]
    pub fn cast<T>(self) -> *mut T {
        self.0.as_ptr() as *mut T
    }

    /// Address of a field at a byte offset from the cell start.
    #[inline]
    pub fn field_addr(self, offset: usize) -> usize {
        self.addr() + offset
    }
}

/// How a kind's total size is determined.
#[derive(Debug, Clone, Copy)]
pub enum CellShape {
    /// All cells of the kind have this size.
    Fixed(usize),
    /// Size varies per cell; the allocation-time size in the header is
    /// authoritative.
    Variable,
}

/// Element type of a trailing variable-length region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayElem {
    /// `Value` elements, visited by the collector
    Values,
    /// Nullable cell-pointer elements, visited by the collector
    Pointers,
    /// Raw bytes, skipped by the collector
    Bytes,
}

/// Descriptor of a trailing array region.
#[derive(Debug, Clone, Copy)]
pub struct ArrayMetadata {
    /// Byte offset of the `u32` element count
    pub len_offset: usize,
    /// Byte offset of the first element
    pub data_offset: usize,
    /// Element type
    pub elem: ArrayElem,
}

/// Finalizer invoked for a dead cell before its memory is reused. Runs
/// after weak slots referring to the dead cell have been cleared.
pub type FinalizeFn = unsafe fn(CellPtr);

/// Extra visit hook for slots a flat descriptor cannot express (symbols
/// inside native-side tables).
pub type CustomVisitFn = unsafe fn(CellPtr, &mut dyn SlotAcceptor);

/// Immutable per-kind descriptor. Registered once at startup; the
/// descriptor table is the only global in the system.
pub struct CellMetadata {
    /// Kind name, for snapshots and diagnostics
    pub name: &'static str,
    /// Size discipline
    pub shape: CellShape,
    /// Byte offsets of `Value` fields
    pub value_slots: &'static [usize],
    /// Byte offsets of nullable cell-pointer fields
    pub pointer_slots: &'static [usize],
    /// Byte offsets of `SymbolId` fields
    pub symbol_slots: &'static [usize],
    /// Optional trailing variable-length region
    pub array: Option<ArrayMetadata>,
    /// Optional finalizer
    pub finalize: Option<FinalizeFn>,
    /// Optional extra visit hook
    pub custom_visit: Option<CustomVisitFn>,
}

static METADATA: OnceLock<Vec<CellMetadata>> = OnceLock::new();

/// Install the descriptor table. The first call wins; later calls must
/// present a table of the same length (multiple runtimes in one process
/// share the registration).
pub fn install_metadata(table: Vec<CellMetadata>) {
    let len = table.len();
    let installed = METADATA.get_or_init(|| table);
    assert_eq!(
        installed.len(),
        len,
        "conflicting cell metadata registrations"
    );
}

/// Whether a descriptor table has been installed.
pub fn metadata_installed() -> bool {
    METADATA.get().is_some()
}

/// Look up the descriptor for a kind byte.
#[inline]
pub fn metadata_for(kind: u8) -> &'static CellMetadata {
    let table = METADATA.get().expect("cell metadata not registered");
    &table[kind as usize]
}

/// The full descriptor table.
pub fn metadata_table() -> &'static [CellMetadata] {
    METADATA.get().expect("cell metadata not registered")
}

/// Visit every collector-relevant slot of a live cell through its
/// descriptor.
///
/// # Safety
/// `cell` must point at an initialized live cell whose header kind matches
/// its contents.
pub unsafe fn visit_cell(cell: CellPtr, acceptor: &mut dyn SlotAcceptor) {
    // SAFETY: cell is live per contract.
    let header = unsafe { cell.header() };
    // SAFETY: same.
    unsafe { visit_cell_with_kind(cell, header.kind(), acceptor) }
}

/// Visit a cell whose header has been displaced; the kind comes from the
/// side list the collector keeps.
///
/// # Safety
/// `cell` must point at cell memory laid out for `kind`.
pub unsafe fn visit_cell_with_kind(cell: CellPtr, kind: u8, acceptor: &mut dyn SlotAcceptor) {
    let meta = metadata_for(kind);
    for &off in meta.value_slots {
        // SAFETY: descriptor offsets are in bounds for the kind's layout.
        unsafe { acceptor.value_slot(cell.field_addr(off) as *mut Value) };
    }
    for &off in meta.pointer_slots {
        // SAFETY: same.
        unsafe { acceptor.ptr_slot(cell.field_addr(off) as *mut Option<CellPtr>) };
    }
    for &off in meta.symbol_slots {
        // SAFETY: same.
        let sym = unsafe { *(cell.field_addr(off) as *const crate::value::SymbolId) };
        if !sym.is_invalid() {
            acceptor.symbol(sym);
        }
    }
    if let Some(array) = meta.array {
        // SAFETY: same.
        let len = unsafe { *(cell.field_addr(array.len_offset) as *const u32) } as usize;
        let data = cell.field_addr(array.data_offset);
        match array.elem {
            ArrayElem::Values => {
                for i in 0..len {
                    // SAFETY: elements 0..len are initialized Values.
                    unsafe {
                        acceptor.value_slot((data + i * std::mem::size_of::<Value>()) as *mut Value)
                    };
                }
            }
            ArrayElem::Pointers => {
                for i in 0..len {
                    // SAFETY: elements 0..len are initialized pointers.
                    unsafe {
                        acceptor.ptr_slot(
                            (data + i * std::mem::size_of::<Option<CellPtr>>())
                                as *mut Option<CellPtr>,
                        )
                    };
                }
            }
            ArrayElem::Bytes => {}
        }
    }
    if let Some(custom) = meta.custom_visit {
        // SAFETY: same.
        unsafe { custom(cell, acceptor) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_kind_size_flags() {
        let h = CellHeader::new(5, 48, true);
        assert_eq!(h.kind(), 5);
        assert_eq!(h.size(), 48);
        assert!(h.has_finalizer());
        assert!(!h.is_marked());
        assert!(!h.is_forwarded());

        let mut h = h;
        h.set_mark();
        assert!(h.is_marked());
        assert_eq!(h.kind(), 5);
        assert_eq!(h.size(), 48);
        h.clear_mark();
        assert!(!h.is_marked());
    }

    #[test]
    fn forwarding_overwrites_and_tags() {
        let mut h = CellHeader::new(2, 32, false);
        // SAFETY: the address is only stored and compared, never deref'd.
        let target = unsafe { CellPtr::from_addr_unchecked(0x1000) };
        h.forward_to(target);
        assert!(h.is_forwarded());
        assert_eq!(h.forwarding().addr(), 0x1000);
    }

    #[test]
    fn live_header_low_bit_clear() {
        // Sizes are 8-byte aligned, so a live header can never be mistaken
        // for a forwarding word.
        for size in [8usize, 16, 1024, 0xFFFF_FFF8] {
            let h = CellHeader::new(0xFF, size, true);
            assert!(!h.is_forwarded());
        }
    }
}
