//! The JS object model: objects, property storage, indexed storage.
//!
//! An object carries a parent (prototype) reference, a hidden-class
//! reference, four inline property slots with an overflow storage cell for
//! larger objects, an optional dense indexed storage, and flag bits.
//! Named-property layout is fully described by the hidden class; the
//! object itself only stores values.
//!
//! Every operation that can allocate roots its cell arguments in a handle
//! scope and re-derives raw pointers afterwards; a collection may move
//! any cell.

use heron_vm_heap::barrier::{write_ptr_slot, write_value_slot};
use heron_vm_heap::cell::{
    ArrayElem, ArrayMetadata, CellHeader, CellMetadata, CellPtr, CellShape, align_size,
};
use heron_vm_heap::value::{SymbolId, Value};

use crate::error::{ErrorKind, JsResult};
use crate::hidden_class;
use crate::identifiers::Predefined;
use crate::kinds::CellKind;
use crate::runtime::Runtime;

/// Inline property slots per object.
pub const INLINE_PROPS: usize = 4;

/// Property attribute bits.
pub mod prop_flags {
    /// Assignment may overwrite the value
    pub const WRITABLE: u8 = 1;
    /// for-in enumerates the property
    pub const ENUMERABLE: u8 = 2;
    /// delete / attribute changes allowed
    pub const CONFIGURABLE: u8 = 4;
    /// Plain assignment creates fully flexible properties
    pub const DEFAULT: u8 = WRITABLE | ENUMERABLE | CONFIGURABLE;
    /// Builtins installed as non-enumerable
    pub const BUILTIN: u8 = WRITABLE | CONFIGURABLE;
}

/// Object flag bits.
pub mod obj_flags {
    /// New properties may be added
    pub const EXTENSIBLE: u32 = 1;
    /// Sealed: no additions or deletions
    pub const SEALED: u32 = 2;
    /// Frozen: sealed plus read-only
    pub const FROZEN: u32 = 4;
    /// Carries dense indexed storage (arrays)
    pub const INDEXED: u32 = 8;
    /// Created by the embedder
    pub const HOST: u32 = 16;
    /// Invocable by call opcodes
    pub const CALLABLE: u32 = 32;
    /// Error object; gets its `stack` populated at throw time
    pub const ERROR: u32 = 64;
}

/// A JS object. Also the layout prefix of closures, native functions and
/// bound functions.
#[repr(C)]
pub struct ObjectCell {
    /// Cell header
    pub header: CellHeader,
    /// Hidden class; always set after initialization
    pub class: Option<CellPtr>,
    /// Prototype, or `None` at the chain end
    pub parent: Option<CellPtr>,
    /// Overflow property storage
    pub properties: Option<CellPtr>,
    /// Dense indexed storage
    pub indexed: Option<CellPtr>,
    /// `obj_flags` bits
    pub flags: u32,
    _reserved: u32,
    /// The first [`INLINE_PROPS`] property slots
    pub inline_props: [Value; INLINE_PROPS],
}

pub(crate) static OBJECT_VALUE_SLOTS: [usize; INLINE_PROPS] = {
    let base = std::mem::offset_of!(ObjectCell, inline_props);
    [base, base + 8, base + 16, base + 24]
};

pub(crate) static OBJECT_POINTER_SLOTS: [usize; 4] = [
    std::mem::offset_of!(ObjectCell, class),
    std::mem::offset_of!(ObjectCell, parent),
    std::mem::offset_of!(ObjectCell, properties),
    std::mem::offset_of!(ObjectCell, indexed),
];

impl ObjectCell {
    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "Object",
            shape: CellShape::Fixed(std::mem::size_of::<ObjectCell>()),
            value_slots: &OBJECT_VALUE_SLOTS,
            pointer_slots: &OBJECT_POINTER_SLOTS,
            symbol_slots: &[],
            array: None,
            finalize: None,
            custom_visit: None,
        }
    }

    /// Initialize the object prefix of a freshly allocated cell.
    ///
    /// # Safety
    /// `cell` must be an uninitialized allocation at least
    /// `size_of::<ObjectCell>()` bytes, header already written.
    pub(crate) unsafe fn init(cell: CellPtr, class: CellPtr, parent: Option<CellPtr>, flags: u32) {
        // SAFETY: per contract; plain writes into a cell the collector has
        // not seen yet.
        unsafe {
            let obj = cell.cast::<ObjectCell>();
            (*obj).class = Some(class);
            (*obj).parent = parent;
            (*obj).properties = None;
            (*obj).indexed = None;
            (*obj).flags = flags;
            (*obj)._reserved = 0;
            (*obj).inline_props = [Value::empty(); INLINE_PROPS];
        }
    }
}

/// Overflow storage: a Value array cell.
#[repr(C)]
pub struct PropertyStorageCell {
    /// Cell header
    pub header: CellHeader,
    /// Slot capacity (all slots are initialized)
    pub capacity: u32,
    _pad: u32,
    // Values follow.
}

impl PropertyStorageCell {
    /// Allocation size for a capacity.
    pub const fn alloc_size(capacity: u32) -> usize {
        align_size(std::mem::size_of::<PropertyStorageCell>() + capacity as usize * 8)
    }

    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "PropertyStorage",
            shape: CellShape::Variable,
            value_slots: &[],
            pointer_slots: &[],
            symbol_slots: &[],
            array: Some(ArrayMetadata {
                len_offset: std::mem::offset_of!(PropertyStorageCell, capacity),
                data_offset: std::mem::size_of::<PropertyStorageCell>(),
                elem: ArrayElem::Values,
            }),
            finalize: None,
            custom_visit: None,
        }
    }

    #[inline]
    pub(crate) fn slot_ptr(cell: CellPtr, index: u32) -> *mut Value {
        (cell.addr() + std::mem::size_of::<PropertyStorageCell>() + index as usize * 8)
            as *mut Value
    }
}

/// Dense indexed storage: capacity slots (holes are `empty`) plus the
/// JS-visible length.
#[repr(C)]
pub struct IndexedStorageCell {
    /// Cell header
    pub header: CellHeader,
    /// Slot capacity (all slots are initialized; holes are `empty`)
    pub capacity: u32,
    /// JS-visible length (`array.length`)
    pub len: u32,
    // Values follow.
}

impl IndexedStorageCell {
    /// Allocation size for a capacity.
    pub const fn alloc_size(capacity: u32) -> usize {
        align_size(std::mem::size_of::<IndexedStorageCell>() + capacity as usize * 8)
    }

    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "IndexedStorage",
            shape: CellShape::Variable,
            value_slots: &[],
            pointer_slots: &[],
            symbol_slots: &[],
            array: Some(ArrayMetadata {
                len_offset: std::mem::offset_of!(IndexedStorageCell, capacity),
                data_offset: std::mem::size_of::<IndexedStorageCell>(),
                elem: ArrayElem::Values,
            }),
            finalize: None,
            custom_visit: None,
        }
    }

    #[inline]
    pub(crate) fn slot_ptr(cell: CellPtr, index: u32) -> *mut Value {
        (cell.addr() + std::mem::size_of::<IndexedStorageCell>() + index as usize * 8)
            as *mut Value
    }
}

/// for-in snapshot: the enumerable key strings at iteration start.
#[repr(C)]
pub struct PropNameListCell {
    /// Cell header
    pub header: CellHeader,
    /// Number of names
    pub len: u32,
    pub(crate) _pad: u32,
    // Values (heap strings) follow.
}

impl PropNameListCell {
    /// Allocation size for a name count.
    pub const fn alloc_size(len: u32) -> usize {
        align_size(std::mem::size_of::<PropNameListCell>() + len as usize * 8)
    }

    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "PropNameList",
            shape: CellShape::Variable,
            value_slots: &[],
            pointer_slots: &[],
            symbol_slots: &[],
            array: Some(ArrayMetadata {
                len_offset: std::mem::offset_of!(PropNameListCell, len),
                data_offset: std::mem::size_of::<PropNameListCell>(),
                elem: ArrayElem::Values,
            }),
            finalize: None,
            custom_visit: None,
        }
    }

    #[inline]
    pub(crate) fn slot_ptr(cell: CellPtr, index: u32) -> *mut Value {
        (cell.addr() + std::mem::size_of::<PropNameListCell>() + index as usize * 8) as *mut Value
    }
}

// -- Raw accessors --

/// View a cell as an object. The caller vouches the cell is live and
/// object-like (kind checked in debug builds).
#[inline]
pub(crate) unsafe fn object_ref<'a>(cell: CellPtr) -> &'a ObjectCell {
    // SAFETY: per contract.
    unsafe {
        debug_assert!(
            CellKind::from_u8(cell.header().kind()).is_some_and(CellKind::is_object_like)
        );
        &*cell.cast::<ObjectCell>()
    }
}

/// The hidden class of an object-like value. Two objects built by the
/// same property-addition sequence share one class.
pub fn class_of(value: Value) -> Option<CellPtr> {
    // SAFETY: object-like cells are live and initialized.
    as_object(value).map(|cell| unsafe { object_ref(cell) }.class.expect("initialized object"))
}

/// Whether a value is an object-like cell.
#[inline]
pub fn as_object(value: Value) -> Option<CellPtr> {
    if !value.is_object() {
        return None;
    }
    let cell = value.as_cell();
    // SAFETY: object-tagged values point at live cells.
    let kind = unsafe { cell.header() }.kind();
    if CellKind::from_u8(kind).is_some_and(CellKind::is_object_like) {
        Some(cell)
    } else {
        None
    }
}

/// Read a named-property slot.
///
/// # Safety
/// `obj` must be a live object-like cell and `slot` within its class's
/// slot count.
pub(crate) unsafe fn read_slot(obj: CellPtr, slot: u32) -> Value {
    // SAFETY: per contract.
    unsafe {
        if (slot as usize) < INLINE_PROPS {
            (*obj.cast::<ObjectCell>()).inline_props[slot as usize]
        } else {
            let storage = (*obj.cast::<ObjectCell>())
                .properties
                .expect("slot beyond inline range requires property storage");
            *PropertyStorageCell::slot_ptr(storage, slot - INLINE_PROPS as u32)
        }
    }
}

/// Write a named-property slot through the write barrier.
///
/// # Safety
/// As [`read_slot`].
pub(crate) unsafe fn write_slot(obj: CellPtr, slot: u32, value: Value) {
    // SAFETY: per contract; the slot lives inside a heap cell.
    unsafe {
        if (slot as usize) < INLINE_PROPS {
            let slot_ptr = &mut (*obj.cast::<ObjectCell>()).inline_props[slot as usize];
            write_value_slot(slot_ptr, value);
        } else {
            let storage = (*obj.cast::<ObjectCell>())
                .properties
                .expect("slot beyond inline range requires property storage");
            write_value_slot(
                PropertyStorageCell::slot_ptr(storage, slot - INLINE_PROPS as u32),
                value,
            );
        }
    }
}

// -- Allocation --

/// A fresh empty object at the root hidden class.
pub fn new_object(rt: &mut Runtime, parent: Value) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let h_parent = rt.handles.new_handle(parent);
        let cell = rt.alloc_cell(CellKind::Object, std::mem::size_of::<ObjectCell>())?;
        let class = rt.globals.class_root.expect("class root installed at boot");
        let parent = as_object(rt.handles.get(h_parent));
        // SAFETY: fresh allocation of ObjectCell size.
        unsafe { ObjectCell::init(cell, class, parent, obj_flags::EXTENSIBLE) };
        Ok(Value::object(cell))
    })
}

/// A fresh dense array with the given capacity.
pub fn new_array(rt: &mut Runtime, capacity: u32) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let parent = rt.globals.array_prototype;
        let h_parent = rt.handles.new_handle(parent);
        let cell = rt.alloc_cell(CellKind::Object, std::mem::size_of::<ObjectCell>())?;
        let class = rt.globals.class_root.expect("class root installed at boot");
        let parent = as_object(rt.handles.get(h_parent));
        // SAFETY: fresh allocation.
        unsafe {
            ObjectCell::init(cell, class, parent, obj_flags::EXTENSIBLE | obj_flags::INDEXED)
        };
        let h_obj = rt.handles.new_handle(Value::object(cell));
        if capacity > 0 {
            let obj_value = rt.handles.get(h_obj);
            ensure_indexed_capacity(rt, obj_value, capacity)?;
        }
        Ok(rt.handles.get(h_obj))
    })
}

// -- Named properties --

/// Own-property lookup through the hidden class. No allocation.
pub fn get_own_property(rt: &Runtime, obj: CellPtr, sym: SymbolId) -> Option<(u32, u8)> {
    // SAFETY: caller-provided live object.
    let class = unsafe { object_ref(obj) }.class.expect("initialized object");
    hidden_class::find_property(rt, class, sym)
}

/// Chain lookup: the value of `sym` on `obj` or its prototypes.
pub fn get_property(rt: &mut Runtime, obj: CellPtr, sym: SymbolId) -> Option<Value> {
    let mut current = Some(obj);
    while let Some(cell) = current {
        if let Some((slot, _flags)) = get_own_property(rt, cell, sym) {
            // SAFETY: the slot comes from the cell's own class.
            return Some(unsafe { read_slot(cell, slot) });
        }
        // SAFETY: live object.
        current = unsafe { object_ref(cell) }.parent;
    }
    None
}

/// Whether `sym` exists on `obj` or its prototype chain.
pub fn has_property(rt: &Runtime, obj: CellPtr, sym: SymbolId) -> bool {
    let mut current = Some(obj);
    while let Some(cell) = current {
        // SAFETY: live object.
        let class = unsafe { object_ref(cell) }.class.expect("initialized object");
        if hidden_class::find_property(rt, class, sym).is_some() {
            return true;
        }
        // SAFETY: live object.
        current = unsafe { object_ref(cell) }.parent;
    }
    false
}

/// `obj.[sym] = value` with JS assignment semantics. `strict` selects
/// TypeError versus silent drop on failure.
pub fn set_property(
    rt: &mut Runtime,
    obj_value: Value,
    sym: SymbolId,
    value: Value,
    strict: bool,
) -> JsResult<()> {
    let Some(obj) = as_object(obj_value) else {
        return Err(rt.raise(ErrorKind::TypeError, "cannot set property on non-object"));
    };
    // Array length is not a slot-backed property.
    if sym == Predefined::Length.symbol() {
        // SAFETY: live object.
        if unsafe { object_ref(obj) }.flags & obj_flags::INDEXED != 0 {
            return rt.with_scope(|rt| {
                let h_obj = rt.handles.new_handle(obj_value);
                // The length coercion may run JS and collect.
                let len = crate::operations::to_length(rt, value)?;
                let obj_value = rt.handles.get(h_obj);
                set_indexed_length(rt, obj_value, len)
            });
        }
    }

    if let Some((slot, flags)) = get_own_property(rt, obj, sym) {
        if flags & prop_flags::WRITABLE == 0 {
            return if strict {
                Err(rt.raise_with_name(ErrorKind::TypeError, "cannot assign to read-only property", sym))
            } else {
                Ok(())
            };
        }
        // SAFETY: slot from the object's own class.
        unsafe { write_slot(obj, slot, value) };
        return Ok(());
    }

    // A non-writable property anywhere on the chain blocks creation.
    let mut ancestor = unsafe { object_ref(obj) }.parent;
    while let Some(cell) = ancestor {
        // SAFETY: live objects along the chain.
        let class = unsafe { object_ref(cell) }.class.expect("initialized object");
        if let Some((_, flags)) = hidden_class::find_property(rt, class, sym) {
            if flags & prop_flags::WRITABLE == 0 {
                return if strict {
                    Err(rt.raise_with_name(
                        ErrorKind::TypeError,
                        "cannot assign to read-only property",
                        sym,
                    ))
                } else {
                    Ok(())
                };
            }
            break;
        }
        ancestor = unsafe { object_ref(cell) }.parent;
    }

    // SAFETY: live object.
    if unsafe { object_ref(obj) }.flags & obj_flags::EXTENSIBLE == 0 {
        return if strict {
            Err(rt.raise_with_name(
                ErrorKind::TypeError,
                "cannot add property to non-extensible object",
                sym,
            ))
        } else {
            Ok(())
        };
    }

    add_own_property(rt, obj_value, sym, prop_flags::DEFAULT, value)
}

/// Install an own property with explicit flags (literals, builtins).
pub fn define_own_property(
    rt: &mut Runtime,
    obj_value: Value,
    sym: SymbolId,
    value: Value,
    flags: u8,
) -> JsResult<()> {
    let Some(obj) = as_object(obj_value) else {
        return Err(rt.raise(ErrorKind::TypeError, "cannot define property on non-object"));
    };
    if let Some((slot, _)) = get_own_property(rt, obj, sym) {
        // Redefinition keeps the slot; attribute changes force dictionary
        // mode first.
        return rt.with_scope(|rt| {
            let h_obj = rt.handles.new_handle(obj_value);
            let h_value = rt.handles.new_handle(value);
            hidden_class::change_property_flags(rt, h_obj, sym, flags)?;
            let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
            // SAFETY: slot from the object's class.
            unsafe { write_slot(obj, slot, rt.handles.get(h_value)) };
            Ok(())
        });
    }
    add_own_property(rt, obj_value, sym, flags, value)
}

/// Append a brand-new own property. The caller checked it is absent.
pub fn add_own_property(
    rt: &mut Runtime,
    obj_value: Value,
    sym: SymbolId,
    flags: u8,
    value: Value,
) -> JsResult<()> {
    rt.with_scope(|rt| {
        let h_obj = rt.handles.new_handle(obj_value);
        let h_value = rt.handles.new_handle(value);

        let (new_class, slot) = hidden_class::add_property(rt, h_obj, sym, flags)?;
        // The child class is only weakly linked from its parent; root it
        // across the storage growth below.
        let h_class = rt.handles.new_handle(Value::object(new_class));
        ensure_property_capacity(rt, h_obj, slot)?;

        let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
        let new_class = rt.handles.get(h_class).as_cell();
        // SAFETY: live object; the class pointer slot is a heap slot.
        unsafe {
            write_ptr_slot(&mut (*obj.cast::<ObjectCell>()).class, Some(new_class));
            write_slot(obj, slot, rt.handles.get(h_value));
        }
        Ok(())
    })
}

/// `delete obj.[sym]`. Returns what the expression evaluates to.
pub fn delete_property(
    rt: &mut Runtime,
    obj_value: Value,
    sym: SymbolId,
    strict: bool,
) -> JsResult<bool> {
    let Some(obj) = as_object(obj_value) else {
        return Err(rt.raise(ErrorKind::TypeError, "cannot delete property of non-object"));
    };
    let Some((slot, flags)) = get_own_property(rt, obj, sym) else {
        return Ok(true);
    };
    if flags & prop_flags::CONFIGURABLE == 0 {
        return if strict {
            Err(rt.raise_with_name(ErrorKind::TypeError, "cannot delete property", sym))
        } else {
            Ok(false)
        };
    }
    rt.with_scope(|rt| {
        let h_obj = rt.handles.new_handle(obj_value);
        hidden_class::delete_property(rt, h_obj, sym)?;
        let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
        // SAFETY: the vacated slot stays within storage bounds.
        unsafe { write_slot(obj, slot, Value::empty()) };
        Ok(true)
    })
}

/// Grow the overflow storage so `slot` is addressable.
fn ensure_property_capacity(
    rt: &mut Runtime,
    h_obj: heron_vm_heap::handles::HandleId,
    slot: u32,
) -> JsResult<()> {
    if (slot as usize) < INLINE_PROPS {
        return Ok(());
    }
    let needed = slot + 1 - INLINE_PROPS as u32;
    let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
    // SAFETY: live object.
    let current = unsafe { object_ref(obj) }.properties;
    let old_capacity = match current {
        // SAFETY: property storage cells are live.
        Some(storage) => unsafe { (*storage.cast::<PropertyStorageCell>()).capacity },
        None => 0,
    };
    if needed <= old_capacity {
        return Ok(());
    }
    let new_capacity = needed.max(old_capacity * 2).max(INLINE_PROPS as u32);
    let storage = rt.alloc_cell(
        CellKind::PropertyStorage,
        PropertyStorageCell::alloc_size(new_capacity),
    )?;
    let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
    // SAFETY: fresh storage cell; old storage (if any) is live.
    unsafe {
        (*storage.cast::<PropertyStorageCell>()).capacity = new_capacity;
        (*storage.cast::<PropertyStorageCell>())._pad = 0;
        let old = (*obj.cast::<ObjectCell>()).properties;
        for i in 0..new_capacity {
            let value = match old {
                Some(old) if i < old_capacity => *PropertyStorageCell::slot_ptr(old, i),
                _ => Value::empty(),
            };
            // Fresh cell: plain writes, not yet visible to the collector.
            *PropertyStorageCell::slot_ptr(storage, i) = value;
        }
        write_ptr_slot(&mut (*obj.cast::<ObjectCell>()).properties, Some(storage));
    }
    Ok(())
}

/// `Object.seal`: no additions or deletions; existing properties become
/// non-configurable. Ends hidden-class sharing for this object.
pub fn seal(rt: &mut Runtime, obj_value: Value) -> JsResult<()> {
    restrict(rt, obj_value, obj_flags::SEALED, |flags| {
        flags & !prop_flags::CONFIGURABLE
    })
}

/// `Object.freeze`: sealed plus read-only.
pub fn freeze(rt: &mut Runtime, obj_value: Value) -> JsResult<()> {
    restrict(rt, obj_value, obj_flags::SEALED | obj_flags::FROZEN, |flags| {
        flags & !(prop_flags::CONFIGURABLE | prop_flags::WRITABLE)
    })
}

fn restrict(
    rt: &mut Runtime,
    obj_value: Value,
    add_flags: u32,
    adjust: impl Fn(u8) -> u8,
) -> JsResult<()> {
    if as_object(obj_value).is_none() {
        return Err(rt.raise(ErrorKind::TypeError, "cannot restrict a non-object"));
    }
    rt.with_scope(|rt| {
        let h_obj = rt.handles.new_handle(obj_value);
        // Attribute changes end sharing: the object gets its own
        // dictionary class, then every entry is adjusted in place.
        let class = hidden_class::to_dictionary(rt, h_obj)?;
        let props = hidden_class::properties_in_order(rt, class);
        for (sym, flags, _slot) in props {
            hidden_class::change_property_flags(rt, h_obj, sym, adjust(flags))?;
        }
        let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
        // SAFETY: live object; flag bits only.
        unsafe {
            let cell = obj.cast::<ObjectCell>();
            (*cell).flags = ((*cell).flags | add_flags) & !obj_flags::EXTENSIBLE;
        }
        Ok(())
    })
}

// -- Indexed storage --

/// Current `length` of an indexed object (0 without storage).
pub fn indexed_length(obj: CellPtr) -> u32 {
    // SAFETY: caller-provided live object.
    match unsafe { object_ref(obj) }.indexed {
        // SAFETY: indexed storage cells are live.
        Some(storage) => unsafe { (*storage.cast::<IndexedStorageCell>()).len },
        None => 0,
    }
}

/// Read element `index`; `None` for holes and out-of-range reads.
pub fn get_indexed(obj: CellPtr, index: u32) -> Option<Value> {
    // SAFETY: caller-provided live object.
    let storage = unsafe { object_ref(obj) }.indexed?;
    // SAFETY: indexed storage cells are live.
    unsafe {
        let cell = &*storage.cast::<IndexedStorageCell>();
        if index >= cell.len {
            return None;
        }
        let value = *IndexedStorageCell::slot_ptr(storage, index);
        if value.is_empty() { None } else { Some(value) }
    }
}

/// Write element `index`, growing storage and length as needed.
pub fn set_indexed(rt: &mut Runtime, obj_value: Value, index: u32, value: Value) -> JsResult<()> {
    rt.with_scope(|rt| {
        let h_obj = rt.handles.new_handle(obj_value);
        let h_value = rt.handles.new_handle(value);
        ensure_indexed_capacity(rt, obj_value, index + 1)?;
        let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
        // SAFETY: capacity ensured above; storage is live.
        unsafe {
            let storage = object_ref(obj).indexed.expect("capacity was ensured");
            let cell = storage.cast::<IndexedStorageCell>();
            write_value_slot(
                IndexedStorageCell::slot_ptr(storage, index),
                rt.handles.get(h_value),
            );
            if index >= (*cell).len {
                (*cell).len = index + 1;
            }
        }
        Ok(())
    })
}

/// Set `length`: truncating clears vacated slots, extending leaves holes.
pub fn set_indexed_length(rt: &mut Runtime, obj_value: Value, len: u32) -> JsResult<()> {
    rt.with_scope(|rt| {
        let h_obj = rt.handles.new_handle(obj_value);
        ensure_indexed_capacity(rt, obj_value, len)?;
        let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
        // SAFETY: capacity ensured; storage is live.
        unsafe {
            let storage = object_ref(obj).indexed.expect("capacity was ensured");
            let cell = storage.cast::<IndexedStorageCell>();
            for i in len..(*cell).len {
                *IndexedStorageCell::slot_ptr(storage, i) = Value::empty();
            }
            (*cell).len = len;
        }
        Ok(())
    })
}

/// Make sure indexed storage exists with at least `capacity` slots.
fn ensure_indexed_capacity(rt: &mut Runtime, obj_value: Value, capacity: u32) -> JsResult<()> {
    let obj = match as_object(obj_value) {
        Some(obj) => obj,
        None => return Err(rt.raise(ErrorKind::TypeError, "indexed store on non-object")),
    };
    // SAFETY: live object.
    let current = unsafe { object_ref(obj) }.indexed;
    let (old_capacity, old_len) = match current {
        // SAFETY: live storage cell.
        Some(storage) => unsafe {
            let cell = &*storage.cast::<IndexedStorageCell>();
            (cell.capacity, cell.len)
        },
        None => (0, 0),
    };
    if capacity <= old_capacity && current.is_some() {
        return Ok(());
    }
    let new_capacity = capacity.max(old_capacity + old_capacity / 2).max(8);
    rt.with_scope(|rt| {
        let h_obj = rt.handles.new_handle(obj_value);
        let storage = rt.alloc_cell(
            CellKind::IndexedStorage,
            IndexedStorageCell::alloc_size(new_capacity),
        )?;
        let obj = as_object(rt.handles.get(h_obj)).expect("handle keeps the object");
        // SAFETY: fresh storage; the old storage (if any) is live.
        unsafe {
            (*storage.cast::<IndexedStorageCell>()).capacity = new_capacity;
            (*storage.cast::<IndexedStorageCell>()).len = old_len;
            let old = (*obj.cast::<ObjectCell>()).indexed;
            for i in 0..new_capacity {
                let value = match old {
                    Some(old) if i < old_capacity => *IndexedStorageCell::slot_ptr(old, i),
                    _ => Value::empty(),
                };
                *IndexedStorageCell::slot_ptr(storage, i) = value;
            }
            write_ptr_slot(&mut (*obj.cast::<ObjectCell>()).indexed, Some(storage));
        }
        Ok(())
    })
}

// -- Enumeration --

/// An own-property key for enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropKey {
    /// Dense index
    Index(u32),
    /// Named property
    Name(SymbolId),
}

/// Own enumerable keys in for-in order: indices ascending, then named
/// properties in insertion order.
pub fn own_enumerable_keys(rt: &Runtime, obj: CellPtr) -> Vec<PropKey> {
    let mut keys = Vec::new();
    // SAFETY: caller-provided live object.
    let cell = unsafe { object_ref(obj) };
    if let Some(storage) = cell.indexed {
        // SAFETY: live storage.
        unsafe {
            let len = (*storage.cast::<IndexedStorageCell>()).len;
            for i in 0..len {
                if !(*IndexedStorageCell::slot_ptr(storage, i)).is_empty() {
                    keys.push(PropKey::Index(i));
                }
            }
        }
    }
    let class = cell.class.expect("initialized object");
    for (sym, flags, _slot) in hidden_class::properties_in_order(rt, class) {
        if flags & prop_flags::ENUMERABLE != 0 {
            keys.push(PropKey::Name(sym));
        }
    }
    keys
}
