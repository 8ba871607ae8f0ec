//! Hidden classes.
//!
//! A hidden class is a node in a transition tree: it records the
//! `(symbol, flags)` pair added to reach it from its parent, its slot
//! count, a weak child map keyed by that pair, and a lazily built full
//! property table that amortises repeated chain searches. Objects built by
//! the same property-addition sequence share one class.
//!
//! A class leaves the shared tree when it is frozen, when a property is
//! deleted or its attributes change, or when it accumulates too many
//! properties: the object then gets its own non-shared dictionary-mode
//! class holding a hash table, mutated in place from then on.
//!
//! Child edges are weak: the collector clears the weak slot when a child
//! class dies, and lookups prune cleared entries.

use heron_vm_heap::cell::{CellHeader, CellMetadata, CellPtr, CellShape};
use heron_vm_heap::handles::HandleId;
use heron_vm_heap::roots::SlotAcceptor;
use heron_vm_heap::value::SymbolId;
use heron_vm_heap::weak::WeakSlotId;
use rustc_hash::FxHashMap;

use crate::error::JsResult;
use crate::kinds::CellKind;
use crate::object::{self, ObjectCell};
use crate::runtime::Runtime;

/// Property count at which a shared chain converts to dictionary mode.
pub const DICTIONARY_THRESHOLD: u32 = 64;

const MODE_SHARED: u8 = 0;
const MODE_DICTIONARY: u8 = 1;

/// Transition edge key: the property and flags that were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransitionKey {
    /// Added property
    pub symbol: SymbolId,
    /// Its attribute flags
    pub flags: u8,
}

/// A property's location and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySlot {
    /// Storage slot index
    pub slot: u32,
    /// Attribute flags
    pub flags: u8,
}

/// Native-side tables of a class. Boxed behind a raw pointer in the cell;
/// the kind's finalizer drops it.
#[derive(Default)]
pub struct ClassTables {
    /// Weak transition edges
    pub children: FxHashMap<TransitionKey, WeakSlotId>,
    /// Lazily built map of every property reachable along the chain
    pub property_table: Option<FxHashMap<SymbolId, PropertySlot>>,
    /// Dictionary-mode property map (non-shared classes only)
    pub dictionary: Option<FxHashMap<SymbolId, PropertySlot>>,
}

/// A hidden-class cell.
#[repr(C)]
pub struct HiddenClassCell {
    /// Cell header
    pub header: CellHeader,
    /// Parent class in the transition tree
    pub parent: Option<CellPtr>,
    /// Property added to reach this class from its parent
    pub transition_symbol: SymbolId,
    /// Flags of the added property
    pub transition_flags: u8,
    /// `MODE_SHARED` or `MODE_DICTIONARY`
    mode: u8,
    _pad: u16,
    /// Number of property slots objects of this class use
    pub slot_count: u32,
    _pad2: u32,
    /// Native tables; null until first needed
    tables: *mut ClassTables,
}

static CLASS_POINTER_SLOTS: [usize; 1] = [std::mem::offset_of!(HiddenClassCell, parent)];
static CLASS_SYMBOL_SLOTS: [usize; 1] = [std::mem::offset_of!(HiddenClassCell, transition_symbol)];

unsafe fn finalize_class(cell: CellPtr) {
    // SAFETY: the finalizer runs exactly once on a dead class cell.
    unsafe {
        let tables = (*cell.cast::<HiddenClassCell>()).tables;
        if !tables.is_null() {
            drop(Box::from_raw(tables));
        }
    }
}

unsafe fn visit_class(cell: CellPtr, acceptor: &mut dyn SlotAcceptor) {
    // Dictionary keys live in a native table the flat descriptor cannot
    // express; surface them so the identifier sweep sees the usage.
    // SAFETY: live class cell.
    unsafe {
        let tables = (*cell.cast::<HiddenClassCell>()).tables;
        if tables.is_null() {
            return;
        }
        if let Some(dictionary) = &(*tables).dictionary {
            for sym in dictionary.keys() {
                acceptor.symbol(*sym);
            }
        }
        if let Some(property_table) = &(*tables).property_table {
            for sym in property_table.keys() {
                acceptor.symbol(*sym);
            }
        }
    }
}

impl HiddenClassCell {
    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "HiddenClass",
            shape: CellShape::Fixed(std::mem::size_of::<HiddenClassCell>()),
            value_slots: &[],
            pointer_slots: &CLASS_POINTER_SLOTS,
            symbol_slots: &CLASS_SYMBOL_SLOTS,
            array: None,
            finalize: Some(finalize_class),
            custom_visit: Some(visit_class),
        }
    }

    /// Whether this class is in dictionary mode.
    #[inline]
    pub fn is_dictionary(&self) -> bool {
        self.mode == MODE_DICTIONARY
    }

    fn tables_mut(&mut self) -> &mut ClassTables {
        if self.tables.is_null() {
            self.tables = Box::into_raw(Box::new(ClassTables::default()));
        }
        // SAFETY: just ensured non-null; exclusive access via &mut self.
        unsafe { &mut *self.tables }
    }

    fn tables_ref(&self) -> Option<&ClassTables> {
        if self.tables.is_null() {
            None
        } else {
            // SAFETY: non-null tables are valid until the finalizer runs.
            Some(unsafe { &*self.tables })
        }
    }
}

#[inline]
pub(crate) unsafe fn class_ref<'a>(cell: CellPtr) -> &'a HiddenClassCell {
    // SAFETY: caller vouches the cell is a live hidden class.
    unsafe {
        debug_assert_eq!(cell.header().kind(), CellKind::HiddenClass as u8);
        &*cell.cast::<HiddenClassCell>()
    }
}

#[inline]
#[allow(clippy::mut_from_ref)]
unsafe fn class_mut<'a>(cell: CellPtr) -> &'a mut HiddenClassCell {
    // SAFETY: as `class_ref`; the runtime is single-threaded.
    unsafe { &mut *cell.cast::<HiddenClassCell>() }
}

/// Allocate the root class (no parent, no transition). Boot-time only.
pub(crate) fn new_root_class(rt: &mut Runtime) -> JsResult<CellPtr> {
    let cell = rt.alloc_cell(CellKind::HiddenClass, std::mem::size_of::<HiddenClassCell>())?;
    // SAFETY: fresh allocation.
    unsafe {
        let class = cell.cast::<HiddenClassCell>();
        (*class).parent = None;
        (*class).transition_symbol = SymbolId::INVALID;
        (*class).transition_flags = 0;
        (*class).mode = MODE_SHARED;
        (*class)._pad = 0;
        (*class).slot_count = 0;
        (*class)._pad2 = 0;
        (*class).tables = std::ptr::null_mut();
    }
    Ok(cell)
}

/// `add_property`: the child class reached by adding `(sym, flags)`, plus
/// the slot the value goes in. Creates and weakly links the child when the
/// transition is new; converts the object to dictionary mode past the
/// threshold. `h_obj` roots the object whose class is transitioning.
pub(crate) fn add_property(
    rt: &mut Runtime,
    h_obj: HandleId,
    sym: SymbolId,
    flags: u8,
) -> JsResult<(CellPtr, u32)> {
    let class = object_class(rt, h_obj);
    // SAFETY: classes of live objects are live.
    let class_cell = unsafe { class_ref(class) };

    if class_cell.is_dictionary() {
        // Non-shared: mutate in place.
        let slot = class_cell.slot_count;
        // SAFETY: single-threaded mutation of the object's own class.
        let class_cell = unsafe { class_mut(class) };
        class_cell.slot_count += 1;
        class_cell
            .tables_mut()
            .dictionary
            .as_mut()
            .expect("dictionary classes always carry a table")
            .insert(sym, PropertySlot { slot, flags });
        return Ok((class, slot));
    }

    if class_cell.slot_count + 1 > DICTIONARY_THRESHOLD {
        to_dictionary(rt, h_obj)?;
        return add_property(rt, h_obj, sym, flags);
    }

    let key = TransitionKey { symbol: sym, flags };
    // Cached transition?
    if let Some(tables) = class_cell.tables_ref() {
        if let Some(&weak_id) = tables.children.get(&key) {
            if let Some(child) = rt.heap.weak_slots_ref().get(weak_id) {
                // SAFETY: weak slots only hold live (or cleared) cells.
                let slot = unsafe { class_ref(child) }.slot_count - 1;
                return Ok((child, slot));
            }
            // The child died; prune the stale edge and its weak slot.
            // SAFETY: single-threaded mutation.
            unsafe { class_mut(class) }.tables_mut().children.remove(&key);
            rt.heap.weak_slots().release(weak_id);
        }
    }

    // New transition: allocate the child, then link it weakly from the
    // (possibly moved) parent.
    let parent_slot_count = class_cell.slot_count;
    let child = rt.alloc_cell(CellKind::HiddenClass, std::mem::size_of::<HiddenClassCell>())?;
    let parent = object_class(rt, h_obj);
    // SAFETY: fresh allocation.
    unsafe {
        let cell = child.cast::<HiddenClassCell>();
        (*cell).parent = Some(parent);
        (*cell).transition_symbol = sym;
        (*cell).transition_flags = flags;
        (*cell).mode = MODE_SHARED;
        (*cell)._pad = 0;
        (*cell).slot_count = parent_slot_count + 1;
        (*cell)._pad2 = 0;
        (*cell).tables = std::ptr::null_mut();
    }
    let weak_id = rt.heap.weak_slots().new_slot(child);
    // SAFETY: parent is live; single-threaded mutation.
    unsafe { class_mut(parent) }.tables_mut().children.insert(key, weak_id);
    Ok((child, parent_slot_count))
}

/// `find_property`: search from `class` back to the root, memoizing into
/// the lazily built property table.
pub fn find_property(rt: &Runtime, class: CellPtr, sym: SymbolId) -> Option<(u32, u8)> {
    let _ = rt; // lookups never allocate; rt documents the calling context
    // SAFETY: caller-provided live class.
    let class_cell = unsafe { class_ref(class) };
    if class_cell.is_dictionary() {
        let entry = class_cell.tables_ref()?.dictionary.as_ref()?.get(&sym)?;
        return Some((entry.slot, entry.flags));
    }
    if let Some(tables) = class_cell.tables_ref() {
        if let Some(table) = &tables.property_table {
            let entry = table.get(&sym)?;
            return Some((entry.slot, entry.flags));
        }
    }
    // First search on this class: build the full table from the chain.
    let mut table = FxHashMap::default();
    let mut current = Some(class);
    while let Some(cell) = current {
        // SAFETY: chain cells are live.
        let node = unsafe { class_ref(cell) };
        if !node.transition_symbol.is_invalid() {
            table
                .entry(node.transition_symbol)
                .or_insert(PropertySlot {
                    slot: node.slot_count - 1,
                    flags: node.transition_flags,
                });
        }
        current = node.parent;
    }
    let result = table.get(&sym).map(|e| (e.slot, e.flags));
    // SAFETY: single-threaded; memoization does not move cells.
    unsafe { class_mut(class) }.tables_mut().property_table = Some(table);
    result
}

/// Every property of `class` with flags and slot, slot-ascending
/// (insertion order).
pub fn properties_in_order(rt: &Runtime, class: CellPtr) -> Vec<(SymbolId, u8, u32)> {
    let _ = rt;
    // SAFETY: caller-provided live class.
    let class_cell = unsafe { class_ref(class) };
    let mut props: Vec<(SymbolId, u8, u32)> = Vec::new();
    if class_cell.is_dictionary() {
        if let Some(tables) = class_cell.tables_ref() {
            if let Some(dict) = &tables.dictionary {
                props.extend(dict.iter().map(|(sym, e)| (*sym, e.flags, e.slot)));
            }
        }
    } else {
        let mut current = Some(class);
        while let Some(cell) = current {
            // SAFETY: chain cells are live.
            let node = unsafe { class_ref(cell) };
            if !node.transition_symbol.is_invalid() {
                props.push((node.transition_symbol, node.transition_flags, node.slot_count - 1));
            }
            current = node.parent;
        }
    }
    props.sort_by_key(|&(_, _, slot)| slot);
    props
}

/// Give the object its own non-shared dictionary class built from its
/// current chain. Returns the new class.
pub(crate) fn to_dictionary(rt: &mut Runtime, h_obj: HandleId) -> JsResult<CellPtr> {
    let old_class = object_class(rt, h_obj);
    // Snapshot the chain before allocating (allocation may move it).
    let props = properties_in_order(rt, old_class);
    // SAFETY: live class.
    let slot_count = unsafe { class_ref(old_class) }.slot_count;

    let cell = rt.alloc_cell(CellKind::HiddenClass, std::mem::size_of::<HiddenClassCell>())?;
    let mut dictionary = FxHashMap::default();
    for (sym, flags, slot) in props {
        dictionary.insert(sym, PropertySlot { slot, flags });
    }
    // SAFETY: fresh allocation.
    unsafe {
        let class = cell.cast::<HiddenClassCell>();
        (*class).parent = None;
        (*class).transition_symbol = SymbolId::INVALID;
        (*class).transition_flags = 0;
        (*class).mode = MODE_DICTIONARY;
        (*class)._pad = 0;
        (*class).slot_count = slot_count;
        (*class)._pad2 = 0;
        (*class).tables = Box::into_raw(Box::new(ClassTables {
            children: FxHashMap::default(),
            property_table: None,
            dictionary: Some(dictionary),
        }));
    }
    // Install on the object.
    let obj = object_cell(rt, h_obj);
    // SAFETY: live object; heap slot store goes through the barrier.
    unsafe {
        heron_vm_heap::barrier::write_ptr_slot(&mut (*obj.cast::<ObjectCell>()).class, Some(cell));
    }
    Ok(cell)
}

/// Remove a property. Converts to dictionary mode first; the object's
/// class after this call is dictionary-mode.
pub(crate) fn delete_property(rt: &mut Runtime, h_obj: HandleId, sym: SymbolId) -> JsResult<()> {
    let class = object_class(rt, h_obj);
    // SAFETY: live class.
    let class = if unsafe { class_ref(class) }.is_dictionary() {
        class
    } else {
        to_dictionary(rt, h_obj)?
    };
    // SAFETY: single-threaded mutation of the object's own class.
    unsafe { class_mut(class) }
        .tables_mut()
        .dictionary
        .as_mut()
        .expect("dictionary classes always carry a table")
        .remove(&sym);
    Ok(())
}

/// Change a property's attributes in place (dictionary mode required, as
/// attribute changes end sharing).
pub(crate) fn change_property_flags(
    rt: &mut Runtime,
    h_obj: HandleId,
    sym: SymbolId,
    flags: u8,
) -> JsResult<()> {
    let class = object_class(rt, h_obj);
    // SAFETY: live class.
    let current_flags = find_property(rt, class, sym).map(|(_, f)| f);
    if current_flags == Some(flags) {
        return Ok(());
    }
    // SAFETY: live class.
    let class = if unsafe { class_ref(class) }.is_dictionary() {
        class
    } else {
        to_dictionary(rt, h_obj)?
    };
    // SAFETY: single-threaded mutation.
    if let Some(entry) = unsafe { class_mut(class) }
        .tables_mut()
        .dictionary
        .as_mut()
        .expect("dictionary classes always carry a table")
        .get_mut(&sym)
    {
        entry.flags = flags;
    }
    Ok(())
}

#[inline]
fn object_cell(rt: &Runtime, h_obj: HandleId) -> CellPtr {
    object::as_object(rt.handles.get(h_obj)).expect("handle holds an object")
}

#[inline]
fn object_class(rt: &Runtime, h_obj: HandleId) -> CellPtr {
    // SAFETY: the handle keeps the object alive and current.
    unsafe { object::object_ref(object_cell(rt, h_obj)) }
        .class
        .expect("initialized object")
}
