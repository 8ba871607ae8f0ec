//! Environments: heap-allocated captured-variable records.
//!
//! A closure carries the environment active at its creation; variable
//! access compiles to `(level, index)` pairs that walk parent links.

use heron_vm_heap::barrier::write_value_slot;
use heron_vm_heap::cell::{
    ArrayElem, ArrayMetadata, CellHeader, CellMetadata, CellPtr, CellShape, align_size,
};
use heron_vm_heap::value::Value;

use crate::error::JsResult;
use crate::kinds::CellKind;
use crate::runtime::Runtime;

/// A captured-variable record.
#[repr(C)]
pub struct EnvironmentCell {
    /// Cell header
    pub header: CellHeader,
    /// Enclosing environment
    pub parent: Option<CellPtr>,
    /// Slot count, fixed at creation
    pub len: u32,
    _pad: u32,
    // Values follow.
}

static ENV_POINTER_SLOTS: [usize; 1] = [std::mem::offset_of!(EnvironmentCell, parent)];

impl EnvironmentCell {
    /// Allocation size for a slot count.
    pub const fn alloc_size(len: u32) -> usize {
        align_size(std::mem::size_of::<EnvironmentCell>() + len as usize * 8)
    }

    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "Environment",
            shape: CellShape::Variable,
            value_slots: &[],
            pointer_slots: &ENV_POINTER_SLOTS,
            symbol_slots: &[],
            array: Some(ArrayMetadata {
                len_offset: std::mem::offset_of!(EnvironmentCell, len),
                data_offset: std::mem::size_of::<EnvironmentCell>(),
                elem: ArrayElem::Values,
            }),
            finalize: None,
            custom_visit: None,
        }
    }

    #[inline]
    pub(crate) fn slot_ptr(cell: CellPtr, index: u32) -> *mut Value {
        (cell.addr() + std::mem::size_of::<EnvironmentCell>() + index as usize * 8) as *mut Value
    }
}

/// Allocate an environment with `len` slots, all undefined. The parent is
/// taken from a rooted value (an environment cell or undefined).
pub fn new_environment(rt: &mut Runtime, parent: Value, len: u32) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let h_parent = rt.handles.new_handle(parent);
        let cell = rt.alloc_cell(CellKind::Environment, EnvironmentCell::alloc_size(len))?;
        let parent = rt.handles.get(h_parent);
        // SAFETY: fresh allocation; plain writes before the collector
        // sees it.
        unsafe {
            let env = cell.cast::<EnvironmentCell>();
            (*env).parent = parent.pointer();
            (*env).len = len;
            (*env)._pad = 0;
            for i in 0..len {
                *EnvironmentCell::slot_ptr(cell, i) = Value::undefined();
            }
        }
        Ok(Value::object(cell))
    })
}

/// Read slot `index`.
///
/// # Safety
/// `env` must be a live environment cell and `index < len`.
pub(crate) unsafe fn read_env_slot(env: CellPtr, index: u32) -> Value {
    // SAFETY: per contract.
    unsafe {
        debug_assert!(index < (*env.cast::<EnvironmentCell>()).len);
        *EnvironmentCell::slot_ptr(env, index)
    }
}

/// Write slot `index` through the write barrier.
///
/// # Safety
/// As [`read_env_slot`].
pub(crate) unsafe fn write_env_slot(env: CellPtr, index: u32, value: Value) {
    // SAFETY: per contract; the slot is inside a heap cell.
    unsafe {
        debug_assert!(index < (*env.cast::<EnvironmentCell>()).len);
        write_value_slot(EnvironmentCell::slot_ptr(env, index), value);
    }
}

/// Walk `level` parent links from `env`.
///
/// # Safety
/// `env` must be a live environment cell with at least `level` ancestors.
pub(crate) unsafe fn ancestor(env: CellPtr, level: u8) -> CellPtr {
    let mut current = env;
    for _ in 0..level {
        // SAFETY: per contract.
        current = unsafe { (*current.cast::<EnvironmentCell>()).parent }
            .expect("environment chain shorter than access level");
    }
    current
}
