//! Heap string creation and access.

use heron_vm_bytecode::builder::hash_identifier;
use heron_vm_heap::string::StringCell;
use heron_vm_heap::value::Value;

use crate::error::JsResult;
use crate::kinds::CellKind;
use crate::runtime::Runtime;

/// Allocate a heap string from UTF-8 content.
pub fn new_string(rt: &mut Runtime, content: &str) -> JsResult<Value> {
    let cell = rt.alloc_cell(CellKind::String, StringCell::alloc_size(content.len()))?;
    // SAFETY: fresh allocation sized for the content.
    unsafe { StringCell::init(cell, content.as_bytes(), hash_identifier(content.as_bytes())) };
    Ok(Value::string(cell))
}

/// Borrow a string value's content.
///
/// The borrow is only valid until the next allocation (a collection may
/// move the cell); copy out with [`to_rust_string`] to hold it longer.
///
/// # Safety
/// `value` must be a string-kind value.
pub unsafe fn as_str<'a>(value: Value) -> &'a str {
    debug_assert!(value.is_string());
    // SAFETY: string-kind values point at live string cells.
    unsafe { (*value.as_cell().cast::<StringCell>()).as_str() }
}

/// Copy a string value's content out of the heap.
pub fn to_rust_string(value: Value) -> String {
    // SAFETY: copies immediately; no borrow outlives the call.
    unsafe { as_str(value) }.to_owned()
}

/// String content equality without allocating.
pub fn string_eq(a: Value, b: Value) -> bool {
    debug_assert!(a.is_string() && b.is_string());
    a.strict_equals(b)
}

/// Concatenate two string values.
pub fn concat(rt: &mut Runtime, a: Value, b: Value) -> JsResult<Value> {
    // The contents are copied out before allocating: the cells may move.
    let mut combined = to_rust_string(a);
    combined.push_str(unsafe { as_str(b) });
    new_string(rt, &combined)
}
