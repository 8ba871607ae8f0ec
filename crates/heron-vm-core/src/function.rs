//! Callable cells: closures, native functions, bound functions.
//!
//! All three start with the [`ObjectCell`] layout so they carry properties
//! (`prototype`, `name`, anything JS assigns) like any object; the
//! `CALLABLE` flag plus the cell kind select the call path.

use heron_vm_heap::cell::{CellMetadata, CellPtr, CellShape};
use heron_vm_heap::value::{SymbolId, Value};

use crate::error::{ErrorKind, JsResult};
use crate::kinds::CellKind;
use crate::object::{self, ObjectCell, obj_flags};
use crate::runtime::Runtime;

/// A JS function: code block plus captured environment.
#[repr(C)]
pub struct ClosureCell {
    /// Object prefix (class, parent, properties, flags)
    pub object: ObjectCell,
    /// Captured environment active at creation
    pub environment: Option<CellPtr>,
    /// Owning module instance
    pub module: u32,
    /// Function index within the module
    pub function: u32,
}

// The ObjectCell prefix sits at offset 0 (repr(C), first field), so its
// slot offsets apply unchanged.
static CLOSURE_POINTER_SLOTS: [usize; 5] = [
    std::mem::offset_of!(ObjectCell, class),
    std::mem::offset_of!(ObjectCell, parent),
    std::mem::offset_of!(ObjectCell, properties),
    std::mem::offset_of!(ObjectCell, indexed),
    std::mem::offset_of!(ClosureCell, environment),
];

impl ClosureCell {
    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "Closure",
            shape: CellShape::Fixed(std::mem::size_of::<ClosureCell>()),
            value_slots: &crate::object::OBJECT_VALUE_SLOTS,
            pointer_slots: &CLOSURE_POINTER_SLOTS,
            symbol_slots: &[],
            array: None,
            finalize: None,
            custom_visit: None,
        }
    }
}

/// A registered host function. The callback lives in the runtime's native
/// registry; the cell stores its index.
#[repr(C)]
pub struct NativeFunctionCell {
    /// Object prefix
    pub object: ObjectCell,
    /// Index into the runtime's host-function registry
    pub host_index: u32,
    /// Declared arity (informational)
    pub arity: u32,
    /// Interned name
    pub name: SymbolId,
    _pad: u32,
}

static NATIVE_SYMBOL_SLOTS: [usize; 1] = [std::mem::offset_of!(NativeFunctionCell, name)];

impl NativeFunctionCell {
    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "NativeFunction",
            shape: CellShape::Fixed(std::mem::size_of::<NativeFunctionCell>()),
            value_slots: &crate::object::OBJECT_VALUE_SLOTS,
            pointer_slots: &crate::object::OBJECT_POINTER_SLOTS,
            symbol_slots: &NATIVE_SYMBOL_SLOTS,
            array: None,
            finalize: None,
            custom_visit: None,
        }
    }
}

/// A bound-function wrapper around another callable.
#[repr(C)]
pub struct BoundFunctionCell {
    /// Object prefix
    pub object: ObjectCell,
    /// The wrapped callable
    pub target: Option<CellPtr>,
    /// `this` fixed at bind time
    pub bound_this: Value,
    /// Leading arguments fixed at bind time (an IndexedStorage cell)
    pub bound_args: Option<CellPtr>,
}

static BOUND_VALUE_SLOTS: [usize; 5] = {
    let base = std::mem::offset_of!(ObjectCell, inline_props);
    [
        base,
        base + 8,
        base + 16,
        base + 24,
        std::mem::offset_of!(BoundFunctionCell, bound_this),
    ]
};

static BOUND_POINTER_SLOTS: [usize; 6] = [
    std::mem::offset_of!(ObjectCell, class),
    std::mem::offset_of!(ObjectCell, parent),
    std::mem::offset_of!(ObjectCell, properties),
    std::mem::offset_of!(ObjectCell, indexed),
    std::mem::offset_of!(BoundFunctionCell, target),
    std::mem::offset_of!(BoundFunctionCell, bound_args),
];

impl BoundFunctionCell {
    /// Collector descriptor.
    pub const fn metadata() -> CellMetadata {
        CellMetadata {
            name: "BoundFunction",
            shape: CellShape::Fixed(std::mem::size_of::<BoundFunctionCell>()),
            value_slots: &BOUND_VALUE_SLOTS,
            pointer_slots: &BOUND_POINTER_SLOTS,
            symbol_slots: &[],
            array: None,
            finalize: None,
            custom_visit: None,
        }
    }
}

/// Pair an inner code block with the current environment into a callable.
pub fn new_closure(
    rt: &mut Runtime,
    module: u32,
    function: u32,
    environment: Value,
) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let h_env = rt.handles.new_handle(environment);
        let h_proto = rt.handles.new_handle(rt.globals.function_prototype);
        let cell = rt.alloc_cell(CellKind::Closure, std::mem::size_of::<ClosureCell>())?;
        let class = rt.globals.class_root.expect("class root installed at boot");
        let parent = object::as_object(rt.handles.get(h_proto));
        // SAFETY: fresh allocation.
        unsafe {
            ObjectCell::init(
                cell,
                class,
                parent,
                obj_flags::EXTENSIBLE | obj_flags::CALLABLE,
            );
            let closure = cell.cast::<ClosureCell>();
            (*closure).environment = rt.handles.get(h_env).pointer();
            (*closure).module = module;
            (*closure).function = function;
        }
        Ok(Value::object(cell))
    })
}

/// Wrap a host-function registry entry into a callable cell.
pub fn new_native_function(
    rt: &mut Runtime,
    host_index: u32,
    arity: u32,
    name: SymbolId,
) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let h_proto = rt.handles.new_handle(rt.globals.function_prototype);
        let cell = rt.alloc_cell(
            CellKind::NativeFunction,
            std::mem::size_of::<NativeFunctionCell>(),
        )?;
        let class = rt.globals.class_root.expect("class root installed at boot");
        let parent = object::as_object(rt.handles.get(h_proto));
        // SAFETY: fresh allocation.
        unsafe {
            ObjectCell::init(
                cell,
                class,
                parent,
                obj_flags::EXTENSIBLE | obj_flags::CALLABLE | obj_flags::HOST,
            );
            let native = cell.cast::<NativeFunctionCell>();
            (*native).host_index = host_index;
            (*native).arity = arity;
            (*native).name = name;
            (*native)._pad = 0;
        }
        Ok(Value::object(cell))
    })
}

/// `target.bind(this, ...args)`.
pub fn new_bound_function(
    rt: &mut Runtime,
    target: Value,
    bound_this: Value,
    bound_args: &[Value],
) -> JsResult<Value> {
    if !is_callable(target) {
        return Err(rt.raise(ErrorKind::TypeError, "bind target is not callable"));
    }
    rt.with_scope(|rt| {
        let h_target = rt.handles.new_handle(target);
        let h_this = rt.handles.new_handle(bound_this);
        let h_proto = rt.handles.new_handle(rt.globals.function_prototype);

        // Root each argument, then stash them in an array cell; the
        // handles track any moves the allocations below cause.
        let arg_handles: Vec<_> = bound_args
            .iter()
            .map(|&arg| rt.handles.new_handle(arg))
            .collect();
        let args_value = object::new_array(rt, bound_args.len() as u32)?;
        let h_args = rt.handles.new_handle(args_value);
        for (i, &h_arg) in arg_handles.iter().enumerate() {
            let args_value = rt.handles.get(h_args);
            let arg = rt.handles.get(h_arg);
            object::set_indexed(rt, args_value, i as u32, arg)?;
        }

        let cell = rt.alloc_cell(
            CellKind::BoundFunction,
            std::mem::size_of::<BoundFunctionCell>(),
        )?;
        let class = rt.globals.class_root.expect("class root installed at boot");
        let parent = object::as_object(rt.handles.get(h_proto));
        // SAFETY: fresh allocation.
        unsafe {
            ObjectCell::init(
                cell,
                class,
                parent,
                obj_flags::EXTENSIBLE | obj_flags::CALLABLE,
            );
            let bound = cell.cast::<BoundFunctionCell>();
            (*bound).target = rt.handles.get(h_target).pointer();
            (*bound).bound_this = rt.handles.get(h_this);
            (*bound).bound_args = rt.handles.get(h_args).pointer();
        }
        Ok(Value::object(cell))
    })
}

/// Whether a value is callable (bound wrappers included).
pub fn is_callable(value: Value) -> bool {
    match object::as_object(value) {
        // SAFETY: object-like cells are live.
        Some(cell) => unsafe { object::object_ref(cell) }.flags & obj_flags::CALLABLE != 0,
        None => false,
    }
}
