//! The bytecode interpreter.
//!
//! One function, one loop: every opcode is decoded from raw bytes at the
//! instruction pointer and dispatched through a jump-table `match`. Calls
//! do not recurse into Rust: a call opcode writes a new frame header just
//! past the caller's registers and the same loop continues in the callee;
//! only host functions leave the loop, and their re-entry depth is capped.
//!
//! Exceptions are data-driven: a throw stores the value in the runtime's
//! thrown slot and the loop walks exception tables outward, popping frames
//! until a handler or the native boundary.

use std::rc::Rc;

use heron_vm_bytecode::Opcode;
use heron_vm_bytecode::literal::{LiteralReader, LiteralValue};
use heron_vm_heap::value::{SymbolId, Value};

use crate::environment;
use crate::error::{ErrorKind, JsResult, Thrown};
use crate::function::{self, BoundFunctionCell, ClosureCell, NativeFunctionCell};
use crate::identifiers::Predefined;
use crate::inline_cache::{NAMED_CACHE_LENGTH, NAMED_CACHE_PROTOTYPE};
use crate::kinds::CellKind;
use crate::object::{self, IndexedStorageCell, PropNameListCell, obj_flags, prop_flags};
use crate::operations::{self, PreferredType};
use crate::runtime::{FunctionRecord, JIT_HOT_THRESHOLD, Runtime};
use crate::stack::{
    FRAME_ARGC, FRAME_CALLEE, FRAME_FIXED, FRAME_NEW_TARGET, FRAME_SAVED_CODE, FRAME_SAVED_FP,
    FRAME_SAVED_IP, FRAME_THIS, NO_CALLER, decode_code_word, encode_code_word,
};
use crate::strings;

// -- Operand decoding --

#[inline]
fn rd_u8(code: &[u8], at: usize) -> u8 {
    code[at]
}

#[inline]
fn rd_u16(code: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(code[at..at + 2].try_into().unwrap())
}

#[inline]
fn rd_u32(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(code[at..at + 4].try_into().unwrap())
}

#[inline]
fn rd_i8(code: &[u8], at: usize) -> i8 {
    code[at] as i8
}

#[inline]
fn rd_i32(code: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(code[at..at + 4].try_into().unwrap())
}

#[inline]
fn rd_f64(code: &[u8], at: usize) -> f64 {
    f64::from_le_bytes(code[at..at + 8].try_into().unwrap())
}

// -- Native entry --

/// Call any callable from native code (embedding API, coercions,
/// re-entrant host functions). Bound functions unwrap to their target with
/// the bound `this` and leading arguments applied.
pub(crate) fn call_value(
    rt: &mut Runtime,
    callee: Value,
    this: Value,
    args: &[Value],
    new_target: Value,
) -> JsResult<Value> {
    let mut callee = callee;
    let mut this = this;
    let mut combined: Option<Vec<Value>> = None;

    loop {
        let Some(cell) = object::as_object(callee) else {
            return Err(rt.raise(ErrorKind::TypeError, "value is not callable"));
        };
        // SAFETY: object-like cells are live.
        let kind = CellKind::from_u8(unsafe { cell.header() }.kind())
            .expect("object-like cell has a core kind");
        match kind {
            CellKind::BoundFunction => {
                // SAFETY: kind checked.
                let bound = unsafe { &*cell.cast::<BoundFunctionCell>() };
                let target = bound
                    .target
                    .map(Value::object)
                    .unwrap_or_else(Value::undefined);
                this = bound.bound_this;
                let mut merged = Vec::new();
                if let Some(storage) = bound.bound_args {
                    // SAFETY: bound args are IndexedStorage cells.
                    let len = unsafe { (*storage.cast::<IndexedStorageCell>()).len };
                    for i in 0..len {
                        // SAFETY: slots 0..len are initialized.
                        merged.push(unsafe { *IndexedStorageCell::slot_ptr(storage, i) });
                    }
                }
                merged.extend_from_slice(combined.as_deref().unwrap_or(args));
                combined = Some(merged);
                callee = target;
            }
            CellKind::NativeFunction => {
                let args = combined.as_deref().unwrap_or(args);
                return call_native(rt, cell, this, args);
            }
            CellKind::Closure => {
                let args = combined.as_deref().unwrap_or(args);
                return execute_closure(rt, Value::object(cell), this, args, new_target);
            }
            _ => return Err(rt.raise(ErrorKind::TypeError, "value is not callable")),
        }
    }
}

/// Invoke a host function. Arguments are raw `Value`s; per the root-
/// management contract the host must register anything it holds across a
/// potentially-allocating operation in a handle scope.
fn call_native(
    rt: &mut Runtime,
    cell: heron_vm_heap::cell::CellPtr,
    this: Value,
    args: &[Value],
) -> JsResult<Value> {
    if rt.native_depth >= rt.config.max_native_depth {
        return Err(rt.raise(ErrorKind::RangeError, "maximum call stack size exceeded"));
    }
    // SAFETY: caller checked the kind.
    let host_index = unsafe { (*cell.cast::<NativeFunctionCell>()).host_index };
    let f = Rc::clone(&rt.host_fns[host_index as usize].f);
    rt.native_depth += 1;
    let result = f(rt, this, args);
    rt.native_depth -= 1;
    result
}

/// Resolve a function record, compiling lazy functions through the host
/// hook on first call.
fn resolve_function(rt: &mut Runtime, module: u32, index: u32) -> JsResult<Rc<FunctionRecord>> {
    let record = Rc::clone(&rt.modules[module as usize].functions[index as usize]);
    if !record.header.lazy {
        return Ok(record);
    }
    let Some(mut hook) = rt.compile_hook.take() else {
        return Err(rt.raise(
            ErrorKind::ReferenceError,
            "lazy function called with no compiler attached",
        ));
    };
    let compiled = hook(module, index);
    rt.compile_hook = Some(hook);
    let Some(def) = compiled else {
        return Err(rt.raise(ErrorKind::ReferenceError, "lazy function failed to compile"));
    };
    if heron_vm_bytecode::opcode::validate_code(&def.code).is_err() {
        rt.fatal("compile hook produced invalid bytecode");
    }
    let replacement = Rc::new(FunctionRecord {
        code: def.code.into(),
        header: heron_vm_bytecode::module::FunctionHeader {
            lazy: false,
            ..def.header
        },
        exceptions: def.exceptions.into(),
        name: record.name.clone(),
        module,
        index,
        debug_offsets: def.debug_offsets.map(Into::into),
    });
    let slots = crate::runtime::count_cache_slots(&replacement.code);
    let instance = &mut rt.modules[module as usize];
    instance.functions[index as usize] = Rc::clone(&replacement);
    instance.caches[index as usize] =
        vec![crate::inline_cache::PropertyCacheEntry::default(); slots].into_boxed_slice();
    Ok(replacement)
}

/// Run a closure from the native boundary: push an entry frame and spin
/// the loop until it returns. A non-undefined `new_target` selects
/// construct semantics: the receiver is allocated from the constructor's
/// `prototype` and kept when the body returns a non-object, exactly as
/// the call opcodes do.
fn execute_closure(
    rt: &mut Runtime,
    closure: Value,
    this: Value,
    args: &[Value],
    new_target: Value,
) -> JsResult<Value> {
    let cell = closure.as_cell();
    // SAFETY: caller checked the kind.
    let (module, index) = unsafe {
        let c = &*cell.cast::<ClosureCell>();
        (c.module, c.function)
    };
    let construct = !new_target.is_undefined();
    let func = resolve_function(rt, module, index)?;
    if let Some(entry) = note_call_and_jit(rt, module, index)? {
        // The JIT tier must be invisible: same receiver allocation, same
        // return-value selection as the interpreted frame below.
        return if construct {
            jit_construct_call(rt, entry, closure, args)
        } else {
            jit_call(rt, entry, this, args)
        };
    }

    let fp = rt.stack.sp;
    let needed = FRAME_FIXED + args.len() + func.header.frame_size as usize;
    if fp + needed > rt.stack.capacity() {
        return Err(rt.raise(ErrorKind::RangeError, "maximum call stack size exceeded"));
    }
    rt.stack.values[fp + FRAME_SAVED_FP] = Value::native_u32(NO_CALLER);
    rt.stack.values[fp + FRAME_SAVED_IP] = Value::native_u32(0);
    rt.stack.values[fp + FRAME_SAVED_CODE] = Value::native_u32(0);
    rt.stack.values[fp + FRAME_ARGC] = Value::native_u32(args.len() as u32);
    rt.stack.values[fp + FRAME_NEW_TARGET] = new_target;
    rt.stack.values[fp + FRAME_CALLEE] = closure;
    rt.stack.values[fp + FRAME_THIS] = this;
    for (i, &arg) in args.iter().enumerate() {
        rt.stack.values[fp + FRAME_FIXED + i] = arg;
    }
    for i in 0..func.header.frame_size as usize {
        rt.stack.values[fp + FRAME_FIXED + args.len() + i] = Value::undefined();
    }
    rt.stack.sp = fp + needed;

    // For construct entries the receiver is created after the frame roots
    // the callee and arguments, then patched into the `this` slot.
    if construct {
        let callee = rt.stack.values[fp + FRAME_CALLEE];
        match create_this(rt, callee) {
            Ok(receiver) => rt.stack.values[fp + FRAME_THIS] = receiver,
            Err(thrown) => {
                rt.stack.sp = fp;
                return Err(thrown);
            }
        }
    }

    let caller_fp = rt.current_fp;
    let caller_ip = rt.current_ip;
    rt.current_fp = fp;
    let result = run_loop(rt, fp, func);
    rt.current_fp = caller_fp;
    rt.current_ip = caller_ip;
    rt.stack.sp = fp;
    result
}

/// Invoke a JIT entry as a plain call, under the native depth cap.
fn jit_call(
    rt: &mut Runtime,
    entry: crate::runtime::JitEntry,
    this: Value,
    args: &[Value],
) -> JsResult<Value> {
    if rt.native_depth >= rt.config.max_native_depth {
        return Err(rt.raise(ErrorKind::RangeError, "maximum call stack size exceeded"));
    }
    rt.native_depth += 1;
    let result = entry(rt, this, args);
    rt.native_depth -= 1;
    result
}

/// Invoke a JIT entry with construct semantics: allocate the receiver
/// from the constructor's `prototype`, pass it as `this`, and keep it
/// when the body returns a non-object. Mirrors the interpreted construct
/// path so the perf tier never changes observable behavior.
fn jit_construct_call(
    rt: &mut Runtime,
    entry: crate::runtime::JitEntry,
    callee: Value,
    args: &[Value],
) -> JsResult<Value> {
    rt.with_scope(|rt| {
        // Root the callee and arguments: receiver allocation and the
        // entry itself may collect.
        let h_callee = rt.handles.new_handle(callee);
        let arg_handles: Vec<_> = args.iter().map(|&arg| rt.handles.new_handle(arg)).collect();
        let callee = rt.handles.get(h_callee);
        let receiver = create_this(rt, callee)?;
        let h_receiver = rt.handles.new_handle(receiver);
        let args: Vec<Value> = arg_handles.iter().map(|&h| rt.handles.get(h)).collect();
        let receiver = rt.handles.get(h_receiver);

        let result = jit_call(rt, entry, receiver, &args)?;
        Ok(if object::as_object(result).is_some() {
            result
        } else {
            rt.handles.get(h_receiver)
        })
    })
}

/// Count a call; offer the function to the JIT hook at the hot threshold.
/// Returns an installed native entry, if any.
fn note_call_and_jit(
    rt: &mut Runtime,
    module: u32,
    index: u32,
) -> JsResult<Option<crate::runtime::JitEntry>> {
    let instance = &mut rt.modules[module as usize];
    let count = &mut instance.call_counts[index as usize];
    *count = count.saturating_add(1);
    let crossed = *count == JIT_HOT_THRESHOLD;
    if let Some(entry) = &instance.jit_entries[index as usize] {
        return Ok(Some(Rc::clone(entry)));
    }
    if crossed {
        if let Some(mut hook) = rt.jit_hook.take() {
            let compiled = hook(module, index);
            rt.jit_hook = Some(hook);
            if let Some(entry) = compiled {
                tracing::debug!(module, index, "function compiled by JIT hook");
                rt.modules[module as usize].jit_entries[index as usize] =
                    Some(Rc::clone(&entry));
                return Ok(Some(entry));
            }
        }
    }
    Ok(None)
}

enum Unwound {
    /// A handler was found; fp/func/ip updated.
    Handler,
    /// The exception crossed the entry frame.
    Native,
}

/// Walk exception tables outward from the throw site, popping frames.
fn unwind(
    rt: &mut Runtime,
    fp: &mut usize,
    func: &mut Rc<FunctionRecord>,
    ip: &mut usize,
) -> Unwound {
    loop {
        if let Some(entry) = func.exceptions.iter().find(|e| e.covers(*ip as u32)) {
            *ip = entry.target as usize;
            return Unwound::Handler;
        }
        let saved_fp = rt.stack.values[*fp + FRAME_SAVED_FP].as_native_u32();
        let saved_ip = rt.stack.values[*fp + FRAME_SAVED_IP].as_native_u32();
        let saved_code = rt.stack.values[*fp + FRAME_SAVED_CODE].as_native_u32();
        rt.stack.sp = *fp;
        if saved_fp == NO_CALLER {
            return Unwound::Native;
        }
        *fp = saved_fp as usize;
        rt.current_fp = *fp;
        let (module, function) = decode_code_word(saved_code);
        *func = Rc::clone(&rt.modules[module as usize].functions[function as usize]);
        // The caller's resume point is its call instruction; handler
        // ranges covering the call site catch exceptions from the callee.
        *ip = saved_ip as usize;
    }
}

/// Resolve a module string-table entry to a symbol, interning on demand.
fn resolve_symbol(rt: &mut Runtime, module: u32, string_index: u32) -> SymbolId {
    let sym = rt.modules[module as usize].symbols[string_index as usize];
    if !sym.is_invalid() {
        return sym;
    }
    let text = rt.modules[module as usize].string_text[string_index as usize].clone();
    let sym = rt.identifiers.intern_external(&text);
    rt.modules[module as usize].symbols[string_index as usize] = sym;
    sym
}

/// The cached heap string for a module string-table entry.
fn module_string(rt: &mut Runtime, module: u32, string_index: u32) -> JsResult<Value> {
    let cached = rt.modules[module as usize].string_values[string_index as usize];
    if !cached.is_empty() {
        return Ok(cached);
    }
    let text = rt.modules[module as usize].string_text[string_index as usize].clone();
    let value = strings::new_string(rt, &text)?;
    rt.modules[module as usize].string_values[string_index as usize] = value;
    Ok(value)
}

/// JS `length` of a string value: UTF-16 code units.
fn string_length(value: Value) -> f64 {
    // SAFETY: read immediately, no allocation.
    unsafe { strings::as_str(value) }.encode_utf16().count() as f64
}

// -- The dispatch loop --

#[allow(clippy::too_many_lines)]
fn run_loop(rt: &mut Runtime, entry_fp: usize, entry_func: Rc<FunctionRecord>) -> JsResult<Value> {
    let mut fp = entry_fp;
    let mut func = entry_func;
    let mut ip: usize = 0;
    let mut base = rt.stack.locals_base(fp);

    macro_rules! throwing {
        ($e:expr) => {
            match $e {
                Ok(v) => v,
                Err(Thrown) => {
                    match unwind(rt, &mut fp, &mut func, &mut ip) {
                        Unwound::Handler => {
                            base = rt.stack.locals_base(fp);
                            continue;
                        }
                        Unwound::Native => return Err(Thrown),
                    }
                }
            }
        };
    }

    macro_rules! reg {
        ($i:expr) => {
            rt.stack.values[base + $i as usize]
        };
    }

    loop {
        let code = &func.code;
        debug_assert!(ip < code.len(), "instruction pointer ran off the code");
        let op = match Opcode::from_u8(code[ip]) {
            Some(op) => op,
            None => rt.fatal("corrupt bytecode: unknown opcode"),
        };
        rt.current_ip = ip as u32;

        match op {
            // -- Constants and moves --
            Opcode::LoadUndefined => {
                let dst = rd_u8(code, ip + 1);
                reg![dst] = Value::undefined();
                ip += op.width();
            }
            Opcode::LoadNull => {
                let dst = rd_u8(code, ip + 1);
                reg![dst] = Value::null();
                ip += op.width();
            }
            Opcode::LoadTrue => {
                let dst = rd_u8(code, ip + 1);
                reg![dst] = Value::bool(true);
                ip += op.width();
            }
            Opcode::LoadFalse => {
                let dst = rd_u8(code, ip + 1);
                reg![dst] = Value::bool(false);
                ip += op.width();
            }
            Opcode::LoadInt8 => {
                let dst = rd_u8(code, ip + 1);
                let imm = rd_i8(code, ip + 2);
                reg![dst] = Value::number(imm as f64);
                ip += op.width();
            }
            Opcode::LoadInt32 => {
                let dst = rd_u8(code, ip + 1);
                let imm = rd_i32(code, ip + 2);
                reg![dst] = Value::number(imm as f64);
                ip += op.width();
            }
            Opcode::LoadDouble => {
                let dst = rd_u8(code, ip + 1);
                let imm = rd_f64(code, ip + 2);
                reg![dst] = Value::number(imm);
                ip += op.width();
            }
            Opcode::LoadString => {
                let dst = rd_u8(code, ip + 1);
                let index = rd_u32(code, ip + 2);
                let value = throwing!(module_string(rt, func.module, index));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::Mov => {
                let dst = rd_u8(code, ip + 1);
                let src = rd_u8(code, ip + 2);
                reg![dst] = reg![src];
                ip += op.width();
            }
            Opcode::LoadParam => {
                let dst = rd_u8(code, ip + 1);
                let index = rd_u8(code, ip + 2) as usize;
                let argc = rt.stack.argc(fp);
                let value = if index == 0 {
                    rt.stack.values[fp + FRAME_THIS]
                } else if index <= argc {
                    rt.stack.values[fp + FRAME_FIXED + index - 1]
                } else {
                    Value::undefined()
                };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::LoadNewTarget => {
                let dst = rd_u8(code, ip + 1);
                reg![dst] = rt.stack.values[fp + FRAME_NEW_TARGET];
                ip += op.width();
            }
            Opcode::GetGlobalObject => {
                let dst = rd_u8(code, ip + 1);
                reg![dst] = rt.globals.global_object;
                ip += op.width();
            }

            // -- Arithmetic --
            Opcode::Add => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let value = if a.is_number() && b.is_number() {
                    Value::number(a.as_number() + b.as_number())
                } else {
                    throwing!(slow_add(rt, a, b))
                };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::Sub => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let value = if a.is_number() && b.is_number() {
                    Value::number(a.as_number() - b.as_number())
                } else {
                    throwing!(slow_numeric(rt, a, b, |x, y| x - y))
                };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::Mul => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let value = if a.is_number() && b.is_number() {
                    Value::number(a.as_number() * b.as_number())
                } else {
                    throwing!(slow_numeric(rt, a, b, |x, y| x * y))
                };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::Div => {
                // IEEE semantics: division by zero yields infinities/NaN.
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let value = if a.is_number() && b.is_number() {
                    Value::number(a.as_number() / b.as_number())
                } else {
                    throwing!(slow_numeric(rt, a, b, |x, y| x / y))
                };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::Mod => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let value = if a.is_number() && b.is_number() {
                    Value::number(js_mod(a.as_number(), b.as_number()))
                } else {
                    throwing!(slow_numeric(rt, a, b, js_mod))
                };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::Neg => {
                let dst = rd_u8(code, ip + 1);
                let src = reg![rd_u8(code, ip + 2)];
                let value = if src.is_number() {
                    Value::number(-src.as_number())
                } else {
                    let n = throwing!(operations::to_number(rt, src));
                    Value::number(-n)
                };
                reg![dst] = value;
                ip += op.width();
            }

            // -- Bitwise --
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let x = throwing!(operations::to_int32(rt, a));
                let y = throwing!(operations::to_int32(rt, b));
                let r = match op {
                    Opcode::BitAnd => x & y,
                    Opcode::BitOr => x | y,
                    _ => x ^ y,
                };
                reg![dst] = Value::number(r as f64);
                ip += op.width();
            }
            Opcode::BitNot => {
                let dst = rd_u8(code, ip + 1);
                let src = reg![rd_u8(code, ip + 2)];
                let x = throwing!(operations::to_int32(rt, src));
                reg![dst] = Value::number(!x as f64);
                ip += op.width();
            }
            Opcode::Shl => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let x = throwing!(operations::to_int32(rt, a));
                let shift = throwing!(operations::to_uint32(rt, b)) & 31;
                reg![dst] = Value::number((x << shift) as f64);
                ip += op.width();
            }
            Opcode::Shr => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let x = throwing!(operations::to_int32(rt, a));
                let shift = throwing!(operations::to_uint32(rt, b)) & 31;
                reg![dst] = Value::number((x >> shift) as f64);
                ip += op.width();
            }
            Opcode::UShr => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let x = throwing!(operations::to_uint32(rt, a));
                let shift = throwing!(operations::to_uint32(rt, b)) & 31;
                reg![dst] = Value::number((x >> shift) as f64);
                ip += op.width();
            }

            // -- Logic / unary --
            Opcode::Not => {
                let dst = rd_u8(code, ip + 1);
                let src = reg![rd_u8(code, ip + 2)];
                reg![dst] = Value::bool(!operations::to_boolean(src));
                ip += op.width();
            }
            Opcode::TypeOf => {
                let dst = rd_u8(code, ip + 1);
                let src = reg![rd_u8(code, ip + 2)];
                let name = operations::typeof_str(src);
                let value = throwing!(strings::new_string(rt, name));
                reg![dst] = value;
                ip += op.width();
            }

            // -- Equality and comparison --
            Opcode::Eq | Opcode::Neq => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let eq = if a.is_number() && b.is_number() {
                    a.as_number() == b.as_number()
                } else {
                    throwing!(operations::loose_equals(rt, a, b))
                };
                reg![dst] = Value::bool(if op == Opcode::Eq { eq } else { !eq });
                ip += op.width();
            }
            Opcode::StrictEq | Opcode::StrictNeq => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let eq = a.strict_equals(b);
                reg![dst] = Value::bool(if op == Opcode::StrictEq { eq } else { !eq });
                ip += op.width();
            }
            Opcode::Lt | Opcode::LtEq | Opcode::Gt | Opcode::GtEq => {
                let dst = rd_u8(code, ip + 1);
                let a = reg![rd_u8(code, ip + 2)];
                let b = reg![rd_u8(code, ip + 3)];
                let result = if a.is_number() && b.is_number() {
                    let (x, y) = (a.as_number(), b.as_number());
                    match op {
                        Opcode::Lt => x < y,
                        Opcode::LtEq => x <= y,
                        Opcode::Gt => x > y,
                        _ => x >= y,
                    }
                } else {
                    match op {
                        Opcode::Lt => {
                            throwing!(operations::compare_less(rt, a, b)) == Some(true)
                        }
                        Opcode::Gt => {
                            throwing!(operations::compare_less(rt, b, a)) == Some(true)
                        }
                        Opcode::LtEq => {
                            throwing!(operations::compare_less(rt, b, a)) == Some(false)
                        }
                        _ => throwing!(operations::compare_less(rt, a, b)) == Some(false),
                    }
                };
                reg![dst] = Value::bool(result);
                ip += op.width();
            }

            // -- Jumps --
            Opcode::Jmp => {
                let offset = rd_i32(code, ip + 1);
                if offset < 0 {
                    safepoint(rt);
                }
                ip = (ip as i64 + offset as i64) as usize;
            }
            Opcode::JmpTrue => {
                let cond = reg![rd_u8(code, ip + 1)];
                let offset = rd_i32(code, ip + 2);
                if operations::to_boolean(cond) {
                    if offset < 0 {
                        safepoint(rt);
                    }
                    ip = (ip as i64 + offset as i64) as usize;
                } else {
                    ip += op.width();
                }
            }
            Opcode::JmpFalse => {
                let cond = reg![rd_u8(code, ip + 1)];
                let offset = rd_i32(code, ip + 2);
                if !operations::to_boolean(cond) {
                    if offset < 0 {
                        safepoint(rt);
                    }
                    ip = (ip as i64 + offset as i64) as usize;
                } else {
                    ip += op.width();
                }
            }
            Opcode::JmpUndefined => {
                let cond = reg![rd_u8(code, ip + 1)];
                let offset = rd_i32(code, ip + 2);
                if cond.is_undefined() {
                    ip = (ip as i64 + offset as i64) as usize;
                } else {
                    ip += op.width();
                }
            }

            // -- Property access --
            Opcode::GetById | Opcode::TryGetById => {
                let dst = rd_u8(code, ip + 1);
                let obj_r = rd_u8(code, ip + 2);
                let cache_index = rd_u8(code, ip + 3);
                let string_index = rd_u32(code, ip + 4);
                let receiver = reg![obj_r];
                let sym = resolve_symbol(rt, func.module, string_index);
                let value = throwing!(get_by_id(
                    rt,
                    &func,
                    receiver,
                    sym,
                    cache_index,
                    op == Opcode::TryGetById,
                ));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::PutById | Opcode::TryPutById => {
                let obj_r = rd_u8(code, ip + 1);
                let src = rd_u8(code, ip + 2);
                let cache_index = rd_u8(code, ip + 3);
                let string_index = rd_u32(code, ip + 4);
                let receiver = reg![obj_r];
                let value = reg![src];
                let sym = resolve_symbol(rt, func.module, string_index);
                throwing!(put_by_id(
                    rt,
                    &func,
                    receiver,
                    sym,
                    value,
                    cache_index,
                    op == Opcode::TryPutById,
                ));
                ip += op.width();
            }
            Opcode::DelById => {
                let dst = rd_u8(code, ip + 1);
                let obj_r = rd_u8(code, ip + 2);
                let string_index = rd_u32(code, ip + 3);
                let receiver = reg![obj_r];
                let sym = resolve_symbol(rt, func.module, string_index);
                let deleted = throwing!(object::delete_property(
                    rt,
                    receiver,
                    sym,
                    func.header.strict
                ));
                reg![dst] = Value::bool(deleted);
                ip += op.width();
            }
            Opcode::GetByVal => {
                let dst = rd_u8(code, ip + 1);
                let receiver = reg![rd_u8(code, ip + 2)];
                let key = reg![rd_u8(code, ip + 3)];
                let value = throwing!(get_by_val(rt, receiver, key));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::PutByVal => {
                let receiver = reg![rd_u8(code, ip + 1)];
                let key = reg![rd_u8(code, ip + 2)];
                let value = reg![rd_u8(code, ip + 3)];
                throwing!(put_by_val(rt, receiver, key, value, func.header.strict));
                ip += op.width();
            }
            Opcode::DelByVal => {
                let dst = rd_u8(code, ip + 1);
                let receiver = reg![rd_u8(code, ip + 2)];
                let key = reg![rd_u8(code, ip + 3)];
                let deleted = throwing!(del_by_val(rt, receiver, key, func.header.strict));
                reg![dst] = Value::bool(deleted);
                ip += op.width();
            }

            // -- Object and array construction --
            Opcode::NewObject => {
                let dst = rd_u8(code, ip + 1);
                let value = throwing!(object::new_object(rt, rt.globals.object_prototype));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::NewObjectWithBuffer => {
                let dst = rd_u8(code, ip + 1);
                let key_offset = rd_u32(code, ip + 2);
                let value_offset = rd_u32(code, ip + 6);
                let count = rd_u16(code, ip + 10);
                let value = throwing!(new_object_with_buffer(
                    rt,
                    func.module,
                    key_offset,
                    value_offset,
                    count,
                ));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::NewArray => {
                let dst = rd_u8(code, ip + 1);
                let size = rd_u16(code, ip + 2);
                let value = throwing!(object::new_array(rt, size as u32));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::NewArrayWithBuffer => {
                let dst = rd_u8(code, ip + 1);
                let offset = rd_u32(code, ip + 2);
                let count = rd_u16(code, ip + 6);
                let value = throwing!(new_array_with_buffer(rt, func.module, offset, count));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::CreateThis => {
                let dst = rd_u8(code, ip + 1);
                let callee = reg![rd_u8(code, ip + 2)];
                let value = throwing!(create_this(rt, callee));
                reg![dst] = value;
                ip += op.width();
            }

            // -- Environments and closures --
            Opcode::CreateEnvironment => {
                let dst = rd_u8(code, ip + 1);
                let slots = rd_u8(code, ip + 2);
                let callee = rt.stack.values[fp + FRAME_CALLEE];
                // SAFETY: the callee of a JS frame is a live closure.
                let parent = unsafe {
                    (*callee.as_cell().cast::<ClosureCell>())
                        .environment
                        .map(Value::object)
                        .unwrap_or_else(Value::undefined)
                };
                let value = throwing!(environment::new_environment(rt, parent, slots as u32));
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::GetEnvironment => {
                let dst = rd_u8(code, ip + 1);
                let level = rd_u8(code, ip + 2);
                let callee = rt.stack.values[fp + FRAME_CALLEE];
                // SAFETY: the callee of a JS frame is a live closure.
                let Some(env) = (unsafe { (*callee.as_cell().cast::<ClosureCell>()).environment })
                else {
                    rt.fatal("corrupt bytecode: environment access in a captureless function")
                };
                // SAFETY: the chain has `level` ancestors for compiler-
                // emitted access pairs.
                let env = unsafe { environment::ancestor(env, level) };
                reg![dst] = Value::object(env);
                ip += op.width();
            }
            Opcode::LoadFromEnvironment => {
                let dst = rd_u8(code, ip + 1);
                let env = reg![rd_u8(code, ip + 2)];
                let index = rd_u8(code, ip + 3);
                // SAFETY: the register holds an environment created by
                // CreateEnvironment/GetEnvironment.
                let value = unsafe { environment::read_env_slot(env.as_cell(), index as u32) };
                reg![dst] = value;
                ip += op.width();
            }
            Opcode::StoreToEnvironment => {
                let env = reg![rd_u8(code, ip + 1)];
                let index = rd_u8(code, ip + 2);
                let value = reg![rd_u8(code, ip + 3)];
                // SAFETY: as above.
                unsafe { environment::write_env_slot(env.as_cell(), index as u32, value) };
                ip += op.width();
            }
            Opcode::CreateClosure => {
                let dst = rd_u8(code, ip + 1);
                let env = reg![rd_u8(code, ip + 2)];
                let index = rd_u32(code, ip + 3);
                let value = throwing!(function::new_closure(rt, func.module, index, env));
                reg![dst] = value;
                ip += op.width();
            }

            // -- Iteration --
            Opcode::GetPNameList => {
                let dst = rd_u8(code, ip + 1);
                let obj_r = rd_u8(code, ip + 2);
                let idx_dst = rd_u8(code, ip + 3);
                let size_dst = rd_u8(code, ip + 4);
                let receiver = reg![obj_r];
                let (list, size) = throwing!(get_pname_list(rt, receiver));
                reg![dst] = list;
                reg![idx_dst] = Value::number(0.0);
                reg![size_dst] = Value::number(size as f64);
                ip += op.width();
            }
            Opcode::GetNextPName => {
                let dst = rd_u8(code, ip + 1);
                let props = reg![rd_u8(code, ip + 2)];
                let receiver = reg![rd_u8(code, ip + 3)];
                let idx_r = rd_u8(code, ip + 4);
                let size_r = rd_u8(code, ip + 5);
                let index = reg![idx_r].as_number() as u32;
                let size = reg![size_r].as_number() as u32;
                let (value, next_index) =
                    throwing!(get_next_pname(rt, props, receiver, index, size));
                reg![dst] = value;
                reg![idx_r] = Value::number(next_index as f64);
                ip += op.width();
            }

            // -- Calls --
            Opcode::Call => {
                let callee = reg![rd_u8(code, ip + 2)];
                let this = reg![rd_u8(code, ip + 3)];
                let arg_start = rd_u8(code, ip + 4);
                let argc = rd_u8(code, ip + 5) as usize;
                let args: Vec<Value> = (0..argc).map(|i| reg![arg_start as usize + i]).collect();
                throwing!(begin_call(
                    rt, &mut fp, &mut func, &mut ip, &mut base, callee, this, &args, false,
                ));
            }
            Opcode::Call1 | Opcode::Call2 | Opcode::Call3 | Opcode::Call4 => {
                let callee = reg![rd_u8(code, ip + 2)];
                let this = reg![rd_u8(code, ip + 3)];
                let argc: usize = match op {
                    Opcode::Call1 => 1,
                    Opcode::Call2 => 2,
                    Opcode::Call3 => 3,
                    _ => 4,
                };
                let args: Vec<Value> =
                    (0..argc).map(|i| reg![rd_u8(code, ip + 4 + i)]).collect();
                throwing!(begin_call(
                    rt, &mut fp, &mut func, &mut ip, &mut base, callee, this, &args, false,
                ));
            }
            Opcode::Construct => {
                let callee = reg![rd_u8(code, ip + 2)];
                let arg_start = rd_u8(code, ip + 3);
                let argc = rd_u8(code, ip + 4) as usize;
                let args: Vec<Value> = (0..argc).map(|i| reg![arg_start as usize + i]).collect();
                throwing!(begin_call(
                    rt,
                    &mut fp,
                    &mut func,
                    &mut ip,
                    &mut base,
                    callee,
                    Value::undefined(),
                    &args,
                    true,
                ));
            }
            Opcode::CallBuiltin => {
                let builtin = rd_u8(code, ip + 2) as usize;
                let arg_start = rd_u8(code, ip + 3);
                let argc = rd_u8(code, ip + 4) as usize;
                let callee = rt.builtins.get(builtin).copied().unwrap_or_default();
                if callee.is_undefined() {
                    throwing!(Err::<(), Thrown>(
                        rt.raise(ErrorKind::TypeError, "builtin slot is not installed")
                    ));
                }
                let args: Vec<Value> = (0..argc).map(|i| reg![arg_start as usize + i]).collect();
                throwing!(begin_call(
                    rt,
                    &mut fp,
                    &mut func,
                    &mut ip,
                    &mut base,
                    callee,
                    Value::undefined(),
                    &args,
                    false,
                ));
            }
            Opcode::CallDirect => {
                let index = rd_u32(code, ip + 2);
                // Direct calls reference an inner function by index; the
                // callee cell is created on the spot without captures.
                // Allocation comes first: the registers it may move are
                // read only afterwards.
                let callee = throwing!(function::new_closure(
                    rt,
                    func.module,
                    index,
                    Value::undefined()
                ));
                let this = reg![rd_u8(code, ip + 6)];
                let arg_start = rd_u8(code, ip + 7);
                let argc = rd_u8(code, ip + 8) as usize;
                let args: Vec<Value> = (0..argc).map(|i| reg![arg_start as usize + i]).collect();
                throwing!(begin_call(
                    rt, &mut fp, &mut func, &mut ip, &mut base, callee, this, &args, false,
                ));
            }
            Opcode::Ret => {
                let src = rd_u8(code, ip + 1);
                let mut value = reg![src];
                // A construct frame whose body returns a non-object keeps
                // the receiver.
                if !rt.stack.values[fp + FRAME_NEW_TARGET].is_undefined()
                    && object::as_object(value).is_none()
                {
                    value = rt.stack.values[fp + FRAME_THIS];
                }
                let saved_fp = rt.stack.values[fp + FRAME_SAVED_FP].as_native_u32();
                let saved_ip = rt.stack.values[fp + FRAME_SAVED_IP].as_native_u32() as usize;
                let saved_code = rt.stack.values[fp + FRAME_SAVED_CODE].as_native_u32();
                rt.stack.sp = fp;
                if saved_fp == NO_CALLER {
                    return Ok(value);
                }
                fp = saved_fp as usize;
                rt.current_fp = fp;
                let (module, function) = decode_code_word(saved_code);
                func = Rc::clone(&rt.modules[module as usize].functions[function as usize]);
                base = rt.stack.locals_base(fp);
                // The caller's destination register is the call
                // instruction's first operand.
                let dst = func.code[saved_ip + 1];
                rt.stack.values[base + dst as usize] = value;
                let call_op =
                    Opcode::from_u8(func.code[saved_ip]).expect("validated caller bytecode");
                ip = saved_ip + call_op.width();
            }

            // -- Exceptions and safepoints --
            Opcode::Throw => {
                let src = rd_u8(code, ip + 1);
                let value = reg![src];
                throwing!(throw_value(rt, value));
            }
            Opcode::Catch => {
                let dst = rd_u8(code, ip + 1);
                debug_assert!(
                    !rt.globals.thrown.is_empty(),
                    "Catch executed with no pending exception"
                );
                reg![dst] = std::mem::replace(&mut rt.globals.thrown, Value::empty());
                ip += op.width();
            }
            Opcode::Debugger => {
                if let Some(mut callback) = rt.debugger.take() {
                    callback(rt);
                    rt.debugger = Some(callback);
                }
                ip += op.width();
            }
            Opcode::AsyncBreakCheck => {
                safepoint(rt);
                ip += op.width();
            }
        }
    }
}

/// Set the thrown slot and populate `stack` on Error-flagged objects.
fn throw_value(rt: &mut Runtime, value: Value) -> JsResult<()> {
    if let Some(cell) = object::as_object(value) {
        // SAFETY: live object.
        if unsafe { object::object_ref(cell) }.flags & obj_flags::ERROR != 0 {
            let populate = rt.with_scope(|rt| {
                let h_value = rt.handles.new_handle(value);
                let stack_text = rt.capture_stack().join("\n");
                let stack = strings::new_string(rt, &stack_text)?;
                let value = rt.handles.get(h_value);
                object::define_own_property(
                    rt,
                    value,
                    Predefined::Stack.symbol(),
                    stack,
                    prop_flags::BUILTIN,
                )?;
                Ok(rt.handles.get(h_value))
            });
            rt.globals.thrown = match populate {
                Ok(value) => value,
                // Stack population failed (OOM); the original error value
                // still throws.
                Err(Thrown) => rt.pending_exception().unwrap_or(value),
            };
            return Err(Thrown);
        }
    }
    rt.globals.thrown = value;
    Err(Thrown)
}

/// Between-opcode safepoint: async pause requests and sampler reads.
fn safepoint(rt: &mut Runtime) {
    if rt.pending_break.swap(false, std::sync::atomic::Ordering::Relaxed) {
        if let Some(mut callback) = rt.debugger.take() {
            callback(rt);
            rt.debugger = Some(callback);
        }
    }
    if rt
        .sample_requested
        .swap(false, std::sync::atomic::Ordering::Relaxed)
    {
        if let Some(mut sampler) = rt.sampler.take() {
            let frames = rt.frame_chain();
            sampler(&frames);
            rt.sampler = Some(sampler);
        }
    }
}

/// IEEE remainder with truncation semantics; Rust's `%` matches JS here.
fn js_mod(x: f64, y: f64) -> f64 {
    x % y
}

fn slow_add(rt: &mut Runtime, a: Value, b: Value) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let h_b = rt.handles.new_handle(b);
        let pa = operations::to_primitive(rt, a, PreferredType::Default)?;
        let h_pa = rt.handles.new_handle(pa);
        let b = rt.handles.get(h_b);
        let pb = operations::to_primitive(rt, b, PreferredType::Default)?;
        let pa = rt.handles.get(h_pa);

        if pa.is_string() || pb.is_string() {
            let h_pb = rt.handles.new_handle(pb);
            let sa = operations::to_string_value(rt, pa)?;
            let h_sa = rt.handles.new_handle(sa);
            let pb = rt.handles.get(h_pb);
            let sb = operations::to_string_value(rt, pb)?;
            let sa = rt.handles.get(h_sa);
            strings::concat(rt, sa, sb)
        } else {
            // Primitives; numeric coercion cannot allocate.
            let na = operations::to_number(rt, pa)?;
            let nb = operations::to_number(rt, pb)?;
            Ok(Value::number(na + nb))
        }
    })
}

fn slow_numeric(
    rt: &mut Runtime,
    a: Value,
    b: Value,
    f: impl Fn(f64, f64) -> f64,
) -> JsResult<Value> {
    rt.with_scope(|rt| {
        let h_b = rt.handles.new_handle(b);
        let x = operations::to_number(rt, a)?;
        let b = rt.handles.get(h_b);
        let y = operations::to_number(rt, b)?;
        Ok(Value::number(f(x, y)))
    })
}

// -- Property access helpers --

fn get_by_id(
    rt: &mut Runtime,
    func: &FunctionRecord,
    receiver: Value,
    sym: SymbolId,
    cache_index: u8,
    must_exist: bool,
) -> JsResult<Value> {
    // Primitive receivers: strings answer `length`; null/undefined throw.
    if receiver.is_string() {
        if sym == Predefined::Length.symbol() {
            return Ok(Value::number(string_length(receiver)));
        }
        return Ok(Value::undefined());
    }
    if receiver.is_undefined() || receiver.is_null() {
        return Err(rt.raise_with_name(
            ErrorKind::TypeError,
            "cannot read property of null or undefined",
            sym,
        ));
    }
    let Some(cell) = object::as_object(receiver) else {
        // Number/boolean/symbol receivers have no prototypes in the core.
        return Ok(Value::undefined());
    };
    // SAFETY: live object.
    let obj = unsafe { object::object_ref(cell) };
    if obj.flags & obj_flags::INDEXED != 0 && sym == Predefined::Length.symbol() {
        return Ok(Value::number(object::indexed_length(cell) as f64));
    }
    let class = obj.class.expect("initialized object");

    // Cache hit: read the slot directly.
    let entry = rt.modules[func.module as usize].caches[func.index as usize]
        .get(cache_index as usize)
        .copied()
        .unwrap_or_default();
    if entry.matches(class) {
        rt.cache_stats.hits += 1;
        // SAFETY: a hit certifies the slot for this class.
        return Ok(unsafe { object::read_slot(cell, entry.slot) });
    }

    // Own lookup, then the prototype chain.
    if let Some((slot, _flags)) = object::get_own_property(rt, cell, sym) {
        // SAFETY: the class is live until the next allocation.
        let cacheable = !unsafe { crate::hidden_class::class_ref(class) }.is_dictionary();
        if cacheable {
            if let Some(entry) = rt.modules[func.module as usize].caches[func.index as usize]
                .get_mut(cache_index as usize)
            {
                entry.fill(class, slot);
                rt.cache_stats.misses += 1;
            }
        }
        // SAFETY: slot from the object's own class.
        return Ok(unsafe { object::read_slot(cell, slot) });
    }
    if let Some(value) = object::get_property(rt, cell, sym) {
        return Ok(value);
    }
    if must_exist {
        return Err(rt.raise_with_name(ErrorKind::ReferenceError, "variable is not defined", sym));
    }
    Ok(Value::undefined())
}

fn put_by_id(
    rt: &mut Runtime,
    func: &FunctionRecord,
    receiver: Value,
    sym: SymbolId,
    value: Value,
    cache_index: u8,
    global_ref: bool,
) -> JsResult<()> {
    let strict = func.header.strict;
    let Some(cell) = object::as_object(receiver) else {
        return if strict {
            Err(rt.raise(ErrorKind::TypeError, "cannot set property on a primitive"))
        } else {
            Ok(())
        };
    };
    // Global-reference stores: assigning an undeclared name is a
    // ReferenceError in strict mode (non-strict creates the global).
    if global_ref && strict && !object::has_property(rt, cell, sym) {
        return Err(rt.raise_with_name(
            ErrorKind::ReferenceError,
            "assignment to undeclared variable",
            sym,
        ));
    }
    // SAFETY: live object.
    let class = unsafe { object::object_ref(cell) }
        .class
        .expect("initialized object");

    let entry = rt.modules[func.module as usize].caches[func.index as usize]
        .get(cache_index as usize)
        .copied()
        .unwrap_or_default();
    if entry.matches(class) {
        rt.cache_stats.hits += 1;
        // SAFETY: the cache only holds writable data slots for this class.
        unsafe { object::write_slot(cell, entry.slot, value) };
        return Ok(());
    }

    // The store may allocate (storage growth, class transitions) and
    // move the receiver; track it through a handle for the refill below.
    let receiver = rt.with_scope(|rt| {
        let h_receiver = rt.handles.new_handle(receiver);
        object::set_property(rt, receiver, sym, value, strict)?;
        Ok(rt.handles.get(h_receiver))
    })?;

    // Refill for an existing writable own property on a shared class.
    let cell = object::as_object(receiver).expect("receiver is still an object");
    // SAFETY: live object (possibly moved; re-derived above).
    let class = unsafe { object::object_ref(cell) }
        .class
        .expect("initialized object");
    // SAFETY: live class.
    if !unsafe { crate::hidden_class::class_ref(class) }.is_dictionary() {
        if let Some((slot, flags)) = object::get_own_property(rt, cell, sym) {
            if flags & prop_flags::WRITABLE != 0 {
                if let Some(entry) = rt.modules[func.module as usize].caches
                    [func.index as usize]
                    .get_mut(cache_index as usize)
                {
                    entry.fill(class, slot);
                    rt.cache_stats.misses += 1;
                }
            }
        }
    }
    Ok(())
}

/// Lookup through the fixed named cache: the VM-internal cache array for
/// well-known names, used by paths that carry no per-site cache index.
fn get_well_known(
    rt: &mut Runtime,
    cell: heron_vm_heap::cell::CellPtr,
    sym: SymbolId,
    named_index: usize,
) -> Option<Value> {
    // SAFETY: caller-provided live object.
    let class = unsafe { object::object_ref(cell) }
        .class
        .expect("initialized object");
    let entry = rt.named_caches[named_index];
    if entry.matches(class) {
        rt.cache_stats.hits += 1;
        // SAFETY: a hit certifies the slot for this class.
        return Some(unsafe { object::read_slot(cell, entry.slot) });
    }
    if let Some((slot, _flags)) = object::get_own_property(rt, cell, sym) {
        // SAFETY: live class.
        if !unsafe { crate::hidden_class::class_ref(class) }.is_dictionary() {
            rt.named_caches[named_index].fill(class, slot);
            rt.cache_stats.misses += 1;
        }
        // SAFETY: slot from the object's own class.
        return Some(unsafe { object::read_slot(cell, slot) });
    }
    None
}

/// A computed key, split into index and named forms.
enum Key {
    Index(u32),
    Name(SymbolId),
}

fn to_key(rt: &mut Runtime, key: Value) -> JsResult<Key> {
    if key.is_number() {
        let n = key.as_number();
        if n.fract() == 0.0 && n >= 0.0 && n < u32::MAX as f64 {
            return Ok(Key::Index(n as u32));
        }
    }
    let name = operations::to_string_value(rt, key)?;
    // Copied out before anything else can allocate.
    let text = strings::to_rust_string(name);
    if let Ok(index) = text.parse::<u32>() {
        if index != u32::MAX {
            return Ok(Key::Index(index));
        }
    }
    Ok(Key::Name(rt.identifiers.intern(&text)))
}

fn get_by_val(rt: &mut Runtime, receiver: Value, key: Value) -> JsResult<Value> {
    if receiver.is_string() {
        // Strings answer length and code-unit indexing.
        return rt.with_scope(|rt| {
            let h_receiver = rt.handles.new_handle(receiver);
            let key = to_key(rt, key)?;
            let receiver = rt.handles.get(h_receiver);
            match key {
                Key::Index(i) => {
                    // Copied out before the allocation below.
                    let text = strings::to_rust_string(receiver);
                    match text.encode_utf16().nth(i as usize) {
                        Some(unit) => {
                            let text = String::from_utf16_lossy(&[unit]);
                            strings::new_string(rt, &text)
                        }
                        None => Ok(Value::undefined()),
                    }
                }
                Key::Name(sym) if sym == Predefined::Length.symbol() => {
                    Ok(Value::number(string_length(receiver)))
                }
                Key::Name(_) => Ok(Value::undefined()),
            }
        });
    }
    if receiver.is_undefined() || receiver.is_null() {
        return Err(rt.raise(
            ErrorKind::TypeError,
            "cannot read property of null or undefined",
        ));
    }
    let (key, receiver) = rt.with_scope(|rt| {
        let h_receiver = rt.handles.new_handle(receiver);
        let key = to_key(rt, key)?;
        Ok((key, rt.handles.get(h_receiver)))
    })?;
    let Some(cell) = object::as_object(receiver) else {
        return Ok(Value::undefined());
    };
    match key {
        Key::Index(index) => {
            if let Some(value) = object::get_indexed(cell, index) {
                return Ok(value);
            }
            // Fall back to a named lookup ("0" stored as a named prop).
            let sym = rt.identifiers.intern(&index.to_string());
            Ok(object::get_property(rt, cell, sym).unwrap_or_else(Value::undefined))
        }
        Key::Name(sym) => {
            if sym == Predefined::Length.symbol() {
                // SAFETY: live object.
                if unsafe { object::object_ref(cell) }.flags & obj_flags::INDEXED != 0 {
                    return Ok(Value::number(object::indexed_length(cell) as f64));
                }
                // Computed access carries no cache index; the fixed named
                // cache covers `length` on ordinary objects.
                if let Some(value) = get_well_known(rt, cell, sym, NAMED_CACHE_LENGTH) {
                    return Ok(value);
                }
            }
            Ok(object::get_property(rt, cell, sym).unwrap_or_else(Value::undefined))
        }
    }
}

fn put_by_val(
    rt: &mut Runtime,
    receiver: Value,
    key: Value,
    value: Value,
    strict: bool,
) -> JsResult<()> {
    rt.with_scope(|rt| {
        let h_receiver = rt.handles.new_handle(receiver);
        let h_value = rt.handles.new_handle(value);
        let key = to_key(rt, key)?;
        let receiver = rt.handles.get(h_receiver);
        let value = rt.handles.get(h_value);
        let Some(cell) = object::as_object(receiver) else {
            return if strict {
                Err(rt.raise(ErrorKind::TypeError, "cannot set property on a primitive"))
            } else {
                Ok(())
            };
        };
        match key {
            // SAFETY: live object.
            Key::Index(index)
                if unsafe { object::object_ref(cell) }.flags & obj_flags::INDEXED != 0 =>
            {
                object::set_indexed(rt, receiver, index, value)
            }
            Key::Index(index) => {
                let sym = rt.identifiers.intern(&index.to_string());
                object::set_property(rt, receiver, sym, value, strict)
            }
            Key::Name(sym) => object::set_property(rt, receiver, sym, value, strict),
        }
    })
}

fn del_by_val(rt: &mut Runtime, receiver: Value, key: Value, strict: bool) -> JsResult<bool> {
    let (key, receiver) = rt.with_scope(|rt| {
        let h_receiver = rt.handles.new_handle(receiver);
        let key = to_key(rt, key)?;
        Ok((key, rt.handles.get(h_receiver)))
    })?;
    let Some(cell) = object::as_object(receiver) else {
        return Err(rt.raise(ErrorKind::TypeError, "cannot delete property of non-object"));
    };
    match key {
        Key::Index(index) => {
            // SAFETY: live object.
            if unsafe { object::object_ref(cell) }.flags & obj_flags::INDEXED != 0 {
                if object::get_indexed(cell, index).is_some() {
                    // Punch a hole; length is unchanged by delete.
                    let storage =
                        unsafe { object::object_ref(cell) }.indexed.expect("indexed object");
                    // SAFETY: index verified in range by get_indexed.
                    unsafe {
                        *IndexedStorageCell::slot_ptr(storage, index) = Value::empty();
                    }
                }
                return Ok(true);
            }
            let sym = rt.identifiers.intern(&index.to_string());
            object::delete_property(rt, receiver, sym, strict)
        }
        Key::Name(sym) => object::delete_property(rt, receiver, sym, strict),
    }
}

// -- Literals --

fn literal_to_value(rt: &mut Runtime, module: u32, literal: LiteralValue) -> JsResult<Value> {
    Ok(match literal {
        LiteralValue::Undefined => Value::undefined(),
        LiteralValue::Null => Value::null(),
        LiteralValue::Bool(b) => Value::bool(b),
        LiteralValue::Number(n) => Value::number(n),
        LiteralValue::String(index) => module_string(rt, module, index)?,
    })
}

fn new_object_with_buffer(
    rt: &mut Runtime,
    module: u32,
    key_offset: u32,
    value_offset: u32,
    count: u16,
) -> JsResult<Value> {
    // Decode the packed pairs up front; the buffers live in the module
    // instance and reading them borrows rt.
    let mut pairs = Vec::with_capacity(count as usize);
    {
        let instance = &rt.modules[module as usize];
        let mut keys = LiteralReader::at(&instance.object_key_buffer, key_offset);
        let mut values = LiteralReader::at(&instance.object_value_buffer, value_offset);
        for _ in 0..count {
            let key = match keys.next_value() {
                Ok(LiteralValue::String(index)) => index,
                _ => rt.fatal("corrupt object literal key buffer"),
            };
            let Ok(value) = values.next_value() else {
                rt.fatal("corrupt object literal value buffer")
            };
            pairs.push((key, value));
        }
    }

    rt.with_scope(|rt| {
        let obj = object::new_object(rt, rt.globals.object_prototype)?;
        let h_obj = rt.handles.new_handle(obj);
        for (key_index, literal) in pairs {
            let sym = resolve_symbol(rt, module, key_index);
            let value = literal_to_value(rt, module, literal)?;
            let obj = rt.handles.get(h_obj);
            object::define_own_property(rt, obj, sym, value, prop_flags::DEFAULT)?;
        }
        Ok(rt.handles.get(h_obj))
    })
}

fn new_array_with_buffer(
    rt: &mut Runtime,
    module: u32,
    offset: u32,
    count: u16,
) -> JsResult<Value> {
    let mut literals = Vec::with_capacity(count as usize);
    {
        let instance = &rt.modules[module as usize];
        let mut reader = LiteralReader::at(&instance.array_buffer, offset);
        for _ in 0..count {
            let Ok(value) = reader.next_value() else {
                rt.fatal("corrupt array literal buffer")
            };
            literals.push(value);
        }
    }

    rt.with_scope(|rt| {
        let array = object::new_array(rt, count as u32)?;
        let h_array = rt.handles.new_handle(array);
        for (i, literal) in literals.into_iter().enumerate() {
            let value = literal_to_value(rt, module, literal)?;
            let array = rt.handles.get(h_array);
            object::set_indexed(rt, array, i as u32, value)?;
        }
        Ok(rt.handles.get(h_array))
    })
}

/// Allocate the receiver for a construct call from the constructor's
/// `prototype` property.
fn create_this(rt: &mut Runtime, callee: Value) -> JsResult<Value> {
    let Some(cell) = object::as_object(callee) else {
        return Err(rt.raise(ErrorKind::TypeError, "constructor is not an object"));
    };
    if !function::is_callable(callee) {
        return Err(rt.raise(ErrorKind::TypeError, "constructor is not callable"));
    }
    let proto = get_well_known(rt, cell, Predefined::Prototype.symbol(), NAMED_CACHE_PROTOTYPE)
        .or_else(|| object::get_property(rt, cell, Predefined::Prototype.symbol()))
        .filter(|v| object::as_object(*v).is_some())
        .unwrap_or(rt.globals.object_prototype);
    object::new_object(rt, proto)
}

// -- Iteration helpers --

fn get_pname_list(rt: &mut Runtime, receiver: Value) -> JsResult<(Value, u32)> {
    if receiver.is_undefined() || receiver.is_null() {
        // for-in over nothing: an empty snapshot.
        let cell = rt.alloc_cell(CellKind::PropNameList, PropNameListCell::alloc_size(0))?;
        // SAFETY: fresh allocation.
        unsafe {
            (*cell.cast::<PropNameListCell>()).len = 0;
            (*cell.cast::<PropNameListCell>())._pad = 0;
        }
        return Ok((Value::object(cell), 0));
    }
    let Some(obj) = object::as_object(receiver) else {
        return Err(rt.raise(ErrorKind::TypeError, "for-in target is not an object"));
    };
    // Snapshot keys as Rust strings first (no heap churn while walking).
    let keys = object::own_enumerable_keys(rt, obj);
    let mut names: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        match key {
            object::PropKey::Index(i) => names.push(i.to_string()),
            object::PropKey::Name(sym) => names.push(rt.identifiers.text(sym).to_owned()),
        }
    }

    let len = names.len() as u32;
    rt.with_scope(|rt| {
        let cell = rt.alloc_cell(CellKind::PropNameList, PropNameListCell::alloc_size(len))?;
        // SAFETY: fresh allocation; all slots initialized before the next
        // allocation can move anything.
        unsafe {
            (*cell.cast::<PropNameListCell>()).len = len;
            (*cell.cast::<PropNameListCell>())._pad = 0;
            for i in 0..len {
                *PropNameListCell::slot_ptr(cell, i) = Value::empty();
            }
        }
        let h_list = rt.handles.new_handle(Value::object(cell));
        for (i, name) in names.iter().enumerate() {
            let s = strings::new_string(rt, name)?;
            let list = rt.handles.get(h_list).as_cell();
            // SAFETY: the handle tracks the (possibly moved) list cell.
            unsafe {
                heron_vm_heap::barrier::write_value_slot(
                    PropNameListCell::slot_ptr(list, i as u32),
                    s,
                );
            }
        }
        Ok((rt.handles.get(h_list), len))
    })
}

fn get_next_pname(
    rt: &mut Runtime,
    props: Value,
    receiver: Value,
    mut index: u32,
    size: u32,
) -> JsResult<(Value, u32)> {
    let list = props.as_cell();
    while index < size {
        // SAFETY: the list is a live PropNameList created by GetPNameList.
        let name = unsafe { *PropNameListCell::slot_ptr(list, index) };
        index += 1;
        if name.is_empty() {
            continue;
        }
        // Skip properties deleted since iteration started.
        let still_there = match object::as_object(receiver) {
            Some(obj) => {
                // SAFETY: name strings are live.
                let text = strings::to_rust_string(name);
                match text.parse::<u32>() {
                    Ok(i) => object::get_indexed(obj, i).is_some() || {
                        let sym = rt.identifiers.intern(&text);
                        object::has_property(rt, obj, sym)
                    },
                    Err(_) => {
                        let sym = rt.identifiers.intern(&text);
                        object::has_property(rt, obj, sym)
                    }
                }
            }
            None => false,
        };
        if still_there {
            return Ok((name, index));
        }
    }
    Ok((Value::undefined(), index))
}

// -- Call setup --

/// Begin a call from inside the loop. Host callees complete immediately
/// (result written to the destination register, ip advanced); JS callees
/// get a frame and the loop continues at their entry.
#[allow(clippy::too_many_arguments)]
fn begin_call(
    rt: &mut Runtime,
    fp: &mut usize,
    func: &mut Rc<FunctionRecord>,
    ip: &mut usize,
    base: &mut usize,
    callee: Value,
    this: Value,
    args: &[Value],
    construct: bool,
) -> JsResult<()> {
    let call_op = Opcode::from_u8(func.code[*ip]).expect("validated bytecode");
    let dst = func.code[*ip + 1];

    // Unwrap bound functions, accumulating leading arguments.
    let mut callee = callee;
    let mut this = this;
    let mut merged: Option<Vec<Value>> = None;
    loop {
        let Some(cell) = object::as_object(callee) else {
            return Err(rt.raise(ErrorKind::TypeError, "value is not callable"));
        };
        // SAFETY: live object-like cell.
        let kind = CellKind::from_u8(unsafe { cell.header() }.kind())
            .expect("object-like cell has a core kind");
        if kind != CellKind::BoundFunction {
            break;
        }
        // SAFETY: kind checked.
        let bound = unsafe { &*cell.cast::<BoundFunctionCell>() };
        if !construct {
            this = bound.bound_this;
        }
        let mut all = Vec::new();
        if let Some(storage) = bound.bound_args {
            // SAFETY: bound args are IndexedStorage cells.
            let len = unsafe { (*storage.cast::<IndexedStorageCell>()).len };
            for i in 0..len {
                // SAFETY: slots 0..len initialized.
                all.push(unsafe { *IndexedStorageCell::slot_ptr(storage, i) });
            }
        }
        all.extend_from_slice(merged.as_deref().unwrap_or(args));
        merged = Some(all);
        callee = bound
            .target
            .map(Value::object)
            .unwrap_or_else(Value::undefined);
    }
    let args = merged.as_deref().unwrap_or(args);

    let cell = object::as_object(callee).expect("unwrapped callable");
    // SAFETY: live object-like cell.
    let kind = CellKind::from_u8(unsafe { cell.header() }.kind())
        .expect("object-like cell has a core kind");

    match kind {
        CellKind::NativeFunction => {
            let result = call_native(rt, cell, this, args)?;
            *base = rt.stack.locals_base(*fp);
            rt.stack.values[*base + dst as usize] = result;
            *ip += call_op.width();
            Ok(())
        }
        CellKind::Closure => {
            // SAFETY: kind checked.
            let (module, index) = unsafe {
                let c = &*cell.cast::<ClosureCell>();
                (c.module, c.function)
            };
            let callee_func = resolve_function(rt, module, index)?;
            if let Some(entry) = note_call_and_jit(rt, module, index)? {
                // The JIT tier is transparent: construct calls get their
                // receiver and return-value selection exactly as the
                // interpreted frame path gives them.
                let result = if construct {
                    jit_construct_call(rt, entry, callee, args)?
                } else {
                    jit_call(rt, entry, this, args)?
                };
                *base = rt.stack.locals_base(*fp);
                rt.stack.values[*base + dst as usize] = result;
                *ip += call_op.width();
                return Ok(());
            }

            // Stack overflow is detected before the frame is written.
            let new_fp = rt.stack.sp;
            let needed = FRAME_FIXED + args.len() + callee_func.header.frame_size as usize;
            if new_fp + needed > rt.stack.capacity() {
                return Err(rt.raise(ErrorKind::RangeError, "maximum call stack size exceeded"));
            }

            rt.stack.values[new_fp + FRAME_SAVED_FP] = Value::native_u32(*fp as u32);
            rt.stack.values[new_fp + FRAME_SAVED_IP] = Value::native_u32(*ip as u32);
            rt.stack.values[new_fp + FRAME_SAVED_CODE] =
                Value::native_u32(encode_code_word(func.module, func.index));
            rt.stack.values[new_fp + FRAME_ARGC] = Value::native_u32(args.len() as u32);
            rt.stack.values[new_fp + FRAME_NEW_TARGET] = if construct {
                callee
            } else {
                Value::undefined()
            };
            rt.stack.values[new_fp + FRAME_CALLEE] = callee;
            rt.stack.values[new_fp + FRAME_THIS] = this;
            for (i, &arg) in args.iter().enumerate() {
                rt.stack.values[new_fp + FRAME_FIXED + i] = arg;
            }
            for i in 0..callee_func.header.frame_size as usize {
                rt.stack.values[new_fp + FRAME_FIXED + args.len() + i] = Value::undefined();
            }
            rt.stack.sp = new_fp + needed;

            // For `new`, the receiver is created after the frame roots the
            // callee and arguments, then patched into the `this` slot.
            if construct {
                let callee = rt.stack.values[new_fp + FRAME_CALLEE];
                match create_this(rt, callee) {
                    Ok(receiver) => rt.stack.values[new_fp + FRAME_THIS] = receiver,
                    Err(thrown) => {
                        // Abandon the half-entered frame before unwinding
                        // from the caller.
                        rt.stack.sp = new_fp;
                        return Err(thrown);
                    }
                }
            }

            *fp = new_fp;
            rt.current_fp = new_fp;
            *func = callee_func;
            *base = rt.stack.locals_base(new_fp);
            *ip = 0;
            Ok(())
        }
        _ => Err(rt.raise(ErrorKind::TypeError, "value is not callable")),
    }
}
