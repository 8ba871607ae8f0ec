//! Bytecode assembler.
//!
//! Used by tests and tools to produce modules without a front-end compiler.
//! Jump targets are labels patched at function finish; string and literal
//! interning is delegated to the module builder.

use crate::error::{BytecodeError, Result};
use crate::literal::{LiteralValue, write_literal};
use crate::module::{
    BytecodeModule, ExceptionEntry, FunctionDef, FunctionHeader, StringEntry,
};
use crate::opcode::Opcode;

/// Stable FNV-1a over identifier bytes; the runtime's identifier table
/// uses the same function, so precomputed hashes are directly usable.
pub fn hash_identifier(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A forward-referencable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

/// Builds a [`BytecodeModule`].
pub struct BytecodeBuilder {
    module: BytecodeModule,
}

impl BytecodeBuilder {
    /// Start a module for the given source URL.
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            module: BytecodeModule {
                source_url: source_url.into(),
                ..Default::default()
            },
        }
    }

    /// Intern a plain string; returns its table index.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        self.intern(s, false)
    }

    /// Intern an identifier-flagged string with a precomputed hash.
    pub fn intern_identifier(&mut self, s: &str) -> u32 {
        self.intern(s, true)
    }

    fn intern(&mut self, s: &str, identifier: bool) -> u32 {
        // Reuse an existing entry when the bytes match; upgrade the flag if
        // the same string is later used as an identifier.
        for (i, entry) in self.module.strings.iter_mut().enumerate() {
            let start = entry.offset as usize;
            let end = start + entry.len as usize;
            if &self.module.string_storage[start..end] == s.as_bytes() {
                if identifier && !entry.is_identifier {
                    entry.is_identifier = true;
                    self.module.identifier_hashes[i] = hash_identifier(s.as_bytes());
                }
                return i as u32;
            }
        }
        let offset = self.module.string_storage.len() as u32;
        self.module.string_storage.extend_from_slice(s.as_bytes());
        self.module.strings.push(StringEntry {
            offset,
            len: s.len() as u32,
            is_identifier: identifier,
        });
        self.module.identifier_hashes.push(if identifier {
            hash_identifier(s.as_bytes())
        } else {
            0
        });
        (self.module.strings.len() - 1) as u32
    }

    /// Append values to the array literal buffer; returns the offset for
    /// `NewArrayWithBuffer`.
    pub fn array_literal(&mut self, values: &[LiteralValue]) -> u32 {
        let offset = self.module.array_buffer.len() as u32;
        for &v in values {
            write_literal(&mut self.module.array_buffer, v);
        }
        offset
    }

    /// Append an object literal's keys and values; returns the
    /// `(key offset, value offset)` pair for `NewObjectWithBuffer`.
    pub fn object_literal(
        &mut self,
        entries: &[(&str, LiteralValue)],
    ) -> (u32, u32) {
        let key_offset = self.module.object_key_buffer.len() as u32;
        let value_offset = self.module.object_value_buffer.len() as u32;
        for &(key, value) in entries {
            let idx = self.intern_identifier(key);
            write_literal(&mut self.module.object_key_buffer, LiteralValue::String(idx));
            write_literal(&mut self.module.object_value_buffer, value);
        }
        (key_offset, value_offset)
    }

    /// Begin a function. `finish()` on the returned builder adds it to the
    /// module and yields its index.
    pub fn function(
        &mut self,
        name: &str,
        frame_size: u8,
        param_count: u8,
    ) -> FunctionBuilder<'_> {
        let name_idx = if name.is_empty() {
            u32::MAX
        } else {
            self.intern_string(name)
        };
        FunctionBuilder {
            builder: self,
            def: FunctionDef {
                name: name_idx,
                header: FunctionHeader {
                    frame_size,
                    param_count,
                    strict: false,
                    lazy: false,
                    env_size: 0,
                },
                code: Vec::new(),
                exceptions: Vec::new(),
                debug_offsets: None,
            },
            labels: Vec::new(),
            patches: Vec::new(),
            exception_labels: Vec::new(),
        }
    }

    /// Designate the global function.
    pub fn set_global_function(&mut self, index: u32) {
        self.module.global_function = index;
    }

    /// Finish and validate the module.
    pub fn build(self) -> BytecodeModule {
        self.module
            .validate()
            .expect("builder produced an invalid module");
        self.module
    }

    /// Finish without panicking on validation failure.
    pub fn try_build(self) -> Result<BytecodeModule> {
        self.module.validate()?;
        Ok(self.module)
    }
}

/// Assembles one function's code.
pub struct FunctionBuilder<'a> {
    builder: &'a mut BytecodeBuilder,
    def: FunctionDef,
    /// Bound label positions; `u32::MAX` = unbound
    labels: Vec<u32>,
    /// (operand position, instruction start, label) to patch at finish
    patches: Vec<(usize, usize, Label)>,
    /// Label-based exception ranges resolved at finish
    exception_labels: Vec<(Label, Label, Label)>,
}

impl<'a> FunctionBuilder<'a> {
    /// Mark the function strict-mode.
    pub fn set_strict(&mut self, strict: bool) {
        self.def.header.strict = strict;
    }

    /// Set the environment slot count for `CreateEnvironment`.
    pub fn set_env_size(&mut self, size: u8) {
        self.def.header.env_size = size;
    }

    /// Attach a debug offsets table.
    pub fn set_debug_offsets(&mut self, table: Vec<(u32, u32)>) {
        self.def.debug_offsets = Some(table);
    }

    /// Current bytecode offset.
    pub fn offset(&self) -> u32 {
        self.def.code.len() as u32
    }

    // -- Raw emission --

    /// Emit an opcode byte.
    pub fn emit_op(&mut self, op: Opcode) {
        self.def.code.push(op as u8);
    }

    /// Emit a register operand.
    pub fn emit_reg(&mut self, reg: u8) {
        self.def.code.push(reg);
    }

    /// Emit a u8 operand.
    pub fn emit_u8(&mut self, v: u8) {
        self.def.code.push(v);
    }

    /// Emit a u16 operand.
    pub fn emit_u16(&mut self, v: u16) {
        self.def.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a u32 operand.
    pub fn emit_u32(&mut self, v: u32) {
        self.def.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an i8 operand.
    pub fn emit_i8(&mut self, v: i8) {
        self.def.code.push(v as u8);
    }

    /// Emit an i32 operand.
    pub fn emit_i32(&mut self, v: i32) {
        self.def.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit an f64 operand.
    pub fn emit_f64(&mut self, v: f64) {
        self.def.code.extend_from_slice(&v.to_le_bytes());
    }

    // -- Labels --

    /// Create an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(u32::MAX);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind a label to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0 as usize] = self.offset();
    }

    fn emit_jump(&mut self, op: Opcode, cond: Option<u8>, target: Label) {
        let inst_start = self.def.code.len();
        self.emit_op(op);
        if let Some(reg) = cond {
            self.emit_reg(reg);
        }
        self.patches.push((self.def.code.len(), inst_start, target));
        self.emit_i32(0);
    }

    // -- Named helpers (the common opcodes tests assemble) --

    /// `dst = undefined`
    pub fn load_undefined(&mut self, dst: u8) {
        self.emit_op(Opcode::LoadUndefined);
        self.emit_reg(dst);
    }

    /// `dst = null`
    pub fn load_null(&mut self, dst: u8) {
        self.emit_op(Opcode::LoadNull);
        self.emit_reg(dst);
    }

    /// `dst = true`
    pub fn load_true(&mut self, dst: u8) {
        self.emit_op(Opcode::LoadTrue);
        self.emit_reg(dst);
    }

    /// `dst = false`
    pub fn load_false(&mut self, dst: u8) {
        self.emit_op(Opcode::LoadFalse);
        self.emit_reg(dst);
    }

    /// `dst = imm`
    pub fn load_int8(&mut self, dst: u8, imm: i8) {
        self.emit_op(Opcode::LoadInt8);
        self.emit_reg(dst);
        self.emit_i8(imm);
    }

    /// `dst = imm`
    pub fn load_int32(&mut self, dst: u8, imm: i32) {
        self.emit_op(Opcode::LoadInt32);
        self.emit_reg(dst);
        self.emit_i32(imm);
    }

    /// `dst = imm`
    pub fn load_double(&mut self, dst: u8, imm: f64) {
        self.emit_op(Opcode::LoadDouble);
        self.emit_reg(dst);
        self.emit_f64(imm);
    }

    /// `dst = strings[idx]`
    pub fn load_string(&mut self, dst: u8, idx: u32) {
        self.emit_op(Opcode::LoadString);
        self.emit_reg(dst);
        self.emit_u32(idx);
    }

    /// `dst = src`
    pub fn mov(&mut self, dst: u8, src: u8) {
        self.emit_op(Opcode::Mov);
        self.emit_reg(dst);
        self.emit_reg(src);
    }

    /// `dst = param[idx]` (0 is `this`)
    pub fn load_param(&mut self, dst: u8, idx: u8) {
        self.emit_op(Opcode::LoadParam);
        self.emit_reg(dst);
        self.emit_u8(idx);
    }

    /// `dst = the global object`
    pub fn get_global_object(&mut self, dst: u8) {
        self.emit_op(Opcode::GetGlobalObject);
        self.emit_reg(dst);
    }

    fn emit_abc(&mut self, op: Opcode, dst: u8, a: u8, b: u8) {
        self.emit_op(op);
        self.emit_reg(dst);
        self.emit_reg(a);
        self.emit_reg(b);
    }

    /// `dst = a + b`
    pub fn add(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_abc(Opcode::Add, dst, a, b);
    }

    /// `dst = a - b`
    pub fn sub(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_abc(Opcode::Sub, dst, a, b);
    }

    /// `dst = a * b`
    pub fn mul(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_abc(Opcode::Mul, dst, a, b);
    }

    /// `dst = a / b`
    pub fn div(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_abc(Opcode::Div, dst, a, b);
    }

    /// `dst = a % b`
    pub fn modulo(&mut self, dst: u8, a: u8, b: u8) {
        self.emit_abc(Opcode::Mod, dst, a, b);
    }

    /// Emit any three-register op (comparisons, bitwise).
    pub fn binary(&mut self, op: Opcode, dst: u8, a: u8, b: u8) {
        self.emit_abc(op, dst, a, b);
    }

    /// Emit a two-register op (Neg, BitNot, Not, TypeOf).
    pub fn unary(&mut self, op: Opcode, dst: u8, src: u8) {
        self.emit_op(op);
        self.emit_reg(dst);
        self.emit_reg(src);
    }

    /// Unconditional jump.
    pub fn jmp(&mut self, target: Label) {
        self.emit_jump(Opcode::Jmp, None, target);
    }

    /// Jump when truthy.
    pub fn jmp_true(&mut self, cond: u8, target: Label) {
        self.emit_jump(Opcode::JmpTrue, Some(cond), target);
    }

    /// Jump when falsy.
    pub fn jmp_false(&mut self, cond: u8, target: Label) {
        self.emit_jump(Opcode::JmpFalse, Some(cond), target);
    }

    /// Jump when undefined.
    pub fn jmp_undefined(&mut self, cond: u8, target: Label) {
        self.emit_jump(Opcode::JmpUndefined, Some(cond), target);
    }

    /// `dst = obj.[sym]` with a cache slot.
    pub fn get_by_id(&mut self, dst: u8, obj: u8, cache: u8, sym: u32) {
        self.emit_op(Opcode::GetById);
        self.emit_reg(dst);
        self.emit_reg(obj);
        self.emit_u8(cache);
        self.emit_u32(sym);
    }

    /// `dst = obj.[sym]`, ReferenceError when absent.
    pub fn try_get_by_id(&mut self, dst: u8, obj: u8, cache: u8, sym: u32) {
        self.emit_op(Opcode::TryGetById);
        self.emit_reg(dst);
        self.emit_reg(obj);
        self.emit_u8(cache);
        self.emit_u32(sym);
    }

    /// `obj.[sym] = src` with a cache slot.
    pub fn put_by_id(&mut self, obj: u8, src: u8, cache: u8, sym: u32) {
        self.emit_op(Opcode::PutById);
        self.emit_reg(obj);
        self.emit_reg(src);
        self.emit_u8(cache);
        self.emit_u32(sym);
    }

    /// `obj.[sym] = src` with global-reference semantics.
    pub fn try_put_by_id(&mut self, obj: u8, src: u8, cache: u8, sym: u32) {
        self.emit_op(Opcode::TryPutById);
        self.emit_reg(obj);
        self.emit_reg(src);
        self.emit_u8(cache);
        self.emit_u32(sym);
    }

    /// `dst = delete obj.[sym]`
    pub fn del_by_id(&mut self, dst: u8, obj: u8, sym: u32) {
        self.emit_op(Opcode::DelById);
        self.emit_reg(dst);
        self.emit_reg(obj);
        self.emit_u32(sym);
    }

    /// `dst = obj[key]`
    pub fn get_by_val(&mut self, dst: u8, obj: u8, key: u8) {
        self.emit_abc(Opcode::GetByVal, dst, obj, key);
    }

    /// `obj[key] = src`
    pub fn put_by_val(&mut self, obj: u8, key: u8, src: u8) {
        self.emit_abc(Opcode::PutByVal, obj, key, src);
    }

    /// `dst = delete obj[key]`
    pub fn del_by_val(&mut self, dst: u8, obj: u8, key: u8) {
        self.emit_abc(Opcode::DelByVal, dst, obj, key);
    }

    /// `dst = {}`
    pub fn new_object(&mut self, dst: u8) {
        self.emit_op(Opcode::NewObject);
        self.emit_reg(dst);
    }

    /// `dst = {literal}` from buffers.
    pub fn new_object_with_buffer(
        &mut self,
        dst: u8,
        key_offset: u32,
        value_offset: u32,
        count: u16,
    ) {
        self.emit_op(Opcode::NewObjectWithBuffer);
        self.emit_reg(dst);
        self.emit_u32(key_offset);
        self.emit_u32(value_offset);
        self.emit_u16(count);
    }

    /// `dst = new array(size)`
    pub fn new_array(&mut self, dst: u8, size: u16) {
        self.emit_op(Opcode::NewArray);
        self.emit_reg(dst);
        self.emit_u16(size);
    }

    /// `dst = [literal]` from the array buffer.
    pub fn new_array_with_buffer(&mut self, dst: u8, offset: u32, count: u16) {
        self.emit_op(Opcode::NewArrayWithBuffer);
        self.emit_reg(dst);
        self.emit_u32(offset);
        self.emit_u16(count);
    }

    /// `dst = receiver for a construct call of callee`
    pub fn create_this(&mut self, dst: u8, callee: u8) {
        self.emit_op(Opcode::CreateThis);
        self.emit_reg(dst);
        self.emit_reg(callee);
    }

    /// `dst = new environment(slots)`
    pub fn create_environment(&mut self, dst: u8, slots: u8) {
        self.emit_op(Opcode::CreateEnvironment);
        self.emit_reg(dst);
        self.emit_u8(slots);
    }

    /// `dst = environment `level` hops up
    pub fn get_environment(&mut self, dst: u8, level: u8) {
        self.emit_op(Opcode::GetEnvironment);
        self.emit_reg(dst);
        self.emit_u8(level);
    }

    /// `dst = env.slots[idx]`
    pub fn load_from_environment(&mut self, dst: u8, env: u8, idx: u8) {
        self.emit_op(Opcode::LoadFromEnvironment);
        self.emit_reg(dst);
        self.emit_reg(env);
        self.emit_u8(idx);
    }

    /// `env.slots[idx] = src`
    pub fn store_to_environment(&mut self, env: u8, idx: u8, src: u8) {
        self.emit_op(Opcode::StoreToEnvironment);
        self.emit_reg(env);
        self.emit_u8(idx);
        self.emit_reg(src);
    }

    /// `dst = closure(functions[func], env)`
    pub fn create_closure(&mut self, dst: u8, env: u8, func: u32) {
        self.emit_op(Opcode::CreateClosure);
        self.emit_reg(dst);
        self.emit_reg(env);
        self.emit_u32(func);
    }

    /// Begin for-in over obj.
    pub fn get_pname_list(&mut self, dst: u8, obj: u8, idx_dst: u8, size_dst: u8) {
        self.emit_op(Opcode::GetPNameList);
        self.emit_reg(dst);
        self.emit_reg(obj);
        self.emit_reg(idx_dst);
        self.emit_reg(size_dst);
    }

    /// Advance for-in.
    pub fn get_next_pname(&mut self, dst: u8, props: u8, obj: u8, idx: u8, size: u8) {
        self.emit_op(Opcode::GetNextPName);
        self.emit_reg(dst);
        self.emit_reg(props);
        self.emit_reg(obj);
        self.emit_reg(idx);
        self.emit_reg(size);
    }

    /// `dst = callee.call(this, args...)`
    pub fn call(&mut self, dst: u8, callee: u8, this: u8, arg_start: u8, argc: u8) {
        self.emit_op(Opcode::Call);
        self.emit_reg(dst);
        self.emit_reg(callee);
        self.emit_reg(this);
        self.emit_reg(arg_start);
        self.emit_u8(argc);
    }

    /// One-argument call.
    pub fn call1(&mut self, dst: u8, callee: u8, this: u8, a1: u8) {
        self.emit_op(Opcode::Call1);
        self.emit_reg(dst);
        self.emit_reg(callee);
        self.emit_reg(this);
        self.emit_reg(a1);
    }

    /// Two-argument call.
    pub fn call2(&mut self, dst: u8, callee: u8, this: u8, a1: u8, a2: u8) {
        self.emit_op(Opcode::Call2);
        self.emit_reg(dst);
        self.emit_reg(callee);
        self.emit_reg(this);
        self.emit_reg(a1);
        self.emit_reg(a2);
    }

    /// `dst = new callee(args...)`
    pub fn construct(&mut self, dst: u8, callee: u8, arg_start: u8, argc: u8) {
        self.emit_op(Opcode::Construct);
        self.emit_reg(dst);
        self.emit_reg(callee);
        self.emit_reg(arg_start);
        self.emit_u8(argc);
    }

    /// `dst = builtins[idx](args...)`
    pub fn call_builtin(&mut self, dst: u8, builtin: u8, arg_start: u8, argc: u8) {
        self.emit_op(Opcode::CallBuiltin);
        self.emit_reg(dst);
        self.emit_u8(builtin);
        self.emit_reg(arg_start);
        self.emit_u8(argc);
    }

    /// `dst = functions[func].call(this, args...)`
    pub fn call_direct(&mut self, dst: u8, func: u32, this: u8, arg_start: u8, argc: u8) {
        self.emit_op(Opcode::CallDirect);
        self.emit_reg(dst);
        self.emit_u32(func);
        self.emit_reg(this);
        self.emit_reg(arg_start);
        self.emit_u8(argc);
    }

    /// Return `src`.
    pub fn ret(&mut self, src: u8) {
        self.emit_op(Opcode::Ret);
        self.emit_reg(src);
    }

    /// Throw `src`.
    pub fn throw(&mut self, src: u8) {
        self.emit_op(Opcode::Throw);
        self.emit_reg(src);
    }

    /// `dst = pending thrown value` (handler entry).
    pub fn catch(&mut self, dst: u8) {
        self.emit_op(Opcode::Catch);
        self.emit_reg(dst);
    }

    /// Debugger safepoint.
    pub fn debugger(&mut self) {
        self.emit_op(Opcode::Debugger);
    }

    // -- Exception ranges --

    /// Register `[start, end)` with a handler at `target`, all labels.
    /// Entries are kept in registration order; register inner ranges first.
    pub fn exception_range(&mut self, start: Label, end: Label, target: Label) {
        self.exception_labels.push((start, end, target));
    }

    /// Patch labels, resolve exception ranges, append the function to the
    /// module, and return its index.
    pub fn finish(mut self) -> u32 {
        for &(operand_pos, inst_start, label) in &self.patches {
            let target = self.labels[label.0 as usize];
            assert_ne!(target, u32::MAX, "jump to unbound label");
            let rel = target as i64 - inst_start as i64;
            let rel = i32::try_from(rel).expect("jump offset overflows i32");
            self.def.code[operand_pos..operand_pos + 4]
                .copy_from_slice(&rel.to_le_bytes());
        }
        for &(start, end, target) in &self.exception_labels {
            let resolve = |l: Label| {
                let off = self.labels[l.0 as usize];
                assert_ne!(off, u32::MAX, "exception range label unbound");
                off
            };
            self.def.exceptions.push(ExceptionEntry {
                start: resolve(start),
                end: resolve(end),
                target: resolve(target),
            });
        }
        let index = self.builder.module.functions.len() as u32;
        self.builder.module.functions.push(self.def);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::validate_code;

    #[test]
    fn backward_jump_encodes_negative_offset() {
        let mut b = BytecodeBuilder::new("t.js");
        let mut f = b.function("loop", 2, 0);
        let top = f.label();
        f.bind(top);
        f.load_int8(0, 1);
        f.jmp(top);
        let idx = f.finish();
        b.set_global_function(idx);
        let module = b.build();

        let code = &module.functions[0].code;
        validate_code(code).unwrap();
        // Jmp starts after the 3-byte LoadInt8; offset is -3.
        let off = i32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!(off, -3);
    }

    #[test]
    fn string_interning_dedupes_and_upgrades() {
        let mut b = BytecodeBuilder::new("t.js");
        let a = b.intern_string("x");
        let c = b.intern_identifier("x");
        assert_eq!(a, c);
        let module = b.module;
        assert!(module.strings[a as usize].is_identifier);
        assert_eq!(
            module.identifier_hashes[a as usize],
            hash_identifier(b"x")
        );
    }

    #[test]
    fn exception_labels_resolve_to_offsets() {
        let mut b = BytecodeBuilder::new("t.js");
        let mut f = b.function("main", 2, 0);
        let start = f.label();
        let end = f.label();
        let handler = f.label();
        f.bind(start);
        f.load_int8(0, 7);
        f.throw(0);
        f.bind(end);
        f.bind(handler);
        f.catch(1);
        f.ret(1);
        f.exception_range(start, end, handler);
        let idx = f.finish();
        b.set_global_function(idx);
        let module = b.build();

        let entry = module.functions[0].exceptions[0];
        assert_eq!(entry.start, 0);
        assert_eq!(entry.end, 5);
        assert_eq!(entry.target, 5);
    }
}
