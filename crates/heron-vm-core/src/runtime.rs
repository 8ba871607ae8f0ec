//! The runtime: one heap, one value stack, one identifier table, and the
//! fixed root slots, owned by a single `Runtime` value that all code
//! threads explicitly. Multiple runtimes in a process are independent;
//! [`LockedRuntime`] adds the external mutex for hosts that share one
//! across threads.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use heron_vm_bytecode::opcode::validate_code;
use heron_vm_bytecode::{BytecodeProvider, ExceptionEntry, FunctionHeader, Opcode};
use heron_vm_heap::cell::{CellMetadata, CellPtr};
use heron_vm_heap::handles::{HandleId, HandleTable, ScopeToken};
use heron_vm_heap::heap::{Heap, HeapError};
use heron_vm_heap::roots::{RootSet, SlotAcceptor, SymbolMarkSet, WeakAcceptor};
use heron_vm_heap::storage::{StorageProvider, SystemStorageProvider};
use heron_vm_heap::value::{SymbolId, Value};
use heron_vm_heap::{GcConfig, GcStats};

use crate::error::{ErrorKind, JsError, JsResult, Thrown, VmError, VmResult};
use crate::function;
use crate::hidden_class;
use crate::identifiers::{IdentifierTable, Predefined};
use crate::inline_cache::{CacheStats, NAMED_CACHE_SIZE, PropertyCacheEntry};
use crate::interpreter;
use crate::kinds::{self, CellKind};
use crate::object::{self, ObjectCell, obj_flags, prop_flags};
use crate::operations;
use crate::stack::{FrameInfo, ValueStack};
use crate::strings;

/// Runtime construction knobs.
pub struct RuntimeConfig {
    /// Heap sizing and GC policy
    pub gc: GcConfig,
    /// Register capacity of the shared value stack
    pub stack_registers: usize,
    /// Native re-entry depth cap (host calls VM calls host ...)
    pub max_native_depth: u32,
    /// Allow `eval` (reserved for the compiler collaborator)
    pub enable_eval: bool,
    /// Allow ES6 symbol creation
    pub enable_symbols: bool,
    /// Arm the sampling-profiler safepoint checks
    pub enable_sample_profiler: bool,
    /// Reserved: randomize segment placement
    pub randomize_memory_layout: bool,
    /// Embedder cell kinds appended after the core kinds
    pub extra_metadata: Vec<CellMetadata>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            stack_registers: 64 * 1024,
            max_native_depth: 192,
            enable_eval: false,
            enable_symbols: true,
            enable_sample_profiler: false,
            randomize_memory_layout: false,
            extra_metadata: Vec::new(),
        }
    }
}

/// A registered host callback.
pub type HostFn = Rc<dyn Fn(&mut Runtime, Value, &[Value]) -> JsResult<Value>>;

pub(crate) struct HostFnRecord {
    pub name: String,
    #[allow(dead_code)]
    pub arity: u32,
    pub f: HostFn,
}

/// Hook compiling a lazy function on first call.
pub type CompileHook =
    Box<dyn FnMut(u32, u32) -> Option<heron_vm_bytecode::FunctionDef>>;

/// An opaque native entry point produced by a JIT collaborator.
pub type JitEntry = Rc<dyn Fn(&mut Runtime, Value, &[Value]) -> JsResult<Value>>;

/// Hook offered hot functions; returning an entry routes future calls to
/// native code.
pub type JitHook = Box<dyn FnMut(u32, u32) -> Option<JitEntry>>;

/// Call count at which a function is offered to the JIT hook.
pub(crate) const JIT_HOT_THRESHOLD: u32 = 128;

/// One loaded function: everything the dispatch loop needs, detached from
/// the provider.
pub(crate) struct FunctionRecord {
    pub code: Box<[u8]>,
    pub header: FunctionHeader,
    pub exceptions: Box<[ExceptionEntry]>,
    pub name: Box<str>,
    pub module: u32,
    pub index: u32,
    #[allow(dead_code)]
    pub debug_offsets: Option<Box<[(u32, u32)]>>,
}

/// One instantiated module.
pub(crate) struct ModuleInstance {
    pub functions: Vec<Rc<FunctionRecord>>,
    /// Interned symbol per string entry (INVALID for non-identifiers)
    pub symbols: Vec<SymbolId>,
    /// Raw string text per entry
    pub string_text: Vec<Box<str>>,
    /// Lazily created heap strings per entry (strong roots; empty =
    /// not yet created)
    pub string_values: Vec<Value>,
    /// Inline-cache slots per function
    pub caches: Vec<Box<[PropertyCacheEntry]>>,
    /// Interpreter call counts, for the JIT hook
    pub call_counts: Vec<u32>,
    /// JIT entries installed by the hook
    pub jit_entries: Vec<Option<JitEntry>>,
    pub array_buffer: Vec<u8>,
    pub object_key_buffer: Vec<u8>,
    pub object_value_buffer: Vec<u8>,
    pub global_function: u32,
    #[allow(dead_code)]
    pub source_url: String,
}

/// The fixed root slots.
pub(crate) struct RuntimeGlobals {
    pub global_object: Value,
    pub object_prototype: Value,
    pub function_prototype: Value,
    pub array_prototype: Value,
    pub error_prototype: Value,
    /// Root of the hidden-class transition tree
    pub class_root: Option<CellPtr>,
    /// Pending exception; `empty` means none
    pub thrown: Value,
    /// Preallocated RangeError for allocation failure
    pub oom_error: Value,
}

impl RuntimeGlobals {
    fn unset() -> RuntimeGlobals {
        RuntimeGlobals {
            global_object: Value::undefined(),
            object_prototype: Value::undefined(),
            function_prototype: Value::undefined(),
            array_prototype: Value::undefined(),
            error_prototype: Value::undefined(),
            class_root: None,
            thrown: Value::empty(),
            oom_error: Value::undefined(),
        }
    }
}

/// A Heron virtual machine instance.
pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) stack: ValueStack,
    pub(crate) identifiers: IdentifierTable,
    pub(crate) handles: HandleTable,
    pub(crate) globals: RuntimeGlobals,
    pub(crate) modules: Vec<ModuleInstance>,
    pub(crate) host_fns: Vec<HostFnRecord>,
    /// Builtin table: fixed slots `CallBuiltin` indexes without a lookup
    pub(crate) builtins: Vec<Value>,
    pub(crate) named_caches: [PropertyCacheEntry; NAMED_CACHE_SIZE],
    pub(crate) custom_roots: Vec<Box<dyn FnMut(&mut dyn SlotAcceptor)>>,
    pub(crate) config: RuntimeConfig,
    /// Current native re-entry depth
    pub(crate) native_depth: u32,
    /// Innermost frame pointer, `usize::MAX` when no JS is running
    pub(crate) current_fp: usize,
    /// Innermost instruction offset, maintained at opcode boundaries
    pub(crate) current_ip: u32,
    pub(crate) cache_stats: CacheStats,
    pub(crate) fatal_handler: Option<Box<dyn Fn(&str)>>,
    pub(crate) debugger: Option<Box<dyn FnMut(&mut Runtime)>>,
    pub(crate) pending_break: Arc<AtomicBool>,
    pub(crate) sampler: Option<Box<dyn FnMut(&[FrameInfo])>>,
    pub(crate) sample_requested: Arc<AtomicBool>,
    pub(crate) compile_hook: Option<CompileHook>,
    pub(crate) jit_hook: Option<JitHook>,
}

impl Runtime {
    /// Create a runtime with the default storage provider.
    pub fn new(config: RuntimeConfig) -> VmResult<Runtime> {
        Self::with_storage(config, Box::new(SystemStorageProvider))
    }

    /// Create a runtime on a custom storage provider.
    pub fn with_storage(
        mut config: RuntimeConfig,
        provider: Box<dyn StorageProvider>,
    ) -> VmResult<Runtime> {
        kinds::install(std::mem::take(&mut config.extra_metadata));
        let heap = Heap::new(config.gc.clone(), provider)
            .map_err(|e| VmError::Fatal(format!("heap bootstrap failed: {e}")))?;
        let stack_registers = config.stack_registers;
        let mut rt = Runtime {
            heap,
            stack: ValueStack::new(stack_registers),
            identifiers: IdentifierTable::new(),
            handles: HandleTable::new(),
            globals: RuntimeGlobals::unset(),
            modules: Vec::new(),
            host_fns: Vec::new(),
            builtins: Vec::new(),
            named_caches: [PropertyCacheEntry::default(); NAMED_CACHE_SIZE],
            custom_roots: Vec::new(),
            config,
            native_depth: 0,
            current_fp: usize::MAX,
            current_ip: 0,
            cache_stats: CacheStats::default(),
            fatal_handler: None,
            debugger: None,
            pending_break: Arc::new(AtomicBool::new(false)),
            sampler: None,
            sample_requested: Arc::new(AtomicBool::new(false)),
            compile_hook: None,
            jit_hook: None,
        };
        rt.bootstrap()
            .map_err(|_| VmError::Fatal("out of memory during runtime bootstrap".into()))?;
        Ok(rt)
    }

    fn bootstrap(&mut self) -> JsResult<()> {
        self.globals.class_root = Some(hidden_class::new_root_class(self)?);
        self.globals.object_prototype = object::new_object(self, Value::null())?;
        self.globals.function_prototype =
            object::new_object(self, self.globals.object_prototype)?;
        self.globals.array_prototype = object::new_object(self, self.globals.object_prototype)?;
        self.globals.error_prototype = object::new_object(self, self.globals.object_prototype)?;
        self.globals.global_object = object::new_object(self, self.globals.object_prototype)?;

        // `globalThis` and `undefined` as real globals. The global-object
        // value is re-read from its root slot after each allocating call.
        let global = self.globals.global_object;
        object::define_own_property(
            self,
            global,
            Predefined::GlobalThis.symbol(),
            global,
            prop_flags::BUILTIN,
        )?;
        let global = self.globals.global_object;
        object::define_own_property(
            self,
            global,
            Predefined::Undefined.symbol(),
            Value::undefined(),
            0, // non-writable, non-enumerable, non-configurable
        )?;

        self.globals.oom_error =
            self.make_error(ErrorKind::RangeError, "out of memory")?;
        tracing::debug!(
            stack_registers = self.stack.capacity(),
            "runtime bootstrapped"
        );
        Ok(())
    }

    // -- Allocation plumbing --

    /// Allocate a cell, running collections as needed. On exhaustion the
    /// preallocated RangeError is raised; provider failure is fatal.
    pub(crate) fn alloc_cell(&mut self, kind: CellKind, size: usize) -> JsResult<CellPtr> {
        let finalizable = matches!(kind, CellKind::HiddenClass);
        let Runtime {
            heap,
            stack,
            handles,
            globals,
            modules,
            builtins,
            named_caches,
            custom_roots,
            identifiers,
            ..
        } = self;
        let mut roots = RuntimeRoots {
            stack,
            handles,
            globals,
            modules,
            builtins,
            named_caches,
            custom_roots,
            identifiers,
        };
        match heap.allocate(kind as u8, size, finalizable, &mut roots) {
            Ok(cell) => Ok(cell),
            Err(HeapError::OutOfMemory) => {
                self.globals.thrown = self.globals.oom_error;
                Err(Thrown)
            }
            Err(HeapError::StorageExhausted) => {
                self.fatal("storage provider exhausted during collection")
            }
        }
    }

    /// Force a full collection.
    pub fn collect_garbage(&mut self) {
        let Runtime {
            heap,
            stack,
            handles,
            globals,
            modules,
            builtins,
            named_caches,
            custom_roots,
            identifiers,
            ..
        } = self;
        let mut roots = RuntimeRoots {
            stack,
            handles,
            globals,
            modules,
            builtins,
            named_caches,
            custom_roots,
            identifiers,
        };
        if heap.collect_full(&mut roots).is_err() {
            self.fatal("storage provider exhausted during collection");
        }
    }

    /// GC statistics.
    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    /// Inline-cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats
    }

    /// The heap, for snapshot writers.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // -- Error plumbing --

    /// Build an error object: `name`, `message`, and a `stack` capture.
    pub fn make_error(&mut self, kind: ErrorKind, message: &str) -> JsResult<Value> {
        self.with_scope(|rt| {
            let error = object::new_object(rt, rt.globals.error_prototype)?;
            let h_error = rt.handles.new_handle(error);
            if let Some(cell) = object::as_object(error) {
                // SAFETY: fresh live object; flag update only.
                unsafe { (*cell.cast::<ObjectCell>()).flags |= obj_flags::ERROR };
            }

            let name = strings::new_string(rt, kind.name())?;
            let error = rt.handles.get(h_error);
            object::define_own_property(
                rt,
                error,
                Predefined::Name.symbol(),
                name,
                prop_flags::BUILTIN,
            )?;

            let message = strings::new_string(rt, message)?;
            let error = rt.handles.get(h_error);
            object::define_own_property(
                rt,
                error,
                Predefined::Message.symbol(),
                message,
                prop_flags::BUILTIN,
            )?;

            let stack_text = rt.capture_stack().join("\n");
            let stack = strings::new_string(rt, &stack_text)?;
            let error = rt.handles.get(h_error);
            object::define_own_property(
                rt,
                error,
                Predefined::Stack.symbol(),
                stack,
                prop_flags::BUILTIN,
            )?;

            Ok(rt.handles.get(h_error))
        })
    }

    /// Raise a VM-originated error: builds the error object, stores it in
    /// the thrown slot, returns the marker.
    pub(crate) fn raise(&mut self, kind: ErrorKind, message: &str) -> Thrown {
        match self.make_error(kind, message) {
            Ok(error) => self.globals.thrown = error,
            // Allocation failed while building the error; the OOM error is
            // already in the thrown slot.
            Err(Thrown) => {}
        }
        Thrown
    }

    /// Raise with the offending property name appended.
    pub(crate) fn raise_with_name(
        &mut self,
        kind: ErrorKind,
        message: &str,
        sym: SymbolId,
    ) -> Thrown {
        let name = self
            .identifiers
            .try_text(sym)
            .unwrap_or("<unknown>")
            .to_owned();
        self.raise(kind, &format!("{message} '{name}'"))
    }

    /// The pending thrown value, if any.
    pub fn pending_exception(&self) -> Option<Value> {
        if self.globals.thrown.is_empty() {
            None
        } else {
            Some(self.globals.thrown)
        }
    }

    /// Take the pending exception and render it for the embedder.
    pub(crate) fn take_js_error(&mut self) -> JsError {
        let value = std::mem::replace(&mut self.globals.thrown, Value::empty());
        let message = self.render_error_message(value);
        let stack = self.read_error_stack(value);
        JsError { message, stack }
    }

    fn render_error_message(&mut self, value: Value) -> String {
        if let Some(cell) = object::as_object(value) {
            // SAFETY: live object.
            if unsafe { object::object_ref(cell) }.flags & obj_flags::ERROR != 0 {
                let name = object::get_property(self, cell, Predefined::Name.symbol())
                    .filter(|v| v.is_string())
                    .map(strings::to_rust_string)
                    .unwrap_or_else(|| "Error".to_owned());
                let message = object::get_property(self, cell, Predefined::Message.symbol())
                    .filter(|v| v.is_string())
                    .map(strings::to_rust_string)
                    .unwrap_or_default();
                return if message.is_empty() {
                    name
                } else {
                    format!("{name}: {message}")
                };
            }
        }
        operations::value_brief(self, value)
    }

    fn read_error_stack(&mut self, value: Value) -> Vec<String> {
        let Some(cell) = object::as_object(value) else {
            return Vec::new();
        };
        object::get_property(self, cell, Predefined::Stack.symbol())
            .filter(|v| v.is_string())
            .map(|v| strings::to_rust_string(v).lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Current frame chain, innermost first.
    pub fn capture_stack(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for frame in self.frame_chain() {
            let record = &self.modules[frame.module as usize].functions[frame.function as usize];
            let name: &str = if record.name.is_empty() {
                "<anonymous>"
            } else {
                record.name.as_ref()
            };
            lines.push(format!(
                "{name} ({}:{})",
                self.modules[frame.module as usize].source_url, frame.ip
            ));
        }
        lines
    }

    /// Frame introspection for the sampling profiler; always coherent
    /// between opcodes.
    ///
    /// A frame identifies the function it runs through its callee slot;
    /// the innermost instruction offset is the runtime's current ip, and
    /// each caller's resume offset is saved in its callee's frame header.
    pub fn frame_chain(&self) -> Vec<FrameInfo> {
        let mut frames = Vec::new();
        let mut fp = self.current_fp;
        let mut ip = self.current_ip;
        while fp != usize::MAX {
            let callee = self.stack.values[fp + crate::stack::FRAME_CALLEE];
            if let Some(cell) = object::as_object(callee) {
                // SAFETY: callee slots hold live callable cells.
                let header = unsafe { cell.header() };
                if header.kind() == CellKind::Closure as u8 {
                    // SAFETY: kind checked.
                    let closure = unsafe { &*cell.cast::<crate::function::ClosureCell>() };
                    frames.push(FrameInfo {
                        module: closure.module,
                        function: closure.function,
                        ip,
                    });
                }
            }
            ip = self.stack.values[fp + crate::stack::FRAME_SAVED_IP].as_native_u32();
            let saved = self.stack.values[fp + crate::stack::FRAME_SAVED_FP].as_native_u32();
            fp = if saved == crate::stack::NO_CALLER {
                usize::MAX
            } else {
                saved as usize
            };
        }
        frames
    }

    /// Invoke the fatal handler and terminate.
    pub(crate) fn fatal(&self, message: &str) -> ! {
        tracing::error!(message, "fatal VM error");
        if let Some(handler) = &self.fatal_handler {
            handler(message);
        } else {
            eprintln!("fatal VM error: {message}");
        }
        std::process::abort();
    }

    /// Install a fatal handler (runs before abort).
    pub fn set_fatal_handler(&mut self, handler: Box<dyn Fn(&str)>) {
        self.fatal_handler = Some(handler);
    }

    // -- Hooks --

    /// Debugger callback for `Debugger` opcodes and async pause requests.
    pub fn set_debugger_callback(&mut self, callback: Box<dyn FnMut(&mut Runtime)>) {
        self.debugger = Some(callback);
    }

    /// A flag the embedder may set from any thread to request a pause at
    /// the next opcode boundary.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pending_break)
    }

    /// Sampling callback invoked at opcode boundaries when the sample
    /// flag is set.
    pub fn set_sampling_callback(&mut self, callback: Box<dyn FnMut(&[FrameInfo])>) {
        self.sampler = Some(callback);
    }

    /// The flag arming the next sample.
    pub fn sample_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.sample_requested)
    }

    /// Hook for lazy-function compilation.
    pub fn set_compile_hook(&mut self, hook: CompileHook) {
        self.compile_hook = Some(hook);
    }

    /// Hook offered hot functions for JIT compilation.
    pub fn set_jit_hook(&mut self, hook: JitHook) {
        self.jit_hook = Some(hook);
    }

    // -- Module loading and execution --

    /// Instantiate a module: intern identifiers, detach code, size cache
    /// tables.
    pub fn instantiate_module(&mut self, provider: &dyn BytecodeProvider) -> VmResult<u32> {
        if self.modules.len() >= 256 {
            return Err(VmError::Fatal("module instance limit (256) reached".into()));
        }
        let module_id = self.modules.len() as u32;
        let function_count = provider.function_count();
        if function_count >= 1 << 24 {
            return Err(VmError::Fatal("function count limit (2^24) reached".into()));
        }

        let string_count = provider.string_count();
        let mut symbols = Vec::with_capacity(string_count as usize);
        let mut string_text = Vec::with_capacity(string_count as usize);
        for i in 0..string_count {
            let entry = provider.string(i);
            let text = std::str::from_utf8(entry.bytes)
                .map_err(|_| VmError::Fatal(format!("string {i} is not UTF-8")))?;
            string_text.push(Box::from(text));
            if entry.is_identifier {
                let sym = match provider.identifier_hash(i) {
                    Some(hash) if hash != 0 => self.identifiers.intern_with_hash(text, hash),
                    _ => self.identifiers.intern(text),
                };
                // Module identifiers outlive any collection.
                self.identifiers.pin(sym);
                symbols.push(sym);
            } else {
                symbols.push(SymbolId::INVALID);
            }
        }

        let mut functions = Vec::with_capacity(function_count as usize);
        let mut caches = Vec::with_capacity(function_count as usize);
        for i in 0..function_count {
            let view = provider.function(i);
            if !view.header.lazy {
                validate_code(view.code)?;
            }
            let name: Box<str> = if view.name == u32::MAX {
                Box::from("")
            } else {
                string_text
                    .get(view.name as usize)
                    .cloned()
                    .unwrap_or_default()
            };
            functions.push(Rc::new(FunctionRecord {
                code: view.code.into(),
                header: view.header,
                exceptions: view.exceptions.into(),
                name,
                module: module_id,
                index: i,
                debug_offsets: view.debug_offsets.map(Into::into),
            }));
            caches.push(
                vec![PropertyCacheEntry::default(); count_cache_slots(view.code)]
                    .into_boxed_slice(),
            );
        }

        self.modules.push(ModuleInstance {
            functions,
            symbols,
            string_text,
            string_values: vec![Value::empty(); string_count as usize],
            caches,
            call_counts: vec![0; function_count as usize],
            jit_entries: vec![None; function_count as usize],
            array_buffer: provider.array_buffer().to_vec(),
            object_key_buffer: provider.object_key_buffer().to_vec(),
            object_value_buffer: provider.object_value_buffer().to_vec(),
            global_function: provider.global_function_index(),
            source_url: provider.source_url().to_owned(),
        });
        tracing::debug!(
            module = module_id,
            functions = function_count,
            strings = string_count,
            "module instantiated"
        );
        Ok(module_id)
    }

    /// Load and run a module's global function with the global object as
    /// `this`.
    pub fn run_module(&mut self, provider: &dyn BytecodeProvider) -> VmResult<Value> {
        let module_id = self.instantiate_module(provider)?;
        let global_index = self.modules[module_id as usize].global_function;
        let closure = function::new_closure(self, module_id, global_index, Value::undefined())
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))?;
        let this = self.globals.global_object;
        interpreter::call_value(self, closure, this, &[], Value::undefined())
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))
    }

    /// Call a callable value from native code.
    pub fn call(&mut self, callable: Value, this: Value, args: &[Value]) -> VmResult<Value> {
        interpreter::call_value(self, callable, this, args, Value::undefined())
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))
    }

    /// Call from inside a host function: a raised exception stays in the
    /// thrown slot and propagates as [`Thrown`], so the surrounding JS
    /// catch machinery sees it.
    pub fn try_call(&mut self, callable: Value, this: Value, args: &[Value]) -> JsResult<Value> {
        interpreter::call_value(self, callable, this, args, Value::undefined())
    }

    // -- Object and string surface --

    /// A fresh empty object with the default prototype.
    pub fn create_object(&mut self) -> VmResult<Value> {
        object::new_object(self, self.globals.object_prototype)
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))
    }

    /// A fresh dense array.
    pub fn create_array(&mut self, capacity: u32) -> VmResult<Value> {
        object::new_array(self, capacity)
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))
    }

    /// A heap string from UTF-8.
    pub fn create_string(&mut self, content: &str) -> VmResult<Value> {
        strings::new_string(self, content)
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))
    }

    /// Intern an identifier, pinned for the embedder's lifetime.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.identifiers.intern_external(name)
    }

    /// `obj.name`, walking the prototype chain.
    pub fn get_property(&mut self, obj: Value, name: &str) -> VmResult<Value> {
        let sym = self.identifiers.intern(name);
        let Some(cell) = object::as_object(obj) else {
            let Thrown = self.raise(ErrorKind::TypeError, "get_property on non-object");
            return Err(VmError::Uncaught(self.take_js_error()));
        };
        Ok(object::get_property(self, cell, sym).unwrap_or_else(Value::undefined))
    }

    /// `obj.name = value` (non-strict semantics).
    pub fn set_property(&mut self, obj: Value, name: &str, value: Value) -> VmResult<()> {
        let sym = self.identifiers.intern(name);
        object::set_property(self, obj, sym, value, false)
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))
    }

    /// The global object.
    pub fn global_object(&self) -> Value {
        self.globals.global_object
    }

    /// Register a host function: added to the registry, wrapped in a
    /// callable cell, and installed on the global object under `name`.
    pub fn register_host_function(
        &mut self,
        name: &str,
        arity: u32,
        f: HostFn,
    ) -> VmResult<Value> {
        let host_index = self.host_fns.len() as u32;
        self.host_fns.push(HostFnRecord {
            name: name.to_owned(),
            arity,
            f,
        });
        let sym = self.identifiers.intern_external(name);
        let value = function::new_native_function(self, host_index, arity, sym)
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))?;
        let global = self.globals.global_object;
        object::define_own_property(self, global, sym, value, prop_flags::BUILTIN)
            .map_err(|Thrown| VmError::Uncaught(self.take_js_error()))?;
        Ok(value)
    }

    /// Install a value in the builtin table at a fixed slot.
    pub fn set_builtin(&mut self, slot: usize, value: Value) {
        if self.builtins.len() <= slot {
            self.builtins.resize(slot + 1, Value::undefined());
        }
        self.builtins[slot] = value;
    }

    // -- Scoped roots --

    /// Run `f` inside a fresh handle scope. The scope closes on every
    /// exit path, raised exceptions included, keeping scope teardown
    /// strictly LIFO.
    pub fn with_scope<T>(&mut self, f: impl FnOnce(&mut Runtime) -> JsResult<T>) -> JsResult<T> {
        let token = self.handles.push_scope();
        let result = f(self);
        self.handles.pop_scope(token);
        result
    }

    /// Open a handle scope.
    pub fn push_scope(&mut self) -> ScopeToken {
        self.handles.push_scope()
    }

    /// Close a handle scope (LIFO, debug-asserted).
    pub fn pop_scope(&mut self, token: ScopeToken) {
        self.handles.pop_scope(token);
    }

    /// Register a value in the innermost scope.
    pub fn new_handle(&mut self, value: Value) -> HandleId {
        self.handles.new_handle(value)
    }

    /// A handle's current value.
    pub fn handle_value(&self, id: HandleId) -> Value {
        self.handles.get(id)
    }

    /// Register a callback visited as a strong-root source on every
    /// collection.
    pub fn register_custom_root(&mut self, callback: Box<dyn FnMut(&mut dyn SlotAcceptor)>) {
        self.custom_roots.push(callback);
    }

    /// Safepoint check: the number of open handles matches what the
    /// caller expects. Debug builds only.
    pub fn assert_handle_count(&self, expected: usize) {
        debug_assert_eq!(
            self.handles.live_handles(),
            expected,
            "open handle count diverged at safepoint"
        );
    }
}

/// Cache-slot count for a function: one past the highest cache operand.
pub(crate) fn count_cache_slots(code: &[u8]) -> usize {
    let mut max: usize = 0;
    let mut ip = 0;
    while ip < code.len() {
        let Some(op) = Opcode::from_u8(code[ip]) else {
            break;
        };
        if matches!(
            op,
            Opcode::GetById | Opcode::TryGetById | Opcode::PutById | Opcode::TryPutById
        ) {
            max = max.max(code[ip + 3] as usize + 1);
        }
        ip += op.width();
    }
    max
}

/// The runtime's root set, split-borrowed from everything except the heap.
pub(crate) struct RuntimeRoots<'a> {
    pub stack: &'a mut ValueStack,
    pub handles: &'a mut HandleTable,
    pub globals: &'a mut RuntimeGlobals,
    pub modules: &'a mut Vec<ModuleInstance>,
    pub builtins: &'a mut Vec<Value>,
    pub named_caches: &'a mut [PropertyCacheEntry; NAMED_CACHE_SIZE],
    pub custom_roots: &'a mut Vec<Box<dyn FnMut(&mut dyn SlotAcceptor)>>,
    pub identifiers: &'a mut IdentifierTable,
}

impl RootSet for RuntimeRoots<'_> {
    fn mark_roots(&mut self, acceptor: &mut dyn SlotAcceptor) {
        for slot in self.stack.live_slots_mut() {
            // SAFETY: live stack slots are initialized Values.
            unsafe { acceptor.value_slot(slot) };
        }
        for slot in self.handles.slots_mut() {
            // SAFETY: handle slots are initialized Values.
            unsafe { acceptor.value_slot(slot) };
        }
        let globals = &mut *self.globals;
        for slot in [
            &mut globals.global_object,
            &mut globals.object_prototype,
            &mut globals.function_prototype,
            &mut globals.array_prototype,
            &mut globals.error_prototype,
            &mut globals.thrown,
            &mut globals.oom_error,
        ] {
            // SAFETY: fixed runtime slots are initialized Values.
            unsafe { acceptor.value_slot(slot) };
        }
        // SAFETY: the class root is a nullable cell pointer slot.
        unsafe { acceptor.ptr_slot(&mut globals.class_root) };
        for module in self.modules.iter_mut() {
            for slot in &mut module.string_values {
                // SAFETY: string cache slots are initialized Values.
                unsafe { acceptor.value_slot(slot) };
            }
        }
        for slot in self.builtins.iter_mut() {
            // SAFETY: builtin slots are initialized Values.
            unsafe { acceptor.value_slot(slot) };
        }
        for callback in self.custom_roots.iter_mut() {
            callback(acceptor);
        }
    }

    fn mark_weak_roots(&mut self, acceptor: &mut dyn WeakAcceptor) {
        for module in self.modules.iter_mut() {
            for cache in module.caches.iter_mut() {
                for entry in cache.iter_mut() {
                    // SAFETY: cache class fields are nullable pointer slots.
                    unsafe { acceptor.weak_ptr_slot(&mut entry.class) };
                }
            }
        }
        for entry in self.named_caches.iter_mut() {
            // SAFETY: as above.
            unsafe { acceptor.weak_ptr_slot(&mut entry.class) };
        }
    }

    fn sweep_symbols(&mut self, marked: &SymbolMarkSet) {
        self.identifiers.sweep(marked);
    }
}

/// A runtime behind the external mutex, for hosts that share one runtime
/// across threads. All JS execution still happens on one thread at a time.
pub struct LockedRuntime {
    inner: parking_lot::Mutex<Runtime>,
}

impl LockedRuntime {
    /// Wrap a runtime.
    pub fn new(runtime: Runtime) -> LockedRuntime {
        LockedRuntime {
            inner: parking_lot::Mutex::new(runtime),
        }
    }

    /// Run a closure with exclusive access to the runtime.
    pub fn with<R>(&self, f: impl FnOnce(&mut Runtime) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
