//! # Heron VM Core
//!
//! The interpreter, object model and runtime surface of the Heron
//! JavaScript virtual machine.
//!
//! ## Design
//!
//! - **Register windows**: every call is a contiguous window of one
//!   shared value stack; calls re-enter the dispatch loop, never Rust
//! - **Hidden classes**: shared transition trees with per-site inline
//!   caches and a dictionary-mode fallback
//! - **Exceptions as data**: a thrown value lives in a runtime slot and
//!   unwinding walks exception tables, never Rust panics
//! - **Explicit runtime**: all mutable VM state hangs off one `Runtime`
//!   value; the only global is the immutable cell-metadata table

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod builtins;
pub mod environment;
pub mod error;
pub mod function;
pub mod hidden_class;
pub mod identifiers;
pub mod inline_cache;
mod interpreter;
pub mod kinds;
pub mod object;
pub mod operations;
pub mod runtime;
pub mod snapshot;
pub mod stack;
pub mod strings;

pub use builtins::{BUILTIN_GC, BUILTIN_PRINT, install_default_builtins};
pub use error::{ErrorKind, JsError, JsResult, Thrown, VmError, VmResult};
pub use heron_vm_heap::value::{SymbolId, Value, ValueKind};
pub use identifiers::{IdentifierTable, Predefined};
pub use kinds::CellKind;
pub use runtime::{
    HostFn, JitEntry, LockedRuntime, Runtime, RuntimeConfig,
};
pub use snapshot::write_heap_snapshot;
pub use stack::FrameInfo;
