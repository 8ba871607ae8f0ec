//! Cell kinds and metadata registration.
//!
//! Every heap cell kind the core allocates, plus the assembly of the
//! collector's descriptor table. Embedders may append their own kinds
//! through `RuntimeConfig::extra_metadata` before the first runtime is
//! created; after that the table is immutable.

use heron_vm_heap::cell::{CellMetadata, install_metadata};
use heron_vm_heap::string::StringCell;

use crate::environment::EnvironmentCell;
use crate::function::{BoundFunctionCell, ClosureCell, NativeFunctionCell};
use crate::hidden_class::HiddenClassCell;
use crate::object::{IndexedStorageCell, ObjectCell, PropNameListCell, PropertyStorageCell};

/// The core's cell kinds. Discriminants index the descriptor table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Immutable UTF-8 string
    String = 0,
    /// Plain JS object
    Object,
    /// Overflow property storage (Value array)
    PropertyStorage,
    /// Dense indexed storage (Value array with length)
    IndexedStorage,
    /// Hidden class node
    HiddenClass,
    /// Captured-variable record
    Environment,
    /// JS function closure
    Closure,
    /// Registered host function
    NativeFunction,
    /// Bound-function wrapper
    BoundFunction,
    /// for-in iteration snapshot
    PropNameList,
}

/// Number of core kinds.
pub const CORE_KIND_COUNT: usize = CellKind::PropNameList as usize + 1;

impl CellKind {
    /// Decode a header kind byte into a core kind.
    #[inline]
    pub fn from_u8(kind: u8) -> Option<CellKind> {
        if (kind as usize) < CORE_KIND_COUNT {
            // SAFETY: repr(u8) with contiguous discriminants.
            Some(unsafe { std::mem::transmute::<u8, CellKind>(kind) })
        } else {
            None
        }
    }

    /// Kinds whose layout begins with [`ObjectCell`] and therefore carry
    /// properties, a hidden class and a parent.
    #[inline]
    pub fn is_object_like(self) -> bool {
        matches!(
            self,
            CellKind::Object
                | CellKind::Closure
                | CellKind::NativeFunction
                | CellKind::BoundFunction
        )
    }

    /// Kinds invocable by the call opcodes.
    #[inline]
    pub fn is_callable(self) -> bool {
        matches!(
            self,
            CellKind::Closure | CellKind::NativeFunction | CellKind::BoundFunction
        )
    }
}

/// Install the core descriptor table plus any embedder kinds. Idempotent
/// for the core table; a second runtime with different extras panics.
pub fn install(extra: Vec<CellMetadata>) {
    let mut table = vec![
        StringCell::metadata(),
        ObjectCell::metadata(),
        PropertyStorageCell::metadata(),
        IndexedStorageCell::metadata(),
        HiddenClassCell::metadata(),
        EnvironmentCell::metadata(),
        ClosureCell::metadata(),
        NativeFunctionCell::metadata(),
        BoundFunctionCell::metadata(),
        PropNameListCell::metadata(),
    ];
    debug_assert_eq!(table.len(), CORE_KIND_COUNT);
    table.extend(extra);
    install_metadata(table);
}
