//! # Heron VM Heap
//!
//! Value representation and the generational garbage-collected heap.
//!
//! ## Design
//!
//! - **NaN-boxed values**: every JS value is 64 bits; pointers, symbols
//!   and sentinels live in the quiet-NaN space
//! - **Size-aligned segments**: 4 MiB segments whose header is found by
//!   masking any cell pointer
//! - **Two generations**: a bump-allocated nursery collected by copying,
//!   and a segment-list old generation collected by mark-sweep-compact
//! - **Card-table remembered sets**: old-to-young stores dirty a card;
//!   boundary tables let the collector scan dirty cards by whole cells
//! - **Metadata descriptors**: the collector visits cells through an
//!   immutable per-kind descriptor table, never via dynamic dispatch
//! - **Scoped roots**: LIFO handle scopes plus runtime callbacks form the
//!   root set; weak slots and weak roots are processed after marking

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod cell;
pub mod config;
mod evacuate;
mod fullgc;
pub mod handles;
pub mod heap;
pub mod roots;
pub mod segment;
pub mod stats;
pub mod storage;
pub mod string;
pub mod value;
pub mod weak;

pub use cell::{
    ArrayElem, ArrayMetadata, CellHeader, CellMetadata, CellPtr, CellShape, CustomVisitFn,
    FinalizeFn, HEAP_ALIGN, align_size, install_metadata, metadata_for, metadata_table,
    visit_cell, visit_cell_with_kind,
};
pub use config::GcConfig;
pub use handles::{HandleId, HandleTable, ScopeToken};
pub use heap::{Heap, HeapError};
pub use roots::{NoRoots, RootSet, SlotAcceptor, SymbolMarkSet, WeakAcceptor};
pub use segment::{CARD_SIZE, Generation, PAYLOAD_SIZE, SEGMENT_SIZE, Segment};
pub use stats::GcStats;
pub use storage::{
    CountingStorageProvider, LimitedStorageProvider, StorageProvider, SystemStorageProvider,
};
pub use string::StringCell;
pub use value::{SymbolId, Value, ValueKind};
pub use weak::{WeakSlotId, WeakSlotTable};
