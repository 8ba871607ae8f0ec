//! Inline caches for named-property access.
//!
//! Each `GetById`/`PutById` site owns a cache slot: the last observed
//! hidden class and the slot the property occupied in it. The update
//! policy is write-once per class observed: hit on match, otherwise do the
//! full lookup and (when the receiver's class is still shared) overwrite
//! the entry. Class pointers here are weak roots: collections forward or
//! clear them, never keep a class alive.
//!
//! A small fixed array of VM-internal caches keyed by well-known names
//! serves opcodes that carry no cache index of their own.

use heron_vm_heap::cell::CellPtr;

/// One cache site: the observed class and the property's slot in it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyCacheEntry {
    /// Last observed hidden class (weak)
    pub class: Option<CellPtr>,
    /// Slot index valid for that class
    pub slot: u32,
}

impl PropertyCacheEntry {
    /// Whether this entry hits for `class`.
    #[inline]
    pub fn matches(&self, class: CellPtr) -> bool {
        self.class == Some(class)
    }

    /// Record a new observation.
    #[inline]
    pub fn fill(&mut self, class: CellPtr, slot: u32) {
        self.class = Some(class);
        self.slot = slot;
    }
}

/// Fixed named-cache slot for `length`.
pub const NAMED_CACHE_LENGTH: usize = 0;
/// Fixed named-cache slot for `prototype`.
pub const NAMED_CACHE_PROTOTYPE: usize = 1;
/// Size of the fixed named cache.
pub const NAMED_CACHE_SIZE: usize = 2;

/// Hit/miss counters, observable by tests and the driver's stats flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Fast-path hits
    pub hits: u64,
    /// Full lookups that refilled a cache
    pub misses: u64,
}
