//! The identifier table.
//!
//! Property-name strings are interned to compact [`SymbolId`]s that fit
//! inside a `Value`. A reserved range of predefined symbols is registered
//! at startup; bytecode identifiers are interned lazily on module load
//! using the compiler's precomputed hashes and pinned for the module's
//! lifetime; native embedders pin the names they hold. Unpinned,
//! unreserved entries whose ids were not marked during a full collection
//! are freed and their ids recycled.

use heron_vm_bytecode::builder::hash_identifier;
use heron_vm_heap::roots::SymbolMarkSet;
use heron_vm_heap::value::SymbolId;
use rustc_hash::FxHashMap;

/// Well-known names the VM always knows, in reserved id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Predefined {
    /// `length`
    Length = 0,
    /// `prototype`
    Prototype,
    /// `__proto__`
    Proto,
    /// `constructor`
    Constructor,
    /// `valueOf`
    ValueOf,
    /// `toString`
    ToString,
    /// `name`
    Name,
    /// `message`
    Message,
    /// `stack`
    Stack,
    /// `undefined`
    Undefined,
    /// `globalThis`
    GlobalThis,
}

const PREDEFINED_NAMES: &[&str] = &[
    "length",
    "prototype",
    "__proto__",
    "constructor",
    "valueOf",
    "toString",
    "name",
    "message",
    "stack",
    "undefined",
    "globalThis",
];

impl Predefined {
    /// The symbol id of a predefined name.
    #[inline]
    pub fn symbol(self) -> SymbolId {
        SymbolId(self as u32)
    }
}

struct IdEntry {
    text: Box<str>,
    hash: u32,
    reserved: bool,
    /// External pins (modules, embedder handles); nonzero blocks sweeping
    pins: u32,
}

/// Interning table mapping property-name strings to symbol ids.
pub struct IdentifierTable {
    entries: Vec<Option<IdEntry>>,
    /// hash -> entry indices with that hash
    buckets: FxHashMap<u32, Vec<u32>>,
    free: Vec<u32>,
}

impl IdentifierTable {
    /// A table seeded with the reserved predefined range.
    pub fn new() -> IdentifierTable {
        let mut table = IdentifierTable {
            entries: Vec::with_capacity(PREDEFINED_NAMES.len() + 32),
            buckets: FxHashMap::default(),
            free: Vec::new(),
        };
        for name in PREDEFINED_NAMES {
            let id = table.insert(name, hash_identifier(name.as_bytes()), true);
            debug_assert_eq!(id.0 as usize, table.entries.len() - 1);
        }
        table
    }

    /// Intern a name, creating an entry on first sight.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.intern_with_hash(name, hash_identifier(name.as_bytes()))
    }

    /// Intern with a precomputed hash (bytecode identifier tables carry
    /// these to skip the first hashing pass).
    pub fn intern_with_hash(&mut self, name: &str, hash: u32) -> SymbolId {
        debug_assert_eq!(hash, hash_identifier(name.as_bytes()), "stale identifier hash");
        if let Some(indices) = self.buckets.get(&hash) {
            for &index in indices {
                if let Some(entry) = &self.entries[index as usize] {
                    if &*entry.text == name {
                        return SymbolId(index);
                    }
                }
            }
        }
        self.insert(name, hash, false)
    }

    /// Intern and pin: the caller holds the name for its own lifetime
    /// (modules, embedder handles), so the entry never sweeps.
    pub fn intern_external(&mut self, name: &str) -> SymbolId {
        let id = self.intern(name);
        self.pin(id);
        id
    }

    /// Add a sweep pin to an entry.
    pub fn pin(&mut self, id: SymbolId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.pins += 1;
        }
    }

    /// Drop a sweep pin.
    pub fn unpin(&mut self, id: SymbolId) {
        if let Some(entry) = self.entry_mut(id) {
            debug_assert!(entry.pins > 0, "unbalanced identifier unpin");
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// The text of a live symbol.
    pub fn text(&self, id: SymbolId) -> &str {
        self.entries[id.0 as usize]
            .as_ref()
            .map(|e| &*e.text)
            .expect("symbol id refers to a freed identifier")
    }

    /// The text, if the id is live.
    pub fn try_text(&self, id: SymbolId) -> Option<&str> {
        self.entries.get(id.0 as usize)?.as_ref().map(|e| &*e.text)
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// End of a full collection: free entries that are unmarked,
    /// unreserved and unpinned; recycle their ids.
    pub fn sweep(&mut self, marked: &SymbolMarkSet) {
        for index in 0..self.entries.len() {
            let Some(entry) = &self.entries[index] else {
                continue;
            };
            if entry.reserved || entry.pins > 0 || marked.is_marked(SymbolId(index as u32)) {
                continue;
            }
            let hash = entry.hash;
            if let Some(bucket) = self.buckets.get_mut(&hash) {
                bucket.retain(|&i| i != index as u32);
                if bucket.is_empty() {
                    self.buckets.remove(&hash);
                }
            }
            self.entries[index] = None;
            self.free.push(index as u32);
        }
    }

    fn insert(&mut self, name: &str, hash: u32, reserved: bool) -> SymbolId {
        let entry = IdEntry {
            text: name.into(),
            hash,
            reserved,
            pins: 0,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        self.buckets.entry(hash).or_default().push(index);
        SymbolId(index)
    }

    fn entry_mut(&mut self, id: SymbolId) -> Option<&mut IdEntry> {
        self.entries.get_mut(id.0 as usize)?.as_mut()
    }
}

impl Default for IdentifierTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_ids_are_stable() {
        let table = IdentifierTable::new();
        assert_eq!(table.text(Predefined::Length.symbol()), "length");
        assert_eq!(table.text(Predefined::Prototype.symbol()), "prototype");
        assert_eq!(table.text(Predefined::Stack.symbol()), "stack");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut table = IdentifierTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
        assert_ne!(table.intern("bar"), a);
        // Predefined names intern to their reserved ids.
        assert_eq!(table.intern("length"), Predefined::Length.symbol());
    }

    #[test]
    fn sweep_frees_unmarked_unpinned_entries() {
        let mut table = IdentifierTable::new();
        let doomed = table.intern("transient");
        let pinned = table.intern_external("held-by-native");
        let marked = table.intern("in-use");

        let mut marks = SymbolMarkSet::new();
        marks.mark(marked);
        table.sweep(&marks);

        assert!(table.try_text(doomed).is_none());
        assert_eq!(table.text(pinned), "held-by-native");
        assert_eq!(table.text(marked), "in-use");
        // Reserved entries never sweep.
        assert_eq!(table.text(Predefined::Length.symbol()), "length");

        // The freed id is recycled and the old text does not resurface.
        let recycled = table.intern("fresh");
        assert_eq!(recycled, doomed);
        assert_eq!(table.text(recycled), "fresh");
        assert_ne!(table.intern("transient"), doomed);
    }
}
