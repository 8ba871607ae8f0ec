//! Scoped handle tables.
//!
//! Native code holding a `Value` across any potentially-allocating
//! operation must register it in the current scope, or the collector may
//! move or reclaim the referent out from under it. Scopes nest strictly
//! LIFO; popping out of order is a programmer error caught by debug
//! assertions. Every slot of every open scope is a strong root.

use crate::value::Value;

/// Proof that a scope was opened; consumed by `pop_scope`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an unpopped scope leaks its handles until runtime teardown"]
pub struct ScopeToken {
    depth: u32,
}

/// A stable index to a handle slot. Valid until the owning scope pops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleId {
    index: u32,
}

/// LIFO-nested root slots for native code.
#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Value>,
    scope_starts: Vec<u32>,
}

impl HandleTable {
    /// Empty table.
    pub fn new() -> HandleTable {
        HandleTable::default()
    }

    /// Open a scope. Handles created until the matching `pop_scope` are
    /// owned by it.
    pub fn push_scope(&mut self) -> ScopeToken {
        self.scope_starts.push(self.slots.len() as u32);
        ScopeToken {
            depth: self.scope_starts.len() as u32,
        }
    }

    /// Close a scope, releasing every handle it owns. The token must be
    /// the one returned by the matching `push_scope`.
    pub fn pop_scope(&mut self, token: ScopeToken) {
        debug_assert_eq!(
            token.depth as usize,
            self.scope_starts.len(),
            "handle scopes must pop in LIFO order"
        );
        let start = self
            .scope_starts
            .pop()
            .expect("pop_scope without an open scope");
        self.slots.truncate(start as usize);
    }

    /// Register a value in the innermost open scope.
    pub fn new_handle(&mut self, value: Value) -> HandleId {
        debug_assert!(
            !self.scope_starts.is_empty(),
            "new_handle outside any scope"
        );
        let index = self.slots.len() as u32;
        self.slots.push(value);
        HandleId { index }
    }

    /// Read a handle's current value.
    pub fn get(&self, id: HandleId) -> Value {
        self.slots[id.index as usize]
    }

    /// Update a handle.
    pub fn set(&mut self, id: HandleId, value: Value) {
        self.slots[id.index as usize] = value;
    }

    /// Number of open scopes.
    pub fn open_scopes(&self) -> usize {
        self.scope_starts.len()
    }

    /// Number of live handles across all scopes. The runtime checks this
    /// against the expected count at safepoints in debug builds.
    pub fn live_handles(&self) -> usize {
        self.slots.len()
    }

    /// Every live handle slot, for root marking.
    pub fn slots_mut(&mut self) -> &mut [Value] {
        &mut self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_release_with_their_scope() {
        let mut table = HandleTable::new();
        let outer = table.push_scope();
        let a = table.new_handle(Value::number(1.0));
        let inner = table.push_scope();
        table.new_handle(Value::number(2.0));
        table.new_handle(Value::number(3.0));
        assert_eq!(table.live_handles(), 3);

        table.pop_scope(inner);
        assert_eq!(table.live_handles(), 1);
        assert_eq!(table.get(a).as_number(), 1.0);
        table.pop_scope(outer);
        assert_eq!(table.live_handles(), 0);
        assert_eq!(table.open_scopes(), 0);
    }

    #[test]
    fn handles_are_writable_roots() {
        let mut table = HandleTable::new();
        let token = table.push_scope();
        let h = table.new_handle(Value::number(1.0));
        table.set(h, Value::number(42.0));
        assert_eq!(table.get(h).as_number(), 42.0);
        table.pop_scope(token);
    }

    #[test]
    #[should_panic(expected = "LIFO")]
    #[cfg(debug_assertions)]
    fn non_lifo_pop_asserts() {
        let mut table = HandleTable::new();
        let outer = table.push_scope();
        let _inner = table.push_scope();
        // Popping the outer scope while the inner one is open.
        table.pop_scope(outer);
    }
}
