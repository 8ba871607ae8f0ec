//! Card-table soundness.
//!
//! The generational invariant: before a young collection, every
//! old-generation slot holding a young pointer must be covered by a dirty
//! card, or the collection would miss the reference. These tests route
//! stores through the write barrier, enumerate all such slots, and check
//! the card table against the enumeration.

use heron_vm_heap::barrier::{write_ptr_slot, write_value_slot};
use heron_vm_heap::cell::{CellHeader, CellMetadata, CellPtr, CellShape, install_metadata};
use heron_vm_heap::heap::Heap;
use heron_vm_heap::roots::{RootSet, SlotAcceptor, SymbolMarkSet, WeakAcceptor};
use heron_vm_heap::segment::is_card_dirty_covering;
use heron_vm_heap::storage::SystemStorageProvider;
use heron_vm_heap::{GcConfig, Value};

const KIND_PAIR: u8 = 0;

/// Two value slots and one pointer slot.
#[repr(C)]
struct Pair {
    header: CellHeader,
    first: Value,
    second: Value,
    link: Option<CellPtr>,
}

fn setup() {
    install_metadata(vec![CellMetadata {
        name: "TestPair",
        shape: CellShape::Fixed(std::mem::size_of::<Pair>()),
        value_slots: &[
            std::mem::offset_of!(Pair, first),
            std::mem::offset_of!(Pair, second),
        ],
        pointer_slots: &[std::mem::offset_of!(Pair, link)],
        symbol_slots: &[],
        array: None,
        finalize: None,
        custom_visit: None,
    }]);
}

#[derive(Default)]
struct TestRoots {
    values: Vec<Value>,
}

impl RootSet for TestRoots {
    fn mark_roots(&mut self, acceptor: &mut dyn SlotAcceptor) {
        for slot in &mut self.values {
            // SAFETY: vector elements are valid Value slots.
            unsafe { acceptor.value_slot(slot) };
        }
    }

    fn mark_weak_roots(&mut self, _acceptor: &mut dyn WeakAcceptor) {}
    fn sweep_symbols(&mut self, _marked: &SymbolMarkSet) {}
}

fn alloc_pair(heap: &mut Heap, roots: &mut TestRoots) -> CellPtr {
    let cell = heap
        .allocate(KIND_PAIR, std::mem::size_of::<Pair>(), false, roots)
        .unwrap();
    // SAFETY: fresh allocation.
    unsafe {
        let p = cell.cast::<Pair>();
        (*p).first = Value::undefined();
        (*p).second = Value::undefined();
        (*p).link = None;
    }
    cell
}

/// Promote a pair into the old generation and return its new address.
fn old_pair(heap: &mut Heap, roots: &mut TestRoots) -> CellPtr {
    let young = alloc_pair(heap, roots);
    roots.values.push(Value::object(young));
    heap.collect_young(roots).unwrap();
    let promoted = roots.values.pop().unwrap().as_cell();
    assert!(!heap.in_young(promoted));
    promoted
}

#[test]
fn old_to_young_store_dirties_the_slot_card() {
    setup();
    let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
    let mut roots = TestRoots::default();

    let old = old_pair(&mut heap, &mut roots);
    let young = alloc_pair(&mut heap, &mut roots);
    assert!(heap.in_young(young));

    let slot = unsafe { &mut (*old.cast::<Pair>()).second as *mut Value };
    // SAFETY: slot is inside a live old cell; young is a live cell.
    unsafe { write_value_slot(slot, Value::object(young)) };
    // SAFETY: the slot address is inside a live segment.
    assert!(unsafe { is_card_dirty_covering(slot as usize) });
}

#[test]
fn old_to_old_store_leaves_cards_clean() {
    setup();
    let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
    let mut roots = TestRoots::default();

    let a = old_pair(&mut heap, &mut roots);
    let b = old_pair(&mut heap, &mut roots);

    let slot = unsafe { &mut (*a.cast::<Pair>()).first as *mut Value };
    // SAFETY: both cells are live old-generation cells.
    unsafe { write_value_slot(slot, Value::object(b)) };
    assert!(!unsafe { is_card_dirty_covering(slot as usize) });

    let link = unsafe { &mut (*a.cast::<Pair>()).link as *mut Option<CellPtr> };
    // SAFETY: as above.
    unsafe { write_ptr_slot(link, Some(b)) };
    assert!(!unsafe { is_card_dirty_covering(link as usize) });
}

#[test]
fn young_to_young_store_leaves_cards_clean() {
    setup();
    let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
    let mut roots = TestRoots::default();

    let a = alloc_pair(&mut heap, &mut roots);
    let b = alloc_pair(&mut heap, &mut roots);
    let slot = unsafe { &mut (*a.cast::<Pair>()).first as *mut Value };
    // SAFETY: both cells are live young cells.
    unsafe { write_value_slot(slot, Value::object(b)) };
    assert!(!unsafe { is_card_dirty_covering(slot as usize) });
}

#[test]
fn every_old_to_young_slot_is_covered_by_a_dirty_card() {
    setup();
    let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
    let mut roots = TestRoots::default();

    // A spread of old cells, then young referents stored into a subset of
    // their slots through the barrier.
    let mut old_cells = Vec::new();
    for _ in 0..64 {
        old_cells.push(old_pair(&mut heap, &mut roots));
    }
    let mut expected_slots = Vec::new();
    for (i, &old) in old_cells.iter().enumerate() {
        if i % 3 != 0 {
            continue;
        }
        let young = alloc_pair(&mut heap, &mut roots);
        let slot = unsafe { &mut (*old.cast::<Pair>()).second as *mut Value };
        // SAFETY: slot in live old cell, young referent live.
        unsafe { write_value_slot(slot, Value::object(young)) };
        expected_slots.push(slot as usize);
    }

    // The soundness property: enumerate every old slot now holding a
    // young pointer and verify its card is dirty.
    for (i, &old) in old_cells.iter().enumerate() {
        // SAFETY: live old cells.
        let pair = unsafe { &*old.cast::<Pair>() };
        for (value, addr) in [
            (pair.first, &pair.first as *const Value as usize),
            (pair.second, &pair.second as *const Value as usize),
        ] {
            if let Some(target) = value.pointer() {
                if heap.in_young(target) {
                    assert!(
                        // SAFETY: the slot is inside a live segment.
                        unsafe { is_card_dirty_covering(addr) },
                        "old slot {i} holds a young pointer but its card is clean"
                    );
                }
            }
        }
    }
    assert!(!expected_slots.is_empty());

    // And the collection that consumes the cards must leave no young
    // pointer behind in any old slot.
    heap.collect_young(&mut roots).unwrap();
    for &old in &old_cells {
        // SAFETY: live old cells.
        let pair = unsafe { &*old.cast::<Pair>() };
        for value in [pair.first, pair.second] {
            if let Some(target) = value.pointer() {
                assert!(!heap.in_young(target), "stale young pointer after collection");
                // The referent is alive and readable at its new address.
                // SAFETY: live cell.
                let header = unsafe { target.header() };
                assert_eq!(header.kind(), KIND_PAIR);
            }
        }
    }
}

#[test]
fn dirty_cards_keep_unrooted_promotees_alive() {
    setup();
    let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
    let mut roots = TestRoots::default();

    let old = old_pair(&mut heap, &mut roots);
    let young = alloc_pair(&mut heap, &mut roots);
    // SAFETY: fresh young cell.
    unsafe { (*young.cast::<Pair>()).first = Value::number(77.0) };

    // The ONLY reference to the young cell is the old cell's slot; without
    // the card-table remembered set this cell would be collected.
    let slot = unsafe { &mut (*old.cast::<Pair>()).link as *mut Option<CellPtr> };
    // SAFETY: slot in live old cell.
    unsafe { write_ptr_slot(slot, Some(young)) };

    heap.collect_young(&mut roots).unwrap();

    // SAFETY: live old cell.
    let promoted = unsafe { (*old.cast::<Pair>()).link }.expect("card kept the referent alive");
    assert!(!heap.in_young(promoted));
    // SAFETY: live cell.
    unsafe { assert_eq!((*promoted.cast::<Pair>()).first.as_number(), 77.0) };
}
