//! GC correctness tests.
//!
//! These exercise the copying young collection and the
//! mark-sweep-compact full collection against a small test cell zoo:
//! survival of rooted graphs, pointer rewriting through forwarding,
//! weak-slot clearing, finalizer ordering, and out-of-memory paths.

use std::cell::RefCell;

use heron_vm_heap::cell::{
    ArrayElem, ArrayMetadata, CellHeader, CellMetadata, CellPtr, CellShape, install_metadata,
};
use heron_vm_heap::heap::{Heap, HeapError};
use heron_vm_heap::roots::{RootSet, SlotAcceptor, SymbolMarkSet, WeakAcceptor};
use heron_vm_heap::storage::{LimitedStorageProvider, SystemStorageProvider};
use heron_vm_heap::{GcConfig, SEGMENT_SIZE, Value};

const KIND_NODE: u8 = 0;
const KIND_TRACKED: u8 = 1;
const KIND_VALUE_ARRAY: u8 = 2;

/// Fixed-size cell with one Value slot and one pointer slot.
#[repr(C)]
struct Node {
    header: CellHeader,
    value: Value,
    next: Option<CellPtr>,
    tag: u64,
}

/// Finalizable cell; its finalizer logs the tag.
#[repr(C)]
struct Tracked {
    header: CellHeader,
    tag: u64,
}

/// Variable-size cell holding a Value array.
#[repr(C)]
struct ValueArray {
    header: CellHeader,
    len: u32,
    _pad: u32,
    // Values follow.
}

thread_local! {
    static FINALIZED: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
    /// Snapshot of an observed weak root slot, taken inside a finalizer.
    static WEAK_SEEN_AT_FINALIZE: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    static WEAK_PROBE: RefCell<Option<usize>> = const { RefCell::new(None) };
}

unsafe fn finalize_tracked(cell: CellPtr) {
    let tag = unsafe { (*cell.cast::<Tracked>()).tag };
    FINALIZED.with(|log| log.borrow_mut().push(tag));
    // When a probe address is set, record whether the weak slot it points
    // at still holds a referent. Raw read: the slot is plain test memory.
    WEAK_PROBE.with(|probe| {
        if let Some(addr) = *probe.borrow() {
            let live = unsafe { (*(addr as *const Option<CellPtr>)).is_some() };
            WEAK_SEEN_AT_FINALIZE.with(|log| log.borrow_mut().push(live));
        }
    });
}

fn node_metadata() -> CellMetadata {
    CellMetadata {
        name: "TestNode",
        shape: CellShape::Fixed(std::mem::size_of::<Node>()),
        value_slots: &[std::mem::offset_of!(Node, value)],
        pointer_slots: &[std::mem::offset_of!(Node, next)],
        symbol_slots: &[],
        array: None,
        finalize: None,
        custom_visit: None,
    }
}

fn tracked_metadata() -> CellMetadata {
    CellMetadata {
        name: "TestTracked",
        shape: CellShape::Fixed(std::mem::size_of::<Tracked>()),
        value_slots: &[],
        pointer_slots: &[],
        symbol_slots: &[],
        array: None,
        finalize: Some(finalize_tracked),
        custom_visit: None,
    }
}

fn value_array_metadata() -> CellMetadata {
    CellMetadata {
        name: "TestValueArray",
        shape: CellShape::Variable,
        value_slots: &[],
        pointer_slots: &[],
        symbol_slots: &[],
        array: Some(ArrayMetadata {
            len_offset: std::mem::offset_of!(ValueArray, len),
            data_offset: std::mem::size_of::<ValueArray>(),
            elem: ArrayElem::Values,
        }),
        finalize: None,
        custom_visit: None,
    }
}

fn setup() {
    install_metadata(vec![node_metadata(), tracked_metadata(), value_array_metadata()]);
}

/// Root set backed by plain vectors, standing in for the runtime.
#[derive(Default)]
struct TestRoots {
    values: Vec<Value>,
    weak_ptrs: Vec<Option<CellPtr>>,
}

impl RootSet for TestRoots {
    fn mark_roots(&mut self, acceptor: &mut dyn SlotAcceptor) {
        for slot in &mut self.values {
            // SAFETY: the vector elements are valid Value slots.
            unsafe { acceptor.value_slot(slot) };
        }
    }

    fn mark_weak_roots(&mut self, acceptor: &mut dyn WeakAcceptor) {
        for slot in &mut self.weak_ptrs {
            // SAFETY: the vector elements are valid pointer slots.
            unsafe { acceptor.weak_ptr_slot(slot) };
        }
    }

    fn sweep_symbols(&mut self, _marked: &SymbolMarkSet) {}
}

fn new_heap() -> Heap {
    setup();
    Heap::new(
        GcConfig::default(),
        Box::new(SystemStorageProvider),
    )
    .expect("heap construction")
}

fn alloc_node(heap: &mut Heap, roots: &mut TestRoots, value: Value, tag: u64) -> CellPtr {
    let cell = heap
        .allocate(KIND_NODE, std::mem::size_of::<Node>(), false, roots)
        .expect("node allocation");
    // SAFETY: fresh allocation of Node size.
    unsafe {
        let node = cell.cast::<Node>();
        (*node).value = value;
        (*node).next = None;
        (*node).tag = tag;
    }
    cell
}

unsafe fn node(cell: CellPtr) -> &'static Node {
    unsafe { &*cell.cast::<Node>() }
}

#[test]
fn young_allocation_is_bump_contiguous() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();
    let a = alloc_node(&mut heap, &mut roots, Value::number(1.0), 1);
    let b = alloc_node(&mut heap, &mut roots, Value::number(2.0), 2);
    assert!(heap.in_young(a));
    assert!(heap.in_young(b));
    assert_eq!(b.addr(), a.addr() + std::mem::size_of::<Node>());
}

#[test]
fn rooted_graph_survives_young_collection() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();

    // head -> mid -> tail, rooted at head only.
    let tail = alloc_node(&mut heap, &mut roots, Value::number(3.0), 33);
    let mid = alloc_node(&mut heap, &mut roots, Value::number(2.0), 22);
    let head = alloc_node(&mut heap, &mut roots, Value::number(1.0), 11);
    // SAFETY: fresh young cells; plain writes before the collector sees
    // them.
    unsafe {
        (*head.cast::<Node>()).next = Some(mid);
        (*mid.cast::<Node>()).next = Some(tail);
    }
    roots.values.push(Value::object(head));

    heap.collect_young(&mut roots).unwrap();

    // The root slot was rewritten to the promoted copy.
    let new_head = roots.values[0].as_cell();
    assert_ne!(new_head, head, "head must have moved");
    assert!(!heap.in_young(new_head));
    assert_eq!(heap.young_used(), 0);

    // SAFETY: promoted cells are live.
    unsafe {
        let h = node(new_head);
        assert_eq!(h.tag, 11);
        let m = node(h.next.expect("mid survived"));
        assert_eq!(m.tag, 22);
        assert_eq!(m.value.as_number(), 2.0);
        let t = node(m.next.expect("tail survived"));
        assert_eq!(t.tag, 33);
        assert!(t.next.is_none());
        assert!(!heap.in_young(h.next.unwrap()));
        assert!(!heap.in_young(m.next.unwrap()));
    }
}

#[test]
fn unrooted_young_cells_die() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();
    let before = heap.old_used();
    for i in 0..100 {
        alloc_node(&mut heap, &mut roots, Value::number(i as f64), i);
    }
    heap.collect_young(&mut roots).unwrap();
    assert_eq!(heap.young_used(), 0);
    assert_eq!(heap.old_used(), before, "nothing was promoted");
}

#[test]
fn young_collection_fires_when_nursery_fills() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();
    let holder = alloc_node(&mut heap, &mut roots, Value::undefined(), 0);
    roots.values.push(Value::object(holder));

    let budget = heap.config().young_budget();
    let per_cell = std::mem::size_of::<Node>();
    let collections_before = heap.stats().young_collections;
    for i in 0..(budget / per_cell) * 2 {
        alloc_node(&mut heap, &mut roots, Value::number(i as f64), i as u64);
    }
    assert!(
        heap.stats().young_collections > collections_before,
        "filling the nursery twice over must trigger collection"
    );
    // The rooted holder survived all of it.
    let holder = roots.values[0].as_cell();
    // SAFETY: live cell.
    unsafe { assert_eq!(node(holder).tag, 0) };
}

#[test]
fn value_array_elements_are_traced() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();

    let elem = alloc_node(&mut heap, &mut roots, Value::number(9.0), 99);
    let len = 16u32;
    let size = std::mem::size_of::<ValueArray>() + len as usize * 8;
    let array = heap
        .allocate(KIND_VALUE_ARRAY, size, false, &mut roots)
        .unwrap();
    // SAFETY: fresh allocation; initialize every element.
    unsafe {
        (*array.cast::<ValueArray>()).len = len;
        (*array.cast::<ValueArray>())._pad = 0;
        let data = (array.addr() + std::mem::size_of::<ValueArray>()) as *mut Value;
        for i in 0..len as usize {
            data.add(i).write(Value::empty());
        }
        data.add(3).write(Value::object(elem));
    }
    roots.values.push(Value::object(array));

    heap.collect_young(&mut roots).unwrap();

    let array = roots.values[0].as_cell();
    // SAFETY: promoted cells are live.
    unsafe {
        let data = (array.addr() + std::mem::size_of::<ValueArray>()) as *const Value;
        let elem_value = *data.add(3);
        assert!(elem_value.is_object());
        assert_eq!(node(elem_value.as_cell()).tag, 99);
        assert!(!heap.in_young(elem_value.as_cell()));
        assert!((*data.add(0)).is_empty(), "holes stay holes");
    }
}

#[test]
fn full_collection_compacts_and_rewrites() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();

    // Promote a garbage cell followed by a live cell so compaction must
    // slide the survivor down.
    let garbage = alloc_node(&mut heap, &mut roots, Value::number(0.0), 0);
    let live = alloc_node(&mut heap, &mut roots, Value::number(1.0), 7);
    roots.values.push(Value::object(garbage));
    roots.values.push(Value::object(live));
    heap.collect_young(&mut roots).unwrap();

    // Drop the garbage root; remember where the survivor sat.
    roots.values.remove(0);
    let live_before = roots.values[0].as_cell();

    heap.collect_full(&mut roots).unwrap();

    let live_after = roots.values[0].as_cell();
    assert!(live_after.addr() < live_before.addr(), "survivor compacted");
    // SAFETY: live cell.
    unsafe {
        assert_eq!(node(live_after).tag, 7);
        assert_eq!(node(live_after).value.as_number(), 1.0);
    }
    assert_eq!(heap.stats().full_collections, 1);
}

#[test]
fn full_collection_updates_interior_pointers() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();

    let target = alloc_node(&mut heap, &mut roots, Value::number(5.0), 50);
    let pointer_holder = alloc_node(&mut heap, &mut roots, Value::undefined(), 51);
    let filler = alloc_node(&mut heap, &mut roots, Value::undefined(), 52);
    // SAFETY: fresh young cells.
    unsafe { (*pointer_holder.cast::<Node>()).next = Some(target) };
    roots.values.push(Value::object(pointer_holder));
    roots.values.push(Value::object(filler));
    heap.collect_young(&mut roots).unwrap();

    // Kill the filler so addresses shift during compaction.
    roots.values.pop();
    heap.collect_full(&mut roots).unwrap();

    let holder = roots.values[0].as_cell();
    // SAFETY: live cells.
    unsafe {
        let t = node(holder).next.expect("interior pointer survived");
        assert_eq!(node(t).tag, 50);
        assert_eq!(node(t).value.as_number(), 5.0);
    }
}

#[test]
fn weak_slot_clears_when_referent_dies() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();

    let doomed = alloc_node(&mut heap, &mut roots, Value::number(1.0), 1);
    let kept = alloc_node(&mut heap, &mut roots, Value::number(2.0), 2);
    roots.values.push(Value::object(kept));
    let weak_doomed = heap.weak_slots().new_slot(doomed);
    let weak_kept = heap.weak_slots().new_slot(kept);

    heap.collect_young(&mut roots).unwrap();

    assert!(
        heap.weak_slots_ref().get(weak_doomed).is_none(),
        "weak reference to a dead young cell clears in the same collection"
    );
    let kept_new = heap.weak_slots_ref().get(weak_kept).expect("survivor stays weakly visible");
    assert_eq!(kept_new, roots.values[0].as_cell(), "weak slot follows the move");
}

#[test]
fn weak_root_slots_follow_survivors_and_clear_for_dead() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();

    let doomed = alloc_node(&mut heap, &mut roots, Value::number(1.0), 1);
    let kept = alloc_node(&mut heap, &mut roots, Value::number(2.0), 2);
    roots.values.push(Value::object(kept));
    roots.weak_ptrs.push(Some(doomed));
    roots.weak_ptrs.push(Some(kept));

    heap.collect_young(&mut roots).unwrap();

    assert!(roots.weak_ptrs[0].is_none());
    assert_eq!(roots.weak_ptrs[1], Some(roots.values[0].as_cell()));
}

#[test]
fn finalizers_run_for_dead_cells_only() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();
    FINALIZED.with(|log| log.borrow_mut().clear());

    let doomed = heap
        .allocate(KIND_TRACKED, std::mem::size_of::<Tracked>(), true, &mut roots)
        .unwrap();
    let kept = heap
        .allocate(KIND_TRACKED, std::mem::size_of::<Tracked>(), true, &mut roots)
        .unwrap();
    // SAFETY: fresh allocations.
    unsafe {
        (*doomed.cast::<Tracked>()).tag = 100;
        (*kept.cast::<Tracked>()).tag = 200;
    }
    roots.values.push(Value::object(kept));

    heap.collect_young(&mut roots).unwrap();
    FINALIZED.with(|log| assert_eq!(*log.borrow(), vec![100]));

    // The survivor's finalizer runs once it dies in a full collection.
    roots.values.clear();
    heap.collect_full(&mut roots).unwrap();
    FINALIZED.with(|log| assert_eq!(*log.borrow(), vec![100, 200]));
}

#[test]
fn finalizers_observe_post_clear_weak_state() {
    let mut heap = new_heap();
    let mut roots = TestRoots::default();
    FINALIZED.with(|log| log.borrow_mut().clear());
    WEAK_SEEN_AT_FINALIZE.with(|log| log.borrow_mut().clear());

    let doomed = heap
        .allocate(KIND_TRACKED, std::mem::size_of::<Tracked>(), true, &mut roots)
        .unwrap();
    // SAFETY: fresh allocation.
    unsafe { (*doomed.cast::<Tracked>()).tag = 300 };
    // A weak root slot referencing the doomed cell; the finalizer probes
    // it through a raw pointer when it runs.
    roots.weak_ptrs.push(Some(doomed));
    let probe_addr = &roots.weak_ptrs[0] as *const Option<CellPtr> as usize;
    WEAK_PROBE.with(|probe| *probe.borrow_mut() = Some(probe_addr));

    heap.collect_young(&mut roots).unwrap();
    WEAK_PROBE.with(|probe| *probe.borrow_mut() = None);

    FINALIZED.with(|log| assert_eq!(*log.borrow(), vec![300]));
    WEAK_SEEN_AT_FINALIZE.with(|log| {
        assert_eq!(
            *log.borrow(),
            vec![false],
            "the weak slot must already be cleared when the finalizer runs"
        );
    });
    assert!(roots.weak_ptrs[0].is_none());
}

#[test]
fn allocation_fails_cleanly_at_the_configured_maximum() {
    setup();
    let config = GcConfig {
        min_heap: SEGMENT_SIZE,
        init_heap: SEGMENT_SIZE,
        max_heap: 2 * SEGMENT_SIZE,
        ..Default::default()
    };
    let provider = LimitedStorageProvider::new(SystemStorageProvider, 8);
    let mut heap = Heap::new(config, Box::new(provider)).unwrap();
    let mut roots = TestRoots::default();

    // Keep everything alive so collections cannot reclaim.
    let mut result = Ok(());
    for i in 0..400_000 {
        match heap.allocate(KIND_NODE, std::mem::size_of::<Node>(), false, &mut roots) {
            Ok(cell) => {
                // SAFETY: fresh allocation.
                unsafe {
                    let n = cell.cast::<Node>();
                    (*n).value = Value::undefined();
                    (*n).next = None;
                    (*n).tag = i;
                }
                roots.values.push(Value::object(cell));
            }
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    assert_eq!(result, Err(HeapError::OutOfMemory));
    // The heap remains usable: drop the roots and collect.
    roots.values.clear();
    heap.collect_full(&mut roots).unwrap();
    let cell = heap
        .allocate(KIND_NODE, std::mem::size_of::<Node>(), false, &mut roots)
        .expect("allocation succeeds after pressure is released");
    // SAFETY: fresh allocation.
    unsafe {
        (*cell.cast::<Node>()).value = Value::undefined();
        (*cell.cast::<Node>()).next = None;
        (*cell.cast::<Node>()).tag = 0;
    }
}

#[test]
fn empty_segments_are_retired_after_full_collection() {
    setup();
    let config = GcConfig {
        min_heap: SEGMENT_SIZE,
        init_heap: SEGMENT_SIZE,
        max_heap: 16 * SEGMENT_SIZE,
        ..Default::default()
    };
    let mut heap = Heap::new(config, Box::new(SystemStorageProvider)).unwrap();
    let mut roots = TestRoots::default();

    // Promote several segments' worth of garbage.
    let node_size = std::mem::size_of::<Node>();
    let per_round = heap.config().young_budget() / node_size;
    for round in 0..12 {
        for i in 0..per_round {
            let cell = heap
                .allocate(KIND_NODE, node_size, false, &mut roots)
                .unwrap();
            // SAFETY: fresh allocation.
            unsafe {
                (*cell.cast::<Node>()).value = Value::undefined();
                (*cell.cast::<Node>()).next = None;
                (*cell.cast::<Node>()).tag = (round * per_round + i) as u64;
            }
            roots.values.push(Value::object(cell));
        }
    }
    let grown_capacity = heap.old_capacity();

    roots.values.clear();
    heap.collect_full(&mut roots).unwrap();

    assert!(heap.old_used() < SEGMENT_SIZE);
    assert!(
        heap.old_capacity() < grown_capacity,
        "empty segments must leave the old generation"
    );
}
