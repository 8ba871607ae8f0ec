//! Allocation and young-collection throughput.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use heron_vm_heap::cell::{CellHeader, CellMetadata, CellPtr, CellShape, install_metadata};
use heron_vm_heap::heap::Heap;
use heron_vm_heap::roots::{RootSet, SlotAcceptor, SymbolMarkSet, WeakAcceptor};
use heron_vm_heap::storage::SystemStorageProvider;
use heron_vm_heap::{GcConfig, Value};

const KIND_NODE: u8 = 0;

#[repr(C)]
struct Node {
    header: CellHeader,
    value: Value,
    next: Option<CellPtr>,
}

fn setup() {
    install_metadata(vec![CellMetadata {
        name: "BenchNode",
        shape: CellShape::Fixed(std::mem::size_of::<Node>()),
        value_slots: &[std::mem::offset_of!(Node, value)],
        pointer_slots: &[std::mem::offset_of!(Node, next)],
        symbol_slots: &[],
        array: None,
        finalize: None,
        custom_visit: None,
    }]);
}

#[derive(Default)]
struct BenchRoots {
    values: Vec<Value>,
}

impl RootSet for BenchRoots {
    fn mark_roots(&mut self, acceptor: &mut dyn SlotAcceptor) {
        for slot in &mut self.values {
            // SAFETY: vector elements are valid Value slots.
            unsafe { acceptor.value_slot(slot) };
        }
    }
    fn mark_weak_roots(&mut self, _acceptor: &mut dyn WeakAcceptor) {}
    fn sweep_symbols(&mut self, _marked: &SymbolMarkSet) {}
}

fn bench_alloc(c: &mut Criterion) {
    setup();
    c.bench_function("young_alloc_32b", |b| {
        let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
        let mut roots = BenchRoots::default();
        b.iter(|| {
            let cell = heap
                .allocate(KIND_NODE, std::mem::size_of::<Node>(), false, &mut roots)
                .unwrap();
            // SAFETY: fresh allocation.
            unsafe {
                (*cell.cast::<Node>()).value = Value::number(1.0);
                (*cell.cast::<Node>()).next = None;
            }
            black_box(cell);
        });
    });

    c.bench_function("young_collect_with_survivors", |b| {
        let mut heap = Heap::new(GcConfig::default(), Box::new(SystemStorageProvider)).unwrap();
        let mut roots = BenchRoots::default();
        b.iter(|| {
            roots.values.clear();
            for i in 0..64 {
                let cell = heap
                    .allocate(KIND_NODE, std::mem::size_of::<Node>(), false, &mut roots)
                    .unwrap();
                // SAFETY: fresh allocation.
                unsafe {
                    (*cell.cast::<Node>()).value = Value::number(i as f64);
                    (*cell.cast::<Node>()).next = None;
                }
                if i % 8 == 0 {
                    roots.values.push(Value::object(cell));
                }
            }
            heap.collect_young(&mut roots).unwrap();
            black_box(roots.values.len());
        });
    });
}

criterion_group!(benches, bench_alloc);
criterion_main!(benches);
