//! Full collection: mark-sweep-compact over the old generation.
//!
//! The caller evacuates the nursery first, so every live cell is in the
//! old generation when this runs. Phases:
//!
//! 1. Mark from roots with an explicit mark stack (no native recursion);
//!    symbol ids seen in symbol slots are recorded for the identifier
//!    sweep.
//! 2. Clear weak slots whose referent is unmarked (same collection,
//!    before finalizers).
//! 3. Sweep and forward: dead finalizable cells run their finalizers;
//!    live cells get compacted target addresses, their displaced headers
//!    saved in a side list, forwarding words installed in place.
//! 4. Update references: roots, every live cell's slots, weak slots and
//!    weak roots are rewritten through forwarding.
//! 5. Relocate: copy each live cell to its target and restore its header.
//! 6. Reset levels, card tables and boundary tables; release segments
//!    that became empty; sweep the identifier table.

use std::time::Instant;

use crate::cell::{CellHeader, CellPtr, metadata_for, visit_cell_with_kind};
use crate::heap::Heap;
use crate::roots::{RootSet, SlotAcceptor, SymbolMarkSet, WeakAcceptor};
use crate::value::{SymbolId, Value};

/// Run one full collection. The nursery must already be empty.
pub(crate) fn collect(heap: &mut Heap, roots: &mut dyn RootSet) {
    debug_assert_eq!(heap.young_used(), 0, "nursery must be evacuated first");
    let pause_start = Instant::now();
    let used_before = heap.old_used();

    // Phase 1: mark.
    let mut marker = Marker {
        stack: Vec::new(),
        symbols: SymbolMarkSet::new(),
    };
    roots.mark_roots(&mut marker);
    while let Some(cell) = marker.stack.pop() {
        // SAFETY: marked cells are live old-generation cells.
        unsafe { visit_cell_with_kind(cell, cell.header().kind(), &mut marker) };
    }

    // Phase 2: weak slots of dead referents clear before any finalizer
    // can observe them.
    // SAFETY: headers are intact until phase 3 displaces them.
    unsafe { heap.weak.clear_unmarked() };

    // Finalize dead cells from the finalizable list while their memory is
    // untouched; keep survivors for address fixup below.
    let finalizable = std::mem::take(&mut heap.finalizable_old);
    let mut surviving_finalizable = Vec::with_capacity(finalizable.len());
    for cell in finalizable {
        // SAFETY: headers are intact.
        if unsafe { cell.header() }.is_marked() {
            surviving_finalizable.push(cell);
        } else {
            let kind = unsafe { cell.header() }.kind();
            if let Some(finalize) = metadata_for(kind).finalize {
                // SAFETY: dead cell, memory intact, weak slots cleared.
                unsafe { finalize(cell) };
            }
            heap.stats.finalizers_run += 1;
        }
    }

    // Phase 3: sweep and forward. Targets are assigned by a cursor
    // walking the same segment list from the start, so target addresses
    // never run ahead of source addresses.
    let mut live: Vec<(CellPtr, u64)> = Vec::new();
    let mut new_levels = vec![0usize; heap.old.len()];
    {
        let mut target_seg = 0usize;
        let mut target_addr = heap.old[0].payload_start();
        for i in 0..new_levels.len() {
            new_levels[i] = heap.old[i].payload_start();
        }
        for source_seg in 0..heap.old.len() {
            // SAFETY: cells are contiguous; headers of cells not yet
            // swept are intact (the walker reads each header before the
            // forwarding word replaces it).
            for cell in unsafe { heap.old[source_seg].cells() } {
                // SAFETY: as above.
                let header = unsafe { cell.header() };
                if !header.is_marked() {
                    continue;
                }
                let size = header.size();
                while target_addr + size > heap.old[target_seg].payload_end() {
                    new_levels[target_seg] = target_addr;
                    target_seg += 1;
                    target_addr = heap.old[target_seg].payload_start();
                }
                // SAFETY: target_addr is within the target segment.
                let target = unsafe { CellPtr::from_addr_unchecked(target_addr) };
                target_addr += size;
                live.push((cell, header.raw()));
                let mut forwarded = header;
                forwarded.forward_to(target);
                // SAFETY: displacing the header; the original is saved in
                // the side list.
                unsafe { cell.set_header(forwarded) };
            }
        }
        new_levels[target_seg] = target_addr;
        for level in new_levels.iter_mut().skip(target_seg + 1) {
            *level = 0; // emptied below
        }
    }

    // Phase 4: update references through forwarding.
    let mut updater = Updater;
    roots.mark_roots(&mut updater);
    for &(cell, raw) in &live {
        let kind = CellHeader::from_raw(raw).kind();
        // SAFETY: the cell body at the old address is intact; only the
        // header word was displaced, and the saved kind stands in for it.
        unsafe { visit_cell_with_kind(cell, kind, &mut updater) };
    }
    // SAFETY: surviving referents hold forwarding words.
    unsafe { heap.weak.forward_survivors() };
    let mut weak_updater = FullWeakFixer;
    roots.mark_weak_roots(&mut weak_updater);
    heap.finalizable_old = surviving_finalizable
        .into_iter()
        // SAFETY: survivors were marked, so their headers hold forwarding.
        .map(|cell| unsafe { cell.header() }.forwarding())
        .collect();

    // Phase 5: relocate. The side list is in ascending source order and
    // targets trail sources, so a forward memmove pass is safe.
    for &(cell, raw) in &live {
        // SAFETY: the header holds the forwarding word installed above.
        let target = unsafe { cell.header() }.forwarding();
        let mut header = CellHeader::from_raw(raw);
        header.clear_mark();
        let size = header.size();
        if target != cell {
            // SAFETY: both regions are owned heap memory of `size` bytes;
            // copy handles the overlap direction.
            unsafe {
                std::ptr::copy(cell.addr() as *const u8, target.addr() as *mut u8, size);
            }
        }
        // SAFETY: target is the cell's final location.
        unsafe { target.set_header(header) };
    }

    // Phase 6: levels, cards, boundaries; release empty tail segments.
    for (i, segment) in heap.old.iter_mut().enumerate() {
        if new_levels[i] == 0 {
            segment.reset();
        } else {
            segment.set_level(new_levels[i]);
            segment.clear_cards();
            // SAFETY: the payload now holds contiguous live cells with
            // restored headers.
            unsafe { segment.rebuild_boundaries() };
        }
    }
    while heap.old.len() > 1 {
        let last = heap.old.last().expect("len checked");
        if last.used() != 0 {
            break;
        }
        let segment = heap.old.pop().expect("len checked");
        heap.retire_segment(segment);
    }

    // Identifier table entries whose ids were never seen during marking
    // are freed (reserved and pinned entries are the table's concern).
    roots.sweep_symbols(&marker.symbols);

    let used_after = heap.old_used();
    heap.stats.full_collections += 1;
    heap.stats.bytes_swept += (used_before - used_after) as u64;
    let pause = pause_start.elapsed();
    heap.stats.record_pause(pause);
    tracing::info!(
        reclaimed = used_before - used_after,
        live = used_after,
        segments = heap.old.len(),
        pause_us = pause.as_micros() as u64,
        "full collection"
    );
}

/// Mark acceptor: explicit mark stack, symbol recording, no rewriting.
struct Marker {
    stack: Vec<CellPtr>,
    symbols: SymbolMarkSet,
}

impl Marker {
    #[inline]
    fn mark(&mut self, cell: CellPtr) {
        // SAFETY: reachable cells are live old-generation cells.
        let mut header = unsafe { cell.header() };
        if header.is_marked() {
            return;
        }
        header.set_mark();
        // SAFETY: as above.
        unsafe { cell.set_header(header) };
        self.stack.push(cell);
    }
}

impl SlotAcceptor for Marker {
    unsafe fn value_slot(&mut self, slot: *mut Value) {
        // SAFETY: caller guarantees a valid Value slot.
        if let Some(cell) = unsafe { *slot }.pointer() {
            self.mark(cell);
        }
    }

    unsafe fn ptr_slot(&mut self, slot: *mut Option<CellPtr>) {
        // SAFETY: caller guarantees a valid pointer slot.
        if let Some(cell) = unsafe { *slot } {
            self.mark(cell);
        }
    }

    fn symbol(&mut self, sym: SymbolId) {
        self.symbols.mark(sym);
    }
}

/// Reference updater: rewrites pointer-bearing slots through forwarding.
struct Updater;

impl SlotAcceptor for Updater {
    unsafe fn value_slot(&mut self, slot: *mut Value) {
        // SAFETY: caller guarantees a valid Value slot.
        let value = unsafe { *slot };
        if let Some(cell) = value.pointer() {
            // SAFETY: live referents hold forwarding words.
            let header = unsafe { cell.header() };
            if header.is_forwarded() {
                // SAFETY: as above.
                unsafe { *slot = value.with_pointer(header.forwarding()) };
            }
        }
    }

    unsafe fn ptr_slot(&mut self, slot: *mut Option<CellPtr>) {
        // SAFETY: caller guarantees a valid pointer slot.
        if let Some(cell) = unsafe { *slot } {
            // SAFETY: as above.
            let header = unsafe { cell.header() };
            if header.is_forwarded() {
                // SAFETY: as above.
                unsafe { *slot = Some(header.forwarding()) };
            }
        }
    }
}

/// Weak-root pass: survivors follow forwarding, dead referents clear.
struct FullWeakFixer;

impl WeakAcceptor for FullWeakFixer {
    unsafe fn weak_ptr_slot(&mut self, slot: *mut Option<CellPtr>) {
        // SAFETY: caller guarantees a valid pointer slot.
        let Some(cell) = (unsafe { *slot }) else { return };
        // SAFETY: referent headers are either forwarding words (live) or
        // intact unmarked headers (dead).
        let header = unsafe { cell.header() };
        let replacement = if header.is_forwarded() {
            Some(header.forwarding())
        } else {
            None
        };
        // SAFETY: as above.
        unsafe { *slot = replacement };
    }
}
