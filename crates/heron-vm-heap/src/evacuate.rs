//! Young collection: stop-the-world evacuation into the old generation.
//!
//! Every reachable young cell is copied to the old allocation point, a
//! forwarding word is installed in the vacated copy, and the referring
//! slot is rewritten. Roots and the card-table remembered set seed the
//! acceptor; a worklist scan of freshly promoted cells closes the
//! transitive set. Afterwards no live pointer anywhere refers to a young
//! address.

use std::collections::VecDeque;
use std::time::Instant;

use crate::cell::{CellPtr, metadata_for, visit_cell};
use crate::heap::{Heap, HeapError};
use crate::roots::{RootSet, SlotAcceptor, WeakAcceptor};
use crate::segment::CARD_SIZE;
use crate::value::Value;

/// Run one young collection.
pub(crate) fn collect_young(heap: &mut Heap, roots: &mut dyn RootSet) -> Result<(), HeapError> {
    let pause_start = Instant::now();
    let young_start = heap.young.payload_start();
    let young_end = heap.young.level();
    if young_start == young_end {
        return Ok(()); // nothing allocated since the last collection
    }

    // Gather the cells behind dirty cards up front; the evacuator holds
    // the heap mutably while it runs.
    let card_cells = collect_dirty_card_cells(heap);

    let mut evac = Evacuator {
        heap: &mut *heap,
        queue: VecDeque::new(),
        young_start,
        young_end,
        promoted_bytes: 0,
        exhausted: false,
    };

    roots.mark_roots(&mut evac);
    for cell in card_cells {
        // SAFETY: card scanning yielded live old-generation cells.
        unsafe { visit_cell(cell, &mut evac) };
    }
    // Worklist scan of the promoted region: each copied cell's slots feed
    // back through the acceptor until no young pointer remains.
    while let Some(cell) = evac.queue.pop_front() {
        // SAFETY: promoted cells are live old-generation cells.
        unsafe { visit_cell(cell, &mut evac) };
    }
    let promoted_bytes = evac.promoted_bytes;
    if evac.exhausted {
        return Err(HeapError::StorageExhausted);
    }

    // Weak references to unforwarded young cells are cleared now, before
    // finalizers run, so finalizers observe post-clear weak state.
    // SAFETY: young headers are live or forwarded until the reset below.
    unsafe { heap.weak.fixup_young(young_start, young_end) };
    let mut weak_fixer = YoungWeakFixer {
        young_start,
        young_end,
    };
    roots.mark_weak_roots(&mut weak_fixer);

    // Finalizers for young cells that did not survive; survivors move to
    // the old generation's finalizable list at their new address.
    let finalizable = std::mem::take(&mut heap.finalizable_young);
    for cell in finalizable {
        // SAFETY: the young segment has not been reset yet.
        let header = unsafe { cell.header() };
        if header.is_forwarded() {
            heap.finalizable_old.push(header.forwarding());
        } else {
            if let Some(finalize) = metadata_for(header.kind()).finalize {
                // SAFETY: dead cell, memory intact, weak slots cleared.
                unsafe { finalize(cell) };
            }
            heap.stats.finalizers_run += 1;
        }
    }

    heap.young.reset();
    // No old-to-young references remain; every card is stale.
    for segment in &mut heap.old {
        segment.clear_cards();
    }

    heap.stats.young_collections += 1;
    heap.stats.bytes_promoted += promoted_bytes as u64;
    heap.stats.note_old_used(heap.old_used());
    let pause = pause_start.elapsed();
    heap.stats.record_pause(pause);
    tracing::debug!(
        promoted_bytes,
        pause_us = pause.as_micros() as u64,
        old_used = heap.old_used(),
        "young collection"
    );
    Ok(())
}

/// Cells in old segments that overlap a dirty card, deduplicated.
fn collect_dirty_card_cells(heap: &Heap) -> Vec<CellPtr> {
    let mut cells = Vec::new();
    for segment in &heap.old {
        let level = segment.level();
        let mut last_pushed = 0usize;
        for card in segment.dirty_cards() {
            let card_start = segment.card_start(card);
            let card_end = card_start + CARD_SIZE;
            let Some(mut addr) = segment.cell_covering_card(card) else {
                continue;
            };
            // Walk whole cells from the covering cell to the card's end.
            while addr < card_end && addr < level {
                // SAFETY: old-generation cells are contiguous and live.
                let size = unsafe { CellPtr::from_addr_unchecked(addr).header().size() };
                if addr + size > card_start && addr > last_pushed {
                    // SAFETY: as above.
                    cells.push(unsafe { CellPtr::from_addr_unchecked(addr) });
                    last_pushed = addr;
                }
                addr += size;
            }
        }
    }
    cells
}

/// The evacuation acceptor: copies unforwarded young cells into the old
/// generation and rewrites the visited slot.
struct Evacuator<'h> {
    heap: &'h mut Heap,
    queue: VecDeque<CellPtr>,
    young_start: usize,
    young_end: usize,
    promoted_bytes: usize,
    exhausted: bool,
}

impl Evacuator<'_> {
    #[inline]
    fn is_young(&self, cell: CellPtr) -> bool {
        let addr = cell.addr();
        addr >= self.young_start && addr < self.young_end
    }

    /// Copy a young cell into the old generation (or return its existing
    /// forwarding target).
    fn evacuate(&mut self, cell: CellPtr) -> CellPtr {
        // SAFETY: young cells keep readable headers until the reset.
        let header = unsafe { cell.header() };
        if header.is_forwarded() {
            return header.forwarding();
        }
        let size = header.size();
        let Some(target) = self.heap.allocate_old_forced(header.kind(), size) else {
            // The storage provider ran dry mid-promotion. Leave the slot
            // pointing at the still-intact young cell; the collection
            // reports fatal exhaustion.
            self.exhausted = true;
            return cell;
        };
        // SAFETY: target is a fresh allocation of `size` bytes; the source
        // is a live young cell of the same size. The copy carries the
        // original header (flags included) over the one the allocator
        // wrote.
        unsafe {
            std::ptr::copy_nonoverlapping(
                cell.addr() as *const u8,
                target.addr() as *mut u8,
                size,
            );
            let mut old_header = header;
            old_header.forward_to(target);
            cell.set_header(old_header);
        }
        self.promoted_bytes += size;
        self.queue.push_back(target);
        target
    }
}

impl SlotAcceptor for Evacuator<'_> {
    unsafe fn value_slot(&mut self, slot: *mut Value) {
        // SAFETY: caller guarantees a valid Value slot.
        let value = unsafe { *slot };
        if let Some(cell) = value.pointer() {
            if self.is_young(cell) {
                let target = self.evacuate(cell);
                // SAFETY: as above.
                unsafe { *slot = value.with_pointer(target) };
            }
        }
    }

    unsafe fn ptr_slot(&mut self, slot: *mut Option<CellPtr>) {
        // SAFETY: caller guarantees a valid pointer slot.
        if let Some(cell) = unsafe { *slot } {
            if self.is_young(cell) {
                let target = self.evacuate(cell);
                // SAFETY: as above.
                unsafe { *slot = Some(target) };
            }
        }
    }
}

/// Weak-root pass after evacuation: survivors follow their forwarding,
/// unforwarded young referents are dropped.
struct YoungWeakFixer {
    young_start: usize,
    young_end: usize,
}

impl WeakAcceptor for YoungWeakFixer {
    unsafe fn weak_ptr_slot(&mut self, slot: *mut Option<CellPtr>) {
        // SAFETY: caller guarantees a valid pointer slot.
        let Some(cell) = (unsafe { *slot }) else { return };
        let addr = cell.addr();
        if addr < self.young_start || addr >= self.young_end {
            return;
        }
        // SAFETY: young headers remain readable during the weak pass.
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
