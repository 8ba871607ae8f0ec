//! The generational heap.
//!
//! Two generations: a bump-allocated young segment collected by copying
//! into the old generation, and a list of old segments collected by
//! mark-sweep-compact. Allocation failure drives collection; collection
//! itself never fails. When the configured maximum cannot satisfy a
//! request even after a full collection, the caller surfaces an
//! out-of-memory condition as a JS RangeError; storage-provider
//! exhaustion during promotion is unrecoverable and escalates to the
//! embedder's fatal handler.

use thiserror::Error;

use crate::cell::{CellHeader, CellPtr, align_size, metadata_for, metadata_installed};
use crate::config::GcConfig;
use crate::evacuate;
use crate::fullgc;
use crate::roots::RootSet;
use crate::segment::{Generation, PAYLOAD_SIZE, Segment};
use crate::stats::GcStats;
use crate::storage::StorageProvider;
use crate::weak::WeakSlotTable;

/// Unrecoverable allocation outcomes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// The configured maximum heap cannot satisfy the request even after
    /// a full collection. Surfaced to JS as a RangeError.
    #[error("allocation failed: configured maximum heap exhausted")]
    OutOfMemory,
    /// The storage provider ran dry while the collector needed memory to
    /// make progress. Fatal.
    #[error("storage provider exhausted during collection")]
    StorageExhausted,
}

/// The two-generation heap.
pub struct Heap {
    pub(crate) config: GcConfig,
    pub(crate) provider: Box<dyn StorageProvider>,
    pub(crate) young: Segment,
    /// Old segments; the last one accepts new allocations.
    pub(crate) old: Vec<Segment>,
    /// Empty segments ready for reuse.
    pub(crate) cache: Vec<Segment>,
    pub(crate) weak: WeakSlotTable,
    pub(crate) finalizable_young: Vec<CellPtr>,
    pub(crate) finalizable_old: Vec<CellPtr>,
    pub(crate) stats: GcStats,
}

impl Heap {
    /// Create a heap: one young segment, one active old segment, and the
    /// configured number of cache segments pre-seeded from the provider.
    pub fn new(
        config: GcConfig,
        mut provider: Box<dyn StorageProvider>,
    ) -> Result<Heap, HeapError> {
        assert!(
            metadata_installed(),
            "cell metadata must be registered before creating a heap"
        );
        let young = Segment::new(provider.as_mut(), Generation::Young)
            .ok_or(HeapError::StorageExhausted)?;
        let first_old = Segment::new(provider.as_mut(), Generation::Old)
            .ok_or(HeapError::StorageExhausted)?;
        let mut cache = Vec::new();
        for _ in 1..config.init_segments() {
            match Segment::new(provider.as_mut(), Generation::Old) {
                Some(segment) => cache.push(segment),
                None => break,
            }
        }
        Ok(Heap {
            config,
            provider,
            young,
            old: vec![first_old],
            cache,
            weak: WeakSlotTable::new(),
            finalizable_young: Vec::new(),
            finalizable_old: Vec::new(),
            stats: GcStats::default(),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Lifetime statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// The weak slot table.
    pub fn weak_slots(&mut self) -> &mut WeakSlotTable {
        &mut self.weak
    }

    /// Read-only weak slot access.
    pub fn weak_slots_ref(&self) -> &WeakSlotTable {
        &self.weak
    }

    /// Whether a cell currently lives in the young generation.
    pub fn in_young(&self, cell: CellPtr) -> bool {
        self.young.contains(cell.addr())
    }

    /// Bytes allocated in the young generation.
    pub fn young_used(&self) -> usize {
        self.young.used()
    }

    /// Bytes allocated across the old generation.
    pub fn old_used(&self) -> usize {
        self.old.iter().map(Segment::used).sum()
    }

    /// Old-generation capacity currently materialized.
    pub fn old_capacity(&self) -> usize {
        self.old.len() * PAYLOAD_SIZE
    }

    /// Visit every live cell in allocation order (young generation last).
    /// Used by heap-snapshot writers; must not allocate or collect while
    /// iterating.
    pub fn for_each_cell(&self, mut f: impl FnMut(CellPtr)) {
        for segment in &self.old {
            // SAFETY: outside a collection every cell header is live.
            for cell in unsafe { segment.cells() } {
                f(cell);
            }
        }
        // SAFETY: as above.
        for cell in unsafe { self.young.cells() } {
            f(cell);
        }
    }

    /// Allocate a cell. The header is written; the body is uninitialized
    /// and must be fully initialized before the next allocation.
    pub fn allocate(
        &mut self,
        kind: u8,
        size: usize,
        finalizable: bool,
        roots: &mut dyn RootSet,
    ) -> Result<CellPtr, HeapError> {
        let size = align_size(size.max(std::mem::size_of::<CellHeader>()));
        debug_assert!(
            finalizable == (metadata_for(kind).finalize.is_some()),
            "finalizable flag must match the kind's descriptor"
        );
        if size > PAYLOAD_SIZE {
            return Err(HeapError::OutOfMemory);
        }

        let young_budget = self.config.young_budget();
        if size > young_budget {
            // Oversized for the nursery: old generation directly.
            return match self.allocate_old(kind, size, finalizable) {
                Some(cell) => Ok(cell),
                None => {
                    self.collect_full(roots)?;
                    self.allocate_old(kind, size, finalizable)
                        .ok_or(HeapError::OutOfMemory)
                }
            };
        }

        if self.young.used() + size <= young_budget {
            if let Some(cell) = self.young.allocate(kind, size, finalizable) {
                if finalizable {
                    self.finalizable_young.push(cell);
                }
                return Ok(cell);
            }
        }

        self.collect_young(roots)?;
        if self.old_used() > self.config.max_heap {
            // Promotion overshot the configured maximum and a full
            // collection could not bring live data back under it.
            return Err(HeapError::OutOfMemory);
        }
        let cell = self
            .young
            .allocate(kind, size, finalizable)
            .expect("young generation empty after collection");
        if finalizable {
            self.finalizable_young.push(cell);
        }
        Ok(cell)
    }

    /// Evacuate the young generation. Runs a full collection first when
    /// the old generation cannot absorb the promotion within the
    /// configured maximum, and afterwards when occupancy crosses the
    /// configured target.
    pub fn collect_young(&mut self, roots: &mut dyn RootSet) -> Result<(), HeapError> {
        if !self.promotion_fits_soft_cap() {
            // Full collection evacuates the nursery itself.
            return self.collect_full(roots);
        }
        evacuate::collect_young(self, roots)?;
        let occupancy = self.old_used() as f64 / self.config.max_heap as f64;
        if occupancy > self.config.occupancy_target {
            self.collect_full(roots)?;
        }
        Ok(())
    }

    /// Full collection: force-evacuate the nursery, then
    /// mark-sweep-compact the old generation.
    pub fn collect_full(&mut self, roots: &mut dyn RootSet) -> Result<(), HeapError> {
        evacuate::collect_young(self, roots)?;
        fullgc::collect(self, roots);
        Ok(())
    }

    /// Whether promoting everything live in the nursery can stay within
    /// the soft segment cap.
    fn promotion_fits_soft_cap(&self) -> bool {
        let active_room = self.old.last().map_or(0, Segment::available);
        let growth_segments = self
            .config
            .max_old_segments()
            .saturating_sub(self.old.len());
        active_room + growth_segments * PAYLOAD_SIZE >= self.young.used()
    }

    /// Old-generation allocation within the soft segment cap.
    pub(crate) fn allocate_old(
        &mut self,
        kind: u8,
        size: usize,
        finalizable: bool,
    ) -> Option<CellPtr> {
        if let Some(cell) = self.try_allocate_active(kind, size, finalizable) {
            return Some(cell);
        }
        if self.old.len() >= self.config.max_old_segments() {
            return None;
        }
        let segment = self.take_segment()?;
        self.old.push(segment);
        self.try_allocate_active(kind, size, finalizable)
    }

    /// Old-generation allocation for promotion: ignores the soft cap so a
    /// young collection can always complete; the storage provider is the
    /// hard bound.
    pub(crate) fn allocate_old_forced(&mut self, kind: u8, size: usize) -> Option<CellPtr> {
        if let Some(cell) = self.try_allocate_active(kind, size, false) {
            return Some(cell);
        }
        let segment = self.take_segment()?;
        self.old.push(segment);
        self.try_allocate_active(kind, size, false)
    }

    fn try_allocate_active(&mut self, kind: u8, size: usize, finalizable: bool) -> Option<CellPtr> {
        let cell = self.old.last_mut()?.allocate(kind, size, finalizable)?;
        self.stats.note_old_used(self.old_used());
        if finalizable {
            self.finalizable_old.push(cell);
        }
        Some(cell)
    }

    fn take_segment(&mut self) -> Option<Segment> {
        if let Some(mut segment) = self.cache.pop() {
            segment.set_generation(Generation::Old);
            segment.reset();
            return Some(segment);
        }
        Segment::new(self.provider.as_mut(), Generation::Old)
    }

    /// Return a segment to the cache, or to the provider when shrinking
    /// is enabled and the heap stays above its floor.
    pub(crate) fn retire_segment(&mut self, segment: Segment) {
        let total = self.old.len() + self.cache.len();
        if self.config.release_unused && total >= self.config.min_segments() {
            self.provider.delete_storage(segment.into_raw());
            self.stats.segments_released += 1;
        } else {
            self.cache.push(segment);
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Run outstanding finalizers so native-side tables inside cells
        // are dropped, then hand every segment back to the provider.
        for cell in self
            .finalizable_young
            .drain(..)
            .chain(self.finalizable_old.drain(..))
        {
            // SAFETY: finalizable cells are live until teardown.
            let header = unsafe { cell.header() };
            if let Some(finalize) = metadata_for(header.kind()).finalize {
                // SAFETY: the cell matches its kind; memory is intact.
                unsafe { finalize(cell) };
            }
        }
        self.provider.delete_storage(self.young.storage_ptr());
        for segment in self.old.drain(..).chain(self.cache.drain(..)) {
            self.provider.delete_storage(segment.into_raw());
        }
    }
}
