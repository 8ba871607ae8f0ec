//! GC configuration.

use crate::segment::{PAYLOAD_SIZE, SEGMENT_SIZE};

/// Heap sizing and policy knobs.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Floor the heap never shrinks below (bytes)
    pub min_heap: usize,
    /// Segments pre-seeded into the cache at startup (bytes)
    pub init_heap: usize,
    /// Hard ceiling for the old generation (bytes)
    pub max_heap: usize,
    /// Young generation size (bytes); clamped to one segment payload
    pub young_size: usize,
    /// Return empty segments to the storage provider after full
    /// collections instead of caching them
    pub release_unused: bool,
    /// Old-generation occupancy fraction that schedules a full collection
    pub occupancy_target: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_heap: SEGMENT_SIZE,
            init_heap: 2 * SEGMENT_SIZE,
            max_heap: 128 * SEGMENT_SIZE, // 512MB
            young_size: 512 * 1024,
            release_unused: false,
            occupancy_target: 0.75,
        }
    }
}

impl GcConfig {
    /// Effective young-generation payload budget.
    pub fn young_budget(&self) -> usize {
        self.young_size.clamp(64 * 1024, PAYLOAD_SIZE)
    }

    /// Old-generation segment ceiling implied by `max_heap`.
    pub fn max_old_segments(&self) -> usize {
        (self.max_heap / SEGMENT_SIZE).max(1)
    }

    /// Segments to pre-seed at startup.
    pub fn init_segments(&self) -> usize {
        (self.init_heap / SEGMENT_SIZE).clamp(1, self.max_old_segments())
    }

    /// Segments the heap keeps through `release_unused` shrinking.
    pub fn min_segments(&self) -> usize {
        (self.min_heap / SEGMENT_SIZE).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn young_budget_is_clamped_to_payload() {
        let config = GcConfig {
            young_size: usize::MAX,
            ..Default::default()
        };
        assert_eq!(config.young_budget(), PAYLOAD_SIZE);
    }

    #[test]
    fn segment_counts_derive_from_sizes() {
        let config = GcConfig {
            min_heap: SEGMENT_SIZE,
            init_heap: 3 * SEGMENT_SIZE,
            max_heap: 8 * SEGMENT_SIZE,
            ..Default::default()
        };
        assert_eq!(config.min_segments(), 1);
        assert_eq!(config.init_segments(), 3);
        assert_eq!(config.max_old_segments(), 8);
    }
}
