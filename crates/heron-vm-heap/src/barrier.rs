//! Generational write barriers.
//!
//! Every store of a `Value` or cell pointer into a heap cell goes through
//! these wrappers: when a young pointer lands in an old-generation slot,
//! the card covering the slot is dirtied so the next young collection
//! treats that card as a remembered set entry. Stack slots, handle slots
//! and cells still under construction (not yet visible to the collector)
//! are exempt and use plain writes.

use crate::cell::CellPtr;
use crate::segment::{Generation, dirty_card_covering, generation_of_addr};
use crate::value::Value;

/// Store a `Value` into a heap cell's slot.
///
/// # Safety
/// `slot` must point into a live heap cell (any generation).
#[inline]
pub unsafe fn write_value_slot(slot: *mut Value, value: Value) {
    // SAFETY: per contract.
    unsafe { *slot = value };
    if let Some(target) = value.pointer() {
        // SAFETY: slot and target are both inside live segments.
        unsafe { post_write(slot as usize, target) };
    }
}

/// Store a cell pointer into a heap cell's slot.
///
/// # Safety
/// `slot` must point into a live heap cell (any generation).
#[inline]
pub unsafe fn write_ptr_slot(slot: *mut Option<CellPtr>, target: Option<CellPtr>) {
    // SAFETY: per contract.
    unsafe { *slot = target };
    if let Some(target) = target {
        // SAFETY: as above.
        unsafe { post_write(slot as usize, target) };
    }
}

#[inline]
unsafe fn post_write(slot_addr: usize, target: CellPtr) {
    // SAFETY: both addresses lie inside live segments per the callers'
    // contracts; masking lands on their headers.
    unsafe {
        if generation_of_addr(target.addr()) == Generation::Young
            && generation_of_addr(slot_addr) == Generation::Old
        {
            dirty_card_covering(slot_addr);
        }
    }
}
