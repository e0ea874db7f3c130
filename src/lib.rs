//! UKSM - user page deduplication engine
//!
//! Scans the anonymous memory of user processes, finds pages with equal
//! content across unrelated mappings, and collapses them into one
//! write-protected copy; a later write breaks the sharing through a normal
//! COW fault. The engine is best effort: it may miss sharing and may hold
//! stale entries for a round, but it never blocks user work and never
//! aliases pages whose contents differ.
//!
//! Core pieces:
//! - adaptive random-sampling hash with delta re-hash (`hash`)
//! - stable tree of merged pages, unstable tree of candidates (`stable`,
//!   `unstable`)
//! - yield-driven scan ladder with inter-area statistics (`ladder`)
//! - reverse-mapping graph for walks over every mapping (`rmap`)
//! - hash strength controller (`tuning`)
//!
//! The host memory manager supplies page-table primitives through the
//! [`MemHost`] trait and drives [`scan_batch`] from its worker loop; area
//! lifecycle callbacks go through [`area_added`] / [`area_removed`] and
//! never block on the scanner.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod area;
mod engine;
mod hash;
mod host;
mod ladder;
mod params;
mod pool;
mod rmap;
mod stable;
mod stats;
mod tuning;
mod unstable;

#[cfg(test)]
mod tests;

pub use engine::{MergeErr, SlotQueues, Uksm};
pub use hash::{HASH_STRENGTH_FULL, HASH_STRENGTH_MAX};
pub use host::{
    AnonVmaId, AreaId, FaultOutcome, HostFault, MemHost, MmId, Pfn, PteVal, UnmapOutcome,
    VmFlags, WpPte, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE,
};
pub use params::{RunMode, UksmParams, SCAN_RATIO_MAX};
pub use rmap::WalkControl;
pub use stats::UksmStats;

use alloc::sync::Arc;
use spin::{Mutex, Once};

static UKSM: Once<Mutex<Uksm>> = Once::new();
static QUEUES: Once<Arc<SlotQueues>> = Once::new();

/// Bring the engine up. Called once by the host after its own memory
/// manager is functional; later calls are ignored.
pub fn init(host: Arc<dyn MemHost>, params: UksmParams) {
    UKSM.call_once(|| {
        let engine = Uksm::new(host, params);
        QUEUES.call_once(|| engine.queues());
        Mutex::new(engine)
    });
}

fn engine() -> &'static Mutex<Uksm> {
    UKSM.get().expect("uksm: init() has not run")
}

/// Host callback: a new mapping exists. Eligibility is judged by the
/// scanner on admission, the callback just records it.
pub fn area_added(area: AreaId) {
    if let Some(queues) = QUEUES.get() {
        queues.area_added(area);
    }
}

/// Host callback: a mapping is gone. Teardown happens at the scanner's
/// next safe point.
pub fn area_removed(area: AreaId) {
    if let Some(queues) = QUEUES.get() {
        queues.area_removed(area);
    }
}

/// One scanner batch. The host worker calls this, then sleeps
/// [`sleep_ms`] and reports the sleep with [`note_sleep`].
pub fn scan_batch() {
    engine().lock().scan_batch();
}

pub fn note_sleep() {
    engine().lock().note_sleep();
}

pub fn sleep_ms() -> u64 {
    engine().lock().sleep_ms()
}

pub fn set_run(run: RunMode) {
    engine().lock().set_run(run);
}

pub fn run() -> RunMode {
    engine().lock().run_mode()
}

pub fn stats() -> UksmStats {
    engine().lock().stats().clone()
}

pub fn hash_strength() -> usize {
    engine().lock().hash_strength()
}

/// Host hook from its COW fault path: a merged page of `area` just broke.
pub fn cow_broken(area: AreaId) {
    engine().lock().note_cow_broken(area);
}

/// Referenced-bit poll over every mapping of a merged page.
pub fn page_referenced(pfn: Pfn) -> usize {
    engine().lock().page_referenced_ksm(pfn)
}

/// Unmap every mapping of a merged page; true when fully unmapped.
pub fn try_to_unmap(pfn: Pfn) -> bool {
    engine().lock().try_to_unmap_ksm(pfn)
}

/// Generic reverse walk over a merged page's (area, address) mappings.
pub fn rmap_walk(pfn: Pfn, visit: &mut dyn FnMut(AreaId, u64) -> WalkControl) {
    engine().lock().rmap_walk(pfn, visit)
}

/// Host callback after page migration: rebind the stable node to the new
/// frame.
pub fn migrate_page(new: Pfn, old: Pfn) {
    engine().lock().migrate_page(new, old);
}

/// Host callback when a PFN range goes offline. Taking the engine lock
/// quiesces the scanner; surviving stable nodes in the range are pruned.
pub fn memory_offline(start_pfn: Pfn, end_pfn: Pfn) {
    engine().lock().memory_offline(start_pfn, end_pfn);
}

/// Break COW over a whole range, forcing merged pages private again.
pub fn unmerge_area_range(area: AreaId, start: u64, end: u64) {
    engine().lock().unmerge_area_range(area, start, end);
}
