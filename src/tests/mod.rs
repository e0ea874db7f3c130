//! Engine test suite: a deterministic mock host plus end-to-end merge
//! scenarios. Module-local unit tests live next to their subjects; the
//! cross-component scenarios live here.

mod mock;

pub use mock::MockHost;

use alloc::sync::Arc;

use crate::engine::Uksm;
use crate::host::{AreaId, MmId, PAGE_SIZE};
use crate::params::{RunMode, UksmParams};

/// Two-rung ladder (ratios 25, 125); areas of 5+ pages are admitted and
/// sampled, so promotion and demotion have somewhere to go.
pub fn ladder_params() -> UksmParams {
    UksmParams {
        scan_batch_pages: 2000,
        min_scan_ratio: 25,
        scan_ratio_delta: 5,
        dup_vma_max: 64,
        rng_seed: 0x1234,
        run: RunMode::Merge,
        ..Default::default()
    }
}

/// Single rung at full ratio: every page of every area is visited every
/// round, which makes merge timing deterministic.
pub fn full_scan_params() -> UksmParams {
    UksmParams {
        scan_batch_pages: 6400,
        min_scan_ratio: 125,
        scan_ratio_delta: 5,
        dup_vma_max: 64,
        rng_seed: 0x9e3779b9,
        run: RunMode::Merge,
        ..Default::default()
    }
}

pub fn setup(params: UksmParams) -> (Uksm, Arc<MockHost>) {
    let host = MockHost::new();
    let engine = Uksm::new(host.clone(), params);
    (engine, host)
}

/// Map an area and report it to the engine, as the host's mmap path would.
pub fn add_area(
    engine: &Uksm,
    host: &Arc<MockHost>,
    mm: MmId,
    start: u64,
    pages: usize,
) -> AreaId {
    let area = host.mmap_anon(mm, start, pages);
    engine.queues().area_added(area);
    area
}

/// Drive the scanner until `rounds` more rounds have closed.
pub fn run_rounds(engine: &mut Uksm, rounds: u64) {
    let target = engine.stats().full_scans + rounds;
    for _ in 0..100_000 {
        engine.scan_batch();
        if engine.stats().full_scans >= target {
            return;
        }
    }
    panic!("scanner failed to close {} rounds", rounds);
}

/// A page filled with one repeated byte.
pub fn byte_page(byte: u8) -> [u8; PAGE_SIZE] {
    [byte; PAGE_SIZE]
}

/// A deterministic page unique to `tag`.
pub fn tagged_page(tag: u64) -> [u8; PAGE_SIZE] {
    let mut rng = crate::hash::XorShift64::new(tag.wrapping_mul(0x9e3779b97f4a7c15) | 1);
    let mut page = [0u8; PAGE_SIZE];
    for chunk in page.chunks_mut(8) {
        let val = rng.next_u64().to_le_bytes();
        chunk.copy_from_slice(&val[..chunk.len()]);
    }
    page
}
