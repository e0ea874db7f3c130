//! Engine tunables.
//!
//! Mirrors the knobs the host exposes to its administrator: scan pacing,
//! ladder shape and thrash filtering. All values are read at engine
//! construction; `sleep_ms` and the run mode may be flipped at runtime.

/// Run modes for the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Scanner idles; merged pages stay merged.
    Stop,
    /// Scanner merges on every batch.
    Merge,
}

/// Scale used for deduplication ratio numbers, to avoid float arithmetic.
pub const DEDUP_RATIO_SCALE: u64 = 100;

/// Scan ratios are expressed in units of 1/SCAN_RATIO_MAX of an area.
pub const SCAN_RATIO_MAX: u32 = 125;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct UksmParams {
    /// Milliseconds the driving loop should sleep between batches.
    pub sleep_ms: u64,
    /// Pages scanned per batch, before per-rung division.
    pub scan_batch_pages: u64,
    /// Minimum scan ratio for an area, in units of 1/SCAN_RATIO_MAX.
    pub min_scan_ratio: u32,
    /// Multiplier applied to the scan ratio of each successive rung.
    pub scan_ratio_delta: u32,
    /// Thrash filter percentage bound; 0 disables filtering. An area whose
    /// cow/merge ratio exceeds this is treated as having zero dedup ratio.
    pub thrash_threshold: u32,
    /// Upper bound on areas tracked by the inter-area duplication table.
    pub dup_vma_max: usize,
    /// Seed for the sampling permutation and scan-order randomization.
    pub rng_seed: u64,
    /// Initial run mode.
    pub run: RunMode,
}

impl Default for UksmParams {
    fn default() -> Self {
        Self {
            sleep_ms: 20,
            scan_batch_pages: 60000,
            min_scan_ratio: 1,
            scan_ratio_delta: 5,
            thrash_threshold: 0,
            dup_vma_max: 2048,
            rng_seed: 0x5deece66d,
            run: RunMode::Stop,
        }
    }
}

impl UksmParams {
    /// Number of rungs needed so the top rung reaches SCAN_RATIO_MAX.
    pub fn ladder_size(&self) -> usize {
        let mut size = 1;
        let mut sr = self.min_scan_ratio.max(1);
        while sr < SCAN_RATIO_MAX {
            sr = sr.saturating_mul(self.scan_ratio_delta.max(2));
            size += 1;
        }
        size
    }
}
