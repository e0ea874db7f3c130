//! Scan ladder: yield-driven scheduling of areas.
//!
//! Each rung carries a scan ratio; an area lives on exactly one rung and
//! gets `pages * ratio / SCAN_RATIO_MAX` page visits per rung pass. When a
//! round closes, each area's measured deduplication ratio is compared to
//! the round mean: richer areas climb, poorer ones sink. The two lowest
//! rungs additionally get their batch share cut, biasing the engine away
//! from areas that never produced a merge.
//!
//! Inter-area coincidence counts live in a triangular matrix indexed by
//! slot numbers handed out on first duplicate observation and recycled
//! every round.

use alloc::vec;
use alloc::vec::Vec;

use crate::area::SlotRef;
use crate::engine::Uksm;
use crate::params::{DEDUP_RATIO_SCALE, SCAN_RATIO_MAX};

pub struct ScanRung {
    pub scan_ratio: u32,
    pub slots: Vec<SlotRef>,
    /// Round-robin position in `slots`.
    pub cursor: usize,
    pub round_finished: bool,
    pub fully_scanned_slots: usize,
    /// Page-visit budget for the current batch.
    pub pages_to_scan: u64,
}

impl ScanRung {
    fn new(scan_ratio: u32) -> Self {
        Self {
            scan_ratio,
            slots: Vec::new(),
            cursor: 0,
            round_finished: false,
            fully_scanned_slots: 0,
            pages_to_scan: 0,
        }
    }

    pub fn fully_scanned(&self) -> bool {
        self.fully_scanned_slots == self.slots.len() && self.fully_scanned_slots > 0
    }
}

/// Build the ladder: ratios grow geometrically from `min_ratio` until they
/// reach SCAN_RATIO_MAX.
pub fn build_ladder(min_ratio: u32, delta: u32, size: usize) -> Vec<ScanRung> {
    let mut rungs = Vec::with_capacity(size);
    let mut ratio = min_ratio.max(1);
    for _ in 0..size {
        rungs.push(ScanRung::new(ratio));
        ratio = ratio.saturating_mul(delta.max(2));
    }
    rungs
}

/// Triangular coincidence matrix over per-round slot numbers.
pub struct InterVmaTable {
    table: Vec<u32>,
    vma_table: Vec<Option<SlotRef>>,
    pub num: usize,
    pub index_end: usize,
}

impl InterVmaTable {
    pub fn new(max: usize) -> Self {
        Self {
            table: vec![0; max * (max + 1) / 2],
            vma_table: vec![None; max],
            num: 0,
            index_end: 0,
        }
    }

    #[inline]
    fn offset(i: usize, j: usize) -> usize {
        let (hi, lo) = if i < j { (j, i) } else { (i, j) };
        hi * (hi + 1) / 2 + lo
    }

    pub fn get(&self, i: usize, j: usize) -> u32 {
        self.table[Self::offset(i, j)]
    }

    pub fn slot_at(&self, i: usize) -> Option<SlotRef> {
        self.vma_table[i]
    }

    fn assign_index(&mut self, slot: SlotRef) -> usize {
        let mut index = self.index_end;
        for i in 0..=self.index_end.min(self.vma_table.len() - 1) {
            if self.vma_table[i].is_none() {
                index = i;
                break;
            }
        }
        assert!(index < self.vma_table.len(), "inter-area table exhausted");
        self.vma_table[index] = Some(slot);
        self.num += 1;
        if index == self.index_end {
            self.index_end += 1;
        }
        index
    }

    /// Wipe a leaving slot's row and column.
    pub fn clear_slot(&mut self, index: usize) {
        for i in 0..self.index_end {
            self.table[Self::offset(index, i)] = 0;
        }
    }

    pub fn release_index(&mut self, index: usize) {
        self.vma_table[index] = None;
        self.num -= 1;
        if index == self.index_end - 1 {
            self.index_end -= 1;
        }
    }
}

impl Uksm {
    /// Pages of `slot` a rung with `scan_ratio` visits per pass.
    pub(crate) fn vma_random_scan_num(&self, slot: SlotRef, scan_ratio: u32) -> u64 {
        self.slots.get(slot).pages as u64 * scan_ratio as u64 / SCAN_RATIO_MAX as u64
    }

    /// Split the batch budget across rungs by ratio; the two bottom rungs
    /// get theirs cut to keep low-yield areas cheap.
    pub(crate) fn cal_ladder_pages_to_scan(&mut self, num: u64) {
        for rung in self.ladder.iter_mut() {
            rung.pages_to_scan = num * rung.scan_ratio as u64 / SCAN_RATIO_MAX as u64;
        }
        if !self.ladder.is_empty() {
            self.ladder[0].pages_to_scan /= 16;
        }
        if self.ladder.len() > 1 {
            self.ladder[1].pages_to_scan /= 4;
        }
    }

    /// Detach a slot from the rung it sits on, keeping the round-robin
    /// cursor coherent. A cursor wrapping here means the rung finished its
    /// traversal for this round.
    pub(crate) fn rung_remove_slot(&mut self, slot: SlotRef) {
        let rung_idx = self.slots.get(slot).rung;
        let fully = self.slots.get(slot).fully_scanned;
        let rung = &mut self.ladder[rung_idx];

        let pos = rung
            .slots
            .iter()
            .position(|&s| s == slot)
            .expect("slot missing from its rung");
        rung.slots.remove(pos);
        if fully {
            rung.fully_scanned_slots -= 1;
        }
        if pos < rung.cursor {
            rung.cursor -= 1;
        }
        if rung.cursor >= rung.slots.len() {
            rung.cursor = 0;
            rung.round_finished = true;
        }
    }

    /// Put a slot on `target` (or the first higher rung granting it a
    /// non-zero quota).
    pub(crate) fn rung_add_slot(&mut self, slot: SlotRef, target: usize) {
        let mut rung_idx = target;
        let pages_to_scan = loop {
            let quota = self.vma_random_scan_num(slot, self.ladder[rung_idx].scan_ratio);
            if quota > 0 {
                break quota;
            }
            rung_idx += 1;
            assert!(rung_idx < self.ladder.len());
        };

        let fully = self.slots.get(slot).fully_scanned;
        let rung = &mut self.ladder[rung_idx];
        if rung.slots.is_empty() {
            rung.cursor = 0;
        }
        rung.slots.push(slot);
        if fully {
            rung.fully_scanned_slots += 1;
        }

        let s = self.slots.get_mut(slot);
        s.rung = rung_idx;
        s.pages_to_scan = pages_to_scan;
    }

    pub(crate) fn vma_rung_up(&mut self, slot: SlotRef) {
        let rung = self.slots.get(slot).rung;
        if rung + 1 >= self.ladder.len() {
            return;
        }
        self.rung_remove_slot(slot);
        self.rung_add_slot(slot, rung + 1);
    }

    pub(crate) fn vma_rung_down(&mut self, slot: SlotRef) {
        let rung = self.slots.get(slot).rung;
        if rung == 0 {
            return;
        }
        self.rung_remove_slot(slot);
        self.rung_add_slot(slot, rung - 1);
    }

    pub(crate) fn inc_intertab_pair(&mut self, slot1: SlotRef, slot2: SlotRef) {
        let i = match self.slots.get(slot1).ksm_index {
            Some(i) => i,
            None => {
                let i = self.intertab.assign_index(slot1);
                self.slots.get_mut(slot1).ksm_index = Some(i);
                i
            }
        };
        let j = match self.slots.get(slot2).ksm_index {
            Some(j) => j,
            None => {
                let j = self.intertab.assign_index(slot2);
                self.slots.get_mut(slot2).ksm_index = Some(j);
                j
            }
        };
        let off = InterVmaTable::offset(i, j);
        self.intertab.table[off] += 1;
    }

    pub(crate) fn dec_intertab_pair(&mut self, slot1: SlotRef, slot2: SlotRef) {
        let i = self.slots.get(slot1).ksm_index.expect("pair never counted");
        let j = self.slots.get(slot2).ksm_index.expect("pair never counted");
        let off = InterVmaTable::offset(i, j);
        debug_assert!(self.intertab.table[off] > 0);
        self.intertab.table[off] -= 1;
    }

    /// Estimated deduplication ratio of one slot for the closing round,
    /// scaled by DEDUP_RATIO_SCALE, with thrashing areas filtered out.
    pub(crate) fn cal_dedup_ratio(&self, slot: SlotRef) -> u64 {
        let s = self.slots.get(slot);
        if s.pages_scanned == 0 {
            return 0;
        }
        let ksm_index = match s.ksm_index {
            Some(i) => i,
            None => return 0,
        };
        let pages1 = s.pages as u64;
        let scanned1 = s.pages_scanned - s.last_scanned;

        let mut dedup_num: u64 = 0;
        for i in 0..self.intertab.index_end {
            if i == ksm_index {
                continue;
            }
            let slot2 = match self.intertab.slot_at(i) {
                Some(s2) => s2,
                None => continue,
            };
            let s2 = self.slots.get(slot2);
            if s2.pages_scanned == 0 {
                continue;
            }
            let pages2 = s2.pages as u64;
            let scanned2 = s2.pages_scanned - s2.last_scanned;

            let pairs = self.intertab.get(ksm_index, i) as u64;
            if pairs != 0 && scanned1 != 0 && scanned2 != 0 {
                dedup_num += pairs * pages1 / scanned1 * pages2 / scanned2;
            }
        }

        // inner duplicates sit on the diagonal
        let diag = self.intertab.get(ksm_index, ksm_index) as u64;
        if diag != 0 && scanned1 != 0 {
            dedup_num += diag * pages1 / scanned1;
        }

        let mut ret = dedup_num * DEDUP_RATIO_SCALE / pages1;

        if self.params.thrash_threshold > 0 && s.pages_merged > 0 {
            let merged = s.pages_merged as u64;
            let cowed = s.pages_cowed as u64;
            if cowed * 100 / merged > self.params.thrash_threshold as u64 {
                ret = 0;
            } else {
                ret = ret * (merged - cowed) / merged;
            }
        }

        ret
    }

    /// Close a round: grade every area against the round mean, migrate it
    /// up or down, and reset all per-round state.
    pub(crate) fn round_update_ladder(&mut self) {
        let mut ratio_sum: u64 = 0;

        for i in 0..self.intertab.index_end {
            if let Some(slot) = self.intertab.slot_at(i) {
                let ratio = self.cal_dedup_ratio(slot);
                self.slots.get_mut(slot).dedup_ratio = ratio;
                ratio_sum += ratio;
            }
        }

        let slot_num = self.slots.len() as u64;
        let threshold = if slot_num > 0 { ratio_sum / slot_num } else { 0 };

        for i in 0..self.intertab.index_end {
            let slot = match self.intertab.slot_at(i) {
                Some(s) => s,
                None => continue,
            };
            let ratio = self.slots.get(slot).dedup_ratio;
            if ratio != 0 && ratio >= threshold {
                self.vma_rung_up(slot);
            } else {
                self.vma_rung_down(slot);
            }

            self.intertab.clear_slot(i);
            self.intertab.release_index(i);
            let s = self.slots.get_mut(slot);
            s.ksm_index = None;
            s.slot_scanned = false;
            s.dedup_ratio = 0;
        }

        // areas scanned this round without entering the table found no
        // duplicates at all; they sink
        let leftover: Vec<SlotRef> = self
            .ladder
            .iter()
            .flat_map(|r| r.slots.iter().copied())
            .collect();
        for slot in leftover {
            if self.slots.get(slot).slot_scanned {
                debug_assert_eq!(self.slots.get(slot).dedup_ratio, 0);
                self.vma_rung_down(slot);
            }
            self.slots.get_mut(slot).dedup_ratio = 0;
        }

        debug_assert_eq!(self.intertab.num, 0);
        self.intertab.index_end = 0;

        for rung_idx in 0..self.ladder.len() {
            self.ladder[rung_idx].round_finished = false;
            let members = self.ladder[rung_idx].slots.clone();
            for slot in members {
                let fully = {
                    let s = self.slots.get_mut(slot);
                    s.last_scanned = s.pages_scanned;
                    s.slot_scanned = false;
                    s.pages_cowed = 0;
                    s.pages_merged = 0;
                    debug_assert!(s.ksm_index.is_none());
                    core::mem::replace(&mut s.fully_scanned, false)
                };
                if fully {
                    self.ladder[rung_idx].fully_scanned_slots -= 1;
                }
            }
            debug_assert_eq!(self.ladder[rung_idx].fully_scanned_slots, 0);
        }

        self.rshash_adjust();

        self.stats.pages_scanned_last = self.stats.pages_scanned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_ratios_grow_geometrically() {
        let rungs = build_ladder(1, 5, 4);
        let ratios: Vec<u32> = rungs.iter().map(|r| r.scan_ratio).collect();
        assert_eq!(ratios, [1, 5, 25, 125]);
    }

    #[test]
    fn intertab_offsets_are_symmetric_and_unique() {
        assert_eq!(InterVmaTable::offset(2, 5), InterVmaTable::offset(5, 2));
        let mut seen = alloc::collections::BTreeSet::new();
        for i in 0..8 {
            for j in 0..=i {
                assert!(seen.insert(InterVmaTable::offset(i, j)));
            }
        }
    }

    #[test]
    fn intertab_index_recycling() {
        let mut tab = InterVmaTable::new(8);
        let a = tab.assign_index(crate::pool::Handle::from_index(0));
        let b = tab.assign_index(crate::pool::Handle::from_index(1));
        assert_eq!((a, b), (0, 1));
        assert_eq!(tab.index_end, 2);
        tab.release_index(1);
        assert_eq!(tab.index_end, 1);
        tab.release_index(0);
        assert_eq!(tab.index_end, 0);
        assert_eq!(tab.num, 0);
    }
}
