//! The merge engine.
//!
//! One scanner owns this state and drives it batch by batch: pick an area
//! and an offset off the ladder, resolve the page, hash it, try the stable
//! tree, then the unstable tree, merge or park the candidate, and feed the
//! outcome back into the per-area statistics. Host callbacks only touch
//! the slot transition queues; everything else happens under the engine
//! lock held by the caller.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::area::{self, RmapEntry, RmapRef, SlotRef, VmaSlot};
use crate::hash::HashState;
use crate::host::{
    mapping_is_anon, mapping_is_ksm, AreaId, FaultOutcome, MemHost, Pfn, PAGE_SHIFT,
};
use crate::ladder::{build_ladder, InterVmaTable, ScanRung};
use crate::params::{RunMode, UksmParams};
use crate::pool::Pool;
use crate::rmap::{NodeVma, RmapItem};
use crate::stable::{StableNode, StableTree};
use crate::stats::UksmStats;
use crate::tuning::RshashTune;
use crate::unstable::UnstableTree;

/// Merge-path failure kinds. Each has its own recovery; they are never
/// collapsed into a generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeErr {
    /// The page is invalid, locked away, or gone; cannot continue.
    PageInvalid,
    /// Same hash, different content.
    Collision,
    /// The page has changed since it was hashed; volatile this round.
    PageChanged,
}

/// Area transition queues shared with host callbacks.
///
/// Callbacks stay short and never take the engine lock: a new area parks on
/// `new` until the scanner admits it, an area the scanner could not admit
/// parks on `noadd`, and removal moves the area to `del` for the scanner to
/// tear down at its next safe point.
pub struct SlotQueues {
    lists: spin::Mutex<SlotLists>,
}

#[derive(Default)]
struct SlotLists {
    new: Vec<AreaId>,
    noadd: Vec<AreaId>,
    del: Vec<AreaId>,
}

impl SlotQueues {
    pub fn new() -> Self {
        Self {
            lists: spin::Mutex::new(SlotLists::default()),
        }
    }

    /// Host callback: a fresh eligible mapping exists.
    pub fn area_added(&self, area: AreaId) {
        self.lists.lock().new.push(area);
    }

    /// Host callback: a mapping is gone. If the scanner never admitted it
    /// the descriptor is dropped on the spot; otherwise teardown is left to
    /// the scanner.
    pub fn area_removed(&self, area: AreaId) {
        let mut lists = self.lists.lock();
        if let Some(pos) = lists.new.iter().position(|&a| a == area) {
            lists.new.remove(pos);
            return;
        }
        if let Some(pos) = lists.noadd.iter().position(|&a| a == area) {
            lists.noadd.remove(pos);
            return;
        }
        lists.del.push(area);
    }

    fn drain_new(&self) -> Vec<AreaId> {
        core::mem::take(&mut self.lists.lock().new)
    }

    fn park_noadd(&self, area: AreaId) {
        self.lists.lock().noadd.push(area);
    }

    fn take_del(&self) -> Vec<AreaId> {
        core::mem::take(&mut self.lists.lock().del)
    }

    fn del_pending(&self, area: AreaId) -> bool {
        self.lists.lock().del.contains(&area)
    }
}

/// The engine singleton. All counters, trees, the ladder and the hash
/// state live here; the host wraps it in a mutex and a worker loop.
pub struct Uksm {
    pub(crate) host: Arc<dyn MemHost>,
    pub(crate) params: UksmParams,
    pub(crate) stats: UksmStats,
    pub(crate) hash: HashState,
    pub(crate) tune: RshashTune,

    pub(crate) slots: Pool<VmaSlot>,
    pub(crate) rmaps: Pool<RmapItem>,
    pub(crate) node_vmas: Pool<NodeVma>,
    pub(crate) stables: Pool<StableNode>,

    pub(crate) stable_tree: StableTree,
    pub(crate) unstable_tree: UnstableTree,
    pub(crate) ladder: Vec<ScanRung>,
    pub(crate) intertab: InterVmaTable,

    pub(crate) scan_round: u64,
    pub(crate) run: RunMode,
    pub(crate) queues: Arc<SlotQueues>,
    slot_by_area: BTreeMap<AreaId, SlotRef>,
}

impl Uksm {
    pub fn new(host: Arc<dyn MemHost>, params: UksmParams) -> Self {
        let mut hash = HashState::new(params.rng_seed);
        hash.calibrate(&*host);

        let ladder = build_ladder(
            params.min_scan_ratio,
            params.scan_ratio_delta,
            params.ladder_size(),
        );
        let intertab = InterVmaTable::new(params.dup_vma_max);
        let run = params.run;

        let mut engine = Self {
            host,
            params,
            stats: UksmStats::default(),
            hash,
            tune: RshashTune::new(),
            slots: Pool::new(),
            rmaps: Pool::new(),
            node_vmas: Pool::new(),
            stables: Pool::new(),
            stable_tree: StableTree::new(),
            unstable_tree: UnstableTree::new(),
            ladder,
            intertab,
            scan_round: 1,
            run,
            queues: Arc::new(SlotQueues::new()),
            slot_by_area: BTreeMap::new(),
        };
        engine.cal_ladder_pages_to_scan(engine.params.scan_batch_pages);
        log::info!(
            "mm/uksm: engine up, {} rungs, hash strength {}",
            engine.ladder.len(),
            engine.hash.strength
        );
        engine
    }

    pub fn stats(&self) -> &UksmStats {
        &self.stats
    }

    pub fn hash_strength(&self) -> usize {
        self.hash.strength
    }

    pub fn run_mode(&self) -> RunMode {
        self.run
    }

    pub fn set_run(&mut self, run: RunMode) {
        self.run = run;
    }

    pub fn set_sleep_ms(&mut self, ms: u64) {
        self.params.sleep_ms = ms;
    }

    pub fn sleep_ms(&self) -> u64 {
        self.params.sleep_ms
    }

    pub fn set_scan_batch_pages(&mut self, pages: u64) {
        self.params.scan_batch_pages = pages;
        self.cal_ladder_pages_to_scan(pages);
    }

    pub fn set_thrash_threshold(&mut self, percent: u32) {
        self.params.thrash_threshold = percent;
    }

    /// Handle on the callback queues, safe to use from host threads.
    pub fn queues(&self) -> Arc<SlotQueues> {
        self.queues.clone()
    }

    pub(crate) fn slot_of(&self, area: AreaId) -> Option<SlotRef> {
        self.slot_by_area.get(&area).copied()
    }

    /// The driving loop reports each sleep it takes between batches.
    pub fn note_sleep(&mut self) {
        self.stats.sleep_times += 1;
    }

    /// Host hook: a write fault just broke COW on a merged page of `area`.
    pub fn note_cow_broken(&mut self, area: AreaId) {
        if let Some(&slot) = self.slot_by_area.get(&area) {
            self.slots.get_mut(slot).pages_cowed += 1;
        }
    }

    /// One scanner batch: admit pending areas, then spend the batch budget
    /// across the ladder.
    pub fn scan_batch(&mut self) {
        if self.run != RunMode::Merge {
            return;
        }
        self.enter_all_slots();
        self.do_scan();
    }

    // ---- slot admission and teardown ----

    pub(crate) fn enter_all_slots(&mut self) {
        for area in self.queues.drain_new() {
            let added = self.host.area_flags(area).can_enter() && self.vma_enter(area);
            if !added {
                self.queues.park_noadd(area);
            }
        }
    }

    /// Admit one area at the bottom rung. Fails when even the bottom ratio
    /// grants it no pages.
    fn vma_enter(&mut self, area: AreaId) -> bool {
        let pages = self.host.area_pages(area);
        if pages == 0 {
            return false;
        }
        let slot = self.slots.alloc(VmaSlot::new(
            area,
            self.host.area_mm(area),
            self.host.area_start(area),
            pages,
        ));
        if self.vma_random_scan_num(slot, self.ladder[0].scan_ratio) == 0 {
            self.slots.free(slot);
            return false;
        }
        self.rung_add_slot(slot, 0);
        self.slot_by_area.insert(area, slot);
        true
    }

    /// Drain the delete queue; the host callback only parks areas there.
    fn cleanup_vma_slots(&mut self) {
        for area in self.queues.take_del() {
            if let Some(slot) = self.slot_by_area.remove(&area) {
                self.del_vma_slot(slot);
            }
        }
    }

    /// Tear one slot down: leave the ladder, vacate the inter-area table,
    /// unlink and free every rmap item, release the entry pool.
    fn del_vma_slot(&mut self, slot: SlotRef) {
        self.rung_remove_slot(slot);

        if let Some(index) = self.slots.get(slot).ksm_index {
            self.intertab.clear_slot(index);
            self.intertab.release_index(index);
            self.slots.get_mut(slot).ksm_index = None;
        }

        let mut items: Vec<RmapRef> = Vec::new();
        {
            let s = self.slots.get(slot);
            for chunk in 0..s.chunk_count() {
                if let Some(entries) = s.chunk_entries(chunk) {
                    items.extend(entries.iter().filter_map(|e| e.item()));
                }
            }
        }
        for item in items {
            self.remove_rmap_item_from_tree(item);
            self.rmaps.free(item);
        }
        for chunk in 0..self.slots.get(slot).chunk_count() {
            self.slots.get_mut(slot).drop_chunk(chunk);
        }

        self.slots.free(slot);
    }

    // ---- the batch loop ----

    fn rung_fully_scanned(&self, rung: usize) -> bool {
        self.ladder[rung].fully_scanned()
    }

    /// Spend the ladder's budgets, top rung first. Budget left on a rung
    /// whose areas are all fully scanned cascades down so high rungs never
    /// stall the batch. Runs until every rung is out of budget or out of
    /// slots, closing the round when the ladder completes one.
    fn do_scan(&mut self) {
        let mut rest_pages: u64 = 0;

        loop {
            let scanned_at_start = self.stats.pages_scanned;

            for rung_idx in (0..self.ladder.len()).rev() {
                if self.ladder[rung_idx].pages_to_scan == 0 {
                    continue;
                }
                if self.ladder[rung_idx].slots.is_empty() {
                    self.ladder[rung_idx].pages_to_scan = 0;
                    continue;
                }
                if self.rung_fully_scanned(rung_idx) {
                    rest_pages += core::mem::take(&mut self.ladder[rung_idx].pages_to_scan);
                    continue;
                }

                self.ladder[rung_idx].pages_to_scan += rest_pages;
                rest_pages = 0;
                self.scan_rung(rung_idx, &mut rest_pages);
            }

            let mut round_finished = true;
            let mut all_rungs_empty = true;
            for rung in &self.ladder {
                if !rung.slots.is_empty() {
                    all_rungs_empty = false;
                    if !rung.round_finished {
                        round_finished = false;
                    }
                    break;
                }
            }
            if all_rungs_empty {
                round_finished = false;
            }

            self.cleanup_vma_slots();

            if round_finished {
                self.round_update_ladder();
                self.scan_round += 1;
                self.stats.full_scans += 1;
                self.unstable_tree.reset();
                log::debug!(
                    "mm/uksm: round {} closed, shared={} sharing={}",
                    self.scan_round - 1,
                    self.stats.pages_shared,
                    self.stats.pages_sharing
                );
            }

            let budget_left = self
                .ladder
                .iter()
                .any(|r| !r.slots.is_empty() && r.pages_to_scan > 0);
            // bail when every remaining slot is lock-contended, otherwise
            // the leftover budget would spin the loop
            let progressed = self.stats.pages_scanned != scanned_at_start;
            if !budget_left || (!progressed && !round_finished) {
                break;
            }
        }

        self.cal_ladder_pages_to_scan(self.params.scan_batch_pages);
    }

    /// Spend one rung's budget, round-robin over its slots.
    fn scan_rung(&mut self, rung_idx: usize, rest_pages: &mut u64) {
        while self.ladder[rung_idx].pages_to_scan > 0 {
            let slot = match self.lock_next_slot(rung_idx) {
                Some(s) => s,
                None => break,
            };
            self.ladder[rung_idx].pages_to_scan -= 1;

            if !self.slots.get(slot).fully_scanned {
                self.scan_vma_one_page(slot);
            }
            let mm = self.slots.get(slot).mm;
            self.host.mm_read_unlock(mm);

            let advance = {
                let s = self.slots.get(slot);
                s.fully_scanned
                    || (s.pages_scanned > 0
                        && s.pages_to_scan > 0
                        && s.pages_scanned % s.pages_to_scan == 0)
            };
            if advance {
                let rung = &mut self.ladder[rung_idx];
                rung.cursor += 1;
                if rung.cursor >= rung.slots.len() {
                    // every slot on this rung has been traveled this round
                    rung.round_finished = true;
                    rung.cursor = 0;
                    if rung.fully_scanned() {
                        *rest_pages += core::mem::take(&mut rung.pages_to_scan);
                        break;
                    }
                }
            }
        }
    }

    /// Pick the slot under the cursor with its mm read lock taken. On
    /// contention, skip forward past every slot of the same busy process.
    fn lock_next_slot(&mut self, rung_idx: usize) -> Option<SlotRef> {
        loop {
            self.cleanup_vma_slots();
            let rung = &self.ladder[rung_idx];
            if rung.slots.is_empty() {
                return None;
            }
            let slot = rung.slots[rung.cursor];
            let (area, mm) = {
                let s = self.slots.get(slot);
                (s.area, s.mm)
            };

            if self.queues.del_pending(area) {
                // picked up by cleanup_vma_slots on the next spin
                continue;
            }

            let locked = self.host.mm_try_read_lock(mm);
            if locked {
                if !self.host.mm_exiting(mm) {
                    return Some(slot);
                }
                self.host.mm_read_unlock(mm);
            }
            self.stats.skip_lock_busy += 1;

            // skip the other slots of the same busy process
            let rung = &self.ladder[rung_idx];
            let next = rung.slots[rung.cursor + 1..]
                .iter()
                .position(|&s| self.slots.get(s).mm != mm);
            match next {
                Some(off) => {
                    let cursor = self.ladder[rung_idx].cursor + 1 + off;
                    self.ladder[rung_idx].cursor = cursor;
                }
                None => return None,
            }
        }
    }

    // ---- per page scan ----

    /// Scan the next page of `slot` per its random permutation. Called with
    /// the slot's mm read lock held.
    fn scan_vma_one_page(&mut self, slot: SlotRef) {
        if let Some(item) = self.get_next_rmap_item(slot) {
            let page = self.rmaps.get(item).page;
            let already_merged =
                mapping_is_ksm(self.host.page_mapping(page)) && self.rmaps.get(item).is_stable();
            if !already_merged {
                self.cmp_and_merge_page(item);
            }
            self.host.put_page(page);
        }

        let fully = {
            let s = self.slots.get_mut(slot);
            s.pages_scanned += 1;
            s.slot_scanned = true;
            if s.vma_fully_scanned() {
                s.fully_scanned = true;
                true
            } else {
                false
            }
        };
        if fully {
            let rung = self.slots.get(slot).rung;
            self.ladder[rung].fully_scanned_slots += 1;
        }
    }

    /// Resolve the slot's next scan position: lazily swap in the random
    /// permutation, materialize the pool cell, follow the page, and attach
    /// (or allocate) the rmap item. Returns None when the position holds no
    /// scannable anonymous page.
    pub(crate) fn get_next_rmap_item(&mut self, slot: SlotRef) -> Option<RmapRef> {
        let (pages, scan_index) = {
            let s = self.slots.get(slot);
            (s.pages as u64, s.pages_scanned % s.pages as u64)
        };

        if VmaSlot::chunk_boundary(scan_index) {
            self.slots.get_mut(slot).try_free_chunk(scan_index - 1);
        }

        if self.slots.get(slot).vma_fully_scanned() {
            // a fresh traversal begins: restore entry order if chunks were
            // reclaimed, and re-randomize
            if self.slots.get(slot).need_sort {
                let (s, rmaps) = (self.slots.get_mut(slot), &mut self.rmaps);
                area::sort_rmap_entry_list(s, rmaps);
            }
            self.slots.get_mut(slot).need_rerand = true;
        }

        {
            let s = self.slots.get_mut(slot);
            let entry = s.entry_get(scan_index, true).unwrap();
            if entry.is_new() {
                let addr = s.index_orig_addr(scan_index);
                s.entry_set(scan_index, RmapEntry::Addr(addr));
            }
        }

        let mut swap_index = scan_index;
        if self.slots.get(slot).need_rerand {
            let rand_range = pages - scan_index;
            swap_index = scan_index + self.hash.rng.below(rand_range);
        }

        if swap_index != scan_index {
            let s = self.slots.get_mut(slot);
            let entry = s.entry_get(swap_index, true).unwrap();
            if entry.is_new() {
                let addr = s.index_orig_addr(swap_index);
                s.entry_set(swap_index, RmapEntry::Addr(addr));
            }
            area::swap_entries(s, &mut self.rmaps, scan_index, swap_index);
        }

        let entry = self.slots.get_mut(slot).entry_get(scan_index, false).unwrap();
        let addr = match entry {
            RmapEntry::Addr(a) => a,
            RmapEntry::Item(r) => self.rmaps.get(r).address(),
            RmapEntry::New => unreachable!(),
        };
        let area = self.slots.get(slot).area;

        let page = match self.host.follow_page(area, addr, true) {
            Some(p) => p,
            None => {
                self.stats.skip_page_invalid += 1;
                self.free_entry_item(slot, scan_index);
                return None;
            }
        };
        if !mapping_is_anon(self.host.page_mapping(page)) {
            self.host.put_page(page);
            self.stats.skip_page_invalid += 1;
            self.free_entry_item(slot, scan_index);
            return None;
        }

        let item = match entry.item() {
            Some(r) => r,
            None => {
                let r = self.rmaps.alloc(RmapItem::new(slot, addr, scan_index));
                let s = self.slots.get_mut(slot);
                s.entry_set(scan_index, RmapEntry::Item(r));
                s.inc_chunk_count(scan_index);
                r
            }
        };
        // the page behind the address may have changed since the last visit
        self.rmaps.get_mut(item).page = page;
        Some(item)
    }

    /// Park the cell's address back and drop its rmap item, if any.
    fn free_entry_item(&mut self, slot: SlotRef, index: u64) {
        let entry = self.slots.get_mut(slot).entry_get(index, false);
        if let Some(RmapEntry::Item(item)) = entry {
            let addr = self.rmaps.get(item).address();
            self.slots.get_mut(slot).entry_set(index, RmapEntry::Addr(addr));
            self.remove_rmap_item_from_tree(item);
            self.slots.get_mut(slot).dec_chunk_count(index);
            self.rmaps.free(item);
        }
    }

    // ---- merge protocol ----

    /// The per-page decision: stable-tree lookup, else unstable-tree
    /// lookup, else park the page as this round's candidate.
    pub(crate) fn cmp_and_merge_page(&mut self, item: RmapRef) {
        self.remove_rmap_item_from_tree(item);

        let page = self.rmaps.get(item).page;
        let hash = {
            let host = self.host.clone();
            let bytes = crate::host::page_bytes(&*host, page);
            self.hash.page_hash(bytes, true)
        };
        self.stats.pages_scanned += 1;

        if let Some(kpage) = self.stable_tree_search(item, hash) {
            match self.try_to_merge_with_ksm_page(item, kpage, hash) {
                Ok(()) => {
                    // the page lock serializes against reverse walks
                    self.host.page_lock(kpage);
                    let stable = self
                        .page_stable_node(kpage)
                        .expect("merged onto a page without a stable node");
                    self.stable_tree_append(item, stable);
                    self.host.page_unlock(kpage);
                    self.host.put_page(kpage);
                    return;
                }
                Err(err) => {
                    self.host.put_page(kpage);
                    self.account_merge_err(err);
                    // a sub-tree collision will keep recurring if this page
                    // later merges in the unstable tree; abort instead
                    if err == MergeErr::Collision && self.rmaps.get(item).hash_max != 0 {
                        return;
                    }
                }
            }
        }

        let tree_item = match self.unstable_tree_search_insert(item, hash) {
            Some(t) => t,
            None => return,
        };

        match self.try_to_merge_two_pages(item, tree_item) {
            Ok(()) => {
                // both pages now map item's frame; publish it
                let kpage = self.rmaps.get(item).page;
                self.remove_rmap_item_from_tree(tree_item);
                self.host.page_lock(kpage);
                let (stable, ok1, ok2) = self.stable_tree_insert(kpage, hash, item, tree_item);
                if ok1 {
                    self.stable_tree_append(item, stable.unwrap());
                } else {
                    self.break_cow(item);
                }
                if ok2 {
                    self.stable_tree_append(tree_item, stable.unwrap());
                } else {
                    self.break_cow(tree_item);
                }
                self.host.page_unlock(kpage);
            }
            Err(MergeErr::Collision) => {
                self.unstable_insert_collision_sibling(item, tree_item, hash);
            }
            Err(err) => self.account_merge_err(err),
        }

        let tree_page = self.rmaps.get(tree_item).page;
        self.host.put_page(tree_page);
        let tree_mm = self.slots.get(self.rmaps.get(tree_item).slot).mm;
        self.host.mm_read_unlock(tree_mm);
    }

    fn account_merge_err(&mut self, err: MergeErr) {
        match err {
            MergeErr::PageInvalid => self.stats.skip_page_invalid += 1,
            MergeErr::PageChanged => self.stats.skip_page_changed += 1,
            // collisions are charged through the hash cost counters
            MergeErr::Collision => {}
        }
    }

    /// Byte-wise page comparison; charges the compare cost when asked.
    pub(crate) fn memcmp_pages(&mut self, p1: Pfn, p2: Pfn, cost_accounting: bool) -> bool {
        let host = self.host.clone();
        let b1 = crate::host::page_bytes(&*host, p1);
        let b2 = crate::host::page_bytes(&*host, p2);
        if cost_accounting {
            self.hash.neg += self.hash.memcmp_cost;
        }
        b1 == b2
    }

    fn pages_identical(&self, p1: Pfn, p2: Pfn) -> bool {
        let host = self.host.clone();
        let b1 = crate::host::page_bytes(&*host, p1);
        let b2 = crate::host::page_bytes(&*host, p2);
        b1 == b2
    }

    /// Is this really a hash collision, or did the page change under us?
    /// Recompute at whichever level collided and compare.
    fn check_collision(&mut self, item: RmapRef, hash: u32) -> MergeErr {
        let page = self.rmaps.get(item).page;
        let host = self.host.clone();
        let bytes = crate::host::page_bytes(&*host, page);

        let cached_max = self.rmaps.get(item).hash_max;
        if cached_max != 0 {
            // collided in the second level
            self.hash.neg +=
                self.hash.memcmp_cost + (crate::hash::HASH_STRENGTH_MAX - self.hash.strength) as u64;
            if cached_max == self.hash.page_hash_max(bytes, hash) {
                MergeErr::Collision
            } else {
                MergeErr::PageChanged
            }
        } else {
            self.hash.neg += self.hash.memcmp_cost + self.hash.strength as u64;
            if self.hash.sample_hash(bytes, self.hash.strength) == hash {
                MergeErr::Collision
            } else {
                MergeErr::PageChanged
            }
        }
    }

    /// Merge `item`'s page into an existing ksm page: write-protect, prove
    /// the contents identical, repoint the PTE.
    fn try_to_merge_with_ksm_page(
        &mut self,
        item: RmapRef,
        kpage: Pfn,
        hash: u32,
    ) -> Result<(), MergeErr> {
        let (area, mm) = {
            let s = self.slots.get(self.rmaps.get(item).slot);
            (s.area, s.mm)
        };
        if self.host.mm_exiting(mm) {
            return Err(MergeErr::PageInvalid);
        }

        let page = self.rmaps.get(item).page;
        if page == kpage {
            // ksm page forked into this mapping
            return Ok(());
        }
        if !mapping_is_anon(self.host.page_mapping(page))
            || !mapping_is_ksm(self.host.page_mapping(kpage))
        {
            return Err(MergeErr::PageInvalid);
        }

        // trylock only: better to scan on than wait on a busy page
        if !self.host.page_trylock(page) {
            self.stats.skip_lock_busy += 1;
            return Err(MergeErr::PageInvalid);
        }

        let result = match self.host.write_protect_page(area, page) {
            Ok(wp) => {
                if self.pages_identical(page, kpage) {
                    self.host
                        .replace_page(area, page, kpage, wp.wprot)
                        .map_err(|_| MergeErr::PageInvalid)
                } else {
                    Err(self.check_collision(item, hash))
                }
            }
            Err(_) => Err(MergeErr::PageInvalid),
        };

        self.host.page_unlock(page);
        result
    }

    /// Merge two unmerged pages: write-protect the first and upgrade it to
    /// a ksm page, then repoint the second mapping at it. Failure restores
    /// the first PTE instead of leaving a half-merge behind.
    fn try_to_merge_two_pages(
        &mut self,
        item: RmapRef,
        tree_item: RmapRef,
    ) -> Result<(), MergeErr> {
        let page = self.rmaps.get(item).page;
        let tree_page = self.rmaps.get(tree_item).page;
        let (area1, addr1) = {
            let it = self.rmaps.get(item);
            (self.slots.get(it.slot).area, it.address())
        };
        let area2 = self.slots.get(self.rmaps.get(tree_item).slot).area;

        if page == tree_page {
            return Err(MergeErr::PageInvalid);
        }
        if !mapping_is_anon(self.host.page_mapping(page))
            || !mapping_is_anon(self.host.page_mapping(tree_page))
        {
            return Err(MergeErr::PageInvalid);
        }

        if !self.host.page_trylock(page) {
            self.stats.skip_lock_busy += 1;
            return Err(MergeErr::PageInvalid);
        }
        let wp1 = match self.host.write_protect_page(area1, page) {
            Ok(wp) => wp,
            Err(_) => {
                self.host.page_unlock(page);
                return Err(MergeErr::PageInvalid);
            }
        };

        // while the page lock is held, upgrade the page to a ksm page with
        // no stable node yet; stable_tree_insert fills it in
        let saved_mapping = self.host.page_mapping(page);
        self.set_page_stable_node(page, None);
        self.host.mark_page_accessed(page);
        self.host.page_unlock(page);

        let err = 'attempt: {
            if !self.host.page_trylock(tree_page) {
                self.stats.skip_lock_busy += 1;
                break 'attempt MergeErr::PageInvalid;
            }
            let wp2 = match self.host.write_protect_page(area2, tree_page) {
                Ok(wp) => wp,
                Err(_) => {
                    self.host.page_unlock(tree_page);
                    break 'attempt MergeErr::PageInvalid;
                }
            };

            if self.pages_identical(page, tree_page) {
                let replaced = self.host.replace_page(area2, tree_page, page, wp2.wprot);
                self.host.page_unlock(tree_page);
                match replaced {
                    Ok(()) => return Ok(()),
                    Err(_) => break 'attempt MergeErr::PageInvalid,
                }
            }

            // contents differ: separate a genuine collision from a page
            // that changed after hashing
            let same_hash = {
                let host = self.host.clone();
                let b1 = crate::host::page_bytes(&*host, page);
                let b2 = crate::host::page_bytes(&*host, tree_page);
                let strength = self.hash.strength;
                self.hash.sample_hash(b1, strength) == self.hash.sample_hash(b2, strength)
            };
            self.host.page_unlock(tree_page);
            if same_hash {
                self.hash.neg += self.hash.memcmp_cost + 2 * self.hash.strength as u64;
                MergeErr::Collision
            } else {
                MergeErr::PageChanged
            }
        };

        // undo the first write-protect and the ksm upgrade
        self.host.page_lock(page);
        if self
            .host
            .restore_pte(area1, addr1, wp1.orig, wp1.wprot)
            .is_ok()
        {
            self.host.set_page_mapping(page, saved_mapping);
        }
        self.host.page_unlock(page);
        Err(err)
    }

    /// Last-chance merge when a freshly merged pair turns out identical to
    /// an existing stable page: repoint both mappings at the stable copy
    /// if their PTEs are still the write-protected ones.
    pub(crate) fn try_merge_with_stable(
        &mut self,
        item1: RmapRef,
        item2: RmapRef,
        oldpage: Pfn,
        tree_page: Pfn,
    ) -> (bool, bool) {
        if oldpage == tree_page {
            return (true, true);
        }
        let mapping = self.host.page_mapping(oldpage);
        if !mapping_is_anon(mapping) || !mapping_is_ksm(mapping) {
            return (false, false);
        }

        let (area1, addr1) = {
            let it = self.rmaps.get(item1);
            (self.slots.get(it.slot).area, it.address())
        };
        let (area2, addr2) = {
            let it = self.rmaps.get(item2);
            (self.slots.get(it.slot).area, it.address())
        };

        // cannot take nested pte locks; handle the two mappings in turn
        let ok1 = match self.host.pte_snapshot(area1, addr1) {
            Some(pte)
                if self.host.pte_pfn(pte) == Some(oldpage) && !self.host.pte_writable(pte) =>
            {
                self.host
                    .replace_page(area1, oldpage, tree_page, pte)
                    .is_ok()
            }
            // writable again means it changed under us; abort
            _ => false,
        };
        if !ok1 {
            return (false, false);
        }

        let ok2 = match self.host.pte_snapshot(area2, addr2) {
            Some(pte)
                if self.host.pte_pfn(pte) == Some(oldpage) && !self.host.pte_writable(pte) =>
            {
                self.host
                    .replace_page(area2, oldpage, tree_page, pte)
                    .is_ok()
            }
            _ => false,
        };

        (ok1, ok2)
    }

    /// Validate an unstable-tree candidate and pin it: mm read lock taken,
    /// page reference acquired, cached mapping double-checked.
    pub(crate) fn get_tree_rmap_item_page(&mut self, tree_item: RmapRef) -> Result<(), ()> {
        enum Fail {
            Busy,
            Invalid,
        }

        let (area, mm) = {
            let s = self.slots.get(self.rmaps.get(tree_item).slot);
            (s.area, s.mm)
        };

        let outcome = (|| {
            if self.queues.del_pending(area) {
                return Err(Fail::Busy);
            }
            if !self.host.mm_try_read_lock(mm) {
                return Err(Fail::Busy);
            }
            if self.host.mm_exiting(mm) {
                self.host.mm_read_unlock(mm);
                return Err(Fail::Invalid);
            }
            let page = self.rmaps.get(tree_item).page;
            if !self.host.try_get_page(page) {
                self.host.mm_read_unlock(mm);
                return Err(Fail::Invalid);
            }
            let addr = self.rmaps.get(tree_item).address();
            if self.host.page_anon_vma(page) != self.host.area_anon_vma(area)
                || self.host.page_address_in_area(page, area) != Some(addr)
            {
                self.host.put_page(page);
                self.host.mm_read_unlock(mm);
                return Err(Fail::Invalid);
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(()),
            Err(Fail::Busy) => {
                self.stats.skip_lock_busy += 1;
                Err(())
            }
            Err(Fail::Invalid) => {
                // its cached mapping is gone; drop it from the tree
                self.remove_rmap_item_from_tree(tree_item);
                self.stats.skip_page_invalid += 1;
                Err(())
            }
        }
    }

    // ---- COW breaking ----

    /// Force a write fault so the mapping detaches from the merged page.
    pub(crate) fn break_cow(&mut self, item: RmapRef) {
        let (area, mm, addr) = {
            let it = self.rmaps.get(item);
            let s = self.slots.get(it.slot);
            (s.area, s.mm, it.address())
        };
        if self.host.mm_exiting(mm) {
            return;
        }
        self.break_ksm(area, addr);
    }

    /// The fault loop: only a ksm page gets faulted, and the loop retries
    /// until the fault reports the COW actually broken.
    fn break_ksm(&mut self, area: AreaId, addr: u64) {
        loop {
            let page = match self.host.follow_page(area, addr, true) {
                Some(p) => p,
                None => break,
            };
            let outcome = if mapping_is_ksm(self.host.page_mapping(page)) {
                self.host.handle_write_fault(area, addr)
            } else {
                FaultOutcome::Wrote
            };
            self.host.put_page(page);

            match outcome {
                FaultOutcome::Wrote | FaultOutcome::Sigbus => break,
                FaultOutcome::Oom => {
                    self.stats.skip_oom += 1;
                    break;
                }
                FaultOutcome::Retry => continue,
            }
        }
    }

    /// Unmerge an address range by breaking COW page by page; merged pages
    /// revert to private copies on the next write anyway, this just forces
    /// it now.
    pub fn unmerge_area_range(&mut self, area: AreaId, start: u64, end: u64) {
        let mm = self.host.area_mm(area);
        let mut addr = start;
        while addr < end {
            if self.host.mm_exiting(mm) {
                break;
            }
            self.break_ksm(area, addr);
            addr += 1 << PAGE_SHIFT;
        }
    }

    // ---- invariants (test support) ----

    /// Structural invariant sweep, used by the test suite after every
    /// scenario step.
    #[cfg(test)]
    pub(crate) fn verify_invariants(&self) {
        // each rmap item is in at most one tree
        let mut stable_flagged = 0u64;
        for (_, item) in self.rmaps.iter() {
            assert!(!(item.is_stable() && item.is_unstable()));
            if item.is_stable() {
                stable_flagged += 1;
                assert!(item.head.is_some());
            }
        }
        // stable counters match the stable-flagged population
        assert_eq!(
            self.stats.pages_shared + self.stats.pages_sharing,
            stable_flagged
        );
        // unshared counts the unstable-flagged population
        let unstable_flagged = self.rmaps.iter().filter(|(_, i)| i.is_unstable()).count() as u64;
        assert_eq!(self.stats.pages_unshared, unstable_flagged);
        // a stable node's page either still wears its keyhole token, or the
        // page is gone (mapping reset) and the node awaits reaping; the
        // token never names a different node
        for (handle, node) in self.stables.iter() {
            let token = self.host.page_mapping(node.kpfn);
            assert!(
                token == crate::stable::stable_token(handle) || !mapping_is_ksm(token),
                "keyhole token mismatch"
            );
        }
    }
}
