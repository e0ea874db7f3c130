//! Scannable areas (vma slots) and their rmap entry pools.
//!
//! One `VmaSlot` tracks one eligible anonymous mapping. The slot owns a
//! lazily populated entry pool with one cell per page of the mapping; a
//! cell is either untouched, a bare page address, or the slot's rmap item
//! for that page. Cells are chunked so sparse slots stay cheap, and they
//! are swapped in place to realize the per-round random scan order.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::host::{AreaId, MmId, PAGE_SHIFT, PAGE_SIZE};
use crate::pool::{Handle, Pool};
use crate::rmap::RmapItem;

pub type SlotRef = Handle<VmaSlot>;
pub type RmapRef = Handle<RmapItem>;

/// One cell of a slot's rmap entry pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmapEntry {
    /// Never visited.
    New,
    /// Visited at least once, but no live rmap item; keeps the page address
    /// so the shuffle can keep permuting it.
    Addr(u64),
    /// Live rmap item for this cell.
    Item(RmapRef),
}

impl RmapEntry {
    #[inline]
    pub fn is_new(self) -> bool {
        matches!(self, RmapEntry::New)
    }

    #[inline]
    pub fn item(self) -> Option<RmapRef> {
        match self {
            RmapEntry::Item(r) => Some(r),
            _ => None,
        }
    }
}

/// Entry cells per pool chunk; chunks are sized to one host page.
pub const ENTRIES_PER_CHUNK: usize = PAGE_SIZE / core::mem::size_of::<RmapEntry>();

/// Per-area scan state. One per eligible anonymous mapping.
pub struct VmaSlot {
    pub area: AreaId,
    pub mm: MmId,
    pub start: u64,
    pub pages: usize,

    /// Ladder rung this slot currently lives on.
    pub rung: usize,
    /// Pages of this slot the current rung pass may still scan.
    pub pages_to_scan: u64,

    pub pages_scanned: u64,
    /// `pages_scanned` snapshot when the previous round closed.
    pub last_scanned: u64,
    pub pages_merged: u32,
    pub pages_cowed: u32,
    pub dedup_ratio: u64,

    /// Slot number in the inter-area table, assigned on first duplicate.
    pub ksm_index: Option<usize>,
    pub slot_scanned: bool,
    pub fully_scanned: bool,
    pub need_rerand: bool,
    pub need_sort: bool,

    chunks: Vec<Option<Box<[RmapEntry]>>>,
    chunk_counts: Vec<u32>,
}

impl VmaSlot {
    pub fn new(area: AreaId, mm: MmId, start: u64, pages: usize) -> Self {
        let chunk_num = pool_size_for(pages);
        Self {
            area,
            mm,
            start,
            pages,
            rung: 0,
            pages_to_scan: 0,
            pages_scanned: 0,
            last_scanned: 0,
            pages_merged: 0,
            pages_cowed: 0,
            dedup_ratio: 0,
            ksm_index: None,
            slot_scanned: false,
            fully_scanned: false,
            need_rerand: true,
            need_sort: false,
            chunks: vec![None; chunk_num],
            chunk_counts: vec![0; chunk_num],
        }
    }

    /// Have all pages been visited an exact number of times?
    pub fn vma_fully_scanned(&self) -> bool {
        self.pages_scanned > 0 && self.pages_scanned % self.pages as u64 == 0
    }

    pub fn index_orig_addr(&self, index: u64) -> u64 {
        self.start + (index << PAGE_SHIFT)
    }

    pub fn item_index(&self, addr: u64) -> u64 {
        (addr - self.start) >> PAGE_SHIFT
    }

    #[inline]
    pub fn chunk_index(&self, index: u64) -> usize {
        let chunk = (core::mem::size_of::<RmapEntry>() as u64 * index) >> PAGE_SHIFT;
        assert!((chunk as usize) < self.chunks.len());
        chunk as usize
    }

    /// True when `index` is the first cell of a chunk.
    pub fn chunk_boundary(index: u64) -> bool {
        index != 0 && index % ENTRIES_PER_CHUNK as u64 == 0
    }

    pub fn same_chunk(&self, i: u64, j: u64) -> bool {
        self.chunk_index(i) == self.chunk_index(j)
    }

    /// Read a cell, materializing its chunk when `need_alloc`.
    pub fn entry_get(&mut self, index: u64, need_alloc: bool) -> Option<RmapEntry> {
        let chunk = self.chunk_index(index);
        if self.chunks[chunk].is_none() {
            if !need_alloc {
                return None;
            }
            self.chunks[chunk] =
                Some(vec![RmapEntry::New; ENTRIES_PER_CHUNK].into_boxed_slice());
        }
        let off = index as usize % ENTRIES_PER_CHUNK;
        Some(self.chunks[chunk].as_ref().unwrap()[off])
    }

    /// Write a cell; its chunk must already exist.
    pub fn entry_set(&mut self, index: u64, entry: RmapEntry) {
        let chunk = self.chunk_index(index);
        let off = index as usize % ENTRIES_PER_CHUNK;
        self.chunks[chunk]
            .as_mut()
            .expect("writing into an absent pool chunk")[off] = entry;
    }

    pub fn inc_chunk_count(&mut self, index: u64) {
        let chunk = self.chunk_index(index);
        debug_assert!(self.chunks[chunk].is_some());
        self.chunk_counts[chunk] += 1;
    }

    pub fn dec_chunk_count(&mut self, index: u64) {
        let chunk = self.chunk_index(index);
        debug_assert!(self.chunk_counts[chunk] > 0);
        self.chunk_counts[chunk] -= 1;
    }

    /// Free the chunk holding `index` if it hosts no rmap items.
    pub fn try_free_chunk(&mut self, index: u64) {
        let chunk = self.chunk_index(index);
        if self.chunks[chunk].is_some() && self.chunk_counts[chunk] == 0 {
            self.chunks[chunk] = None;
            self.need_sort = true;
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_is_present(&self, chunk: usize) -> bool {
        self.chunks[chunk].is_some()
    }

    pub fn drop_chunk(&mut self, chunk: usize) {
        self.chunks[chunk] = None;
    }

    /// Entries of one chunk, for teardown and sorting sweeps.
    pub fn chunk_entries(&self, chunk: usize) -> Option<&[RmapEntry]> {
        self.chunks[chunk].as_deref()
    }
}

/// Chunks needed to host one cell per page of the mapping.
pub fn pool_size_for(pages: usize) -> usize {
    let bytes = core::mem::size_of::<RmapEntry>() * pages;
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Swap two pool cells, fixing up item back-pointers and per-chunk counts.
pub(crate) fn swap_entries(
    slot: &mut VmaSlot,
    rmaps: &mut Pool<RmapItem>,
    index1: u64,
    index2: u64,
) {
    let entry1 = slot.entry_get(index1, true).unwrap();
    let entry2 = slot.entry_get(index2, true).unwrap();
    // swapping two new entries is meaningless
    debug_assert!(!(entry1.is_new() && entry2.is_new()));

    slot.entry_set(index1, entry2);
    slot.entry_set(index2, entry1);

    if let Some(item) = entry2.item() {
        rmaps.get_mut(item).entry_index = index1;
    }
    if let Some(item) = entry1.item() {
        rmaps.get_mut(item).entry_index = index2;
    }

    match (entry2.item().is_some(), entry1.item().is_some()) {
        (true, false) => {
            // an item moved into index1's chunk
            slot.inc_chunk_count(index1);
            slot.dec_chunk_count(index2);
        }
        (false, true) => {
            slot.inc_chunk_count(index2);
            slot.dec_chunk_count(index1);
        }
        _ => {}
    }
}

/// Re-home every entry to the cell matching its page index.
///
/// Needed after empty chunks were freed mid-round: the permutation left
/// entries parked at foreign indices, and a freed chunk loses the cells
/// they would have been swapped back through.
pub(crate) fn sort_rmap_entry_list(slot: &mut VmaSlot, rmaps: &mut Pool<RmapItem>) {
    let mut i: u64 = 0;
    while i < slot.pages as u64 {
        let entry = match slot.entry_get(i, false) {
            None => {
                // skip the whole absent chunk
                i = (i / ENTRIES_PER_CHUNK as u64 + 1) * ENTRIES_PER_CHUNK as u64;
                continue;
            }
            Some(e) => e,
        };

        match entry {
            RmapEntry::New => {
                i += 1;
            }
            RmapEntry::Addr(_) => {
                // stale parked address; its home cell is recomputed on the
                // next visit anyway
                slot.entry_set(i, RmapEntry::New);
                i += 1;
            }
            RmapEntry::Item(item) => {
                let home = {
                    let it = rmaps.get(item);
                    slot.item_index(it.address())
                };
                if home == i {
                    i += 1;
                } else {
                    swap_entries(slot, rmaps, i, home);
                }
            }
        }
    }

    // free chunks that ended up hosting no items
    for chunk in 0..slot.chunk_count() {
        if !slot.chunk_is_present(chunk) {
            continue;
        }
        let has_item = slot
            .chunk_entries(chunk)
            .unwrap()
            .iter()
            .any(|e| e.item().is_some());
        if !has_item {
            debug_assert_eq!(slot.chunk_counts[chunk], 0);
            slot.drop_chunk(chunk);
        }
    }

    slot.need_sort = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PAGE_MASK;

    fn slot_with(pages: usize) -> VmaSlot {
        VmaSlot::new(AreaId(1), MmId(1), 0x1000_0000, pages)
    }

    #[test]
    fn pool_sizing() {
        assert_eq!(pool_size_for(1), 1);
        assert_eq!(pool_size_for(ENTRIES_PER_CHUNK), 1);
        assert_eq!(pool_size_for(ENTRIES_PER_CHUNK + 1), 2);
    }

    #[test]
    fn entries_lazily_allocated() {
        let mut slot = slot_with(ENTRIES_PER_CHUNK * 2);
        assert!(slot.entry_get(0, false).is_none());
        assert_eq!(slot.entry_get(0, true), Some(RmapEntry::New));
        // second chunk still absent
        assert!(slot.entry_get(ENTRIES_PER_CHUNK as u64, false).is_none());
    }

    #[test]
    fn swap_moves_items_between_chunks() {
        let mut slot = slot_with(ENTRIES_PER_CHUNK * 2);
        let mut rmaps: Pool<RmapItem> = Pool::new();

        let addr = slot.index_orig_addr(0);
        let item = rmaps.alloc(RmapItem::new(Handle::from_index(0), addr, 0));
        slot.entry_get(0, true);
        slot.entry_set(0, RmapEntry::Item(item));
        slot.inc_chunk_count(0);

        let far = ENTRIES_PER_CHUNK as u64;
        slot.entry_get(far, true);
        slot.entry_set(far, RmapEntry::Addr(slot.index_orig_addr(far)));

        swap_entries(&mut slot, &mut rmaps, 0, far);
        assert_eq!(slot.entry_get(far, false), Some(RmapEntry::Item(item)));
        assert_eq!(rmaps.get(item).entry_index, far);
        assert_eq!(slot.chunk_counts[0], 0);
        assert_eq!(slot.chunk_counts[1], 1);

        // first chunk now empty of items, reclaimable
        slot.try_free_chunk(0);
        assert!(!slot.chunk_is_present(0));
        assert!(slot.need_sort);
    }

    #[test]
    fn sort_rehomes_items() {
        let mut slot = slot_with(8);
        let mut rmaps: Pool<RmapItem> = Pool::new();

        let addr5 = slot.index_orig_addr(5) & PAGE_MASK;
        let item = rmaps.alloc(RmapItem::new(Handle::from_index(0), addr5, 2));
        slot.entry_get(2, true);
        slot.entry_set(2, RmapEntry::Item(item));
        slot.inc_chunk_count(2);

        sort_rmap_entry_list(&mut slot, &mut rmaps);
        assert_eq!(slot.entry_get(5, false), Some(RmapEntry::Item(item)));
        assert_eq!(rmaps.get(item).entry_index, 5);
        assert!(!slot.need_sort);
    }
}
