//! Reverse-mapping graph.
//!
//! Tracks the many-to-one relation from virtual mappings to a merged page.
//! Each stable node keeps a list of `NodeVma` groups, one per area mapping
//! the page, sorted by a stable per-area key; each group lists the rmap
//! items inside. Appending to the graph is also where per-round inter-area
//! duplication statistics are gathered, including the cancellation of
//! duplicates found within a single area.
//!
//! An rmap item records its tree membership in the low bits of its page
//! aligned address. Only the accessors below touch those bits.

use alloc::vec::Vec;

use crate::area::{RmapRef, SlotRef};
use crate::engine::Uksm;
use crate::host::{AnonVmaId, AreaId, Pfn, PAGE_MASK};
use crate::pool::Handle;
use crate::stable::StableRef;

const UNSTABLE_FLAG: u64 = 0x1;
const STABLE_FLAG: u64 = 0x2;

pub type NodeVmaRef = Handle<NodeVma>;

/// One page slot of one area, visited at least once.
pub struct RmapItem {
    pub slot: SlotRef,
    /// Page-aligned virtual address; low bits carry tree membership.
    address: u64,
    /// Full-strength hash; 0 means not yet computed.
    pub hash_max: u32,
    /// Scan round this item was inserted into its current tree.
    pub append_round: u64,
    /// Cell index in the owning slot's entry pool.
    pub entry_index: u64,
    /// Loosely cached page; revalidated before every use.
    pub page: Pfn,
    /// Pinned anon-vma root while the item is in the stable graph.
    pub anon_vma: Option<AnonVmaId>,
    /// Stable-graph group, when the stable flag is set.
    pub head: Option<NodeVmaRef>,
    /// First-level hash keying the tree the item currently sits in.
    pub tree_hash: u32,
}

impl RmapItem {
    pub fn new(slot: SlotRef, address: u64, entry_index: u64) -> Self {
        debug_assert_eq!(address & !PAGE_MASK, 0);
        Self {
            slot,
            address,
            hash_max: 0,
            append_round: 0,
            entry_index,
            page: Pfn(0),
            anon_vma: None,
            head: None,
            tree_hash: 0,
        }
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.address & PAGE_MASK
    }

    #[inline]
    pub fn is_stable(&self) -> bool {
        self.address & STABLE_FLAG != 0
    }

    #[inline]
    pub fn is_unstable(&self) -> bool {
        self.address & UNSTABLE_FLAG != 0
    }

    #[inline]
    pub fn set_stable(&mut self) {
        self.address |= STABLE_FLAG;
    }

    #[inline]
    pub fn set_unstable(&mut self) {
        self.address |= UNSTABLE_FLAG;
    }

    #[inline]
    pub fn clear_tree_flags(&mut self) {
        self.address &= PAGE_MASK;
    }
}

/// Groups the rmap items of one merged page belonging to one area.
pub struct NodeVma {
    pub head: StableRef,
    pub slot: SlotRef,
    /// Sort key within the stable node's group list.
    pub key: u64,
    /// Round tag driving the inter-area statistics.
    pub last_update: u64,
    pub rmap_list: Vec<RmapRef>,
}

impl NodeVma {
    pub fn new(head: StableRef, slot: SlotRef) -> Self {
        Self {
            head,
            slot,
            key: slot.index() as u64,
            last_update: 0,
            rmap_list: Vec::new(),
        }
    }
}

/// Flow control for reverse walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    Stop,
}

impl Uksm {
    pub(crate) fn hold_anon_vma(&mut self, item: RmapRef) {
        let area = self.slots.get(self.rmaps.get(item).slot).area;
        if let Some(av) = self.host.area_anon_vma(area) {
            self.host.anon_vma_get(av);
            self.rmaps.get_mut(item).anon_vma = Some(av);
        }
    }

    pub(crate) fn drop_anon_vma(&mut self, item: RmapRef) {
        if let Some(av) = self.rmaps.get_mut(item).anon_vma.take() {
            self.host.anon_vma_put(av);
        }
    }

    /// Append an rmap item to a stable node, accumulating inter-area
    /// duplication counts for this round.
    pub(crate) fn stable_tree_append(&mut self, item: RmapRef, stable: StableRef) {
        let round = self.scan_round;
        let item_slot = self.rmaps.get(item).slot;
        let key = item_slot.index() as u64;

        {
            let it = self.rmaps.get_mut(item);
            it.set_stable();
            it.append_round = round;
        }

        let groups = self.stables.get(stable).node_vmas.clone();
        if groups.is_empty() {
            self.stats.pages_shared += 1;
        } else {
            self.stats.pages_sharing += 1;
        }

        // First pass: count coincidences up to the sorted insertion point.
        // The boundary entry is included; for an intra-area duplicate that
        // conveniently counts the area against itself.
        let mut boundary = groups.len();
        for (pos, &nv) in groups.iter().enumerate() {
            let (nv_key, nv_last, nv_slot) = {
                let n = self.node_vmas.get(nv);
                (n.key, n.last_update, n.slot)
            };
            if nv_last == round {
                self.inc_intertab_pair(item_slot, nv_slot);
            }
            if nv_key >= key {
                boundary = pos;
                break;
            }
        }

        let same = groups
            .get(boundary)
            .copied()
            .filter(|&nv| self.node_vmas.get(nv).key == key);

        let chosen = if let Some(same_nv) = same {
            if self.node_vmas.get(same_nv).last_update == round {
                // Inner duplicate: identical page within the same area this
                // round. Undo the cross-area counts; only the diagonal pair
                // stays.
                for &nv in &groups[..boundary] {
                    let (nv_last, nv_slot) = {
                        let n = self.node_vmas.get(nv);
                        (n.last_update, n.slot)
                    };
                    if nv_last == round {
                        self.dec_intertab_pair(item_slot, nv_slot);
                    }
                }
            } else {
                // Same area, but nothing counted for it this round yet;
                // finish counting the areas past the insertion point.
                for &nv in &groups[boundary + 1..] {
                    let (nv_last, nv_slot) = {
                        let n = self.node_vmas.get(nv);
                        (n.last_update, n.slot)
                    };
                    if nv_last == round {
                        self.inc_intertab_pair(item_slot, nv_slot);
                    }
                }
            }
            same_nv
        } else {
            // New area on this stable node; areas past the insertion point
            // have not been counted yet (the boundary entry itself was).
            let cont = if boundary < groups.len() { boundary + 1 } else { boundary };
            for &nv in &groups[cont..] {
                let (nv_last, nv_slot) = {
                    let n = self.node_vmas.get(nv);
                    (n.last_update, n.slot)
                };
                if nv_last == round {
                    self.inc_intertab_pair(item_slot, nv_slot);
                }
            }
            let new_nv = self.node_vmas.alloc(NodeVma::new(stable, item_slot));
            self.stables
                .get_mut(stable)
                .node_vmas
                .insert(boundary, new_nv);
            new_nv
        };

        {
            let nv = self.node_vmas.get_mut(chosen);
            nv.rmap_list.push(item);
            nv.last_update = round;
        }
        self.rmaps.get_mut(item).head = Some(chosen);
        self.hold_anon_vma(item);
        self.slots.get_mut(item_slot).pages_merged += 1;
    }

    /// Detach an rmap item from whichever tree it is in.
    ///
    /// Unstable removal only touches the tree when the item was inserted
    /// this round; a leftover from an earlier round has no valid tree
    /// position anymore.
    pub(crate) fn remove_rmap_item_from_tree(&mut self, item: RmapRef) {
        if self.rmaps.get(item).is_stable() {
            let node_vma = self.rmaps.get(item).head.expect("stable item without group");
            let stable = self.node_vmas.get(node_vma).head;

            let page = match self.get_ksm_page(stable, true, true) {
                Some(p) => p,
                // the keyhole found the node stale and tore it down, which
                // already cleared this item
                None => return,
            };

            // racing with reverse walks on this page
            self.host.page_lock(page);
            {
                let nv = self.node_vmas.get_mut(node_vma);
                nv.rmap_list.retain(|&r| r != item);
            }
            if self.node_vmas.get(node_vma).rmap_list.is_empty() {
                self.stables
                    .get_mut(stable)
                    .node_vmas
                    .retain(|&nv| nv != node_vma);
                self.node_vmas.free(node_vma);
            }
            self.host.page_unlock(page);
            self.host.put_page(page);

            if self.stables.get(stable).node_vmas.is_empty() {
                // The node may outlive its last in-tree item when forked
                // items still reference the page; it is reaped by the next
                // keyhole lookup, only the counters move here.
                self.stats.pages_shared -= 1;
            } else {
                self.stats.pages_sharing -= 1;
            }

            self.drop_anon_vma(item);
            self.rmaps.get_mut(item).head = None;
        } else if self.rmaps.get(item).is_unstable() {
            if self.rmaps.get(item).append_round == self.scan_round {
                let hash = self.rmaps.get(item).tree_hash;
                self.unstable_tree_erase(hash, item);
            }
            self.stats.pages_unshared -= 1;
        }

        let it = self.rmaps.get_mut(item);
        it.clear_tree_flags();
        it.hash_max = 0;
    }

    /// Walk every (area, address) mapping of a merged page, in two passes:
    /// first the areas the items were scanned under, then forked copies
    /// attached to the same anon-vma roots.
    pub(crate) fn rmap_walk(
        &self,
        pfn: Pfn,
        visit: &mut dyn FnMut(AreaId, u64) -> WalkControl,
    ) {
        let stable = match self.page_stable_node(pfn) {
            Some(s) if self.stables.contains(s) => s,
            _ => return,
        };

        let host = &*self.host;
        let mut search_new_forks = false;
        loop {
            for &nv in &self.stables.get(stable).node_vmas {
                for &item_ref in &self.node_vmas.get(nv).rmap_list {
                    let item = self.rmaps.get(item_ref);
                    let anon_vma = match item.anon_vma {
                        Some(av) => av,
                        None => continue,
                    };
                    let own_area = self.slots.get(item.slot).area;
                    let address = item.address();

                    host.anon_vma_lock(anon_vma);
                    for area in host.anon_vma_areas(anon_vma) {
                        let (start, end) = host.area_start_end(area);
                        if address < start || address >= end {
                            continue;
                        }
                        // First the vma that covers this rmap item; in the
                        // second pass covering vmas in other mms, forked
                        // from the original since the scanner passed.
                        if (own_area == area) == search_new_forks {
                            continue;
                        }
                        if visit(area, address) == WalkControl::Stop {
                            host.anon_vma_unlock(anon_vma);
                            return;
                        }
                    }
                    host.anon_vma_unlock(anon_vma);
                }
            }
            if search_new_forks {
                break;
            }
            search_new_forks = true;
        }
    }

    /// Referenced-bit poll across all mappings of a merged page. Caller
    /// holds the page lock.
    pub fn page_referenced_ksm(&self, pfn: Pfn) -> usize {
        let mut mapcount = self.host.page_mapcount(pfn);
        let mut referenced = 0usize;
        let host = self.host.clone();
        self.rmap_walk(pfn, &mut |area, addr| {
            if host.page_referenced_one(pfn, area, addr) {
                referenced += 1;
            }
            mapcount = mapcount.saturating_sub(1);
            if mapcount == 0 {
                WalkControl::Stop
            } else {
                WalkControl::Continue
            }
        });
        referenced
    }

    /// Unmap every mapping of a merged page. Caller holds the page lock.
    /// Returns true when the page ended up fully unmapped.
    pub fn try_to_unmap_ksm(&self, pfn: Pfn) -> bool {
        let host = self.host.clone();
        let mut failed = false;
        self.rmap_walk(pfn, &mut |area, addr| {
            match host.try_to_unmap_one(pfn, area, addr) {
                crate::host::UnmapOutcome::Fail => {
                    failed = true;
                    WalkControl::Stop
                }
                crate::host::UnmapOutcome::Done => {
                    if !host.page_mapped(pfn) {
                        WalkControl::Stop
                    } else {
                        WalkControl::Continue
                    }
                }
            }
        });
        !failed && !self.host.page_mapped(pfn)
    }
}
