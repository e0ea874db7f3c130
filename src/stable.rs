//! Stable tree: the index of merged pages.
//!
//! Two ordered levels. The first level keys on the page hash at the live
//! strength; colliding nodes open a second level keyed on the full-strength
//! hash. A first level entry with a single child defers the second-level
//! hash until a collision actually arrives.
//!
//! Stable nodes hold no page reference. Reaching the page goes through the
//! keyhole: the page's mapping word must still name this node, checked
//! before and after taking a speculative reference. A failed check means
//! the page was freed out from under us, and the stale node is reaped on
//! the spot.
//!
//! Strength changes rebuild the whole index by delta-hashing every node
//! into a second, preallocated root, then toggling which root is live.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::engine::Uksm;
use crate::host::{mapping_is_ksm, Pfn, MAPPING_ANON, MAPPING_FLAG_BITS, MAPPING_KSM};
use crate::pool::Handle;
use crate::rmap::NodeVmaRef;

pub type StableRef = Handle<StableNode>;

/// One merged page.
pub struct StableNode {
    /// Frame of the shared copy.
    pub kpfn: Pfn,
    /// Full-strength hash; 0 until a collision forces it.
    pub hash_max: u32,
    /// First-level hash of the tree node this node sits under, or None when
    /// a two-level collision left the node outside the index.
    pub tree_hash: Option<u32>,
    /// Per-area groups, sorted ascending by area key.
    pub node_vmas: Vec<NodeVmaRef>,
}

/// Second level of a first-level entry.
pub enum StableChildren {
    /// Lone child; its `hash_max` may still be uncomputed.
    Single(StableRef),
    /// Collision sub-tree keyed by `hash_max`. May be transiently empty
    /// after a stale node was reaped.
    Sub(BTreeMap<u32, StableRef>),
}

pub struct StableTreeNode {
    pub children: StableChildren,
}

impl StableTreeNode {
    pub fn count(&self) -> usize {
        match &self.children {
            StableChildren::Single(_) => 1,
            StableChildren::Sub(map) => map.len(),
        }
    }
}

/// Which of the two roots an operation addresses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootSel {
    Live,
    /// The root being built by a delta rehash.
    Fresh,
}

/// The dual-root first level.
pub struct StableTree {
    roots: [BTreeMap<u32, StableTreeNode>; 2],
    live: usize,
}

impl StableTree {
    pub fn new() -> Self {
        Self {
            roots: [BTreeMap::new(), BTreeMap::new()],
            live: 0,
        }
    }

    pub fn live_root(&self) -> &BTreeMap<u32, StableTreeNode> {
        &self.roots[self.live]
    }

    pub(crate) fn root(&self, sel: RootSel) -> &BTreeMap<u32, StableTreeNode> {
        &self.roots[self.index(sel)]
    }

    pub(crate) fn root_mut(&mut self, sel: RootSel) -> &mut BTreeMap<u32, StableTreeNode> {
        let index = self.index(sel);
        &mut self.roots[index]
    }

    fn index(&self, sel: RootSel) -> usize {
        match sel {
            RootSel::Live => self.live,
            RootSel::Fresh => 1 - self.live,
        }
    }

    /// Make the freshly built root the live one and drop the old tree
    /// nodes wholesale.
    pub(crate) fn promote_fresh(&mut self) {
        self.live = 1 - self.live;
        let old = 1 - self.live;
        self.roots[old].clear();
    }
}

/// Mapping word naming `stable` as the owner of a merged page.
pub(crate) fn stable_token(stable: StableRef) -> u64 {
    ((stable.index() as u64 + 1) << MAPPING_FLAG_BITS) | MAPPING_ANON | MAPPING_KSM
}

/// Mapping word of a page upgraded to ksm but not yet published.
pub(crate) const KSM_NO_NODE_TOKEN: u64 = MAPPING_ANON | MAPPING_KSM;

impl Uksm {
    /// Stable node named by the page's mapping word, if any.
    pub(crate) fn page_stable_node(&self, pfn: Pfn) -> Option<StableRef> {
        let token = self.host.page_mapping(pfn);
        if !mapping_is_ksm(token) {
            return None;
        }
        let id = token >> MAPPING_FLAG_BITS;
        if id == 0 {
            return None;
        }
        Some(Handle::from_index((id - 1) as u32))
    }

    pub(crate) fn set_page_stable_node(&self, pfn: Pfn, stable: Option<StableRef>) {
        let token = match stable {
            Some(s) => stable_token(s),
            None => KSM_NO_NODE_TOKEN,
        };
        self.host.set_page_mapping(pfn, token);
    }

    /// Keyhole lookup: materialize the page behind a stable node without
    /// having held a reference. On failure the node is stale and is removed
    /// (`unlink_rb` / `remove_tree_node` control how much of the index goes
    /// with it, so rebuilds can reuse a tree node they are holding).
    pub(crate) fn get_ksm_page(
        &mut self,
        stable: StableRef,
        unlink_rb: bool,
        remove_tree_node: bool,
    ) -> Option<Pfn> {
        self.get_ksm_page_in(stable, unlink_rb, remove_tree_node, RootSel::Live)
    }

    fn get_ksm_page_in(
        &mut self,
        stable: StableRef,
        unlink_rb: bool,
        remove_tree_node: bool,
        root_sel: RootSel,
    ) -> Option<Pfn> {
        let page = self.stables.get(stable).kpfn;
        let expected = stable_token(stable);

        if self.host.page_mapping(page) == expected
            && self.host.try_get_page(page)
        {
            if self.host.page_mapping(page) == expected {
                return Some(page);
            }
            self.host.put_page(page);
        }

        self.remove_node_from_stable_tree(stable, unlink_rb, remove_tree_node, root_sel);
        None
    }

    /// Tear down a stable node: detach every rmap item, then optionally
    /// unlink the node from the index and reap its tree node.
    pub(crate) fn remove_node_from_stable_tree(
        &mut self,
        stable: StableRef,
        unlink_rb: bool,
        remove_tree_node: bool,
        root_sel: RootSel,
    ) {
        let groups = core::mem::take(&mut self.stables.get_mut(stable).node_vmas);
        let mut detached: u64 = 0;
        for nv in groups {
            let items = core::mem::take(&mut self.node_vmas.get_mut(nv).rmap_list);
            for item in items {
                detached += 1;
                self.drop_anon_vma(item);
                let it = self.rmaps.get_mut(item);
                it.clear_tree_flags();
                it.head = None;
            }
            self.node_vmas.free(nv);
        }
        if detached > 0 {
            // the first mapping counted as shared, the rest as sharing
            self.stats.pages_shared -= 1;
            self.stats.pages_sharing -= detached - 1;
        }

        if unlink_rb {
            if let Some(tree_hash) = self.stables.get(stable).tree_hash {
                let hash_max = self.stables.get(stable).hash_max;
                let root = self.stable_tree.root_mut(root_sel);
                let mut drop_tree_node = false;
                if let Some(tnode) = root.get_mut(&tree_hash) {
                    match &mut tnode.children {
                        StableChildren::Single(c) if *c == stable => {
                            if remove_tree_node {
                                drop_tree_node = true;
                            } else {
                                tnode.children = StableChildren::Sub(BTreeMap::new());
                            }
                        }
                        StableChildren::Single(_) => {}
                        StableChildren::Sub(map) => {
                            let removed = map.remove(&hash_max);
                            debug_assert!(removed.is_none() || removed == Some(stable));
                            if map.is_empty() && remove_tree_node {
                                drop_tree_node = true;
                            }
                        }
                    }
                }
                if drop_tree_node {
                    root.remove(&tree_hash);
                }
            }
        }

        self.stables.free(stable);
    }

    /// Search the stable tree for a page identical to `item`'s, per the
    /// current hash. Returns the candidate with a reference taken.
    pub(crate) fn stable_tree_search(&mut self, item: crate::area::RmapRef, hash: u32) -> Option<Pfn> {
        let page = self.rmaps.get(item).page;

        if let Some(stable) = self.page_stable_node(page) {
            if self.stables.contains(stable) {
                // ksm page forked into this area; already the shared copy
                self.host.get_page(page);
                return Some(page);
            }
        }

        let found = match self.stable_tree.live_root().get(&hash) {
            None => return None,
            Some(tnode) => match &tnode.children {
                StableChildren::Single(c) => Some(*c),
                StableChildren::Sub(map) if map.is_empty() => None,
                StableChildren::Sub(_) => None, // resolved below at full strength
            },
        };

        let stable = match found {
            Some(s) => s,
            None => {
                // search the collision sub-tree at full strength
                let hash_max = self.rmap_item_hash_max(item, hash);
                match self.stable_tree.live_root().get(&hash) {
                    Some(StableTreeNode {
                        children: StableChildren::Sub(map),
                    }) => match map.get(&hash_max) {
                        Some(&s) => s,
                        None => return None,
                    },
                    _ => return None,
                }
            }
        };

        self.get_ksm_page(stable, true, true)
    }

    /// `item`'s full-strength hash, computing and caching it on first use.
    pub(crate) fn rmap_item_hash_max(&mut self, item: crate::area::RmapRef, hash: u32) -> u32 {
        let cached = self.rmaps.get(item).hash_max;
        if cached != 0 {
            return cached;
        }
        let page = self.rmaps.get(item).page;
        let host = self.host.clone();
        let bytes = crate::host::page_bytes(&*host, page);
        let hash_max = self.hash.page_hash_max(bytes, hash);
        self.rmaps.get_mut(item).hash_max = hash_max;
        hash_max
    }

    fn stable_node_hash_max(&mut self, stable: StableRef, page: Pfn, hash: u32) {
        if self.stables.get(stable).hash_max != 0 {
            return;
        }
        let host = self.host.clone();
        let bytes = crate::host::page_bytes(&*host, page);
        let hash_max = self.hash.page_hash_max(bytes, hash);
        self.stables.get_mut(stable).hash_max = hash_max;
    }

    fn new_stable_node(&mut self, tree_hash: Option<u32>, kpage: Pfn, hash_max: u32) -> StableRef {
        let stable = self.stables.alloc(StableNode {
            kpfn: kpage,
            hash_max,
            tree_hash,
            node_vmas: Vec::new(),
        });
        self.set_page_stable_node(kpage, Some(stable));
        stable
    }

    /// Publish `kpage`, just made the unique write-protected copy of the
    /// two merged rmap items. Returns the stable node and which of the two
    /// items actually ended up merged onto it.
    pub(crate) fn stable_tree_insert(
        &mut self,
        kpage: Pfn,
        hash: u32,
        item: crate::area::RmapRef,
        tree_item: crate::area::RmapRef,
    ) -> (Option<StableRef>, bool, bool) {
        enum Entry {
            Vacant,
            Single,
            Sub,
            EmptySub,
        }
        let entry = match self.stable_tree.live_root().get(&hash) {
            None => Entry::Vacant,
            Some(tnode) => match &tnode.children {
                StableChildren::Single(_) => Entry::Single,
                StableChildren::Sub(map) if map.is_empty() => Entry::EmptySub,
                StableChildren::Sub(_) => Entry::Sub,
            },
        };

        match entry {
            Entry::Single => self.first_level_insert(hash, item, tree_item, kpage),
            Entry::Sub => self.stable_subtree_insert(hash, item, tree_item, kpage),
            Entry::Vacant | Entry::EmptySub => {
                let stable = self.new_stable_node(Some(hash), kpage, 0);
                self.stable_tree.root_mut(RootSel::Live).insert(
                    hash,
                    StableTreeNode {
                        children: StableChildren::Single(stable),
                    },
                );
                (Some(stable), true, true)
            }
        }
    }

    /// The first-level entry has one child and no sub-tree yet: either the
    /// new page matches it (merge onto the existing copy), or the collision
    /// opens the second level.
    fn first_level_insert(
        &mut self,
        hash: u32,
        item: crate::area::RmapRef,
        tree_item: crate::area::RmapRef,
        kpage: Pfn,
    ) -> (Option<StableRef>, bool, bool) {
        let child = match self.stable_tree.live_root().get(&hash) {
            Some(StableTreeNode {
                children: StableChildren::Single(c),
            }) => *c,
            _ => unreachable!("first_level_insert on a non-single entry"),
        };

        match self.get_ksm_page(child, true, false) {
            Some(tree_page) => {
                if self.memcmp_pages(kpage, tree_page, true) {
                    let (s1, s2) =
                        self.try_merge_with_stable(item, tree_item, kpage, tree_page);
                    self.host.put_page(tree_page);
                    if !s1 && !s2 {
                        return (None, false, false);
                    }
                    return (Some(child), s1, s2);
                }

                // collision in first level, create the sub-tree
                self.stable_node_hash_max(child, tree_page, hash);
                self.host.put_page(tree_page);
                let hash_max = self.rmap_item_hash_max(item, hash);
                let child_max = self.stables.get(child).hash_max;
                if hash_max == child_max {
                    log::warn!("mm/uksm: two-level collision, hash_max={}", hash_max);
                    return (None, false, false);
                }

                let new_node = self.new_stable_node(Some(hash), kpage, hash_max);
                let mut map = BTreeMap::new();
                map.insert(child_max, child);
                map.insert(hash_max, new_node);
                self.stable_tree
                    .root_mut(RootSel::Live)
                    .get_mut(&hash)
                    .unwrap()
                    .children = StableChildren::Sub(map);
                (Some(new_node), true, true)
            }
            None => {
                // the only child vanished; reuse the now-empty tree node
                let new_node = self.new_stable_node(Some(hash), kpage, 0);
                self.stable_tree
                    .root_mut(RootSel::Live)
                    .get_mut(&hash)
                    .unwrap()
                    .children = StableChildren::Single(new_node);
                (Some(new_node), true, true)
            }
        }
    }

    /// Descend the collision sub-tree at full strength; merge on a terminal
    /// match, fail on an irreducible collision, restart when a stale node
    /// restructured the sub-tree under us.
    fn stable_subtree_insert(
        &mut self,
        hash: u32,
        item: crate::area::RmapRef,
        tree_item: crate::area::RmapRef,
        kpage: Pfn,
    ) -> (Option<StableRef>, bool, bool) {
        loop {
            let hash_max = self.rmap_item_hash_max(item, hash);
            let found = match self.stable_tree.live_root().get(&hash) {
                Some(StableTreeNode {
                    children: StableChildren::Sub(map),
                }) => map.get(&hash_max).copied(),
                _ => None,
            };

            match found {
                Some(stable) => {
                    match self.get_ksm_page(stable, true, false) {
                        Some(tree_page) => {
                            if self.memcmp_pages(kpage, tree_page, true) {
                                let (s1, s2) = self.try_merge_with_stable(
                                    item, tree_item, kpage, tree_page,
                                );
                                self.host.put_page(tree_page);
                                if !s1 && !s2 {
                                    return (None, false, false);
                                }
                                return (Some(stable), s1, s2);
                            }
                            self.host.put_page(tree_page);
                            return (None, false, false);
                        }
                        None => {
                            // stale node reaped, sub-tree restructured;
                            // search again from the top
                            let count = self
                                .stable_tree
                                .live_root()
                                .get(&hash)
                                .map(|t| t.count())
                                .unwrap_or(0);
                            if count > 0 {
                                continue;
                            }
                            // sub-tree drained, fall through to plain insert
                        }
                    }
                }
                None => {}
            }

            let new_node = self.new_stable_node(Some(hash), kpage, hash_max);
            match self.stable_tree.root_mut(RootSel::Live).get_mut(&hash) {
                Some(tnode) => match &mut tnode.children {
                    StableChildren::Sub(map) => {
                        map.insert(hash_max, new_node);
                    }
                    children @ StableChildren::Single(_) => {
                        // cannot happen while we hold the scanner mutex
                        debug_assert!(false);
                        *children = StableChildren::Single(new_node);
                    }
                },
                None => {
                    self.stable_tree.root_mut(RootSel::Live).insert(
                        hash,
                        StableTreeNode {
                            children: StableChildren::Single(new_node),
                        },
                    );
                }
            }
            return (Some(new_node), true, true);
        }
    }

    /// Re-home one stable node into the root being rebuilt. A two-level
    /// collision leaves the node outside the index (`tree_hash = None`); it
    /// is retried wholesale on the next rebuild.
    fn stable_node_reinsert(&mut self, node: StableRef, page: Pfn, hash: u32) {
        let entry_kind = match self.stable_tree.root(RootSel::Fresh).get(&hash) {
            None => 0,
            Some(t) => match &t.children {
                StableChildren::Single(_) => 1,
                StableChildren::Sub(m) if m.is_empty() => 0,
                StableChildren::Sub(_) => 2,
            },
        };

        match entry_kind {
            0 => {
                self.stables.get_mut(node).tree_hash = Some(hash);
                self.stable_tree.root_mut(RootSel::Fresh).insert(
                    hash,
                    StableTreeNode {
                        children: StableChildren::Single(node),
                    },
                );
            }
            1 => {
                let other = match self.stable_tree.root(RootSel::Fresh).get(&hash) {
                    Some(StableTreeNode {
                        children: StableChildren::Single(c),
                    }) => *c,
                    _ => unreachable!(),
                };
                self.stable_node_hash_max(node, page, hash);

                // the resident child needs its hash_max too before the
                // entry can become a sub-tree
                match self.get_ksm_page_in(other, true, false, RootSel::Fresh) {
                    Some(other_page) => {
                        self.stable_node_hash_max(other, other_page, hash);
                        self.host.put_page(other_page);

                        let node_max = self.stables.get(node).hash_max;
                        let other_max = self.stables.get(other).hash_max;
                        if node_max == other_max {
                            // collided in both levels; leave it out
                            self.stables.get_mut(node).tree_hash = None;
                            return;
                        }
                        let mut map = BTreeMap::new();
                        map.insert(other_max, other);
                        map.insert(node_max, node);
                        self.stables.get_mut(node).tree_hash = Some(hash);
                        self.stable_tree
                            .root_mut(RootSel::Fresh)
                            .get_mut(&hash)
                            .unwrap()
                            .children = StableChildren::Sub(map);
                    }
                    None => {
                        // the resident child vanished; reuse the entry
                        self.stables.get_mut(node).tree_hash = Some(hash);
                        self.stable_tree
                            .root_mut(RootSel::Fresh)
                            .get_mut(&hash)
                            .unwrap()
                            .children = StableChildren::Single(node);
                    }
                }
            }
            _ => {
                self.stable_node_hash_max(node, page, hash);
                let node_max = self.stables.get(node).hash_max;
                let occupied = match self.stable_tree.root(RootSel::Fresh).get(&hash) {
                    Some(StableTreeNode {
                        children: StableChildren::Sub(map),
                    }) => map.contains_key(&node_max),
                    _ => false,
                };
                if occupied {
                    // still a collision
                    self.stables.get_mut(node).tree_hash = None;
                    return;
                }
                self.stables.get_mut(node).tree_hash = Some(hash);
                match self
                    .stable_tree
                    .root_mut(RootSel::Fresh)
                    .get_mut(&hash)
                    .unwrap()
                    .children
                {
                    StableChildren::Sub(ref mut map) => {
                        map.insert(node_max, node);
                    }
                    _ => unreachable!(),
                }
            }
        }
    }

    /// Rebuild the stable tree after a strength change: every surviving
    /// node is delta-hashed from its old first-level key (or hashed afresh
    /// if it sat outside the index) and reinserted into the other root.
    pub(crate) fn stable_tree_delta_hash(&mut self, prev_strength: usize) {
        self.stable_tree.root_mut(RootSel::Fresh).clear();

        for node in self.stables.handles() {
            if !self.stables.contains(node) {
                // reaped by an earlier keyhole failure in this loop
                continue;
            }
            let page = match self.get_ksm_page(node, false, false) {
                Some(p) => p,
                None => continue,
            };

            let old_tree_hash = self.stables.get(node).tree_hash;
            let host = self.host.clone();
            let bytes = crate::host::page_bytes(&*host, page);
            let hash = match old_tree_hash {
                Some(old) => self
                    .hash
                    .delta_hash(bytes, prev_strength, self.hash.strength, old),
                // it was not inserted due to collision in the last round
                None => self.hash.sample_hash(bytes, self.hash.strength),
            };

            self.stable_node_reinsert(node, page, hash);
            self.host.put_page(page);
        }

        self.stable_tree.promote_fresh();
    }

    /// Rebind a stable node onto the frame a merged page migrated to.
    pub fn migrate_page(&mut self, new: Pfn, old: Pfn) {
        if let Some(stable) = self.page_stable_node(new) {
            if self.stables.contains(stable) && self.stables.get(stable).kpfn == old {
                self.stables.get_mut(stable).kpfn = new;
            }
        }
    }

    /// Prune stable nodes whose frame fell inside an offlined range. The
    /// caller has quiesced the scanner by holding the engine lock.
    pub fn memory_offline(&mut self, start_pfn: Pfn, end_pfn: Pfn) {
        loop {
            let victim = self
                .stables
                .iter()
                .find(|(_, node)| node.kpfn >= start_pfn && node.kpfn < end_pfn)
                .map(|(handle, _)| handle);
            match victim {
                Some(node) => {
                    self.remove_node_from_stable_tree(node, true, true, RootSel::Live)
                }
                None => break,
            }
        }
    }
}
