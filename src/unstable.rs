//! Unstable tree: candidates observed once this round.
//!
//! Same two-level shape as the stable tree, but keyed on rmap items whose
//! content is not yet trusted; the whole index is discarded when a scan
//! round closes. An item found here is only a lead — the caller still has
//! to lock the owning area and prove the pages identical.

use alloc::collections::BTreeMap;

use crate::area::RmapRef;
use crate::engine::Uksm;

/// Second level of a first-level entry.
pub enum UnstableChildren {
    Single(RmapRef),
    Sub(BTreeMap<u32, RmapRef>),
}

pub struct UnstableTreeNode {
    pub children: UnstableChildren,
}

pub struct UnstableTree {
    root: BTreeMap<u32, UnstableTreeNode>,
}

impl UnstableTree {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// Discarded wholesale at each round boundary.
    pub fn reset(&mut self) {
        self.root.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl Uksm {
    /// Find a same-hash candidate, or park `item` in the tree.
    ///
    /// On a candidate hit the owning area's mm read lock is taken and a
    /// page reference acquired; the caller releases both. `item` is only
    /// inserted when no candidate position matched.
    pub(crate) fn unstable_tree_search_insert(
        &mut self,
        item: RmapRef,
        hash: u32,
    ) -> Option<RmapRef> {
        enum FirstLevel {
            Vacant,
            Single(RmapRef),
            Sub,
        }
        let first = match self.unstable_tree.root.get(&hash) {
            None => FirstLevel::Vacant,
            Some(tnode) => match &tnode.children {
                UnstableChildren::Single(t) => FirstLevel::Single(*t),
                UnstableChildren::Sub(_) => FirstLevel::Sub,
            },
        };

        let candidate = match first {
            FirstLevel::Vacant => {
                self.unstable_insert_first(item, hash);
                return None;
            }
            FirstLevel::Single(t) => t,
            FirstLevel::Sub => {
                let hash_max = self.rmap_item_hash_max(item, hash);
                let found = match self.unstable_tree.root.get(&hash) {
                    Some(UnstableTreeNode {
                        children: UnstableChildren::Sub(map),
                    }) => map.get(&hash_max).copied(),
                    _ => None,
                };
                match found {
                    Some(t) => t,
                    None => {
                        self.unstable_insert_sub(item, hash, hash_max);
                        return None;
                    }
                }
            }
        };

        if self.rmaps.get(candidate).page == self.rmaps.get(item).page {
            return None;
        }
        if self.get_tree_rmap_item_page(candidate).is_err() {
            return None;
        }
        Some(candidate)
    }

    fn unstable_insert_first(&mut self, item: RmapRef, hash: u32) {
        self.unstable_tree.root.insert(
            hash,
            UnstableTreeNode {
                children: UnstableChildren::Single(item),
            },
        );
        self.mark_unstable(item, hash);
    }

    fn unstable_insert_sub(&mut self, item: RmapRef, hash: u32, hash_max: u32) {
        match self.unstable_tree.root.get_mut(&hash) {
            Some(UnstableTreeNode {
                children: UnstableChildren::Sub(map),
            }) => {
                let prev = map.insert(hash_max, item);
                debug_assert!(prev.is_none());
            }
            _ => unreachable!("sub insert without a sub-tree"),
        }
        self.mark_unstable(item, hash);
    }

    /// Insert `item` as a second-level sibling of `tree_item` after a merge
    /// attempt failed on a genuine collision. Promotes a lone child to a
    /// sub-tree first; gives up when both hash levels collide.
    pub(crate) fn unstable_insert_collision_sibling(
        &mut self,
        item: RmapRef,
        tree_item: RmapRef,
        hash: u32,
    ) {
        let single = matches!(
            self.unstable_tree.root.get(&hash),
            Some(UnstableTreeNode {
                children: UnstableChildren::Single(_),
            })
        );
        if single {
            let tree_max = self.rmap_item_hash_max(tree_item, hash);
            match self.unstable_tree.root.get_mut(&hash) {
                Some(tnode) => {
                    let mut map = BTreeMap::new();
                    map.insert(tree_max, tree_item);
                    tnode.children = UnstableChildren::Sub(map);
                }
                None => return,
            }
        } else {
            debug_assert!(self.rmaps.get(tree_item).hash_max != 0);
        }

        let hash_max = self.rmap_item_hash_max(item, hash);
        if hash_max == self.rmaps.get(tree_item).hash_max {
            // identical at both levels yet different content; recurring
            // collisions at this strength, nothing more to try
            return;
        }
        self.unstable_insert_sub(item, hash, hash_max);
    }

    fn mark_unstable(&mut self, item: RmapRef, hash: u32) {
        let round = self.scan_round;
        let it = self.rmaps.get_mut(item);
        it.set_unstable();
        it.append_round = round;
        it.tree_hash = hash;
        self.stats.pages_unshared += 1;
    }

    /// Unlink a current-round item. Only inserts of the running round have
    /// valid tree positions; the caller has already checked `append_round`.
    pub(crate) fn unstable_tree_erase(&mut self, hash: u32, item: RmapRef) {
        let remove_entry = match self.unstable_tree.root.get_mut(&hash) {
            None => false,
            Some(tnode) => match &mut tnode.children {
                UnstableChildren::Single(t) => *t == item,
                UnstableChildren::Sub(map) => {
                    let hash_max = self.rmaps.get(item).hash_max;
                    let removed = map.remove(&hash_max);
                    debug_assert!(removed.is_none() || removed == Some(item));
                    map.is_empty()
                }
            },
        };
        if remove_entry {
            self.unstable_tree.root.remove(&hash);
        }
    }
}
