//! Per-document revision trees.
//!
//! All revisions of a document live in one arena; parent links are `u32`
//! indices into it. The arena may hold a forest: replication can introduce
//! revisions whose ancestors were never seen locally, which become extra
//! roots. Leaf bits are maintained incrementally on insert.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::revid::RevId;

/// Index of a revision inside its tree's arena.
pub type RevIndex = u32;

/// Per-revision flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RevFlags(pub u8);

impl RevFlags {
    pub const DELETED: RevFlags = RevFlags(0x01);
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(0x02);
    pub const KEEP_BODY: RevFlags = RevFlags(0x04);
    pub const IS_LEAF: RevFlags = RevFlags(0x08);
    pub const IS_CONFLICT: RevFlags = RevFlags(0x10);

    pub fn contains(&self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: RevFlags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: RevFlags) {
        self.0 &= !other.0;
    }

    pub fn with(mut self, other: RevFlags) -> RevFlags {
        self.set(other);
        self
    }
}

impl std::ops::BitOr for RevFlags {
    type Output = RevFlags;
    fn bitor(self, rhs: RevFlags) -> RevFlags {
        RevFlags(self.0 | rhs.0)
    }
}

/// One revision: id, parent link, flags, the sequence it was saved under,
/// and the body if it is still retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rev {
    pub rev_id: RevId,
    pub parent: Option<RevIndex>,
    pub flags: RevFlags,
    pub sequence: u64,
    pub body: Option<Bytes>,
}

impl Rev {
    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::IS_LEAF)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }
}

/// Outcome of a successful insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub index: RevIndex,
    /// Whether the inserted revision is now the document's current leaf.
    pub promoted: bool,
}

/// The revision arena of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevTree {
    revs: Vec<Rev>,
    /// Latest revision known to each remote peer, by remote id.
    remote_ancestors: BTreeMap<u64, RevIndex>,
}

impl RevTree {
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn rev(&self, index: RevIndex) -> &Rev {
        &self.revs[index as usize]
    }

    pub fn rev_mut(&mut self, index: RevIndex) -> &mut Rev {
        &mut self.revs[index as usize]
    }

    pub fn find(&self, rev_id: &RevId) -> Option<RevIndex> {
        self.revs
            .iter()
            .position(|r| r.rev_id == *rev_id)
            .map(|i| i as RevIndex)
    }

    /// All leaves, ascending by `(generation, revID)`.
    pub fn leaves(&self) -> Vec<RevIndex> {
        let mut leaves: Vec<RevIndex> = (0..self.revs.len() as RevIndex)
            .filter(|&i| self.rev(i).is_leaf())
            .collect();
        leaves.sort_by(|&a, &b| self.rev(a).rev_id.total_cmp(&self.rev(b).rev_id));
        leaves
    }

    /// The current leaf: the non-deleted leaf with the highest
    /// `(generation, revID)`; if every leaf is deleted, the highest leaf.
    pub fn current(&self) -> Option<RevIndex> {
        let leaves = self.leaves();
        leaves
            .iter()
            .rev()
            .copied()
            .find(|&i| !self.rev(i).is_deleted())
            .or_else(|| leaves.last().copied())
    }

    /// Conflict ⇔ more than one non-deleted leaf.
    pub fn has_conflict(&self) -> bool {
        self.live_leaf_count() > 1
    }

    fn live_leaf_count(&self) -> usize {
        self.revs
            .iter()
            .filter(|r| r.is_leaf() && !r.is_deleted())
            .count()
    }

    pub fn parent_of(&self, index: RevIndex) -> Option<RevIndex> {
        self.rev(index).parent
    }

    /// Next revision in arena order, for exhaustive traversal.
    pub fn next_after(&self, index: RevIndex) -> Option<RevIndex> {
        let next = index + 1;
        (next < self.revs.len() as RevIndex).then_some(next)
    }

    /// Next leaf after `index` in `(generation, revID)` order.
    pub fn next_leaf_after(&self, index: RevIndex) -> Option<RevIndex> {
        let leaves = self.leaves();
        match leaves.iter().position(|&i| i == index) {
            Some(pos) => leaves.get(pos + 1).copied(),
            None => leaves.first().copied(),
        }
    }

    /// Deepest common ancestor of two revisions, if any.
    pub fn common_ancestor(&self, a: RevIndex, b: RevIndex) -> Option<RevIndex> {
        let mut seen = Vec::new();
        let mut cursor = Some(a);
        while let Some(i) = cursor {
            seen.push(i);
            cursor = self.rev(i).parent;
        }
        let mut cursor = Some(b);
        while let Some(i) = cursor {
            if seen.contains(&i) {
                return Some(i);
            }
            cursor = self.rev(i).parent;
        }
        None
    }

    /// Revision history of `index`, newest first, following parent links.
    pub fn history(&self, index: RevIndex) -> Vec<RevId> {
        let mut out = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            out.push(self.rev(i).rev_id.clone());
            cursor = self.rev(i).parent;
        }
        out
    }

    /// Insert a revision whose parent (if any) is already present.
    ///
    /// Inserting a non-deleted revision whose parent is not a leaf (or a
    /// second root while the tree is non-empty) fails with `Conflict`
    /// unless `allow_conflict` is set.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        parent_id: Option<&RevId>,
        flags: RevFlags,
        allow_conflict: bool,
    ) -> Result<InsertOutcome> {
        if self.find(&rev_id).is_some() {
            return Err(Error::Conflict);
        }
        let parent = match parent_id {
            Some(id) => Some(self.find(id).ok_or(Error::NotFound)?),
            None => None,
        };
        let deleted = flags.contains(RevFlags::DELETED);
        let creates_branch = match parent {
            Some(p) => !self.rev(p).is_leaf(),
            None => !self.revs.is_empty(),
        };
        if creates_branch && !allow_conflict && !deleted {
            return Err(Error::Conflict);
        }
        if let (Some(p), RevId::Tree { gen, .. }) = (parent, &rev_id) {
            if *gen != self.rev(p).rev_id.generation() + 1 {
                return Err(Error::corrupt("generation must be parent generation + 1"));
            }
        }
        let index = self.push_leaf(rev_id, body, parent, flags, creates_branch);
        let promoted = self.current() == Some(index);
        Ok(InsertOutcome { index, promoted })
    }

    /// Idempotently insert a revision with its ancestry.
    ///
    /// `history[0]` is the revision itself, the rest its ancestors oldest
    /// last. The chain is linked to whichever entry already exists;
    /// otherwise it becomes a new root. Returns the number of revisions
    /// added (0 if `history[0]` was already present).
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Option<Bytes>,
        flags: RevFlags,
    ) -> Result<usize> {
        if history.is_empty() {
            return Err(Error::invalid_parameter("empty revision history"));
        }
        if let Some(existing) = self.find(&history[0]) {
            // Already known; a body received again may refresh a pruned one.
            if body.is_some() && self.rev(existing).body.is_none() && self.rev(existing).is_leaf() {
                self.rev_mut(existing).body = body;
            }
            return Ok(0);
        }
        // Find the newest history entry we already have.
        let mut known = None;
        let mut first_new = history.len();
        for (i, id) in history.iter().enumerate().skip(1) {
            if let Some(idx) = self.find(id) {
                known = Some(idx);
                first_new = i;
                break;
            }
        }
        // Insert the missing span, oldest first.
        let mut parent = known;
        if let Some(p) = parent {
            if self.rev(p).is_leaf() {
                self.rev_mut(p).flags.clear(RevFlags::IS_LEAF);
            }
        }
        let is_branch = match known {
            Some(_) => false, // linking below an existing rev; branching is detected there
            None => !self.revs.is_empty(),
        };
        let mut added = 0;
        for id in history[..first_new].iter().rev() {
            let is_last = added == first_new - 1;
            let rev_flags = if is_last {
                flags.with(RevFlags::IS_LEAF)
            } else {
                RevFlags::default()
            };
            let rev_body = if is_last { body.clone() } else { None };
            let index = self.revs.len() as RevIndex;
            self.revs.push(Rev {
                rev_id: id.clone(),
                parent,
                flags: rev_flags,
                sequence: 0,
                body: rev_body,
            });
            parent = Some(index);
            added += 1;
        }
        // A new branch produced an extra live leaf: flag the conflict.
        if (is_branch || known.is_some()) && self.live_leaf_count() > 1 {
            if let Some(last) = parent {
                self.rev_mut(last).flags.set(RevFlags::IS_CONFLICT);
            }
        }
        Ok(added)
    }

    fn push_leaf(
        &mut self,
        rev_id: RevId,
        body: Option<Bytes>,
        parent: Option<RevIndex>,
        flags: RevFlags,
        is_branch: bool,
    ) -> RevIndex {
        if let Some(p) = parent {
            self.rev_mut(p).flags.clear(RevFlags::IS_LEAF);
            // A parent's body is only retained while it is a leaf.
            if !self.rev(p).flags.contains(RevFlags::KEEP_BODY)
                && !self.is_remote_ancestor(p)
            {
                self.rev_mut(p).body = None;
            }
        }
        let mut flags = flags.with(RevFlags::IS_LEAF);
        if is_branch {
            flags.set(RevFlags::IS_CONFLICT);
        }
        let index = self.revs.len() as RevIndex;
        self.revs.push(Rev {
            rev_id,
            parent,
            flags,
            sequence: 0,
            body,
        });
        index
    }

    /// Latest revision known to remote `remote_id`.
    pub fn remote_ancestor(&self, remote_id: u64) -> Option<RevIndex> {
        self.remote_ancestors.get(&remote_id).copied()
    }

    pub fn set_remote_ancestor(&mut self, remote_id: u64, index: RevIndex) {
        self.remote_ancestors.insert(remote_id, index);
    }

    fn is_remote_ancestor(&self, index: RevIndex) -> bool {
        self.remote_ancestors.values().any(|&i| i == index)
    }

    /// Drop revision bodies that no longer need to be retained: everything
    /// but leaves, `KEEP_BODY` revisions, and remote ancestors.
    pub fn drop_stale_bodies(&mut self) {
        for i in 0..self.revs.len() as RevIndex {
            let rev = self.rev(i);
            if rev.body.is_some()
                && !rev.is_leaf()
                && !rev.flags.contains(RevFlags::KEEP_BODY)
                && !self.is_remote_ancestor(i)
            {
                self.rev_mut(i).body = None;
            }
        }
    }

    /// Prune the tree to at most `max_depth` revisions behind any leaf and
    /// at most `max_revs` total, preserving all leaves and the chains down
    /// to every remote ancestor. Returns the number of revisions removed.
    pub fn prune(&mut self, max_depth: usize, max_revs: usize) -> usize {
        if self.revs.is_empty() || max_depth == 0 {
            return 0;
        }
        let mut keep = vec![false; self.revs.len()];
        for leaf in self.leaves() {
            let mut cursor = Some(leaf);
            let mut depth = 0;
            while let Some(i) = cursor {
                if depth >= max_depth {
                    break;
                }
                keep[i as usize] = true;
                cursor = self.rev(i).parent;
                depth += 1;
            }
        }
        // Keep every remote ancestor and its chain up to a kept revision,
        // so the replicator can still compute deltas against that peer.
        for &anchor in self.remote_ancestors.values() {
            let mut cursor = Some(anchor);
            while let Some(i) = cursor {
                if keep[i as usize] {
                    break;
                }
                keep[i as usize] = true;
                cursor = self.rev(i).parent;
            }
        }
        // Enforce the total cap by shedding the oldest kept non-leaf revs.
        let mut kept: Vec<RevIndex> = (0..self.revs.len() as RevIndex)
            .filter(|&i| keep[i as usize])
            .collect();
        if kept.len() > max_revs && max_revs > 0 {
            kept.sort_by(|&a, &b| self.rev(a).rev_id.total_cmp(&self.rev(b).rev_id));
            let mut excess = kept.len() - max_revs;
            for &i in &kept {
                if excess == 0 {
                    break;
                }
                if !self.rev(i).is_leaf() && !self.is_remote_ancestor(i) {
                    keep[i as usize] = false;
                    excess -= 1;
                }
            }
        }
        self.retain(&keep)
    }

    /// Remove a revision and all its descendants. Returns removed count.
    pub fn purge(&mut self, rev_id: &RevId) -> Result<usize> {
        let root = self.find(rev_id).ok_or(Error::NotFound)?;
        let mut doomed = vec![false; self.revs.len()];
        doomed[root as usize] = true;
        // Parents always precede children is not guaranteed across
        // insert_history calls, so iterate to a fixed point.
        loop {
            let mut changed = false;
            for i in 0..self.revs.len() {
                if doomed[i] {
                    continue;
                }
                if let Some(p) = self.revs[i].parent {
                    if doomed[p as usize] {
                        doomed[i] = true;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        let keep: Vec<bool> = doomed.iter().map(|&d| !d).collect();
        let removed = self.retain(&keep);
        // The purged branch's parent may have become a leaf again.
        self.restore_leaves();
        Ok(removed)
    }

    /// Resolve a conflict between two leaves.
    ///
    /// The loser is tombstoned with `loser_tombstone_id`; if a merged
    /// revision is provided it is inserted as a child of the winner.
    pub fn resolve_conflict(
        &mut self,
        winner: &RevId,
        loser: &RevId,
        loser_tombstone_id: RevId,
        merged: Option<(RevId, Bytes, RevFlags)>,
    ) -> Result<()> {
        let winner_idx = self.find(winner).ok_or(Error::NotFound)?;
        let loser_idx = self.find(loser).ok_or(Error::NotFound)?;
        if !self.rev(winner_idx).is_leaf() || !self.rev(loser_idx).is_leaf() {
            return Err(Error::Conflict);
        }
        self.push_leaf(
            loser_tombstone_id,
            None,
            Some(loser_idx),
            RevFlags::DELETED,
            false,
        );
        if let Some((merged_id, merged_body, merged_flags)) = merged {
            self.push_leaf(merged_id, Some(merged_body), Some(winner_idx), merged_flags, false);
        }
        if !self.has_conflict() {
            for i in 0..self.revs.len() as RevIndex {
                self.rev_mut(i).flags.clear(RevFlags::IS_CONFLICT);
            }
        }
        Ok(())
    }

    /// Compact the arena to `keep`, remapping parent links and remote
    /// anchors. Returns the number of removed revisions.
    fn retain(&mut self, keep: &[bool]) -> usize {
        let removed = keep.iter().filter(|&&k| !k).count();
        if removed == 0 {
            return 0;
        }
        let mut remap: HashMap<RevIndex, RevIndex> = HashMap::new();
        let mut next = 0u32;
        for (i, &k) in keep.iter().enumerate() {
            if k {
                remap.insert(i as RevIndex, next);
                next += 1;
            }
        }
        let old = std::mem::take(&mut self.revs);
        for (i, mut rev) in old.into_iter().enumerate() {
            if !keep[i] {
                continue;
            }
            rev.parent = rev
                .parent
                .and_then(|p| remap.get(&p).copied());
            self.revs.push(rev);
        }
        let old_remotes = std::mem::take(&mut self.remote_ancestors);
        for (remote, idx) in old_remotes {
            if let Some(&new_idx) = remap.get(&idx) {
                self.remote_ancestors.insert(remote, new_idx);
            }
        }
        removed
    }

    /// Recompute leaf bits from parent links.
    fn restore_leaves(&mut self) {
        let mut has_child = vec![false; self.revs.len()];
        for rev in &self.revs {
            if let Some(p) = rev.parent {
                has_child[p as usize] = true;
            }
        }
        for (i, rev) in self.revs.iter_mut().enumerate() {
            if has_child[i] {
                rev.flags.clear(RevFlags::IS_LEAF);
            } else {
                rev.flags.set(RevFlags::IS_LEAF);
            }
        }
    }

    /// Encode into the packed meta blob stored in the key-store record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode a stored meta blob.
    pub fn decode(data: &[u8]) -> Result<RevTree> {
        Ok(postcard::from_bytes(data)?)
    }

    /// Highest sequence assigned to any revision.
    pub fn max_sequence(&self) -> u64 {
        self.revs.iter().map(|r| r.sequence).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(gen: u64, seed: u8) -> RevId {
        RevId::Tree {
            gen,
            digest: [seed; 20],
        }
    }

    fn body(text: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn linear_inserts() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2 = id(2, 2);
        tree.insert(r1.clone(), body("a"), None, RevFlags::default(), false)
            .unwrap();
        let out = tree
            .insert(r2.clone(), body("b"), Some(&r1), RevFlags::default(), false)
            .unwrap();
        assert!(out.promoted);
        assert_eq!(tree.current(), Some(out.index));
        assert_eq!(tree.rev(out.index).rev_id, r2);
        assert!(!tree.has_conflict());
        // Parent body was dropped when it stopped being a leaf.
        assert!(tree.rev(0).body.is_none());
    }

    #[test]
    fn duplicate_insert_conflicts() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        assert!(matches!(
            tree.insert(r1, None, None, RevFlags::default(), false),
            Err(Error::Conflict)
        ));
    }

    #[test]
    fn branch_requires_allow_conflict() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2a = id(2, 2);
        let r2b = id(2, 3);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2a.clone(), None, Some(&r1), RevFlags::default(), false)
            .unwrap();
        assert!(matches!(
            tree.insert(r2b.clone(), None, Some(&r1), RevFlags::default(), false),
            Err(Error::Conflict)
        ));
        tree.insert(r2b.clone(), None, Some(&r1), RevFlags::default(), true)
            .unwrap();
        assert!(tree.has_conflict());
        // Current is the branch with the higher revid text: seed 3 > seed 2.
        let current = tree.current().unwrap();
        assert_eq!(tree.rev(current).rev_id, r2b);
        // Leaves visit in (generation, revID) order.
        let leaves = tree.leaves();
        assert_eq!(tree.rev(leaves[0]).rev_id, r2a);
        assert_eq!(tree.rev(leaves[1]).rev_id, r2b);
    }

    #[test]
    fn generation_gap_rejected() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        assert!(tree
            .insert(id(5, 9), None, Some(&r1), RevFlags::default(), false)
            .is_err());
    }

    #[test]
    fn deleted_leaf_yields_current_to_live_branch() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2a = id(2, 9);
        let r2b = id(2, 2);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2a.clone(), None, Some(&r1), RevFlags::DELETED, true)
            .unwrap();
        tree.insert(r2b.clone(), None, Some(&r1), RevFlags::default(), true)
            .unwrap();
        // r2a sorts higher but is deleted; current is the live r2b.
        let current = tree.current().unwrap();
        assert_eq!(tree.rev(current).rev_id, r2b);
        assert!(!tree.has_conflict());
    }

    #[test]
    fn insert_history_links_to_known_ancestor() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2 = id(2, 2);
        let r3 = id(3, 3);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2.clone(), None, Some(&r1), RevFlags::default(), false)
            .unwrap();
        let added = tree
            .insert_history(
                &[r3.clone(), r2.clone(), r1.clone()],
                body("new"),
                RevFlags::default(),
            )
            .unwrap();
        assert_eq!(added, 1);
        let idx = tree.find(&r3).unwrap();
        assert_eq!(tree.rev(idx).parent, tree.find(&r2));
        assert!(tree.rev(idx).is_leaf());
        assert!(!tree.rev(tree.find(&r2).unwrap()).is_leaf());
    }

    #[test]
    fn insert_history_is_idempotent() {
        let mut tree = RevTree::default();
        let history = [id(3, 3), id(2, 2), id(1, 1)];
        let added = tree
            .insert_history(&history, body("x"), RevFlags::default())
            .unwrap();
        assert_eq!(added, 3);
        let snapshot = tree.encode().unwrap();
        let added = tree
            .insert_history(&history, body("x"), RevFlags::default())
            .unwrap();
        assert_eq!(added, 0);
        assert_eq!(tree.encode().unwrap(), snapshot);
    }

    #[test]
    fn history_round_trip() {
        let mut tree = RevTree::default();
        let history = [id(3, 3), id(2, 2), id(1, 1)];
        tree.insert_history(&history, body("x"), RevFlags::default())
            .unwrap();
        let idx = tree.find(&history[0]).unwrap();
        assert_eq!(tree.history(idx), history.to_vec());
    }

    #[test]
    fn common_ancestor_across_branches() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2a = id(2, 2);
        let r2b = id(2, 3);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2a.clone(), None, Some(&r1), RevFlags::default(), false)
            .unwrap();
        tree.insert(r2b.clone(), None, Some(&r1), RevFlags::default(), true)
            .unwrap();
        let a = tree.find(&r2a).unwrap();
        let b = tree.find(&r2b).unwrap();
        assert_eq!(tree.common_ancestor(a, b), tree.find(&r1));
    }

    #[test]
    fn prune_keeps_leaves_and_depth() {
        let mut tree = RevTree::default();
        let mut parent: Option<RevId> = None;
        for gen in 1..=50u64 {
            let rid = id(gen, gen as u8);
            tree.insert(
                rid.clone(),
                body("b"),
                parent.as_ref(),
                RevFlags::default(),
                false,
            )
            .unwrap();
            parent = Some(rid);
        }
        let current_before = tree.rev(tree.current().unwrap()).rev_id.clone();
        let removed = tree.prune(20, usize::MAX);
        assert_eq!(removed, 30);
        assert_eq!(tree.len(), 20);
        let current_after = tree.rev(tree.current().unwrap()).rev_id.clone();
        assert_eq!(current_before, current_after);
        // The oldest surviving revision became a root.
        assert!(tree.revs.iter().any(|r| r.parent.is_none()));
    }

    #[test]
    fn prune_preserves_remote_ancestor_chain() {
        let mut tree = RevTree::default();
        let mut parent: Option<RevId> = None;
        for gen in 1..=30u64 {
            let rid = id(gen, gen as u8);
            tree.insert(
                rid.clone(),
                body("b"),
                parent.as_ref(),
                RevFlags::default(),
                false,
            )
            .unwrap();
            parent = Some(rid);
        }
        let anchor = tree.find(&id(5, 5)).unwrap();
        tree.set_remote_ancestor(7, anchor);
        tree.prune(10, usize::MAX);
        let anchor = tree.remote_ancestor(7).unwrap();
        assert_eq!(tree.rev(anchor).rev_id, id(5, 5));
    }

    #[test]
    fn purge_removes_branch() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2a = id(2, 2);
        let r2b = id(2, 3);
        let r3b = id(3, 4);
        tree.insert(r1.clone(), None, None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2a.clone(), None, Some(&r1), RevFlags::default(), false)
            .unwrap();
        tree.insert(r2b.clone(), None, Some(&r1), RevFlags::default(), true)
            .unwrap();
        tree.insert(r3b.clone(), None, Some(&r2b), RevFlags::default(), false)
            .unwrap();
        let removed = tree.purge(&r2b).unwrap();
        assert_eq!(removed, 2);
        assert!(tree.find(&r2b).is_none());
        assert!(tree.find(&r3b).is_none());
        assert!(!tree.has_conflict());
        assert!(tree.rev(tree.find(&r2a).unwrap()).is_leaf());
    }

    #[test]
    fn resolve_conflict_with_merge() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2a = id(2, 2);
        let r2b = id(2, 3);
        tree.insert(r1.clone(), body("base"), None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2a.clone(), body("a"), Some(&r1), RevFlags::default(), false)
            .unwrap();
        tree.insert(r2b.clone(), body("b"), Some(&r1), RevFlags::default(), true)
            .unwrap();
        assert!(tree.has_conflict());
        tree.resolve_conflict(
            &r2a,
            &r2b,
            id(3, 9),
            Some((id(3, 5), Bytes::from_static(b"merged"), RevFlags::default())),
        )
        .unwrap();
        assert!(!tree.has_conflict());
        let current = tree.current().unwrap();
        assert_eq!(tree.rev(current).rev_id, id(3, 5));
        assert_eq!(tree.rev(current).body.as_deref(), Some(&b"merged"[..]));
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut tree = RevTree::default();
        let r1 = id(1, 1);
        let r2 = id(2, 2);
        tree.insert(r1.clone(), body("a"), None, RevFlags::default(), false)
            .unwrap();
        tree.insert(r2.clone(), body("b"), Some(&r1), RevFlags::default(), false)
            .unwrap();
        tree.set_remote_ancestor(1, tree.find(&r2).unwrap());
        let blob = tree.encode().unwrap();
        let decoded = RevTree::decode(&blob).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.rev(decoded.current().unwrap()).rev_id, r2);
        assert_eq!(decoded.remote_ancestor(1), tree.remote_ancestor(1));
    }

    proptest! {
        #[test]
        fn insert_history_twice_is_noop(len in 1usize..12) {
            let history: Vec<RevId> =
                (0..len).map(|i| id((len - i) as u64, i as u8)).collect();
            let mut tree = RevTree::default();
            tree.insert_history(&history, body("x"), RevFlags::default()).unwrap();
            let snapshot = tree.encode().unwrap();
            tree.insert_history(&history, body("x"), RevFlags::default()).unwrap();
            prop_assert_eq!(tree.encode().unwrap(), snapshot);
        }
    }
}
