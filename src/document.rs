//! Document assembly: key-store records <-> revision trees.
//!
//! A [`Document`] is the in-memory form of one record: its decoded
//! revision tree plus a selection cursor. Mutations accumulate in the tree
//! and hit storage only on [`Document::save`].

use bytes::Bytes;
use serde_json::Value;
use tracing::trace;

use crate::body::{self, EncodedBody};
use crate::error::{Error, Result};
use crate::revid::{PeerId, RevId};
use crate::revtree::{RevFlags, RevIndex, RevTree};
use crate::store::{ContentOption, DocumentFlags, KeyStore, Record, Transaction};
use crate::tracker::Change;

/// Which revision-id form new revisions take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevIdStyle {
    #[default]
    Tree,
    VersionVector,
}

/// Attributes of the currently selected revision.
#[derive(Debug, Clone)]
pub struct SelectedRev {
    pub rev_id: RevId,
    pub flags: RevFlags,
    pub sequence: u64,
    pub body: Option<Bytes>,
}

/// One document with its full revision tree.
#[derive(Debug, Clone)]
pub struct Document {
    doc_id: String,
    tree: RevTree,
    sequence: u64,
    flags: DocumentFlags,
    expiration: Option<i64>,
    selected: Option<RevIndex>,
    exists: bool,
}

impl Document {
    /// Load a document, or produce an empty shell for a new doc id.
    pub fn load(store: &KeyStore, doc_id: &str) -> Result<Document> {
        crate::revid::validate_doc_id(doc_id)?;
        match store.get(doc_id, ContentOption::EntireBody)? {
            Some(record) => Document::from_record(record),
            None => Ok(Document {
                doc_id: doc_id.to_string(),
                tree: RevTree::default(),
                sequence: 0,
                flags: DocumentFlags::default(),
                expiration: None,
                selected: None,
                exists: false,
            }),
        }
    }

    /// Rebuild from a stored record.
    pub fn from_record(record: Record) -> Result<Document> {
        let tree = if record.meta.is_empty() {
            RevTree::default()
        } else {
            RevTree::decode(&record.meta)?
        };
        let selected = tree.current();
        Ok(Document {
            doc_id: record.key,
            tree,
            sequence: record.sequence,
            flags: record.flags,
            expiration: record.expiration,
            selected,
            exists: true,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn flags(&self) -> DocumentFlags {
        self.flags
    }

    pub fn expiration(&self) -> Option<i64> {
        self.expiration
    }

    pub fn tree(&self) -> &RevTree {
        &self.tree
    }

    pub fn is_conflicted(&self) -> bool {
        self.tree.has_conflict()
    }

    // --- selection cursor ---

    pub fn selected(&self) -> Option<SelectedRev> {
        let index = self.selected?;
        let rev = self.tree.rev(index);
        Some(SelectedRev {
            rev_id: rev.rev_id.clone(),
            flags: rev.flags,
            sequence: rev.sequence,
            body: rev.body.clone(),
        })
    }

    pub fn select_current(&mut self) -> Option<SelectedRev> {
        self.selected = self.tree.current();
        self.selected()
    }

    pub fn select_rev(&mut self, rev_id: &RevId) -> Result<SelectedRev> {
        self.selected = Some(self.tree.find(rev_id).ok_or(Error::NotFound)?);
        Ok(self.selected().expect("just selected"))
    }

    pub fn select_parent(&mut self) -> Option<SelectedRev> {
        self.selected = self.tree.parent_of(self.selected?);
        self.selected()
    }

    pub fn select_next(&mut self) -> Option<SelectedRev> {
        self.selected = self.tree.next_after(self.selected?);
        self.selected()
    }

    pub fn select_next_leaf(&mut self) -> Option<SelectedRev> {
        self.selected = self.tree.next_leaf_after(self.selected?);
        self.selected()
    }

    pub fn select_common_ancestor(&mut self, a: &RevId, b: &RevId) -> Result<SelectedRev> {
        let a = self.tree.find(a).ok_or(Error::NotFound)?;
        let b = self.tree.find(b).ok_or(Error::NotFound)?;
        self.selected = self.tree.common_ancestor(a, b);
        self.selected().ok_or(Error::NotFound)
    }

    /// Decoded body of the selected revision.
    ///
    /// `NotFound` if the revision's body was pruned.
    pub fn body(&self) -> Result<Value> {
        let selected = self.selected().ok_or(Error::NotFound)?;
        let raw = selected.body.ok_or(Error::NotFound)?;
        body::decode(&raw)
    }

    /// Revision history of the selected revision, newest first.
    pub fn history(&self) -> Vec<RevId> {
        match self.selected {
            Some(index) => self.tree.history(index),
            None => Vec::new(),
        }
    }

    // --- mutation ---

    /// Create a new revision as a child of the selected revision (or of the
    /// current leaf when nothing is selected).
    pub fn put_new_revision(
        &mut self,
        body_value: &Value,
        deleted: bool,
        allow_conflict: bool,
        style: RevIdStyle,
        local_peer: PeerId,
    ) -> Result<RevId> {
        let encoded = EncodedBody::encode(body_value);
        let parent_index = self.selected.or_else(|| self.tree.current());
        let parent_id = parent_index.map(|i| self.tree.rev(i).rev_id.clone());
        let rev_id = match style {
            RevIdStyle::Tree => {
                RevId::new_tree_child(parent_id.as_ref(), deleted, encoded.as_bytes())
            }
            RevIdStyle::VersionVector => {
                RevId::new_version_child(parent_id.as_ref(), local_peer)?
            }
        };
        let mut flags = RevFlags::default();
        if deleted {
            flags.set(RevFlags::DELETED);
        }
        if body::has_blob_refs(body_value) {
            flags.set(RevFlags::HAS_ATTACHMENTS);
        }
        let outcome = self.tree.insert(
            rev_id.clone(),
            Some(encoded.0),
            parent_id.as_ref(),
            flags,
            allow_conflict,
        )?;
        self.selected = Some(outcome.index);
        trace!(doc = %self.doc_id, rev = %rev_id, "new revision");
        Ok(rev_id)
    }

    /// Insert a revision received from a peer, with its history chain.
    ///
    /// Idempotent; returns the number of revisions actually added.
    pub fn put_existing_revision(
        &mut self,
        history: &[RevId],
        body_bytes: Option<Bytes>,
        deleted: bool,
        has_attachments: bool,
    ) -> Result<usize> {
        let mut flags = RevFlags::default();
        if deleted {
            flags.set(RevFlags::DELETED);
        }
        if has_attachments {
            flags.set(RevFlags::HAS_ATTACHMENTS);
        }
        let added = self.tree.insert_history(history, body_bytes, flags)?;
        if added > 0 {
            self.selected = self.tree.find(&history[0]);
        }
        Ok(added)
    }

    /// Resolve a conflict between two leaves; see [`RevTree::resolve_conflict`].
    pub fn resolve_conflict(
        &mut self,
        winner: &RevId,
        loser: &RevId,
        merged_body: Option<&Value>,
        style: RevIdStyle,
        local_peer: PeerId,
    ) -> Result<Option<RevId>> {
        let tombstone = match style {
            RevIdStyle::Tree => RevId::new_tree_child(Some(loser), true, &[]),
            RevIdStyle::VersionVector => RevId::new_version_child(Some(loser), local_peer)?,
        };
        let merged = match merged_body {
            Some(value) => {
                let encoded = EncodedBody::encode(value);
                let merged_id = match style {
                    RevIdStyle::Tree => {
                        RevId::new_tree_child(Some(winner), false, encoded.as_bytes())
                    }
                    RevIdStyle::VersionVector => {
                        RevId::new_version_child(Some(winner), local_peer)?
                    }
                };
                Some((merged_id, encoded.0, RevFlags::default()))
            }
            None => None,
        };
        let merged_id = merged.as_ref().map(|(id, _, _)| id.clone());
        self.tree.resolve_conflict(winner, loser, tombstone, merged)?;
        self.selected = self.tree.current();
        Ok(merged_id)
    }

    /// Remove a revision and its descendants. Returns true when the whole
    /// document is gone and the caller should delete the record.
    pub fn purge_revision(&mut self, rev_id: &RevId) -> Result<bool> {
        self.tree.purge(rev_id)?;
        self.selected = self.tree.current();
        Ok(self.tree.is_empty())
    }

    pub fn set_remote_ancestor(&mut self, remote_id: u64, rev_id: &RevId) -> Result<()> {
        let index = self.tree.find(rev_id).ok_or(Error::NotFound)?;
        self.tree.set_remote_ancestor(remote_id, index);
        Ok(())
    }

    pub fn remote_ancestor(&self, remote_id: u64) -> Option<RevId> {
        self.tree
            .remote_ancestor(remote_id)
            .map(|i| self.tree.rev(i).rev_id.clone())
    }

    pub fn set_expiration(&mut self, when: Option<i64>) {
        self.expiration = when;
    }

    /// Persist the tree, pruning to `max_depth`, recomputing record flags,
    /// and assigning the next sequence. Returns the change to post to the
    /// sequence tracker after commit.
    pub fn save(
        &mut self,
        store: &KeyStore,
        txn: &Transaction<'_>,
        max_depth: usize,
    ) -> Result<Change> {
        self.tree.prune(max_depth, usize::MAX);
        self.tree.drop_stale_bodies();
        let current = self.tree.current().ok_or(Error::NotFound)?;
        let current_rev = self.tree.rev(current).clone();

        let mut flags = DocumentFlags::default();
        if current_rev.is_deleted() {
            flags.set(DocumentFlags::DELETED);
        }
        if self.tree.has_conflict() {
            flags.set(DocumentFlags::CONFLICTED);
        }
        if current_rev.flags.contains(RevFlags::HAS_ATTACHMENTS) {
            flags.set(DocumentFlags::HAS_ATTACHMENTS);
        }

        let record_body = current_rev.body.clone().unwrap_or_default();
        // Assign the sequence before encoding so the meta blob records it.
        let sequence = store.last_sequence()? + 1;
        for i in 0..self.tree.len() as RevIndex {
            if self.tree.rev(i).sequence == 0 {
                self.tree.rev_mut(i).sequence = sequence;
            }
        }
        let meta = self.tree.encode()?;
        let assigned = store.set(txn, &self.doc_id, &meta, &record_body, flags, self.expiration)?;
        debug_assert_eq!(assigned, sequence);
        self.sequence = assigned;
        self.flags = flags;
        self.exists = true;
        Ok(Change {
            doc_id: self.doc_id.clone(),
            sequence: assigned,
            rev_id: Some(current_rev.rev_id),
            flags,
            purged: false,
        })
    }
}
