//! In-memory tail of recent changes with observer fan-out.
//!
//! Each collection owns a [`SequenceTracker`]: a bounded ring of the most
//! recent changes plus registries of collection- and document-observers.
//! Notifications fire after the write transaction commits, outside any
//! lock; a panicking callback is logged and does not poison the tracker.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::revid::RevId;
use crate::store::DocumentFlags;

/// Default ring capacity per collection.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// One observed change.
#[derive(Debug, Clone)]
pub struct Change {
    pub doc_id: String,
    pub sequence: u64,
    pub rev_id: Option<RevId>,
    pub flags: DocumentFlags,
    /// True when the document was purged or expired rather than revised.
    pub purged: bool,
}

/// Result of asking for changes since a known sequence.
#[derive(Debug, Clone)]
pub enum ChangesSince {
    Changes(Vec<Change>),
    /// The ring no longer reaches back to the requested sequence; the
    /// caller must re-enumerate from storage.
    Overflow,
}

/// Token returned from observer registration; pass back to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(u64);

type ObserverCallback = std::sync::Arc<dyn Fn() + Send + Sync + 'static>;

struct CollectionObserver {
    token: u64,
    callback: ObserverCallback,
    /// Coalescing bit: set on notify, cleared on poll.
    notified: bool,
}

struct DocObserver {
    token: u64,
    doc_id: String,
    callback: ObserverCallback,
}

#[derive(Default)]
struct Ring {
    changes: VecDeque<Change>,
    capacity: usize,
    /// Sequence before the oldest retained change.
    floor: u64,
    last: u64,
}

/// Recent-change ring plus observers for one collection.
pub struct SequenceTracker {
    ring: Mutex<Ring>,
    collection_observers: Mutex<Vec<CollectionObserver>>,
    doc_observers: Mutex<Vec<DocObserver>>,
    next_token: AtomicU64,
}

impl std::fmt::Debug for SequenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("SequenceTracker")
            .field("entries", &ring.changes.len())
            .field("last", &ring.last)
            .finish()
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }
}

impl SequenceTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        SequenceTracker {
            ring: Mutex::new(Ring {
                capacity,
                ..Ring::default()
            }),
            collection_observers: Mutex::new(Vec::new()),
            doc_observers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Record committed changes and notify observers.
    ///
    /// Must be called after the transaction commits, without holding the
    /// write lock.
    pub fn post_changes(&self, changes: &[Change]) {
        if changes.is_empty() {
            return;
        }
        {
            let mut ring = self.ring.lock();
            for change in changes {
                if ring.changes.len() == ring.capacity {
                    if let Some(evicted) = ring.changes.pop_front() {
                        ring.floor = evicted.sequence;
                    }
                }
                ring.last = ring.last.max(change.sequence);
                ring.changes.push_back(change.clone());
            }
        }
        self.notify(changes);
    }

    fn notify(&self, changes: &[Change]) {
        let mut pending: Vec<ObserverCallback> = Vec::new();
        {
            let mut observers = self.collection_observers.lock();
            for obs in observers.iter_mut() {
                if !obs.notified {
                    obs.notified = true;
                    pending.push(obs.callback.clone());
                }
            }
        }
        {
            let doc_observers = self.doc_observers.lock();
            for obs in doc_observers.iter() {
                if changes.iter().any(|c| c.doc_id == obs.doc_id) {
                    pending.push(obs.callback.clone());
                }
            }
        }
        for cb in pending {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                warn!("change observer callback panicked");
            }
        }
    }

    /// Changes with sequence greater than `since`, or `Overflow` when the
    /// ring has already evicted part of that span.
    pub fn since(&self, since: u64, max: usize) -> ChangesSince {
        let ring = self.ring.lock();
        if since < ring.floor {
            return ChangesSince::Overflow;
        }
        ChangesSince::Changes(
            ring.changes
                .iter()
                .filter(|c| c.sequence > since)
                .take(max)
                .cloned()
                .collect(),
        )
    }

    pub fn last_sequence(&self) -> u64 {
        self.ring.lock().last
    }

    /// Register a coalescing collection observer.
    pub fn observe(&self, callback: impl Fn() + Send + Sync + 'static) -> ObserverToken {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.collection_observers.lock().push(CollectionObserver {
            token,
            callback: std::sync::Arc::new(callback),
            notified: false,
        });
        ObserverToken(token)
    }

    /// Register an observer for one document.
    pub fn observe_document(
        &self,
        doc_id: impl Into<String>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ObserverToken {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.doc_observers.lock().push(DocObserver {
            token,
            doc_id: doc_id.into(),
            callback: std::sync::Arc::new(callback),
        });
        ObserverToken(token)
    }

    /// Clear an observer's coalescing bit and return its pending changes.
    pub fn poll(&self, token: ObserverToken, since: u64, max: usize) -> ChangesSince {
        let mut observers = self.collection_observers.lock();
        if let Some(obs) = observers.iter_mut().find(|o| o.token == token.0) {
            obs.notified = false;
        }
        drop(observers);
        self.since(since, max)
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        let mut observers = self.collection_observers.lock();
        let before = observers.len();
        observers.retain(|o| o.token != token.0);
        if observers.len() != before {
            return true;
        }
        drop(observers);
        let mut doc_observers = self.doc_observers.lock();
        let before = doc_observers.len();
        doc_observers.retain(|o| o.token != token.0);
        doc_observers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn change(doc: &str, seq: u64) -> Change {
        Change {
            doc_id: doc.into(),
            sequence: seq,
            rev_id: None,
            flags: DocumentFlags::default(),
            purged: false,
        }
    }

    #[test]
    fn since_returns_tail() {
        let tracker = SequenceTracker::default();
        tracker.post_changes(&[change("a", 1), change("b", 2), change("c", 3)]);
        match tracker.since(1, 10) {
            ChangesSince::Changes(changes) => {
                let seqs: Vec<u64> = changes.iter().map(|c| c.sequence).collect();
                assert_eq!(seqs, vec![2, 3]);
            }
            ChangesSince::Overflow => panic!("unexpected overflow"),
        }
    }

    #[test]
    fn overflow_when_ring_wraps() {
        let tracker = SequenceTracker::with_capacity(2);
        tracker.post_changes(&[change("a", 1), change("b", 2), change("c", 3)]);
        assert!(matches!(tracker.since(0, 10), ChangesSince::Overflow));
        assert!(matches!(tracker.since(1, 10), ChangesSince::Changes(_)));
    }

    #[test]
    fn collection_observer_coalesces() {
        let tracker = SequenceTracker::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let token = tracker.observe(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tracker.post_changes(&[change("a", 1)]);
        tracker.post_changes(&[change("b", 2)]);
        // Second post coalesced into the first notification.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tracker.poll(token, 0, 10);
        tracker.post_changes(&[change("c", 3)]);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(tracker.remove_observer(token));
        assert!(!tracker.remove_observer(token));
    }

    #[test]
    fn document_observer_matches_id() {
        let tracker = SequenceTracker::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        tracker.observe_document("watched", move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tracker.post_changes(&[change("other", 1)]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tracker.post_changes(&[change("watched", 2)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_observer_does_not_poison() {
        let tracker = SequenceTracker::default();
        tracker.observe(|| panic!("observer bug"));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        tracker.observe(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        tracker.post_changes(&[change("a", 1)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
