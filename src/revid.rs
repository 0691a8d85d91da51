//! Revision identifiers.
//!
//! Two encodings coexist:
//!
//! - **Tree form** `"<generation>-<40 hex digest>"`, where generations
//!   increase by exactly one along parent links and the digest covers the
//!   parent id, the deletion flag, and the canonical body.
//! - **Version-vector form** `"<peer>@<counter>[,<peer>@<counter>...]"`,
//!   most-recent entry first, `*` designating the local peer.
//!
//! Within one peer both forms are totally ordered; across peers version
//! vectors give the partial order used for conflict detection.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Maximum length of a document id in bytes.
pub const MAX_DOC_ID_LENGTH: usize = 250;

/// Validate a document id: non-empty, at most 250 bytes.
pub fn validate_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() {
        return Err(Error::invalid_parameter("docID must not be empty"));
    }
    if doc_id.len() > MAX_DOC_ID_LENGTH {
        return Err(Error::invalid_parameter(format!(
            "docID longer than {MAX_DOC_ID_LENGTH} bytes"
        )));
    }
    Ok(())
}

/// Identifier of a replication peer, used in version vectors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    /// Placeholder for "this database" inside locally stored vectors.
    pub const LOCAL: PeerId = PeerId([0u8; 16]);

    pub fn is_local(&self) -> bool {
        *self == Self::LOCAL
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            f.write_str("*")
        } else {
            f.write_str(&hex::encode(self.0))
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(PeerId::LOCAL);
        }
        let raw = hex::decode(s)
            .map_err(|_| Error::invalid_parameter(format!("bad peer id: {s:?}")))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| Error::invalid_parameter("peer id must be 16 bytes"))?;
        Ok(PeerId(bytes))
    }
}

/// One `(peer, logicalTime)` entry of a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub peer: PeerId,
    pub counter: u64,
}

/// Outcome of comparing two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Same,
    Newer,
    Older,
    Conflict,
}

/// A version vector, most-recent entry (the writer) first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionVector(pub Vec<Version>);

impl VersionVector {
    pub fn current(&self) -> Option<&Version> {
        self.0.first()
    }

    fn counter_for(&self, peer: PeerId) -> u64 {
        self.0
            .iter()
            .find(|v| v.peer == peer)
            .map(|v| v.counter)
            .unwrap_or(0)
    }

    /// Partial order across peers.
    pub fn compare(&self, other: &VersionVector) -> VersionOrder {
        let mut newer = false;
        let mut older = false;
        for v in &self.0 {
            match v.counter.cmp(&other.counter_for(v.peer)) {
                Ordering::Greater => newer = true,
                Ordering::Less => older = true,
                Ordering::Equal => {}
            }
        }
        for v in &other.0 {
            if self.counter_for(v.peer) < v.counter {
                older = true;
            }
        }
        match (newer, older) {
            (false, false) => VersionOrder::Same,
            (true, false) => VersionOrder::Newer,
            (false, true) => VersionOrder::Older,
            (true, true) => VersionOrder::Conflict,
        }
    }

    /// Bump `peer`'s counter past every entry and move it to the front.
    pub fn incremented(&self, peer: PeerId) -> VersionVector {
        let next = self
            .0
            .iter()
            .map(|v| v.counter)
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        let mut entries: Vec<Version> = self.0.iter().copied().filter(|v| v.peer != peer).collect();
        entries.insert(
            0,
            Version {
                peer,
                counter: next,
            },
        );
        VersionVector(entries)
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}@{}", v.peer, v.counter)?;
        }
        Ok(())
    }
}

/// A revision identifier in either encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum RevId {
    Tree { gen: u64, digest: [u8; 20] },
    Version(VersionVector),
}

impl RevId {
    /// Generation number: the tree generation, or the writer's logical time.
    pub fn generation(&self) -> u64 {
        match self {
            RevId::Tree { gen, .. } => *gen,
            RevId::Version(vv) => vv.current().map(|v| v.counter).unwrap_or(0),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, RevId::Tree { .. })
    }

    pub fn as_version_vector(&self) -> Option<&VersionVector> {
        match self {
            RevId::Version(vv) => Some(vv),
            RevId::Tree { .. } => None,
        }
    }

    /// Derive a child tree-form id.
    ///
    /// `digest = sha1(parent ∥ deleted ∥ canonical body)`; the genesis
    /// revision hashes an empty parent.
    pub fn new_tree_child(parent: Option<&RevId>, deleted: bool, body: &[u8]) -> RevId {
        let gen = parent.map(|p| p.generation() + 1).unwrap_or(1);
        let mut hasher = Sha1::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([deleted as u8]);
        hasher.update(body);
        RevId::Tree {
            gen,
            digest: hasher.finalize().into(),
        }
    }

    /// Derive a child version-vector id written by `peer`.
    pub fn new_version_child(parent: Option<&RevId>, peer: PeerId) -> Result<RevId> {
        let base = match parent {
            None => VersionVector::default(),
            Some(RevId::Version(vv)) => vv.clone(),
            Some(RevId::Tree { .. }) => {
                return Err(Error::unsupported(
                    "cannot extend a tree-form revision with a version vector",
                ))
            }
        };
        Ok(RevId::Version(base.incremented(peer)))
    }

    /// Total order among revisions of the same document on one peer:
    /// generation first, then the textual id lexicographically.
    pub fn total_cmp(&self, other: &RevId) -> Ordering {
        self.generation()
            .cmp(&other.generation())
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevId::Tree { gen, digest } => write!(f, "{}-{}", gen, hex::encode(digest)),
            RevId::Version(vv) => vv.fmt(f),
        }
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({self})")
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains('@') {
            let mut entries = Vec::new();
            for part in s.split(',') {
                let (peer, counter) = part
                    .split_once('@')
                    .ok_or_else(|| Error::corrupt(format!("bad version vector: {s:?}")))?;
                entries.push(Version {
                    peer: peer.parse()?,
                    counter: counter
                        .parse()
                        .map_err(|_| Error::corrupt(format!("bad logical time in {s:?}")))?,
                });
            }
            if entries.is_empty() {
                return Err(Error::corrupt("empty version vector"));
            }
            return Ok(RevId::Version(VersionVector(entries)));
        }
        let (gen, digest) = s
            .split_once('-')
            .ok_or_else(|| Error::corrupt(format!("bad revision id: {s:?}")))?;
        let gen: u64 = gen
            .parse()
            .map_err(|_| Error::corrupt(format!("bad generation in {s:?}")))?;
        if gen == 0 {
            return Err(Error::corrupt("revision generation must be positive"));
        }
        let raw = hex::decode(digest).map_err(|_| Error::corrupt(format!("bad digest in {s:?}")))?;
        let digest: [u8; 20] = raw
            .try_into()
            .map_err(|_| Error::corrupt("revision digest must be 20 bytes"))?;
        Ok(RevId::Tree { gen, digest })
    }
}

impl Serialize for RevId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RevId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(gen: u64, seed: u8) -> RevId {
        RevId::Tree {
            gen,
            digest: [seed; 20],
        }
    }

    #[test]
    fn tree_text_round_trip() {
        let id = RevId::new_tree_child(None, false, b"{}");
        let text = id.to_string();
        assert!(text.starts_with("1-"));
        assert_eq!(text.len(), 2 + 40);
        let parsed: RevId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn generations_increase_by_one() {
        let r1 = RevId::new_tree_child(None, false, b"a");
        let r2 = RevId::new_tree_child(Some(&r1), false, b"b");
        let r3 = RevId::new_tree_child(Some(&r2), true, b"");
        assert_eq!(r1.generation(), 1);
        assert_eq!(r2.generation(), 2);
        assert_eq!(r3.generation(), 3);
    }

    #[test]
    fn digest_covers_parent_deleted_and_body() {
        let r1 = RevId::new_tree_child(None, false, b"a");
        assert_ne!(r1, RevId::new_tree_child(None, false, b"b"));
        assert_ne!(r1, RevId::new_tree_child(None, true, b"a"));
        assert_eq!(r1, RevId::new_tree_child(None, false, b"a"));
    }

    #[test]
    fn total_order_is_generation_then_text() {
        let a = tree(2, 0x00);
        let b = tree(2, 0xff);
        let c = tree(3, 0x00);
        assert_eq!(a.total_cmp(&b), Ordering::Less);
        assert_eq!(b.total_cmp(&c), Ordering::Less);
        assert_eq!(a.total_cmp(&a), Ordering::Equal);
    }

    #[test]
    fn version_vector_text_round_trip() {
        let peer = PeerId([0xab; 16]);
        let id = RevId::new_version_child(None, peer).unwrap();
        let id2 = RevId::new_version_child(Some(&id), PeerId::LOCAL).unwrap();
        let text = id2.to_string();
        assert!(text.starts_with("*@2"));
        let parsed: RevId = text.parse().unwrap();
        assert_eq!(parsed, id2);
    }

    #[test]
    fn version_vector_partial_order() {
        let a = PeerId([1; 16]);
        let b = PeerId([2; 16]);
        let base = VersionVector::default().incremented(a);
        let ours = base.incremented(a);
        let theirs = base.incremented(b);
        assert_eq!(base.compare(&base), VersionOrder::Same);
        assert_eq!(ours.compare(&base), VersionOrder::Newer);
        assert_eq!(base.compare(&ours), VersionOrder::Older);
        assert_eq!(ours.compare(&theirs), VersionOrder::Conflict);
    }

    #[test]
    fn doc_id_validation() {
        assert!(validate_doc_id("doc1").is_ok());
        assert!(validate_doc_id("").is_err());
        assert!(validate_doc_id(&"x".repeat(251)).is_err());
    }
}
