//! Storage engine façade.
//!
//! A database file holds named *key-stores*: ordered maps from a key to a
//! `(meta, body, sequence, flags, expiration)` record. Document collections
//! and raw stores (checkpoints, cookies, info) are all key-stores.

use bytes::Bytes;

mod keystore;
mod sqlite;

pub use keystore::KeyStore;
pub use sqlite::{SqliteStorage, Transaction, DB_FILE_NAME};

/// Record-level flag bits, persisted in the `flags` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DocumentFlags(pub u8);

impl DocumentFlags {
    pub const DELETED: DocumentFlags = DocumentFlags(0x01);
    pub const CONFLICTED: DocumentFlags = DocumentFlags(0x02);
    pub const HAS_ATTACHMENTS: DocumentFlags = DocumentFlags(0x04);

    pub fn contains(&self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: DocumentFlags) {
        self.0 |= other.0;
    }

    pub fn with(mut self, other: DocumentFlags) -> DocumentFlags {
        self.set(other);
        self
    }
}

/// How much of a record to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentOption {
    /// Key, sequence, flags, expiration only.
    MetaOnly,
    /// Everything but the meta blob (the current body only).
    CurrentRevOnly,
    /// The whole record.
    #[default]
    EntireBody,
}

/// One stored record.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub key: String,
    pub meta: Bytes,
    pub body: Bytes,
    pub sequence: u64,
    pub flags: DocumentFlags,
    /// Absolute expiration timestamp in milliseconds, if scheduled.
    pub expiration: Option<i64>,
}

impl Record {
    pub fn exists(&self) -> bool {
        self.sequence != 0
    }
}

/// Options for [`KeyStore::enumerate`].
#[derive(Debug, Clone, Default)]
pub struct EnumerateOptions {
    pub descending: bool,
    /// Skip the ORDER BY entirely; rows come back in storage order.
    pub unsorted: bool,
    pub include_deleted: bool,
    pub only_conflicts: bool,
    /// Enumerate by sequence, strictly greater than this value.
    pub since: Option<u64>,
    pub content: ContentOption,
}

/// Kinds of secondary index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKind {
    /// B-tree over a scalar property expression.
    Value,
    /// Full-text over a string property.
    FullText,
    /// Approximate-nearest-neighbor over a vector property.
    Vector { dimensions: usize },
}

/// Specification used to create an index.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub kind: IndexKind,
    /// Dotted property path the index covers.
    pub expression: String,
}

/// Descriptor returned by [`KeyStore::get_indexes_info`].
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub kind: IndexKind,
    pub expression: String,
}
