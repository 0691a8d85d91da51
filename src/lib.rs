//! An embeddable document database with multi-master replication.
//!
//! Documents are schemaless JSON trees with per-document revision trees
//! for conflict detection and resolution, stored in named collections
//! over a relational backing file. Binary attachments live in a
//! content-addressed blob store. Peers synchronize through a
//! checkpoint-based, resumable replication protocol running over an
//! abstract framed transport, so any bidirectional byte stream works —
//! including an in-memory duplex in tests.
//!
//! Start with [`Database::open`], get a [`Collection`], and read or write
//! [`Document`]s; attach a [`Replicator`] to sync with a peer.

pub mod address;
pub mod blob;
pub mod body;
pub mod bus;
pub mod db;
pub mod document;
pub mod error;
pub mod query;
pub mod repl;
pub mod revid;
pub mod revtree;
pub mod store;
pub mod tracker;

pub use address::{Address, Cookie, CookieJar};
pub use blob::{BlobKey, BlobStore, EncryptionKey};
pub use db::{
    Collection, Database, DatabaseConfig, DbTransaction, PutOptions, CHECKPOINTS_STORE,
    COOKIES_STORE, DEFAULT_COLLECTION, INFO_STORE,
};
pub use document::{Document, RevIdStyle, SelectedRev};
pub use error::{Domain, Error, Result};
pub use query::Query;
pub use repl::{
    ActivityLevel, ChangeEntry, CheckpointBody, Replicator, ReplicatorOptions, ReplicatorStatus,
};
pub use revid::{PeerId, RevId, Version, VersionVector};
pub use revtree::{RevFlags, RevTree};
pub use store::{
    ContentOption, DocumentFlags, EnumerateOptions, IndexInfo, IndexKind, IndexSpec, Record,
};
pub use tracker::{Change, ChangesSince, ObserverToken, SequenceTracker};
