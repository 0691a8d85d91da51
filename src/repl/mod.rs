//! The replicator: checkpointed, resumable, bidirectional sync.
//!
//! Six workers cooperate over bounded mailboxes: the Checkpointer owns
//! durable progress, the ChangesFeed enumerates local changes, the Pusher
//! uploads revisions, the RevFinder diffs incoming change batches, the
//! Puller stages incoming revisions (fetching attachments), and the
//! Inserter commits them in batches. The same worker set serves both the
//! active and passive sides; a passive replicator simply waits for the
//! peer's requests.

mod changes;
mod checkpoint;
mod inserter;
mod puller;
mod pusher;
mod revfinder;

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::blob::BlobKey;
use crate::bus::{Connection, ConnectionOptions, Message, SUBPROTOCOL};
use crate::db::{Collection, Database, CHECKPOINTS_STORE};
use crate::error::{Error, Result};

pub use checkpoint::{checkpoint_key, CheckpointBody};
use checkpoint::{CheckpointMsg, Checkpointer};
use inserter::Inserter;
use puller::Puller;
use pusher::{PushMsg, Pusher};
use revfinder::RevFinder;

/// Message profiles of the replication protocol.
pub mod profiles {
    pub const HANDSHAKE: &str = "handshake";
    pub const GET_CHECKPOINT: &str = "getCheckpoint";
    pub const SET_CHECKPOINT: &str = "setCheckpoint";
    pub const SUB_CHANGES: &str = "subChanges";
    pub const CHANGES: &str = "changes";
    pub const PROPOSE_CHANGES: &str = "proposeChanges";
    pub const REV: &str = "rev";
    pub const NOREV: &str = "norev";
    pub const GET_ATTACHMENT: &str = "getAttachment";
    pub const PROVE_ATTACHMENT: &str = "proveAttachment";
}

/// One entry of a `changes`/`proposeChanges` body:
/// `[sequence, docID, revID, deleted]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry(pub u64, pub String, pub String, pub bool);

/// Reply status for a change the receiver already has.
pub const STATUS_KNOWN: i64 = 304;
/// Reply status asking the sender to transmit the revision.
pub const STATUS_WANTED: i64 = 0;

/// Replicator activity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum ActivityLevel {
    #[default]
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
    Stopping,
}

/// Externally visible replicator state.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorStatus {
    pub level: ActivityLevel,
    /// Revisions transferred so far.
    pub completed: u64,
    /// Revisions known to need transfer.
    pub total: u64,
    /// Documents skipped due to per-document errors.
    pub doc_errors: u64,
    pub error: Option<String>,
}

/// Configuration of one replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    /// Upload local changes.
    pub push: bool,
    /// Subscribe to and download remote changes.
    pub pull: bool,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Identifier of the remote endpoint, fingerprinted into the
    /// checkpoint key.
    pub remote_url: String,
    pub remote_db: String,
    /// Opaque filter spec, fingerprinted into the checkpoint key.
    pub filter: String,
    /// Changes per batch.
    pub batch_size: usize,
    /// Worker mailbox capacity.
    pub mailbox_capacity: usize,
    /// How often the checkpointer autosaves.
    pub checkpoint_interval: Duration,
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        ReplicatorOptions {
            push: false,
            pull: false,
            continuous: false,
            remote_url: String::new(),
            remote_db: String::new(),
            filter: String::new(),
            batch_size: 200,
            mailbox_capacity: 1000,
            checkpoint_interval: Duration::from_secs(300),
        }
    }
}

impl ReplicatorOptions {
    pub fn push() -> Self {
        ReplicatorOptions {
            push: true,
            ..Default::default()
        }
    }

    pub fn pull() -> Self {
        ReplicatorOptions {
            pull: true,
            ..Default::default()
        }
    }

    pub fn push_pull() -> Self {
        ReplicatorOptions {
            push: true,
            pull: true,
            ..Default::default()
        }
    }

    /// Passive side: serve the peer, initiate nothing.
    pub fn passive() -> Self {
        ReplicatorOptions::default()
    }

    fn is_active(&self) -> bool {
        self.push || self.pull
    }
}

/// Internal events feeding the replicator's state machine.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    PushDone,
    PullCaughtUp,
    /// N revisions were requested from the peer.
    PullRequested(u64),
    /// N revisions were committed (or skipped) locally.
    PullCompleted(u64),
    /// N revisions were pushed (or skipped).
    PushCompleted(u64),
    /// N revisions are known to need pushing.
    PushRequested(u64),
    DocError(String),
    PeerClosed,
    StopRequested,
    Fatal(Error),
}

/// A replicator bound to one database collection.
pub struct Replicator {
    db: Database,
    collection: Collection,
    options: ReplicatorOptions,
    status_tx: watch::Sender<ReplicatorStatus>,
    status_rx: watch::Receiver<ReplicatorStatus>,
    control: Mutex<Option<flume::Sender<ControlMsg>>>,
}

impl Replicator {
    pub fn new(db: Database, collection: Collection, options: ReplicatorOptions) -> Replicator {
        let (status_tx, status_rx) = watch::channel(ReplicatorStatus::default());
        Replicator {
            db,
            collection,
            options,
            status_tx,
            status_rx,
            control: Mutex::new(None),
        }
    }

    /// Observe status transitions.
    pub fn status(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status_rx.clone()
    }

    /// Request a cooperative stop of the running session.
    pub async fn stop(&self) {
        let control = self.control.lock().clone();
        if let Some(control) = control {
            let _ = control.send_async(ControlMsg::StopRequested).await;
        }
    }

    fn set_status(&self, f: impl FnOnce(&mut ReplicatorStatus)) {
        self.status_tx.send_modify(f);
    }

    /// Run one replication session over an open transport.
    ///
    /// Returns when the session completes (one-shot), the peer closes, or
    /// a fatal error occurs.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<ReplicatorStatus>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.set_status(|s| {
            s.level = ActivityLevel::Connecting;
            s.error = None;
        });
        let (conn, incoming, driver) = Connection::spawn(
            reader,
            writer,
            ConnectionOptions {
                incoming_capacity: self.options.mailbox_capacity,
                ..Default::default()
            },
        );
        if self.options.is_active() {
            conn.handshake().await?;
        }

        let (control_tx, control_rx) = flume::bounded(self.options.mailbox_capacity);
        *self.control.lock() = Some(control_tx.clone());

        let key = checkpoint_key(
            &self.db.uuids().0,
            &self.options.remote_url,
            &self.options.remote_db,
            &self.options.filter,
            self.collection.name(),
        );
        let remote_checkpoint_conn = self.options.is_active().then(|| conn.clone());
        let start = Checkpointer::load(self.db.clone(), key.clone(), remote_checkpoint_conn.clone())
            .await?;
        let checkpoint_tx = Checkpointer::spawn(
            self.db.clone(),
            key,
            remote_checkpoint_conn,
            start.clone(),
            self.options.checkpoint_interval,
        );

        // Pull pipeline: RevFinder -> Puller -> Inserter.
        let inserter_tx = Inserter::spawn(
            self.db.clone(),
            self.collection.clone(),
            conn.clone(),
            checkpoint_tx.clone(),
            control_tx.clone(),
            self.options.mailbox_capacity,
            100,
        );
        let puller_tx = Puller::spawn(
            self.db.clone(),
            conn.clone(),
            inserter_tx.clone(),
            checkpoint_tx.clone(),
            control_tx.clone(),
            self.options.mailbox_capacity,
        );
        let revfinder_tx = RevFinder::spawn(
            self.collection.clone(),
            conn.clone(),
            checkpoint_tx.clone(),
            control_tx.clone(),
            self.options.mailbox_capacity,
        );

        // Push pipeline: ChangesFeed -> Pusher.
        let pusher_tx = Pusher::spawn(
            self.collection.clone(),
            conn.clone(),
            checkpoint_tx.clone(),
            control_tx.clone(),
            self.options.mailbox_capacity,
        );

        if self.options.push {
            changes::ChangesFeed::spawn(
                self.collection.clone(),
                start.local_seq(),
                self.options.batch_size,
                true,
                self.options.continuous,
                pusher_tx.clone(),
            );
        }
        if self.options.pull {
            conn.request_ok(
                Message::request(profiles::SUB_CHANGES)
                    .with_property("since", start.remote_seq())
                    .with_property("batch", self.options.batch_size)
                    .with_property("continuous", self.options.continuous),
            )
            .await?;
        }

        // Dispatcher: route the peer's requests to workers.
        let dispatcher = {
            let conn = conn.clone();
            let db = self.db.clone();
            let collection = self.collection.clone();
            let control_tx = control_tx.clone();
            let checkpoint_tx = checkpoint_tx.clone();
            let batch_size = self.options.batch_size;
            tokio::spawn(async move {
                while let Ok(message) = incoming.recv_async().await {
                    let result = dispatch(
                        &db,
                        &collection,
                        &conn,
                        &message,
                        &revfinder_tx,
                        &puller_tx,
                        &pusher_tx,
                        &checkpoint_tx,
                        &control_tx,
                        batch_size,
                    )
                    .await;
                    if let Err(err) = result {
                        warn!(profile = ?message.profile(), "request handling failed: {err}");
                        if !message.is_no_reply() {
                            let (domain, code) = err.domain_code();
                            let _ = conn
                                .respond(Message::error_response(
                                    &message,
                                    &domain.to_string(),
                                    code,
                                    &err.to_string(),
                                ))
                                .await;
                        }
                    }
                }
                let _ = control_tx.send_async(ControlMsg::PeerClosed).await;
            })
        };

        // State machine main loop.
        let mut push_done = !self.options.push;
        let mut pull_caught_up = !self.options.pull;
        let mut pull_requested = 0u64;
        let mut pull_completed = 0u64;
        let mut push_requested = 0u64;
        let mut push_completed = 0u64;
        let mut stopping = false;
        let mut session_error: Option<Error> = None;
        self.set_status(|s| s.level = ActivityLevel::Busy);

        loop {
            if self.options.is_active()
                && !self.options.continuous
                && push_done
                && pull_caught_up
                && pull_completed >= pull_requested
                && push_completed >= push_requested
            {
                break;
            }
            let Ok(msg) = control_rx.recv_async().await else {
                break;
            };
            match msg {
                ControlMsg::PushDone => push_done = true,
                ControlMsg::PullCaughtUp => pull_caught_up = true,
                ControlMsg::PullRequested(n) => {
                    pull_requested += n;
                    self.set_status(|s| {
                        s.total += n;
                        s.level = ActivityLevel::Busy;
                    });
                }
                ControlMsg::PullCompleted(n) => {
                    pull_completed += n;
                    self.set_status(|s| s.completed += n);
                }
                ControlMsg::PushRequested(n) => {
                    push_requested += n;
                    self.set_status(|s| {
                        s.total += n;
                        s.level = ActivityLevel::Busy;
                    });
                }
                ControlMsg::PushCompleted(n) => {
                    push_completed += n;
                    self.set_status(|s| s.completed += n);
                }
                ControlMsg::DocError(doc) => {
                    debug!(doc = %doc, "document skipped");
                    self.set_status(|s| s.doc_errors += 1);
                }
                ControlMsg::PeerClosed => {
                    if self.options.is_active() && !stopping {
                        session_error = Some(Error::NetworkReset);
                    }
                    break;
                }
                ControlMsg::StopRequested => {
                    if stopping {
                        // Second stop: abort instead of draining further.
                        break;
                    }
                    stopping = true;
                    self.set_status(|s| s.level = ActivityLevel::Stopping);
                    if !self.options.is_active() {
                        break;
                    }
                    // Cooperative: workers drain; completion check above
                    // ends the loop once in-flight work lands.
                    push_done = true;
                    pull_caught_up = true;
                }
                ControlMsg::Fatal(err) => {
                    session_error = Some(err);
                    break;
                }
            }
            let idle = pull_completed >= pull_requested && push_completed >= push_requested;
            if idle && !stopping {
                self.set_status(|s| {
                    if s.level == ActivityLevel::Busy {
                        s.level = ActivityLevel::Idle;
                    }
                });
            }
        }

        // Persist progress, then tear down.
        let (save_tx, save_rx) = oneshot::channel();
        if checkpoint_tx
            .send_async(CheckpointMsg::Stop(save_tx))
            .await
            .is_ok()
        {
            if let Ok(Err(err)) = save_rx.await {
                warn!("final checkpoint save failed: {err}");
            }
        }
        conn.close().await;
        dispatcher.abort();
        let _ = driver.await;
        *self.control.lock() = None;

        let status = match session_error {
            Some(err) => {
                self.set_status(|s| {
                    s.level = ActivityLevel::Stopped;
                    s.error = Some(err.to_string());
                });
                return Err(err);
            }
            None => {
                self.set_status(|s| s.level = ActivityLevel::Stopped);
                self.status_rx.borrow().clone()
            }
        };
        info!(
            completed = status.completed,
            total = status.total,
            "replication session finished"
        );
        Ok(status)
    }

    /// Run with reconnection: transient failures back off exponentially
    /// (2 s doubling to a 10 min cap); permanent errors return.
    pub async fn run_retrying<R, W, F, Fut>(&self, mut connect: F) -> Result<ReplicatorStatus>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(R, W)>>,
    {
        let mut backoff = Duration::from_secs(2);
        let cap = Duration::from_secs(600);
        loop {
            let attempt = async {
                let (reader, writer) = connect().await?;
                self.run(reader, writer).await
            };
            match attempt.await {
                Ok(status) => return Ok(status),
                Err(err) if err.is_transient() => {
                    warn!("replication attempt failed ({err}); retrying in {backoff:?}");
                    self.set_status(|s| {
                        s.level = ActivityLevel::Offline;
                        s.error = Some(err.to_string());
                    });
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(cap);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Route one inbound request to its handler.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    db: &Database,
    collection: &Collection,
    conn: &Connection,
    message: &Message,
    revfinder_tx: &flume::Sender<Message>,
    puller_tx: &flume::Sender<Message>,
    pusher_tx: &flume::Sender<PushMsg>,
    checkpoint_tx: &flume::Sender<CheckpointMsg>,
    control_tx: &flume::Sender<ControlMsg>,
    batch_size: usize,
) -> Result<()> {
    match message.profile() {
        Some(profiles::HANDSHAKE) => {
            let reply = match message.property("subprotocol") {
                Some(sub) if sub == SUBPROTOCOL => {
                    Message::response_to(message).with_property("subprotocol", SUBPROTOCOL)
                }
                other => Message::error_response(
                    message,
                    "WebSocket",
                    1002,
                    &format!("unsupported subprotocol: {other:?}"),
                ),
            };
            conn.respond(reply).await
        }
        Some(profiles::GET_CHECKPOINT) => {
            let client = message.property("client").unwrap_or_default().to_string();
            match db.get_raw(CHECKPOINTS_STORE, &format!("peer-{client}"))? {
                Some(body) => {
                    conn.respond(Message::response_to(message).with_body(body)).await
                }
                None => {
                    conn.respond(Message::error_response(
                        message,
                        "Db",
                        404,
                        "no checkpoint",
                    ))
                    .await
                }
            }
        }
        Some(profiles::SET_CHECKPOINT) => {
            let client = message.property("client").unwrap_or_default().to_string();
            db.put_raw(CHECKPOINTS_STORE, &format!("peer-{client}"), &message.body)?;
            conn.respond(Message::response_to(message)).await
        }
        Some(profiles::SUB_CHANGES) => {
            let since: u64 = message
                .property("since")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let continuous = message.property("continuous") == Some("true");
            conn.respond(Message::response_to(message)).await?;
            changes::ChangesFeed::spawn(
                collection.clone(),
                since,
                batch_size,
                false,
                continuous,
                pusher_tx.clone(),
            );
            Ok(())
        }
        Some(profiles::CHANGES) | Some(profiles::PROPOSE_CHANGES) => revfinder_tx
            .send_async(message.clone())
            .await
            .map_err(|_| Error::Canceled),
        Some(profiles::REV) => puller_tx
            .send_async(message.clone())
            .await
            .map_err(|_| Error::Canceled),
        Some(profiles::NOREV) => {
            if let Some(seq) = message.property("sequence").and_then(|s| s.parse().ok()) {
                let _ = checkpoint_tx.send_async(CheckpointMsg::Pulled(seq)).await;
            }
            let _ = control_tx
                .send_async(ControlMsg::DocError(
                    message.property("id").unwrap_or_default().to_string(),
                ))
                .await;
            let _ = control_tx.send_async(ControlMsg::PullCompleted(1)).await;
            Ok(())
        }
        Some(profiles::GET_ATTACHMENT) => {
            let digest: BlobKey = message
                .property("digest")
                .unwrap_or_default()
                .parse()?;
            let contents = db.blobs().get_contents(&digest)?;
            conn.respond(Message::response_to(message).with_body(contents)).await
        }
        Some(profiles::PROVE_ATTACHMENT) => {
            let digest: BlobKey = message
                .property("digest")
                .unwrap_or_default()
                .parse()?;
            let nonce = hex::decode(message.property("nonce").unwrap_or_default())
                .map_err(|_| Error::invalid_parameter("bad nonce"))?;
            let contents = db.blobs().get_contents(&digest)?;
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(&nonce);
            hasher.update(&contents);
            let proof = hex::encode(hasher.finalize());
            conn.respond(Message::response_to(message).with_body(proof.into_bytes()))
                .await
        }
        other => {
            warn!(profile = ?other, "unhandled request profile");
            if !message.is_no_reply() {
                conn.respond(Message::error_response(message, "Db", 501, "unhandled"))
                    .await?;
            }
            Ok(())
        }
    }
}
