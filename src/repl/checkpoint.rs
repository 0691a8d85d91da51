//! Checkpointer: durable replication progress.
//!
//! Owns the `{localSeq, remoteSeq}` pair for one replication. `localSeq`
//! is the highest local sequence whose push the remote has acknowledged;
//! `remoteSeq` the highest remote sequence fully inserted locally. Both
//! advance only up to the oldest outstanding item, so an out-of-order
//! ack can never move the checkpoint past unfinished work. Saved to the
//! local `checkpoints` store periodically and on stop, and mirrored to
//! the remote via `setCheckpoint`.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{Connection, Message};
use crate::db::{Database, CHECKPOINTS_STORE};
use crate::error::Result;

use super::profiles;

/// Persisted checkpoint body: sequences as strings, like the wire form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointBody {
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub remote: String,
}

impl CheckpointBody {
    pub fn from_seqs(local: u64, remote: u64) -> CheckpointBody {
        CheckpointBody {
            local: local.to_string(),
            remote: remote.to_string(),
        }
    }

    pub fn local_seq(&self) -> u64 {
        self.local.parse().unwrap_or(0)
    }

    pub fn remote_seq(&self) -> u64 {
        self.remote.parse().unwrap_or(0)
    }
}

/// Stable fingerprint identifying one replication's checkpoint.
pub fn checkpoint_key(
    local_uuid: &[u8; 16],
    remote_url: &str,
    remote_db: &str,
    filter: &str,
    collection: &str,
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(local_uuid);
    hasher.update(remote_url.as_bytes());
    hasher.update(remote_db.as_bytes());
    hasher.update(filter.as_bytes());
    hasher.update(collection.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
pub enum CheckpointMsg {
    /// A local sequence was handed to the pusher.
    PushPending(u64),
    /// The remote acknowledged (or we skipped) a pushed sequence.
    Pushed(u64),
    /// A remote sequence was requested from the peer.
    PullPending(u64),
    /// A remote sequence was committed locally.
    Pulled(u64),
    /// Persist now.
    Save(Option<oneshot::Sender<Result<()>>>),
    Get(oneshot::Sender<(u64, u64)>),
    Stop(oneshot::Sender<Result<()>>),
}

pub struct Checkpointer {
    db: Database,
    key: String,
    connection: Option<Connection>,
    local: u64,
    remote: u64,
    pending_push: BTreeSet<u64>,
    highest_push: u64,
    pending_pull: BTreeSet<u64>,
    highest_pull: u64,
    dirty: bool,
    save_interval: Duration,
}

impl Checkpointer {
    /// Load saved state, preferring the remote's copy when both exist.
    pub async fn load(
        db: Database,
        key: String,
        connection: Option<Connection>,
    ) -> Result<CheckpointBody> {
        let local_body: Option<CheckpointBody> = db
            .get_raw(CHECKPOINTS_STORE, &key)?
            .and_then(|raw| serde_json::from_slice(&raw).ok());
        let remote_body = match &connection {
            Some(conn) => {
                let reply = conn
                    .request(Message::request(profiles::GET_CHECKPOINT).with_property("client", &key))
                    .await?;
                if reply.error().is_some() {
                    None
                } else {
                    serde_json::from_slice(&reply.body).ok()
                }
            }
            None => None,
        };
        Ok(remote_body.or(local_body).unwrap_or_default())
    }

    pub fn spawn(
        db: Database,
        key: String,
        connection: Option<Connection>,
        start: CheckpointBody,
        save_interval: Duration,
    ) -> flume::Sender<CheckpointMsg> {
        let (tx, rx) = flume::bounded(1000);
        let mut state = Checkpointer {
            db,
            key,
            connection,
            local: start.local_seq(),
            remote: start.remote_seq(),
            pending_push: BTreeSet::new(),
            highest_push: start.local_seq(),
            pending_pull: BTreeSet::new(),
            highest_pull: start.remote_seq(),
            dirty: false,
            save_interval,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.save_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    msg = rx.recv_async() => {
                        let Ok(msg) = msg else { break };
                        let stop = matches!(msg, CheckpointMsg::Stop(_));
                        state.on_msg(msg).await;
                        if stop {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if state.dirty {
                            if let Err(err) = state.save().await {
                                warn!("periodic checkpoint save failed: {err}");
                            }
                        }
                    }
                }
            }
            debug!("checkpointer stopped");
        });
        tx
    }

    async fn on_msg(&mut self, msg: CheckpointMsg) {
        match msg {
            CheckpointMsg::PushPending(seq) => {
                self.pending_push.insert(seq);
                self.highest_push = self.highest_push.max(seq);
            }
            CheckpointMsg::Pushed(seq) => {
                self.pending_push.remove(&seq);
                let floor = match self.pending_push.first() {
                    Some(&oldest) => oldest.saturating_sub(1),
                    None => self.highest_push,
                };
                if floor > self.local {
                    self.local = floor;
                    self.dirty = true;
                }
            }
            CheckpointMsg::PullPending(seq) => {
                self.pending_pull.insert(seq);
                self.highest_pull = self.highest_pull.max(seq);
            }
            CheckpointMsg::Pulled(seq) => {
                self.pending_pull.remove(&seq);
                let floor = match self.pending_pull.first() {
                    Some(&oldest) => oldest.saturating_sub(1),
                    None => self.highest_pull,
                };
                if floor > self.remote {
                    self.remote = floor;
                    self.dirty = true;
                }
            }
            CheckpointMsg::Save(reply) => {
                let result = self.save().await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(err) = result {
                    warn!("checkpoint save failed: {err}");
                }
            }
            CheckpointMsg::Get(reply) => {
                let _ = reply.send((self.local, self.remote));
            }
            CheckpointMsg::Stop(reply) => {
                let _ = reply.send(self.save().await);
            }
        }
    }

    async fn save(&mut self) -> Result<()> {
        let body = CheckpointBody::from_seqs(self.local, self.remote);
        let encoded = serde_json::to_vec(&body)?;
        self.db.put_raw(CHECKPOINTS_STORE, &self.key, &encoded)?;
        if let Some(conn) = &self.connection {
            let result = conn
                .request(
                    Message::request(profiles::SET_CHECKPOINT)
                        .with_property("client", &self.key)
                        .with_body(encoded.clone()),
                )
                .await;
            if let Err(err) = result {
                warn!("failed to save checkpoint on remote: {err}");
            }
        }
        self.dirty = false;
        debug!(local = self.local, remote = self.remote, "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConfig;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let uuid = [1u8; 16];
        let a = checkpoint_key(&uuid, "ws://host/db", "db", "", "_default");
        let b = checkpoint_key(&uuid, "ws://host/db", "db", "", "_default");
        let c = checkpoint_key(&uuid, "ws://host/db", "db", "", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 40);
    }

    #[tokio::test]
    async fn floor_advances_to_oldest_outstanding() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = crate::db::Database::open(dir.path().join("cp"), DatabaseConfig::default())?;
        let tx = Checkpointer::spawn(
            db.clone(),
            "k".into(),
            None,
            CheckpointBody::default(),
            Duration::from_secs(300),
        );
        for seq in [1u64, 2, 3] {
            tx.send_async(CheckpointMsg::PushPending(seq)).await?;
        }
        // Acks arrive out of order: 2 first.
        tx.send_async(CheckpointMsg::Pushed(2)).await?;
        let (reply, rx) = oneshot::channel();
        tx.send_async(CheckpointMsg::Get(reply)).await?;
        assert_eq!(rx.await?.0, 0);
        tx.send_async(CheckpointMsg::Pushed(1)).await?;
        let (reply, rx) = oneshot::channel();
        tx.send_async(CheckpointMsg::Get(reply)).await?;
        assert_eq!(rx.await?.0, 2);
        tx.send_async(CheckpointMsg::Pushed(3)).await?;
        let (reply, rx) = oneshot::channel();
        tx.send_async(CheckpointMsg::Get(reply)).await?;
        assert_eq!(rx.await?.0, 3);

        let (reply, rx) = oneshot::channel();
        tx.send_async(CheckpointMsg::Stop(reply)).await?;
        rx.await??;
        let saved = Checkpointer::load(db.clone(), "k".into(), None).await?;
        assert_eq!(saved.local_seq(), 3);
        Ok(())
    }
}
