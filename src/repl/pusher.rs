//! Pusher: upload revisions the peer asked for.

use tracing::{debug, warn};

use crate::bus::{Connection, Message};
use crate::db::Collection;
use crate::error::Result;

use super::checkpoint::CheckpointMsg;
use super::{profiles, ChangeEntry, ControlMsg, STATUS_WANTED};

#[derive(Debug)]
pub enum PushMsg {
    Batch {
        entries: Vec<ChangeEntry>,
        /// `proposeChanges` (active push) vs `changes` (serving a pull).
        propose: bool,
    },
    CaughtUp {
        propose: bool,
    },
}

pub struct Pusher {
    collection: Collection,
    conn: Connection,
    checkpoint_tx: flume::Sender<CheckpointMsg>,
    control_tx: flume::Sender<ControlMsg>,
}

impl Pusher {
    pub fn spawn(
        collection: Collection,
        conn: Connection,
        checkpoint_tx: flume::Sender<CheckpointMsg>,
        control_tx: flume::Sender<ControlMsg>,
        capacity: usize,
    ) -> flume::Sender<PushMsg> {
        let (tx, rx) = flume::bounded(capacity);
        let pusher = Pusher {
            collection,
            conn,
            checkpoint_tx,
            control_tx,
        };
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv_async().await {
                match msg {
                    PushMsg::Batch { entries, propose } => {
                        if let Err(err) = pusher.on_batch(entries, propose).await {
                            warn!("push batch failed: {err}");
                            let _ = pusher
                                .control_tx
                                .send_async(ControlMsg::Fatal(err))
                                .await;
                            break;
                        }
                    }
                    PushMsg::CaughtUp { propose } => {
                        if propose {
                            let _ = pusher.control_tx.send_async(ControlMsg::PushDone).await;
                        } else {
                            // Serving a pull: an empty changes message tells
                            // the peer it is caught up.
                            let _ = pusher
                                .conn
                                .request(
                                    Message::request(profiles::CHANGES).with_body(&b"[]"[..]),
                                )
                                .await;
                        }
                    }
                }
            }
            debug!("pusher stopped");
        });
        tx
    }

    async fn on_batch(&self, entries: Vec<ChangeEntry>, propose: bool) -> Result<()> {
        for ChangeEntry(seq, _, _, _) in &entries {
            let _ = self
                .checkpoint_tx
                .send_async(CheckpointMsg::PushPending(*seq))
                .await;
        }
        let profile = if propose {
            profiles::PROPOSE_CHANGES
        } else {
            profiles::CHANGES
        };
        let reply = self
            .conn
            .request_ok(
                Message::request(profile).with_body(serde_json::to_vec(&entries)?),
            )
            .await?;
        let statuses: Vec<i64> = if reply.body.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&reply.body).unwrap_or_default()
        };
        let mut wanted = 0u64;
        for (i, entry) in entries.iter().enumerate() {
            let status = statuses.get(i).copied().unwrap_or(STATUS_WANTED);
            if status == STATUS_WANTED {
                wanted += 1;
            } else {
                // Known remotely (or rejected): nothing to send.
                let _ = self
                    .checkpoint_tx
                    .send_async(CheckpointMsg::Pushed(entry.0))
                    .await;
            }
        }
        if wanted > 0 {
            let _ = self
                .control_tx
                .send_async(ControlMsg::PushRequested(wanted))
                .await;
        }
        for (i, entry) in entries.iter().enumerate() {
            let status = statuses.get(i).copied().unwrap_or(STATUS_WANTED);
            if status != STATUS_WANTED {
                continue;
            }
            self.send_rev(entry).await?;
        }
        Ok(())
    }

    /// Send one revision; per-document failures are logged and skipped.
    async fn send_rev(&self, entry: &ChangeEntry) -> Result<()> {
        let ChangeEntry(seq, doc_id, _, _) = entry;
        let outcome = self.build_and_send(entry).await;
        let _ = self
            .checkpoint_tx
            .send_async(CheckpointMsg::Pushed(*seq))
            .await;
        let _ = self
            .control_tx
            .send_async(ControlMsg::PushCompleted(1))
            .await;
        if let Err(err) = outcome {
            warn!(doc = %doc_id, "failed to push revision: {err}");
            let _ = self
                .control_tx
                .send_async(ControlMsg::DocError(doc_id.clone()))
                .await;
        }
        Ok(())
    }

    async fn build_and_send(&self, entry: &ChangeEntry) -> Result<()> {
        let ChangeEntry(seq, doc_id, _, _) = entry;
        let mut doc = self.collection.get_existing(doc_id)?;
        let Some(current) = doc.select_current() else {
            return self.send_norev(entry, 404).await;
        };
        let Some(body) = current.body.clone() else {
            // Body was pruned away; the peer must fetch from elsewhere.
            return self.send_norev(entry, 410).await;
        };
        let history = doc.history();
        let ancestors: Vec<String> = history.iter().skip(1).map(|r| r.to_string()).collect();
        let deleted = current.flags.contains(crate::revtree::RevFlags::DELETED);
        let msg = Message::request(profiles::REV)
            .with_property("id", doc_id)
            .with_property("rev", current.rev_id.to_string())
            .with_property("sequence", seq)
            .with_property("history", ancestors.join(","))
            .with_property("deleted", deleted)
            .with_body(body);
        self.conn.request_ok(msg).await?;
        Ok(())
    }

    async fn send_norev(&self, entry: &ChangeEntry, code: i64) -> Result<()> {
        let ChangeEntry(seq, doc_id, rev_id, _) = entry;
        self.conn
            .send(
                Message::request(profiles::NOREV)
                    .with_property("id", doc_id)
                    .with_property("rev", rev_id)
                    .with_property("sequence", seq)
                    .with_property("error", code),
            )
            .await
    }
}
