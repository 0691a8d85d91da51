//! RevFinder: diff incoming change batches against local revision trees.

use tracing::{debug, warn};

use crate::bus::{Connection, Message};
use crate::db::Collection;
use crate::error::Result;
use crate::revid::RevId;

use super::checkpoint::CheckpointMsg;
use super::{ChangeEntry, ControlMsg, STATUS_KNOWN, STATUS_WANTED};

pub struct RevFinder {
    collection: Collection,
    conn: Connection,
    checkpoint_tx: flume::Sender<CheckpointMsg>,
    control_tx: flume::Sender<ControlMsg>,
}

impl RevFinder {
    pub fn spawn(
        collection: Collection,
        conn: Connection,
        checkpoint_tx: flume::Sender<CheckpointMsg>,
        control_tx: flume::Sender<ControlMsg>,
        capacity: usize,
    ) -> flume::Sender<Message> {
        let (tx, rx) = flume::bounded(capacity);
        let finder = RevFinder {
            collection,
            conn,
            checkpoint_tx,
            control_tx,
        };
        tokio::spawn(async move {
            while let Ok(message) = rx.recv_async().await {
                if let Err(err) = finder.on_changes(message).await {
                    warn!("failed to handle changes message: {err}");
                }
            }
            debug!("rev finder stopped");
        });
        tx
    }

    /// Answer a `changes`/`proposeChanges` batch with per-entry statuses
    /// and register the revisions we asked for.
    async fn on_changes(&self, message: Message) -> Result<()> {
        let entries: Vec<ChangeEntry> = if message.body.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&message.body)?
        };
        if entries.is_empty() {
            // Caught-up marker.
            let _ = self.control_tx.send_async(ControlMsg::PullCaughtUp).await;
            if !message.is_no_reply() {
                self.conn
                    .respond(Message::response_to(&message).with_body(&b"[]"[..]))
                    .await?;
            }
            return Ok(());
        }
        let mut statuses = Vec::with_capacity(entries.len());
        let mut wanted = 0u64;
        for ChangeEntry(seq, doc_id, rev_id, _deleted) in &entries {
            let known = match rev_id.parse::<RevId>() {
                Ok(rev) => self
                    .collection
                    .get(doc_id)
                    .map(|doc| doc.tree().find(&rev).is_some())
                    .unwrap_or(false),
                Err(_) => false,
            };
            if known {
                statuses.push(STATUS_KNOWN);
            } else {
                statuses.push(STATUS_WANTED);
                wanted += 1;
                let _ = self
                    .checkpoint_tx
                    .send_async(CheckpointMsg::PullPending(*seq))
                    .await;
            }
        }
        if wanted > 0 {
            let _ = self
                .control_tx
                .send_async(ControlMsg::PullRequested(wanted))
                .await;
        }
        debug!(
            entries = entries.len(),
            wanted, "answered changes batch"
        );
        // Entries we declined still advance the remote sequence floor.
        for (ChangeEntry(seq, _, _, _), status) in entries.iter().zip(&statuses) {
            if *status == STATUS_KNOWN {
                let _ = self
                    .checkpoint_tx
                    .send_async(CheckpointMsg::PullPending(*seq))
                    .await;
                let _ = self
                    .checkpoint_tx
                    .send_async(CheckpointMsg::Pulled(*seq))
                    .await;
            }
        }
        if !message.is_no_reply() {
            self.conn
                .respond(
                    Message::response_to(&message).with_body(serde_json::to_vec(&statuses)?),
                )
                .await?;
        }
        Ok(())
    }
}
