//! Inserter: commit incoming revisions in batched transactions.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::blob::{BlobKey, PendingBlob};
use crate::bus::{Connection, Message};
use crate::db::{Collection, Database};
use crate::error::Result;
use crate::revid::RevId;

use super::checkpoint::CheckpointMsg;
use super::ControlMsg;

/// One staged revision, ready to insert.
#[derive(Debug)]
pub struct RevToInsert {
    /// The original `rev` request, answered after commit.
    pub message: Message,
    pub doc_id: String,
    /// Newest first; `history[0]` is the revision itself.
    pub history: Vec<RevId>,
    pub body: Option<Bytes>,
    pub deleted: bool,
    pub has_attachments: bool,
    pub remote_seq: Option<u64>,
    /// Attachments staged for install on commit.
    pub blobs: Vec<(PendingBlob, BlobKey)>,
}

pub struct Inserter {
    db: Database,
    collection: Collection,
    conn: Connection,
    checkpoint_tx: flume::Sender<CheckpointMsg>,
    control_tx: flume::Sender<ControlMsg>,
    max_batch: usize,
}

impl Inserter {
    pub fn spawn(
        db: Database,
        collection: Collection,
        conn: Connection,
        checkpoint_tx: flume::Sender<CheckpointMsg>,
        control_tx: flume::Sender<ControlMsg>,
        capacity: usize,
        max_batch: usize,
    ) -> flume::Sender<RevToInsert> {
        let (tx, rx) = flume::bounded(capacity);
        let inserter = Inserter {
            db,
            collection,
            conn,
            checkpoint_tx,
            control_tx,
            max_batch,
        };
        tokio::spawn(async move {
            while let Ok(first) = rx.recv_async().await {
                let mut batch = vec![first];
                while batch.len() < inserter.max_batch {
                    match rx.try_recv() {
                        Ok(item) => batch.push(item),
                        Err(_) => break,
                    }
                }
                if let Err(err) = inserter.insert_batch(batch).await {
                    warn!("insert batch failed: {err}");
                    let _ = inserter
                        .control_tx
                        .send_async(ControlMsg::Fatal(err))
                        .await;
                    break;
                }
            }
            debug!("inserter stopped");
        });
        tx
    }

    /// Insert a batch inside one transaction; remote order is preserved
    /// per document by mailbox order.
    async fn insert_batch(&self, batch: Vec<RevToInsert>) -> Result<()> {
        debug!(revs = batch.len(), "inserting batch");
        let mut done: Vec<(Message, Option<u64>, Option<String>)> = Vec::new();
        {
            let mut txn = self.db.begin_transaction()?;
            for item in batch {
                for (pending, key) in item.blobs {
                    txn.install_blob_on_commit(pending, Some(key));
                }
                let result = (|| -> Result<()> {
                    let mut doc = self.collection.get(&item.doc_id)?;
                    let added = doc.put_existing_revision(
                        &item.history,
                        item.body.clone(),
                        item.deleted,
                        item.has_attachments,
                    )?;
                    if added > 0 {
                        self.collection.save(&mut txn, &mut doc)?;
                    }
                    Ok(())
                })();
                match result {
                    Ok(()) => done.push((item.message, item.remote_seq, None)),
                    Err(err) => {
                        warn!(doc = %item.doc_id, "failed to insert revision: {err}");
                        done.push((item.message, item.remote_seq, Some(item.doc_id.clone())));
                    }
                }
            }
            txn.commit()?;
        }
        for (message, remote_seq, failed_doc) in done {
            if !message.is_no_reply() {
                let reply = match &failed_doc {
                    None => Message::response_to(&message),
                    Some(_) => Message::error_response(&message, "Db", 422, "insert failed"),
                };
                let _ = self.conn.respond(reply).await;
            }
            if let Some(seq) = remote_seq {
                let _ = self
                    .checkpoint_tx
                    .send_async(CheckpointMsg::Pulled(seq))
                    .await;
            }
            if let Some(doc_id) = failed_doc {
                let _ = self
                    .control_tx
                    .send_async(ControlMsg::DocError(doc_id))
                    .await;
            }
            let _ = self
                .control_tx
                .send_async(ControlMsg::PullCompleted(1))
                .await;
        }
        Ok(())
    }
}
