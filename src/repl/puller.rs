//! Puller: stage incoming revisions, fetching attachments first.

use bytes::Bytes;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::blob::{BlobKey, PendingBlob};
use crate::body;
use crate::bus::{Connection, Message};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::revid::RevId;

use super::checkpoint::CheckpointMsg;
use super::inserter::RevToInsert;
use super::{profiles, ControlMsg};

pub struct Puller {
    db: Database,
    conn: Connection,
    inserter_tx: flume::Sender<RevToInsert>,
    checkpoint_tx: flume::Sender<CheckpointMsg>,
    control_tx: flume::Sender<ControlMsg>,
}

impl Puller {
    pub fn spawn(
        db: Database,
        conn: Connection,
        inserter_tx: flume::Sender<RevToInsert>,
        checkpoint_tx: flume::Sender<CheckpointMsg>,
        control_tx: flume::Sender<ControlMsg>,
        capacity: usize,
    ) -> flume::Sender<Message> {
        let (tx, rx) = flume::bounded(capacity);
        let puller = Puller {
            db,
            conn,
            inserter_tx,
            checkpoint_tx,
            control_tx,
        };
        tokio::spawn(async move {
            while let Ok(message) = rx.recv_async().await {
                if let Err(err) = puller.on_rev(message).await {
                    warn!("failed to stage revision: {err}");
                }
            }
            debug!("puller stopped");
        });
        tx
    }

    /// Validate an incoming `rev` message and hand it to the inserter.
    async fn on_rev(&self, message: Message) -> Result<()> {
        match self.stage(&message).await {
            Ok(item) => {
                self.inserter_tx
                    .send_async(item)
                    .await
                    .map_err(|_| Error::Canceled)?;
                Ok(())
            }
            Err(err) => {
                let doc_id = message.property("id").unwrap_or_default().to_string();
                warn!(doc = %doc_id, "rejecting revision: {err}");
                if !message.is_no_reply() {
                    let (domain, code) = err.domain_code();
                    self.conn
                        .respond(Message::error_response(
                            &message,
                            &domain.to_string(),
                            code,
                            &err.to_string(),
                        ))
                        .await?;
                }
                if let Some(seq) = message.property("sequence").and_then(|s| s.parse().ok()) {
                    let _ = self.checkpoint_tx.send_async(CheckpointMsg::Pulled(seq)).await;
                }
                let _ = self
                    .control_tx
                    .send_async(ControlMsg::DocError(doc_id))
                    .await;
                let _ = self.control_tx.send_async(ControlMsg::PullCompleted(1)).await;
                Ok(())
            }
        }
    }

    async fn stage(&self, message: &Message) -> Result<RevToInsert> {
        let doc_id = message
            .property("id")
            .ok_or_else(|| Error::invalid_parameter("rev message missing id"))?
            .to_string();
        crate::revid::validate_doc_id(&doc_id)?;
        let rev: RevId = message
            .property("rev")
            .ok_or_else(|| Error::invalid_parameter("rev message missing rev"))?
            .parse()?;
        let mut history = vec![rev];
        if let Some(ancestors) = message.property("history") {
            for part in ancestors.split(',').filter(|p| !p.is_empty()) {
                history.push(part.parse()?);
            }
        }
        let deleted = message.property("deleted") == Some("true");
        let remote_seq = message.property("sequence").and_then(|s| s.parse().ok());

        let (record_body, blobs, has_attachments) = if message.body.is_empty() {
            (None, Vec::new(), false)
        } else {
            let parsed = body::decode(&message.body)?;
            let refs = body::blob_refs(&parsed);
            let mut blobs = Vec::new();
            for blob_ref in &refs {
                if self.db.blobs().has(&blob_ref.key) {
                    // Already stored: the sender proves possession instead
                    // of transferring the bytes again.
                    self.verify_attachment(&blob_ref.key).await?;
                } else {
                    blobs.push(self.fetch_attachment(&blob_ref.key).await?);
                }
            }
            (
                Some(Bytes::copy_from_slice(&message.body)),
                blobs,
                !refs.is_empty(),
            )
        };
        Ok(RevToInsert {
            message: message.clone(),
            doc_id,
            history,
            body: record_body,
            deleted,
            has_attachments,
            remote_seq,
            blobs,
        })
    }

    /// Challenge the peer to prove it holds a blob we already store.
    ///
    /// A failed proof rejects the revision: its body claims an attachment
    /// the sender cannot produce.
    async fn verify_attachment(&self, key: &BlobKey) -> Result<()> {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let reply = self
            .conn
            .request_ok(
                Message::request(profiles::PROVE_ATTACHMENT)
                    .with_property("digest", key)
                    .with_property("nonce", hex::encode(nonce)),
            )
            .await?;
        let contents = self.db.blobs().get_contents(key)?;
        let mut hasher = Sha1::new();
        hasher.update(nonce);
        hasher.update(&contents);
        let expected = hex::encode(hasher.finalize());
        if reply.body.as_ref() != expected.as_bytes() {
            return Err(Error::corrupt(format!(
                "attachment {key} failed possession proof"
            )));
        }
        Ok(())
    }

    /// Pull one attachment body from the peer, verifying its digest.
    async fn fetch_attachment(&self, key: &BlobKey) -> Result<(PendingBlob, BlobKey)> {
        let reply = self
            .conn
            .request_ok(
                Message::request(profiles::GET_ATTACHMENT).with_property("digest", key),
            )
            .await?;
        if BlobKey::compute(&reply.body) != *key {
            return Err(Error::corrupt(format!(
                "attachment {key} failed digest verification"
            )));
        }
        let mut stream = self.db.blobs().open_write_stream()?;
        stream.write_all(&reply.body)?;
        Ok((stream.finish()?, *key))
    }
}
