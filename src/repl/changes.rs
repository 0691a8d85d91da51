//! ChangesFeed: enumerate local changes and feed the pusher.

use tracing::{debug, warn};

use crate::db::Collection;
use crate::document::Document;

use super::pusher::PushMsg;
use super::ChangeEntry;

pub struct ChangesFeed;

impl ChangesFeed {
    /// Stream batches of local changes after `since` into the pusher.
    ///
    /// `propose` selects the active-push profile (`proposeChanges`) over
    /// the passive-serve profile (`changes`). In continuous mode the feed
    /// stays subscribed to the collection's observer and keeps feeding.
    pub fn spawn(
        collection: Collection,
        since: u64,
        batch_size: usize,
        propose: bool,
        continuous: bool,
        pusher_tx: flume::Sender<PushMsg>,
    ) {
        tokio::spawn(async move {
            let mut last = since;
            let (poke_tx, poke_rx) = flume::bounded::<()>(1);
            let token = continuous.then(|| {
                collection.observe(move || {
                    let _ = poke_tx.try_send(());
                })
            });
            loop {
                match Self::feed_from(&collection, last, batch_size, propose, &pusher_tx).await {
                    Ok(new_last) => last = new_last,
                    Err(err) => {
                        warn!("changes feed failed: {err}");
                        break;
                    }
                }
                if pusher_tx
                    .send_async(PushMsg::CaughtUp { propose })
                    .await
                    .is_err()
                {
                    break;
                }
                if !continuous {
                    break;
                }
                if poke_rx.recv_async().await.is_err() {
                    break;
                }
            }
            if let Some(token) = token {
                collection.remove_observer(token);
            }
            debug!("changes feed finished");
        });
    }

    async fn feed_from(
        collection: &Collection,
        mut since: u64,
        batch_size: usize,
        propose: bool,
        pusher_tx: &flume::Sender<PushMsg>,
    ) -> crate::error::Result<u64> {
        loop {
            let records = collection.changes_since(since, batch_size)?;
            let full = records.len() == batch_size;
            let mut entries = Vec::with_capacity(records.len());
            for record in records {
                since = since.max(record.sequence);
                let sequence = record.sequence;
                let deleted = record
                    .flags
                    .contains(crate::store::DocumentFlags::DELETED);
                let doc = Document::from_record(record)?;
                let Some(current) = doc.tree().current() else {
                    continue;
                };
                entries.push(ChangeEntry(
                    sequence,
                    doc.doc_id().to_string(),
                    doc.tree().rev(current).rev_id.to_string(),
                    deleted,
                ));
            }
            if !entries.is_empty()
                && pusher_tx
                    .send_async(PushMsg::Batch { entries, propose })
                    .await
                    .is_err()
            {
                return Ok(since);
            }
            if !full {
                return Ok(since);
            }
        }
    }
}
