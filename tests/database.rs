//! End-to-end scenarios against a single database.

use quill::{
    body, BlobKey, Database, DatabaseConfig, DocumentFlags, Error, IndexKind, IndexSpec,
    PutOptions,
};
use serde_json::json;

fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(
        dir.path().join("db"),
        DatabaseConfig {
            expiration_sweeper: false,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn put_get_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;

    let (rev_id, sequence) = coll.put("doc1", &json!({"x": 1}), PutOptions::default())?;
    assert!(rev_id.to_string().starts_with("1-"));
    assert_eq!(sequence, 1);

    let mut doc = coll.get_existing("doc1")?;
    let selected = doc.select_current().unwrap();
    assert_eq!(selected.rev_id, rev_id);
    assert_eq!(doc.sequence(), 1);
    assert_eq!(doc.body()?, json!({"x": 1}));
    Ok(())
}

#[test]
fn conflict_creation_and_leaf_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;

    let (r1, _) = coll.put("doc1", &json!({"v": 0}), PutOptions::default())?;
    let (r2a, _) = coll.put(
        "doc1",
        &json!({"v": "a"}),
        PutOptions {
            parent: Some(r1.clone()),
            ..Default::default()
        },
    )?;
    let (r2b, _) = coll.put(
        "doc1",
        &json!({"v": "b"}),
        PutOptions {
            parent: Some(r1.clone()),
            allow_conflict: true,
            ..Default::default()
        },
    )?;

    let mut doc = coll.get_existing("doc1")?;
    assert!(doc.is_conflicted());
    assert!(doc.flags().contains(DocumentFlags::CONFLICTED));

    // Leaves visit in (generation, revID) order.
    let mut expected = vec![r2a.clone(), r2b.clone()];
    expected.sort_by(|a, b| a.total_cmp(b));
    doc.select_rev(&r1)?;
    let first = doc.select_next_leaf().unwrap();
    let second = doc.select_next_leaf().unwrap();
    assert_eq!(vec![first.rev_id, second.rev_id], expected);

    // Resolve with a merged body: one live leaf remains.
    let merged = doc
        .resolve_conflict(
            &r2a,
            &r2b,
            Some(&json!({"v": "merged"})),
            db.rev_id_style(),
            db.peer_id(),
        )?
        .unwrap();
    let mut txn = db.begin_transaction()?;
    coll.save(&mut txn, &mut doc)?;
    txn.commit()?;

    let mut doc = coll.get_existing("doc1")?;
    assert!(!doc.is_conflicted());
    assert_eq!(doc.select_current().unwrap().rev_id, merged);
    assert_eq!(doc.body()?, json!({"v": "merged"}));
    Ok(())
}

#[test]
fn blob_round_trip_with_abort() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let data: Vec<u8> = (0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    // Streaming write, then abort: the blob must not exist.
    let mut txn = db.begin_transaction()?;
    let mut stream = db.blobs().open_write_stream()?;
    for chunk in data.chunks(64 * 1024) {
        stream.write_all(chunk)?;
    }
    let pending = stream.finish()?;
    let key = pending.key;
    txn.install_blob_on_commit(pending, Some(key));
    txn.abort()?;
    assert!(matches!(db.blobs().get_contents(&key), Err(Error::NotFound)));

    // Write again and commit.
    let mut txn = db.begin_transaction()?;
    let mut stream = db.blobs().open_write_stream()?;
    for chunk in data.chunks(64 * 1024) {
        stream.write_all(chunk)?;
    }
    let pending = stream.finish()?;
    txn.install_blob_on_commit(pending, Some(key));
    txn.commit()?;

    let contents = db.blobs().get_contents(&key)?;
    assert_eq!(contents.len(), 10 * 1024 * 1024);
    assert_eq!(BlobKey::compute(&contents), key);
    assert_eq!(db.blobs().get_size(&key)?, 10 * 1024 * 1024);
    Ok(())
}

#[test]
fn vector_query_finds_nearest_neighbors() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;
    coll.create_index(&IndexSpec {
        name: "vectors".into(),
        kind: IndexKind::Vector { dimensions: 128 },
        expression: "v".into(),
    })?;

    for i in 0..1000u32 {
        let mut v = vec![0.0f64; 128];
        v[0] = i as f64;
        v[1] = (i % 7) as f64;
        coll.put(&format!("doc-{i:04}"), &json!({"v": v}), PutOptions::default())?;
    }

    // The target equals doc-0500's vector exactly.
    let mut target = vec![0.0f64; 128];
    target[0] = 500.0;
    target[1] = (500 % 7) as f64;

    let query = coll.query(json!({
        "WHAT": [["._id"], ["AS", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$target"]], "dist"]],
        "WHERE": ["<", ["APPROX_VECTOR_DISTANCE()", [".v"], ["$target"]], 1e30],
        "ORDER_BY": [[".dist"]],
        "LIMIT": 5
    }))?;
    let rows = query.run(&json!({"target": target}))?;
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0][0], json!("doc-0500"));
    assert_eq!(rows[0][1].as_f64(), Some(0.0));
    let dists: Vec<f64> = rows.iter().map(|r| r[1].as_f64().unwrap()).collect();
    assert!(dists.windows(2).all(|w| w[0] <= w[1]), "distances ascend: {dists:?}");
    Ok(())
}

#[test]
fn pruning_keeps_tail_of_long_history() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;

    let mut last_rev = None;
    for i in 0..50 {
        let (rev, _) = coll.put("doc1", &json!({"i": i}), PutOptions::default())?;
        last_rev = Some(rev);
    }

    let mut doc = coll.get_existing("doc1")?;
    assert!(doc.tree().len() <= 20);
    let current = doc.select_current().unwrap();
    assert_eq!(Some(current.rev_id.clone()), last_rev);
    assert_eq!(current.rev_id.generation(), 50);
    assert!(current.body.is_some());
    assert!(doc.history().len() <= 20);
    Ok(())
}

#[test]
fn expiration_sweeps_documents() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;

    coll.put("stays", &json!({}), PutOptions::default())?;
    coll.put("goes", &json!({}), PutOptions::default())?;
    coll.set_expiration("goes", Some(quill::db::now_ms() - 10))?;
    assert!(coll.get_expiration("goes")?.is_some());
    assert_eq!(coll.get_expiration("stays")?, None);

    assert_eq!(coll.purge_expired(quill::db::now_ms())?, 1);
    assert!(matches!(coll.get_existing("goes"), Err(Error::NotFound)));
    assert!(coll.get_existing("stays").is_ok());
    assert_eq!(coll.purge_count()?, 1);
    Ok(())
}

#[test]
fn document_count_and_tombstones() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;

    coll.put("a", &json!({}), PutOptions::default())?;
    coll.put("b", &json!({}), PutOptions::default())?;
    assert_eq!(coll.document_count()?, 2);

    coll.delete("a")?;
    assert_eq!(coll.document_count()?, 1);
    // The tombstone still exists as a record.
    let doc = coll.get_existing("a")?;
    assert!(doc.flags().contains(DocumentFlags::DELETED));
    Ok(())
}

#[test]
fn attachment_flag_follows_body_refs() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_db(&dir);
    let coll = db.default_collection()?;

    let mut txn = db.begin_transaction()?;
    let key = txn.put_blob(b"report body")?;
    txn.commit()?;

    coll.put(
        "with",
        &json!({"file": body::blob_ref_value(&key, 11, Some("text/plain"))}),
        PutOptions::default(),
    )?;
    coll.put("without", &json!({"x": 1}), PutOptions::default())?;

    let doc = coll.get_existing("with")?;
    assert!(doc.flags().contains(DocumentFlags::HAS_ATTACHMENTS));
    let refs = body::blob_refs(&doc.body()?);
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].key, key);
    assert_eq!(db.blobs().get_size(&key)?, 11);

    let doc = coll.get_existing("without")?;
    assert!(!doc.flags().contains(DocumentFlags::HAS_ATTACHMENTS));
    Ok(())
}
