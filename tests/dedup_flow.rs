//! End-to-end dedup behaviour over an on-disk ledger and an in-memory blob store

use std::sync::Arc;

use elohim_dedup::db::{blobs, links, users};
use elohim_dedup::{
    compute_hash, Config, DedupError, FsBlobStore, IngestDisposition, IngestRequest, LedgerDb,
    LedgerOptions, MemoryBlobStore, Services,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

struct Harness {
    services: Services,
    store: Arc<MemoryBlobStore>,
    _temp: TempDir,
}

fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let config = Config::with_storage_dir(temp.path());
    let db = LedgerDb::open(&config.database_path(), LedgerOptions::from(&config)).unwrap();
    let store = Arc::new(MemoryBlobStore::new());
    let services = Services::new(db, store.clone(), &config);
    Harness {
        services,
        store,
        _temp: temp,
    }
}

fn upload(user_id: &str, data: &[u8]) -> IngestRequest {
    IngestRequest {
        user_id: user_id.to_string(),
        hash: compute_hash(data),
        size: data.len() as u64,
        mime_type: "text/plain".into(),
    }
}

#[tokio::test]
async fn test_two_users_one_blob_scenario() {
    let h = harness();
    let s = &h.services;
    let alice = s.quota.register_user("alice", None).await.unwrap();
    let bob = s.quota.register_user("bob", None).await.unwrap();
    let data = b"hello world";
    assert_eq!(data.len(), 11);

    // A ingests X
    let first = s.ingest.ingest(upload(&alice.id, data), &data[..]).await.unwrap();
    assert_eq!(first.disposition, IngestDisposition::StoredNew);
    let blob = s
        .db
        .with_conn(|conn| blobs::get_blob(conn, &first.content_id))
        .unwrap()
        .unwrap();
    assert_eq!(blob.size, 11);
    assert_eq!(blob.ref_count, 1);
    assert_eq!(s.quota.usage(&alice.id).await.unwrap().used_storage, 11);

    // A re-ingests X
    let again = s.ingest.ingest(upload(&alice.id, data), &data[..]).await.unwrap();
    assert_eq!(again.disposition, IngestDisposition::AlreadyLinked);
    assert_eq!(again.content_id, first.content_id);
    assert_eq!(s.db.stats().unwrap().link_count, 1);
    assert_eq!(s.quota.usage(&alice.id).await.unwrap().used_storage, 11);

    // B ingests X
    let shared = s.ingest.ingest(upload(&bob.id, data), &data[..]).await.unwrap();
    assert_eq!(shared.disposition, IngestDisposition::LinkedExisting);
    assert_eq!(shared.content_id, first.content_id);
    assert_eq!(shared.ref_count, 2);
    let bob_link = s
        .db
        .with_conn(|conn| links::find_link(conn, &bob.id, &first.content_id))
        .unwrap()
        .unwrap();
    assert!(!bob_link.is_owner);
    assert_eq!(s.quota.usage(&bob.id).await.unwrap().used_storage, 11);

    let stats = s.db.stats().unwrap();
    assert_eq!(stats.blob_count, 1);
    assert_eq!(stats.link_count, 2);
    assert_eq!(stats.stored_bytes, 11);
    assert_eq!(stats.linked_bytes, 22);
    assert_eq!(h.store.put_calls(), 1);

    // A removes the owner link; B keeps the blob
    let removal = s.gc.remove_link(&alice.id, &first.content_id).await.unwrap();
    assert_eq!(removal.ref_count, 1);
    assert!(!removal.collected);
    assert!(h.store.contains(&blob.object_key).await);

    // B cannot remove a non-owner link
    let err = s.gc.remove_link(&bob.id, &first.content_id).await.unwrap_err();
    assert!(matches!(err, DedupError::PermissionDenied { .. }));

    assert!(s.quota.audit().await.unwrap().is_empty());
    assert!(s.gc.audit_ref_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sole_link_removal_collects_blob() {
    let h = harness();
    let s = &h.services;
    let carol = s.quota.register_user("carol", None).await.unwrap();
    let data = b"only mine";

    let receipt = s.ingest.ingest(upload(&carol.id, data), &data[..]).await.unwrap();
    let removal = s.gc.remove_link(&carol.id, &receipt.content_id).await.unwrap();
    assert!(removal.collected);
    assert_eq!(removal.ref_count, 0);

    assert_eq!(h.store.delete_calls(), 1);
    assert!(h.store.is_empty().await);
    assert_eq!(s.db.stats().unwrap().blob_count, 0);
    assert_eq!(s.quota.usage(&carol.id).await.unwrap().used_storage, 0);

    // Same bytes again start over as a fresh owner blob
    let again = s.ingest.ingest(upload(&carol.id, data), &data[..]).await.unwrap();
    assert_eq!(again.disposition, IngestDisposition::StoredNew);
    assert_ne!(again.content_id, receipt.content_id);
    assert_eq!(h.store.put_calls(), 2);
}

#[tokio::test]
async fn test_blob_store_failure_leaves_ledger_and_quota_unchanged() {
    let h = harness();
    let s = &h.services;
    let dave = s.quota.register_user("dave", None).await.unwrap();
    h.store.set_fail_puts(true);

    let data = b"doomed upload";
    let err = s.ingest.ingest(upload(&dave.id, data), &data[..]).await.unwrap_err();
    assert!(err.is_blob_store_failure());

    let stats = s.db.stats().unwrap();
    assert_eq!(stats.blob_count, 0);
    assert_eq!(stats.link_count, 0);
    assert_eq!(s.quota.usage(&dave.id).await.unwrap().used_storage, 0);

    // Retry after the store recovers
    h.store.set_fail_puts(false);
    let receipt = s.ingest.ingest(upload(&dave.id, data), &data[..]).await.unwrap();
    assert_eq!(receipt.disposition, IngestDisposition::StoredNew);
}

#[tokio::test]
async fn test_admission_precheck_is_separate_from_ingest() {
    let h = harness();
    let s = &h.services;
    let erin = s.quota.register_user("erin", Some(8)).await.unwrap();
    let data = b"twelve bytes";

    assert!(matches!(
        s.quota.check_admission(&erin.id, Some(data.len() as u64)).await,
        Err(DedupError::QuotaExceeded { .. })
    ));

    // The coordinator only accounts; it never rejects on quota
    s.ingest.ingest(upload(&erin.id, data), &data[..]).await.unwrap();
    let usage = s.quota.usage(&erin.id).await.unwrap();
    assert_eq!(usage.used_storage, 12);
    assert_eq!(usage.remaining, 0);
}

#[tokio::test]
async fn test_download_and_listing() {
    let h = harness();
    let s = &h.services;
    let frank = s.quota.register_user("frank", None).await.unwrap();

    let notes = b"meeting notes";
    let image = b"\x89PNG fake image bytes";
    s.ingest.ingest(upload(&frank.id, notes), &notes[..]).await.unwrap();
    let img = s.ingest.ingest(upload(&frank.id, image), &image[..]).await.unwrap();

    let listed = s.ingest.list_links(&frank.id).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|c| c.link.is_owner));

    let (blob, mut reader) = s.ingest.open_content(&frank.id, &img.content_id).await.unwrap();
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, image);
    assert_eq!(blob.size, image.len() as i64);

    assert!(matches!(
        s.ingest.list_links("nobody").await,
        Err(DedupError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_filesystem_store_round_trip_through_services() {
    let temp = TempDir::new().unwrap();
    let config = Config::with_storage_dir(temp.path());
    let services = Services::open(&config).await.unwrap();
    let user = services.quota.register_user("gina", None).await.unwrap();

    let path = temp.path().join("upload.txt");
    tokio::fs::write(&path, b"bytes on disk").await.unwrap();
    let hashed = elohim_dedup::hash_file(&path).await.unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let receipt = services
        .ingest
        .ingest(
            IngestRequest {
                user_id: user.id.clone(),
                hash: hashed.hash.clone(),
                size: hashed.size,
                mime_type: "text/plain".into(),
            },
            file,
        )
        .await
        .unwrap();

    let fs_store = FsBlobStore::new(config.blobs_dir()).await.unwrap();
    assert_eq!(fs_store.stats().await.unwrap().total_blobs, 1);

    services.gc.remove_link(&user.id, &receipt.content_id).await.unwrap();
    assert_eq!(fs_store.stats().await.unwrap().total_blobs, 0);
    let user_row = services
        .db
        .with_conn(|conn| users::get_user(conn, &user.id))
        .unwrap();
    assert_eq!(user_row.used_storage, 0);
}
