//! Concurrent ingest and removal against one shared ledger

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use elohim_dedup::db::{blobs, links, pending, users};
use elohim_dedup::{
    compute_hash, BlobReader, BlobStore, BlobStoreError, Config, DedupError, IngestDisposition,
    IngestRequest, LedgerDb, LedgerOptions, MemoryBlobStore, Services,
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Barrier, Notify, Semaphore};

const WRITERS: usize = 8;

fn shared_services(temp: &TempDir) -> (Arc<Services>, Arc<MemoryBlobStore>) {
    let config = Config::with_storage_dir(temp.path());
    let db = LedgerDb::open(&config.database_path(), LedgerOptions::from(&config)).unwrap();
    let store = Arc::new(MemoryBlobStore::new());
    (Arc::new(Services::new(db, store.clone(), &config)), store)
}

/// How a [`ScriptedStore`] holds up calls before reaching the memory store
enum Hold {
    /// Every `put` waits until two puts are in flight
    PutBarrier(Barrier),
    /// `put` never returns
    StallPut,
    /// `delete` announces itself, then waits for a permit
    GateDelete { entered: Notify, release: Semaphore },
}

struct ScriptedStore {
    inner: MemoryBlobStore,
    hold: Hold,
}

impl ScriptedStore {
    fn new(hold: Hold) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBlobStore::new(),
            hold,
        })
    }
}

#[async_trait]
impl BlobStore for ScriptedStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: u64,
    ) -> Result<(), BlobStoreError> {
        match &self.hold {
            Hold::PutBarrier(barrier) => {
                barrier.wait().await;
            }
            Hold::StallPut => std::future::pending::<()>().await,
            Hold::GateDelete { .. } => {}
        }
        self.inner.put(key, content_type, reader, size).await
    }

    async fn get(&self, key: &str) -> Result<BlobReader, BlobStoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        if let Hold::GateDelete { entered, release } = &self.hold {
            entered.notify_one();
            release.acquire().await.unwrap().forget();
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobStoreError> {
        self.inner.exists(key).await
    }
}

fn services_over(temp: &TempDir, store: Arc<dyn BlobStore>) -> Arc<Services> {
    let config = Config::with_storage_dir(temp.path());
    let db = LedgerDb::open(&config.database_path(), LedgerOptions::from(&config)).unwrap();
    Arc::new(Services::new(db, store, &config))
}

fn upload(user_id: &str, data: &[u8]) -> IngestRequest {
    IngestRequest {
        user_id: user_id.to_string(),
        hash: compute_hash(data),
        size: data.len() as u64,
        mime_type: "application/octet-stream".into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_ingest_creates_one_blob() {
    let temp = TempDir::new().unwrap();
    let (services, store) = shared_services(&temp);
    let data: &'static [u8] = b"the same brand new content";

    let mut user_ids = Vec::new();
    for i in 0..WRITERS {
        let user = services
            .quota
            .register_user(&format!("user-{}", i), None)
            .await
            .unwrap();
        user_ids.push(user.id);
    }

    let handles: Vec<_> = user_ids
        .iter()
        .cloned()
        .map(|user_id| {
            let services = services.clone();
            tokio::spawn(async move { services.ingest.ingest(upload(&user_id, data), data).await })
        })
        .collect();

    let mut receipts = Vec::new();
    for handle in handles {
        receipts.push(handle.await.unwrap().unwrap());
    }

    let content_id = receipts[0].content_id.clone();
    assert!(receipts.iter().all(|r| r.content_id == content_id));
    assert_eq!(
        receipts
            .iter()
            .filter(|r| r.disposition == IngestDisposition::StoredNew)
            .count(),
        1
    );

    let stats = services.db.stats().unwrap();
    assert_eq!(stats.blob_count, 1);
    assert_eq!(stats.link_count, WRITERS as u64);

    let (blob, charged) = services
        .db
        .with_conn(|conn| {
            let blob = blobs::get_blob(conn, &content_id)?.unwrap();
            let mut charged = Vec::new();
            for user_id in &user_ids {
                charged.push(users::get_user(conn, user_id)?.used_storage);
            }
            Ok((blob, charged))
        })
        .unwrap();
    assert_eq!(blob.ref_count, WRITERS as i64);
    assert!(charged.iter().all(|&used| used == data.len() as i64));

    // Losing writers may have raced the put, but only one object exists
    assert!(store.put_calls() >= 1);
    assert_eq!(store.len().await, 1);

    assert!(services.quota.audit().await.unwrap().is_empty());
    assert!(services.gc.audit_ref_counts().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reingest_by_one_user_charges_once() {
    let temp = TempDir::new().unwrap();
    let (services, _store) = shared_services(&temp);
    let user = services.quota.register_user("solo", None).await.unwrap();
    let data: &'static [u8] = b"uploaded from several tabs";

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let services = services.clone();
            let user_id = user.id.clone();
            tokio::spawn(async move { services.ingest.ingest(upload(&user_id, data), data).await })
        })
        .collect();

    let mut content_ids = Vec::new();
    for handle in handles {
        content_ids.push(handle.await.unwrap().unwrap().content_id);
    }
    content_ids.dedup();
    assert_eq!(content_ids.len(), 1);

    let usage = services.quota.usage(&user.id).await.unwrap();
    assert_eq!(usage.total_links, 1);
    assert_eq!(usage.used_storage, data.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_removals_collect_exactly_once() {
    let temp = TempDir::new().unwrap();
    let (services, store) = shared_services(&temp);
    let owner = services.quota.register_user("owner", None).await.unwrap();
    let data: &'static [u8] = b"short lived";

    let receipt = services
        .ingest
        .ingest(upload(&owner.id, data), data)
        .await
        .unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let services = services.clone();
            let user_id = owner.id.clone();
            let content_id = receipt.content_id.clone();
            tokio::spawn(async move { services.gc.remove_link(&user_id, &content_id).await })
        })
        .collect();

    let mut removed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(removal) => {
                assert!(removal.collected);
                removed += 1;
            }
            Err(DedupError::NotFound(_)) => {}
            Err(e) => panic!("unexpected removal error: {}", e),
        }
    }

    assert_eq!(removed, 1);
    assert_eq!(store.delete_calls(), 1);
    assert!(store.is_empty().await);
    assert_eq!(services.db.stats().unwrap().blob_count, 0);
    assert_eq!(services.quota.usage(&owner.id).await.unwrap().used_storage, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removal_racing_new_links_keeps_counts_consistent() {
    let temp = TempDir::new().unwrap();
    let (services, _store) = shared_services(&temp);
    let owner = services.quota.register_user("owner", None).await.unwrap();
    let data: &'static [u8] = b"popular content";
    let first = services
        .ingest
        .ingest(upload(&owner.id, data), data)
        .await
        .unwrap();

    let mut followers = Vec::new();
    for i in 0..WRITERS {
        let user = services
            .quota
            .register_user(&format!("follower-{}", i), None)
            .await
            .unwrap();
        followers.push(user.id);
    }

    let mut handles = Vec::new();
    for user_id in followers {
        let services = services.clone();
        handles.push(tokio::spawn(async move {
            services
                .ingest
                .ingest(upload(&user_id, data), data)
                .await
                .map(|_| ())
        }));
    }
    let remover = {
        let services = services.clone();
        let user_id = owner.id.clone();
        let content_id = first.content_id.clone();
        tokio::spawn(async move { services.gc.remove_link(&user_id, &content_id).await })
    };

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    remover.await.unwrap().unwrap();

    // Every follower ends up linked to exactly one live blob
    let stats = services.db.stats().unwrap();
    assert_eq!(stats.link_count, WRITERS as u64);
    assert!(services.quota.audit().await.unwrap().is_empty());
    assert!(services.gc.audit_ref_counts().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_insert_race_loser_links_as_non_owner() {
    let temp = TempDir::new().unwrap();
    let store = ScriptedStore::new(Hold::PutBarrier(Barrier::new(2)));
    let services = services_over(&temp, store.clone());
    let a = services.quota.register_user("a", None).await.unwrap();
    let b = services.quota.register_user("b", None).await.unwrap();
    let data: &'static [u8] = b"both see an empty ledger";

    // Neither put returns until both writers have looked up and found nothing
    let spawn = |user_id: String| {
        let services = services.clone();
        tokio::spawn(async move { services.ingest.ingest(upload(&user_id, data), data).await })
    };
    let (ra, rb) = (spawn(a.id.clone()), spawn(b.id.clone()));
    let ra = ra.await.unwrap().unwrap();
    let rb = rb.await.unwrap().unwrap();

    let mut dispositions = vec![ra.disposition, rb.disposition];
    dispositions.sort_by_key(|d| *d == IngestDisposition::StoredNew);
    assert_eq!(
        dispositions,
        vec![IngestDisposition::LinkedExisting, IngestDisposition::StoredNew]
    );
    assert_eq!(ra.content_id, rb.content_id);

    let (blob, owners) = services
        .db
        .with_conn(|conn| {
            let blob = blobs::get_blob(conn, &ra.content_id)?.unwrap();
            let mut owners = Vec::new();
            for user_id in [&a.id, &b.id] {
                owners.push(links::find_link(conn, user_id, &blob.id)?.unwrap().is_owner);
            }
            Ok((blob, owners))
        })
        .unwrap();
    assert_eq!(blob.ref_count, 2);
    assert_eq!(owners.iter().filter(|&&o| o).count(), 1);
    assert_eq!(services.db.stats().unwrap().blob_count, 1);
    assert_eq!(store.inner.put_calls(), 2);
    assert_eq!(store.inner.len().await, 1);

    for user in [&a, &b] {
        let usage = services.quota.usage(&user.id).await.unwrap();
        assert_eq!(usage.used_storage, data.len() as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_ingest_leaves_ledger_untouched() {
    let temp = TempDir::new().unwrap();
    let store = ScriptedStore::new(Hold::StallPut);
    let services = services_over(&temp, store.clone());
    let user = services.quota.register_user("patient", None).await.unwrap();
    let data: &'static [u8] = b"never finishes uploading";

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        services.ingest.ingest(upload(&user.id, data), data),
    )
    .await;
    assert!(outcome.is_err(), "stalled put should have timed out");

    let stats = services.db.stats().unwrap();
    assert_eq!(stats.blob_count, 0);
    assert_eq!(stats.link_count, 0);
    assert_eq!(services.quota.usage(&user.id).await.unwrap().used_storage, 0);
    assert!(store.inner.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reingest_during_object_delete_keeps_bytes() {
    let temp = TempDir::new().unwrap();
    let store = ScriptedStore::new(Hold::GateDelete {
        entered: Notify::new(),
        release: Semaphore::new(0),
    });
    let services = services_over(&temp, store.clone());
    let a = services.quota.register_user("a", None).await.unwrap();
    let b = services.quota.register_user("b", None).await.unwrap();
    let data: &'static [u8] = b"deleted and uploaded again";

    let first = services.ingest.ingest(upload(&a.id, data), data).await.unwrap();

    // A's removal commits, then blocks inside the object delete
    let remover = {
        let services = services.clone();
        let (user_id, content_id) = (a.id.clone(), first.content_id.clone());
        tokio::spawn(async move { services.gc.remove_link(&user_id, &content_id).await })
    };
    let Hold::GateDelete { entered, release } = &store.hold else {
        unreachable!()
    };
    entered.notified().await;
    let hash = compute_hash(data);
    assert!(services
        .db
        .with_conn(|conn| pending::is_pending(conn, &hash))
        .unwrap());

    // B uploads the same bytes while the old object is still being deleted
    let reingest = {
        let services = services.clone();
        let user_id = b.id.clone();
        tokio::spawn(async move { services.ingest.ingest(upload(&user_id, data), data).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reingest.is_finished(), "ingest must wait for the pending delete");
    assert_eq!(services.db.stats().unwrap().blob_count, 0);

    release.add_permits(1);
    assert!(remover.await.unwrap().unwrap().collected);

    let receipt = reingest.await.unwrap().unwrap();
    assert_eq!(receipt.disposition, IngestDisposition::StoredNew);
    assert_ne!(receipt.content_id, first.content_id);

    let (_, mut reader) = services
        .ingest
        .open_content(&b.id, &receipt.content_id)
        .await
        .unwrap();
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, data);
    assert!(services
        .db
        .with_conn(|conn| pending::list(conn))
        .unwrap()
        .is_empty());
}
