//! Integration tests for concurrent profile transactions
//!
//! Several stores (standing in for several peers) write the same profile on
//! one overlay. Every transaction must land exactly once, and a change made
//! between a peer's read and its write must never be lost.

use async_trait::async_trait;
use sharetree::crypto::{CryptoProvider, NodeKey, PeerId, SignedEnvelope};
use sharetree::dht::{Dht, MemoryDht, PutOutcome, Version, Versioned};
use sharetree::error::{Result, SyncError};
use sharetree::index::NewNode;
use sharetree::profile::{
    ExponentialBackoff, Modification, NoBackoff, ProfileStore, TransactionPolicy, UserProfile,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOCATION: &str = "profile:alice";

fn add_folder(profile: &mut UserProfile, name: &str) -> Result<Modification> {
    let root = profile.tree.root();
    profile.tree.insert(root, NodeKey::generate(), name, NewNode::Folder)?;
    Ok(Modification::Commit)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_peers_each_commit_once() {
    let dht = MemoryDht::new();
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SignedEnvelope::generate());
    let policy = TransactionPolicy {
        max_retries: 50,
        timeout: Duration::from_secs(30),
    };
    let backoff = Arc::new(ExponentialBackoff {
        base: Duration::from_millis(1),
        max: Duration::from_millis(10),
    });

    let first = ProfileStore::new(LOCATION, Arc::new(dht.clone()), crypto.clone(), policy);
    first.create(UserProfile::new("alice")).await.unwrap();

    let peers = 8;
    let mut handles = Vec::new();
    for i in 0..peers {
        // separate stores do not share the local lock, so they really race
        let store = ProfileStore::new(LOCATION, Arc::new(dht.clone()), crypto.clone(), policy)
            .with_backoff(backoff.clone());
        handles.push(tokio::spawn(async move {
            store.update(move |profile| add_folder(profile, &format!("peer-{}", i))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let latest = first.latest().await.unwrap();
    assert_eq!(latest.version(), Some(Version::new(peers)));
    let root = latest.tree.root();
    for i in 0..peers {
        assert!(latest
            .tree
            .child_by_name(&root, &format!("peer-{}", i))
            .unwrap()
            .is_some());
    }
}

/// Overlay that lets another writer sneak in right before the first guarded put.
struct InterferingDht {
    inner: MemoryDht,
    crypto: Arc<dyn CryptoProvider>,
    interfered: AtomicBool,
}

#[async_trait]
impl Dht for InterferingDht {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.inner.get(key).await
    }

    async fn put_if_version(&self, key: &str, value: Vec<u8>, expected: Option<Version>) -> Result<PutOutcome> {
        if expected.is_some() && !self.interfered.swap(true, Ordering::SeqCst) {
            let stored = self
                .inner
                .get(key)
                .await?
                .ok_or_else(|| SyncError::not_found(key))?;
            let mut other = UserProfile::open(&stored.value, stored.version, self.crypto.as_ref())?;
            add_folder(&mut other, "injected")?;
            let sealed = other.seal(self.crypto.as_ref())?;
            self.inner.put_if_version(key, sealed, Some(stored.version)).await?;
        }
        self.inner.put_if_version(key, value, expected).await
    }

    async fn send_direct(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> Result<()> {
        self.inner.send_direct(from, to, payload).await
    }
}

#[tokio::test]
async fn test_retry_sees_interleaved_change() {
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SignedEnvelope::generate());
    let dht = Arc::new(InterferingDht {
        inner: MemoryDht::new(),
        crypto: crypto.clone(),
        interfered: AtomicBool::new(false),
    });
    let store = ProfileStore::new(LOCATION, dht, crypto, TransactionPolicy::default())
        .with_backoff(Arc::new(NoBackoff));
    store.create(UserProfile::new("alice")).await.unwrap();

    let calls = AtomicU32::new(0);
    let committed = store
        .update(|profile| {
            calls.fetch_add(1, Ordering::SeqCst);
            add_folder(profile, "mine")
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(committed.version(), Some(Version::new(2)));
    let root = committed.tree.root();
    assert!(committed.tree.child_by_name(&root, "injected").unwrap().is_some());
    assert!(committed.tree.child_by_name(&root, "mine").unwrap().is_some());
}

/// Overlay that rejects every guarded put.
struct AlwaysStale {
    inner: MemoryDht,
}

#[async_trait]
impl Dht for AlwaysStale {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.inner.get(key).await
    }

    async fn put_if_version(&self, key: &str, value: Vec<u8>, expected: Option<Version>) -> Result<PutOutcome> {
        match expected {
            None => self.inner.put_if_version(key, value, None).await,
            Some(_) => Ok(PutOutcome::Rejected {
                current: self.inner.version_of(key),
            }),
        }
    }

    async fn send_direct(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> Result<()> {
        self.inner.send_direct(from, to, payload).await
    }
}

#[tokio::test]
async fn test_exhausted_retries_report_version_conflict() {
    let inner = MemoryDht::new();
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SignedEnvelope::generate());
    let policy = TransactionPolicy {
        max_retries: 3,
        timeout: Duration::from_secs(5),
    };
    let store = ProfileStore::new(
        LOCATION,
        Arc::new(AlwaysStale { inner: inner.clone() }),
        crypto,
        policy,
    )
    .with_backoff(Arc::new(NoBackoff));
    store.create(UserProfile::new("alice")).await.unwrap();

    let result = store.update(|profile| add_folder(profile, "never")).await;

    match result {
        Err(SyncError::VersionConflict { attempts }) => assert_eq!(attempts, 4),
        other => panic!("expected a version conflict, got {:?}", other.map(|p| p.version())),
    }
    // nothing was written past the initial profile
    assert_eq!(inner.version_of(LOCATION), Some(Version::INITIAL));
}

#[tokio::test]
async fn test_timeout_reports_version_conflict() {
    let inner = MemoryDht::new();
    let crypto: Arc<dyn CryptoProvider> = Arc::new(SignedEnvelope::generate());
    let store = ProfileStore::new(
        LOCATION,
        Arc::new(AlwaysStale { inner: inner.clone() }),
        crypto,
        TransactionPolicy {
            max_retries: u32::MAX,
            timeout: Duration::from_millis(200),
        },
    )
    .with_backoff(Arc::new(ExponentialBackoff {
        base: Duration::from_millis(20),
        max: Duration::from_millis(50),
    }));
    store.create(UserProfile::new("alice")).await.unwrap();

    let result = store.update(|profile| add_folder(profile, "never")).await;

    assert!(matches!(result, Err(SyncError::VersionConflict { .. })));
    assert_eq!(inner.version_of(LOCATION), Some(Version::INITIAL));
}
