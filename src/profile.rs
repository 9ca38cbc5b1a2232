//! # Profile Store
//!
//! The user profile (index tree plus access metadata) is the single source
//! of truth shared by all peers. It is stored sealed on the overlay under one
//! key and only ever changed through [`ProfileStore::transact`]:
//!
//! 1. fetch the latest profile and its version marker
//! 2. apply the caller's modifier to a working copy
//! 3. put the result back, guarded by the marker read in step 1
//! 4. on rejection, start over from step 1 after a randomized backoff
//!
//! The modifier is re-applied to the fresh profile on every attempt, so a
//! logical operation such as "add this file" is retried, never a stale diff.
//! Steps 1-3 run under a per-store lock so two local transactions never
//! race each other with the same marker.

use crate::crypto::{CryptoProvider, PeerId};
use crate::dht::{Dht, PutOutcome, Version};
use crate::error::{Result, SyncError};
use crate::index::IndexTree;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub owner: String,
    pub tree: IndexTree,
    pub authorized_peers: BTreeSet<PeerId>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    version: Option<Version>,
}

impl UserProfile {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            tree: IndexTree::new(),
            authorized_peers: BTreeSet::new(),
            updated_at: chrono::Utc::now(),
            version: None,
        }
    }

    /// Marker of the stored copy this profile was read from or written as.
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn authorize(&mut self, peer: PeerId) -> bool {
        self.authorized_peers.insert(peer)
    }

    pub fn is_authorized(&self, peer: &PeerId) -> bool {
        self.authorized_peers.contains(peer)
    }

    /// Every authorized peer except `me`.
    pub fn other_peers(&self, me: &PeerId) -> Vec<PeerId> {
        self.authorized_peers.iter().filter(|p| *p != me).cloned().collect()
    }

    pub fn seal(&self, crypto: &dyn CryptoProvider) -> Result<Vec<u8>> {
        let plain = serde_json::to_vec(self)?;
        crypto.seal(&plain)
    }

    pub fn open(sealed: &[u8], version: Version, crypto: &dyn CryptoProvider) -> Result<Self> {
        let plain = crypto.open(sealed)?;
        let mut profile: UserProfile = serde_json::from_slice(&plain)?;
        profile.version = Some(version);
        Ok(profile)
    }
}

/// What a transaction modifier decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    Commit,
    /// Nothing to write; the transaction returns the profile as read.
    Abort,
}

/// Delay before retry number `attempt` (1-based).
pub trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Retry immediately. Meant for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Doubling delay capped at `max`, with the upper half randomized.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ceiling = self.base.saturating_mul(1 << shift).min(self.max);
        let half = ceiling / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Optimistic-concurrency access to one profile on the overlay.
#[derive(Clone)]
pub struct ProfileStore {
    location: String,
    dht: Arc<dyn Dht>,
    crypto: Arc<dyn CryptoProvider>,
    policy: TransactionPolicy,
    backoff: Arc<dyn Backoff>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ProfileStore {
    pub fn new(
        location: impl Into<String>,
        dht: Arc<dyn Dht>,
        crypto: Arc<dyn CryptoProvider>,
        policy: TransactionPolicy,
    ) -> Self {
        Self {
            location: location.into(),
            dht,
            crypto,
            policy,
            backoff: Arc::new(ExponentialBackoff {
                base: Duration::from_millis(50),
                max: Duration::from_secs(1),
            }),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    /// Store `profile` if no profile exists yet; otherwise return the stored one.
    pub async fn create(&self, profile: UserProfile) -> Result<UserProfile> {
        let _guard = self.write_lock.lock().await;
        let sealed = profile.seal(self.crypto.as_ref())?;

        match self.dht.put_if_version(&self.location, sealed, None).await? {
            PutOutcome::Accepted(version) => {
                info!("Created profile at {} ({})", self.location, version);
                let mut created = profile;
                created.version = Some(version);
                Ok(created)
            }
            PutOutcome::Rejected { .. } => {
                debug!("Profile at {} already exists", self.location);
                self.fetch().await
            }
        }
    }

    /// Read-only fetch of the latest stored profile.
    pub async fn latest(&self) -> Result<UserProfile> {
        self.fetch().await
    }

    async fn fetch(&self) -> Result<UserProfile> {
        let stored = self
            .dht
            .get(&self.location)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("profile {}", self.location)))?;
        UserProfile::open(&stored.value, stored.version, self.crypto.as_ref())
    }

    /// [`ProfileStore::transact`] with the configured timeout.
    pub async fn update<F>(&self, modifier: F) -> Result<UserProfile>
    where
        F: FnMut(&mut UserProfile) -> Result<Modification> + Send,
    {
        self.transact(self.policy.timeout, modifier).await
    }

    /// Read-modify-write the profile, retrying on version conflicts.
    ///
    /// Errors returned by `modifier` abort the transaction immediately. When
    /// the retry bound or `timeout` is exhausted the result is
    /// [`SyncError::VersionConflict`] and nothing has been written.
    pub async fn transact<F>(&self, timeout: Duration, mut modifier: F) -> Result<UserProfile>
    where
        F: FnMut(&mut UserProfile) -> Result<Modification> + Send,
    {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let conflict = SyncError::VersionConflict { attempts: attempt };

            let (working, outcome) = {
                let _guard = match timeout_at(deadline, self.write_lock.lock()).await {
                    Ok(guard) => guard,
                    Err(_) => return Err(conflict),
                };

                let current = match timeout_at(deadline, self.fetch()).await {
                    Ok(result) => result?,
                    Err(_) => return Err(conflict),
                };
                let expected = current.version;

                let mut working = current.clone();
                if modifier(&mut working)? == Modification::Abort {
                    debug!("Transaction on {} aborted by modifier", self.location);
                    return Ok(current);
                }
                working.updated_at = chrono::Utc::now();
                let sealed = working.seal(self.crypto.as_ref())?;

                if Instant::now() >= deadline {
                    return Err(conflict);
                }
                // The put itself is never cut short: it is atomic on the overlay.
                let outcome = self.dht.put_if_version(&self.location, sealed, expected).await?;
                (working, outcome)
            };

            match outcome {
                PutOutcome::Accepted(version) => {
                    debug!("Committed profile {} as {} (attempt {})", self.location, version, attempt);
                    let mut committed = working;
                    committed.version = Some(version);
                    return Ok(committed);
                }
                PutOutcome::Rejected { current } => {
                    warn!(
                        "Version conflict on {} (attempt {}, stored {:?})",
                        self.location, attempt, current
                    );
                    if attempt > self.policy.max_retries {
                        return Err(conflict);
                    }
                    let delay = self.backoff.delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(conflict);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{NodeKey, SignedEnvelope};
    use crate::dht::MemoryDht;
    use crate::index::NewNode;
    use assert_matches::assert_matches;

    fn store(dht: &MemoryDht, crypto: &Arc<SignedEnvelope>) -> ProfileStore {
        ProfileStore::new(
            "profile:alice",
            Arc::new(dht.clone()),
            crypto.clone(),
            TransactionPolicy::default(),
        )
        .with_backoff(Arc::new(NoBackoff))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let store = store(&dht, &crypto);

        let created = store.create(UserProfile::new("alice")).await.unwrap();
        assert_eq!(created.version(), Some(Version::INITIAL));

        let again = store.create(UserProfile::new("alice")).await.unwrap();
        assert_eq!(again.tree.root(), created.tree.root());
    }

    #[tokio::test]
    async fn test_insert_commit_increments_version() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let store = store(&dht, &crypto);
        store.create(UserProfile::new("alice")).await.unwrap();

        let key = NodeKey::generate();
        let committed = store
            .update(|profile| {
                let root = profile.tree.root();
                profile.tree.insert(
                    root,
                    key,
                    "report.pdf",
                    NewNode::File { fingerprint: None, size: 0 },
                )?;
                Ok(Modification::Commit)
            })
            .await
            .unwrap();

        assert_eq!(committed.version(), Some(Version::new(1)));
        assert_eq!(committed.tree.resolve_path(&key).unwrap(), "/report.pdf");
        assert_eq!(store.latest().await.unwrap().tree, committed.tree);
    }

    #[tokio::test]
    async fn test_abort_writes_nothing() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let store = store(&dht, &crypto);
        store.create(UserProfile::new("alice")).await.unwrap();

        let result = store.update(|_| Ok(Modification::Abort)).await.unwrap();

        assert_eq!(result.version(), Some(Version::INITIAL));
        assert_eq!(dht.version_of("profile:alice"), Some(Version::INITIAL));
    }

    #[tokio::test]
    async fn test_modifier_error_is_not_retried() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let store = store(&dht, &crypto);
        store.create(UserProfile::new("alice")).await.unwrap();

        let mut calls = 0;
        let result = store
            .update(|_| {
                calls += 1;
                Err(SyncError::not_found("parent"))
            })
            .await;

        assert_matches!(result, Err(SyncError::NotFound(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_missing_profile() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let store = store(&dht, &crypto);

        assert_matches!(store.latest().await, Err(SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_local_concurrent_transactions_serialize() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let store = store(&dht, &crypto).with_backoff(Arc::new(NoBackoff));
        store.create(UserProfile::new("alice")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(move |profile| {
                        let root = profile.tree.root();
                        profile.tree.insert(root, NodeKey::generate(), &format!("f{}", i), NewNode::Folder)?;
                        Ok(Modification::Commit)
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let latest = store.latest().await.unwrap();
        assert_eq!(latest.version(), Some(Version::new(10)));
        assert_eq!(latest.tree.children(&latest.tree.root()).unwrap().len(), 10);
    }

    #[test]
    fn test_exponential_backoff_bounds() {
        let backoff = ExponentialBackoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(400),
        };
        for attempt in 1..10 {
            let delay = backoff.delay(attempt);
            assert!(delay <= Duration::from_millis(400));
            assert!(delay >= Duration::from_millis(50));
        }
        assert!(backoff.delay(1) <= Duration::from_millis(100));
    }

    #[test]
    fn test_other_peers_excludes_self() {
        let mut profile = UserProfile::new("alice");
        let me = PeerId::new("me");
        profile.authorize(me.clone());
        profile.authorize(PeerId::new("laptop"));
        profile.authorize(PeerId::new("phone"));

        assert_eq!(
            profile.other_peers(&me),
            vec![PeerId::new("laptop"), PeerId::new("phone")]
        );
        assert!(profile.is_authorized(&me));
    }
}
