//! # Peer Node
//!
//! Ties one peer's pieces together: the overlay handle, the crypto provider,
//! the active session and the notification plumbing in both directions.
//!
//! A node exists before anyone logs in. Messages that arrive while no
//! session is active are dropped by the handler.

use crate::config::Config;
use crate::crypto::{CryptoProvider, PeerId};
use crate::dht::{Dht, DirectMessage};
use crate::error::Result;
use crate::notification::{FileEvent, NotificationDispatcher, NotificationHandler};
use crate::operations::FileOperations;
use crate::profile::{Backoff, Modification, ProfileStore, TransactionPolicy, UserProfile};
use crate::session::{Session, SessionSlot};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct PeerNode {
    peer_id: PeerId,
    dht: Arc<dyn Dht>,
    crypto: Arc<dyn CryptoProvider>,
    policy: TransactionPolicy,
    backoff: Option<Arc<dyn Backoff>>,
    sessions: SessionSlot,
    dispatcher: NotificationDispatcher,
    handler: Arc<NotificationHandler>,
}

impl PeerNode {
    /// Create a node. File events raised for incoming notifications arrive
    /// on the returned receiver.
    pub fn new(
        peer_id: PeerId,
        dht: Arc<dyn Dht>,
        crypto: Arc<dyn CryptoProvider>,
        policy: TransactionPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<FileEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let sessions = SessionSlot::new();
        let dispatcher = NotificationDispatcher::new(peer_id.clone(), dht.clone(), crypto.clone());
        let handler = Arc::new(NotificationHandler::new(sessions.clone(), crypto.clone(), events));

        let node = Self {
            peer_id,
            dht,
            crypto,
            policy,
            backoff: None,
            sessions,
            dispatcher,
            handler,
        };
        (node, receiver)
    }

    /// Create a node with the retry, backoff and notification settings of `config`.
    pub fn from_config(
        config: &Config,
        dht: Arc<dyn Dht>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<FileEvent>) {
        let (mut node, receiver) = Self::new(
            PeerId::new(config.peer_id.clone()),
            dht,
            crypto,
            config.transaction.policy(),
        );
        node.backoff = Some(Arc::new(config.transaction.backoff()));
        node.dispatcher = node.dispatcher.with_enabled(config.notification.enabled);
        (node, receiver)
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Open the profile at `location` (creating it for `owner` if needed),
    /// register this peer on it and make it the active session.
    pub async fn login(&self, location: &str, owner: &str, root: PathBuf) -> Result<Arc<Session>> {
        let mut store = ProfileStore::new(location, self.dht.clone(), self.crypto.clone(), self.policy);
        if let Some(backoff) = &self.backoff {
            store = store.with_backoff(backoff.clone());
        }

        store.create(UserProfile::new(owner)).await?;
        let me = self.peer_id.clone();
        let profile = store
            .update(|profile| {
                if profile.authorize(me.clone()) {
                    Ok(Modification::Commit)
                } else {
                    Ok(Modification::Abort)
                }
            })
            .await?;

        let session = Arc::new(Session::new(self.peer_id.clone(), root, store));
        session.remember(&profile);
        if let Some(previous) = self.sessions.clear() {
            info!("Replacing session at {}", previous.root().display());
        }
        self.sessions.set(session.clone());

        info!(
            "{} logged in to {} ({} authorized peer(s))",
            self.peer_id,
            location,
            profile.authorized_peers.len()
        );
        Ok(session)
    }

    pub fn logout(&self) -> Option<Arc<Session>> {
        let session = self.sessions.clear();
        if session.is_some() {
            info!("{} logged out", self.peer_id);
        }
        session
    }

    pub fn session(&self) -> Result<Arc<Session>> {
        self.sessions.current()
    }

    /// Operation builder bound to the active session.
    pub fn file_operations(&self) -> Result<FileOperations> {
        Ok(FileOperations::new(self.sessions.current()?, self.dispatcher.clone()))
    }

    pub fn notification_handler(&self) -> Arc<NotificationHandler> {
        self.handler.clone()
    }

    /// Start consuming direct messages addressed to this peer.
    pub fn listen(&self, inbox: mpsc::UnboundedReceiver<DirectMessage>) -> JoinHandle<()> {
        self.handler.clone().listen(inbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignedEnvelope;
    use crate::dht::{MemoryDht, PutOutcome, Version, Versioned};
    use crate::error::SyncError;
    use crate::profile::NoBackoff;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Overlay that refuses every guarded write, as if another peer always
    /// got there first.
    struct Contended {
        inner: MemoryDht,
    }

    #[async_trait]
    impl Dht for Contended {
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

    fn config(dir: &TempDir, id: &str) -> Config {
        let mut config = Config::new(id, dir.path().join(id), dir.path().join(format!("{}.toml", id)));
        config.profile_location = "profile:alice".to_string();
        config
    }

    fn node(dht: &MemoryDht, crypto: &Arc<SignedEnvelope>, id: &str) -> PeerNode {
        let (node, _events) = PeerNode::new(
            PeerId::new(id),
            Arc::new(dht.clone()),
            crypto.clone(),
            TransactionPolicy::default(),
        );
        node.with_backoff(Arc::new(NoBackoff))
    }

    #[tokio::test]
    async fn test_login_registers_peer_once() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let dir = TempDir::new().unwrap();
        let laptop = node(&dht, &crypto, "laptop");

        let session = laptop
            .login("profile:alice", "alice", dir.path().to_path_buf())
            .await
            .unwrap();
        let first = session.cached_profile().unwrap();
        assert!(first.is_authorized(&PeerId::new("laptop")));

        laptop.logout();
        let again = laptop
            .login("profile:alice", "alice", dir.path().to_path_buf())
            .await
            .unwrap();

        // already authorized: no second write
        assert_eq!(again.cached_profile().unwrap().version(), first.version());
    }

    #[tokio::test]
    async fn test_two_peers_share_profile() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let dir = TempDir::new().unwrap();

        let laptop = node(&dht, &crypto, "laptop");
        let phone = node(&dht, &crypto, "phone");
        laptop.login("profile:alice", "alice", dir.path().join("a")).await.unwrap();
        let session = phone.login("profile:alice", "alice", dir.path().join("b")).await.unwrap();

        let profile = session.refresh().await.unwrap();
        assert_eq!(profile.other_peers(phone.peer_id()), vec![PeerId::new("laptop")]);
    }

    #[tokio::test]
    async fn test_configured_retry_limit_reaches_store() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, "laptop");
        config.transaction.max_retries = 0;
        config.transaction.backoff_base_ms = 0;

        let dht = Contended { inner: MemoryDht::new() };
        let (laptop, _events) = PeerNode::from_config(&config, Arc::new(dht), Arc::new(SignedEnvelope::generate()));

        // registering the peer is the first guarded write
        let result = laptop
            .login(&config.profile_location, "alice", config.root.clone())
            .await;
        assert_matches!(result.err(), Some(SyncError::VersionConflict { attempts: 1 }));
        assert!(laptop.session().is_err());
    }

    #[tokio::test]
    async fn test_disabled_notifications_send_nothing() {
        let dir = TempDir::new().unwrap();
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let mut config = config(&dir, "laptop");
        config.notification.enabled = false;
        std::fs::create_dir_all(&config.root).unwrap();

        let (laptop, _events) = PeerNode::from_config(&config, Arc::new(dht.clone()), crypto.clone());
        let phone = node(&dht, &crypto, "phone");
        let mut phone_inbox = dht.register_peer(phone.peer_id());
        laptop
            .login(&config.profile_location, "alice", config.root.clone())
            .await
            .unwrap();
        phone
            .login(&config.profile_location, "alice", dir.path().join("phone"))
            .await
            .unwrap();

        let path = config.root.join("a.txt");
        std::fs::write(&path, "a").unwrap();
        let ops = laptop.file_operations().unwrap();
        let report = ops
            .execute(ops.add(&path).unwrap(), Arc::new(crate::process::LoggingListener))
            .await;
        assert!(report.is_success());

        let latest = laptop.session().unwrap().store().latest().await.unwrap();
        assert!(latest.tree.find_by_path("/a.txt").is_ok());
        let received = tokio::time::timeout(Duration::from_millis(100), phone_inbox.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn test_operations_need_session() {
        let dht = MemoryDht::new();
        let crypto = Arc::new(SignedEnvelope::generate());
        let laptop = node(&dht, &crypto, "laptop");

        assert_matches!(laptop.file_operations().err(), Some(SyncError::SessionUnavailable));
        assert!(laptop.logout().is_none());
    }
}
