//! Local session state: who this peer is, where the shared tree lives on
//! disk, and the last profile this peer has seen.

use crate::crypto::{NodeKey, PeerId};
use crate::error::{Result, SyncError};
use crate::profile::{ProfileStore, UserProfile};
use crate::snapshot::to_tree_path;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub struct Session {
    peer_id: PeerId,
    root: PathBuf,
    store: ProfileStore,
    cached: RwLock<Option<UserProfile>>,
}

impl Session {
    pub fn new(peer_id: PeerId, root: PathBuf, store: ProfileStore) -> Self {
        Self {
            peer_id,
            root,
            store,
            cached: RwLock::new(None),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    /// The last profile this peer has seen, if any.
    pub fn cached_profile(&self) -> Option<UserProfile> {
        self.cached.read().clone()
    }

    /// Keep `profile` as the cached copy unless a newer one is already held.
    pub fn remember(&self, profile: &UserProfile) {
        let mut cached = self.cached.write();
        let newer = match cached.as_ref() {
            Some(current) => profile.version() > current.version(),
            None => true,
        };
        if newer {
            debug!("Session cache now at {:?}", profile.version());
            *cached = Some(profile.clone());
        }
    }

    /// Fetch the latest profile and cache it.
    pub async fn refresh(&self) -> Result<UserProfile> {
        let latest = self.store.latest().await?;
        self.remember(&latest);
        Ok(latest)
    }

    /// Local filesystem path of a node, resolved against the cached profile.
    pub fn resolve_path(&self, key: &NodeKey) -> Result<PathBuf> {
        let cached = self.cached.read();
        let profile = cached
            .as_ref()
            .ok_or_else(|| SyncError::not_found("cached profile"))?;
        profile.tree.local_path(&self.root, key)
    }

    /// Tree path (`/a/b`) of a local path below the session root.
    pub fn tree_path_of(&self, local: &Path) -> Result<String> {
        let relative = local.strip_prefix(&self.root).map_err(|_| {
            SyncError::InvalidOperation(format!(
                "{} is outside of {}",
                local.display(),
                self.root.display()
            ))
        })?;
        Ok(to_tree_path(relative))
    }
}

/// Holder of the (at most one) active session of a peer.
#[derive(Clone, Default)]
pub struct SessionSlot {
    inner: Arc<RwLock<Option<Arc<Session>>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Result<Arc<Session>> {
        self.inner.read().clone().ok_or(SyncError::SessionUnavailable)
    }

    pub fn set(&self, session: Arc<Session>) {
        *self.inner.write() = Some(session);
    }

    pub fn clear(&self) -> Option<Arc<Session>> {
        self.inner.write().take()
    }
}
