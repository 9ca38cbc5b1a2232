//! # Change Notifications
//!
//! After a mutating process commits, the peers authorized on the profile are
//! told about it with a small direct message. Delivery is fire-and-forget:
//! every recipient gets its own task, failures are logged per recipient and
//! nothing is retried. Peers that miss a message catch up on their next full
//! profile fetch.
//!
//! On receipt the message is resolved against the local copy of the profile,
//! the content fingerprint decides whether the local file system actually
//! needs attention, and a [`FileEvent`] is pushed to the event channel.

use crate::crypto::{CryptoProvider, NodeKey, PeerId};
use crate::dht::{Dht, DirectMessage};
use crate::error::{Result, SyncError};
use crate::fingerprint;
use crate::index::IndexNode;
use crate::session::{Session, SessionSlot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Add,
    Remove,
    Update,
    Move,
}

/// What changed. For `Remove` the parent and name describe where the node
/// was, so a receiver whose copy of the profile never saw the node can still
/// find it; for every other kind, where it is now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub kind: NotificationKind,
    pub node: NodeKey,
    pub parent: NodeKey,
    pub name: String,
}

impl NotificationMessage {
    pub fn for_node(kind: NotificationKind, node: &IndexNode) -> Result<Self> {
        let parent = node
            .parent
            .ok_or_else(|| SyncError::InvalidOperation("the root has no notifications".to_string()))?;
        Ok(Self {
            kind,
            node: node.key,
            parent,
            name: node.name.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEventKind {
    Added,
    Removed,
    Updated,
    Moved { from: PathBuf },
}

/// Local event for the file-sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    pub is_file: bool,
}

/// Sends notifications to other peers.
#[derive(Clone)]
pub struct NotificationDispatcher {
    me: PeerId,
    dht: Arc<dyn Dht>,
    crypto: Arc<dyn CryptoProvider>,
    enabled: bool,
}

impl NotificationDispatcher {
    pub fn new(me: PeerId, dht: Arc<dyn Dht>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            me,
            dht,
            crypto,
            enabled: true,
        }
    }

    /// A disabled dispatcher drops every message; peers then only learn
    /// about changes on their next profile fetch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Send `message` to every recipient except ourselves, without waiting.
    ///
    /// The returned handles may be dropped; they exist so callers can
    /// observe completion when they want to.
    pub fn dispatch(&self, recipients: &[PeerId], message: &NotificationMessage) -> Vec<JoinHandle<()>> {
        if !self.enabled {
            debug!("Notifications disabled, not sending {:?}", message.kind);
            return Vec::new();
        }
        let sealed = match serde_json::to_vec(message)
            .map_err(SyncError::from)
            .and_then(|plain| self.crypto.seal(&plain))
        {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("Could not encode {:?} notification: {}", message.kind, e);
                return Vec::new();
            }
        };

        recipients
            .iter()
            .filter(|peer| **peer != self.me)
            .map(|peer| {
                let dht = self.dht.clone();
                let from = self.me.clone();
                let to = peer.clone();
                let payload = sealed.clone();
                let kind = message.kind;
                tokio::spawn(async move {
                    match dht.send_direct(&from, &to, payload).await {
                        Ok(()) => debug!("Sent {:?} notification to {}", kind, to),
                        Err(e) => warn!("Could not notify {} about {:?}: {}", to, kind, e),
                    }
                })
            })
            .collect()
    }
}

/// Handles incoming notifications for whatever session is active.
pub struct NotificationHandler {
    sessions: SessionSlot,
    crypto: Arc<dyn CryptoProvider>,
    events: mpsc::UnboundedSender<FileEvent>,
}

impl NotificationHandler {
    pub fn new(
        sessions: SessionSlot,
        crypto: Arc<dyn CryptoProvider>,
        events: mpsc::UnboundedSender<FileEvent>,
    ) -> Self {
        Self {
            sessions,
            crypto,
            events,
        }
    }

    /// Consume `inbox`, handling each message on its own task.
    pub fn listen(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<DirectMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let handler = self.clone();
                tokio::spawn(async move {
                    let _ = handler.handle(message).await;
                });
            }
            debug!("Notification inbox closed");
        })
    }

    /// Handle one message. Returns the event raised, if any.
    ///
    /// Errors are logged here; callers can ignore them.
    pub async fn handle(&self, message: DirectMessage) -> Result<Option<FileEvent>> {
        let session = match self.sessions.current() {
            Ok(session) => session,
            Err(e) => {
                error!("Dropping notification from {}: no user seems to be logged in", message.from);
                return Err(e);
            }
        };

        let notification = match self.decode(&message.payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Dropping unreadable notification from {}: {}", message.from, e);
                return Err(e);
            }
        };
        debug!(
            "{:?} notification for {} received from {}",
            notification.kind, notification.node, message.from
        );

        let result = match notification.kind {
            NotificationKind::Remove => self.on_remove(&session, &notification).await,
            NotificationKind::Move => self.on_move(&session, &notification).await,
            NotificationKind::Add | NotificationKind::Update => {
                self.on_add_or_update(&session, &notification).await
            }
        };

        match result {
            Ok(Some(event)) => {
                info!("Raising {:?} for {}", event.kind, event.path.display());
                if self.events.send(event.clone()).is_err() {
                    debug!("No one is listening for file events");
                }
                Ok(Some(event))
            }
            Ok(None) => {
                debug!("Local state already matches {:?} of {}", notification.kind, notification.node);
                Ok(None)
            }
            Err(SyncError::NotFound(what)) => {
                warn!(
                    "{:?} notification for {} could not be resolved ({} not found)",
                    notification.kind, notification.node, what
                );
                Err(SyncError::NotFound(what))
            }
            Err(e) => {
                error!("Failed to handle {:?} notification: {}", notification.kind, e);
                Err(e)
            }
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<NotificationMessage> {
        let plain = self.crypto.open(payload)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    async fn on_remove(&self, session: &Session, message: &NotificationMessage) -> Result<Option<FileEvent>> {
        let cached = session
            .cached_profile()
            .ok_or_else(|| SyncError::not_found("cached profile"))?;
        let (path, known_as_file) = match cached.tree.get(&message.node) {
            Ok(node) => (cached.tree.local_path(session.root(), &message.node)?, Some(node.is_file())),
            // Our copy predates the node; the message still says where it was.
            Err(_) => (
                cached.tree.local_path(session.root(), &message.parent)?.join(&message.name),
                None,
            ),
        };

        if let Err(e) = session.refresh().await {
            warn!("Could not refresh profile after remove: {}", e);
        }

        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(FileEvent {
            kind: FileEventKind::Removed,
            is_file: known_as_file.unwrap_or_else(|| path.is_file()),
            path,
        }))
    }

    async fn on_add_or_update(&self, session: &Session, message: &NotificationMessage) -> Result<Option<FileEvent>> {
        let latest = session.refresh().await?;
        let node = latest.tree.get(&message.node)?;
        let path = latest.tree.local_path(session.root(), &message.node)?;

        if local_state_matches(&path, node)? {
            return Ok(None);
        }

        let kind = match message.kind {
            NotificationKind::Update => FileEventKind::Updated,
            _ => FileEventKind::Added,
        };
        Ok(Some(FileEvent {
            kind,
            path,
            is_file: node.is_file(),
        }))
    }

    async fn on_move(&self, session: &Session, message: &NotificationMessage) -> Result<Option<FileEvent>> {
        let from = session
            .cached_profile()
            .and_then(|cached| cached.tree.local_path(session.root(), &message.node).ok());

        let latest = session.refresh().await?;
        let node = latest.tree.get(&message.node)?;
        let path = latest.tree.local_path(session.root(), &message.node)?;

        if let Some(from) = from {
            if from != path && from.exists() {
                return Ok(Some(FileEvent {
                    kind: FileEventKind::Moved { from },
                    path,
                    is_file: node.is_file(),
                }));
            }
        }

        // Origin unknown or already gone: treat it like an add at the new place.
        if local_state_matches(&path, node)? {
            return Ok(None);
        }
        Ok(Some(FileEvent {
            kind: FileEventKind::Added,
            path,
            is_file: node.is_file(),
        }))
    }
}

/// Does the local file system already reflect `node` at `path`?
fn local_state_matches(path: &std::path::Path, node: &IndexNode) -> Result<bool> {
    if node.is_folder() {
        return Ok(path.is_dir());
    }
    if !path.is_file() {
        return Ok(false);
    }
    fingerprint::file_matches(path, node.fingerprint())
}
