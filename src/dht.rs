//! # Overlay Interface
//!
//! The distributed hash table is an external collaborator. ShareTree only
//! needs keyed reads, version-guarded writes and best-effort direct
//! messages, captured by the [`Dht`] trait.
//!
//! [`MemoryDht`] is an in-process overlay shared by any number of peers. It
//! backs the test suite and the `demo` command.

use crate::crypto::PeerId;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque, equality-comparable marker assigned by the overlay on every
/// accepted write. Strictly increases per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted(Version),
    /// The stored version no longer matches; `current` is what is stored now.
    Rejected { current: Option<Version> },
}

/// A direct message as delivered to the addressed peer.
#[derive(Debug, Clone)]
pub struct DirectMessage {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Dht: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Store `value` only if the stored version still equals `expected`
    /// (`None` means "only if absent").
    async fn put_if_version(&self, key: &str, value: Vec<u8>, expected: Option<Version>) -> Result<PutOutcome>;

    /// Best-effort delivery, no acknowledgment.
    async fn send_direct(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, Versioned>,
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<DirectMessage>>,
}

/// In-process overlay; cloning shares the same storage.
#[derive(Clone, Default)]
pub struct MemoryDht {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and obtain the stream of messages addressed to it.
    pub fn register_peer(&self, peer: &PeerId) -> mpsc::UnboundedReceiver<DirectMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().inboxes.insert(peer.clone(), tx);
        rx
    }

    pub fn unregister_peer(&self, peer: &PeerId) {
        self.state.lock().inboxes.remove(peer);
    }

    pub fn version_of(&self, key: &str) -> Option<Version> {
        self.state.lock().entries.get(key).map(|v| v.version)
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    async fn put_if_version(&self, key: &str, value: Vec<u8>, expected: Option<Version>) -> Result<PutOutcome> {
        let mut state = self.state.lock();
        let current = state.entries.get(key).map(|v| v.version);

        if current != expected {
            debug!("Rejected put on {}: expected {:?}, stored {:?}", key, expected, current);
            return Ok(PutOutcome::Rejected { current });
        }

        let version = current.map_or(Version::INITIAL, |v| v.next());
        state.entries.insert(key.to_string(), Versioned { value, version });
        Ok(PutOutcome::Accepted(version))
    }

    async fn send_direct(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> Result<()> {
        let inbox = self
            .state
            .lock()
            .inboxes
            .get(to)
            .cloned()
            .ok_or_else(|| SyncError::Dht(format!("peer {} is not reachable", to)))?;

        inbox
            .send(DirectMessage {
                from: from.clone(),
                payload,
            })
            .map_err(|_| SyncError::Dht(format!("peer {} stopped listening", to)))
    }
}
