//! # sharetree
//!
//! A shared file index kept consistent across all peers of one user.
//!
//! Every peer of a user works on one profile stored on a DHT-style overlay:
//! an index tree of the user's files plus the set of authorized peers.
//! Changes go through optimistic read-modify-write transactions, are built
//! as rollback-capable processes, and are announced to the other peers with
//! fire-and-forget notifications.
//!
//! ## Core Modules
//!
//! - [`fingerprint`] - Content fingerprints (BLAKE3)
//! - [`snapshot`] - Fingerprints of a whole local directory tree
//! - [`index`] - The shared index tree
//! - [`profile`] - The user profile and its optimistic-concurrency store
//! - [`process`] - Steps, sequences and rollback
//! - [`operations`] - Add, remove, move and update as processes
//! - [`notification`] - Sending and receiving change notifications
//! - [`node`] - One peer: session, operations and inbox
//! - [`dht`] / [`crypto`] - Overlay and cryptography seams
//!
//! ## Quick Start
//!
//! ```bash
//! # Configure this peer
//! sharetree init ~/Shared
//!
//! # Record and compare local state
//! sharetree snapshot ~/Shared
//! sharetree diff ~/Shared
//!
//! # Watch two in-memory peers talk
//! sharetree demo
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod node;
pub mod notification;
pub mod operations;
pub mod process;
pub mod profile;
pub mod session;
pub mod snapshot;

pub use config::Config;
pub use crypto::{Identity, NodeKey, PeerId};
pub use error::{Result, SyncError};
pub use node::PeerNode;
