//! # Cryptographic Operations
//!
//! This module provides the cryptographic pieces ShareTree relies on:
//! - Ed25519 identities for peers
//! - Ed25519 node keys, the stable identifiers of index nodes
//! - The [`CryptoProvider`] seam used to wrap profile payloads and
//!   notification messages before they leave the peer
//!
//! The core treats sealed data as an opaque blob. [`SignedEnvelope`] is the
//! provider shipped with the crate: it signs the payload with a key shared by
//! every peer of a profile and verifies the signature on open.

use crate::error::{Result, SyncError};
use base64::prelude::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Cryptographic identity for a peer.
///
/// The public key, hex encoded, is the peer id used for message addressing.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let identity_file: IdentityFile = toml::from_str(&content)?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&identity_file.secret_key),
        })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let identity_file = IdentityFile {
            secret_key: self.signing_key.to_bytes(),
        };

        let content = toml::to_string_pretty(&identity_file)?;
        std::fs::write(path, content)?;

        // Set restrictive permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(hex::encode(self.signing_key.verifying_key().as_bytes()))
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

/// Address of a peer on the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of an index node: the public half of a key pair
/// generated for that node alone. Never reused after deletion.
///
/// Serialized as a hex string so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey([u8; 32]);

impl NodeKey {
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        Self(SigningKey::generate(&mut csprng).verifying_key().to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Serialize for NodeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("node key must be 32 bytes"))?;
        Ok(Self(key))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

/// Wraps data before it is stored on or sent through the overlay.
pub trait CryptoProvider: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    payload: String,
    signature: String,
}

/// Signs every payload with a key shared by the peers of one profile.
#[derive(Clone)]
pub struct SignedEnvelope {
    signing_key: SigningKey,
}

impl SignedEnvelope {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        Self::new(SigningKey::generate(&mut csprng))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl CryptoProvider for SignedEnvelope {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let signature = self.signing_key.sign(plaintext);
        let envelope = Envelope {
            payload: BASE64_STANDARD.encode(plaintext),
            signature: BASE64_STANDARD.encode(signature.to_bytes()),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let envelope: Envelope = serde_json::from_slice(sealed)?;
        let payload = BASE64_STANDARD
            .decode(&envelope.payload)
            .map_err(|e| SyncError::Crypto(format!("invalid payload encoding: {}", e)))?;
        let signature_bytes = BASE64_STANDARD
            .decode(&envelope.signature)
            .map_err(|e| SyncError::Crypto(format!("invalid signature encoding: {}", e)))?;

        let sig_array: [u8; 64] = signature_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SyncError::Crypto("invalid signature length".to_string()))?;
        let signature = Signature::from_bytes(&sig_array);

        self.signing_key
            .verifying_key()
            .verify(&payload, &signature)
            .map_err(|_| SyncError::Crypto("signature verification failed".to_string()))?;

        Ok(payload)
    }
}
