//! Identity Module - node key material and peer addressing
//!
//! Every repository carries exactly one node identity. The key pair is
//! generated at provisioning time, persisted in the repository config and
//! never mutated afterwards.

mod peer_address;

pub use peer_address::{BootstrapParseError, PeerAddress};

use base64::Engine;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid private key encoding: {0}")]
    KeyEncoding(String),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Peer id {stored} does not match key (derived {derived})")]
    PeerIdMismatch { stored: String, derived: String },
}

/// Identity section of the repository config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(rename = "PeerID")]
    pub peer_id: String,

    /// Base64 of the protobuf-encoded private key
    #[serde(rename = "PrivKey")]
    pub priv_key: String,
}

/// Cryptographic identity of a node
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Wrap an existing key pair
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Restore the identity stored in a repository config
    pub fn from_config(config: &IdentityConfig) -> Result<Self, IdentityError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&config.priv_key)
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;

        let keypair = Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;

        let stored: PeerId = config
            .peer_id
            .parse()
            .map_err(|_| IdentityError::InvalidPeerId(config.peer_id.clone()))?;

        let identity = Self::from_keypair(keypair);
        if identity.peer_id != stored {
            return Err(IdentityError::PeerIdMismatch {
                stored: stored.to_string(),
                derived: identity.peer_id.to_string(),
            });
        }

        Ok(identity)
    }

    /// Export the identity for the repository config
    pub fn to_config(&self) -> Result<IdentityConfig, IdentityError> {
        let bytes = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| IdentityError::KeyEncoding(e.to_string()))?;

        Ok(IdentityConfig {
            peer_id: self.peer_id.to_string(),
            priv_key: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
