//! Private network pre-shared key
//!
//! A node whose repository holds a `swarm.key` only talks to peers that
//! hold the same key. The key must be installed before the repository is
//! opened by [`Node::build`](crate::p2p::Node::build); installing it later
//! leaves the running node on the public overlay.

use super::RepoError;
use libp2p::pnet::PreSharedKey;
use rand::RngCore;
use std::fmt;
use std::path::Path;

pub const SWARM_KEY_FILE: &str = "swarm.key";

const KEY_LEN: usize = 32;

/// 256-bit shared secret for a private overlay
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SwarmKey(PreSharedKey);

impl SwarmKey {
    /// Generate a random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(PreSharedKey::new(bytes))
    }

    /// Parse the `/key/swarm/psk/1.0.0/` key file format
    pub fn parse(text: &str) -> Result<Self, RepoError> {
        text.parse::<PreSharedKey>()
            .map(Self)
            .map_err(|e| RepoError::Fingerprint(format!("invalid swarm key: {}", e)))
    }

    /// Render in the key file format
    pub fn encode(&self) -> String {
        self.0.to_string()
    }

    /// Read a standalone key file
    pub async fn read_file(path: &Path) -> Result<Self, RepoError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            RepoError::Fingerprint(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Write a standalone key file
    pub async fn write_file(&self, path: &Path) -> Result<(), RepoError> {
        tokio::fs::write(path, self.encode()).await.map_err(|e| {
            RepoError::Fingerprint(format!("failed to write {}: {}", path.display(), e))
        })
    }

    /// Install into a repository, replacing any existing key
    pub async fn install(&self, repo_path: &Path) -> Result<(), RepoError> {
        self.write_file(&repo_path.join(SWARM_KEY_FILE)).await?;
        tracing::info!(
            "Installed private network key {} in {}",
            self.fingerprint(),
            repo_path.display()
        );
        Ok(())
    }

    /// Load the key installed in a repository, if any
    pub async fn load(repo_path: &Path) -> Result<Option<Self>, RepoError> {
        let path = repo_path.join(SWARM_KEY_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepoError::Fingerprint(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub fn to_psk(&self) -> PreSharedKey {
        self.0
    }

    /// Public fingerprint of the key, safe to log
    pub fn fingerprint(&self) -> String {
        self.0.fingerprint().to_string()
    }
}

impl fmt::Debug for SwarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwarmKey(fingerprint={})", self.fingerprint())
    }
}
