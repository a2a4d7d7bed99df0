//! Repository Module - on-disk node bundle
//!
//! A repository holds the node identity, its configuration (bootstrap peers,
//! swarm addresses, datastore, routing mode), the local block store and,
//! for private networks, the `swarm.key`.

mod swarm_key;

pub use swarm_key::{SwarmKey, SWARM_KEY_FILE};

use crate::identity::{IdentityConfig, IdentityError, NodeIdentity, PeerAddress};
use crate::plugins;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

pub const CONFIG_FILE: &str = "config";
pub const LOCK_FILE: &str = "repo.lock";
pub const REPO_VERSION: u32 = 1;

const TEMP_PREFIX: &str = "peerlink-repo";

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Failed to provision repository: {0}")]
    Provision(String),

    #[error("Failed to open repository at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Repository at {0} is locked by another node")]
    Locked(PathBuf),

    #[error("Repository at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Private network key error: {0}")]
    Fingerprint(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Routing participation of the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Full DHT server: stores and serves routing records
    #[default]
    Dht,
    /// Only queries the DHT
    DhtClient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressesConfig {
    pub swarm: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatastoreConfig {
    /// Datastore plugin name
    #[serde(rename = "Type")]
    pub kind: String,

    /// Path relative to the repository root
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoutingConfig {
    #[serde(rename = "Type")]
    pub mode: RoutingMode,
}

/// Repository configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepoConfig {
    pub version: u32,
    pub identity: IdentityConfig,
    /// Bootstrap peers as `/p2p/`-suffixed multiaddrs
    pub bootstrap: Vec<String>,
    pub addresses: AddressesConfig,
    pub datastore: DatastoreConfig,
    pub routing: RoutingConfig,
}

impl RepoConfig {
    /// Default configuration around a fresh identity
    pub fn init(identity: &NodeIdentity) -> Result<Self, RepoError> {
        Ok(Self {
            version: REPO_VERSION,
            identity: identity.to_config()?,
            bootstrap: vec![],
            addresses: AddressesConfig {
                swarm: vec!["/ip4/0.0.0.0/tcp/0".to_string()],
            },
            datastore: DatastoreConfig {
                kind: plugins::FLATFS.to_string(),
                path: "blocks".to_string(),
            },
            routing: RoutingConfig {
                mode: RoutingMode::Dht,
            },
        })
    }

    pub fn set_bootstrap_peers(&mut self, peers: &[PeerAddress]) {
        self.bootstrap = peers
            .iter()
            .flat_map(|p| p.to_p2p_addrs())
            .map(|a| a.to_string())
            .collect();
    }

    pub fn bootstrap_peers(&self) -> Result<Vec<PeerAddress>, String> {
        let addrs = parse_multiaddrs(&self.bootstrap)?;
        PeerAddress::from_p2p_addrs(&addrs).map_err(|e| e.to_string())
    }

    pub fn swarm_addresses(&self) -> Result<Vec<Multiaddr>, String> {
        parse_multiaddrs(&self.addresses.swarm)
    }
}

fn parse_multiaddrs(addrs: &[String]) -> Result<Vec<Multiaddr>, String> {
    addrs
        .iter()
        .map(|a| a.parse().map_err(|_| format!("invalid multiaddr {}", a)))
        .collect()
}

/// Options for provisioning a repository
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub bootstrap_peers: Vec<PeerAddress>,
    pub swarm_addresses: Vec<Multiaddr>,
    pub datastore: String,
    pub routing: RoutingMode,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            bootstrap_peers: vec![],
            swarm_addresses: vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                .with(Protocol::Tcp(0))],
            datastore: plugins::FLATFS.to_string(),
            routing: RoutingMode::Dht,
        }
    }
}

/// Location of a repository and who cleans it up
#[derive(Debug)]
pub enum RepoRoot {
    /// Removed from disk when dropped
    Ephemeral(TempDir),
    /// Left in place
    Persistent(PathBuf),
}

impl RepoRoot {
    pub fn path(&self) -> &Path {
        match self {
            RepoRoot::Ephemeral(dir) => dir.path(),
            RepoRoot::Persistent(path) => path,
        }
    }
}

/// Exclusive hold on a repository, released on drop
#[derive(Debug)]
struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    async fn acquire(repo_path: &Path) -> Result<Self, RepoError> {
        let path = repo_path.join(LOCK_FILE);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RepoError::Locked(repo_path.to_path_buf()))
            }
            Err(e) => Err(RepoError::Open {
                path: repo_path.to_path_buf(),
                reason: format!("failed to create lock: {}", e),
            }),
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// An opened repository
#[derive(Debug)]
pub struct Repository {
    path: PathBuf,
    config: RepoConfig,
    identity: NodeIdentity,
    swarm_key: Option<SwarmKey>,
    _lock: RepoLock,
}

impl Repository {
    /// Provision an ephemeral repository seeded with `bootstrap_peers`
    pub async fn provision(bootstrap_peers: &[PeerAddress]) -> Result<RepoRoot, RepoError> {
        Self::provision_with(ProvisionOptions {
            bootstrap_peers: bootstrap_peers.to_vec(),
            ..Default::default()
        })
        .await
    }

    /// Provision an ephemeral repository
    pub async fn provision_with(options: ProvisionOptions) -> Result<RepoRoot, RepoError> {
        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir()
            .map_err(|e| RepoError::Provision(format!("failed to get temp dir: {}", e)))?;

        Self::init(dir.path(), &options).await?;
        Ok(RepoRoot::Ephemeral(dir))
    }

    /// Initialize a repository at `path` (persistent)
    pub async fn init(path: &Path, options: &ProvisionOptions) -> Result<(), RepoError> {
        let config_path = path.join(CONFIG_FILE);
        if tokio::fs::try_exists(&config_path).await? {
            return Err(RepoError::Provision(format!(
                "repository already initialized at {}",
                path.display()
            )));
        }

        let identity = NodeIdentity::generate();
        let mut config = RepoConfig::init(&identity)?;
        config.set_bootstrap_peers(&options.bootstrap_peers);
        config.addresses.swarm = options
            .swarm_addresses
            .iter()
            .map(|a| a.to_string())
            .collect();
        config.datastore.kind = options.datastore.clone();
        config.routing.mode = options.routing;

        let data = serde_json::to_vec_pretty(&config)
            .map_err(|e| RepoError::Provision(format!("failed to serialize config: {}", e)))?;

        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| RepoError::Provision(format!("failed to create repo dir: {}", e)))?;
        tokio::fs::write(&config_path, data)
            .await
            .map_err(|e| RepoError::Provision(format!("failed to write config: {}", e)))?;

        tracing::info!(
            "Initialized repository {} for peer {}",
            path.display(),
            identity.peer_id()
        );
        Ok(())
    }

    /// Open and lock a provisioned repository
    pub async fn open(path: &Path) -> Result<Self, RepoError> {
        let config_path = path.join(CONFIG_FILE);
        let data = tokio::fs::read(&config_path)
            .await
            .map_err(|e| RepoError::Open {
                path: path.to_path_buf(),
                reason: format!("failed to read {}: {}", config_path.display(), e),
            })?;

        let lock = RepoLock::acquire(path).await?;

        let corrupt = |reason: String| RepoError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let config: RepoConfig =
            serde_json::from_slice(&data).map_err(|e| corrupt(e.to_string()))?;
        if config.version != REPO_VERSION {
            return Err(corrupt(format!("unsupported version {}", config.version)));
        }
        config.bootstrap_peers().map_err(corrupt)?;
        config.swarm_addresses().map_err(corrupt)?;

        let identity =
            NodeIdentity::from_config(&config.identity).map_err(|e| corrupt(e.to_string()))?;
        let swarm_key = SwarmKey::load(path).await?;

        tracing::debug!(
            "Opened repository {} (peer {}, private: {})",
            path.display(),
            identity.peer_id(),
            swarm_key.is_some()
        );

        Ok(Self {
            path: path.to_path_buf(),
            config,
            identity,
            swarm_key,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn swarm_key(&self) -> Option<&SwarmKey> {
        self.swarm_key.as_ref()
    }

    pub fn datastore_path(&self) -> PathBuf {
        self.path.join(&self.config.datastore.path)
    }

    pub fn bootstrap_peers(&self) -> Vec<PeerAddress> {
        // Validated in open()
        self.config.bootstrap_peers().unwrap_or_default()
    }

    pub fn swarm_addresses(&self) -> Vec<Multiaddr> {
        self.config.swarm_addresses().unwrap_or_default()
    }
}
