//! PeerLink Core - minimal content-addressed peer node
//!
//! A node provisions a repository (identity, config, block store and an
//! optional private network key), joins the overlay through a bootstrap
//! peer or acts as the bootstrap itself, publishes payloads under content
//! identifiers and resolves identifiers from whichever peer holds them.

pub mod artifacts;
pub mod content;
pub mod exchange;
pub mod identity;
pub mod p2p;
pub mod plugins;
pub mod repo;
pub mod role;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use content::ContentId;
pub use exchange::{publish, resolve, ContentHandle, PublishError, ResolveError};
pub use identity::{NodeIdentity, PeerAddress};
pub use p2p::Node;
pub use repo::{RepoRoot, Repository, SwarmKey};
pub use role::{NetworkMode, NodeRole};

/// Main error type for PeerLink operations
#[derive(Error, Debug)]
pub enum PeerLinkError {
    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    #[error("Bootstrap file error: {0}")]
    BootstrapParse(#[from] identity::BootstrapParseError),

    #[error("Content error: {0}")]
    Content(#[from] content::ContentError),

    #[error("Repository error: {0}")]
    Repo(#[from] repo::RepoError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] plugins::PluginError),

    #[error("P2P network error: {0}")]
    P2P(#[from] p2p::P2PError),

    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] p2p::BootstrapError),

    #[error("Publish error: {0}")]
    Publish(#[from] exchange::PublishError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] exchange::ResolveError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] artifacts::ArtifactError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeerLinkError>;

/// Runtime configuration for a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Enable mDNS for local network discovery
    pub enable_mdns: bool,

    /// Refuse to start without an installed swarm.key
    pub require_private_network: bool,

    pub bootstrap_period_secs: u64,
    pub connection_timeout_secs: u64,

    /// Deadline for a whole resolve
    pub resolve_timeout_secs: u64,

    /// mDNS re-query interval
    pub discovery_interval_secs: u64,

    pub idle_connection_timeout_secs: u64,

    /// Bound on a single block request
    pub request_timeout_secs: u64,

    /// How long to wait for the first listen address
    pub listen_timeout_secs: u64,

    /// Where resolved content is written
    pub output_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            require_private_network: false,
            bootstrap_period_secs: p2p::BOOTSTRAP_PERIOD.as_secs(),
            connection_timeout_secs: p2p::CONNECTION_TIMEOUT.as_secs(),
            resolve_timeout_secs: 30,
            discovery_interval_secs: p2p::DISCOVERY_INTERVAL.as_secs(),
            idle_connection_timeout_secs: 60,
            request_timeout_secs: 10,
            listen_timeout_secs: 10,
            output_dir: PathBuf::from("."),
        }
    }
}

impl NodeConfig {
    pub fn bootstrap_period(&self) -> Duration {
        Duration::from_secs(self.bootstrap_period_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_secs(self.listen_timeout_secs)
    }
}
