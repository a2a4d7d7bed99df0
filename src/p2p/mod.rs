//! P2P Networking Module using libp2p
//!
//! Runs the node: transport (optionally behind a private network key),
//! Kademlia routing, block exchange, bootstrap and local discovery.

mod behaviour;
mod bootstrap;
mod discovery;
mod event_loop;
mod node;
mod protocol;

pub use bootstrap::{
    start_bootstrap, BootstrapConfig, BootstrapError, BootstrapHandle, PeerConnector, PeerSource,
    BOOTSTRAP_PERIOD, CONNECTION_TIMEOUT,
};
pub use discovery::{start_discovery, PeerFoundHandler, DISCOVERY_INTERVAL, DISCOVERY_SERVICE_TAG};
pub use node::{Node, WeakNode};
pub use protocol::{BlockRequest, BlockResponse, BLOCK_PROTOCOL};

use crate::plugins::PluginError;
use crate::repo::RepoError;
use crate::content::ContentError;
use libp2p::PeerId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Failed to construct node: {0}")]
    Construction(String),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Repository error: {0}")]
    Repo(#[from] RepoError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Private network required but no swarm.key installed in {0}")]
    MissingFingerprint(PathBuf),

    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: PeerId, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("DHT error: {0}")]
    Dht(String),

    #[error("Local discovery is disabled in the node config")]
    DiscoveryDisabled,

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("Timeout")]
    Timeout,

    #[error("Node is shut down")]
    Shutdown,
}
