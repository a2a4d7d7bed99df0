//! Seed and client roles
//!
//! The seed bootstraps the overlay, publishes a payload and writes the two
//! hand-off files. The client joins through the seed's address and
//! resolves what the seed published.

use crate::artifacts::{
    read_bootstrap_file, read_cid_file, write_bootstrap_file, write_cid_file, BOOTSTRAP_FILE,
    CID_FILE,
};
use crate::content::ContentId;
use crate::exchange::{publish, resolve, ContentHandle, ResolveError};
use crate::p2p::{BootstrapHandle, Node};
use crate::repo::{ProvisionOptions, Repository, SwarmKey};
use crate::{NodeConfig, Result};

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Payload the seed publishes unless told otherwise
pub const DEFAULT_PAYLOAD: &[u8] = b"This is the Data I push into IPFS";

/// Which overlay to join
#[derive(Debug, Clone, Default)]
pub enum NetworkMode {
    #[default]
    Public,
    /// Only peers holding the same key can connect
    Private(SwarmKey),
}

#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub bootstrap_file: PathBuf,
    pub cid_file: PathBuf,
    pub payload: Vec<u8>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            bootstrap_file: PathBuf::from(BOOTSTRAP_FILE),
            cid_file: PathBuf::from(CID_FILE),
            payload: DEFAULT_PAYLOAD.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub bootstrap_file: PathBuf,
    pub cid_file: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_file: PathBuf::from(BOOTSTRAP_FILE),
            cid_file: PathBuf::from(CID_FILE),
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeRole {
    Seed(SeedConfig),
    Client(ClientConfig),
}

#[derive(Debug)]
pub enum Outcome {
    Published(ContentId),
    Retrieved(ContentHandle),
    /// The client is up but the content could not be fetched
    NotRetrieved(ResolveError),
}

/// A running role; dropping it stops the node
#[derive(Debug)]
pub struct Session {
    pub node: Node,
    pub bootstrap: BootstrapHandle,
    pub outcome: Outcome,
}

impl Session {
    pub fn shutdown(&self) {
        self.bootstrap.stop();
        self.node.shutdown();
    }
}

/// Run `role` on a fresh ephemeral repository
pub async fn run(
    ctx: &CancellationToken,
    network: NetworkMode,
    role: NodeRole,
    config: NodeConfig,
) -> Result<Session> {
    run_with(ctx, network, role, config, ProvisionOptions::default()).await
}

/// Like [`run`], with control over how the repository is provisioned
///
/// Bootstrap peers in `provision` are replaced by the client's seed.
pub async fn run_with(
    ctx: &CancellationToken,
    network: NetworkMode,
    role: NodeRole,
    config: NodeConfig,
    mut provision: ProvisionOptions,
) -> Result<Session> {
    let seed_peer = match &role {
        NodeRole::Seed(_) => None,
        NodeRole::Client(client) => Some(read_bootstrap_file(&client.bootstrap_file).await?),
    };
    provision.bootstrap_peers = seed_peer.iter().cloned().collect();

    let root = Repository::provision_with(provision).await?;

    // Must land before the repository is opened
    if let NetworkMode::Private(key) = &network {
        key.install(root.path()).await?;
    }

    let config = NodeConfig {
        require_private_network: matches!(network, NetworkMode::Private(_)),
        ..config
    };
    let node = Node::build(ctx, root, config).await?;
    let bootstrap = node.bootstrap(seed_peer).await?;

    let outcome = match role {
        NodeRole::Seed(seed) => {
            write_bootstrap_file(&seed.bootstrap_file, &node.addr_info()).await?;

            let cid = publish(&node, &seed.payload).await?;
            write_cid_file(&seed.cid_file, &cid).await?;

            info!("Seed {} published {}", node.peer_id(), cid);
            Outcome::Published(cid)
        }
        NodeRole::Client(client) => {
            let cid = read_cid_file(&client.cid_file).await?;

            match resolve(&node, cid).await {
                Ok(handle) => {
                    info!("Retrieved {} into {}", cid, handle.path.display());
                    Outcome::Retrieved(handle)
                }
                Err(e) => {
                    warn!("Failed to retrieve {}: {}", cid, e);
                    Outcome::NotRetrieved(e)
                }
            }
        }
    };

    Ok(Session {
        node,
        bootstrap,
        outcome,
    })
}
