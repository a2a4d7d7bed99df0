//! P2P Node implementation using libp2p

use super::behaviour::{build_swarm, SwarmSettings};
use super::bootstrap::{start_bootstrap, BootstrapConfig, BootstrapError, BootstrapHandle, PeerConnector};
use super::discovery::{run_discovery_listener, PeerFoundHandler};
use super::event_loop::{Command, EventLoop, SharedState};
use super::protocol::BlockResponse;
use super::P2PError;
use crate::content::{Blockstore, ContentId};
use crate::identity::PeerAddress;
use crate::plugins::load_plugins;
use crate::repo::{RepoRoot, Repository, SwarmKey};
use crate::NodeConfig;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 256;
const DISCOVERY_BUFFER: usize = 64;

/// Handle to a running node
///
/// Cheap to clone. The swarm itself lives in a background task that stops
/// when [`shutdown`](Node::shutdown) is called, when the token passed to
/// [`build`](Node::build) is cancelled, or when the last handle is dropped.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    peer_id: PeerId,
    command_tx: mpsc::Sender<Command>,
    connected: Arc<RwLock<HashSet<PeerId>>>,
    listen_rx: watch::Receiver<Vec<Multiaddr>>,
    discovered_tx: broadcast::Sender<PeerAddress>,
    blockstore: Arc<dyn Blockstore>,
    swarm_key: Option<SwarmKey>,
    config: NodeConfig,
    repo_path: PathBuf,
    cancel: CancellationToken,
    bootstrap_started: AtomicBool,
    discovery_started: AtomicBool,

    // Dropped in this order: lock released before the directory goes away
    _repo: Repository,
    _root: RepoRoot,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Node {
    /// Open the repository at `root` and bring the node online
    pub async fn build(
        ctx: &CancellationToken,
        root: RepoRoot,
        config: NodeConfig,
    ) -> Result<Self, P2PError> {
        let registry = load_plugins()?;
        let repo = Repository::open(root.path()).await?;

        let swarm_key = repo.swarm_key().copied();
        if config.require_private_network && swarm_key.is_none() {
            return Err(P2PError::MissingFingerprint(repo.path().to_path_buf()));
        }

        let blockstore = registry
            .datastore(&repo.config().datastore.kind)?
            .open(&repo.datastore_path())
            .await?;

        let peer_id = repo.identity().peer_id();
        let settings = SwarmSettings {
            routing: repo.config().routing.mode,
            psk: swarm_key.map(|k| k.to_psk()),
            enable_mdns: config.enable_mdns,
            discovery_interval: config.discovery_interval(),
            request_timeout: config.request_timeout(),
            idle_connection_timeout: config.idle_connection_timeout(),
        };

        tracing::info!(
            "Creating node {} (routing: {:?}, private: {})",
            peer_id,
            settings.routing,
            swarm_key.is_some()
        );

        let mut swarm = build_swarm(repo.identity().keypair().clone(), &settings)?;

        for addr in repo.swarm_addresses() {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| P2PError::Transport(format!("failed to listen on {}: {}", addr, e)))?;
        }

        // Known peers seed the routing table; dialing them is the bootstrap loop's job
        for peer in repo.bootstrap_peers() {
            for addr in peer.addrs {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer.peer_id, addr);
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (listen_tx, mut listen_rx) = watch::channel(Vec::new());
        let (discovered_tx, _) = broadcast::channel(DISCOVERY_BUFFER);
        let connected = Arc::new(RwLock::new(HashSet::new()));
        let cancel = ctx.child_token();

        let event_loop = EventLoop::new(
            swarm,
            command_rx,
            command_tx.downgrade(),
            blockstore.clone(),
            SharedState {
                connected: connected.clone(),
                listen_tx,
                discovered_tx: discovered_tx.clone(),
            },
            cancel.clone(),
        );
        tokio::spawn(event_loop.run());

        let listening = tokio::time::timeout(config.listen_timeout(), async {
            listen_rx.wait_for(|addrs| !addrs.is_empty()).await.is_ok()
        })
        .await;
        match listening {
            Ok(true) => {}
            Ok(false) => return Err(P2PError::Shutdown),
            Err(_) => {
                cancel.cancel();
                return Err(P2PError::Transport("no listen address came up".into()));
            }
        }

        let node = Self {
            inner: Arc::new(NodeInner {
                peer_id,
                command_tx,
                connected,
                listen_rx,
                discovered_tx,
                blockstore,
                swarm_key,
                config,
                repo_path: repo.path().to_path_buf(),
                cancel,
                bootstrap_started: AtomicBool::new(false),
                discovery_started: AtomicBool::new(false),
                _repo: repo,
                _root: root,
            }),
        };

        tracing::info!("Node {} listening on {:?}", peer_id, node.listen_addrs());
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Current listen addresses
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen_rx.borrow().clone()
    }

    /// Our own address info, as handed to other peers
    pub fn addr_info(&self) -> PeerAddress {
        PeerAddress::new(self.inner.peer_id, self.listen_addrs())
    }

    /// Fingerprint of the private network key, if this node runs on one
    pub fn pnet_fingerprint(&self) -> Option<String> {
        self.inner.swarm_key.as_ref().map(SwarmKey::fingerprint)
    }

    pub fn is_private(&self) -> bool {
        self.inner.swarm_key.is_some()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn repo_path(&self) -> &Path {
        &self.inner.repo_path
    }

    pub fn blockstore(&self) -> Arc<dyn Blockstore> {
        self.inner.blockstore.clone()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.inner.connected.read().len()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.connected.read().iter().copied().collect()
    }

    /// Connect to a peer, bounded by `timeout`
    pub async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> Result<(), P2PError> {
        if peer.peer_id == self.inner.peer_id {
            return Err(P2PError::ConnectionFailed {
                peer: peer.peer_id,
                reason: "refusing to dial self".into(),
            });
        }

        let peer = peer.clone();
        match tokio::time::timeout(
            timeout,
            self.request(|response| Command::Dial { peer, response }),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(P2PError::Timeout),
        }

        // A fresh connection is a good moment to fill the routing table
        self.dht_bootstrap();
        Ok(())
    }

    /// Announce that this node can serve `cid`
    pub async fn provide(&self, cid: ContentId) -> Result<(), P2PError> {
        self.request(|response| Command::StartProviding { cid, response })
            .await
    }

    /// Look up peers that announced `cid`
    pub async fn find_providers(&self, cid: ContentId) -> Result<Vec<PeerId>, P2PError> {
        self.request(|response| Command::GetProviders { cid, response })
            .await
    }

    /// Ask `peer` for the block named `cid`
    pub async fn request_block(
        &self,
        peer: PeerId,
        cid: ContentId,
    ) -> Result<BlockResponse, P2PError> {
        self.request(|response| Command::RequestBlock {
            peer,
            cid,
            response,
        })
        .await
    }

    /// Kick off a routing table refresh
    pub fn dht_bootstrap(&self) {
        if self.inner.command_tx.try_send(Command::DhtBootstrap).is_err() {
            tracing::debug!("Skipping DHT bootstrap: command queue full or closed");
        }
    }

    /// Start the bootstrap coordinator for this node
    ///
    /// With `Some(peer)` the node joins through `peer`; with `None` it is
    /// the bootstrap node itself.
    pub async fn bootstrap(
        &self,
        peer: Option<PeerAddress>,
    ) -> Result<BootstrapHandle, BootstrapError> {
        let config = match peer {
            Some(peer) => BootstrapConfig::with_peer(peer),
            None => BootstrapConfig::seed(),
        }
        .with_timing(
            self.inner.config.bootstrap_period(),
            self.inner.config.connection_timeout(),
        );
        config.validate()?;

        if self.inner.bootstrap_started.swap(true, Ordering::SeqCst) {
            return Err(BootstrapError::AlreadyRunning);
        }

        start_bootstrap(self.downgrade(), config, self.inner.cancel.child_token()).await
    }

    /// Advertise on the local segment and call `handler` for each peer found
    pub fn advertise(&self, tag: &str, handler: PeerFoundHandler) -> Result<(), P2PError> {
        if !self.inner.config.enable_mdns {
            return Err(P2PError::DiscoveryDisabled);
        }
        if self.inner.discovery_started.swap(true, Ordering::SeqCst) {
            return Err(P2PError::AlreadyRunning("local discovery"));
        }

        tracing::info!("Advertising {} on the local network as {}", self.inner.peer_id, tag);

        tokio::spawn(run_discovery_listener(
            self.inner.discovered_tx.subscribe(),
            handler,
            self.inner.cancel.child_token(),
            self.inner.peer_id,
        ));
        Ok(())
    }

    /// Stop the node; in-flight and later operations fail with `Shutdown`
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token cancelled when the node shuts down
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Handle for background tasks; it does not keep the node running
    pub fn downgrade(&self) -> WeakNode {
        WeakNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, P2PError>>) -> Command,
    ) -> Result<T, P2PError> {
        if self.is_shut_down() {
            return Err(P2PError::Shutdown);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(command(tx))
            .await
            .map_err(|_| P2PError::Shutdown)?;

        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(P2PError::Shutdown),
            result = rx => result.map_err(|_| P2PError::Shutdown)?,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer_id", &self.inner.peer_id)
            .field("repo_path", &self.inner.repo_path)
            .field("private", &self.is_private())
            .finish()
    }
}

/// Non-owning handle to a node
#[derive(Clone)]
pub struct WeakNode {
    inner: Weak<NodeInner>,
}

impl WeakNode {
    pub fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

impl std::fmt::Debug for WeakNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakNode")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[async_trait]
impl PeerConnector for WeakNode {
    fn connected_peer_count(&self) -> usize {
        self.upgrade().map_or(0, |node| node.connected_peer_count())
    }

    async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> Result<(), P2PError> {
        match self.upgrade() {
            Some(node) => node.connect(peer, timeout).await,
            None => Err(P2PError::Shutdown),
        }
    }
}

#[async_trait]
impl PeerConnector for Node {
    fn connected_peer_count(&self) -> usize {
        Node::connected_peer_count(self)
    }

    async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> Result<(), P2PError> {
        Node::connect(self, peer, timeout).await
    }
}
