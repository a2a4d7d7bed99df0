//! Local network discovery
//!
//! mDNS runs inside the swarm; this module turns its findings into
//! connection attempts. Discovery and the bootstrap coordinator are
//! independent peer sources.

use super::{Node, P2PError};
use crate::identity::PeerAddress;

use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Service tag the node advertises under
///
/// Only used in logs. libp2p mDNS queries its own fixed service name, so
/// every mDNS-enabled node on the segment finds every other one whatever
/// tag it was started with.
pub const DISCOVERY_SERVICE_TAG: &str = "peerlink-discovery";

/// How often the segment is re-queried
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Callback invoked for each discovered peer
pub type PeerFoundHandler = Arc<dyn Fn(PeerAddress) + Send + Sync>;

/// Start local discovery, auto-connecting to every peer found
pub fn start_discovery(node: &Node) -> Result<(), P2PError> {
    let connector = node.downgrade();
    let handler: PeerFoundHandler = Arc::new(move |peer: PeerAddress| {
        let Some(node) = connector.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let timeout = node.config().connection_timeout();
            match node.connect(&peer, timeout).await {
                Ok(()) => debug!("Connected to discovered peer {}", peer.peer_id),
                Err(e) => warn!("Failed to connect to discovered peer {}: {}", peer.peer_id, e),
            }
        });
    });

    node.advertise(DISCOVERY_SERVICE_TAG, handler)
}

/// Forward discovered peers to `handler` until cancelled
pub(crate) async fn run_discovery_listener(
    mut rx: broadcast::Receiver<PeerAddress>,
    handler: PeerFoundHandler,
    cancel: CancellationToken,
    local_peer: PeerId,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            found = rx.recv() => match found {
                Ok(peer) if peer.peer_id == local_peer => {}
                Ok(peer) => {
                    debug!("Discovered peer {}", peer);
                    handler(peer);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Discovery listener skipped {} announcements", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!("Local discovery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{ProvisionOptions, Repository};
    use crate::NodeConfig;
    use parking_lot::Mutex;

    fn peer() -> PeerAddress {
        PeerAddress::new(
            PeerId::random(),
            vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        )
    }

    #[tokio::test]
    async fn test_listener_forwards_and_skips_self() {
        let (tx, rx) = broadcast::channel(8);
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        let handler: PeerFoundHandler = Arc::new(move |p| sink.lock().push(p));

        let local = PeerId::random();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_discovery_listener(rx, handler, cancel.clone(), local));

        let other = peer();
        tx.send(PeerAddress::new(local, vec![])).unwrap();
        tx.send(other.clone()).unwrap();
        drop(tx);

        task.await.unwrap();
        assert_eq!(*found.lock(), vec![other]);
    }

    #[tokio::test]
    async fn test_listener_stops_on_cancel() {
        let (_tx, rx) = broadcast::channel::<PeerAddress>(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_discovery_listener(
            rx,
            Arc::new(|_| {}),
            cancel.clone(),
            PeerId::random(),
        ));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_mdns_rejected() {
        let root = Repository::provision_with(ProvisionOptions {
            swarm_addresses: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
            ..Default::default()
        })
        .await
        .unwrap();
        let config = NodeConfig {
            enable_mdns: false,
            ..Default::default()
        };
        let node = Node::build(&CancellationToken::new(), root, config)
            .await
            .unwrap();

        assert!(matches!(
            start_discovery(&node),
            Err(P2PError::DiscoveryDisabled)
        ));
    }
}
