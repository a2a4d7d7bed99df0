//! Swarm event loop
//!
//! The swarm is owned by a single task. [`Node`](super::Node) handles talk
//! to it through [`Command`]s and get answers on oneshot channels.

use super::behaviour::{PeerLinkBehaviour, PeerLinkBehaviourEvent};
use super::protocol::{BlockRequest, BlockResponse, KAD_PROTOCOL};
use super::P2PError;
use crate::content::{Blockstore, ContentId};
use crate::identity::PeerAddress;

use futures::StreamExt;
use libp2p::{
    identify,
    kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey},
    mdns,
    request_response::{self, OutboundRequestId, ResponseChannel},
    swarm::{dial_opts::DialOpts, DialError, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T, P2PError>>;

/// Commands sent to the swarm task
pub(crate) enum Command {
    /// Connect to a peer
    Dial { peer: PeerAddress, response: Reply<()> },

    /// Announce that we hold a block
    StartProviding { cid: ContentId, response: Reply<()> },

    /// Look up peers announcing a block
    GetProviders {
        cid: ContentId,
        response: Reply<Vec<PeerId>>,
    },

    /// Ask a peer for a block
    RequestBlock {
        peer: PeerId,
        cid: ContentId,
        response: Reply<BlockResponse>,
    },

    /// Answer an inbound block request
    RespondBlock {
        channel: ResponseChannel<BlockResponse>,
        response: BlockResponse,
    },

    /// Refresh the routing table
    DhtBootstrap,
}

/// State shared between the event loop and node handles
pub(crate) struct SharedState {
    pub connected: Arc<RwLock<HashSet<PeerId>>>,
    pub listen_tx: watch::Sender<Vec<Multiaddr>>,
    pub discovered_tx: broadcast::Sender<PeerAddress>,
}

pub(crate) struct EventLoop {
    swarm: Swarm<PeerLinkBehaviour>,
    command_rx: mpsc::Receiver<Command>,
    /// Weak so that dropping every node handle closes the loop
    command_tx: mpsc::WeakSender<Command>,
    blockstore: Arc<dyn Blockstore>,
    shared: SharedState,
    cancel: CancellationToken,

    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    pending_provides: HashMap<QueryId, Reply<()>>,
    pending_providers: HashMap<QueryId, (HashSet<PeerId>, Reply<Vec<PeerId>>)>,
    pending_requests: HashMap<OutboundRequestId, Reply<BlockResponse>>,
}

impl EventLoop {
    pub fn new(
        swarm: Swarm<PeerLinkBehaviour>,
        command_rx: mpsc::Receiver<Command>,
        command_tx: mpsc::WeakSender<Command>,
        blockstore: Arc<dyn Blockstore>,
        shared: SharedState,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            swarm,
            command_rx,
            command_tx,
            blockstore,
            shared,
            cancel,
            pending_dials: HashMap::new(),
            pending_provides: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_requests: HashMap::new(),
        }
    }

    /// Run until cancelled or every node handle is gone
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Node {} shutting down", self.swarm.local_peer_id());
                    break;
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All node handles dropped, stopping event loop");
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }

        // Pending replies are dropped here; waiters observe the shutdown
        self.shared.connected.write().clear();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, response } => self.dial(peer, response),

            Command::StartProviding { cid, response } => {
                let key = RecordKey::new(&cid.to_bytes());
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(query_id) => {
                        self.pending_provides.insert(query_id, response);
                    }
                    Err(e) => {
                        let _ = response.send(Err(P2PError::Dht(e.to_string())));
                    }
                }
            }

            Command::GetProviders { cid, response } => {
                let key = RecordKey::new(&cid.to_bytes());
                let query_id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.pending_providers
                    .insert(query_id, (HashSet::new(), response));
            }

            Command::RequestBlock {
                peer,
                cid,
                response,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .blocks
                    .send_request(&peer, BlockRequest::Want { cid });
                self.pending_requests.insert(request_id, response);
            }

            Command::RespondBlock { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .blocks
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Requester went away before the block response was sent");
                }
            }

            Command::DhtBootstrap => {
                if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                    debug!("DHT bootstrap skipped: {}", e);
                }
            }
        }
    }

    fn dial(&mut self, peer: PeerAddress, response: Reply<()>) {
        let peer_id = peer.peer_id;

        if self.swarm.is_connected(&peer_id) {
            let _ = response.send(Ok(()));
            return;
        }

        for addr in &peer.addrs {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(&peer_id, addr.clone());
        }

        let opts = DialOpts::peer_id(peer_id).addresses(peer.addrs).build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.entry(peer_id).or_default().push(response);
            }
            // A dial to this peer is already in flight
            Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer_id).or_default().push(response);
            }
            Err(e) => {
                let _ = response.send(Err(P2PError::ConnectionFailed {
                    peer: peer_id,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<PeerLinkBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.shared.listen_tx.send_modify(|addrs| addrs.push(address));
            }

            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.shared
                    .listen_tx
                    .send_modify(|addrs| addrs.retain(|a| *a != address));
            }

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                info!("Connected to {}", peer_id);
                self.shared.connected.write().insert(peer_id);
                for waiter in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = waiter.send(Ok(()));
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    info!("Disconnected from {}", peer_id);
                    self.shared.connected.write().remove(&peer_id);
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if self.swarm.is_connected(&peer_id) {
                    return;
                }
                warn!("Failed to connect to {}: {}", peer_id, error);
                for waiter in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = waiter.send(Err(P2PError::ConnectionFailed {
                        peer: peer_id,
                        reason: error.to_string(),
                    }));
                }
            }

            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!("Rejected incoming connection from {}: {}", send_back_addr, error);
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: PeerLinkBehaviourEvent) {
        match event {
            PeerLinkBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                let mut grouped: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in peers {
                    debug!("mDNS discovered: {} at {}", peer_id, addr);
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    grouped.entry(peer_id).or_default().push(addr);
                }

                for (peer_id, addrs) in grouped {
                    // No subscribers simply means discovery was never started
                    let _ = self
                        .shared
                        .discovered_tx
                        .send(PeerAddress::new(peer_id, addrs));
                }
            }

            PeerLinkBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(
                    "Identified peer {}: {} ({})",
                    peer_id, info.agent_version, info.protocol_version
                );

                // Only DHT servers belong in the routing table
                if info.protocols.iter().any(|p| p.as_ref() == KAD_PROTOCOL) {
                    for addr in info.listen_addrs {
                        self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                    }
                }
            }

            PeerLinkBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            }) => self.handle_query_result(id, result, step.last),

            PeerLinkBehaviourEvent::Blocks(request_response::Event::Message {
                peer, message, ..
            }) => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.serve_block(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },

            PeerLinkBehaviourEvent::Blocks(request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            }) => {
                debug!("Block request to {} failed: {}", peer, error);
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(P2PError::Protocol(error.to_string())));
                }
            }

            PeerLinkBehaviourEvent::Blocks(request_response::Event::InboundFailure {
                peer,
                error,
                ..
            }) => {
                debug!("Inbound block request from {} failed: {}", peer, error);
            }

            _ => {}
        }
    }

    fn handle_query_result(&mut self, id: QueryId, result: QueryResult, last: bool) {
        match result {
            QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_provides.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| P2PError::Dht(e.to_string())));
                }
            }

            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                if let Some((mut found, reply)) = self.pending_providers.remove(&id) {
                    found.extend(providers);
                    if found.is_empty() && !last {
                        self.pending_providers.insert(id, (found, reply));
                        return;
                    }

                    // Enough to start fetching. The query keeps running so it
                    // still knows how to reach the providers it reported.
                    let _ = reply.send(Ok(found.into_iter().collect()));
                }
            }

            QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord {
                ..
            })) => {
                if let Some((found, reply)) = self.pending_providers.remove(&id) {
                    let _ = reply.send(Ok(found.into_iter().collect()));
                }
            }

            QueryResult::GetProviders(Err(e)) => {
                if let Some((found, reply)) = self.pending_providers.remove(&id) {
                    if found.is_empty() {
                        let _ = reply.send(Err(P2PError::Dht(e.to_string())));
                    } else {
                        let _ = reply.send(Ok(found.into_iter().collect()));
                    }
                }
            }

            QueryResult::Bootstrap(result) => {
                debug!("DHT bootstrap step: {:?}", result.map(|ok| ok.num_remaining));
            }

            _ => {}
        }

        if last {
            if let Some((found, reply)) = self.pending_providers.remove(&id) {
                let _ = reply.send(Ok(found.into_iter().collect()));
            }
        }
    }

    /// Answer a block request from the local store without blocking the loop
    fn serve_block(
        &mut self,
        peer: PeerId,
        request: BlockRequest,
        channel: ResponseChannel<BlockResponse>,
    ) {
        let Some(command_tx) = self.command_tx.upgrade() else {
            return;
        };
        let blockstore = self.blockstore.clone();

        tokio::spawn(async move {
            let BlockRequest::Want { cid } = request;
            let response = match blockstore.get(&cid).await {
                Ok(Some(data)) => {
                    debug!("Serving block {} to {}", cid, peer);
                    BlockResponse::Block { cid, data }
                }
                Ok(None) => BlockResponse::DontHave { cid },
                Err(e) => {
                    warn!("Failed to read block {}: {}", cid, e);
                    BlockResponse::Error {
                        cid,
                        message: e.to_string(),
                    }
                }
            };

            let _ = command_tx
                .send(Command::RespondBlock { channel, response })
                .await;
        });
    }
}
