//! Network behaviour and swarm construction

use super::protocol::{BlockRequest, BlockResponse, BLOCK_PROTOCOL, IDENTIFY_PROTOCOL, KAD_PROTOCOL};
use super::P2PError;
use crate::repo::RoutingMode;

use futures::future::Either;
use libp2p::{
    core::upgrade::Version,
    identify,
    identity::Keypair,
    kad::{self, store::MemoryStore, Mode},
    mdns, noise,
    pnet::{PnetConfig, PreSharedKey},
    request_response::{self, ProtocolSupport},
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    tcp, yamux, StreamProtocol, Swarm, SwarmBuilder, Transport,
};
use std::time::Duration;

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct PeerLinkBehaviour {
    /// Kademlia DHT for peer routing and provider records
    pub kademlia: kad::Behaviour<MemoryStore>,

    /// Identify protocol for peer information
    pub identify: identify::Behaviour,

    /// mDNS for local network discovery (absent when disabled)
    pub mdns: Toggle<mdns::tokio::Behaviour>,

    /// Request-response for block exchange
    pub blocks: request_response::cbor::Behaviour<BlockRequest, BlockResponse>,
}

/// Parameters for building the swarm
#[derive(Clone)]
pub(crate) struct SwarmSettings {
    pub routing: RoutingMode,
    pub psk: Option<PreSharedKey>,
    pub enable_mdns: bool,
    pub discovery_interval: Duration,
    pub request_timeout: Duration,
    pub idle_connection_timeout: Duration,
}

impl PeerLinkBehaviour {
    fn new(keypair: &Keypair, settings: &SwarmSettings) -> Result<Self, P2PError> {
        let peer_id = keypair.public().to_peer_id();

        // Kademlia DHT
        let kademlia = {
            let store = MemoryStore::new(peer_id);
            let mut config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
            config.set_query_timeout(Duration::from_secs(60));
            let mut behaviour = kad::Behaviour::with_config(peer_id, store, config);
            behaviour.set_mode(Some(match settings.routing {
                RoutingMode::Dht => Mode::Server,
                RoutingMode::DhtClient => Mode::Client,
            }));
            behaviour
        };

        // Identify
        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("peerlink/{}", env!("CARGO_PKG_VERSION"))),
        );

        // mDNS
        let mdns = if settings.enable_mdns {
            let config = mdns::Config {
                query_interval: settings.discovery_interval,
                ..Default::default()
            };
            let behaviour = mdns::tokio::Behaviour::new(config, peer_id)
                .map_err(|e| P2PError::Construction(format!("mDNS: {}", e)))?;
            Some(behaviour)
        } else {
            None
        };

        // Block exchange
        let blocks = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new(BLOCK_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(settings.request_timeout),
        );

        Ok(Self {
            kademlia,
            identify,
            mdns: Toggle::from(mdns),
            blocks,
        })
    }
}

/// Build the swarm: TCP, optional pnet handshake, noise, yamux
pub(crate) fn build_swarm(
    keypair: Keypair,
    settings: &SwarmSettings,
) -> Result<Swarm<PeerLinkBehaviour>, P2PError> {
    let behaviour = PeerLinkBehaviour::new(&keypair, settings)?;
    let noise_config =
        noise::Config::new(&keypair).map_err(|e| P2PError::Construction(e.to_string()))?;
    let psk = settings.psk;
    let idle_timeout = settings.idle_connection_timeout;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_other_transport(move |_| {
            let base = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));

            // Peers without the same key fail the pnet handshake before noise
            let maybe_private = match psk {
                Some(psk) => base
                    .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
                    .map(|socket, _| Either::Left(socket))
                    .boxed(),
                None => base.map(|socket, _| Either::Right(socket)).boxed(),
            };

            maybe_private
                .upgrade(Version::V1Lazy)
                .authenticate(noise_config)
                .multiplex(yamux::Config::default())
        })
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_dns()
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(move |_| behaviour)
        .map_err(|e| P2PError::Construction(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
        .build();

    Ok(swarm)
}
