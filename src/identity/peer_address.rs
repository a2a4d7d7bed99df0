//! Peer address info - a peer id plus the addresses it can be reached on

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapParseError {
    #[error("Malformed peer address JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid multiaddr: {0}")]
    InvalidMultiaddr(String),

    #[error("Multiaddr has no /p2p/ component: {0}")]
    MissingPeerId(String),
}

/// JSON shape shared with other content-network implementations
#[derive(Serialize, Deserialize)]
struct AddrInfoJson {
    #[serde(rename = "ID")]
    id: String,

    #[serde(rename = "Addrs", default)]
    addrs: Vec<String>,
}

/// A peer identifier paired with its reachable addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddress {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Serialize as `{"ID": ..., "Addrs": [...]}`
    pub fn to_json(&self) -> Result<Vec<u8>, BootstrapParseError> {
        let raw = AddrInfoJson {
            id: self.peer_id.to_string(),
            addrs: self.addrs.iter().map(|a| a.to_string()).collect(),
        };
        Ok(serde_json::to_vec(&raw)?)
    }

    /// Parse the JSON blob exported by a bootstrap node
    pub fn from_json(bytes: &[u8]) -> Result<Self, BootstrapParseError> {
        let raw: AddrInfoJson = serde_json::from_slice(bytes)?;

        let peer_id: PeerId = raw
            .id
            .parse()
            .map_err(|_| BootstrapParseError::InvalidPeerId(raw.id.clone()))?;

        let addrs = raw
            .addrs
            .iter()
            .map(|a| {
                a.parse::<Multiaddr>()
                    .map_err(|_| BootstrapParseError::InvalidMultiaddr(a.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { peer_id, addrs })
    }

    /// Addresses with the `/p2p/<peer id>` suffix appended
    pub fn to_p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| {
                let mut addr = strip_peer_id(addr);
                addr.push(Protocol::P2p(self.peer_id));
                addr
            })
            .collect()
    }

    /// Group `/p2p/`-suffixed multiaddrs back into address infos
    pub fn from_p2p_addrs(addrs: &[Multiaddr]) -> Result<Vec<Self>, BootstrapParseError> {
        // BTreeMap keeps the output order stable
        let mut grouped: BTreeMap<PeerId, Vec<Multiaddr>> = BTreeMap::new();

        for addr in addrs {
            let peer_id = extract_peer_id(addr)
                .ok_or_else(|| BootstrapParseError::MissingPeerId(addr.to_string()))?;

            let transport = strip_peer_id(addr);
            let entry = grouped.entry(peer_id).or_default();
            if !transport.is_empty() {
                entry.push(transport);
            }
        }

        Ok(grouped
            .into_iter()
            .map(|(peer_id, addrs)| Self { peer_id, addrs })
            .collect())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.peer_id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", addr)?;
        }
        write!(f, "]}}")
    }
}

/// Extract peer ID from multiaddr
pub(crate) fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| {
        if let Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })
}

fn strip_peer_id(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect()
}
