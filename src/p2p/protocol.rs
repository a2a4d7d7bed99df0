//! Block exchange protocol - request/response messages for fetching blocks

use crate::content::ContentId;
use serde::{Deserialize, Serialize};

pub const BLOCK_PROTOCOL: &str = "/peerlink/blocks/1.0.0";
pub const KAD_PROTOCOL: &str = "/peerlink/kad/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/peerlink/id/1.0.0";

/// Block requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRequest {
    /// Ask a peer for a block it may hold
    Want { cid: ContentId },
}

/// Block responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockResponse {
    /// The block bytes; the requester verifies them against `cid`
    Block { cid: ContentId, data: Vec<u8> },

    /// Peer does not hold the block
    DontHave { cid: ContentId },

    /// Peer failed to read its store
    Error { cid: ContentId, message: String },
}

impl BlockResponse {
    pub fn cid(&self) -> &ContentId {
        match self {
            BlockResponse::Block { cid, .. }
            | BlockResponse::DontHave { cid }
            | BlockResponse::Error { cid, .. } => cid,
        }
    }

    /// Extract the block if present and intact
    pub fn into_verified_block(self, expected: &ContentId) -> Option<Vec<u8>> {
        match self {
            BlockResponse::Block { cid, data } if cid == *expected && expected.verify(&data) => {
                Some(data)
            }
            _ => None,
        }
    }
}
