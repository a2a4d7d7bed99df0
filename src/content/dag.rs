//! Deterministic chunking of payloads into a block DAG
//!
//! Payloads are cut into fixed-size raw leaves. A payload that fits in a
//! single chunk is addressed by its leaf directly; anything larger gets
//! one or more layers of `dag-json` manifest nodes on top.

use super::{Codec, ContentError, ContentId};
use serde::{Deserialize, Serialize};

/// Leaf size (256 KiB)
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Maximum links per manifest node
pub const MAX_LINKS: usize = 174;

/// A block ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: ContentId,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(codec: Codec, data: Vec<u8>) -> Self {
        Self {
            cid: ContentId::for_block(codec, &data),
            data,
        }
    }
}

/// Link from a manifest to a child block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub cid: ContentId,
    /// Payload bytes reachable through this link
    pub size: u64,
}

/// Interior DAG node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub links: Vec<Link>,
    pub size: u64,
}

impl Manifest {
    pub fn encode(&self) -> Result<Vec<u8>, ContentError> {
        serde_json::to_vec(self).map_err(|e| ContentError::Manifest(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ContentError> {
        let manifest: Manifest =
            serde_json::from_slice(data).map_err(|e| ContentError::Manifest(e.to_string()))?;

        let total = manifest
            .links
            .iter()
            .try_fold(0u64, |acc, l| acc.checked_add(l.size))
            .ok_or_else(|| ContentError::Manifest("link sizes overflow u64".into()))?;
        if total != manifest.size {
            return Err(ContentError::Manifest(format!(
                "link sizes sum to {} but node declares {}",
                total, manifest.size
            )));
        }
        Ok(manifest)
    }
}

/// Result of chunking a payload
#[derive(Debug, Clone)]
pub struct DagLayout {
    pub root: ContentId,
    /// Every block of the DAG, leaves first, root last
    pub blocks: Vec<Block>,
}

/// Split `payload` into blocks and compute the root identifier
pub fn build(payload: &[u8]) -> Result<DagLayout, ContentError> {
    if payload.len() <= CHUNK_SIZE {
        let leaf = Block::new(Codec::Raw, payload.to_vec());
        return Ok(DagLayout {
            root: leaf.cid,
            blocks: vec![leaf],
        });
    }

    let mut blocks = Vec::new();
    let mut level: Vec<Link> = payload
        .chunks(CHUNK_SIZE)
        .map(|chunk| {
            let leaf = Block::new(Codec::Raw, chunk.to_vec());
            let link = Link {
                cid: leaf.cid,
                size: chunk.len() as u64,
            };
            blocks.push(leaf);
            link
        })
        .collect();

    // Collapse layers until a single root remains
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / MAX_LINKS + 1);
        for group in level.chunks(MAX_LINKS) {
            let manifest = Manifest {
                size: group.iter().map(|l| l.size).sum(),
                links: group.to_vec(),
            };
            let node = Block::new(Codec::DagJson, manifest.encode()?);
            next.push(Link {
                cid: node.cid,
                size: manifest.size,
            });
            blocks.push(node);
        }
        level = next;
    }

    Ok(DagLayout {
        root: level[0].cid,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_single_leaf() {
        let layout = build(b"This is the Data I push into IPFS").unwrap();

        assert_eq!(layout.blocks.len(), 1);
        assert_eq!(layout.root.codec(), Codec::Raw);
        assert!(layout.root.verify(b"This is the Data I push into IPFS"));
    }

    #[test]
    fn test_empty_payload() {
        let layout = build(&[]).unwrap();
        assert_eq!(layout.blocks.len(), 1);
        assert!(layout.blocks[0].data.is_empty());
    }

    #[test]
    fn test_large_payload_manifest() {
        let payload: Vec<u8> = (0..CHUNK_SIZE * 2 + 10).map(|i| (i % 251) as u8).collect();
        let layout = build(&payload).unwrap();

        // 3 leaves + 1 manifest
        assert_eq!(layout.blocks.len(), 4);
        assert_eq!(layout.root.codec(), Codec::DagJson);

        let root = layout.blocks.last().unwrap();
        assert_eq!(root.cid, layout.root);

        let manifest = Manifest::decode(&root.data).unwrap();
        assert_eq!(manifest.links.len(), 3);
        assert_eq!(manifest.size, payload.len() as u64);
        assert_eq!(manifest.links[2].size, 10);
    }

    #[test]
    fn test_deterministic() {
        let payload = vec![7u8; CHUNK_SIZE + 1];
        assert_eq!(build(&payload).unwrap().root, build(&payload).unwrap().root);

        let mut other = payload.clone();
        other[CHUNK_SIZE] = 8;
        assert_ne!(build(&payload).unwrap().root, build(&other).unwrap().root);
    }

    #[test]
    fn test_manifest_size_mismatch_rejected() {
        let manifest = Manifest {
            links: vec![Link {
                cid: ContentId::for_block(Codec::Raw, b"a"),
                size: 1,
            }],
            size: 5,
        };
        let encoded = manifest.encode().unwrap();
        assert!(Manifest::decode(&encoded).is_err());
    }

    #[test]
    fn test_manifest_size_overflow_rejected() {
        let link = |size| Link {
            cid: ContentId::for_block(Codec::Raw, b"a"),
            size,
        };
        let manifest = Manifest {
            links: vec![link(u64::MAX), link(2)],
            size: 1,
        };
        let encoded = manifest.encode().unwrap();
        assert!(matches!(
            Manifest::decode(&encoded),
            Err(ContentError::Manifest(_))
        ));
    }
}
