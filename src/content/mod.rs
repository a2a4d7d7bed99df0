//! Content Module - content addressing and local block storage
//!
//! Payloads are chunked into a DAG of blocks, each named by the CID of its
//! bytes, and kept in a [`Blockstore`].

mod blockstore;
mod cid;
pub mod dag;

pub use blockstore::{Blockstore, FsBlockstore, MemBlockstore};
pub use cid::{Codec, ContentId};
pub use dag::{Block, DagLayout, Manifest};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Unsupported CID version: {0}")]
    UnsupportedVersion(u64),

    #[error("Unsupported codec: 0x{0:x}")]
    UnsupportedCodec(u64),

    #[error("Unsupported multihash: 0x{0:x}")]
    UnsupportedHash(u64),

    #[error("Invalid DAG node: {0}")]
    Manifest(String),

    #[error("Block integrity check failed for {0}")]
    Integrity(ContentId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
