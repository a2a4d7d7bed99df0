//! Block storage backends

use super::{ContentError, ContentId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Content-addressed block storage, safe for concurrent use
#[async_trait]
pub trait Blockstore: Send + Sync {
    /// Store a block. The data must hash to `cid`.
    async fn put(&self, cid: &ContentId, data: &[u8]) -> Result<(), ContentError>;

    /// Fetch a block, verifying its integrity
    async fn get(&self, cid: &ContentId) -> Result<Option<Vec<u8>>, ContentError>;

    async fn has(&self, cid: &ContentId) -> Result<bool, ContentError>;
}

/// Flat directory of blocks, sharded by the next-to-last two characters
/// of the CID string
pub struct FsBlockstore {
    root: PathBuf,
}

impl FsBlockstore {
    /// Open (creating if needed) a block directory
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ContentError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, cid: &ContentId) -> PathBuf {
        let name = cid.to_string();
        let end = name.len() - 1;
        self.root.join(&name[end - 2..end]).join(format!("{}.data", name))
    }
}

#[async_trait]
impl Blockstore for FsBlockstore {
    async fn put(&self, cid: &ContentId, data: &[u8]) -> Result<(), ContentError> {
        if !cid.verify(data) {
            return Err(ContentError::Integrity(*cid));
        }

        let path = self.block_path(cid);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Concurrent writers of the same block race on rename, never on content
        let tmp = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Stored block {} ({} bytes)", cid, data.len());
        Ok(())
    }

    async fn get(&self, cid: &ContentId) -> Result<Option<Vec<u8>>, ContentError> {
        let data = match tokio::fs::read(self.block_path(cid)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if !cid.verify(&data) {
            return Err(ContentError::Integrity(*cid));
        }
        Ok(Some(data))
    }

    async fn has(&self, cid: &ContentId) -> Result<bool, ContentError> {
        Ok(tokio::fs::try_exists(self.block_path(cid)).await?)
    }
}

/// In-memory block storage
#[derive(Default)]
pub struct MemBlockstore {
    blocks: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[async_trait]
impl Blockstore for MemBlockstore {
    async fn put(&self, cid: &ContentId, data: &[u8]) -> Result<(), ContentError> {
        if !cid.verify(data) {
            return Err(ContentError::Integrity(*cid));
        }
        self.blocks.write().entry(*cid).or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get(&self, cid: &ContentId) -> Result<Option<Vec<u8>>, ContentError> {
        Ok(self.blocks.read().get(cid).cloned())
    }

    async fn has(&self, cid: &ContentId) -> Result<bool, ContentError> {
        Ok(self.blocks.read().contains_key(cid))
    }
}
