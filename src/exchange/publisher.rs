//! Content publisher
//!
//! Ingestion is synchronous with the caller; the provide announcement runs
//! as a detached task that reports on its own channel.

use crate::content::{dag, ContentError, ContentId};
use crate::p2p::{Node, P2PError, WeakNode};

use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to ingest payload: {0}")]
    Ingest(#[from] ContentError),

    #[error("Failed to announce content: {0}")]
    Announce(P2PError),

    #[error("Announcement did not finish within {0:?}")]
    AnnounceTimeout(Duration),

    #[error("Announcement task ended without reporting")]
    AnnouncementDropped,
}

/// Outcome of a detached provide announcement
#[derive(Debug)]
pub struct Announcement {
    rx: oneshot::Receiver<Result<(), P2PError>>,
}

impl Announcement {
    /// Wait for the announcement to finish, up to `timeout`
    pub async fn wait(self, timeout: Duration) -> Result<(), PublishError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(PublishError::Announce(e)),
            Ok(Err(_)) => Err(PublishError::AnnouncementDropped),
            Err(_) => Err(PublishError::AnnounceTimeout(timeout)),
        }
    }
}

/// Ingest `payload` and announce it in the background
///
/// Returns as soon as the blocks are stored. Announcement failures are
/// logged, never returned.
pub async fn publish(node: &Node, payload: &[u8]) -> Result<ContentId, PublishError> {
    let (cid, _announcement) = publish_detached(node, payload).await?;
    Ok(cid)
}

/// Ingest `payload` and wait for the announcement, up to `timeout`
pub async fn publish_and_announce(
    node: &Node,
    payload: &[u8],
    timeout: Duration,
) -> Result<ContentId, PublishError> {
    let (cid, announcement) = publish_detached(node, payload).await?;
    announcement.wait(timeout).await?;
    Ok(cid)
}

/// Ingest `payload` and hand back the announcement for the caller to
/// await or drop
pub async fn publish_detached(
    node: &Node,
    payload: &[u8],
) -> Result<(ContentId, Announcement), PublishError> {
    let layout = dag::build(payload)?;
    let store = node.blockstore();

    for block in &layout.blocks {
        store.put(&block.cid, &block.data).await?;
    }

    let root = layout.root;
    info!(
        "Published {} ({} bytes, {} blocks)",
        root,
        payload.len(),
        layout.blocks.len()
    );

    // Root first so resolvers can start as early as possible
    let mut cids: Vec<ContentId> = layout.blocks.iter().map(|b| b.cid).collect();
    cids.retain(|c| *c != root);
    cids.insert(0, root);

    let (tx, rx) = oneshot::channel();
    let cancel = node.cancellation();
    let node = node.downgrade();
    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(P2PError::Shutdown),
            result = announce(&node, &cids) => result,
        };

        match &result {
            Ok(()) => debug!("Announced {} ({} blocks)", root, cids.len()),
            Err(e) => warn!("Failed to announce {}: {}", root, e),
        }
        let _ = tx.send(result);
    });

    Ok((root, Announcement { rx }))
}

async fn announce(node: &WeakNode, cids: &[ContentId]) -> Result<(), P2PError> {
    for cid in cids {
        node.upgrade().ok_or(P2PError::Shutdown)?.provide(*cid).await?;
    }
    Ok(())
}
