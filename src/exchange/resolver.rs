//! Content resolver
//!
//! Blocks are looked up locally first, then asked of connected peers, then
//! of whichever peers the DHT lists as providers. Every fetched block is
//! verified against its identifier and kept in the local store.

use crate::content::{Codec, ContentError, ContentId, Manifest};
use crate::p2p::{Node, P2PError};
use crate::NodeConfig;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use libp2p::PeerId;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Children of a manifest fetched at once
const FETCH_CONCURRENCY: usize = 8;

/// Pause between lookup rounds while the block is not found
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Resolving {cid} timed out after {after:?}")]
    Timeout { cid: ContentId, after: Duration },

    #[error("No peer provided {0} before the deadline")]
    NotFound(ContentId),

    #[error("Node shut down during resolve")]
    Cancelled,

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] P2PError),
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Deadline for the whole resolve, measured from the call
    pub timeout: Duration,

    /// Directory the content is written to, as `<dir>/<cid>`
    pub output_dir: PathBuf,
}

impl ResolveOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            timeout: config.resolve_timeout(),
            output_dir: config.output_dir.clone(),
        }
    }
}

/// Resolved content and where it was written
#[derive(Debug, Clone)]
pub struct ContentHandle {
    pub id: ContentId,
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Resolve `id` with the node's configured deadline and output directory
pub async fn resolve(node: &Node, id: ContentId) -> Result<ContentHandle, ResolveError> {
    resolve_with(node, id, ResolveOptions::from_config(node.config())).await
}

pub async fn resolve_with(
    node: &Node,
    id: ContentId,
    options: ResolveOptions,
) -> Result<ContentHandle, ResolveError> {
    let deadline = Instant::now() + options.timeout;
    let fetcher = Fetcher { node, deadline };
    let cancel = node.cancellation();

    debug!("Resolving {} (deadline {:?})", id, options.timeout);

    let data = tokio::select! {
        _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
        result = tokio::time::timeout_at(deadline, fetcher.fetch_dag(id)) => match result {
            Ok(data) => data?,
            Err(_) => {
                return Err(ResolveError::Timeout {
                    cid: id,
                    after: options.timeout,
                })
            }
        },
    };

    tokio::fs::create_dir_all(&options.output_dir).await?;
    let path = options.output_dir.join(id.to_string());
    tokio::fs::write(&path, &data).await?;

    info!("Resolved {} ({} bytes) to {}", id, data.len(), path.display());

    Ok(ContentHandle { id, path, data })
}

struct Fetcher<'a> {
    node: &'a Node,
    deadline: Instant,
}

impl<'a> Fetcher<'a> {
    /// Fetch the DAG under `cid` and reassemble its payload
    fn fetch_dag(&self, cid: ContentId) -> BoxFuture<'_, Result<Vec<u8>, ResolveError>> {
        async move {
            let block = self.fetch_block(cid).await?;

            match cid.codec() {
                Codec::Raw => Ok(block),
                Codec::DagJson => {
                    let manifest = Manifest::decode(&block)?;

                    let children: Vec<ContentId> =
                        manifest.links.iter().map(|link| link.cid).collect();
                    let parts: Vec<Vec<u8>> = stream::iter(children)
                        .map(|child| self.fetch_dag(child))
                        .buffered(FETCH_CONCURRENCY)
                        .try_collect()
                        .await?;

                    let data = parts.concat();
                    if data.len() as u64 != manifest.size {
                        return Err(ContentError::Manifest(format!(
                            "{} declares {} bytes but links hold {}",
                            cid,
                            manifest.size,
                            data.len()
                        ))
                        .into());
                    }
                    Ok(data)
                }
            }
        }
        .boxed()
    }

    async fn fetch_block(&self, cid: ContentId) -> Result<Vec<u8>, ResolveError> {
        let store = self.node.blockstore();
        if let Some(data) = store.get(&cid).await? {
            return Ok(data);
        }

        loop {
            let mut asked = HashSet::new();

            for peer in self.node.connected_peers() {
                asked.insert(peer);
                if let Some(data) = self.ask(peer, cid).await {
                    store.put(&cid, &data).await?;
                    return Ok(data);
                }
            }

            match self.node.find_providers(cid).await {
                Ok(providers) => {
                    for peer in providers {
                        if peer == self.node.peer_id() || !asked.insert(peer) {
                            continue;
                        }
                        if let Some(data) = self.ask(peer, cid).await {
                            store.put(&cid, &data).await?;
                            return Ok(data);
                        }
                    }
                }
                Err(P2PError::Shutdown) => return Err(ResolveError::Cancelled),
                Err(e) => debug!("Provider lookup for {} failed: {}", cid, e),
            }

            if Instant::now() + RETRY_DELAY >= self.deadline {
                return Err(ResolveError::NotFound(cid));
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    /// Ask one peer for a block; `None` on any miss
    async fn ask(&self, peer: PeerId, cid: ContentId) -> Option<Vec<u8>> {
        match self.node.request_block(peer, cid).await {
            Ok(response) => {
                let had_block = matches!(response, crate::p2p::BlockResponse::Block { .. });
                let block = response.into_verified_block(&cid);
                if had_block && block.is_none() {
                    warn!("Peer {} sent a block that does not match {}", peer, cid);
                }
                block
            }
            Err(e) => {
                debug!("Block request for {} to {} failed: {}", cid, peer, e);
                None
            }
        }
    }
}
