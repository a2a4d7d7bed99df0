//! Files handed from the seed process to the client process
//!
//! The seed writes its address info to the bootstrap file and the published
//! identifier to the CID file; the client reads both.

use crate::content::ContentId;
use crate::identity::{BootstrapParseError, PeerAddress};

use std::path::{Path, PathBuf};
use thiserror::Error;

pub const BOOTSTRAP_FILE: &str = "IDBootstrapIPFS";
pub const CID_FILE: &str = "CID.txt";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed bootstrap file {path}: {source}")]
    Bootstrap {
        path: PathBuf,
        #[source]
        source: BootstrapParseError,
    },

    #[error("Malformed CID file {path}: {reason}")]
    Cid { path: PathBuf, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write the bootstrap node's address info, replacing any previous file
pub async fn write_bootstrap_file(path: &Path, peer: &PeerAddress) -> Result<(), ArtifactError> {
    let data = peer.to_json().map_err(|source| ArtifactError::Bootstrap {
        path: path.to_path_buf(),
        source,
    })?;

    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Replaced stale bootstrap file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(path)(e)),
    }

    tokio::fs::write(path, data).await.map_err(io_error(path))?;
    tracing::info!("Wrote bootstrap info for {} to {}", peer.peer_id, path.display());
    Ok(())
}

pub async fn read_bootstrap_file(path: &Path) -> Result<PeerAddress, ArtifactError> {
    let data = tokio::fs::read(path).await.map_err(io_error(path))?;
    PeerAddress::from_json(&data).map_err(|source| ArtifactError::Bootstrap {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `cid` as `{"/": "<cid>"}`
pub async fn write_cid_file(path: &Path, cid: &ContentId) -> Result<(), ArtifactError> {
    let data = serde_json::to_vec(cid).map_err(|e| ArtifactError::Cid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    tokio::fs::write(path, data).await.map_err(io_error(path))?;
    tracing::info!("Wrote CID {} to {}", cid, path.display());
    Ok(())
}

pub async fn read_cid_file(path: &Path) -> Result<ContentId, ArtifactError> {
    let data = tokio::fs::read(path).await.map_err(io_error(path))?;
    serde_json::from_slice(&data).map_err(|e| ArtifactError::Cid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Codec;
    use libp2p::PeerId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bootstrap_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(BOOTSTRAP_FILE);

        tokio::fs::write(&path, b"stale").await.unwrap();

        let peer = PeerAddress::new(
            PeerId::random(),
            vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        );
        write_bootstrap_file(&path, &peer).await.unwrap();

        assert_eq!(read_bootstrap_file(&path).await.unwrap(), peer);
    }

    #[tokio::test]
    async fn test_malformed_bootstrap_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(BOOTSTRAP_FILE);
        tokio::fs::write(&path, b"{\"ID\": 42}").await.unwrap();

        assert!(matches!(
            read_bootstrap_file(&path).await,
            Err(ArtifactError::Bootstrap { .. })
        ));
        assert!(matches!(
            read_bootstrap_file(&temp_dir.path().join("absent")).await,
            Err(ArtifactError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_cid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CID_FILE);
        let cid = ContentId::for_block(Codec::Raw, b"This is the Data I push into IPFS");

        write_cid_file(&path, &cid).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text, format!("{{\"/\":\"{}\"}}", cid));
        assert_eq!(read_cid_file(&path).await.unwrap(), cid);

        tokio::fs::write(&path, b"{\"/\": \"not-a-cid\"}").await.unwrap();
        assert!(matches!(
            read_cid_file(&path).await,
            Err(ArtifactError::Cid { .. })
        ));
    }
}
