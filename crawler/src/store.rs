//! Saving good nodes to disk.

use crate::node::Node;
use log::debug;
use nodescan_connection::{PeerProtocolVersion, PeerServices};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A good node as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// `host:port`.
    pub endpoint: String,
    /// Raw service bits from the peer's version message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ping_count: u64,
}

impl From<&Node> for NodeRecord {
    fn from(node: &Node) -> Self {
        let peer = node.peer();
        NodeRecord {
            endpoint: node.endpoint().to_string(),
            services: peer.and_then(|p| match p.services {
                PeerServices::Known(flags) => Some(flags.to_u64()),
                PeerServices::Unknown => None,
            }),
            protocol_version: peer.and_then(|p| match p.version {
                PeerProtocolVersion::Known(v) => Some(v),
                PeerProtocolVersion::Unknown => None,
            }),
            user_agent: peer.and_then(|p| p.user_agent.clone()),
            ping_count: node.ping_count(),
        }
    }
}

/// Errors from reading or writing a node file.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Node file IO error: {e}"),
            StoreError::Json(e) => write!(f, "Node file JSON error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Json(e) => Some(e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}

/// Durable storage for the good node list.
///
/// Called from the blocking thread pool, so implementations may do
/// synchronous IO.
pub trait NodeStore: Send + Sync {
    /// Replace whatever is stored at `path` with `records`.
    fn save(&self, path: &Path, records: &[NodeRecord]) -> Result<(), StoreError>;
}

/// Stores nodes as a pretty printed JSON array.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFileStore;

impl JsonFileStore {
    /// Read a file previously written by [`save`](NodeStore::save).
    pub fn load(path: &Path) -> Result<Vec<NodeRecord>, StoreError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl NodeStore for JsonFileStore {
    fn save(&self, path: &Path, records: &[NodeRecord]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Write next to the target and rename over it so readers never see
        // a half written file.
        let tmp = tmp_path(path);
        let json = serde_json::to_vec_pretty(records)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        debug!("Saved {} nodes to {}", records.len(), path.display());
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
