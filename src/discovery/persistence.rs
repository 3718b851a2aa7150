//! Node table snapshots on disk.
//!
//! The table is written to `discover.db` in the data directory so a
//! restart starts from the learned peers instead of the seeds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{P2pError, P2pResult};

use super::table::NodeRecord;

/// File name of the table snapshot inside the data directory.
pub const DB_FILE_NAME: &str = "discover.db";

/// Snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct NodeStore {
    version: u32,
    nodes: Vec<NodeRecord>,
}

/// Load a table snapshot. A missing file is an empty table.
pub async fn load_nodes(path: &Path) -> P2pResult<Vec<NodeRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut file = fs::File::open(path).await?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).await?;

    let store: NodeStore = serde_json::from_str(&contents)
        .map_err(|e| P2pError::Store(format!("corrupt node snapshot: {}", e)))?;

    tracing::info!(count = store.nodes.len(), path = ?path, "Loaded discovery snapshot");

    Ok(store.nodes)
}

/// Write a table snapshot atomically (temp file, then rename).
pub async fn save_nodes(path: &Path, nodes: &[NodeRecord]) -> P2pResult<()> {
    let store = NodeStore {
        version: 1,
        nodes: nodes.to_vec(),
    };

    let contents = serde_json::to_string_pretty(&store)
        .map_err(|e| P2pError::Store(format!("serialize node snapshot: {}", e)))?;

    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;

    tracing::debug!(count = nodes.len(), path = ?path, "Saved discovery snapshot");

    Ok(())
}
