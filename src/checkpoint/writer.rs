use crate::checkpoint::TableCheckpoint;
use crate::error::LiveIndexError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub(crate) const CHECKPOINT_SUFFIX: &str = ".ckpt.zst";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub filename: String,
    pub table: String,
    pub position: u64,
    pub rows: usize,
    pub sha256_hex: String,
    pub created_at_micros: u64,
}

pub(crate) fn checkpoint_filename(table: &str, position: u64) -> String {
    format!("{}_{position:020}{CHECKPOINT_SUFFIX}", hex::encode(table.as_bytes()))
}

/// Writes `checkpoint` atomically into `dir`: MessagePack, zstd, then a
/// sha256 trailer over the compressed bytes.
pub fn write_checkpoint(checkpoint: &TableCheckpoint, dir: &Path) -> Result<CheckpointMeta, LiveIndexError> {
    fs::create_dir_all(dir)?;
    let encoded =
        rmp_serde::to_vec_named(checkpoint).map_err(|e| LiveIndexError::Encode(e.to_string()))?;
    let mut payload = zstd::stream::encode_all(encoded.as_slice(), 3)
        .map_err(|e| LiveIndexError::Checkpoint(format!("compress: {e}")))?;
    let trailer = Sha256::digest(&payload);
    payload.extend_from_slice(&trailer);

    let hash = Sha256::digest(&payload);
    let filename = checkpoint_filename(&checkpoint.table, checkpoint.position.get());
    let final_path = dir.join(&filename);
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&payload)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(&final_path).map_err(|e| LiveIndexError::Io(e.error))?;

    info!(
        table = %checkpoint.table,
        position = checkpoint.position.get(),
        rows = checkpoint.rows.len(),
        bytes = payload.len(),
        "checkpoint written"
    );
    Ok(CheckpointMeta {
        filename,
        table: checkpoint.table.clone(),
        position: checkpoint.position.get(),
        rows: checkpoint.rows.len(),
        sha256_hex: hex::encode(hash),
        created_at_micros: now_micros(),
    })
}

/// Removes all but the newest `keep` checkpoints of `table`.
pub fn prune_checkpoints(dir: &Path, table: &str, keep: usize) -> Result<usize, LiveIndexError> {
    let mut files = crate::checkpoint::loader::list_checkpoints(dir, table)?;
    if files.len() <= keep {
        return Ok(0);
    }
    let stale = files.len() - keep;
    for (_, path) in files.drain(..stale) {
        fs::remove_file(&path)?;
        debug!(table, path = %path.display(), "checkpoint pruned");
    }
    Ok(stale)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
