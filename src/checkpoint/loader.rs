use crate::checkpoint::TableCheckpoint;
use crate::checkpoint::writer::CHECKPOINT_SUFFIX;
use crate::error::LiveIndexError;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub fn load_checkpoint(path: &Path) -> Result<TableCheckpoint, LiveIndexError> {
    let bytes = fs::read(path)?;
    if bytes.len() < 32 {
        return Err(LiveIndexError::Checkpoint(format!(
            "checkpoint {} too small",
            path.display()
        )));
    }
    let (compressed, trailer) = bytes.split_at(bytes.len() - 32);
    if Sha256::digest(compressed).as_slice() != trailer {
        return Err(LiveIndexError::Checkpoint(format!(
            "checkpoint {} hash mismatch",
            path.display()
        )));
    }
    let decompressed = zstd::stream::decode_all(compressed)
        .map_err(|e| LiveIndexError::Checkpoint(format!("decompress: {e}")))?;
    rmp_serde::from_slice(&decompressed).map_err(|e| LiveIndexError::Decode(e.to_string()))
}

/// Checkpoint files of `table` in `dir`, oldest first.
pub fn list_checkpoints(dir: &Path, table: &str) -> Result<Vec<(u64, PathBuf)>, LiveIndexError> {
    let prefix = format!("{}_", hex::encode(table.as_bytes()));
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(position) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(CHECKPOINT_SUFFIX))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        out.push((position, entry.path()));
    }
    out.sort_by_key(|(position, _)| *position);
    Ok(out)
}

pub fn latest_checkpoint(dir: &Path, table: &str) -> Result<Option<PathBuf>, LiveIndexError> {
    Ok(list_checkpoints(dir, table)?.pop().map(|(_, path)| path))
}
