//! Checkpoint directory layout
//!
//! ```text
//! output_dir/
//!   checkpoint-250/adapter_model/
//!   checkpoint-250/trainer_state.json
//!   checkpoint-500/adapter_model/
//!   checkpoint-500/trainer_state.json
//!   completed
//!   metrics.json
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name prefix of step checkpoint directories
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
/// Marker file written when training finishes
pub const COMPLETED_MARKER: &str = "completed";
/// Subdirectory of a checkpoint holding adapter weights
pub const ADAPTER_DIR: &str = "adapter_model";
/// File in each checkpoint directory holding the loop position
///
/// It is written last, so a checkpoint without it is incomplete.
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Result of scanning an output directory for earlier runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointLookup {
    /// Highest-numbered checkpoint directory holding a trainer state, if any
    pub last_checkpoint: Option<PathBuf>,
    /// Whether a previous run finished
    pub completed: bool,
}

/// Directory of the checkpoint for `step`
pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
}

/// Where adapter weights for `step` are saved
pub fn adapter_dir(output_dir: &Path, step: usize) -> PathBuf {
    checkpoint_dir(output_dir, step).join(ADAPTER_DIR)
}

/// Step checkpoints under `output_dir`, ordered by step
///
/// A missing output directory has no checkpoints.
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(output_dir)
        .with_context(|| format!("Failed to read output directory: {:?}", output_dir))?
    {
        let path = entry.context("Failed to read directory entry")?.path();
        if !path.is_dir() {
            continue;
        }
        let step = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|step| step.parse::<usize>().ok());
        if let Some(step) = step {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints)
}

/// Find where a previous run left off
///
/// Checkpoints interrupted before their trainer state was written are
/// skipped in favor of the previous complete one.
pub fn find_last_checkpoint(output_dir: &Path) -> Result<CheckpointLookup> {
    let completed = output_dir.join(COMPLETED_MARKER).exists();
    let mut last_checkpoint = None;
    for (step, path) in list_checkpoints(output_dir)?.into_iter().rev() {
        if path.join(TRAINER_STATE_FILE).is_file() {
            last_checkpoint = Some(path);
            break;
        }
        warn!("Skipping incomplete checkpoint at step {}: {:?}", step, path);
    }
    Ok(CheckpointLookup {
        last_checkpoint,
        completed,
    })
}

/// Delete the oldest checkpoints so at most `keep` remain
///
/// A `keep` of zero disables rotation.
pub fn rotate_checkpoints(output_dir: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    if keep == 0 {
        return Ok(Vec::new());
    }
    let checkpoints = list_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(keep);

    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to remove checkpoint: {:?}", path))?;
        info!("Removed old checkpoint {:?}", path);
        removed.push(path);
    }
    Ok(removed)
}

/// Touch the completion marker
pub fn mark_completed(output_dir: &Path) -> Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;
    let marker = output_dir.join(COMPLETED_MARKER);
    fs::write(&marker, b"").with_context(|| format!("Failed to write marker: {:?}", marker))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_output_dir_has_no_checkpoints() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lookup = find_last_checkpoint(&dir.path().join("absent")).expect("lookup");
        assert_eq!(lookup, CheckpointLookup::default());
    }

    #[test]
    fn test_checkpoints_sort_numerically() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for step in [1000, 250, 500] {
            fs::create_dir_all(adapter_dir(dir.path(), step)).expect("create checkpoint");
            fs::write(checkpoint_dir(dir.path(), step).join(TRAINER_STATE_FILE), b"{}")
                .expect("write state");
        }
        fs::create_dir_all(dir.path().join("checkpoint-final")).expect("create other dir");
        fs::write(dir.path().join("checkpoint-9999"), b"").expect("create file");

        let steps: Vec<usize> = list_checkpoints(dir.path())
            .expect("list")
            .into_iter()
            .map(|(step, _)| step)
            .collect();
        assert_eq!(steps, vec![250, 500, 1000]);

        let lookup = find_last_checkpoint(dir.path()).expect("lookup");
        assert_eq!(lookup.last_checkpoint, Some(checkpoint_dir(dir.path(), 1000)));
        assert!(!lookup.completed);
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for step in [10, 20, 30] {
            fs::create_dir_all(checkpoint_dir(dir.path(), step)).expect("create checkpoint");
        }

        let removed = rotate_checkpoints(dir.path(), 2).expect("rotate");
        assert_eq!(removed, vec![checkpoint_dir(dir.path(), 10)]);
        assert!(checkpoint_dir(dir.path(), 30).exists());
    }

    #[test]
    fn test_checkpoint_without_state_is_skipped() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for step in [2, 4] {
            fs::create_dir_all(adapter_dir(dir.path(), step)).expect("create checkpoint");
        }
        fs::write(checkpoint_dir(dir.path(), 2).join(TRAINER_STATE_FILE), b"{}")
            .expect("write state");

        let lookup = find_last_checkpoint(dir.path()).expect("lookup");
        assert_eq!(lookup.last_checkpoint, Some(checkpoint_dir(dir.path(), 2)));

        fs::remove_file(checkpoint_dir(dir.path(), 2).join(TRAINER_STATE_FILE))
            .expect("remove state");
        let lookup = find_last_checkpoint(dir.path()).expect("lookup");
        assert_eq!(lookup.last_checkpoint, None);
    }

    #[test]
    fn test_rotation_with_zero_limit_keeps_everything() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for step in [10, 20] {
            fs::create_dir_all(checkpoint_dir(dir.path(), step)).expect("create checkpoint");
        }

        let removed = rotate_checkpoints(dir.path(), 0).expect("rotate");
        assert!(removed.is_empty());
        assert!(checkpoint_dir(dir.path(), 10).exists());
        assert!(checkpoint_dir(dir.path(), 20).exists());
    }

    #[test]
    fn test_completed_marker() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        mark_completed(dir.path()).expect("mark");
        assert!(find_last_checkpoint(dir.path()).expect("lookup").completed);
    }
}
