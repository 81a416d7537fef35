//! Durable storage for the pending repeat target.
//!
//! A repeat restarts the whole run, so the target must outlive the launch
//! that requested it. The host writes it before relaunching and reads it back
//! to fast-forward.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trialflow_types::Result;
use uuid::Uuid;

use crate::runtime::REPEAT_TARGET_KEY;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatCheckpoint {
    /// Name of the experiment that requested the repeat. A runner ignores
    /// checkpoints written by any other experiment.
    pub experiment: String,
    pub target_step_id: String,
    pub run_id: Uuid,
    /// RFC 3339 timestamp of when the repeat was requested.
    pub recorded_at: String,
}

impl RepeatCheckpoint {
    pub fn new(experiment: impl Into<String>, target_step_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            experiment: experiment.into(),
            target_step_id: target_step_id.into(),
            run_id,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn checkpoint_path(root: &Path) -> PathBuf {
    root.join(format!("{REPEAT_TARGET_KEY}.json"))
}

/// Write the checkpoint to `<root>/trialflow_repeat_target.json`, creating
/// `root` if needed.
pub async fn save_repeat_target(checkpoint: &RepeatCheckpoint, root: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(root).await?;
    let path = checkpoint_path(root);
    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), target = %checkpoint.target_step_id, "Repeat target saved");
    Ok(path)
}

/// `Ok(None)` when nothing is pending.
pub async fn load_repeat_target(root: &Path) -> Result<Option<RepeatCheckpoint>> {
    let path = checkpoint_path(root);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

pub async fn clear_repeat_target(root: &Path) -> Result<()> {
    let path = checkpoint_path(root);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}
