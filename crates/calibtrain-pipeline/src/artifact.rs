//! The per-run output artifact.
//!
//! Written once per successful run, to a temporary file first and then
//! renamed into place, so readers never see a partial artifact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use calibtrain_types::Result;

/// Default artifact file name.
pub const DEFAULT_ARTIFACT_FILE: &str = "CalibObjects.json";

/// Aggregated output of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibArtifact {
    pub execution_id: String,
    pub run_id: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub detectors: Vec<String>,
    pub plan: Vec<String>,
    pub events_processed: u64,
    pub stages: BTreeMap<String, serde_json::Value>,
    pub cleanup: serde_json::Value,
}

/// Handle to a written artifact.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    pub execution_id: uuid::Uuid,
    pub events_processed: u64,
}

/// Write `artifact` to `<dir>/<file_name>`, creating `dir` if needed.
pub async fn write_artifact(
    artifact: &CalibArtifact,
    dir: &Path,
    file_name: &str,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    let tmp = dir.join(format!(".{file_name}.tmp"));
    let json = serde_json::to_string_pretty(artifact)?;
    tokio::fs::write(&tmp, json).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    tracing::debug!(path = %path.display(), "Artifact written");
    Ok(path)
}

/// Read an artifact back.
pub async fn read_artifact(path: &Path) -> Result<CalibArtifact> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}
