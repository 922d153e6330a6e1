//! Filesystem-only completion records that make the pipeline safe to rerun
//! after an interruption.

use crate::error::{PipelineError, Result};
use chrono::Utc;
use mdpipe_core::{atomic_write_json_pretty, sha256_file};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const COMPLETION_FILE: &str = "completed.json";
const COMPLETION_SCHEMA: &str = "completion_v1";

#[derive(Debug, Clone, Copy, Default)]
pub struct GuardPolicy {
    /// Re-hash every recorded artifact instead of only checking its size.
    pub verify_checksums: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRecord {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRecord {
    pub schema_version: String,
    pub stage: String,
    pub finished_at: String,
    pub artifacts: Vec<ArtifactRecord>,
}

pub fn completion_path(stage_dir: &Path) -> PathBuf {
    stage_dir.join(COMPLETION_FILE)
}

pub fn read_record(stage_dir: &Path) -> Option<CompletionRecord> {
    let path = completion_path(stage_dir);
    let raw = fs::read(&path).ok()?;
    match serde_json::from_slice::<CompletionRecord>(&raw) {
        Ok(record) if record.schema_version == COMPLETION_SCHEMA => Some(record),
        Ok(record) => {
            warn!(
                path = %path.display(),
                schema = %record.schema_version,
                "ignoring completion record with unknown schema"
            );
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable completion record");
            None
        }
    }
}

/// True when a completion record exists and every artifact it names is
/// still present and unchanged. A record only proves that an earlier run
/// believed it had finished; it says nothing about whether that run used
/// the current parameters.
pub fn is_complete(stage_dir: &Path, policy: GuardPolicy) -> bool {
    let record = match read_record(stage_dir) {
        Some(record) => record,
        None => return false,
    };
    for artifact in &record.artifacts {
        let path = stage_dir.join(&artifact.path);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => {
                warn!(stage = %record.stage, artifact = %path.display(), "recorded artifact is missing; stage will rerun");
                return false;
            }
        };
        if meta.len() != artifact.bytes {
            warn!(stage = %record.stage, artifact = %path.display(), "recorded artifact changed size; stage will rerun");
            return false;
        }
        if policy.verify_checksums {
            match sha256_file(&path) {
                Ok(digest) if digest == artifact.sha256 => {}
                _ => {
                    warn!(stage = %record.stage, artifact = %path.display(), "recorded artifact checksum mismatch; stage will rerun");
                    return false;
                }
            }
        }
    }
    debug!(stage = %record.stage, finished_at = %record.finished_at, "completion record verified");
    true
}

pub fn mark_complete(stage_dir: &Path, stage: &str, artifacts: &[PathBuf]) -> Result<CompletionRecord> {
    let mut records = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let meta = fs::metadata(artifact).map_err(|e| PipelineError::io(artifact, e))?;
        let sha256 = sha256_file(artifact).map_err(|e| PipelineError::io(artifact, e))?;
        let rel = artifact.strip_prefix(stage_dir).unwrap_or(artifact);
        records.push(ArtifactRecord {
            path: rel.to_string_lossy().to_string(),
            bytes: meta.len(),
            sha256,
        });
    }
    let record = CompletionRecord {
        schema_version: COMPLETION_SCHEMA.to_string(),
        stage: stage.to_string(),
        finished_at: Utc::now().to_rfc3339(),
        artifacts: records,
    };
    let path = completion_path(stage_dir);
    let value = serde_json::to_value(&record).map_err(|e| PipelineError::io(&path, e))?;
    atomic_write_json_pretty(&path, &value).map_err(|e| PipelineError::io(&path, e))?;
    Ok(record)
}

pub fn clear(stage_dir: &Path) -> Result<()> {
    let path = completion_path(stage_dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}
