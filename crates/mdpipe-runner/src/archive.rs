//! Post-production merging of segmented engine outputs (trajectories,
//! energies, logs) into one file per replica, with an optional solvent
//! strip.

use crate::error::{PipelineError, Result};
use crate::guard::{self, GuardPolicy};
use crate::params::RunConfig;
use crate::stage::{
    rotate_log, run_command, CommandSpec, Executor, StageFailure, StageLayout, StageResult,
    StageStatus,
};
use crate::template::RenderContext;
use mdpipe_core::ensure_dir;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CONCATENATED_DIR: &str = "concatenated";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeSpec {
    pub extension: String,
    /// Without a tool the segments are joined byte for byte.
    #[serde(default)]
    pub tool: Option<CommandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StripSpec {
    /// Which merged extension gets stripped, e.g. `xtc`.
    pub extension: String,
    pub command: CommandSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSpec {
    pub stem: String,
    pub merges: Vec<MergeSpec>,
    #[serde(default)]
    pub strip: Option<StripSpec>,
}

/// Finds every segment of `<stem>.<ext>` in `dir`, ordered by segment
/// number. `<stem>.<ext>` is segment 0; `<stem>.partNNNN.<ext>` and
/// `<stem>NNNN.<ext>` carry their number. Ordering is numeric, never
/// lexicographic.
pub fn collect_segments(dir: &Path, stem: &str, ext: &str) -> Result<Vec<PathBuf>> {
    let mut found: BTreeMap<u64, PathBuf> = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let number = match segment_number(&name, stem, ext) {
            Some(n) => n,
            None => continue,
        };
        if let Some(previous) = found.insert(number, path.clone()) {
            return Err(PipelineError::Definition(format!(
                "segments {} and {} both claim number {}",
                previous.display(),
                path.display(),
                number
            )));
        }
    }
    Ok(found.into_values().collect())
}

fn segment_number(name: &str, stem: &str, ext: &str) -> Option<u64> {
    let middle = name.strip_prefix(stem)?.strip_suffix(ext)?.strip_suffix('.')?;
    if middle.is_empty() {
        return Some(0);
    }
    let digits = middle.strip_prefix(".part").unwrap_or(middle);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Writes the segments back to back into `output`. The output only appears
/// once every segment has been copied.
pub fn concat_bytes(segments: &[PathBuf], output: &Path) -> Result<()> {
    let tmp = output.with_extension(format!(
        "{}.partial",
        output
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default()
    ));
    {
        let mut out = fs::File::create(&tmp).map_err(|e| PipelineError::io(&tmp, e))?;
        for segment in segments {
            let mut input = fs::File::open(segment).map_err(|e| PipelineError::io(segment, e))?;
            io::copy(&mut input, &mut out).map_err(|e| PipelineError::io(segment, e))?;
        }
        out.sync_all().map_err(|e| PipelineError::io(&tmp, e))?;
    }
    fs::rename(&tmp, output).map_err(|e| PipelineError::io(output, e))
}

pub struct Archiver<'a> {
    pub config: &'a RunConfig,
    pub executor: &'a dyn Executor,
    pub policy: GuardPolicy,
}

impl<'a> Archiver<'a> {
    /// Merges the segments found in each source directory. `sources` pairs
    /// an optional replica label with the directory holding its segments.
    pub fn run(
        &self,
        stage: &str,
        spec: &ArchiveSpec,
        layout: &StageLayout,
        sources: &[(Option<String>, PathBuf)],
        budget: Option<Duration>,
    ) -> Result<StageResult> {
        let name = format!("{}-archive", stage);
        let out_dir = layout.stage_dir.join(CONCATENATED_DIR);
        let log_path = layout.logs.join(format!("{}.log", name));
        if guard::is_complete(&out_dir, self.policy) {
            info!(stage = %name, "archive already complete; skipping");
            return Ok(StageResult {
                stage: name,
                status: StageStatus::Skipped,
                resumed: false,
                artifacts: Vec::new(),
                log_path,
                failure: None,
            });
        }

        info!(stage = %name, sources = sources.len(), "pending -> running");
        ensure_dir(&out_dir).map_err(|e| PipelineError::io(&out_dir, e))?;
        ensure_dir(&layout.logs).map_err(|e| PipelineError::io(&layout.logs, e))?;
        let deadline = budget.map(|b| Instant::now() + b);
        let env = self.config.env_pairs();
        let mut artifacts = Vec::new();

        let mut base_ctx = RenderContext::from_config(self.config);
        base_ctx
            .set("STAGE_DIR", layout.stage_dir.to_string_lossy())
            .set("OUTPUT_DIR", layout.output.to_string_lossy());

        for (label, dir) in sources {
            let suffix = label.as_ref().map(|l| format!("_{}", l)).unwrap_or_default();
            let mut source_ctx = base_ctx.clone();
            source_ctx.set("REPLICA_DIR", label.clone().unwrap_or_else(|| ".".to_string()));
            for merge in &spec.merges {
                let segments = collect_segments(dir, &spec.stem, &merge.extension)?;
                if segments.is_empty() {
                    let expected = dir.join(format!("{}.{}", spec.stem, merge.extension));
                    return Ok(failed(name, log_path, StageFailure::ArtifactMissing(expected)));
                }
                let merged = out_dir.join(format!("{}{}.{}", spec.stem, suffix, merge.extension));
                debug!(output = %merged.display(), segments = segments.len(), "merging segments");

                match &merge.tool {
                    None => concat_bytes(&segments, &merged)?,
                    Some(tool) => {
                        let mut ctx = source_ctx.clone();
                        ctx.set_list(
                            "SEGMENTS",
                            segments.iter().map(|p| p.to_string_lossy().to_string()).collect(),
                        )
                        .set("OUTPUT", merged.to_string_lossy());
                        let step_log = layout
                            .logs
                            .join(format!("{}_{}{}.log", name, merge.extension, suffix));
                        rotate_log(&step_log)?;
                        if let Some(failure) = run_command(
                            self.executor, tool, &[], &ctx, &out_dir, &step_log, &env, deadline,
                        )? {
                            return Ok(failed(name, step_log, failure));
                        }
                        if !merged.exists() {
                            return Ok(failed(name, step_log, StageFailure::ArtifactMissing(merged)));
                        }
                    }
                }
                artifacts.push(merged.clone());

                if let Some(strip) = spec.strip.as_ref().filter(|s| s.extension == merge.extension) {
                    let stripped = out_dir.join(format!(
                        "{}{}_nosolvent.{}",
                        spec.stem, suffix, merge.extension
                    ));
                    let mut ctx = source_ctx.clone();
                    ctx.set("TRAJECTORY", merged.to_string_lossy())
                        .set("OUTPUT", stripped.to_string_lossy());
                    let step_log = layout.logs.join(format!("{}_strip{}.log", name, suffix));
                    rotate_log(&step_log)?;
                    if let Some(failure) = run_command(
                        self.executor,
                        &strip.command,
                        &[],
                        &ctx,
                        &out_dir,
                        &step_log,
                        &env,
                        deadline,
                    )? {
                        return Ok(failed(name, step_log, failure));
                    }
                    if !stripped.exists() {
                        return Ok(failed(name, step_log, StageFailure::ArtifactMissing(stripped)));
                    }
                    artifacts.push(stripped);
                }
            }
        }

        guard::mark_complete(&out_dir, &name, &artifacts)?;
        info!(stage = %name, artifacts = artifacts.len(), "running -> succeeded");
        Ok(StageResult {
            stage: name,
            status: StageStatus::Succeeded,
            resumed: false,
            artifacts,
            log_path,
            failure: None,
        })
    }
}

fn failed(stage: String, log_path: PathBuf, failure: StageFailure) -> StageResult {
    warn!(stage = %stage, reason = %failure, log = %log_path.display(), "running -> failed");
    StageResult {
        stage,
        status: StageStatus::Failed,
        resumed: false,
        artifacts: Vec::new(),
        log_path,
        failure: Some(failure),
    }
}
