//! One pipeline stage: stage inputs, render templates, run the engine,
//! decide success, record completion.

use crate::archive::{collect_segments, ArchiveSpec};
use crate::error::{PipelineError, Result};
use crate::guard::{self, GuardPolicy};
use crate::params::RunConfig;
use crate::replica::{Replica, ReplicaSet, ResourcePlan};
use crate::template::{render_args, render_file, render_str, RenderContext};
use chrono::Utc;
use mdpipe_core::{copy_file_into, ensure_dir};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAXH_SAFETY_FRACTION: f64 = 0.95;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    /// Log file stem; defaults to the program's file name.
    #[serde(default)]
    pub name: Option<String>,
}

impl CommandSpec {
    pub fn log_stem(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        Path::new(&self.program)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "command".to_string())
    }

    /// Every piece of text that goes through the renderer.
    pub fn template_texts(&self) -> Vec<&str> {
        let mut out = vec![self.program.as_str()];
        out.extend(self.args.iter().map(|s| s.as_str()));
        if let Some(stdin) = &self.stdin {
            out.push(stdin.as_str());
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    /// Relative to the pipeline definition file.
    pub source: PathBuf,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDescriptor {
    pub name: String,
    pub dir: String,
    #[serde(default)]
    pub prepare: Vec<CommandSpec>,
    pub command: CommandSpec,
    #[serde(default)]
    pub resume_args: Vec<String>,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    #[serde(default)]
    pub inputs: Vec<String>,
    pub artifact: String,
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub completion_marker: Option<String>,
    #[serde(default)]
    pub replicas: bool,
    #[serde(default)]
    pub archive: Option<ArchiveSpec>,
}

/// `<root>/<dir>/{logs,input,output}`. The directory name is the only state
/// the pipeline keeps between invocations besides the completion record.
#[derive(Debug, Clone)]
pub struct StageLayout {
    pub stage_dir: PathBuf,
    pub logs: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl StageLayout {
    pub fn new(root: &Path, dir: &str) -> Self {
        let stage_dir = root.join(dir);
        Self {
            logs: stage_dir.join("logs"),
            input: stage_dir.join("input"),
            output: stage_dir.join("output"),
            stage_dir,
        }
    }

    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.stage_dir, &self.logs, &self.input, &self.output] {
            ensure_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub log_path: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled,
    TimedOut(Duration),
}

/// Seam between the orchestrator and the external engines.
pub trait Executor {
    fn execute(&self, invocation: &Invocation) -> Result<ExitOutcome>;
}

/// Runs invocations as child processes, capturing stdout and stderr into
/// the invocation's log file and killing the child once its timeout passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn execute(&self, inv: &Invocation) -> Result<ExitOutcome> {
        if let Some(parent) = inv.log_path.parent() {
            ensure_dir(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let log = fs::File::create(&inv.log_path).map_err(|e| PipelineError::io(&inv.log_path, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| PipelineError::io(&inv.log_path, e))?;

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args);
        cmd.current_dir(&inv.cwd);
        cmd.envs(inv.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        cmd.stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        debug!(program = %inv.program, args = ?inv.args, cwd = %inv.cwd.display(), "spawning");
        let mut child = cmd
            .spawn()
            .map_err(|e| PipelineError::io(&inv.program, e))?;
        if let (Some(input), Some(mut stdin)) = (&inv.stdin, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    stop(&mut child);
                    return Err(PipelineError::io(&inv.program, e));
                }
            }
        }

        let started = Instant::now();
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| PipelineError::io(&inv.program, e))?
            {
                return Ok(match status.code() {
                    Some(code) => ExitOutcome::Exited(code),
                    None => ExitOutcome::Signaled,
                });
            }
            if let Some(limit) = inv.timeout {
                if started.elapsed() >= limit {
                    warn!(program = %inv.program, limit_secs = limit.as_secs(), "wall-clock budget exhausted; killing");
                    stop(&mut child);
                    return Ok(ExitOutcome::TimedOut(limit));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Kills and reaps `child` so no orphan outlives the step.
fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Skipped,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Skipped => "skipped",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageFailure {
    ExitCode { step: String, code: i32 },
    Signaled { step: String },
    TimedOut { step: String, limit_secs: u64 },
    MarkerMissing { marker: String },
    ArtifactMissing(PathBuf),
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::ExitCode { step, code } => write!(f, "{} exited with status {}", step, code),
            StageFailure::Signaled { step } => write!(f, "{} was terminated by a signal", step),
            StageFailure::TimedOut { step, limit_secs } => {
                write!(f, "{} exceeded its {} s budget", step, limit_secs)
            }
            StageFailure::MarkerMissing { marker } => {
                write!(f, "completion marker '{}' not found in log", marker)
            }
            StageFailure::ArtifactMissing(path) => {
                write!(f, "expected artifact {} was not produced", path.display())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub resumed: bool,
    pub artifacts: Vec<PathBuf>,
    pub log_path: PathBuf,
    pub failure: Option<StageFailure>,
}

impl StageResult {
    /// Converts a failed result into the matching pipeline error.
    pub fn into_error(self) -> Option<PipelineError> {
        let failure = self.failure?;
        Some(match failure {
            StageFailure::TimedOut { limit_secs, .. } => PipelineError::Timeout {
                stage: self.stage,
                limit_secs,
                log: self.log_path,
            },
            other => PipelineError::ExternalToolFailure {
                stage: self.stage,
                reason: other.to_string(),
                log: self.log_path,
            },
        })
    }
}

pub struct StageRunner<'a> {
    pub config: &'a RunConfig,
    pub executor: &'a dyn Executor,
    /// Directory that template sources are resolved against.
    pub definition_dir: &'a Path,
    pub policy: GuardPolicy,
}

impl<'a> StageRunner<'a> {
    /// Runs `desc` unless its completion record is already valid. Each input
    /// is copied from the first of `source_dirs` that holds it, normally the
    /// previous stage's output followed by the seed directory.
    pub fn run(
        &self,
        desc: &StageDescriptor,
        layout: &StageLayout,
        source_dirs: &[PathBuf],
        budget: Option<Duration>,
    ) -> Result<StageResult> {
        let main_log = layout.logs.join(format!("{}.log", desc.name));
        if guard::is_complete(&layout.stage_dir, self.policy) {
            info!(stage = %desc.name, "already complete; skipping");
            return Ok(StageResult {
                stage: desc.name.clone(),
                status: StageStatus::Skipped,
                resumed: false,
                artifacts: guard::read_record(&layout.stage_dir)
                    .map(|r| {
                        r.artifacts
                            .iter()
                            .map(|a| layout.stage_dir.join(&a.path))
                            .collect()
                    })
                    .unwrap_or_default(),
                log_path: main_log,
                failure: None,
            });
        }

        info!(stage = %desc.name, "pending -> running");
        let deadline = budget.map(|b| Instant::now() + b);
        layout.prepare()?;
        self.stage_inputs(desc, layout, source_dirs)?;

        let replicas = replica_set_for(self.config, desc)?;
        let plan = match &replicas {
            Some(set) => ResourcePlan::partition(&self.config.hardware, set.len())?,
            None => ResourcePlan::single(&self.config.hardware),
        };

        let resuming = self.is_resuming(desc, layout, replicas.as_ref());
        if resuming {
            info!(stage = %desc.name, "checkpoint found; resuming partial run");
        }
        let mut ctx = RenderContext::from_config(self.config);
        ctx.set("STAGE_DIR", layout.stage_dir.to_string_lossy())
            .set("INPUT_DIR", layout.input.to_string_lossy())
            .set("OUTPUT_DIR", layout.output.to_string_lossy())
            .set("MAXH", maxh(budget))
            .set("N_RANKS", plan.ranks.to_string())
            .set("OMP_THREADS", plan.omp_threads.to_string())
            .set("GPU_IDS", plan.gpu_ids.clone())
            .set_resuming(resuming);

        let env = self.env_for(&plan);
        let mut artifacts = Vec::new();

        match &replicas {
            None => {
                for spec in &desc.templates {
                    let src = self.definition_dir.join(&spec.source);
                    render_file(&src, &layout.input.join(&spec.target), &ctx)?;
                }
                for (idx, step) in desc.prepare.iter().enumerate() {
                    let log = layout.logs.join(format!("{}_{}.log", step.log_stem(), idx));
                    if let Some(failure) =
                        self.run_step(step, &[], &ctx, &layout.output, &log, &env, deadline)?
                    {
                        return Ok(self.failed(desc, log, failure));
                    }
                }
                artifacts.push(layout.output.join(&desc.artifact));
            }
            Some(set) => {
                let dirs = set.materialize(&layout.output, &layout.input)?;
                for (replica, dir) in set.replicas.iter().zip(dirs.iter()) {
                    let mut rctx = ctx.clone();
                    apply_replica_tokens(&mut rctx, replica);
                    for spec in &desc.templates {
                        let src = self.definition_dir.join(&spec.source);
                        render_file(&src, &dir.join(&spec.target), &rctx)?;
                    }
                    for (idx, step) in desc.prepare.iter().enumerate() {
                        let log = layout.logs.join(format!(
                            "{}_{}_{}.log",
                            step.log_stem(),
                            idx,
                            replica.dir_name
                        ));
                        if let Some(failure) =
                            self.run_step(step, &[], &rctx, dir, &log, &env, deadline)?
                        {
                            return Ok(self.failed(desc, log, failure));
                        }
                    }
                    artifacts.push(dir.join(&desc.artifact));
                }
                ctx.set_list("REPLICA_DIRS", set.dir_names());
            }
        }

        let extra = if resuming {
            desc.resume_args.clone()
        } else {
            Vec::new()
        };
        rotate_log(&main_log)?;
        if let Some(failure) =
            self.run_step(&desc.command, &extra, &ctx, &layout.output, &main_log, &env, deadline)?
        {
            return Ok(self.failed(desc, main_log, failure));
        }

        let mut produced = Vec::with_capacity(artifacts.len());
        for expected in &artifacts {
            match resolve_artifact(expected)? {
                Some(path) => produced.push(path),
                None => {
                    return Ok(self.failed(
                        desc,
                        main_log,
                        StageFailure::ArtifactMissing(expected.clone()),
                    ))
                }
            }
        }
        let artifacts = produced;
        if let Some(marker) = &desc.completion_marker {
            if !log_contains(&main_log, marker)? {
                return Ok(self.failed(
                    desc,
                    main_log,
                    StageFailure::MarkerMissing {
                        marker: marker.clone(),
                    },
                ));
            }
        }

        guard::mark_complete(&layout.stage_dir, &desc.name, &artifacts)?;
        info!(stage = %desc.name, artifacts = artifacts.len(), "running -> succeeded");
        Ok(StageResult {
            stage: desc.name.clone(),
            status: StageStatus::Succeeded,
            resumed: resuming,
            artifacts,
            log_path: main_log,
            failure: None,
        })
    }

    fn stage_inputs(&self, desc: &StageDescriptor, layout: &StageLayout, source_dirs: &[PathBuf]) -> Result<()> {
        for name in &desc.inputs {
            let src = source_dirs
                .iter()
                .map(|dir| dir.join(name))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| PipelineError::MissingStageInput {
                    stage: desc.name.clone(),
                    path: source_dirs
                        .first()
                        .map(|dir| dir.join(name))
                        .unwrap_or_else(|| PathBuf::from(name)),
                })?;
            copy_file_into(&src, &layout.input).map_err(|e| PipelineError::io(&src, e))?;
            debug!(stage = %desc.name, input = %src.display(), "staged input");
        }
        Ok(())
    }

    fn is_resuming(&self, desc: &StageDescriptor, layout: &StageLayout, replicas: Option<&ReplicaSet>) -> bool {
        let checkpoint = match &desc.checkpoint {
            Some(c) => c,
            None => return false,
        };
        match replicas.and_then(|set| set.replicas.first()) {
            Some(first) => layout.output.join(&first.dir_name).join(checkpoint).is_file(),
            None => layout.output.join(checkpoint).is_file(),
        }
    }

    fn env_for(&self, plan: &ResourcePlan) -> Vec<(String, String)> {
        let mut env = self.config.env_pairs();
        env.push(("OMP_NUM_THREADS".to_string(), plan.omp_threads.to_string()));
        env
    }

    #[allow(clippy::too_many_arguments)]
    fn run_step(
        &self,
        step: &CommandSpec,
        extra_args: &[String],
        ctx: &RenderContext,
        cwd: &Path,
        log_path: &Path,
        env: &[(String, String)],
        deadline: Option<Instant>,
    ) -> Result<Option<StageFailure>> {
        run_command(self.executor, step, extra_args, ctx, cwd, log_path, env, deadline)
    }

    fn failed(&self, desc: &StageDescriptor, log_path: PathBuf, failure: StageFailure) -> StageResult {
        warn!(stage = %desc.name, reason = %failure, log = %log_path.display(), "running -> failed");
        StageResult {
            stage: desc.name.clone(),
            status: StageStatus::Failed,
            resumed: false,
            artifacts: Vec::new(),
            log_path,
            failure: Some(failure),
        }
    }
}

/// The replica set a stage fans out over, or `None` for a single-run stage.
pub fn replica_set_for(config: &RunConfig, desc: &StageDescriptor) -> Result<Option<ReplicaSet>> {
    if !desc.replicas {
        return Ok(None);
    }
    let params = config
        .replicas
        .as_ref()
        .ok_or_else(|| PipelineError::MissingParameter {
            key: "N_REPLICA".to_string(),
            context: format!("replica stage '{}'", desc.name),
        })?;
    Ok(Some(ReplicaSet::build(
        params.count,
        &params.ladder,
        params.method,
        config.temperature_k,
    )?))
}

/// The file standing for `expected`: the file itself, or else its newest
/// continuation segment (`prod.part0002.gro` for `prod.gro`).
fn resolve_artifact(expected: &Path) -> Result<Option<PathBuf>> {
    if expected.exists() {
        return Ok(Some(expected.to_path_buf()));
    }
    let (dir, stem, ext) = match (expected.parent(), expected.file_stem(), expected.extension()) {
        (Some(dir), Some(stem), Some(ext)) => (dir, stem.to_string_lossy(), ext.to_string_lossy()),
        _ => return Ok(None),
    };
    Ok(collect_segments(dir, &stem, &ext)?.pop())
}

/// Scans `log` for `marker` one line at a time.
fn log_contains(log: &Path, marker: &str) -> Result<bool> {
    let file = fs::File::open(log).map_err(|e| PipelineError::io(log, e))?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| PipelineError::io(log, e))?;
        if read == 0 {
            return Ok(false);
        }
        if String::from_utf8_lossy(&line).contains(marker) {
            return Ok(true);
        }
    }
}

/// Renders one command and hands it to the executor. `Ok(None)` means the
/// command exited cleanly.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_command(
    executor: &dyn Executor,
    step: &CommandSpec,
    extra_args: &[String],
    ctx: &RenderContext,
    cwd: &Path,
    log_path: &Path,
    env: &[(String, String)],
    deadline: Option<Instant>,
) -> Result<Option<StageFailure>> {
    let label = step.log_stem();
    let program = render_str(&step.program, ctx, &label)?;
    let mut args = render_args(&step.args, ctx, &label)?;
    args.extend(render_args(extra_args, ctx, &label)?);
    let stdin = step
        .stdin
        .as_ref()
        .map(|s| render_str(s, ctx, &label))
        .transpose()?;

    let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    if timeout == Some(Duration::ZERO) {
        return Ok(Some(StageFailure::TimedOut {
            step: label,
            limit_secs: 0,
        }));
    }
    let invocation = Invocation {
        program,
        args,
        cwd: cwd.to_path_buf(),
        env: env.to_vec(),
        stdin,
        log_path: log_path.to_path_buf(),
        timeout,
    };
    Ok(match executor.execute(&invocation)? {
        ExitOutcome::Exited(0) => None,
        ExitOutcome::Exited(code) => Some(StageFailure::ExitCode { step: label, code }),
        ExitOutcome::Signaled => Some(StageFailure::Signaled { step: label }),
        ExitOutcome::TimedOut(limit) => Some(StageFailure::TimedOut {
            step: label,
            limit_secs: limit.as_secs(),
        }),
    })
}

pub(crate) fn apply_replica_tokens(ctx: &mut RenderContext, replica: &Replica) {
    ctx.set("REPLICA_INDEX", replica.index.to_string())
        .set("REPLICA_DIR", replica.dir_name.clone())
        .set("REPLICA_TEMPERATURE_K", format!("{:.6}", replica.temperature_k))
        .set("REPLICA_LAMBDA", format!("{:.6}", replica.lambda));
}

fn maxh(budget: Option<Duration>) -> String {
    match budget {
        Some(b) => format!("{:.4}", b.as_secs_f64() / 3600.0 * MAXH_SAFETY_FRACTION),
        None => "-1".to_string(),
    }
}

/// Keeps the previous attempt's log next to the new one instead of
/// overwriting it.
pub(crate) fn rotate_log(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "log".to_string());
    let rotated = path.with_file_name(format!(
        "{}.{}.log",
        stem,
        Utc::now().format("%Y%m%d_%H%M%S%.6f")
    ));
    fs::rename(path, &rotated).map_err(|e| PipelineError::io(path, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    /// Stands in for an engine: counts calls and writes whatever files and
    /// log text a real run would leave behind.
    pub(crate) struct StubExecutor {
        pub calls: RefCell<Vec<Invocation>>,
        pub outputs: Vec<String>,
        pub log_text: String,
        pub exit: ExitOutcome,
    }

    impl StubExecutor {
        pub(crate) fn succeeding(outputs: &[&str], log_text: &str) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                log_text: log_text.to_string(),
                exit: ExitOutcome::Exited(0),
            }
        }

        pub(crate) fn count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl Executor for StubExecutor {
        fn execute(&self, inv: &Invocation) -> Result<ExitOutcome> {
            self.calls.borrow_mut().push(inv.clone());
            fs::write(&inv.log_path, &self.log_text).unwrap();
            for out in &self.outputs {
                let path = inv.cwd.join(out);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(path, "artifact").unwrap();
            }
            Ok(self.exit)
        }
    }

    pub(crate) fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mdpipe_stage_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch");
        dir
    }

    pub(crate) fn config(extra: &[(&str, &str)]) -> RunConfig {
        let mut values = BTreeMap::new();
        values.insert("TEMPERATURE_K".to_string(), "300".to_string());
        values.insert("ENSEMBLE".to_string(), "NVT".to_string());
        values.insert("CPU_THREADS".to_string(), "12".to_string());
        for (k, v) in extra {
            values.insert(k.to_string(), v.to_string());
        }
        RunConfig::from_values(PathBuf::from("test.params"), values).expect("config")
    }

    fn em_stage() -> StageDescriptor {
        serde_yaml::from_str(
            r#"
name: initialize
dir: 1-energy-minimization
prepare:
  - program: gmx
    name: grompp
    args: [grompp, -f, "{INPUT_DIR}/em.mdp", -c, "{INPUT_DIR}/conf.gro", -o, em.tpr]
command:
  program: gmx
  args: [mdrun, -deffnm, em, -ntomp, "{OMP_THREADS}", -maxh, "{MAXH}"]
resume_args: [-cpi, em.cpt]
templates:
  - source: em.mdp.template
    target: em.mdp
inputs: [conf.gro]
artifact: em.gro
checkpoint: em.cpt
completion_marker: "Finished mdrun"
"#,
        )
        .expect("descriptor yaml")
    }

    fn setup(tag: &str) -> (PathBuf, PathBuf) {
        let root = scratch(tag);
        let defs = root.join("defs");
        let seed = defs.join("seed");
        fs::create_dir_all(&seed).unwrap();
        fs::write(defs.join("em.mdp.template"), "ref_t = {TEMPERATURE_K}\n").unwrap();
        fs::write(seed.join("conf.gro"), "coords").unwrap();
        (root, defs)
    }

    #[test]
    fn successful_stage_records_completion() {
        let (root, defs) = setup("success");
        let cfg = config(&[]);
        let stub = StubExecutor::succeeding(&["em.gro"], "...\nFinished mdrun on rank 0\n");
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        let result = runner
            .run(&desc, &layout, &[defs.join("seed")], None)
            .expect("run");
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(stub.count(), 2);
        assert!(layout.input.join("conf.gro").exists());
        assert_eq!(
            fs::read_to_string(layout.input.join("em.mdp")).unwrap(),
            "ref_t = 300\n"
        );
        assert!(guard::is_complete(&layout.stage_dir, GuardPolicy::default()));

        let calls = stub.calls.borrow();
        assert_eq!(calls[0].args[0], "grompp");
        assert_eq!(calls[1].args[4], "12");
        assert_eq!(calls[1].args[6], "-1");
        assert!(calls[1]
            .env
            .iter()
            .any(|(k, v)| k == "TEMPERATURE_K" && v == "300"));
        assert!(calls[1]
            .env
            .iter()
            .any(|(k, v)| k == "OMP_NUM_THREADS" && v == "12"));
        drop(calls);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn completed_stage_never_reinvokes_the_engine() {
        let (root, defs) = setup("resume");
        let cfg = config(&[]);
        let stub = StubExecutor::succeeding(&["em.gro"], "Finished mdrun\n");
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        runner.run(&desc, &layout, &[defs.join("seed")], None).expect("first");
        assert_eq!(stub.count(), 2);
        let second = runner.run(&desc, &layout, &[defs.join("seed")], None).expect("second");
        assert_eq!(second.status, StageStatus::Skipped);
        assert_eq!(stub.count(), 2);
        assert_eq!(second.artifacts, vec![layout.output.join("em.gro")]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_exit_without_marker_is_failure_and_retried() {
        let (root, defs) = setup("marker");
        let cfg = config(&[]);
        let stub = StubExecutor::succeeding(&["em.gro"], "step 5000 of 50000\n");
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        let result = runner.run(&desc, &layout, &[defs.join("seed")], None).expect("run");
        assert_eq!(result.status, StageStatus::Failed);
        assert!(matches!(result.failure, Some(StageFailure::MarkerMissing { .. })));
        assert!(!guard::completion_path(&layout.stage_dir).exists());

        runner.run(&desc, &layout, &[defs.join("seed")], None).expect("rerun");
        assert_eq!(stub.count(), 4);
        let err = result.into_error().expect("error");
        assert_eq!(err.code(), "external_tool_failure");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nonzero_exit_fails_stage() {
        let (root, defs) = setup("exit");
        let cfg = config(&[]);
        let mut stub = StubExecutor::succeeding(&["em.gro"], "Finished mdrun\n");
        stub.exit = ExitOutcome::Exited(1);
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        let result = runner.run(&desc, &layout, &[defs.join("seed")], None).expect("run");
        assert_eq!(result.status, StageStatus::Failed);
        // grompp fails first, so mdrun never starts.
        assert_eq!(stub.count(), 1);
        assert_eq!(
            result.failure,
            Some(StageFailure::ExitCode {
                step: "grompp".to_string(),
                code: 1
            })
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_artifact_fails_stage() {
        let (root, defs) = setup("artifact");
        let cfg = config(&[]);
        let stub = StubExecutor::succeeding(&[], "Finished mdrun\n");
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        let result = runner.run(&desc, &layout, &[defs.join("seed")], None).expect("run");
        assert!(matches!(result.failure, Some(StageFailure::ArtifactMissing(_))));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn timeout_maps_to_timeout_error() {
        let (root, defs) = setup("timeout");
        let cfg = config(&[]);
        let mut stub = StubExecutor::succeeding(&[], "");
        stub.exit = ExitOutcome::TimedOut(Duration::from_secs(60));
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        let result = runner
            .run(&desc, &layout, &[defs.join("seed")], Some(Duration::from_secs(3600)))
            .expect("run");
        let err = result.into_error().expect("error");
        match err {
            PipelineError::Timeout { limit_secs, .. } => assert_eq!(limit_secs, 60),
            other => panic!("unexpected error: {}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn checkpoint_switches_to_resume_mode() {
        let (root, defs) = setup("checkpoint");
        fs::write(
            defs.join("em.mdp.template"),
            "continuation = {CONTINUATION}\n",
        )
        .unwrap();
        let cfg = config(&[]);
        let stub = StubExecutor::succeeding(&["em.gro"], "Finished mdrun\n");
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        layout.prepare().unwrap();
        fs::write(layout.output.join("em.cpt"), "partial").unwrap();
        fs::write(layout.logs.join("initialize.log"), "old attempt").unwrap();

        let result = runner
            .run(&desc, &layout, &[defs.join("seed")], Some(Duration::from_secs(7200)))
            .expect("run");
        assert!(result.resumed);
        assert_eq!(
            fs::read_to_string(layout.input.join("em.mdp")).unwrap(),
            "continuation = yes\n"
        );
        let calls = stub.calls.borrow();
        let main = &calls[1];
        assert_eq!(&main.args[main.args.len() - 2..], &["-cpi", "em.cpt"]);
        assert_eq!(main.args[6], "1.9000");
        drop(calls);
        // previous log kept alongside the new one
        assert_eq!(fs::read_dir(&layout.logs).unwrap().count(), 3);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_input_is_reported_before_any_launch() {
        let (root, defs) = setup("input");
        fs::remove_file(defs.join("seed").join("conf.gro")).unwrap();
        let cfg = config(&[]);
        let stub = StubExecutor::succeeding(&["em.gro"], "Finished mdrun\n");
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let desc = em_stage();
        let layout = StageLayout::new(&root, &desc.dir);
        let err = runner
            .run(&desc, &layout, &[defs.join("seed")], None)
            .expect_err("missing input");
        assert_eq!(err.code(), "missing_stage_input");
        assert_eq!(stub.count(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn replica_stage_materializes_and_launches_once() {
        let root = scratch("replicas");
        let defs = root.join("defs");
        let prev = root.join("prev");
        fs::create_dir_all(&defs).unwrap();
        fs::create_dir_all(&prev).unwrap();
        fs::write(prev.join("npt.gro"), "coords").unwrap();
        fs::write(prev.join("topol.top"), "top").unwrap();
        fs::write(
            defs.join("plumed.dat.template"),
            "{RESTART}\nscale: {REPLICA_LAMBDA} at {REPLICA_TEMPERATURE_K}\n",
        )
        .unwrap();
        let cfg = config(&[
            ("N_REPLICA", "3"),
            ("REPLICA_T_MIN_K", "300"),
            ("REPLICA_T_MAX_K", "400"),
        ]);
        let desc: StageDescriptor = serde_yaml::from_str(
            r#"
name: production
dir: 3-sampling-hrex
prepare:
  - program: gmx
    name: grompp
    args: [grompp, -c, npt.gro, -p, topol.top, -o, prod.tpr]
command:
  program: mpirun
  args: [-np, "{N_RANKS}", gmx_mpi, mdrun, -multidir, "{REPLICA_DIRS}", -ntomp, "{OMP_THREADS}", -plumed, plumed.dat, -hrex]
templates:
  - source: plumed.dat.template
    target: plumed.dat
inputs: [npt.gro, topol.top]
artifact: prod.gro
replicas: true
"#,
        )
        .unwrap();
        // The stub writes the artifact relative to each call's cwd; for the
        // multidir launch that is output/, so name the per-replica paths.
        let stub = StubExecutor::succeeding(
            &[
                "prod.gro",
                "replica_00/prod.gro",
                "replica_01/prod.gro",
                "replica_02/prod.gro",
            ],
            "",
        );
        let runner = StageRunner {
            config: &cfg,
            executor: &stub,
            definition_dir: &defs,
            policy: GuardPolicy::default(),
        };
        let layout = StageLayout::new(&root, &desc.dir);
        let result = runner.run(&desc, &layout, &[prev.clone()], None).expect("run");
        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.artifacts.len(), 3);
        // three grompp calls and one multi-process launch
        assert_eq!(stub.count(), 4);
        let calls = stub.calls.borrow();
        let launch = &calls[3];
        assert_eq!(launch.program, "mpirun");
        assert_eq!(
            launch.args,
            vec![
                "-np", "3", "gmx_mpi", "mdrun", "-multidir", "replica_00", "replica_01",
                "replica_02", "-ntomp", "4", "-plumed", "plumed.dat", "-hrex"
            ]
        );
        assert_eq!(calls[1].cwd, layout.output.join("replica_01"));
        drop(calls);

        let plumed = fs::read_to_string(layout.output.join("replica_02").join("plumed.dat")).unwrap();
        assert_eq!(plumed, "\nscale: 0.750000 at 400.000000\n");
        for dir in ["replica_00", "replica_01", "replica_02"] {
            assert!(layout.output.join(dir).join("npt.gro").exists());
        }
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn process_executor_captures_output_and_exit_code() {
        let root = scratch("process");
        let inv = Invocation {
            program: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo out-$SYSTEM_NAME; read line; echo got-$line 1>&2; exit 3".to_string(),
            ],
            cwd: root.clone(),
            env: vec![("SYSTEM_NAME".to_string(), "slab".to_string())],
            stdin: Some("non-Water\n".to_string()),
            log_path: root.join("logs").join("step.log"),
            timeout: Some(Duration::from_secs(30)),
        };
        let outcome = ProcessExecutor.execute(&inv).expect("execute");
        assert_eq!(outcome, ExitOutcome::Exited(3));
        let log = fs::read_to_string(&inv.log_path).unwrap();
        assert!(log.contains("out-slab"));
        assert!(log.contains("got-non-Water"));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn process_executor_kills_after_timeout() {
        let root = scratch("kill");
        let inv = Invocation {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            cwd: root.clone(),
            env: vec![],
            stdin: None,
            log_path: root.join("sleep.log"),
            timeout: Some(Duration::from_millis(300)),
        };
        let started = Instant::now();
        let outcome = ProcessExecutor.execute(&inv).expect("execute");
        assert_eq!(outcome, ExitOutcome::TimedOut(Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(10));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn stopped_child_is_reaped() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let started = Instant::now();
        stop(&mut child);
        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn artifact_falls_back_to_newest_continuation_segment() {
        let root = scratch("segments");
        let expected = root.join("prod.gro");
        assert_eq!(resolve_artifact(&expected).unwrap(), None);
        fs::write(root.join("prod.part0002.gro"), "b").unwrap();
        fs::write(root.join("prod.part0010.gro"), "c").unwrap();
        assert_eq!(
            resolve_artifact(&expected).unwrap(),
            Some(root.join("prod.part0010.gro"))
        );
        fs::write(&expected, "a").unwrap();
        assert_eq!(resolve_artifact(&expected).unwrap(), Some(expected.clone()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn marker_search_streams_lines() {
        let root = scratch("markerscan");
        let log = root.join("prod.log");
        let mut body = Vec::new();
        for step in 0..20_000 {
            body.extend_from_slice(format!("Repl ex  0 x  1    2 x  3   step {}\n", step).as_bytes());
        }
        body.extend_from_slice(&[0xff, 0xfe, b'\n']);
        fs::write(&log, &body).unwrap();
        assert!(!log_contains(&log, "Finished mdrun").unwrap());

        body.extend_from_slice(b"\nFinished mdrun on rank 0 Mon Oct 19\n");
        fs::write(&log, &body).unwrap();
        assert!(log_contains(&log, "Finished mdrun").unwrap());
        assert!(log_contains(&root.join("absent.log"), "x").is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let root = scratch("noprog");
        let inv = Invocation {
            program: "/definitely/not/a/real/engine".to_string(),
            args: vec![],
            cwd: root.clone(),
            env: vec![],
            stdin: None,
            log_path: root.join("x.log"),
            timeout: None,
        };
        let err = ProcessExecutor.execute(&inv).expect_err("spawn must fail");
        assert_eq!(err.code(), "io");
        let _ = fs::remove_dir_all(root);
    }
}
