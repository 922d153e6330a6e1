//! The three-stage driver: energy minimization, equilibration, production.

use crate::archive::Archiver;
use crate::error::{PipelineError, Result};
use crate::guard::GuardPolicy;
use crate::params::{walltime_budget, RunConfig};
use crate::replica::{ReplicaSet, ResourcePlan};
use crate::stage::{
    replica_set_for, Executor, StageDescriptor, StageLayout, StageResult, StageRunner, StageStatus,
};
use crate::template::{template_tokens, BUILTIN_TOKENS};
use chrono::Utc;
use mdpipe_core::{atomic_write_json_pretty, ensure_dir};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};

pub const DEFINITION_SCHEMA: &str = "pipeline_v1";
pub const SUMMARY_FILE: &str = "pipeline_last_run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Initialize,
    Equilibrate,
    Production,
}

impl StageKind {
    pub const ORDER: [StageKind; 3] = [
        StageKind::Initialize,
        StageKind::Equilibrate,
        StageKind::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Initialize => "initialize",
            StageKind::Equilibrate => "equilibrate",
            StageKind::Production => "production",
        }
    }
}

/// Independent stage flags. Selected stages always run in `StageKind::ORDER`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSelection {
    pub initialize: bool,
    pub equilibrate: bool,
    pub production: bool,
}

impl StageSelection {
    pub fn all() -> Self {
        Self {
            initialize: true,
            equilibrate: true,
            production: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.initialize || self.equilibrate || self.production)
    }

    pub fn includes(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Initialize => self.initialize,
            StageKind::Equilibrate => self.equilibrate,
            StageKind::Production => self.production,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub schema_version: String,
    pub seed_dir: PathBuf,
    pub initialize: StageDescriptor,
    pub equilibrate: StageDescriptor,
    pub production: StageDescriptor,
    /// Directory of the definition file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&raw, &base_dir)
    }

    pub fn from_yaml(raw: &str, base_dir: &Path) -> Result<Self> {
        let mut def: PipelineDefinition = serde_yaml::from_str(raw)
            .map_err(|e| PipelineError::Definition(e.to_string()))?;
        if def.schema_version != DEFINITION_SCHEMA {
            return Err(PipelineError::Definition(format!(
                "unsupported schema_version '{}' (expected {})",
                def.schema_version, DEFINITION_SCHEMA
            )));
        }
        def.base_dir = base_dir.to_path_buf();
        if def.seed_dir.is_relative() {
            def.seed_dir = base_dir.join(&def.seed_dir);
        }
        let mut dirs = BTreeSet::new();
        for kind in StageKind::ORDER {
            let stage = def.stage(kind);
            if stage.dir.trim().is_empty() || stage.dir.contains("..") {
                return Err(PipelineError::Definition(format!(
                    "stage '{}' has an invalid dir '{}'",
                    stage.name, stage.dir
                )));
            }
            if !dirs.insert(stage.dir.clone()) {
                return Err(PipelineError::Definition(format!(
                    "stage directory '{}' is used twice",
                    stage.dir
                )));
            }
        }
        Ok(def)
    }

    pub fn stage(&self, kind: StageKind) -> &StageDescriptor {
        match kind {
            StageKind::Initialize => &self.initialize,
            StageKind::Equilibrate => &self.equilibrate,
            StageKind::Production => &self.production,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub root: PathBuf,
    /// Overrides `WALLTIME_HOURS` from the parameter file.
    pub walltime_hours: Option<f64>,
    pub policy: GuardPolicy,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub stages: Vec<StageResult>,
    pub summary_path: PathBuf,
}

pub struct Pipeline<'a> {
    pub config: &'a RunConfig,
    pub definition: &'a PipelineDefinition,
    pub executor: &'a dyn Executor,
    pub options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    /// Checks every token referenced by the selected stages against the
    /// parameter file, and the replica ladder and resource split of replica
    /// stages, so a bad configuration fails before anything is launched.
    pub fn validate(&self, selection: StageSelection) -> Result<()> {
        for kind in StageKind::ORDER {
            if !selection.includes(kind) {
                continue;
            }
            let stage = self.definition.stage(kind);
            let mut sources: Vec<(String, String)> = Vec::new();
            for spec in &stage.templates {
                let path = self.definition.base_dir.join(&spec.source);
                let text = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
                sources.push((spec.source.display().to_string(), text));
            }
            let mut commands = vec![&stage.command];
            commands.extend(stage.prepare.iter());
            if let Some(archive) = &stage.archive {
                commands.extend(archive.merges.iter().filter_map(|m| m.tool.as_ref()));
                if let Some(strip) = &archive.strip {
                    commands.push(&strip.command);
                }
            }
            for cmd in commands {
                for text in cmd.template_texts() {
                    sources.push((format!("{} command", cmd.log_stem()), text.to_string()));
                }
            }
            for arg in &stage.resume_args {
                sources.push(("resume_args".to_string(), arg.clone()));
            }

            for (origin, text) in &sources {
                if let Some(token) = template_tokens(text)
                    .into_iter()
                    .find(|t| !self.config.contains(t) && !BUILTIN_TOKENS.contains(&t.as_str()))
                {
                    return Err(PipelineError::MissingParameter {
                        key: token,
                        context: format!("stage '{}' ({})", stage.name, origin),
                    });
                }
            }

            if let Some(set) = replica_set_for(self.config, stage)? {
                ResourcePlan::partition(&self.config.hardware, set.len())?;
            }
        }
        Ok(())
    }

    fn deadline(&self) -> Result<Option<Instant>> {
        let hours = match self.options.walltime_hours.or(self.config.walltime_hours) {
            Some(hours) => hours,
            None => return Ok(None),
        };
        let budget = walltime_budget(hours)?;
        Instant::now()
            .checked_add(budget)
            .map(Some)
            .ok_or_else(|| {
                PipelineError::malformed(
                    "WALLTIME_HOURS",
                    &hours.to_string(),
                    "a walltime that fits the system clock",
                )
            })
    }

    pub fn run(&self, selection: StageSelection) -> Result<PipelineReport> {
        if selection.is_empty() {
            return Err(PipelineError::NoStageSelected);
        }
        self.validate(selection)?;
        let deadline = self.deadline()?;

        let root = &self.options.root;
        let logs = root.join("logs");
        ensure_dir(&logs).map_err(|e| PipelineError::io(&logs, e))?;
        let summary_path = logs.join(SUMMARY_FILE);

        info!(
            system = %self.config.system_name,
            root = %root.display(),
            walltime_hours = ?self.options.walltime_hours.or(self.config.walltime_hours),
            "pipeline starting"
        );

        let runner = StageRunner {
            config: self.config,
            executor: self.executor,
            definition_dir: &self.definition.base_dir,
            policy: self.options.policy,
        };
        let archiver = Archiver {
            config: self.config,
            executor: self.executor,
            policy: self.options.policy,
        };

        let mut results: Vec<StageResult> = Vec::new();
        for kind in StageKind::ORDER {
            if !selection.includes(kind) {
                continue;
            }
            if let Err(err) = self.run_stage(&runner, &archiver, kind, deadline, &mut results) {
                error!(stage = kind.as_str(), code = err.code(), error = %err, "pipeline stopped");
                self.write_summary(&summary_path, &results, Some(&err))?;
                return Err(err);
            }
        }

        self.write_summary(&summary_path, &results, None)?;
        info!(stages = results.len(), summary = %summary_path.display(), "pipeline finished");
        Ok(PipelineReport {
            stages: results,
            summary_path,
        })
    }

    fn run_stage(
        &self,
        runner: &StageRunner<'_>,
        archiver: &Archiver<'_>,
        kind: StageKind,
        deadline: Option<Instant>,
        results: &mut Vec<StageResult>,
    ) -> Result<()> {
        let desc = self.definition.stage(kind);
        let layout = StageLayout::new(&self.options.root, &desc.dir);
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let result = runner.run(desc, &layout, &self.source_dirs(kind), remaining)?;
        record(results, result)?;

        if let Some(spec) = &desc.archive {
            let sources = archive_sources(self.config, desc, &layout)?;
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let result = archiver.run(&desc.name, spec, &layout, &sources, remaining)?;
            record(results, result)?;
        }
        Ok(())
    }

    /// Where a stage looks for its inputs: the previous stage's output, then
    /// the seed directory.
    fn source_dirs(&self, kind: StageKind) -> Vec<PathBuf> {
        let previous = match kind {
            StageKind::Initialize => return vec![self.definition.seed_dir.clone()],
            StageKind::Equilibrate => StageKind::Initialize,
            StageKind::Production => StageKind::Equilibrate,
        };
        vec![
            StageLayout::new(&self.options.root, &self.definition.stage(previous).dir).output,
            self.definition.seed_dir.clone(),
        ]
    }

    fn write_summary(
        &self,
        path: &Path,
        results: &[StageResult],
        err: Option<&PipelineError>,
    ) -> Result<()> {
        let stages: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "stage": r.stage,
                    "status": r.status.as_str(),
                    "resumed": r.resumed,
                    "log": r.log_path.display().to_string(),
                    "artifacts": r.artifacts.iter().map(|a| a.display().to_string()).collect::<Vec<_>>(),
                    "failure": r.failure.as_ref().map(|f| f.to_string()),
                })
            })
            .collect();
        let summary = json!({
            "schema_version": "pipeline_run_v1",
            "finished_at": Utc::now().to_rfc3339(),
            "system_name": self.config.system_name,
            "params": self.config.source.display().to_string(),
            "root": self.options.root.display().to_string(),
            "outcome": if err.is_some() { "failed" } else { "succeeded" },
            "error": err.map(|e| json!({"code": e.code(), "message": e.to_string()})),
            "stages": stages,
        });
        atomic_write_json_pretty(path, &summary).map_err(|e| PipelineError::io(path, e))
    }
}

fn record(results: &mut Vec<StageResult>, result: StageResult) -> Result<()> {
    results.push(result.clone());
    match result.into_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn archive_sources(
    config: &RunConfig,
    desc: &StageDescriptor,
    layout: &StageLayout,
) -> Result<Vec<(Option<String>, PathBuf)>> {
    Ok(match replica_set_for(config, desc)? {
        Some(set) => set
            .dir_names()
            .into_iter()
            .map(|name| {
                let dir = layout.output.join(&name);
                (Some(name), dir)
            })
            .collect(),
        None => vec![(None, layout.output.clone())],
    })
}

/// Resolved view of a parameter file: values, replica ladder and resource
/// split, as printed by `mdpipe describe`.
pub fn describe(config: &RunConfig) -> Result<Value> {
    let ladder = match &config.replicas {
        Some(params) => {
            let set = ReplicaSet::build(
                params.count,
                &params.ladder,
                params.method,
                config.temperature_k,
            )?;
            let plan = ResourcePlan::partition(&config.hardware, set.len())?;
            json!({
                "method": set.method.as_str(),
                "replicas": set.replicas.iter().map(|r| json!({
                    "index": r.index,
                    "dir": r.dir_name,
                    "temperature_k": r.temperature_k,
                    "lambda": r.lambda,
                })).collect::<Vec<_>>(),
                "resources": {
                    "ranks": plan.ranks,
                    "omp_threads": plan.omp_threads,
                    "gpu_ids": plan.gpu_ids,
                },
            })
        }
        None => Value::Null,
    };
    let single = ResourcePlan::single(&config.hardware);
    Ok(json!({
        "params": config.source.display().to_string(),
        "system_name": config.system_name,
        "ensemble": config.ensemble.as_str(),
        "temperature_k": config.temperature_k,
        "pressure_bar": config.pressure_bar,
        "box_nm": config.box_nm,
        "walltime_hours": config.walltime_hours,
        "hardware": {
            "cpu_threads": config.hardware.cpu_threads,
            "gpu_count": config.hardware.gpu_count,
            "omp_threads": single.omp_threads,
            "gpu_ids": single.gpu_ids,
        },
        "replica_exchange": ladder,
        "values": config.values(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard;
    use crate::stage::tests::{config, scratch, StubExecutor};
    use crate::stage::ExitOutcome;

    const DEFINITION: &str = r#"
schema_version: pipeline_v1
seed_dir: seed
initialize:
  name: initialize
  dir: 1-energy-minimization
  command:
    program: gmx
    args: [em, -ntomp, "{OMP_THREADS}"]
  inputs: [conf.gro]
  artifact: em.gro
equilibrate:
  name: equilibrate
  dir: 2-equilibration
  command:
    program: gmx
    args: [nvt, -maxh, "{MAXH}"]
  templates:
    - source: nvt.mdp.template
      target: nvt.mdp
  inputs: [em.gro, topol.top]
  artifact: npt.gro
production:
  name: production
  dir: 3-sampling-hrex
  command:
    program: gmx
    args: [prod, -multidir, "{REPLICA_DIRS}", -maxh, "{MAXH}"]
  templates:
    - source: plumed.dat.template
      target: plumed.dat
  inputs: [npt.gro]
  artifact: prod.gro
  replicas: true
  archive:
    stem: prod
    merges:
      - extension: log
"#;

    fn fixture(tag: &str, plumed: &str) -> (PathBuf, PipelineDefinition) {
        let root = scratch(tag);
        let defs = root.join("defs");
        fs::create_dir_all(defs.join("seed")).unwrap();
        fs::write(defs.join("seed").join("conf.gro"), "coords").unwrap();
        fs::write(defs.join("seed").join("topol.top"), "topology").unwrap();
        fs::write(defs.join("nvt.mdp.template"), "ref_t = {TEMPERATURE_K}\n").unwrap();
        fs::write(defs.join("plumed.dat.template"), plumed).unwrap();
        fs::write(defs.join("pipeline.yaml"), DEFINITION).unwrap();
        let def = PipelineDefinition::load(&defs.join("pipeline.yaml")).expect("definition");
        (root, def)
    }

    fn stub() -> StubExecutor {
        StubExecutor::succeeding(
            &[
                "em.gro",
                "npt.gro",
                "replica_00/prod.gro",
                "replica_01/prod.gro",
                "replica_02/prod.gro",
                "replica_00/prod.log",
                "replica_01/prod.log",
                "replica_02/prod.log",
            ],
            "",
        )
    }

    fn replica_config() -> RunConfig {
        config(&[
            ("N_REPLICA", "3"),
            ("REPLICA_T_MIN_K", "300"),
            ("REPLICA_T_MAX_K", "400"),
            ("UPPER_WALL_HEIGHT_NM", "2.5"),
        ])
    }

    fn options(root: &Path, walltime_hours: Option<f64>) -> PipelineOptions {
        PipelineOptions {
            root: root.join("run"),
            walltime_hours,
            policy: GuardPolicy::default(),
        }
    }

    #[test]
    fn empty_selection_is_rejected() {
        let (root, def) = fixture("empty", "AT={UPPER_WALL_HEIGHT_NM}\n");
        let cfg = replica_config();
        let exec = stub();
        let pipeline = Pipeline {
            config: &cfg,
            definition: &def,
            executor: &exec,
            options: options(&root, None),
        };
        let err = pipeline.run(StageSelection::default()).expect_err("nothing selected");
        assert_eq!(err.code(), "no_stage_selected");
        assert_eq!(exec.count(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn all_runs_each_stage_once_in_order_then_skips() {
        let (root, def) = fixture("all", "AT={UPPER_WALL_HEIGHT_NM} T={REPLICA_TEMPERATURE_K}\n");
        let cfg = replica_config();
        let exec = stub();
        let pipeline = Pipeline {
            config: &cfg,
            definition: &def,
            executor: &exec,
            options: options(&root, Some(2.0)),
        };
        let report = pipeline.run(StageSelection::all()).expect("pipeline");
        let names: Vec<&str> = report.stages.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(
            names,
            vec!["initialize", "equilibrate", "production", "production-archive"]
        );
        assert_eq!(exec.count(), 3);
        {
            let calls = exec.calls.borrow();
            let firsts: Vec<&str> = calls.iter().map(|c| c.args[0].as_str()).collect();
            assert_eq!(firsts, vec!["em", "nvt", "prod"]);
            assert_eq!(
                &calls[2].args[1..5],
                &["-multidir", "replica_00", "replica_01", "replica_02"]
            );
            let maxh: f64 = calls[1].args[2].parse().unwrap();
            assert!((maxh - 1.9).abs() < 0.01);
        }

        let run = root.join("run");
        assert!(run.join("2-equilibration/input/em.gro").exists());
        // not produced by minimization, so it comes from the seed directory
        assert!(run.join("2-equilibration/input/topol.top").exists());
        assert!(run.join("3-sampling-hrex/input/npt.gro").exists());
        assert_eq!(
            fs::read_to_string(run.join("3-sampling-hrex/output/replica_02/plumed.dat")).unwrap(),
            "AT=2.5 T=400.000000\n"
        );
        assert!(run
            .join("3-sampling-hrex/concatenated/prod_replica_01.log")
            .exists());
        assert!(guard::is_complete(
            &run.join("3-sampling-hrex"),
            GuardPolicy::default()
        ));

        let summary: Value =
            serde_json::from_slice(&fs::read(&report.summary_path).unwrap()).unwrap();
        assert_eq!(summary["outcome"], "succeeded");
        assert_eq!(summary["stages"][2]["status"], "succeeded");

        let again = pipeline.run(StageSelection::all()).expect("rerun");
        assert_eq!(exec.count(), 3);
        assert!(again
            .stages
            .iter()
            .all(|r| r.status == StageStatus::Skipped));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_parameter_fails_before_any_launch() {
        let (root, def) = fixture("missing", "AT={UNDEFINED_WALL_NM}\n");
        let cfg = replica_config();
        let exec = stub();
        let pipeline = Pipeline {
            config: &cfg,
            definition: &def,
            executor: &exec,
            options: options(&root, None),
        };
        let err = pipeline.run(StageSelection::all()).expect_err("missing key");
        match err {
            PipelineError::MissingParameter { key, context } => {
                assert_eq!(key, "UNDEFINED_WALL_NM");
                assert!(context.contains("production"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(exec.count(), 0);
        assert!(!root.join("run").join("1-energy-minimization").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn bad_replica_setup_fails_before_minimization() {
        let (root, def) = fixture("ladder", "AT={UPPER_WALL_HEIGHT_NM}\n");
        let inverted = config(&[
            ("N_REPLICA", "3"),
            ("REPLICA_T_MIN_K", "400"),
            ("REPLICA_T_MAX_K", "300"),
            ("UPPER_WALL_HEIGHT_NM", "2.5"),
        ]);
        let starved = config(&[
            ("N_REPLICA", "3"),
            ("REPLICA_T_MIN_K", "300"),
            ("REPLICA_T_MAX_K", "400"),
            ("UPPER_WALL_HEIGHT_NM", "2.5"),
            ("CPU_THREADS", "2"),
        ]);
        for (cfg, code) in [
            (&inverted, "invalid_replica_ladder"),
            (&starved, "malformed_parameter"),
        ] {
            let exec = stub();
            let pipeline = Pipeline {
                config: cfg,
                definition: &def,
                executor: &exec,
                options: options(&root, None),
            };
            let err = pipeline.run(StageSelection::all()).expect_err("bad replica setup");
            assert_eq!(err.code(), code);
            assert_eq!(exec.count(), 0);
            assert!(!root.join("run").join("1-energy-minimization").exists());
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unusable_walltime_is_rejected_before_launch() {
        let (root, def) = fixture("walltime", "AT={UPPER_WALL_HEIGHT_NM}\n");
        let cfg = replica_config();
        for hours in [f64::INFINITY, f64::NAN, -1.0, 1e17] {
            let exec = stub();
            let pipeline = Pipeline {
                config: &cfg,
                definition: &def,
                executor: &exec,
                options: options(&root, Some(hours)),
            };
            match pipeline.run(StageSelection::all()).expect_err("bad walltime") {
                PipelineError::MalformedParameter { key, .. } => assert_eq!(key, "WALLTIME_HOURS"),
                other => panic!("unexpected error: {}", other),
            }
            assert_eq!(exec.count(), 0);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn production_alone_needs_equilibrated_inputs() {
        let (root, def) = fixture("alone", "AT={UPPER_WALL_HEIGHT_NM}\n");
        let cfg = replica_config();
        let exec = stub();
        let pipeline = Pipeline {
            config: &cfg,
            definition: &def,
            executor: &exec,
            options: options(&root, None),
        };
        let selection = StageSelection {
            production: true,
            ..StageSelection::default()
        };
        let err = pipeline.run(selection).expect_err("no npt.gro yet");
        assert_eq!(err.code(), "missing_stage_input");
        assert_eq!(exec.count(), 0);
        let summary: Value = serde_json::from_slice(
            &fs::read(root.join("run").join("logs").join(SUMMARY_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["outcome"], "failed");
        assert_eq!(summary["error"]["code"], "missing_stage_input");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn tool_failure_stops_the_pipeline() {
        let (root, def) = fixture("fail", "AT={UPPER_WALL_HEIGHT_NM}\n");
        let cfg = replica_config();
        let mut exec = stub();
        exec.exit = ExitOutcome::Exited(1);
        let pipeline = Pipeline {
            config: &cfg,
            definition: &def,
            executor: &exec,
            options: options(&root, None),
        };
        let err = pipeline.run(StageSelection::all()).expect_err("failure");
        match err {
            PipelineError::ExternalToolFailure { stage, log, .. } => {
                assert_eq!(stage, "initialize");
                assert!(log.ends_with("1-energy-minimization/logs/initialize.log"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(exec.count(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn definition_rejects_unknown_schema_and_shared_dirs() {
        let base = Path::new("/tmp");
        let bad_schema = DEFINITION.replace("pipeline_v1", "pipeline_v0");
        assert_eq!(
            PipelineDefinition::from_yaml(&bad_schema, base).unwrap_err().code(),
            "definition"
        );
        let shared = DEFINITION.replace("dir: 2-equilibration", "dir: 1-energy-minimization");
        assert!(PipelineDefinition::from_yaml(&shared, base).is_err());
        let def = PipelineDefinition::from_yaml(DEFINITION, base).expect("valid");
        assert_eq!(def.seed_dir, base.join("seed"));
        assert!(def.production.replicas);
    }

    #[test]
    fn describe_reports_ladder_and_resources() {
        let cfg = replica_config();
        let value = describe(&cfg).expect("describe");
        assert_eq!(value["ensemble"], "NVT");
        let ladder = &value["replica_exchange"];
        assert_eq!(ladder["method"], "hrex");
        assert_eq!(ladder["replicas"][2]["dir"], "replica_02");
        assert_eq!(ladder["resources"]["omp_threads"], 4);
    }
}
