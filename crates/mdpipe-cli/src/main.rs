mod cli;
mod logging;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, RunArgs};
use include_dir::{include_dir, Dir, File};
use mdpipe_runner::exchange::summarize_log;
use mdpipe_runner::{
    describe, GuardPolicy, Ladder, Pipeline, PipelineDefinition, PipelineError, PipelineOptions,
    ProcessExecutor, ReplicaMethod, ReplicaSet, RunConfig, StageResult, StageSelection,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

static SCAFFOLD: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/scaffold");

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::setup_logging(cli.verbose, cli.quiet);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = match err.downcast_ref::<PipelineError>() {
                    Some(e) => (e.code(), error_details(e)),
                    None => ("command_failed", json!({})),
                };
                emit_json(&json_error(code, err.to_string(), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run(args) => return run_pipeline(args),
        Commands::Describe {
            params,
            set_values,
            json,
        } => {
            let overrides = parse_set_bindings(&set_values)?;
            let config = RunConfig::load(&params, &overrides)?;
            let value = describe(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "describe": value,
                })));
            }
            print_describe(&config, &value);
        }
        Commands::Ladder {
            n_replica,
            tmin,
            tmax,
            tunbiased,
            json,
        } => {
            let set = ReplicaSet::build(
                n_replica,
                &Ladder::Geometric {
                    t_min: tmin,
                    t_max: tmax,
                },
                ReplicaMethod::Hrex,
                tunbiased.unwrap_or(tmin),
            )?;
            if json {
                let rows: Vec<Value> = set
                    .replicas
                    .iter()
                    .map(|r| json!({"index": r.index, "temperature_k": r.temperature_k, "lambda": r.lambda}))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "ladder",
                    "t_reference": set.t_reference,
                    "replicas": rows,
                })));
            }
            println!(" i     temp_i lambda_i");
            for r in &set.replicas {
                println!("{:02} {:.6} {:.6}", r.index, r.temperature_k, r.lambda);
            }
        }
        Commands::Exchange { log, out, json } => {
            let out_dir = out.unwrap_or_else(|| parent_or_dot(&log));
            let summary = summarize_log(&log, &out_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "exchange",
                    "out_dir": out_dir.display().to_string(),
                    "summary": summary,
                })));
            }
            print!("{}", summary.render_text(&log));
            println!("wrote: {}", out_dir.display());
        }
        Commands::Init { dir, force } => {
            let written = write_scaffold(&dir, force)?;
            for path in &written {
                println!("wrote: {}", path.display());
            }
            println!(
                "next: edit {} and the templates, then run",
                dir.join("run.params").display()
            );
            println!(
                "next: mdpipe run {} --all",
                dir.join("run.params").display()
            );
        }
    }
    Ok(None)
}

fn run_pipeline(args: RunArgs) -> Result<Option<Value>> {
    let selection = if args.all {
        StageSelection::all()
    } else {
        StageSelection {
            initialize: args.initialize,
            equilibrate: args.equilibrate,
            production: args.production,
        }
    };
    let overrides = parse_set_bindings(&args.set_values)?;
    let config = RunConfig::load(&args.params, &overrides)?;
    let base = parent_or_dot(&args.params);
    let definition_path = args
        .pipeline
        .clone()
        .unwrap_or_else(|| base.join("pipeline.yaml"));
    let definition = PipelineDefinition::load(&definition_path)?;
    let root = args.root.clone().unwrap_or(base);
    debug!(definition = %definition_path.display(), root = %root.display(), "resolved run inputs");

    let executor = ProcessExecutor;
    let pipeline = Pipeline {
        config: &config,
        definition: &definition,
        executor: &executor,
        options: PipelineOptions {
            root,
            walltime_hours: args.walltime_hours,
            policy: GuardPolicy {
                verify_checksums: args.verify_checksums,
            },
        },
    };
    let report = pipeline.run(selection)?;

    if args.json {
        return Ok(Some(json!({
            "ok": true,
            "command": "run",
            "system_name": config.system_name,
            "stages": report.stages.iter().map(stage_result_to_json).collect::<Vec<_>>(),
            "summary": report.summary_path.display().to_string(),
        })));
    }
    for stage in &report.stages {
        println!(
            "{}: {}{}",
            stage.stage,
            stage.status.as_str(),
            if stage.resumed { " (resumed)" } else { "" }
        );
    }
    println!("summary: {}", report.summary_path.display());
    Ok(None)
}

fn parent_or_dot(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &PipelineError) -> Value {
    match err {
        PipelineError::MissingParameter { key, context } => json!({"key": key, "context": context}),
        PipelineError::MalformedParameter { key, value, expected } => {
            json!({"key": key, "value": value, "expected": expected})
        }
        PipelineError::UnresolvedTemplateToken { template, tokens } => {
            json!({"template": template, "tokens": tokens})
        }
        PipelineError::ExternalToolFailure { stage, reason, log } => {
            json!({"stage": stage, "reason": reason, "log": log.display().to_string()})
        }
        PipelineError::Timeout {
            stage,
            limit_secs,
            log,
        } => json!({"stage": stage, "limit_secs": limit_secs, "log": log.display().to_string()}),
        PipelineError::MissingStageInput { stage, path } => {
            json!({"stage": stage, "path": path.display().to_string()})
        }
        PipelineError::Io { path, .. } => json!({"path": path.display().to_string()}),
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run(args) => args.json,
        Commands::Describe { json, .. }
        | Commands::Ladder { json, .. }
        | Commands::Exchange { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn stage_result_to_json(result: &StageResult) -> Value {
    json!({
        "stage": result.stage,
        "status": result.status.as_str(),
        "resumed": result.resumed,
        "log": result.log_path.display().to_string(),
        "artifacts": result.artifacts.iter().map(|a| a.display().to_string()).collect::<Vec<_>>(),
    })
}

fn parse_set_bindings(values: &[String]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!(format!("invalid --set '{}': expected KEY=VALUE", raw)))?;
        if key.trim().is_empty() {
            return Err(anyhow::anyhow!(format!(
                "invalid --set '{}': key cannot be empty",
                raw
            )));
        }
        out.insert(key.trim().to_string(), value.to_string());
    }
    Ok(out)
}

fn print_describe(config: &RunConfig, value: &Value) {
    println!("params: {}", config.source.display());
    println!("system: {}", config.system_name);
    println!("ensemble: {}", config.ensemble.as_str());
    println!("temperature_k: {}", config.temperature_k);
    if let Some(p) = config.pressure_bar {
        println!("pressure_bar: {}", p);
    }
    println!(
        "hardware: {} threads, {} gpus",
        config.hardware.cpu_threads, config.hardware.gpu_count
    );
    match config.walltime_hours {
        Some(h) => println!("walltime_hours: {}", h),
        None => println!("walltime_hours: unlimited"),
    }
    let ladder = &value["replica_exchange"];
    if let Some(replicas) = ladder["replicas"].as_array() {
        println!(
            "replica_exchange: {} x{} ({} omp threads per rank, gpu ids '{}')",
            ladder["method"].as_str().unwrap_or("?"),
            replicas.len(),
            ladder["resources"]["omp_threads"],
            ladder["resources"]["gpu_ids"].as_str().unwrap_or("")
        );
        for r in replicas {
            println!(
                "  {} T={:.3} K lambda={:.4}",
                r["dir"].as_str().unwrap_or("?"),
                r["temperature_k"].as_f64().unwrap_or(f64::NAN),
                r["lambda"].as_f64().unwrap_or(f64::NAN)
            );
        }
    } else {
        println!("replica_exchange: none");
    }
    println!("values:");
    for (k, v) in config.values() {
        println!("  {}={}", k, v);
    }
}

fn collect_files(dir: &'static Dir<'static>, out: &mut Vec<&'static File<'static>>) {
    out.extend(dir.files());
    for sub in dir.dirs() {
        collect_files(sub, out);
    }
}

fn write_scaffold(dest: &Path, force: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(&SCAFFOLD, &mut files);
    if !force {
        let existing: Vec<String> = files
            .iter()
            .map(|f| dest.join(f.path()))
            .filter(|p| p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !existing.is_empty() {
            return Err(anyhow::anyhow!(format!(
                "init files already exist (use --force): {}",
                existing.join(", ")
            )));
        }
    }
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        let target = dest.join(file.path());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, file.contents())?;
        written.push(target);
    }
    Ok(written)
}
