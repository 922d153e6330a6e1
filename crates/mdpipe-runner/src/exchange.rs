//! Neighbour exchange acceptance statistics from a replica-exchange mdrun
//! log.

use crate::error::{PipelineError, Result};
use chrono::Utc;
use mdpipe_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUMMARY_JSON: &str = "exchange_probability_summary.json";
pub const SUMMARY_TEXT: &str = "exchange_probability_average.txt";
pub const DYNAMICS_CSV: &str = "exchange_probability_dynamics.csv";

const REPLICA_COUNT_PREFIX: &str = "Repl  There are ";
const PROBABILITY_PREFIX: &str = "Repl pr";
const EXCHANGE_LINE_PREFIX: &str = "Replica exchange at step";

/// One row per `Repl pr` line, `n_replica - 1` columns. Exchanges alternate
/// between even and odd neighbour pairs, so every other column is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeLog {
    pub n_replica: usize,
    pub rows: Vec<Vec<Option<f64>>>,
    pub times_ps: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PairStats {
    pub pair: String,
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExchangeSummary {
    pub n_replica: usize,
    pub attempts: usize,
    pub t_initial_ns: Option<f64>,
    pub t_final_ns: Option<f64>,
    pub pairs: Vec<PairStats>,
    pub min_mean: Option<f64>,
    pub overall_mean: Option<f64>,
    /// Spread of the per-pair means.
    pub std_of_means: Option<f64>,
}

pub fn parse_exchange_log(text: &str) -> Result<ExchangeLog> {
    let n_replica = parse_replica_count(text)?;
    let mut rows = Vec::new();
    let mut times_ps = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.trim_start().strip_prefix(PROBABILITY_PREFIX) {
            rows.push(parse_probability_row(rest, n_replica)?);
        } else if let Some(rest) = line.trim_start().strip_prefix(EXCHANGE_LINE_PREFIX) {
            if let Some(t) = parse_exchange_time(rest) {
                times_ps.push(t);
            }
        }
    }
    Ok(ExchangeLog {
        n_replica,
        rows,
        times_ps,
    })
}

fn parse_replica_count(text: &str) -> Result<usize> {
    let mut counts = Vec::new();
    for line in text.lines() {
        if let Some(pos) = line.find(REPLICA_COUNT_PREFIX) {
            let digits: String = line[pos + REPLICA_COUNT_PREFIX.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse::<usize>() {
                counts.push(n);
            }
        }
    }
    let first = *counts.first().ok_or_else(|| {
        PipelineError::ExchangeLog("no 'There are N replicas' line found".to_string())
    })?;
    if counts.iter().any(|&n| n != first) {
        return Err(PipelineError::ExchangeLog(format!(
            "inconsistent replica counts {:?}",
            counts
        )));
    }
    if first < 2 {
        return Err(PipelineError::ExchangeLog(format!(
            "need at least 2 replicas, log reports {}",
            first
        )));
    }
    Ok(first)
}

fn parse_probability_row(rest: &str, n_replica: usize) -> Result<Vec<Option<f64>>> {
    let pairs = n_replica - 1;
    let mut values = Vec::new();
    for token in rest.split_whitespace() {
        let v: f64 = token.parse().map_err(|_| {
            PipelineError::ExchangeLog(format!("bad probability '{}' in 'Repl pr{}'", token, rest))
        })?;
        values.push(v);
    }
    if values.is_empty() {
        return Ok(vec![None; pairs]);
    }

    let mut row: Vec<Option<f64>> = Vec::with_capacity(2 * values.len());
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            row.push(None);
        }
        row.push(Some(v));
    }
    // Odd-pair attempts skip the first and last neighbour pair.
    if row.len() != pairs {
        row.insert(0, None);
        row.push(None);
    }
    if row.len() != pairs {
        return Err(PipelineError::ExchangeLog(format!(
            "'Repl pr{}' does not fit {} replicas",
            rest, n_replica
        )));
    }
    Ok(row)
}

fn parse_exchange_time(rest: &str) -> Option<f64> {
    let mut tokens = rest.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "time" {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

impl ExchangeLog {
    pub fn summary(&self) -> ExchangeSummary {
        let pairs: Vec<PairStats> = (0..self.n_replica - 1)
            .map(|col| {
                let values: Vec<f64> = self.rows.iter().filter_map(|row| row[col]).collect();
                pair_stats(format!("{}-{}", col, col + 1), &values)
            })
            .collect();
        let means: Vec<f64> = pairs.iter().filter_map(|p| p.mean).collect();
        let min_mean = means.iter().copied().reduce(f64::min);
        let overall_mean = mean(&means);
        let std_of_means = sample_std(&means);

        let t_initial_ns = self.times_ps.iter().copied().reduce(f64::min).map(|t| t / 1000.0);
        let t_final_ns = self.times_ps.iter().copied().reduce(f64::max).map(|t| t / 1000.0);
        ExchangeSummary {
            n_replica: self.n_replica,
            attempts: self.rows.len(),
            t_initial_ns,
            t_final_ns,
            pairs,
            min_mean,
            overall_mean,
            std_of_means,
        }
    }

    /// Per-attempt probabilities as CSV: an attempt index column, then one
    /// column per pair. Pairs not attempted on a row are left empty.
    pub fn dynamics_csv(&self) -> Result<Vec<u8>> {
        let to_err = |e: csv::Error| PipelineError::io(DYNAMICS_CSV, e);
        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut header = vec![String::new()];
        header.extend((0..self.n_replica - 1).map(|i| format!("{}-{}", i, i + 1)));
        writer.write_record(&header).map_err(to_err)?;
        for (idx, row) in self.rows.iter().enumerate() {
            let mut record = vec![idx.to_string()];
            record.extend(row.iter().map(|v| v.map(|p| p.to_string()).unwrap_or_default()));
            writer.write_record(&record).map_err(to_err)?;
        }
        writer
            .into_inner()
            .map_err(|e| PipelineError::io(DYNAMICS_CSV, e.into_error()))
    }

    pub fn write_dynamics(&self, dir: &Path) -> Result<PathBuf> {
        ensure_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
        let path = dir.join(DYNAMICS_CSV);
        atomic_write_bytes(&path, &self.dynamics_csv()?).map_err(|e| PipelineError::io(&path, e))?;
        Ok(path)
    }
}

fn pair_stats(pair: String, values: &[f64]) -> PairStats {
    PairStats {
        pair,
        count: values.len(),
        mean: mean(values),
        std: sample_std(values),
        min: values.iter().copied().reduce(f64::min),
        max: values.iter().copied().reduce(f64::max),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

// sample standard deviation, undefined below two observations
fn sample_std(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() < 2 {
        return None;
    }
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    Some((ss / (values.len() as f64 - 1.0)).sqrt())
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", precision, v),
        None => "n/a".to_string(),
    }
}

impl ExchangeSummary {
    pub fn render_text(&self, source: &Path) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Datetime: {}", Utc::now().to_rfc3339());
        let _ = writeln!(out, "Log file: {}", source.display());
        let _ = writeln!(out);
        let _ = writeln!(out, "Number of replicas: {}", self.n_replica);
        let _ = writeln!(out, "Exchange attempts: {}", self.attempts);
        let _ = writeln!(out, "Initial time: {} ns", fmt_opt(self.t_initial_ns, 1));
        let _ = writeln!(out, "Final time: {} ns", fmt_opt(self.t_final_ns, 1));
        let span = match (self.t_initial_ns, self.t_final_ns) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        };
        let _ = writeln!(out, "Simulation time: {} ns", fmt_opt(span, 1));
        let _ = writeln!(out);
        let _ = writeln!(out, "Minimum exchange probability: {}", fmt_opt(self.min_mean, 2));
        let _ = writeln!(out, "Average exchange probability: {}", fmt_opt(self.overall_mean, 2));
        let _ = writeln!(out, "Std Dev exchange probability: {}", fmt_opt(self.std_of_means, 2));
        let _ = writeln!(out);
        let _ = writeln!(out, "Average +- Std Dev Exchange Probabilities:");
        for pair in &self.pairs {
            let _ = writeln!(
                out,
                "{}: {} {} (n={})",
                pair.pair,
                fmt_opt(pair.mean, 2),
                fmt_opt(pair.std, 2),
                pair.count
            );
        }
        out
    }

    /// Writes the JSON and text summaries into `dir`.
    pub fn write(&self, dir: &Path, source: &Path) -> Result<Vec<PathBuf>> {
        ensure_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
        let json_path = dir.join(SUMMARY_JSON);
        let value = serde_json::to_value(self).map_err(|e| PipelineError::io(&json_path, e))?;
        atomic_write_json_pretty(&json_path, &value).map_err(|e| PipelineError::io(&json_path, e))?;
        let text_path = dir.join(SUMMARY_TEXT);
        atomic_write_bytes(&text_path, self.render_text(source).as_bytes())
            .map_err(|e| PipelineError::io(&text_path, e))?;
        info!(dir = %dir.display(), pairs = self.pairs.len(), "wrote exchange summary");
        Ok(vec![json_path, text_path])
    }
}

/// Parses `log_path` and writes its summary into `out_dir`.
pub fn summarize_log(log_path: &Path, out_dir: &Path) -> Result<ExchangeSummary> {
    let text = fs::read_to_string(log_path).map_err(|e| PipelineError::io(log_path, e))?;
    let log = parse_exchange_log(&text)?;
    let summary = log.summary();
    summary.write(out_dir, log_path)?;
    log.write_dynamics(out_dir)?;
    Ok(summary)
}
