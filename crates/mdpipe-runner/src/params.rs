//! Flat `KEY=value` parameter files describing one simulation instance.
//!
//! Values are type-checked when the file is loaded so that a typo in a
//! composition count fails here instead of inside the engine hours later.

use crate::error::{PipelineError, Result};
use crate::replica::{Ladder, ReplicaMethod};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const FLOAT_SUFFIXES: &[&str] = &["_NM", "_K", "_BAR", "_PS", "_NS", "_HOURS", "_KJMOL"];
const INTEGER_KEYS: &[&str] = &["CPU_THREADS", "GPU_COUNT"];
const REQUIRED_KEYS: &[&str] = &["TEMPERATURE_K", "ENSEMBLE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensemble {
    Nvt,
    Npt,
}

impl Ensemble {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ensemble::Nvt => "NVT",
            Ensemble::Npt => "NPT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardware {
    pub cpu_threads: usize,
    pub gpu_count: usize,
}

/// Replica settings as declared in the parameter file. The ladder itself is
/// only evaluated when a stage actually needs replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaParams {
    pub count: usize,
    pub method: ReplicaMethod,
    pub ladder: Ladder,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: PathBuf,
    pub system_name: String,
    pub ensemble: Ensemble,
    pub temperature_k: f64,
    pub pressure_bar: Option<f64>,
    pub box_nm: Option<[f64; 3]>,
    pub hardware: Hardware,
    pub walltime_hours: Option<f64>,
    pub replicas: Option<ReplicaParams>,
    values: BTreeMap<String, String>,
}

impl RunConfig {
    pub fn load(path: &Path, overrides: &BTreeMap<String, String>) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let mut values = parse_assignments(&raw)?;
        for (key, value) in overrides {
            validate_key(key)?;
            values.insert(key.clone(), value.clone());
        }
        Self::from_values(path.to_path_buf(), values)
    }

    pub fn from_values(source: PathBuf, values: BTreeMap<String, String>) -> Result<Self> {
        for (key, value) in values.iter() {
            check_declared_type(key, value)?;
        }
        for key in REQUIRED_KEYS {
            if !values.contains_key(*key) {
                return Err(PipelineError::MissingParameter {
                    key: key.to_string(),
                    context: format!("parameter file {}", source.display()),
                });
            }
        }

        let ensemble = match values["ENSEMBLE"].to_ascii_uppercase().as_str() {
            "NVT" => Ensemble::Nvt,
            _ => Ensemble::Npt,
        };
        let temperature_k = parse_float("TEMPERATURE_K", &values["TEMPERATURE_K"])?;
        if temperature_k <= 0.0 {
            return Err(PipelineError::malformed(
                "TEMPERATURE_K",
                &values["TEMPERATURE_K"],
                "a positive temperature in kelvin",
            ));
        }
        let pressure_bar = optional_float(&values, "PRESSURE_BAR")?;
        if ensemble == Ensemble::Npt && pressure_bar.is_none() {
            return Err(PipelineError::MissingParameter {
                key: "PRESSURE_BAR".to_string(),
                context: "ENSEMBLE=NPT".to_string(),
            });
        }
        let box_nm = match (
            optional_float(&values, "BOX_X_NM")?,
            optional_float(&values, "BOX_Y_NM")?,
            optional_float(&values, "BOX_Z_NM")?,
        ) {
            (Some(x), Some(y), Some(z)) => Some([x, y, z]),
            _ => None,
        };
        let hardware = Hardware {
            cpu_threads: optional_usize(&values, "CPU_THREADS")?.unwrap_or(1),
            gpu_count: optional_usize(&values, "GPU_COUNT")?.unwrap_or(0),
        };
        let walltime_hours = optional_float(&values, "WALLTIME_HOURS")?;
        if let Some(hours) = walltime_hours {
            walltime_budget(hours)?;
        }
        let replicas = replica_params(&values, temperature_k)?;

        Ok(Self {
            source,
            system_name: values
                .get("SYSTEM_NAME")
                .cloned()
                .unwrap_or_else(|| "system".to_string()),
            ensemble,
            temperature_k,
            pressure_bar,
            box_nm,
            hardware,
            walltime_hours,
            replicas,
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn require(&self, key: &str, context: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| PipelineError::MissingParameter {
            key: key.to_string(),
            context: context.to_string(),
        })
    }

    pub fn require_all<'a, I>(&self, keys: I, context: &str) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            self.require(key, context)?;
        }
        Ok(())
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Key/value pairs handed to every subprocess through `Command::env`.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn parse_assignments(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed).trim();
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            PipelineError::malformed(
                &format!("line {}", idx + 1),
                trimmed,
                "a KEY=value assignment",
            )
        })?;
        let key = key.trim();
        validate_key(key)?;
        values.insert(key.to_string(), unquote(value.trim()));
    }
    Ok(values)
}

fn validate_key(key: &str) -> Result<()> {
    let mut chars = key.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PipelineError::malformed(
            key,
            "",
            "a key matching [A-Za-z_][A-Za-z0-9_]*",
        ))
    }
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                return rest[..end].to_string();
            }
        }
    }
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end().to_string(),
        None => value.to_string(),
    }
}

fn check_declared_type(key: &str, value: &str) -> Result<()> {
    if key.starts_with("N_") || INTEGER_KEYS.contains(&key) {
        parse_usize(key, value)?;
    } else if key == "REPLICA_TEMPERATURES_K" {
        parse_float_list(key, value)?;
    } else if FLOAT_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)) {
        parse_float(key, value)?;
    } else if key == "ENSEMBLE" {
        match value.to_ascii_uppercase().as_str() {
            "NVT" | "NPT" => {}
            _ => return Err(PipelineError::malformed(key, value, "NVT or NPT")),
        }
    } else if key == "REPLICA_METHOD" {
        ReplicaMethod::parse(value)
            .ok_or_else(|| PipelineError::malformed(key, value, "hrex, trex or multiwalker"))?;
    }
    Ok(())
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| PipelineError::malformed(key, value, "a non-negative integer"))
}

/// Converts a walltime in hours into a wall-clock budget. Zero, negative,
/// non-finite and unrepresentably large values are rejected.
pub fn walltime_budget(hours: f64) -> Result<Duration> {
    let expected = "a positive, finite number of hours";
    if !hours.is_finite() || hours <= 0.0 {
        return Err(PipelineError::malformed("WALLTIME_HOURS", &hours.to_string(), expected));
    }
    Duration::try_from_secs_f64(hours * 3600.0)
        .map_err(|_| PipelineError::malformed("WALLTIME_HOURS", &hours.to_string(), expected))
}

fn parse_float(key: &str, value: &str) -> Result<f64> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(PipelineError::malformed(key, value, "a finite number")),
    }
}

fn parse_float_list(key: &str, value: &str) -> Result<Vec<f64>> {
    value
        .split(',')
        .map(|part| parse_float(key, part.trim()))
        .collect()
}

fn optional_float(values: &BTreeMap<String, String>, key: &str) -> Result<Option<f64>> {
    values.get(key).map(|v| parse_float(key, v)).transpose()
}

fn optional_usize(values: &BTreeMap<String, String>, key: &str) -> Result<Option<usize>> {
    values.get(key).map(|v| parse_usize(key, v)).transpose()
}

fn replica_params(
    values: &BTreeMap<String, String>,
    temperature_k: f64,
) -> Result<Option<ReplicaParams>> {
    let count = match optional_usize(values, "N_REPLICA")? {
        Some(n) => n,
        None => return Ok(None),
    };
    let method = match values.get("REPLICA_METHOD") {
        Some(raw) => ReplicaMethod::parse(raw)
            .ok_or_else(|| PipelineError::malformed("REPLICA_METHOD", raw, "hrex, trex or multiwalker"))?,
        None => ReplicaMethod::Hrex,
    };
    let ladder = if method == ReplicaMethod::MultiWalker {
        Ladder::Uniform(temperature_k)
    } else if let Some(raw) = values.get("REPLICA_TEMPERATURES_K") {
        Ladder::Manual(parse_float_list("REPLICA_TEMPERATURES_K", raw)?)
    } else {
        let context = format!("N_REPLICA={} with REPLICA_METHOD={}", count, method.as_str());
        let t_min = values
            .get("REPLICA_T_MIN_K")
            .ok_or_else(|| PipelineError::MissingParameter {
                key: "REPLICA_T_MIN_K".to_string(),
                context: context.clone(),
            })?;
        let t_max = values
            .get("REPLICA_T_MAX_K")
            .ok_or_else(|| PipelineError::MissingParameter {
                key: "REPLICA_T_MAX_K".to_string(),
                context,
            })?;
        Ladder::Geometric {
            t_min: parse_float("REPLICA_T_MIN_K", t_min)?,
            t_max: parse_float("REPLICA_T_MAX_K", t_max)?,
        }
    };
    Ok(Some(ReplicaParams {
        count,
        method,
        ladder,
    }))
}
