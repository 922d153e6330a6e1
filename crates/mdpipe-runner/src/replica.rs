//! Replica ladders, per-replica working directories and the static split of
//! the thread/GPU budget across one multi-process launch.

use crate::error::{PipelineError, Result};
use crate::params::Hardware;
use mdpipe_core::{copy_dir_filtered, ensure_dir};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaMethod {
    /// Hamiltonian replica exchange: every replica runs at the reference
    /// temperature with selected interactions scaled by lambda.
    Hrex,
    /// Temperature replica exchange.
    Trex,
    /// Independent walkers sharing one bias (multi-walker OPES/metadynamics).
    MultiWalker,
}

impl ReplicaMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hrex" => Some(ReplicaMethod::Hrex),
            "trex" => Some(ReplicaMethod::Trex),
            "multiwalker" => Some(ReplicaMethod::MultiWalker),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaMethod::Hrex => "hrex",
            ReplicaMethod::Trex => "trex",
            ReplicaMethod::MultiWalker => "multiwalker",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ladder {
    Geometric { t_min: f64, t_max: f64 },
    Manual(Vec<f64>),
    Uniform(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    pub index: usize,
    pub temperature_k: f64,
    pub lambda: f64,
    pub dir_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSet {
    pub method: ReplicaMethod,
    pub t_reference: f64,
    pub replicas: Vec<Replica>,
}

impl ReplicaSet {
    pub fn build(n: usize, ladder: &Ladder, method: ReplicaMethod, t_reference: f64) -> Result<Self> {
        if n == 0 {
            return Err(PipelineError::InvalidReplicaLadder(
                "replica count must be at least 1".to_string(),
            ));
        }
        if !(t_reference > 0.0) {
            return Err(PipelineError::InvalidReplicaLadder(format!(
                "reference temperature must be positive, got {}",
                t_reference
            )));
        }
        let temperatures = match ladder {
            Ladder::Geometric { t_min, t_max } => geometric_temperatures(n, *t_min, *t_max)?,
            Ladder::Manual(values) => {
                if values.len() != n {
                    return Err(PipelineError::InvalidReplicaLadder(format!(
                        "{} temperatures given for {} replicas",
                        values.len(),
                        n
                    )));
                }
                values.clone()
            }
            Ladder::Uniform(t) => {
                if method != ReplicaMethod::MultiWalker {
                    return Err(PipelineError::InvalidReplicaLadder(format!(
                        "{} needs a strictly increasing temperature ladder",
                        method.as_str()
                    )));
                }
                vec![*t; n]
            }
        };

        if temperatures.iter().any(|t| !(*t > 0.0) || !t.is_finite()) {
            return Err(PipelineError::InvalidReplicaLadder(
                "temperatures must be positive and finite".to_string(),
            ));
        }
        if method != ReplicaMethod::MultiWalker
            && temperatures.windows(2).any(|pair| pair[1] <= pair[0])
        {
            return Err(PipelineError::InvalidReplicaLadder(format!(
                "temperatures are not strictly increasing: {:?}",
                temperatures
            )));
        }

        let width = std::cmp::max(2, (n - 1).to_string().len());
        let replicas = temperatures
            .into_iter()
            .enumerate()
            .map(|(index, temperature_k)| Replica {
                index,
                temperature_k,
                lambda: match method {
                    ReplicaMethod::Hrex => t_reference / temperature_k,
                    _ => 1.0,
                },
                dir_name: format!("replica_{:0width$}", index, width = width),
            })
            .collect();
        Ok(Self {
            method,
            t_reference,
            replicas,
        })
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn dir_names(&self) -> Vec<String> {
        self.replicas.iter().map(|r| r.dir_name.clone()).collect()
    }

    /// Creates one working directory per replica under `output_dir`. A new
    /// directory is seeded with a recursive copy of `seed_dir`; an existing
    /// one is left alone so its checkpoint survives a restart.
    pub fn materialize(&self, output_dir: &Path, seed_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            let dir = output_dir.join(&replica.dir_name);
            if dir.exists() {
                debug!(replica = %replica.dir_name, "replica directory exists; keeping restart state");
            } else {
                ensure_dir(&dir).map_err(|e| PipelineError::io(&dir, e))?;
                copy_dir_filtered(seed_dir, &dir, &[]).map_err(|e| PipelineError::io(seed_dir, e))?;
                info!(
                    replica = %replica.dir_name,
                    temperature_k = replica.temperature_k,
                    lambda = replica.lambda,
                    "materialized replica directory"
                );
            }
            dirs.push(dir);
        }
        Ok(dirs)
    }
}

/// `T_i = T_min * (T_max/T_min)^(i/(N-1))` with both endpoints pinned
/// exactly.
fn geometric_temperatures(n: usize, t_min: f64, t_max: f64) -> Result<Vec<f64>> {
    if n < 2 {
        return Err(PipelineError::InvalidReplicaLadder(
            "a geometric ladder needs at least 2 replicas".to_string(),
        ));
    }
    if !(t_min > 0.0 && t_min < t_max && t_max.is_finite()) {
        return Err(PipelineError::InvalidReplicaLadder(format!(
            "need 0 < T_min < T_max, got T_min={} T_max={}",
            t_min, t_max
        )));
    }
    let ratio = t_max / t_min;
    let last = (n - 1) as f64;
    Ok((0..n)
        .map(|i| match i {
            0 => t_min,
            i if i == n - 1 => t_max,
            i => t_min * ratio.powf(i as f64 / last),
        })
        .collect())
}

/// One-time division of the allocation across simultaneously launched
/// replica ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePlan {
    pub ranks: usize,
    pub omp_threads: usize,
    pub gpu_ids: String,
}

impl ResourcePlan {
    pub fn single(hardware: &Hardware) -> Self {
        Self {
            ranks: 1,
            omp_threads: std::cmp::max(1, hardware.cpu_threads),
            gpu_ids: join_gpu_ids(0..hardware.gpu_count, hardware.gpu_count),
        }
    }

    pub fn partition(hardware: &Hardware, ranks: usize) -> Result<Self> {
        if ranks == 0 {
            return Err(PipelineError::InvalidReplicaLadder(
                "cannot partition resources across zero ranks".to_string(),
            ));
        }
        if hardware.cpu_threads < ranks {
            return Err(PipelineError::malformed(
                "CPU_THREADS",
                &hardware.cpu_threads.to_string(),
                &format!("at least one thread per replica ({} replicas)", ranks),
            ));
        }
        let gpu_ids = if hardware.gpu_count == 0 {
            String::new()
        } else {
            join_gpu_ids(
                (0..ranks).map(|rank| rank * hardware.gpu_count / ranks),
                hardware.gpu_count,
            )
        };
        Ok(Self {
            ranks,
            omp_threads: hardware.cpu_threads / ranks,
            gpu_ids,
        })
    }
}

/// Single-digit ids are concatenated (`0011`); once two-digit ids exist the
/// list is comma separated so `1,10` cannot be read as `11,0`.
fn join_gpu_ids(ids: impl Iterator<Item = usize>, gpu_count: usize) -> String {
    let ids: Vec<String> = ids.map(|g| g.to_string()).collect();
    if gpu_count > 10 {
        ids.join(",")
    } else {
        ids.concat()
    }
}
