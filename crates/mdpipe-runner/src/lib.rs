//! Restartable orchestration of external molecular dynamics engines:
//! parameter files, input templates, stage execution, replica fan-out and
//! post-production archival.

pub mod archive;
pub mod error;
pub mod exchange;
pub mod guard;
pub mod params;
pub mod pipeline;
pub mod replica;
pub mod stage;
pub mod template;

pub use error::{PipelineError, Result};
pub use guard::GuardPolicy;
pub use params::RunConfig;
pub use pipeline::{
    describe, Pipeline, PipelineDefinition, PipelineOptions, PipelineReport, StageKind,
    StageSelection,
};
pub use replica::{Ladder, ReplicaMethod, ReplicaSet, ResourcePlan};
pub use stage::{Executor, ProcessExecutor, StageResult, StageStatus};
