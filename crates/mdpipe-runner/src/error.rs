use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing parameter '{key}' (required by {context})")]
    MissingParameter { key: String, context: String },

    #[error("malformed parameter '{key}' = '{value}': expected {expected}")]
    MalformedParameter {
        key: String,
        value: String,
        expected: String,
    },

    #[error("unresolved template token(s) {} in {template}", .tokens.join(", "))]
    UnresolvedTemplateToken {
        template: String,
        tokens: Vec<String>,
    },

    #[error("stage '{stage}' failed: {reason} (log: {})", .log.display())]
    ExternalToolFailure {
        stage: String,
        reason: String,
        log: PathBuf,
    },

    #[error("stage '{stage}' exceeded its wall-clock budget of {limit_secs} s and was killed (log: {})", .log.display())]
    Timeout {
        stage: String,
        limit_secs: u64,
        log: PathBuf,
    },

    #[error("no stage selected: pass at least one of --initialize, --equilibrate, --production, --all")]
    NoStageSelected,

    #[error("invalid replica ladder: {0}")]
    InvalidReplicaLadder(String),

    #[error("stage '{stage}' is missing input '{}'; has the previous stage completed?", .path.display())]
    MissingStageInput { stage: String, path: PathBuf },

    #[error("pipeline definition error: {0}")]
    Definition(String),

    #[error("cannot parse replica exchange log: {0}")]
    ExchangeLog(String),

    #[error("I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    /// Stable snake_case identifier used in machine-readable CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::MissingParameter { .. } => "missing_parameter",
            PipelineError::MalformedParameter { .. } => "malformed_parameter",
            PipelineError::UnresolvedTemplateToken { .. } => "unresolved_template_token",
            PipelineError::ExternalToolFailure { .. } => "external_tool_failure",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::NoStageSelected => "no_stage_selected",
            PipelineError::InvalidReplicaLadder(_) => "invalid_replica_ladder",
            PipelineError::MissingStageInput { .. } => "missing_stage_input",
            PipelineError::Definition(_) => "definition",
            PipelineError::ExchangeLog(_) => "exchange_log",
            PipelineError::Io { .. } => "io",
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Io {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn malformed(key: &str, value: &str, expected: &str) -> Self {
        PipelineError::MalformedParameter {
            key: key.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}
