//! Typed error hierarchy for specflow.
//!
//! One enum per subsystem:
//! - `ConfigError`: environment validation at process start
//! - `LlmError`: the generative-text client
//! - `ExecutorError`: a single agent executor
//! - `OrchestratorError`: phase execution and advancement
//! - `ApprovalError`: stack/dependency approval handlers
//!
//! The HTTP layer maps each of these onto a status code in `server::api`.

use thiserror::Error;

use crate::agents::ExecutorKind;
use crate::phase::{ApprovalKind, Phase};

/// Environment validation failures. All problems are collected before
/// returning so the operator sees every missing variable at once.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

impl ConfigError {
    pub fn problems(&self) -> &[String] {
        match self {
            ConfigError::Invalid(problems) => problems,
        }
    }
}

/// Errors from the LLM client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM client misconfigured: {0}")]
    Misconfiguration(String),

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("LLM provider rate limited the request")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("LLM provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("LLM response could not be decoded: {0}")]
    Decode(String),

    #[error("LLM returned an empty completion")]
    EmptyCompletion,

    #[error("LLM output was cut off at the {max_tokens} token limit")]
    Truncated { max_tokens: u32 },
}

/// Errors from a single agent executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{executor} failed while generating {document}: {source}")]
    Llm {
        executor: ExecutorKind,
        document: String,
        #[source]
        source: LlmError,
    },

    #[error("{executor} produced invalid {document}: {message}")]
    InvalidOutput {
        executor: ExecutorKind,
        document: String,
        message: String,
    },
}

/// Errors from the orchestrator engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Phase {requested} is not the current phase (current: {current})")]
    NotCurrentPhase { requested: Phase, current: Phase },

    #[error("Phase {0} has no executors")]
    NoExecutors(Phase),

    #[error("Project {slug} is already executing a phase")]
    AlreadyRunning { slug: String },

    #[error("Project is already in the terminal phase {0}")]
    Terminal(Phase),

    #[error("Cannot leave {phase}: {}", describe_blockers(.missing, .approval))]
    AdvanceBlocked {
        phase: Phase,
        missing: Vec<String>,
        approval: Option<ApprovalKind>,
    },

    #[error("Artifact {name} failed validation: {message}")]
    InvalidArtifact { name: String, message: String },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

fn describe_blockers(missing: &[String], approval: &Option<ApprovalKind>) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing artifacts {}", missing.join(", ")));
    }
    if let Some(kind) = approval {
        parts.push(format!("{} selection not approved", kind));
    }
    parts.join("; ")
}

/// Errors from the approval handlers.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("{0}")]
    Invalid(String),

    #[error("Project must reach {required} before this approval (current: {current})")]
    PhaseNotReached { required: Phase, current: Phase },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}
