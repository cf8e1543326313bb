//! Typed error hierarchy for the scriptorium pipeline.
//!
//! One enum per subsystem:
//! - `LlmError`: model client failures (transport, process, capability)
//! - `ParseError`: structured model output that failed to parse
//! - `TournamentError`: bracket setup and competitor failures
//! - `CheckpointError`: checkpoint persistence failures
//! - `PromptError`: template lookup and loading failures
//! - `PipelineError`: stage failures surfaced by the orchestrator

use thiserror::Error;

/// Errors from an LLM client call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Failed to spawn model process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("I/O error talking to model process: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model process exited with code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },

    #[error("Model call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Client does not support required capability: {capability}")]
    Unsupported { capability: &'static str },

    #[error("Malformed client response: {0}")]
    MalformedResponse(String),
}

/// Errors from interpreting a model's structured output.
///
/// Components that interpret model output never let this escape; each caller
/// maps it to a documented fallback value.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("No JSON object found in response")]
    NoJson,

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Errors from running a tournament bracket.
#[derive(Debug, Error)]
pub enum TournamentError {
    #[error("Bracket requires a power-of-two number of generators (got {count})")]
    InvalidBracketSize { count: usize },

    #[error("Generator {generator_id} failed: {source}")]
    GenerationFailed {
        generator_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Judge failed in match {match_name}: {source}")]
    JudgeFailed {
        match_name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Checkpoint payload could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint task panicked")]
    TaskPanicked,
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.into())
    }
}

/// Errors from the prompt renderer.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Unknown prompt template '{0}'")]
    UnknownTemplate(String),

    #[error("Failed to read template override at {path}: {source}")]
    OverrideReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
