// Module: Errors
// Typed failure kinds for the execution engine.

use thiserror::Error;

/// Errors surfaced by the engine. Each variant maps to a distinct failure
/// semantic: parse failures are fatal for the feature, step failures stop (or
/// defer, under `continueOnStepFailure`) the scenario, cache and resource IO
/// failures degrade where the contract allows it.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Malformed feature file.
    #[error("parse error in {path} at line {line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },

    /// `configure` was given a key the runtime does not recognize.
    #[error("unknown configure key: '{0}'")]
    ConfigUnknownKey(String),

    /// One of the bootstrap config scripts failed to evaluate.
    #[error("config script evaluation failed: {0}")]
    ConfigEvaluationFailed(String),

    /// A configure value had the wrong shape for its key.
    #[error("configure '{key}': {message}")]
    ConfigTypeMismatch { key: String, message: String },

    /// An assertion or step action failed.
    #[error("{0}")]
    StepFailure(String),

    /// A nested feature run failed; the message aggregates the first failed
    /// scenario of the callee.
    #[error("call failed: {0}")]
    CallFailed(String),

    /// `listen` expired before `signal` arrived.
    #[error("listen timed out after {0} ms")]
    ListenTimeout(u64),

    /// Read/write/disk-cache failure. Non-fatal for caches, fatal for
    /// feature reads.
    #[error("resource error: {0}")]
    ResourceIo(String),

    /// An unexpected panic escaped a worker.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Shorthand for the most common failure kind.
    pub fn step(message: impl Into<String>) -> Self {
        Self::StepFailure(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::ResourceIo(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
