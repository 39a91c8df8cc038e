#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptgateError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("catalog has no tasks")]
    EmptyCatalog,

    #[error("duplicate task name '{0}' in catalog")]
    DuplicateTask(String),

    #[error("{0}")]
    Other(String),
}

/// Why a finished run counts as failed. Carried as data inside an
/// `ExecutionResult`; never raised past a worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("script not found at {}", path.display())]
    ScriptNotFound { path: PathBuf },

    #[error("failed to launch {program}: {reason}")]
    LaunchFailure { program: String, reason: String },

    #[error("exited with code {code}")]
    NonZeroExit { code: i32 },
}

/// Reasons a start request is dropped. These are not surfaced to the
/// operator; duplicate triggers are expected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum StartRejected {
    #[error("task #{0} does not exist")]
    UnknownTask(usize),

    #[error("task #{index} is {phase} and cannot be started")]
    NotStartable {
        index: usize,
        phase: crate::task::state::Phase,
    },
}
