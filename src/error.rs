//! Error types for the proactive scheduler
//!
//! Configuration problems get their own variants so the scheduler can log
//! them distinctly; collaborator failures travel as `anyhow::Error`.

use thiserror::Error;

/// Errors raised while resolving a decision against group configuration
/// or thread state.
#[derive(Debug, Error)]
pub enum ProactiveError {
    #[error("Group {0} has no preference keys configured")]
    UnknownGroup(i64),

    #[error("Preference key '{key}' is not allowed in group {group_id}")]
    PreferenceNotAllowed { group_id: i64, key: String },

    #[error("Analysis did not provide a preference key for a new thread")]
    MissingPreference,

    #[error("Persona template not found: {0}")]
    MissingTemplate(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Thread {thread_id} belongs to group {actual}, not {expected}")]
    ForeignThread {
        thread_id: String,
        expected: i64,
        actual: i64,
    },
}

pub type Result<T> = std::result::Result<T, ProactiveError>;
