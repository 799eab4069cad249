use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Version conflict on memory {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid memory: {0}")]
    InvalidMemory(String),

    #[error("Task failed: {0}")]
    Task(String),
}

impl Error {
    /// Whether retrying the same read-modify-write can succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
