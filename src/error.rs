use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict updating {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Duplicate key in queue: {0}")]
    DuplicateKey(String),

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Launch incomplete for {job}: {dropped} request(s) not accepted")]
    LaunchIncomplete { job: String, dropped: usize },

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedError::Conflict { .. })
    }

    /// Errors that a later pass over the same identity may resolve.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedError::Conflict { .. }
                | SchedError::StoreUnavailable(_)
                | SchedError::LaunchIncomplete { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
