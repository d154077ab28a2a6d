use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key material: {0}")]
    Validation(String),

    #[error("key id conflict: {0}")]
    Conflict(String),

    #[error("prekey capacity exceeded: {current} unused + {requested} new > {max}")]
    Capacity {
        current: usize,
        requested: usize,
        max: usize,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key storage error: {0}")]
    Storage(String),

    #[error("invalid key policy: {0}")]
    Policy(String),
}

impl KeyError {
    /// Stable machine-readable code, sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::Capacity { .. } => "capacity_exceeded",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage_error",
            Self::Policy(_) => "invalid_policy",
        }
    }

    /// Only storage failures are worth retrying; every other variant is
    /// deterministic for the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<rusqlite::Error> for KeyError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(e.to_string())
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}
