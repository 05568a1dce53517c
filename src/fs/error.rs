use thiserror::Error;

pub type AvmResult<T> = Result<T, AvmError>;

#[derive(Error, Debug)]
pub enum AvmError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Indirection cycle: {0}")]
    Cycle(String),

    #[error("Update conflict: {0}")]
    Conflict(String),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Wrong node type: {0}")]
    WrongType(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl AvmError {
    /// Short machine-readable label, used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            AvmError::NotFound(_) => "not_found",
            AvmError::Exists(_) => "exists",
            AvmError::Cycle(_) => "cycle",
            AvmError::Conflict(_) => "conflict",
            AvmError::BadArgument(_) => "bad_argument",
            AvmError::AccessDenied(_) => "access_denied",
            AvmError::WrongType(_) => "wrong_type",
            AvmError::Storage(_) => "storage",
        }
    }
}
