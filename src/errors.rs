use thiserror::Error;

#[derive(Error, Debug)]
pub enum CbError {
    #[error("Genome validation failed: {0}")]
    Validation(String),
    #[error("Size {found} does not match the expected {expected}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Dataset format error: {0}")]
    DatasetFormat(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Command precondition unmet: {0}")]
    Usage(String),
    #[error("Worker failure: {0}")]
    Worker(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CbResult<T> = Result<T, CbError>;
