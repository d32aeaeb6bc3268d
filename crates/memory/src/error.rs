use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum MemoryError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
}
