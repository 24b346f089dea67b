use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("persistence backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Errors that should take the whole subsystem offline instead of being
    /// retried on the next cycle.
    pub fn is_backend_unreachable(&self) -> bool {
        matches!(self, Self::BackendUnreachable(_))
    }
}
