/// Errors surfaced by the snapshot store and the downsampling queries.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed caller input (interval, position, page size, balance string...).
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
