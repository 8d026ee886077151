#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for relay_core::ConsumerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidUrl(url) => relay_core::ConsumerError::Config(format!("invalid store url: {url}")),
            other => relay_core::ConsumerError::Store(other.to_string()),
        }
    }
}
