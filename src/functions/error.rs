use thiserror::Error;

use crate::bus::HandlerError;

/// Error from the functions service stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Storage(msg) => HandlerError::Unavailable(msg),
            StoreError::NotFound(id) => HandlerError::NotFound(id),
        }
    }
}
