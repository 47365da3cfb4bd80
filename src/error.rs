use thiserror::Error;

use crate::pool::StoreError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no credentials available: {reason}")]
    NoCredentialsAvailable { reason: String },
    #[error("credential validation failed: {reason}")]
    ValidationFailed { reason: String },
    #[error("credential already exists in the pool")]
    DuplicateCredential,
    #[error("credential not found: {id}")]
    CredentialNotFound { id: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("pool task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PoolError>;
