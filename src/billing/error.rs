use std::time::Duration;

use thiserror::Error;

/// key: billing-store-error -> persistent store faults; admission fails closed on any of these
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("gave up after {attempts} conflicting transactions")]
    Conflict { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("billing provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("billing provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("billing provider payload invalid: {0}")]
    Decode(String),
}

/// Transient failures; the provider redelivers the event after a non-success response.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
