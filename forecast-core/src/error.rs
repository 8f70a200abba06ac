use std::time::Duration;

use crate::model::{CityId, UserId};

/// Transient failure of a single provider call. Callers decide whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Provider did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Provider request failed with status {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Invalid forecast window: start must be before end")]
    InvalidWindow,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("City {0} does not exist")]
    UnknownCity(CityId),

    #[error("User {0} does not exist")]
    UnknownUser(UserId),

    #[error("Observation {index} rejected: {reason}")]
    Rejected { index: usize, reason: String },

    #[error("Stored observation is corrupt: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No forecast for city {city_id}")]
    NotFound { city_id: CityId },

    #[error("No city matches '{0}'")]
    UnknownCity(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why one city was skipped during a refresh cycle.
#[derive(Debug, thiserror::Error)]
pub enum CitySyncError {
    #[error("fetch failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("persist failed: {0}")]
    Store(#[from] StoreError),

    #[error("abandoned during shutdown")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Sync scheduler is already running")]
    AlreadyRunning,
}
