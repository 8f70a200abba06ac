//! Core library for the `forecast` service.
//!
//! This crate defines:
//! - Shared domain models (cities, observations, field masks)
//! - The Open-Meteo provider client
//! - City directory and observation stores (in-memory and SQLite)
//! - The periodic sync scheduler and the nearest-time forecast resolver
//!
//! It is used by `forecast-cli`, but can also be embedded by other hosts
//! (an HTTP API, for instance) that own the scheduler lifecycle.

pub mod config;
pub mod error;
pub mod model;
pub mod provider;
pub mod resolve;
pub mod store;
pub mod sync;

pub use config::{Config, ProviderConfig, StorageConfig, SyncConfig};
pub use error::{CitySyncError, ProviderError, ResolveError, SchedulerError, StoreError};
pub use model::{
    AlignedSeries, City, CityId, CurrentWeather, FieldMask, Forecast, NewObservation, Observation,
    RefreshWindow, User, UserId,
};
pub use provider::{ForecastProvider, OpenMeteoProvider};
pub use resolve::ForecastResolver;
pub use store::{CityDirectory, MemoryStore, ObservationStore, SqliteStore};
pub use sync::{CityOutcome, CycleReport, SyncScheduler, SyncWorker};
