//! City directory and observation storage.
//!
//! Two backends implement the same traits:
//! - [`MemoryStore`] keeps per-city snapshots in memory (tests, `--once` runs)
//! - [`SqliteStore`] persists cities and observations with sqlx

use async_trait::async_trait;

use crate::{
    error::StoreError,
    model::{City, CityId, NewObservation, Observation, UserId},
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read-only view of the tracked cities.
#[async_trait]
pub trait CityDirectory: Send + Sync {
    /// All cities, ordered by id.
    async fn list_cities(&self) -> Result<Vec<City>, StoreError>;

    async fn find_city_by_name(&self, name: &str) -> Result<Option<City>, StoreError>;

    /// Cities registered by `user_id`, ordered by id. Empty for unknown users.
    async fn cities_for_user(&self, user_id: UserId) -> Result<Vec<City>, StoreError>;
}

/// Append-only per-city time series.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Append the whole batch for `city_id` or nothing at all.
    ///
    /// Rows are stored in the order given. Fails with [`StoreError::UnknownCity`]
    /// when the city does not exist.
    async fn append_batch(
        &self,
        city_id: CityId,
        batch: &[NewObservation],
    ) -> Result<(), StoreError>;

    /// Every stored observation for `city_id`, in insertion order.
    async fn query_all(&self, city_id: CityId) -> Result<Vec<Observation>, StoreError>;
}

/// Reject values that cannot be stored faithfully.
pub(crate) fn check_observation(index: usize, obs: &NewObservation) -> Result<(), StoreError> {
    let reject = |reason: &str| StoreError::Rejected { index, reason: reason.to_string() };

    if !obs.temperature.is_finite() {
        return Err(reject("temperature is not a finite number"));
    }
    if !obs.wind_speed.is_finite() {
        return Err(reject("wind speed is not a finite number"));
    }
    if obs.humidity > 100 {
        return Err(reject("humidity exceeds 100%"));
    }
    if obs.precipitation.is_some_and(|p| !p.is_finite()) {
        return Err(reject("precipitation is not a finite number"));
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use crate::model::NewObservation;

    pub fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
    }

    /// `hours` consecutive hourly rows starting at [`base_time`].
    pub fn hourly_batch(hours: usize) -> Vec<NewObservation> {
        (0..hours)
            .map(|i| NewObservation {
                timestamp: base_time() + Duration::hours(i as i64),
                temperature: 10.0 + i as f64,
                wind_speed: 2.0,
                humidity: 60,
                precipitation: if i % 2 == 0 { Some(0.0) } else { None },
            })
            .collect()
    }
}
