//! Nearest-time forecast lookup.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    error::{ResolveError, StoreError},
    model::{CityId, FieldMask, Forecast, Observation, UserId},
    store::{CityDirectory, ObservationStore},
};

/// Observation closest to `target`. Ties go to the earliest entry in `observations`.
pub fn nearest(observations: &[Observation], target: DateTime<Utc>) -> Option<&Observation> {
    let mut best: Option<(&Observation, TimeDelta)> = None;

    for obs in observations {
        let distance = (obs.timestamp - target).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((obs, distance)),
        }
    }

    best.map(|(obs, _)| obs)
}

/// Answers point-in-time forecast queries from stored observations.
///
/// Reads go straight to the store and may see the series before or after a
/// concurrent refresh cycle, never a half-written one.
#[derive(Clone)]
pub struct ForecastResolver {
    directory: Arc<dyn CityDirectory>,
    store: Arc<dyn ObservationStore>,
}

impl ForecastResolver {
    pub fn new(directory: Arc<dyn CityDirectory>, store: Arc<dyn ObservationStore>) -> Self {
        Self { directory, store }
    }

    pub async fn resolve(
        &self,
        city_id: CityId,
        target: DateTime<Utc>,
        mask: FieldMask,
    ) -> Result<Forecast, ResolveError> {
        let observations = match self.store.query_all(city_id).await {
            Ok(observations) => observations,
            Err(StoreError::UnknownCity(_)) => return Err(ResolveError::NotFound { city_id }),
            Err(err) => return Err(err.into()),
        };

        let closest = nearest(&observations, target).ok_or(ResolveError::NotFound { city_id })?;

        Ok(Forecast::project(closest, mask))
    }

    /// Same as [`resolve`](Self::resolve) but looks the city up by name first.
    pub async fn resolve_by_name(
        &self,
        name: &str,
        target: DateTime<Utc>,
        mask: FieldMask,
    ) -> Result<Forecast, ResolveError> {
        let city = self
            .directory
            .find_city_by_name(name)
            .await?
            .ok_or_else(|| ResolveError::UnknownCity(name.to_string()))?;

        self.resolve(city.id, target, mask).await
    }

    /// Resolve by name among the cities `user_id` registered. Cities with the
    /// same name owned by other users are not visible.
    pub async fn resolve_for_user(
        &self,
        user_id: UserId,
        name: &str,
        target: DateTime<Utc>,
        mask: FieldMask,
    ) -> Result<Forecast, ResolveError> {
        let city = self
            .directory
            .cities_for_user(user_id)
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ResolveError::UnknownCity(name.to_string()))?;

        self.resolve(city.id, target, mask).await
    }
}
