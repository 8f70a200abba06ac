use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::{
    error::StoreError,
    model::{City, CityId, NewObservation, Observation, User, UserId},
};

use super::{CityDirectory, ObservationStore, check_observation};

/// One city's series. Writers hold `retired`; readers only clone the snapshot `Arc`.
#[derive(Debug, Default)]
struct CitySeries {
    /// Set under the lock once the city is removed; later appends must fail.
    retired: Mutex<bool>,
    snapshot: RwLock<Arc<Vec<Observation>>>,
}

/// In-process store with copy-on-write snapshots per city.
#[derive(Debug)]
pub struct MemoryStore {
    users: RwLock<Vec<User>>,
    cities: RwLock<Vec<City>>,
    series: RwLock<HashMap<CityId, Arc<CitySeries>>>,
    next_user_id: AtomicI64,
    next_city_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            users: RwLock::new(Vec::new()),
            cities: RwLock::new(Vec::new()),
            series: RwLock::new(HashMap::new()),
            next_user_id: AtomicI64::new(1),
            next_city_id: AtomicI64::new(1),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, name: &str) -> User {
        let user = User {
            id: UserId(self.next_user_id.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
        };
        self.users.write().push(user.clone());
        user
    }

    pub fn list_users(&self) -> Vec<User> {
        self.users.read().clone()
    }

    pub fn add_city(&self, name: &str, latitude: f64, longitude: f64) -> City {
        self.insert_city(name, latitude, longitude, None)
    }

    /// Register a city on behalf of an existing user.
    pub fn add_city_for(
        &self,
        user_id: UserId,
        name: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<City, StoreError> {
        if !self.users.read().iter().any(|u| u.id == user_id) {
            return Err(StoreError::UnknownUser(user_id));
        }
        Ok(self.insert_city(name, latitude, longitude, Some(user_id)))
    }

    fn insert_city(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
        user_id: Option<UserId>,
    ) -> City {
        let city = City {
            id: CityId(self.next_city_id.fetch_add(1, Ordering::Relaxed)),
            name: name.to_string(),
            latitude,
            longitude,
            user_id,
        };

        self.series.write().insert(city.id, Arc::default());
        self.cities.write().push(city.clone());
        city
    }

    /// Remove a city together with its observations. Returns `false` if it was unknown.
    pub fn remove_city(&self, city_id: CityId) -> bool {
        let mut cities = self.cities.write();
        let before = cities.len();
        cities.retain(|c| c.id != city_id);

        if let Some(series) = self.series.write().remove(&city_id) {
            // Waits for an in-flight append, which then counts as before the removal.
            *series.retired.lock() = true;
        }

        cities.len() != before
    }

    fn city_series(&self, city_id: CityId) -> Result<Arc<CitySeries>, StoreError> {
        self.series.read().get(&city_id).cloned().ok_or(StoreError::UnknownCity(city_id))
    }
}

fn append_to(
    series: &CitySeries,
    city_id: CityId,
    batch: &[NewObservation],
) -> Result<(), StoreError> {
    let retired = series.retired.lock();
    if *retired {
        return Err(StoreError::UnknownCity(city_id));
    }

    let current = series.snapshot.read().clone();
    let mut next = Vec::with_capacity(current.len() + batch.len());
    next.extend(current.iter().cloned());

    for (index, new) in batch.iter().enumerate() {
        check_observation(index, new)?;
        next.push(Observation::from_new(city_id, new));
    }

    *series.snapshot.write() = Arc::new(next);
    Ok(())
}

#[async_trait]
impl CityDirectory for MemoryStore {
    async fn list_cities(&self) -> Result<Vec<City>, StoreError> {
        Ok(self.cities.read().clone())
    }

    async fn find_city_by_name(&self, name: &str) -> Result<Option<City>, StoreError> {
        Ok(self.cities.read().iter().find(|c| c.name == name).cloned())
    }

    async fn cities_for_user(&self, user_id: UserId) -> Result<Vec<City>, StoreError> {
        Ok(self.cities.read().iter().filter(|c| c.user_id == Some(user_id)).cloned().collect())
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn append_batch(
        &self,
        city_id: CityId,
        batch: &[NewObservation],
    ) -> Result<(), StoreError> {
        let series = self.city_series(city_id)?;
        append_to(&series, city_id, batch)
    }

    async fn query_all(&self, city_id: CityId) -> Result<Vec<Observation>, StoreError> {
        let series = self.city_series(city_id)?;
        let snapshot = series.snapshot.read().clone();
        Ok(snapshot.as_ref().clone())
    }
}
