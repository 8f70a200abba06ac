//! Observation persistence using SQLite with sqlx.
//!
//! Observations reference their city with `ON DELETE CASCADE`, so removing a
//! city removes its forecast history. Cities optionally reference the user who
//! registered them.

use std::path::Path;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tracing::{debug, info};

use crate::{
    error::StoreError,
    model::{City, CityId, NewObservation, Observation, User, UserId},
};

use super::{CityDirectory, ObservationStore, check_observation};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        user_id INTEGER REFERENCES users(id) ON DELETE SET NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS observations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        city_id INTEGER NOT NULL REFERENCES cities(id) ON DELETE CASCADE,
        timestamp INTEGER NOT NULL,
        temperature REAL NOT NULL,
        wind_speed REAL NOT NULL,
        humidity INTEGER NOT NULL,
        precipitation REAL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_observations_city ON observations(city_id)",
    "CREATE INDEX IF NOT EXISTS idx_cities_user ON cities(user_id)",
];

const CITY_COLUMNS: &str = "id, name, latitude, longitude, user_id";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        let store = Self { pool };
        store.create_schema().await?;

        info!(path = %path.display(), "Opened observation database");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        // A single connection that never expires, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn add_user(&self, name: &str) -> Result<User, StoreError> {
        let result = sqlx::query("INSERT INTO users (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(User { id: UserId(result.last_insert_rowid()), name: name.to_string() })
    }

    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok(User { id: UserId(row.try_get("id")?), name: row.try_get("name")? }))
            .collect()
    }

    pub async fn add_city(
        &self,
        name: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<City, StoreError> {
        let result = sqlx::query("INSERT INTO cities (name, latitude, longitude) VALUES (?, ?, ?)")
            .bind(name)
            .bind(latitude)
            .bind(longitude)
            .execute(&self.pool)
            .await?;

        Ok(City {
            id: CityId(result.last_insert_rowid()),
            name: name.to_string(),
            latitude,
            longitude,
            user_id: None,
        })
    }

    /// Register a city on behalf of an existing user.
    pub async fn add_city_for(
        &self,
        user_id: UserId,
        name: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<City, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownUser(user_id));
        }

        let result = sqlx::query(
            "INSERT INTO cities (name, latitude, longitude, user_id) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(latitude)
        .bind(longitude)
        .bind(user_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(City {
            id: CityId(result.last_insert_rowid()),
            name: name.to_string(),
            latitude,
            longitude,
            user_id: Some(user_id),
        })
    }

    /// Remove a city and, through the foreign key, its observations.
    pub async fn remove_city(&self, city_id: CityId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cities WHERE id = ?")
            .bind(city_id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn city_from_row(row: &SqliteRow) -> Result<City, StoreError> {
    Ok(City {
        id: CityId(row.try_get("id")?),
        name: row.try_get("name")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        user_id: row.try_get::<Option<i64>, _>("user_id")?.map(UserId),
    })
}

fn observation_from_row(row: &SqliteRow) -> Result<Observation, StoreError> {
    let secs: i64 = row.try_get("timestamp")?;
    let timestamp = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {secs} out of range")))?;

    let humidity: i64 = row.try_get("humidity")?;
    let humidity = u8::try_from(humidity)
        .map_err(|_| StoreError::Corrupt(format!("humidity {humidity} out of range")))?;

    Ok(Observation {
        city_id: CityId(row.try_get("city_id")?),
        timestamp,
        temperature: row.try_get("temperature")?,
        wind_speed: row.try_get("wind_speed")?,
        humidity,
        precipitation: row.try_get("precipitation")?,
    })
}

#[async_trait]
impl CityDirectory for SqliteStore {
    async fn list_cities(&self) -> Result<Vec<City>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {CITY_COLUMNS} FROM cities ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(city_from_row).collect()
    }

    async fn find_city_by_name(&self, name: &str) -> Result<Option<City>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CITY_COLUMNS} FROM cities WHERE name = ? ORDER BY id LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(city_from_row).transpose()
    }

    async fn cities_for_user(&self, user_id: UserId) -> Result<Vec<City>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CITY_COLUMNS} FROM cities WHERE user_id = ? ORDER BY id"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(city_from_row).collect()
    }
}

#[async_trait]
impl ObservationStore for SqliteStore {
    async fn append_batch(
        &self,
        city_id: CityId,
        batch: &[NewObservation],
    ) -> Result<(), StoreError> {
        // Dropping the transaction without commit rolls every row back.
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM cities WHERE id = ?")
            .bind(city_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::UnknownCity(city_id));
        }

        for (index, obs) in batch.iter().enumerate() {
            check_observation(index, obs)?;

            sqlx::query(
                r#"
                INSERT INTO observations
                    (city_id, timestamp, temperature, wind_speed, humidity, precipitation)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(city_id.0)
            .bind(obs.timestamp.timestamp())
            .bind(obs.temperature)
            .bind(obs.wind_speed)
            .bind(i64::from(obs.humidity))
            .bind(obs.precipitation)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(city_id = %city_id, rows = batch.len(), "Appended observation batch");
        Ok(())
    }

    async fn query_all(&self, city_id: CityId) -> Result<Vec<Observation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT city_id, timestamp, temperature, wind_speed, humidity, precipitation
            FROM observations
            WHERE city_id = ?
            ORDER BY id
            "#,
        )
        .bind(city_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(observation_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{base_time, hourly_batch};
    use chrono::Duration;

    #[tokio::test]
    async fn roundtrip_matches_parallel_arrays() {
        let store = SqliteStore::open_memory().await.unwrap();
        let city = store.add_city("Berlin", 52.52, 13.405).await.unwrap();

        let batch = hourly_batch(24);
        store.append_batch(city.id, &batch).await.unwrap();

        let stored = store.query_all(city.id).await.unwrap();
        assert_eq!(stored.len(), 24);
        for (i, (obs, expected)) in stored.iter().zip(&batch).enumerate() {
            assert_eq!(obs.timestamp, base_time() + Duration::hours(i as i64));
            assert_eq!(obs.temperature, expected.temperature);
            assert_eq!(obs.wind_speed, expected.wind_speed);
            assert_eq!(obs.humidity, expected.humidity);
            assert_eq!(obs.precipitation, expected.precipitation);
        }
    }

    #[tokio::test]
    async fn mid_batch_failure_rolls_back_the_whole_batch() {
        let store = SqliteStore::open_memory().await.unwrap();
        let city = store.add_city("Berlin", 52.52, 13.405).await.unwrap();

        let mut batch = hourly_batch(24);
        batch[12].wind_speed = f64::INFINITY;

        let err = store.append_batch(city.id, &batch).await.unwrap_err();

        assert!(matches!(err, StoreError::Rejected { index: 12, .. }));
        assert!(store.query_all(city.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_insert_is_rejected() {
        let store = SqliteStore::open_memory().await.unwrap();

        let err = store.append_batch(CityId(7), &hourly_batch(3)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownCity(CityId(7))));
    }

    #[tokio::test]
    async fn deleting_a_city_cascades_to_observations() {
        let store = SqliteStore::open_memory().await.unwrap();
        let berlin = store.add_city("Berlin", 52.52, 13.405).await.unwrap();
        let paris = store.add_city("Paris", 48.85, 2.35).await.unwrap();
        store.append_batch(berlin.id, &hourly_batch(4)).await.unwrap();
        store.append_batch(paris.id, &hourly_batch(4)).await.unwrap();

        assert!(store.remove_city(berlin.id).await.unwrap());

        assert!(store.query_all(berlin.id).await.unwrap().is_empty());
        assert_eq!(store.query_all(paris.id).await.unwrap().len(), 4);
        assert_eq!(store.list_cities().await.unwrap(), vec![paris]);
    }

    #[tokio::test]
    async fn on_disk_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forecast.db");

        let city = {
            let store = SqliteStore::open(&path).await.unwrap();
            let city = store.add_city("Oslo", 59.91, 10.75).await.unwrap();
            store.append_batch(city.id, &hourly_batch(2)).await.unwrap();
            city
        };

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(reopened.find_city_by_name("Oslo").await.unwrap(), Some(city.clone()));
        assert_eq!(reopened.query_all(city.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cities_record_the_user_who_added_them() {
        let store = SqliteStore::open_memory().await.unwrap();
        let anna = store.add_user("anna").await.unwrap();
        let ben = store.add_user("ben").await.unwrap();

        let berlin = store.add_city_for(anna.id, "Berlin", 52.52, 13.405).await.unwrap();
        let paris = store.add_city_for(ben.id, "Paris", 48.85, 2.35).await.unwrap();
        let oslo = store.add_city("Oslo", 59.91, 10.75).await.unwrap();

        assert_eq!(store.list_users().await.unwrap(), vec![anna.clone(), ben]);
        assert_eq!(store.cities_for_user(anna.id).await.unwrap(), vec![berlin]);
        assert_eq!(store.find_city_by_name("Paris").await.unwrap(), Some(paris));
        assert_eq!(oslo.user_id, None);
        assert_eq!(store.list_cities().await.unwrap()[0].user_id, Some(anna.id));
        assert!(store.cities_for_user(UserId(99)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn city_for_unknown_user_is_rejected() {
        let store = SqliteStore::open_memory().await.unwrap();

        let err = store.add_city_for(UserId(5), "Rome", 41.9, 12.5).await.unwrap_err();

        assert!(matches!(err, StoreError::UnknownUser(UserId(5))));
        assert!(store.list_cities().await.unwrap().is_empty());
    }
}
