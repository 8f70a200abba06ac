use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Hours covered by a single refresh cycle.
pub const WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CityId(pub i64);

impl fmt::Display for CityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// A tracked location. Only `id`, `latitude` and `longitude` matter for syncing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub id: CityId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// User who registered the city, if any.
    pub user_id: Option<UserId>,
}

/// One hourly sample as produced by a refresh cycle, before it is attached to a city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub wind_speed: f64,
    pub humidity: u8,
    pub precipitation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub city_id: CityId,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub wind_speed: f64,
    pub humidity: u8,
    pub precipitation: Option<f64>,
}

impl Observation {
    pub fn from_new(city_id: CityId, new: &NewObservation) -> Self {
        Self {
            city_id,
            timestamp: new.timestamp,
            temperature: new.temperature,
            wind_speed: new.wind_speed,
            humidity: new.humidity,
            precipitation: new.precipitation,
        }
    }
}

/// Parallel hourly arrays returned by the provider; index `i` is hour offset `i`
/// from the start of the requested window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedSeries {
    pub temperature: Vec<f64>,
    pub wind_speed: Vec<f64>,
    pub humidity: Vec<u8>,
    pub precipitation: Vec<Option<f64>>,
}

impl AlignedSeries {
    pub fn hour_count(&self) -> usize {
        self.temperature.len()
    }

    /// Build one observation per hour offset, stamped `start + i hours`.
    ///
    /// Callers construct the series through the provider, which guarantees all
    /// four arrays have the same length.
    pub fn into_observations(self, start: DateTime<Utc>) -> Vec<NewObservation> {
        self.temperature
            .into_iter()
            .zip(self.wind_speed)
            .zip(self.humidity)
            .zip(self.precipitation)
            .enumerate()
            .map(|(i, (((temperature, wind_speed), humidity), precipitation))| NewObservation {
                timestamp: start + Duration::hours(i as i64),
                temperature,
                wind_speed,
                humidity,
                precipitation,
            })
            .collect()
    }
}

/// The hour-aligned `[start, end)` span a refresh cycle requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RefreshWindow {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        let start = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
        Self { start, end: start + Duration::hours(WINDOW_HOURS) }
    }

    pub fn hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }
}

/// Which observation fields a resolve call should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMask {
    pub temperature: bool,
    pub wind_speed: bool,
    pub humidity: bool,
    pub precipitation: bool,
}

impl Default for FieldMask {
    fn default() -> Self {
        Self { temperature: true, wind_speed: true, humidity: false, precipitation: false }
    }
}

impl FieldMask {
    pub const fn all() -> Self {
        Self { temperature: true, wind_speed: true, humidity: true, precipitation: true }
    }

    pub const fn none() -> Self {
        Self { temperature: false, wind_speed: false, humidity: false, precipitation: false }
    }
}

impl FromStr for FieldMask {
    type Err = String;

    /// Parses a comma-separated field list such as `"temperature,humidity"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = Self::none();

        for field in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match field.to_lowercase().as_str() {
                "temperature" => mask.temperature = true,
                "wind_speed" | "wind" => mask.wind_speed = true,
                "humidity" => mask.humidity = true,
                "precipitation" => mask.precipitation = true,
                "all" => mask = Self::all(),
                other => {
                    return Err(format!(
                        "Unknown field '{other}'. Supported fields: temperature, wind_speed, humidity, precipitation."
                    ));
                }
            }
        }

        Ok(mask)
    }
}

/// Result of a resolve call. Fields outside the requested mask are `None` and
/// are left out of the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub city_id: CityId,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<u8>,
    /// `Some(None)` means precipitation was requested but the provider had no value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precipitation: Option<Option<f64>>,
}

impl Forecast {
    pub fn project(observation: &Observation, mask: FieldMask) -> Self {
        Self {
            city_id: observation.city_id,
            timestamp: observation.timestamp,
            temperature: mask.temperature.then_some(observation.temperature),
            wind_speed: mask.wind_speed.then_some(observation.wind_speed),
            humidity: mask.humidity.then_some(observation.humidity),
            precipitation: mask.precipitation.then_some(observation.precipitation),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub temperature: f64,
    pub wind_speed: f64,
    pub pressure: Option<f64>,
    pub observation_time: Option<DateTime<Utc>>,
}
