use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::{
    error::ProviderError,
    model::{AlignedSeries, CurrentWeather},
};

pub mod open_meteo;

pub use open_meteo::OpenMeteoProvider;

/// Source of hourly forecasts for a coordinate pair.
#[async_trait]
pub trait ForecastProvider: Send + Sync + Debug {
    /// Fetch the hourly series covering the half-open window `[start, end)`.
    async fn fetch_hourly_forecast(
        &self,
        latitude: f64,
        longitude: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AlignedSeries, ProviderError>;

    /// Current conditions at a coordinate pair.
    async fn fetch_current(&self, latitude: f64, longitude: f64)
    -> Result<CurrentWeather, ProviderError>;
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_body_keeps_short_bodies() {
        assert_eq!(truncate_body("bad request"), "bad request");
    }

    #[test]
    fn truncate_body_cuts_long_bodies_on_char_boundary() {
        let body = "é".repeat(300);
        let truncated = truncate_body(&body);

        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 203);
    }
}
