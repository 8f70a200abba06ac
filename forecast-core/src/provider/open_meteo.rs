use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::ProviderConfig,
    error::ProviderError,
    model::{AlignedSeries, CurrentWeather},
};

use super::{ForecastProvider, truncate_body};

pub const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

const HOURLY_METRICS: &str =
    "temperature_2m,windspeed_10m,pressure_msl,relative_humidity_2m,precipitation";

const HOUR_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    base_url: String,
    http: Client,
}

impl OpenMeteoProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self { base_url: config.base_url.clone(), http })
    }

    async fn get(&self, query: &[(&str, String)]) -> Result<String, ProviderError> {
        let res = self.http.get(&self.base_url).query(query).send().await?;

        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            return Err(ProviderError::Status { status, body: truncate_body(&body) });
        }

        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct OmHourly {
    temperature_2m: Option<Vec<Option<f64>>>,
    windspeed_10m: Option<Vec<Option<f64>>>,
    relative_humidity_2m: Option<Vec<Option<f64>>>,
    precipitation: Option<Vec<Option<f64>>>,
    pressure_msl: Option<Vec<Option<f64>>>,
}

#[derive(Debug, Deserialize)]
struct OmForecastResponse {
    hourly: Option<OmHourly>,
}

#[derive(Debug, Deserialize)]
struct OmCurrentWeather {
    temperature: f64,
    windspeed: f64,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OmCurrentResponse {
    current_weather: Option<OmCurrentWeather>,
    hourly: Option<OmHourly>,
}

fn required(name: &str, values: Option<Vec<Option<f64>>>) -> Result<Vec<f64>, ProviderError> {
    let values =
        values.ok_or_else(|| ProviderError::Malformed(format!("missing hourly.{name}")))?;

    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| ProviderError::Malformed(format!("null hourly.{name}[{i}]")))
        })
        .collect()
}

impl OmHourly {
    fn into_series(self) -> Result<AlignedSeries, ProviderError> {
        let temperature = required("temperature_2m", self.temperature_2m)?;
        let wind_speed = required("windspeed_10m", self.windspeed_10m)?;
        let humidity = required("relative_humidity_2m", self.relative_humidity_2m)?;
        let precipitation = self
            .precipitation
            .ok_or_else(|| ProviderError::Malformed("missing hourly.precipitation".into()))?;

        let hours = temperature.len();
        if wind_speed.len() != hours || humidity.len() != hours || precipitation.len() != hours {
            return Err(ProviderError::Malformed(format!(
                "hourly arrays are not aligned (temperature={hours}, wind={}, humidity={}, precipitation={})",
                wind_speed.len(),
                humidity.len(),
                precipitation.len(),
            )));
        }

        Ok(AlignedSeries {
            temperature,
            wind_speed,
            humidity: humidity.into_iter().map(|h| h.round().clamp(0.0, 100.0) as u8).collect(),
            precipitation,
        })
    }
}

#[async_trait]
impl ForecastProvider for OpenMeteoProvider {
    async fn fetch_hourly_forecast(
        &self,
        latitude: f64,
        longitude: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AlignedSeries, ProviderError> {
        if start >= end {
            return Err(ProviderError::InvalidWindow);
        }

        // Open-Meteo treats `end_hour` as inclusive.
        let last_hour = end - Duration::hours(1);

        let body = self
            .get(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("hourly", HOURLY_METRICS.to_string()),
                ("start_hour", start.format(HOUR_FORMAT).to_string()),
                ("end_hour", last_hour.format(HOUR_FORMAT).to_string()),
                ("timezone", "GMT".to_string()),
            ])
            .await?;

        let parsed: OmForecastResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let series = parsed
            .hourly
            .ok_or_else(|| ProviderError::Malformed("missing hourly block".into()))?
            .into_series()?;

        debug!(latitude, longitude, hours = series.hour_count(), "Fetched hourly forecast");

        Ok(series)
    }

    async fn fetch_current(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<CurrentWeather, ProviderError> {
        let body = self
            .get(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("current_weather", "true".to_string()),
                ("hourly", "pressure_msl".to_string()),
                ("timezone", "GMT".to_string()),
            ])
            .await?;

        let parsed: OmCurrentResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let current = parsed
            .current_weather
            .ok_or_else(|| ProviderError::Malformed("missing current_weather block".into()))?;

        let pressure = parsed
            .hourly
            .and_then(|h| h.pressure_msl)
            .and_then(|p| p.into_iter().next().flatten());

        let observation_time = current
            .time
            .as_deref()
            .and_then(|t| NaiveDateTime::parse_from_str(t, HOUR_FORMAT).ok())
            .map(|naive| naive.and_utc());

        Ok(CurrentWeather {
            temperature: current.temperature,
            wind_speed: current.windspeed,
            pressure,
            observation_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenMeteoProvider {
        let config = ProviderConfig {
            base_url: format!("{}/v1/forecast", server.uri()),
            timeout_secs: 5,
        };
        OpenMeteoProvider::new(&config).unwrap()
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 14, 0, 0).unwrap();
        (start, start + Duration::hours(24))
    }

    fn hourly_body(hours: usize) -> serde_json::Value {
        json!({
            "latitude": 52.52,
            "longitude": 13.405,
            "hourly": {
                "time": (0..hours).map(|i| format!("T{i}")).collect::<Vec<_>>(),
                "temperature_2m": (0..hours).map(|i| 10.0 + i as f64).collect::<Vec<_>>(),
                "windspeed_10m": (0..hours).map(|i| i as f64 / 2.0).collect::<Vec<_>>(),
                "pressure_msl": vec![1013.0; hours],
                "relative_humidity_2m": vec![65; hours],
                "precipitation": (0..hours)
                    .map(|i| if i == 0 { serde_json::Value::Null } else { json!(0.1) })
                    .collect::<Vec<_>>(),
            }
        })
    }

    #[tokio::test]
    async fn fetch_hourly_sends_window_and_metrics() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("latitude", "52.52"))
            .and(query_param("longitude", "13.405"))
            .and(query_param("hourly", HOURLY_METRICS))
            .and(query_param("start_hour", "2024-03-10T14:00"))
            .and(query_param("end_hour", "2024-03-11T13:00"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(24)))
            .expect(1)
            .mount(&server)
            .await;

        let (start, end) = window();
        let series =
            provider_for(&server).fetch_hourly_forecast(52.52, 13.405, start, end).await.unwrap();

        assert_eq!(series.hour_count(), 24);
        assert_eq!(series.temperature[5], 15.0);
        assert_eq!(series.wind_speed[4], 2.0);
        assert_eq!(series.humidity[23], 65);
        assert_eq!(series.precipitation[0], None);
        assert_eq!(series.precipitation[1], Some(0.1));
    }

    #[tokio::test]
    async fn non_success_status_is_provider_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let (start, end) = window();
        let err =
            provider_for(&server).fetch_hourly_forecast(1.0, 2.0, start, end).await.unwrap_err();

        match err {
            ProviderError::Status { status, body } => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn misaligned_arrays_are_malformed() {
        let server = MockServer::start().await;

        let mut body = hourly_body(24);
        body["hourly"]["windspeed_10m"] = json!([1.0, 2.0]);

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let (start, end) = window();
        let err =
            provider_for(&server).fetch_hourly_forecast(1.0, 2.0, start, end).await.unwrap_err();

        assert!(matches!(err, ProviderError::Malformed(ref m) if m.contains("not aligned")));
    }

    #[tokio::test]
    async fn missing_metric_is_malformed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "hourly": { "temperature_2m": [1.0] } })),
            )
            .mount(&server)
            .await;

        let (start, end) = window();
        let err =
            provider_for(&server).fetch_hourly_forecast(1.0, 2.0, start, end).await.unwrap_err();

        assert!(matches!(err, ProviderError::Malformed(ref m) if m.contains("windspeed_10m")));
    }

    #[tokio::test]
    async fn invalid_body_is_malformed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let (start, end) = window();
        let err =
            provider_for(&server).fetch_hourly_forecast(1.0, 2.0, start, end).await.unwrap_err();

        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn inverted_window_is_rejected_without_a_request() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hourly_body(24)))
            .expect(0)
            .mount(&server)
            .await;

        let (start, end) = window();
        let err =
            provider_for(&server).fetch_hourly_forecast(1.0, 2.0, end, start).await.unwrap_err();

        assert!(matches!(err, ProviderError::InvalidWindow));
    }

    #[tokio::test]
    async fn fetch_current_reads_pressure_from_first_hour() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(query_param("current_weather", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "current_weather": { "temperature": 7.5, "windspeed": 12.1, "time": "2024-03-10T14:00" },
                "hourly": { "pressure_msl": [1008.4, 1009.0] }
            })))
            .mount(&server)
            .await;

        let current = provider_for(&server).fetch_current(52.52, 13.405).await.unwrap();

        assert_eq!(current.temperature, 7.5);
        assert_eq!(current.wind_speed, 12.1);
        assert_eq!(current.pressure, Some(1008.4));
        assert_eq!(current.observation_time, Some(window().0));
    }
}
