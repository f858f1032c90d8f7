//! Weather Client (spec §4.6), grounded in
//! `original_source/waterly/weather.py`'s `WeatherService`, adapted to
//! persist per-hour `WeatherRecord`s instead of keeping only a rolling
//! next-12h probability in memory. HTTP via `reqwest`, matching the
//! `reqwest` usage already in the pack's retrieval set for JSON API
//! clients.

use std::collections::HashMap;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::clock;
use crate::error::WeatherFetchError;
use crate::settings::{SettingKey, Settings};
use crate::store::{Store, WeatherRecord};
use crate::units::Unit;

const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);
const FORECAST_DAYS: u8 = 3;
const PAST_DAYS: u8 = 1;
const WINDOW_HOURS: i64 = 24;

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    timezone: String,
    current: CurrentBlock,
    hourly: HourlyBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    time: String,
    temperature_2m: f64,
    precipitation: f64,
    #[serde(default)]
    surface_pressure: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    temperature_2m: Vec<f64>,
    precipitation: Vec<f64>,
    precipitation_probability: Vec<f64>,
    #[serde(default, rename = "soil_moisture_1_to_3cm")]
    soil_moisture: Vec<f64>,
}

pub struct WeatherClient {
    http: reqwest::Client,
    store: Store,
}

impl WeatherClient {
    pub fn new(store: Store) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client builds with a static config");
        Self { http, store }
    }

    /// One fetch-and-upsert cycle (spec §4.6). On success, updates
    /// `WEATHER_LAST_CHECK_TIMESTAMP` and, if the provider's resolved zone
    /// differs from the configured one, `LOCAL_TIMEZONE` too. On failure
    /// the caller is expected to retry at the next tick — nothing here is
    /// partially applied.
    pub async fn refresh(&self, settings: &Settings) -> Result<(), WeatherFetchError> {
        let lat = settings.get_f64(SettingKey::Latitude).await;
        let lon = settings.get_f64(SettingKey::Longitude).await;
        let temp_unit = settings.temperature_unit().await;
        let precip_unit = settings.precipitation_unit().await;

        let response = self
            .http
            .get(OPEN_METEO_URL)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                (
                    "hourly",
                    "precipitation_probability,temperature_2m,precipitation,soil_moisture_1_to_3cm"
                        .to_string(),
                ),
                (
                    "current",
                    "temperature_2m,relative_humidity_2m,precipitation,surface_pressure".to_string(),
                ),
                ("forecast_days", FORECAST_DAYS.to_string()),
                ("past_days", PAST_DAYS.to_string()),
                ("timezone", "auto".to_string()),
                (
                    "temperature_unit",
                    if temp_unit == Unit::Celsius { "celsius" } else { "fahrenheit" }.to_string(),
                ),
                (
                    "precipitation_unit",
                    if precip_unit == Unit::Millimeter { "mm" } else { "inch" }.to_string(),
                ),
            ])
            .send()
            .await?;

        let response = response.error_for_status()?;
        let body = response.text().await?;

        self.save_raw_response(&body).await?;

        let parsed: OpenMeteoResponse =
            serde_json::from_str(&body).map_err(|e| WeatherFetchError::BadShape(e.to_string()))?;

        let offset = clock::resolve_offset(&parsed.timezone);
        let now = clock::local_now(offset);
        let collected_at = clock::now_utc_millis();

        let records = assemble_records(&parsed, now, collected_at)
            .map_err(WeatherFetchError::BadShape)?;
        if records.is_empty() {
            return Err(WeatherFetchError::BadShape("no hourly rows in response".to_string()));
        }

        self.store.record_weather(&records).await.map_err(|e| {
            WeatherFetchError::BadShape(format!("failed to persist weather records: {e}"))
        })?;

        settings.set_i64(SettingKey::WeatherLastCheckTimestamp, collected_at).await;

        let configured_tz = settings.local_timezone_name().await;
        if configured_tz != parsed.timezone {
            info!(from = %configured_tz, to = %parsed.timezone, "local timezone changed");
            settings.set_str(SettingKey::LocalTimezone, parsed.timezone.clone()).await;
        }

        info!(rows = records.len(), "weather refreshed");
        Ok(())
    }

    async fn save_raw_response(&self, body: &str) -> Result<(), WeatherFetchError> {
        let now = OffsetDateTime::now_utc();
        let dir = format!("data/{}", now.year());
        tokio::fs::create_dir_all(&dir).await?;
        let path = format!(
            "{dir}/weather-{:02}{:02}-{:02}{:02}.json",
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute()
        );
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

/// Build one `WeatherRecord` per hourly slot within
/// `[now-WINDOW_HOURS, now+WINDOW_HOURS]`, merging the `current` block into
/// whichever hourly record shares its timestamp.
fn assemble_records(
    resp: &OpenMeteoResponse,
    now: OffsetDateTime,
    collected_at_millis: i64,
) -> Result<Vec<WeatherRecord>, String> {
    let lower = now - time::Duration::hours(WINDOW_HOURS);
    let upper = now + time::Duration::hours(WINDOW_HOURS);

    let current_ts = parse_iso(&resp.current.time)?;
    let mut by_ts: HashMap<i64, WeatherRecord> = HashMap::new();

    let h = &resp.hourly;
    let n = h.time.len();
    if h.temperature_2m.len() != n || h.precipitation.len() != n || h.precipitation_probability.len() != n {
        return Err("hourly arrays have mismatched lengths".to_string());
    }

    for i in 0..n {
        let ts = match parse_iso(&h.time[i]) {
            Ok(ts) => ts,
            Err(_) => continue,
        };
        if ts < lower || ts > upper {
            continue;
        }
        let millis = ts.unix_timestamp() * 1000;
        by_ts.insert(
            millis,
            WeatherRecord {
                collected_at_utc_millis: collected_at_millis,
                forecast_ts_utc_millis: millis,
                tag: "forecast".to_string(),
                temperature: h.temperature_2m[i],
                precipitation_amount: h.precipitation[i],
                precipitation_probability: Some(h.precipitation_probability[i]),
                soil_moisture: h.soil_moisture.get(i).copied().unwrap_or(0.0),
                surface_pressure: None,
            },
        );
    }

    let current_millis = current_ts.unix_timestamp() * 1000;
    match by_ts.get_mut(&current_millis) {
        Some(record) => {
            record.temperature = resp.current.temperature_2m;
            record.precipitation_amount = resp.current.precipitation;
            record.surface_pressure = resp.current.surface_pressure;
        }
        None => {
            by_ts.insert(
                current_millis,
                WeatherRecord {
                    collected_at_utc_millis: collected_at_millis,
                    forecast_ts_utc_millis: current_millis,
                    tag: "current".to_string(),
                    temperature: resp.current.temperature_2m,
                    precipitation_amount: resp.current.precipitation,
                    precipitation_probability: None,
                    soil_moisture: 0.0,
                    surface_pressure: resp.current.surface_pressure,
                },
            );
        }
    }

    let mut records: Vec<_> = by_ts.into_values().collect();
    records.sort_by_key(|r| r.forecast_ts_utc_millis);
    Ok(records)
}

fn parse_iso(s: &str) -> Result<OffsetDateTime, String> {
    let normalized = if s.ends_with('Z') { s.to_string() } else { format!("{s}:00Z") };
    OffsetDateTime::parse(&normalized, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(s, &Rfc3339))
        .map_err(|e| format!("unparseable timestamp {s:?}: {e}"))
}

/// Pre-watering refresh policy (spec §4.6 ambient note): at most one extra
/// refresh inside `[watering_start - window_minutes, watering_start)` per
/// day, tracked by comparing `WEATHER_LAST_CHECK_TIMESTAMP` against the
/// window's start.
pub fn should_pre_watering_refresh(
    now_millis: i64,
    window_start_millis: i64,
    window_end_millis: i64,
    last_check_millis: Option<i64>,
) -> bool {
    if now_millis < window_start_millis || now_millis >= window_end_millis {
        return false;
    }
    match last_check_millis {
        Some(last) => last < window_start_millis,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> OpenMeteoResponse {
        OpenMeteoResponse {
            timezone: "UTC".to_string(),
            current: CurrentBlock {
                time: "2026-07-28T12:00".to_string(),
                temperature_2m: 25.0,
                precipitation: 0.0,
                surface_pressure: Some(1012.0),
            },
            hourly: HourlyBlock {
                time: vec![
                    "2026-07-28T11:00".to_string(),
                    "2026-07-28T12:00".to_string(),
                    "2026-07-28T13:00".to_string(),
                ],
                temperature_2m: vec![24.0, 25.5, 26.0],
                precipitation: vec![0.0, 0.1, 0.0],
                precipitation_probability: vec![10.0, 20.0, 5.0],
                soil_moisture: vec![0.2, 0.2, 0.2],
            },
        }
    }

    #[test]
    fn assembles_one_record_per_hourly_slot_within_window() {
        let resp = sample_response();
        let now = OffsetDateTime::parse("2026-07-28T12:00:00Z", &Rfc3339).unwrap();
        let records = assemble_records(&resp, now, 0).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn merges_current_conditions_into_matching_hourly_row() {
        let resp = sample_response();
        let now = OffsetDateTime::parse("2026-07-28T12:00:00Z", &Rfc3339).unwrap();
        let records = assemble_records(&resp, now, 0).unwrap();
        let merged = records
            .iter()
            .find(|r| r.forecast_ts_utc_millis == now.unix_timestamp() * 1000)
            .unwrap();
        assert_eq!(merged.temperature, 25.0);
        assert_eq!(merged.surface_pressure, Some(1012.0));
        assert!(merged.precipitation_probability.is_some());
    }

    #[test]
    fn rows_outside_the_48h_window_are_dropped() {
        let mut resp = sample_response();
        resp.hourly.time.push("2026-08-05T12:00".to_string());
        resp.hourly.temperature_2m.push(30.0);
        resp.hourly.precipitation.push(0.0);
        resp.hourly.precipitation_probability.push(0.0);
        resp.hourly.soil_moisture.push(0.2);
        let now = OffsetDateTime::parse("2026-07-28T12:00:00Z", &Rfc3339).unwrap();
        let records = assemble_records(&resp, now, 0).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn pre_watering_refresh_happens_once_per_window() {
        let window_start = 1_000_000;
        let window_end = 2_000_000;
        assert!(should_pre_watering_refresh(1_500_000, window_start, window_end, None));
        assert!(should_pre_watering_refresh(1_500_000, window_start, window_end, Some(500_000)));
        assert!(!should_pre_watering_refresh(1_500_000, window_start, window_end, Some(1_200_000)));
        assert!(!should_pre_watering_refresh(500_000, window_start, window_end, None));
    }
}
