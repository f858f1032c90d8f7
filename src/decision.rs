//! Weather Decision Engine (spec §4.7), grounded in
//! `original_source/waterly/weather.py`'s rain-probability gate, expanded
//! per the spec into a full past/next 12h rainfall comparison against a
//! configured threshold.

use tracing::info;

use crate::store::{Store, WeatherRecord};

/// `T`, the 12-hour rainfall threshold, pre-converted into the unit the
/// weather records are stored in by the caller (imperial: 0.02 inch).
pub const DEFAULT_RAIN_THRESHOLD_IN: f64 = 0.02;

const TWELVE_HOURS_MILLIS: i64 = 12 * 60 * 60 * 1000;
const MIN_FORECAST_ROWS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionInputs {
    pub past_rain: f64,
    pub next_rain: f64,
    pub next_prob: f64,
    pub row_count: usize,
}

/// `should_water` verdict, strict `>` throughout per §9's Open Question
/// resolution.
pub fn should_water(inputs: &DecisionInputs, rain_threshold: f64, prob_threshold: f64) -> bool {
    if inputs.row_count < MIN_FORECAST_ROWS {
        info!(rows = inputs.row_count, "insufficient forecast data, defaulting to watering");
        return true;
    }
    let cancel = inputs.past_rain > rain_threshold
        || (inputs.next_prob > prob_threshold && inputs.next_rain > rain_threshold);
    !cancel
}

/// Load past/next 12h windows from the store and compute the verdict
/// (spec §4.7's full pipeline: store queries → sums/max → `should_water`).
pub async fn evaluate(
    store: &Store,
    now_millis: i64,
    rain_threshold: f64,
    prob_threshold: f64,
) -> Result<bool, crate::error::StorageError> {
    let past: Vec<WeatherRecord> = store.get_weather(now_millis, -1_000_000).await?;
    let past: Vec<WeatherRecord> = past
        .into_iter()
        .filter(|r| r.forecast_ts_utc_millis >= now_millis - TWELVE_HOURS_MILLIS)
        .collect();
    let next: Vec<WeatherRecord> = store.get_weather(now_millis, 1_000_000).await?;
    let next: Vec<WeatherRecord> = next
        .into_iter()
        .filter(|r| r.forecast_ts_utc_millis <= now_millis + TWELVE_HOURS_MILLIS)
        .collect();

    if past.is_empty() && next.is_empty() {
        info!("no forecast rows at all, defaulting to watering");
        return Ok(true);
    }

    let past_rain: f64 = past.iter().map(|r| r.precipitation_amount).sum();
    let next_rain: f64 = next.iter().map(|r| r.precipitation_amount).sum();
    let next_prob: f64 =
        next.iter().map(|r| r.precipitation_probability.unwrap_or(0.0)).fold(0.0, f64::max);

    let inputs = DecisionInputs { past_rain, next_rain, next_prob, row_count: past.len() + next.len() };
    Ok(should_water(&inputs, rain_threshold, prob_threshold))
}
