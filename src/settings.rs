//! Dynamic, persisted runtime configuration (spec §4.11), grounded in
//! `original_source/waterly/config.py`'s `Settings` enum-with-default
//! catalogue and the teacher's `config.rs` load/apply split — this module
//! is the dynamic counterpart to the static `topology` module.
//!
//! Per spec §9's "Dynamic enum-with-default pattern": each key carries
//! both its string identifier and its typed default, implemented here as
//! a plain Rust enum rather than a dynamically extended class. The
//! "Global CONFIG singleton with a persistence callback" note becomes a
//! `Settings` handle holding a `Store` directly — dependency injection in
//! place of a module-level singleton, with load order "load → start
//! workers" replacing "load → attach hook → start workers" now that the
//! hook *is* the store, not a separately wired callback.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::store::Store;
use crate::units::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    HumidityTargetPercent,
    WateringStartTime,
    WateringMaxMinutesPerZone,
    LastWateringDate,
    RainCancelProbabilityThreshold,
    Units,
    WeatherCheckIntervalSeconds,
    WeatherPreWateringCheckIntervalSeconds,
    WeatherLastCheckTimestamp,
    SensorReadIntervalSeconds,
    TrendMaxSamples,
    LocalTimezone,
    Longitude,
    Latitude,
    GardeningSeasonStart,
    GardeningSeasonEnd,
}

impl SettingKey {
    pub const ALL: &'static [SettingKey] = &[
        SettingKey::HumidityTargetPercent,
        SettingKey::WateringStartTime,
        SettingKey::WateringMaxMinutesPerZone,
        SettingKey::LastWateringDate,
        SettingKey::RainCancelProbabilityThreshold,
        SettingKey::Units,
        SettingKey::WeatherCheckIntervalSeconds,
        SettingKey::WeatherPreWateringCheckIntervalSeconds,
        SettingKey::WeatherLastCheckTimestamp,
        SettingKey::SensorReadIntervalSeconds,
        SettingKey::TrendMaxSamples,
        SettingKey::LocalTimezone,
        SettingKey::Longitude,
        SettingKey::Latitude,
        SettingKey::GardeningSeasonStart,
        SettingKey::GardeningSeasonEnd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::HumidityTargetPercent => "HUMIDITY_TARGET_PERCENT",
            SettingKey::WateringStartTime => "WATERING_START_TIME",
            SettingKey::WateringMaxMinutesPerZone => "WATERING_MAX_MINUTES_PER_ZONE",
            SettingKey::LastWateringDate => "LAST_WATERING_DATE",
            SettingKey::RainCancelProbabilityThreshold => "RAIN_CANCEL_PROBABILITY_THRESHOLD",
            SettingKey::Units => "UNITS",
            SettingKey::WeatherCheckIntervalSeconds => "WEATHER_CHECK_INTERVAL_SECONDS",
            SettingKey::WeatherPreWateringCheckIntervalSeconds => {
                "WEATHER_PRE_WATERING_CHECK_INTERVAL_SECONDS"
            }
            SettingKey::WeatherLastCheckTimestamp => "WEATHER_LAST_CHECK_TIMESTAMP",
            SettingKey::SensorReadIntervalSeconds => "SENSOR_READ_INTERVAL_SECONDS",
            SettingKey::TrendMaxSamples => "TREND_MAX_SAMPLES",
            SettingKey::LocalTimezone => "LOCAL_TIMEZONE",
            SettingKey::Longitude => "LONGITUDE",
            SettingKey::Latitude => "LATITUDE",
            SettingKey::GardeningSeasonStart => "GARDENING_SEASON_START",
            SettingKey::GardeningSeasonEnd => "GARDENING_SEASON_END",
        }
    }

    /// The marshaled (string-form) default, matching `DEFAULT_SETTINGS` in
    /// the original.
    pub fn default_str(self) -> &'static str {
        match self {
            SettingKey::HumidityTargetPercent => "70.0",
            SettingKey::WateringStartTime => "20:30",
            SettingKey::WateringMaxMinutesPerZone => "10",
            SettingKey::LastWateringDate => "",
            SettingKey::RainCancelProbabilityThreshold => "0.50",
            SettingKey::Units => "imperial",
            SettingKey::WeatherCheckIntervalSeconds => "21600",
            SettingKey::WeatherPreWateringCheckIntervalSeconds => "1800",
            SettingKey::WeatherLastCheckTimestamp => "",
            SettingKey::SensorReadIntervalSeconds => "600",
            SettingKey::TrendMaxSamples => "3000",
            SettingKey::LocalTimezone => "UTC",
            SettingKey::Longitude => "0.0",
            SettingKey::Latitude => "0.0",
            SettingKey::GardeningSeasonStart => "03-31",
            SettingKey::GardeningSeasonEnd => "10-31",
        }
    }
}

/// In-memory cache over the persisted settings table. `get`/`set` never
/// fail the caller: a persistence error on `set` is logged and swallowed
/// (spec §4.11: "hook exceptions are swallowed to protect the caller"),
/// and a missing or unparseable key on `get` falls back to the default.
pub struct Settings {
    store: Store,
    cache: RwLock<HashMap<SettingKey, String>>,
}

impl Settings {
    /// First startup: if the table is empty, seed every default and
    /// persist it; otherwise load persisted values, filling in (and
    /// writing back) any key the schema has grown since last run.
    pub async fn load(store: Store) -> Self {
        let mut cache = HashMap::new();
        let mut wrote_back = 0;
        for key in SettingKey::ALL {
            let value = match store.get_setting_raw(key.as_str()).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    let default = key.default_str().to_string();
                    if let Err(e) = store.set_setting_raw(key.as_str(), &default).await {
                        error!(key = key.as_str(), error = %e, "failed to seed default setting");
                    }
                    wrote_back += 1;
                    default
                }
                Err(e) => {
                    error!(key = key.as_str(), error = %e, "failed to load setting, using default");
                    key.default_str().to_string()
                }
            };
            cache.insert(*key, value);
        }
        if wrote_back > 0 {
            info!(count = wrote_back, "seeded missing settings with defaults");
        }
        Self { store, cache: RwLock::new(cache) }
    }

    async fn raw(&self, key: SettingKey) -> String {
        self.cache
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_else(|| key.default_str().to_string())
    }

    pub async fn set_raw(&self, key: SettingKey, value: String) {
        self.cache.write().await.insert(key, value.clone());
        if let Err(e) = self.store.set_setting_raw(key.as_str(), &value).await {
            warn!(key = key.as_str(), error = %e, "failed to persist setting, cache updated anyway");
        }
    }

    pub async fn get_str(&self, key: SettingKey) -> String {
        self.raw(key).await
    }

    pub async fn get_opt_str(&self, key: SettingKey) -> Option<String> {
        let v = self.raw(key).await;
        if v.is_empty() { None } else { Some(v) }
    }

    pub async fn get_f64(&self, key: SettingKey) -> f64 {
        self.raw(key)
            .await
            .parse()
            .unwrap_or_else(|_| key.default_str().parse().unwrap_or(0.0))
    }

    pub async fn get_i64(&self, key: SettingKey) -> i64 {
        self.raw(key)
            .await
            .parse()
            .unwrap_or_else(|_| key.default_str().parse().unwrap_or(0))
    }

    pub async fn set_str(&self, key: SettingKey, value: impl Into<String>) {
        self.set_raw(key, value.into()).await;
    }

    pub async fn set_f64(&self, key: SettingKey, value: f64) {
        self.set_raw(key, value.to_string()).await;
    }

    pub async fn set_i64(&self, key: SettingKey, value: i64) {
        self.set_raw(key, value.to_string()).await;
    }

    /// `UNITS` marshaled to the concrete unit triple the rest of the
    /// system consumes.
    pub async fn temperature_unit(&self) -> Unit {
        match self.get_str(SettingKey::Units).await.as_str() {
            "metric" => Unit::Celsius,
            _ => Unit::Fahrenheit,
        }
    }

    pub async fn volume_unit(&self) -> Unit {
        match self.get_str(SettingKey::Units).await.as_str() {
            "metric" => Unit::Liter,
            _ => Unit::Gallon,
        }
    }

    pub async fn precipitation_unit(&self) -> Unit {
        match self.get_str(SettingKey::Units).await.as_str() {
            "metric" => Unit::Millimeter,
            _ => Unit::Inch,
        }
    }

    /// The one non-trivial marshal/unmarshal asymmetry the original
    /// carries just for `LOCAL_TIMEZONE`: the stored form is a plain
    /// string, callers that need an offset resolve it on demand via
    /// [`crate::clock::resolve_offset`].
    pub async fn local_timezone_name(&self) -> String {
        self.get_str(SettingKey::LocalTimezone).await
    }
}
