//! Measurement & Trend persistence (spec §4.5), grounded in the teacher's
//! `db.rs`: a `sqlx` SQLite pool with WAL journaling, short-lived
//! connections per operation, and a periodic prune/backup pair. The schema
//! migration strategy itself diverges from the teacher (see
//! `store::migrations`) because the spec's versioning contract is
//! incompatible with `sqlx::migrate!`.

pub mod migrations;

use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::StorageError;
use crate::units::Unit;

pub use migrations::MigrateOutcome;

// ---------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Humidity,
    Temperature,
    Ph,
    Ec,
    Salinity,
    Tds,
    Nitrogen,
    Phosphorus,
    Potassium,
    Water,
    RpiTemp,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Humidity => "humidity",
            Trend::Temperature => "temperature",
            Trend::Ph => "ph",
            Trend::Ec => "ec",
            Trend::Salinity => "salinity",
            Trend::Tds => "tds",
            Trend::Nitrogen => "n",
            Trend::Phosphorus => "p",
            Trend::Potassium => "k",
            Trend::Water => "water",
            Trend::RpiTemp => "rpi_temp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "humidity" => Trend::Humidity,
            "temperature" => Trend::Temperature,
            "ph" => Trend::Ph,
            "ec" => Trend::Ec,
            "salinity" => Trend::Salinity,
            "tds" => Trend::Tds,
            "n" => Trend::Nitrogen,
            "p" => Trend::Phosphorus,
            "k" => Trend::Potassium,
            "water" => Trend::Water,
            "rpi_temp" => Trend::RpiTemp,
            _ => return None,
        })
    }

    /// Whether `unit` is in the allowed set for this trend (spec §8
    /// invariant: "unit belongs to the allowed set for T").
    pub fn allows_unit(self, unit: Unit) -> bool {
        matches!(
            (self, unit),
            (Trend::Temperature | Trend::RpiTemp, Unit::Celsius | Unit::Fahrenheit)
                | (Trend::Water, Unit::Liter | Unit::Gallon)
                | (
                    Trend::Humidity | Trend::Ph | Trend::Ec | Trend::Salinity | Trend::Tds
                        | Trend::Nitrogen | Trend::Phosphorus | Trend::Potassium,
                    Unit::Opaque
                )
        )
    }
}

fn unit_to_db(unit: Unit) -> &'static str {
    match unit {
        Unit::Celsius => "C",
        Unit::Fahrenheit => "F",
        Unit::Liter => "L",
        Unit::Gallon => "gal",
        Unit::Millimeter => "mm",
        Unit::Inch => "in",
        Unit::Opaque => "",
    }
}

fn unit_from_db(s: &str) -> Unit {
    match s {
        "C" => Unit::Celsius,
        "F" => Unit::Fahrenheit,
        "L" => Unit::Liter,
        "gal" => Unit::Gallon,
        "mm" => Unit::Millimeter,
        "in" => Unit::Inch,
        _ => Unit::Opaque,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub trend: Trend,
    pub zone: String,
    pub ts_utc_millis: i64,
    pub value: f64,
    pub unit: Unit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WateringMeasurement {
    pub zone: String,
    pub ts_utc_millis: i64,
    pub volume: f64,
    pub unit: Unit,
    pub humidity_start_pct: f64,
    pub humidity_end_pct: f64,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub collected_at_utc_millis: i64,
    pub forecast_ts_utc_millis: i64,
    pub tag: String,
    pub temperature: f64,
    pub precipitation_amount: f64,
    pub precipitation_probability: Option<f64>,
    pub soil_moisture: f64,
    pub surface_pressure: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ZoneRow {
    pub zone_id: String,
    pub name: String,
    pub description: String,
    pub relay_gpio_pin: i64,
    pub rh_sensor_addr: i64,
    pub npk_sensor_addr: Option<i64>,
    pub min_sensor_humidity_pct: f64,
    pub target_humidity_pct: f64,
}

// ---------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect with WAL journaling and `synchronous = NORMAL`, matching
    /// the teacher's `Db::connect`. A short connection pool is sufficient
    /// since the store never holds a connection across operations.
    pub async fn connect(db_url: &str) -> Result<Self, StorageError> {
        let opts: SqliteConnectOptions = db_url
            .parse::<SqliteConnectOptions>()
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new().max_connections(2).connect_with(opts).await?;
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL").execute(&pool).await.ok();
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<MigrateOutcome, StorageError> {
        migrations::migrate(&self.pool).await
    }

    // -- Zones -----------------------------------------------------------

    pub async fn upsert_zone(&self, zone: &ZoneRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO zones(zone_id, name, description, relay_gpio_pin, rh_sensor_addr, \
             npk_sensor_addr, min_sensor_humidity_pct, target_humidity_pct) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(zone_id) DO UPDATE SET \
             name = excluded.name, description = excluded.description, \
             relay_gpio_pin = excluded.relay_gpio_pin, rh_sensor_addr = excluded.rh_sensor_addr, \
             npk_sensor_addr = excluded.npk_sensor_addr, \
             min_sensor_humidity_pct = excluded.min_sensor_humidity_pct, \
             target_humidity_pct = excluded.target_humidity_pct",
        )
        .bind(&zone.zone_id)
        .bind(&zone.name)
        .bind(&zone.description)
        .bind(zone.relay_gpio_pin)
        .bind(zone.rh_sensor_addr)
        .bind(zone.npk_sensor_addr)
        .bind(zone.min_sensor_humidity_pct)
        .bind(zone.target_humidity_pct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Zones ordered by `zone_id` — the lexicographic order the watering
    /// cycle (spec §4.9.1) processes zones in.
    pub async fn load_zones(&self) -> Result<Vec<ZoneRow>, StorageError> {
        let rows = sqlx::query_as::<_, ZoneRow>("SELECT * FROM zones ORDER BY zone_id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -- Measurements ------------------------------------------------------

    /// Insert one Measurement, converting to `target_unit` first if given
    /// and different from `m.unit` (spec §4.5 `record`). Duplicate
    /// `(trend, zone, timestamp)` replaces the prior row — the store is
    /// idempotent under retry.
    pub async fn record(&self, m: &Measurement, target_unit: Option<Unit>) -> Result<(), StorageError> {
        let (value, unit) = match target_unit {
            Some(u) if u != m.unit => (crate::units::convert(m.value, m.unit, u), u),
            _ => (m.value, m.unit),
        };
        sqlx::query(
            "INSERT OR REPLACE INTO measurements(trend, zone_id, ts_utc_millis, value, unit) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(m.trend.as_str())
        .bind(&m.zone)
        .bind(m.ts_utc_millis)
        .bind(value)
        .bind(unit_to_db(unit))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One logical burst writing six trend points at the same instant
    /// (spec §4.5 `record_rh`, grounded in `storage.py`'s `record_rh`).
    #[allow(clippy::too_many_arguments)]
    pub async fn record_rh(
        &self,
        zone: &str,
        ts_utc_millis: i64,
        rh_pct: f64,
        temp: f64,
        temp_unit: Unit,
        ph: f64,
        ec: f64,
        salinity: f64,
        tds: f64,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let rows = [
            (Trend::Humidity, rh_pct, Unit::Opaque),
            (Trend::Temperature, temp, temp_unit),
            (Trend::Ph, ph, Unit::Opaque),
            (Trend::Ec, ec, Unit::Opaque),
            (Trend::Salinity, salinity, Unit::Opaque),
            (Trend::Tds, tds, Unit::Opaque),
        ];
        for (trend, value, unit) in rows {
            sqlx::query(
                "INSERT OR REPLACE INTO measurements(trend, zone_id, ts_utc_millis, value, unit) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(trend.as_str())
            .bind(zone)
            .bind(ts_utc_millis)
            .bind(value)
            .bind(unit_to_db(unit))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_npk(
        &self,
        zone: &str,
        ts_utc_millis: i64,
        n: f64,
        p: f64,
        k: f64,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for (trend, value) in [(Trend::Nitrogen, n), (Trend::Phosphorus, p), (Trend::Potassium, k)] {
            sqlx::query(
                "INSERT OR REPLACE INTO measurements(trend, zone_id, ts_utc_millis, value, unit) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(trend.as_str())
            .bind(zone)
            .bind(ts_utc_millis)
            .bind(value)
            .bind(unit_to_db(Unit::Opaque))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_watering(&self, m: &WateringMeasurement) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO measurements \
             (trend, zone_id, ts_utc_millis, value, unit, humidity_start_pct, humidity_end_pct, duration_seconds) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Trend::Water.as_str())
        .bind(&m.zone)
        .bind(m.ts_utc_millis)
        .bind(m.volume)
        .bind(unit_to_db(m.unit))
        .bind(m.humidity_start_pct)
        .bind(m.humidity_end_pct)
        .bind(m.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_rpi_temperature(&self, m: &Measurement) -> Result<(), StorageError> {
        self.record(m, None).await
    }

    /// Latest value for `(zone, trend)`, if any has ever been recorded.
    pub async fn latest(&self, zone: &str, trend: Trend) -> Result<Option<Measurement>, StorageError> {
        let row: Option<(f64, String, i64)> = sqlx::query_as(
            "SELECT value, unit, ts_utc_millis FROM measurements \
             WHERE zone_id = ? AND trend = ? ORDER BY ts_utc_millis DESC LIMIT 1",
        )
        .bind(zone)
        .bind(trend.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value, unit, ts)| Measurement {
            trend,
            zone: zone.to_string(),
            ts_utc_millis: ts,
            value,
            unit: unit_from_db(&unit),
        }))
    }

    // -- Weather -----------------------------------------------------------

    pub async fn record_weather(&self, records: &[WeatherRecord]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                "INSERT INTO weather_records \
                 (forecast_ts_utc_millis, collected_at_utc_millis, tag, temperature, \
                  precipitation_amount, precipitation_probability, soil_moisture, surface_pressure) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(forecast_ts_utc_millis) DO UPDATE SET \
                 collected_at_utc_millis = excluded.collected_at_utc_millis, \
                 tag = excluded.tag, temperature = excluded.temperature, \
                 precipitation_amount = excluded.precipitation_amount, \
                 precipitation_probability = excluded.precipitation_probability, \
                 soil_moisture = excluded.soil_moisture, \
                 surface_pressure = excluded.surface_pressure",
            )
            .bind(r.forecast_ts_utc_millis)
            .bind(r.collected_at_utc_millis)
            .bind(&r.tag)
            .bind(r.temperature)
            .bind(r.precipitation_amount)
            .bind(r.precipitation_probability)
            .bind(r.soil_moisture)
            .bind(r.surface_pressure)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `count > 0`: next `count` forecast rows (non-null probability) at
    /// `forecast_ts >= from_ts`, ascending. `count < 0`: previous `|count|`
    /// rows before `from_ts`, descending. `count == 0`: `[]` (spec §8
    /// boundary behavior).
    pub async fn get_weather(&self, from_ts_millis: i64, count: i64) -> Result<Vec<WeatherRecord>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let rows = if count > 0 {
            sqlx::query_as::<_, WeatherRecordRow>(
                "SELECT * FROM weather_records \
                 WHERE forecast_ts_utc_millis >= ? AND precipitation_probability IS NOT NULL \
                 ORDER BY forecast_ts_utc_millis ASC LIMIT ?",
            )
            .bind(from_ts_millis)
            .bind(count)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, WeatherRecordRow>(
                "SELECT * FROM weather_records \
                 WHERE forecast_ts_utc_millis < ? AND precipitation_probability IS NOT NULL \
                 ORDER BY forecast_ts_utc_millis DESC LIMIT ?",
            )
            .bind(from_ts_millis)
            .bind(-count)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // -- Settings ------------------------------------------------------------

    pub async fn get_setting_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting_raw(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO settings(key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Maintenance -----------------------------------------------------------

    /// Delete measurements older than `cutoff_millis`; returns rows deleted.
    pub async fn prune_before(&self, cutoff_millis: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM measurements WHERE ts_utc_millis < ?")
            .bind(cutoff_millis)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            sqlx::query("PRAGMA incremental_vacuum(100)").execute(&self.pool).await.ok();
            info!(deleted, "pruned old measurements");
        }
        Ok(deleted)
    }

    /// Atomic backup via `VACUUM INTO` plus rename, matching the teacher's
    /// `db.rs::backup`.
    pub async fn backup(&self, dest_path: &Path) -> Result<(), StorageError> {
        let tmp_path = dest_path.with_extension("sqlite.tmp");
        let tmp_str = tmp_path.to_string_lossy().to_string();
        sqlx::query(&format!("VACUUM INTO '{tmp_str}'")).execute(&self.pool).await?;
        if let Err(e) = std::fs::rename(&tmp_path, dest_path) {
            warn!(error = %e, "backup rename failed");
            return Err(StorageError::Database(sqlx::Error::Io(e)));
        }
        info!(path = %dest_path.display(), "database backed up");
        Ok(())
    }
}

pub fn now_utc_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000
}

#[derive(sqlx::FromRow)]
struct WeatherRecordRow {
    forecast_ts_utc_millis: i64,
    collected_at_utc_millis: i64,
    tag: String,
    temperature: f64,
    precipitation_amount: f64,
    precipitation_probability: Option<f64>,
    soil_moisture: f64,
    surface_pressure: Option<f64>,
}

impl From<WeatherRecordRow> for WeatherRecord {
    fn from(r: WeatherRecordRow) -> Self {
        WeatherRecord {
            collected_at_utc_millis: r.collected_at_utc_millis,
            forecast_ts_utc_millis: r.forecast_ts_utc_millis,
            tag: r.tag,
            temperature: r.temperature,
            precipitation_amount: r.precipitation_amount,
            precipitation_probability: r.precipitation_probability,
            soil_moisture: r.soil_moisture,
            surface_pressure: r.surface_pressure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn zone(id: &str) -> ZoneRow {
        ZoneRow {
            zone_id: id.to_string(),
            name: format!("Zone {id}"),
            description: String::new(),
            relay_gpio_pin: 17,
            rh_sensor_addr: 0x0A,
            npk_sensor_addr: None,
            min_sensor_humidity_pct: 30.0,
            target_humidity_pct: 70.0,
        }
    }

    #[tokio::test]
    async fn zones_round_trip_in_lexicographic_order() {
        let store = test_store().await;
        store.upsert_zone(&zone("Z3")).await.unwrap();
        store.upsert_zone(&zone("Z1")).await.unwrap();
        store.upsert_zone(&zone("Z2")).await.unwrap();

        let zones = store.load_zones().await.unwrap();
        let ids: Vec<_> = zones.iter().map(|z| z.zone_id.clone()).collect();
        assert_eq!(ids, vec!["Z1", "Z2", "Z3"]);
    }

    #[tokio::test]
    async fn record_rh_burst_shares_one_timestamp() {
        let store = test_store().await;
        store.upsert_zone(&zone("Z1")).await.unwrap();
        let ts = now_utc_millis();
        store
            .record_rh("Z1", ts, 45.0, 22.0, Unit::Celsius, 6.5, 1400.0, 300.0, 450.0)
            .await
            .unwrap();

        for trend in [
            Trend::Humidity,
            Trend::Temperature,
            Trend::Ph,
            Trend::Ec,
            Trend::Salinity,
            Trend::Tds,
        ] {
            let m = store.latest("Z1", trend).await.unwrap().unwrap();
            assert_eq!(m.ts_utc_millis, ts);
        }
    }

    #[tokio::test]
    async fn record_converts_to_target_unit() {
        let store = test_store().await;
        store.upsert_zone(&zone("Z1")).await.unwrap();
        let m = Measurement {
            trend: Trend::Temperature,
            zone: "Z1".into(),
            ts_utc_millis: now_utc_millis(),
            value: 0.0,
            unit: Unit::Celsius,
        };
        store.record(&m, Some(Unit::Fahrenheit)).await.unwrap();
        let stored = store.latest("Z1", Trend::Temperature).await.unwrap().unwrap();
        assert_eq!(stored.unit, Unit::Fahrenheit);
        assert!((stored.value - 32.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn get_weather_zero_count_returns_empty() {
        let store = test_store().await;
        assert!(store.get_weather(0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_weather_excludes_current_conditions_rows() {
        let store = test_store().await;
        let base = 1_700_000_000_000i64;
        store
            .record_weather(&[
                WeatherRecord {
                    collected_at_utc_millis: base,
                    forecast_ts_utc_millis: base,
                    tag: "current".into(),
                    temperature: 20.0,
                    precipitation_amount: 0.0,
                    precipitation_probability: None,
                    soil_moisture: 0.2,
                    surface_pressure: Some(1013.0),
                },
                WeatherRecord {
                    collected_at_utc_millis: base,
                    forecast_ts_utc_millis: base + 3_600_000,
                    tag: "forecast".into(),
                    temperature: 21.0,
                    precipitation_amount: 1.0,
                    precipitation_probability: Some(50.0),
                    soil_moisture: 0.25,
                    surface_pressure: None,
                },
            ])
            .await
            .unwrap();

        let rows = store.get_weather(base, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tag, "forecast");
    }

    #[tokio::test]
    async fn get_weather_negative_count_orders_descending() {
        let store = test_store().await;
        let base = 1_700_000_000_000i64;
        let mut records = Vec::new();
        for i in 0..3 {
            records.push(WeatherRecord {
                collected_at_utc_millis: base,
                forecast_ts_utc_millis: base - (i + 1) * 3_600_000,
                tag: "forecast".into(),
                temperature: 10.0,
                precipitation_amount: 0.0,
                precipitation_probability: Some(10.0),
                soil_moisture: 0.1,
                surface_pressure: None,
            });
        }
        store.record_weather(&records).await.unwrap();

        let rows = store.get_weather(base, -2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].forecast_ts_utc_millis > rows[1].forecast_ts_utc_millis);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let store = test_store().await;
        assert_eq!(store.get_setting_raw("units").await.unwrap(), None);
        store.set_setting_raw("units", "imperial").await.unwrap();
        assert_eq!(store.get_setting_raw("units").await.unwrap(), Some("imperial".into()));
        store.set_setting_raw("units", "metric").await.unwrap();
        assert_eq!(store.get_setting_raw("units").await.unwrap(), Some("metric".into()));
    }

    #[tokio::test]
    async fn prune_before_deletes_only_older_rows() {
        let store = test_store().await;
        store.upsert_zone(&zone("Z1")).await.unwrap();
        let old = Measurement { trend: Trend::Humidity, zone: "Z1".into(), ts_utc_millis: 1000, value: 10.0, unit: Unit::Opaque };
        let new = Measurement { trend: Trend::Humidity, zone: "Z1".into(), ts_utc_millis: 5_000_000, value: 20.0, unit: Unit::Opaque };
        store.record(&old, None).await.unwrap();
        store.record(&new, None).await.unwrap();

        let deleted = store.prune_before(1_000_000).await.unwrap();
        assert_eq!(deleted, 1);
        let latest = store.latest("Z1", Trend::Humidity).await.unwrap().unwrap();
        assert_eq!(latest.ts_utc_millis, 5_000_000);
    }

    #[tokio::test]
    async fn trend_allows_unit_enforces_allowed_set() {
        assert!(Trend::Temperature.allows_unit(Unit::Celsius));
        assert!(!Trend::Temperature.allows_unit(Unit::Liter));
        assert!(Trend::Water.allows_unit(Unit::Gallon));
        assert!(Trend::Humidity.allows_unit(Unit::Opaque));
        assert!(!Trend::Humidity.allows_unit(Unit::Celsius));
    }
}
