//! Watering Scheduler (spec §4.9/§4.9.1): a single worker running two
//! independent cadences — sensor polling and the once-daily watering
//! cycle — grounded in `original_source/waterly/scheduler.py`'s
//! `WateringManager` and generalizing the teacher's `scheduler.rs`
//! per-zone state-machine idiom (tick loop, guard sequences, `tracing`
//! instrumentation) away from MQTT/`SharedState` and onto direct
//! relay/store calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::clock;
use crate::decision;
use crate::pulses::PulseCounter;
use crate::season;
use crate::settings::{SettingKey, Settings};
use crate::store::{Measurement, Store, Trend, WateringMeasurement};
use crate::units::Unit;
use crate::zone::Zone;

/// Wake interval for the outer tick loop (spec §4.9.1 ambient "Tick
/// granularity" note) — independent of `SENSOR_READ_INTERVAL_SECONDS`, so
/// shutdown latency stays bounded.
const TICK_GRANULARITY: Duration = Duration::from_secs(5);

/// Wait between humidity re-reads during an active watering loop, and
/// between zones (valve settling), per spec §4.9.1 steps 3 and 6.
const WATERING_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct WateringScheduler {
    store: Store,
    settings: Arc<Settings>,
    zones: Vec<Arc<Zone>>,
    pulses: PulseCounter,
    stop: Arc<AtomicBool>,
}

impl WateringScheduler {
    pub fn new(store: Store, settings: Arc<Settings>, zones: Vec<Arc<Zone>>, pulses: PulseCounter) -> Self {
        Self { store, settings, zones, pulses, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// A clone-able handle the signal handler can flip to stop the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs until `stop_handle()` is set. The `finally` guarantee (spec
    /// §4.9.1/§5): every relay is forced off before this returns, win or
    /// lose.
    pub async fn run(&self) {
        info!(zones = self.zones.len(), "watering scheduler started");
        let mut last_poll_millis: i64 = 0;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            let now = clock::now_utc_millis();
            let poll_interval_ms =
                self.settings.get_i64(SettingKey::SensorReadIntervalSeconds).await * 1000;
            if now - last_poll_millis >= poll_interval_ms {
                self.poll_sensors().await;
                last_poll_millis = now;
            }

            self.maybe_run_daily_watering().await;

            tokio::time::sleep(TICK_GRANULARITY).await;
        }

        for zone in &self.zones {
            zone.stop_watering().await;
        }
        info!("watering scheduler stopped, all relays off");
    }

    /// One sweep over every zone in definition order, each with a
    /// ≥250 ms inter-frame gap already enforced inside `Zone::measurements`,
    /// then the Raspberry Pi CPU temperature (spec §4.9 item 1).
    pub async fn poll_sensors(&self) {
        info!("polling sensors for all zones");
        let ts = clock::now_utc_millis();

        for zone in &self.zones {
            zone.open_bus();
            let readings = zone.measurements(ts).await;
            if readings.is_empty() {
                warn!(zone = zone.id(), "no sensor readings available, sensor disconnected?");
            } else if let Err(e) = self.persist_zone_readings(zone, &readings, ts).await {
                error!(zone = zone.id(), error = %e, "failed to persist zone readings");
            }
            zone.close_bus();
        }

        if let Some(cpu_temp_c) = read_cpu_temperature_c() {
            let m = Measurement {
                trend: Trend::RpiTemp,
                zone: "rpi".to_string(),
                ts_utc_millis: ts,
                value: cpu_temp_c as f64,
                unit: Unit::Celsius,
            };
            if let Err(e) = self.store.record_rpi_temperature(&m).await {
                warn!(error = %e, "failed to record rpi temperature");
            }
        }
        info!("sensor polling finished");
    }

    async fn persist_zone_readings(
        &self,
        zone: &Zone,
        readings: &std::collections::HashMap<Trend, Measurement>,
        ts: i64,
    ) -> Result<(), crate::error::StorageError> {
        if let (Some(h), Some(t), Some(ph), Some(ec), Some(sal), Some(tds)) = (
            readings.get(&Trend::Humidity),
            readings.get(&Trend::Temperature),
            readings.get(&Trend::Ph),
            readings.get(&Trend::Ec),
            readings.get(&Trend::Salinity),
            readings.get(&Trend::Tds),
        ) {
            self.store
                .record_rh(zone.id(), ts, h.value, t.value, t.unit, ph.value, ec.value, sal.value, tds.value)
                .await?;
        }
        if let (Some(n), Some(p), Some(k)) = (
            readings.get(&Trend::Nitrogen),
            readings.get(&Trend::Phosphorus),
            readings.get(&Trend::Potassium),
        ) {
            self.store.record_npk(zone.id(), ts, n.value, p.value, k.value).await?;
        }
        Ok(())
    }

    /// Daily guard sequence (spec §4.9 item 2): `last_watering_date !=
    /// today`, `now >= watering_start_time`, `in_gardening_season(now)`.
    /// Every "done" exit persists `LAST_WATERING_DATE` before returning.
    async fn maybe_run_daily_watering(&self) {
        let tz_name = self.settings.local_timezone_name().await;
        let offset = clock::resolve_offset(&tz_name);
        let local_now = clock::local_now(offset);
        let today = format!(
            "{:04}-{:02}-{:02}",
            local_now.year(),
            u8::from(local_now.month()),
            local_now.day()
        );

        if self.settings.get_opt_str(SettingKey::LastWateringDate).await.as_deref() == Some(today.as_str()) {
            return;
        }

        let start_time = self.settings.get_str(SettingKey::WateringStartTime).await;
        let Some((start_h, start_m)) = parse_hh_mm(&start_time) else {
            warn!(value = %start_time, "invalid WATERING_START_TIME, skipping guard this tick");
            return;
        };
        if (local_now.hour(), local_now.minute()) < (start_h, start_m) {
            return;
        }

        let season_start = self.settings.get_str(SettingKey::GardeningSeasonStart).await;
        let season_end = self.settings.get_str(SettingKey::GardeningSeasonEnd).await;
        if !season::in_season(local_now.date(), &season_start, &season_end) {
            warn!(date = %today, start = %season_start, end = %season_end, "outside gardening season, skipping watering today");
            self.settings.set_str(SettingKey::LastWateringDate, today).await;
            return;
        }

        let precip_unit = self.settings.precipitation_unit().await;
        let rain_threshold =
            crate::units::convert(decision::DEFAULT_RAIN_THRESHOLD_IN, Unit::Inch, precip_unit);
        let prob_threshold = self.settings.get_f64(SettingKey::RainCancelProbabilityThreshold).await;
        let weather_wants_water =
            decision::evaluate(&self.store, clock::now_utc_millis(), rain_threshold, prob_threshold)
                .await
                .unwrap_or(true);

        let mut drought = false;
        for zone in &self.zones {
            if zone.has_drought().await {
                drought = true;
                break;
            }
        }

        if weather_wants_water || drought {
            info!(weather_wants_water, drought, "daily watering cycle starting");
            self.run_watering_cycle().await;
        } else {
            info!("watering canceled today: rain forecast sufficient and no zone in drought");
        }

        self.settings.set_str(SettingKey::LastWateringDate, today).await;
    }

    /// Watering cycle (spec §4.9.1): zones in lexicographic name order,
    /// sequential, a leak probe first, 10 s valve settling between zones.
    async fn run_watering_cycle(&self) {
        let leaked_pulses = self.pulses.snapshot_and_reset();
        if leaked_pulses > 0 {
            warn!(pulses = leaked_pulses, "leak probe detected pulses since last cycle");
        }

        let max_minutes = self.settings.get_i64(SettingKey::WateringMaxMinutesPerZone).await;
        let volume_unit = self.settings.volume_unit().await;

        let mut ordered: Vec<&Arc<Zone>> = self.zones.iter().collect();
        ordered.sort_by(|a, b| a.name().cmp(b.name()));

        for zone in ordered {
            if !zone.needs_watering().await {
                info!(zone = zone.id(), "watering skipped, target already reached");
                continue;
            }

            if let Err(e) = self.water_one_zone(zone, max_minutes, volume_unit).await {
                error!(zone = zone.id(), error = %e, "watering failed for zone, relay forced off");
            }
            zone.stop_watering().await;
            tokio::time::sleep(WATERING_POLL_INTERVAL).await;
        }

        for zone in &self.zones {
            zone.stop_watering().await;
        }
        info!("watering cycle finished");
    }

    async fn water_one_zone(
        &self,
        zone: &Zone,
        max_minutes: i64,
        volume_unit: Unit,
    ) -> anyhow::Result<()> {
        zone.open_bus();
        self.pulses.snapshot_and_reset();
        let t_start = clock::now_utc_millis();
        zone.start_watering().await;
        let h_start = zone.humidity().await.context("failed to read starting humidity")?;
        info!(zone = zone.id(), humidity = h_start, "watering zone started");

        loop {
            let elapsed_s = (clock::now_utc_millis() - t_start) / 1000;
            if elapsed_s >= max_minutes * 60 {
                break;
            }
            tokio::time::sleep(WATERING_POLL_INTERVAL).await;
            match zone.humidity().await {
                Ok(h) => {
                    if !zone.needs_watering().await {
                        info!(zone = zone.id(), humidity = h, "target humidity reached");
                        break;
                    }
                }
                Err(e) => {
                    warn!(zone = zone.id(), error = %e, "humidity read failed mid-cycle, retrying next tick");
                }
            }
        }

        zone.stop_watering().await;
        let t_stop = clock::now_utc_millis();
        let h_end = zone.humidity().await.unwrap_or(h_start);
        zone.close_bus();

        let seconds = ((t_stop - t_start) as f64 / 1000.0).max(0.0);
        let volume_liters = self.pulses.read_and_reset_liters(seconds);
        let volume = crate::units::convert(volume_liters, Unit::Liter, volume_unit);

        self.store
            .record_watering(&WateringMeasurement {
                zone: zone.id().to_string(),
                ts_utc_millis: t_stop,
                volume,
                unit: volume_unit,
                humidity_start_pct: h_start as f64,
                humidity_end_pct: h_end as f64,
                duration_seconds: (t_stop - t_start) / 1000,
            })
            .await
            .context("failed to persist watering measurement")?;

        info!(
            zone = zone.id(),
            duration_s = (t_stop - t_start) / 1000,
            volume,
            "zone watering complete"
        );
        Ok(())
    }
}

fn parse_hh_mm(s: &str) -> Option<(u8, u8)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

/// Best-effort Raspberry Pi CPU temperature via `sysinfo`'s hardware
/// sensor enumeration; `None` when no matching thermal component exists
/// (e.g. running off-Pi in development).
fn read_cpu_temperature_c() -> Option<f32> {
    let components = sysinfo::Components::new_with_refreshed_list();
    components
        .iter()
        .find(|c| {
            let label = c.label().to_lowercase();
            label.contains("cpu") || label.contains("soc") || label.contains("thermal")
        })
        .and_then(|c| c.temperature())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::test_double::ScriptedModbus;
    use crate::modbus::ModbusTransport;
    use crate::store::ZoneRow;
    use crate::valve::RelayPolarity;

    fn zone_row(id: &str) -> ZoneRow {
        ZoneRow {
            zone_id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            relay_gpio_pin: 19,
            rh_sensor_addr: 0x0A,
            npk_sensor_addr: None,
            min_sensor_humidity_pct: 20.0,
            target_humidity_pct: 55.0,
        }
    }

    async fn scheduler_with_zone_reaching_target(target_pct: f32) -> (WateringScheduler, Store) {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let row = zone_row("z1");
        store.upsert_zone(&row).await.unwrap();

        let settings = Arc::new(Settings::load(store.clone()).await);

        let mut script = ScriptedModbus::new();
        let raw = (target_pct * 10.0) as u16;
        // Two reads: one for `h_start`, one for the first in-loop re-check —
        // both above the default 55% target so the loop exits promptly.
        script.push_holding(0x0A, Ok(vec![raw, 200, 0, 65]));
        script.push_holding(0x0A, Ok(vec![raw, 200, 0, 65]));

        let transport = Arc::new(ModbusTransport::new(Box::new(script)));
        let zone = Arc::new(Zone::new(row, transport, RelayPolarity::default()).await.unwrap());

        let scheduler =
            WateringScheduler::new(store.clone(), settings, vec![zone], PulseCounter::new());
        (scheduler, store)
    }

    #[tokio::test]
    async fn daily_guard_skips_when_already_done_today() {
        let (scheduler, _store) = scheduler_with_zone_reaching_target(80.0).await;
        let tz = scheduler.settings.local_timezone_name().await;
        let offset = clock::resolve_offset(&tz);
        let today = clock::local_now(offset);
        let today_str =
            format!("{:04}-{:02}-{:02}", today.year(), u8::from(today.month()), today.day());
        scheduler.settings.set_str(SettingKey::LastWateringDate, today_str.clone()).await;

        scheduler.maybe_run_daily_watering().await;

        assert_eq!(
            scheduler.settings.get_opt_str(SettingKey::LastWateringDate).await,
            Some(today_str)
        );
    }

    #[tokio::test]
    async fn guard_waits_for_start_time_before_watering() {
        let (scheduler, _store) = scheduler_with_zone_reaching_target(80.0).await;
        scheduler.settings.set_str(SettingKey::WateringStartTime, "23:59").await;

        scheduler.maybe_run_daily_watering().await;

        // Before start time: no decision is recorded yet (date untouched).
        assert_eq!(scheduler.settings.get_opt_str(SettingKey::LastWateringDate).await, None);
    }

    #[tokio::test]
    async fn out_of_season_marks_today_done_without_watering() {
        let (scheduler, _store) = scheduler_with_zone_reaching_target(80.0).await;
        scheduler.settings.set_str(SettingKey::WateringStartTime, "00:00").await;
        scheduler.settings.set_str(SettingKey::GardeningSeasonStart, "01-01").await;
        scheduler.settings.set_str(SettingKey::GardeningSeasonEnd, "01-02").await;

        scheduler.maybe_run_daily_watering().await;

        assert!(scheduler.settings.get_opt_str(SettingKey::LastWateringDate).await.is_some());
        assert!(!scheduler.zones[0].is_watering().await);
    }

    #[tokio::test(start_paused = true)]
    async fn watering_cycle_stops_once_target_reached_and_records_measurement() {
        let (scheduler, store) = scheduler_with_zone_reaching_target(80.0).await;
        scheduler.pulses.simulate(330);

        scheduler.run_watering_cycle().await;

        assert!(!scheduler.zones[0].is_watering().await);
        let latest = store.latest("z1", Trend::Water).await.unwrap();
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn zone_already_at_target_is_skipped() {
        let (scheduler, store) = scheduler_with_zone_reaching_target(80.0).await;
        scheduler.zones[0].humidity().await.unwrap(); // cache a reading >= target

        scheduler.run_watering_cycle().await;

        assert!(!scheduler.zones[0].is_watering().await);
        assert!(store.latest("z1", Trend::Water).await.unwrap().is_none());
    }
}
