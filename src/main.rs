//! Entry point: reads env/config, connects to SQLite, applies the zone
//! topology, opens the shared Modbus bus, and runs the watering scheduler,
//! weather refresher, and maintenance tasks side by side.

use std::env;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use waterly::clock;
use waterly::modbus::{ModbusTransport, SerialModbus};
use waterly::pulses::PulseCounter;
use waterly::scheduler::WateringScheduler;
use waterly::settings::{SettingKey, Settings};
use waterly::store::Store;
use waterly::topology;
use waterly::valve::RelayPolarity;
use waterly::weather::WeatherClient;
use waterly::zone::Zone;

const DEFAULT_SERIAL_PORT: &str = "/dev/serial0";
const DEFAULT_BAUD_RATE: u32 = 9600;

/// Maintenance sweep cadence (pruning + incremental vacuum + backup check).
const MAINTENANCE_TICK: Duration = Duration::from_secs(3600);

/// Weather task poll cadence — frequent enough to catch the pre-watering
/// refresh window (spec §4.6 ambient note) without hammering the API.
const WEATHER_TICK: Duration = Duration::from_secs(60);

fn parse_hh_mm(s: &str) -> Option<(u8, u8)> {
    let (h, m) = s.split_once(':')?;
    Some((h.parse().ok()?, m.parse().ok()?))
}

/// `[watering_start - window, watering_start)` for today in local time, using
/// `WEATHER_PRE_WATERING_CHECK_INTERVAL_SECONDS` as both the window width
/// and (via the caller's tick loop) the in-window poll cadence — there is no
/// separate window-width setting, so one value serves both roles.
async fn pre_watering_window(settings: &Settings) -> Option<(i64, i64)> {
    let tz_name = settings.local_timezone_name().await;
    let offset = clock::resolve_offset(&tz_name);
    let local_now = clock::local_now(offset);

    let start_time = settings.get_str(SettingKey::WateringStartTime).await;
    let (start_h, start_m) = parse_hh_mm(&start_time)?;

    let window_end = local_now
        .replace_time(time::Time::from_hms(start_h, start_m, 0).ok()?)
        .unix_timestamp()
        * 1000;
    let window_seconds = settings
        .get_i64(SettingKey::WeatherPreWateringCheckIntervalSeconds)
        .await
        .max(60);
    let window_start = window_end - window_seconds * 1000;

    Some((window_start, window_end))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let topology_path =
        env::var("TOPOLOGY_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:data/waterly.db?mode=rwc".to_string());
    let db_backup_path = env::var("DB_BACKUP_PATH").ok().filter(|s| !s.is_empty());
    let db_backup_interval: u64 = env::var("DB_BACKUP_INTERVAL_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(6 * 3600);
    let serial_port = env::var("MODBUS_SERIAL_PORT").unwrap_or_else(|_| DEFAULT_SERIAL_PORT.to_string());
    let baud_rate: u32 = env::var("MODBUS_BAUD_RATE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_BAUD_RATE);
    let relay_active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    info!(
        topology_path = %topology_path,
        data_dir = %data_dir,
        log_dir = %log_dir,
        db_url = %db_url,
        serial_port = %serial_port,
        baud_rate,
        "waterly starting"
    );

    tokio::fs::create_dir_all(&data_dir).await.ok();
    tokio::fs::create_dir_all(&log_dir).await.ok();

    let store = Store::connect(&db_url).await.context("connecting to database")?;
    store.migrate().await.context("running schema migrations")?;

    let parsed = topology::load(&topology_path).context("loading zone topology")?;
    topology::apply(&parsed, &store).await.context("applying zone topology")?;

    let settings = Arc::new(Settings::load(store.clone()).await);

    let raw_transport = SerialModbus::open(&serial_port, baud_rate)
        .await
        .with_context(|| format!("opening modbus serial port {serial_port}"))?;
    let transport = Arc::new(ModbusTransport::new(Box::new(raw_transport)));

    let zone_rows = store.load_zones().await.context("loading zone definitions")?;
    if zone_rows.is_empty() {
        warn!("no zones configured — check the topology file");
    }

    let mut zones = Vec::with_capacity(zone_rows.len());
    for row in zone_rows {
        let zone_id = row.zone_id.clone();
        match Zone::new(row, transport.clone(), RelayPolarity { active_low: relay_active_low }).await {
            Ok(z) => zones.push(Arc::new(z)),
            Err(e) => error!(zone = %zone_id, error = %e, "failed to initialize zone, skipping"),
        }
    }

    let pulses = PulseCounter::new();
    if let Ok(pin) = env::var("PULSE_COUNTER_GPIO_PIN") {
        if let Ok(pin) = pin.parse::<u8>() {
            if let Err(e) = pulses.start(pin) {
                error!(error = %e, pin, "failed to start pulse counter");
            }
        }
    }

    let scheduler = Arc::new(WateringScheduler::new(
        store.clone(),
        settings.clone(),
        zones.clone(),
        pulses.clone(),
    ));
    let stop = scheduler.stop_handle();

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let weather_handle = {
        let store = store.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let client = WeatherClient::new(store);
            loop {
                let now_millis = clock::now_utc_millis();
                let last_check_millis = settings
                    .get_opt_str(SettingKey::WeatherLastCheckTimestamp)
                    .await
                    .and_then(|s| s.parse::<i64>().ok());

                let check_interval_s = settings
                    .get_i64(SettingKey::WeatherCheckIntervalSeconds)
                    .await
                    .max(60);
                let interval_due = match last_check_millis {
                    Some(last) => now_millis - last >= check_interval_s * 1000,
                    None => true,
                };

                let pre_window = pre_watering_window(&settings).await;
                let pre_due = pre_window
                    .map(|(window_start, window_end)| {
                        waterly::weather::should_pre_watering_refresh(
                            now_millis,
                            window_start,
                            window_end,
                            last_check_millis,
                        )
                    })
                    .unwrap_or(false);

                if pre_due || interval_due {
                    if pre_due && !interval_due {
                        info!("pre-watering refresh window open, refreshing weather early");
                    }
                    if let Err(e) = client.refresh(&settings).await {
                        warn!(error = %e, "weather refresh failed");
                    }
                } else if pre_window.is_some() {
                    debug!("weather already updated for this pre-watering window");
                }

                tokio::time::sleep(WEATHER_TICK).await;
            }
        })
    };

    let prune_handle = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
            loop {
                ticker.tick().await;
                let retention_days: i64 = 180;
                let cutoff =
                    waterly::clock::now_utc_millis() - retention_days * 24 * 60 * 60 * 1000;
                match store.prune_before(cutoff).await {
                    Ok(n) if n > 0 => info!(deleted = n, "pruned old trend rows"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "trend pruning failed"),
                }
            }
        })
    };

    let backup_handle = {
        let store = store.clone();
        let backup_dest = db_backup_path.clone();
        tokio::spawn(async move {
            let Some(dest) = backup_dest else {
                std::future::pending::<()>().await;
                return;
            };
            let mut ticker = tokio::time::interval(Duration::from_secs(db_backup_interval));
            loop {
                ticker.tick().await;
                match store.backup(std::path::Path::new(&dest)).await {
                    Ok(()) => info!(path = %dest, "database backup complete"),
                    Err(e) => error!(error = %e, "database backup failed"),
                }
            }
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        result = scheduler_handle => {
            error!(?result, "CRITICAL: watering scheduler task exited unexpectedly");
            "scheduler task died"
        }
    };

    warn!(signal = exit_reason, "shutting down, turning all relays off");
    stop.store(true, Ordering::Relaxed);
    for zone in &zones {
        zone.stop_watering().await;
    }

    weather_handle.abort();
    prune_handle.abort();
    backup_handle.abort();

    if let Some(ref dest) = db_backup_path {
        info!("performing final database backup");
        match store.backup(std::path::Path::new(dest)).await {
            Ok(()) => info!(path = %dest, "final database backup complete"),
            Err(e) => error!(error = %e, "final database backup failed"),
        }
    }

    info!("shutdown complete");
    Ok(())
}
