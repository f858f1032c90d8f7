//! A garden zone ("Patch"): binds a [`ZoneRow`] definition to its sensor
//! drivers and relay output (spec §4.8), grounded in
//! `original_source/waterly/patch.py`'s `Patch` class.
//!
//! The shared RS-485 bus is already serialized inside [`ModbusTransport`],
//! so `open_bus`/`close_bus` here are thin session markers rather than a
//! second layer of locking — the Scheduler still calls them once per sweep
//! and once per watering-loop iteration, matching the original's
//! `rh_sensor.open()`/`.close()` bracketing, but the actual mutual
//! exclusion is the transport's.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::modbus::{ModbusTransport, INTER_FRAME_IDLE};
use crate::sensors::{NpkReading, NpkSensor, RhtBlock, RhtSensor};
use crate::store::{Measurement, Trend, ZoneRow};
use crate::units::Unit;
use crate::valve::{Relay, RelayPolarity};

pub struct Zone {
    row: ZoneRow,
    relay: RwLock<Relay>,
    rht: RhtSensor,
    npk: Option<NpkSensor>,
    last_humidity_pct: RwLock<Option<f32>>,
}

impl Zone {
    pub async fn new(
        row: ZoneRow,
        transport: Arc<ModbusTransport>,
        polarity: RelayPolarity,
    ) -> anyhow::Result<Self> {
        let relay = Relay::new(&row.zone_id, row.relay_gpio_pin as u8, polarity)?;
        let rht = RhtSensor::new(transport.clone(), row.rh_sensor_addr as u8).await;
        let npk = match row.npk_sensor_addr {
            Some(addr) => Some(NpkSensor::new(transport, addr as u8).await),
            None => None,
        };
        Ok(Self { row, relay: RwLock::new(relay), rht, npk, last_humidity_pct: RwLock::new(None) })
    }

    pub fn id(&self) -> &str {
        &self.row.zone_id
    }

    pub fn name(&self) -> &str {
        &self.row.name
    }

    pub fn description(&self) -> &str {
        &self.row.description
    }

    /// Live presence of the RH/T sensor (spec §7 `DeviceAbsent`), not just
    /// whether the zone is configured with one.
    pub async fn has_rh_sensor(&self) -> bool {
        self.rht.is_present().await
    }

    /// Live presence of the NPK sensor (spec §7 `DeviceAbsent`): configured
    /// and not marked absent by a prior persistent I/O failure.
    pub async fn has_npk_sensor(&self) -> bool {
        match &self.npk {
            Some(npk) => npk.is_present().await,
            None => false,
        }
    }

    /// Enter the shared serial session for this zone's reads. A no-op
    /// beyond logging today, since `ModbusTransport` already serializes
    /// every frame; kept as an explicit call so the Scheduler's bracketing
    /// of a sweep/watering-iteration around sensor access stays visible.
    pub fn open_bus(&self) {
        tracing::trace!(zone = self.id(), "bus session opened");
    }

    pub fn close_bus(&self) {
        tracing::trace!(zone = self.id(), "bus session closed");
    }

    pub async fn humidity(&self) -> Result<f32, TransportError> {
        let v = self.rht.read_moisture().await?;
        *self.last_humidity_pct.write().await = Some(v);
        Ok(v)
    }

    pub async fn temperature_c(&self) -> Result<f32, TransportError> {
        self.rht.read_temperature_c().await
    }

    pub async fn temperature_f(&self) -> Result<f32, TransportError> {
        self.rht.read_temperature_f().await
    }

    /// Reads the RH block then, after the inter-frame idle, the NPK block
    /// if present — one `Measurement` per trend, all sharing one
    /// timestamp (spec §8 invariant).
    pub async fn measurements(&self, ts_utc_millis: i64) -> HashMap<Trend, Measurement> {
        let mut out = HashMap::new();

        let block: Option<RhtBlock> = match self.rht.read_block().await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!(zone = self.id(), error = %e, "RH block read failed");
                None
            }
        };

        if let Some(block) = block {
            *self.last_humidity_pct.write().await = Some(block.moisture_pct);
            out.insert(
                Trend::Humidity,
                Measurement {
                    trend: Trend::Humidity,
                    zone: self.row.zone_id.clone(),
                    ts_utc_millis,
                    value: block.moisture_pct as f64,
                    unit: Unit::Opaque,
                },
            );
            out.insert(
                Trend::Temperature,
                Measurement {
                    trend: Trend::Temperature,
                    zone: self.row.zone_id.clone(),
                    ts_utc_millis,
                    value: block.temperature_c as f64,
                    unit: Unit::Celsius,
                },
            );
            out.insert(
                Trend::Ec,
                Measurement {
                    trend: Trend::Ec,
                    zone: self.row.zone_id.clone(),
                    ts_utc_millis,
                    value: block.ec_us_cm as f64,
                    unit: Unit::Opaque,
                },
            );
            out.insert(
                Trend::Ph,
                Measurement {
                    trend: Trend::Ph,
                    zone: self.row.zone_id.clone(),
                    ts_utc_millis,
                    value: block.ph as f64,
                    unit: Unit::Opaque,
                },
            );
        }

        tokio::time::sleep(INTER_FRAME_IDLE).await;

        match self.rht.read_salinity_tds().await {
            Ok((salinity, tds)) => {
                out.insert(
                    Trend::Salinity,
                    Measurement {
                        trend: Trend::Salinity,
                        zone: self.row.zone_id.clone(),
                        ts_utc_millis,
                        value: salinity as f64,
                        unit: Unit::Opaque,
                    },
                );
                out.insert(
                    Trend::Tds,
                    Measurement {
                        trend: Trend::Tds,
                        zone: self.row.zone_id.clone(),
                        ts_utc_millis,
                        value: tds as f64,
                        unit: Unit::Opaque,
                    },
                );
            }
            Err(e) => warn!(zone = self.id(), error = %e, "salinity/TDS read failed"),
        }

        if let Some(npk) = &self.npk {
            tokio::time::sleep(INTER_FRAME_IDLE).await;
            match npk.read_all().await {
                Ok(NpkReading { nitrogen_mg_kg, phosphorus_mg_kg, potassium_mg_kg }) => {
                    out.insert(
                        Trend::Nitrogen,
                        Measurement {
                            trend: Trend::Nitrogen,
                            zone: self.row.zone_id.clone(),
                            ts_utc_millis,
                            value: nitrogen_mg_kg as f64,
                            unit: Unit::Opaque,
                        },
                    );
                    out.insert(
                        Trend::Phosphorus,
                        Measurement {
                            trend: Trend::Phosphorus,
                            zone: self.row.zone_id.clone(),
                            ts_utc_millis,
                            value: phosphorus_mg_kg as f64,
                            unit: Unit::Opaque,
                        },
                    );
                    out.insert(
                        Trend::Potassium,
                        Measurement {
                            trend: Trend::Potassium,
                            zone: self.row.zone_id.clone(),
                            ts_utc_millis,
                            value: potassium_mg_kg as f64,
                            unit: Unit::Opaque,
                        },
                    );
                }
                Err(e) => warn!(zone = self.id(), error = %e, "NPK read failed"),
            }
        }

        out
    }

    /// Idempotent: if the relay is already in the requested state, this
    /// only logs at debug level rather than toggling hardware twice.
    pub async fn start_watering(&self) {
        let mut relay = self.relay.write().await;
        if relay.is_on() {
            tracing::debug!(zone = self.id(), "start_watering called while already on");
            return;
        }
        relay.set(true);
        info!(zone = self.id(), "watering started");
    }

    pub async fn stop_watering(&self) {
        let mut relay = self.relay.write().await;
        if !relay.is_on() {
            tracing::debug!(zone = self.id(), "stop_watering called while already off");
            return;
        }
        relay.set(false);
        info!(zone = self.id(), "watering stopped");
    }

    pub async fn is_watering(&self) -> bool {
        self.relay.read().await.is_on()
    }

    /// Most recent cached humidity reading, if any.
    pub async fn last_humidity_pct(&self) -> Option<f32> {
        *self.last_humidity_pct.read().await
    }

    pub fn target_humidity_pct(&self) -> f64 {
        self.row.target_humidity_pct
    }

    pub fn min_sensor_humidity_pct(&self) -> f64 {
        self.row.min_sensor_humidity_pct
    }

    /// Last humidity below target — irrigation is due.
    pub async fn needs_watering(&self) -> bool {
        match self.last_humidity_pct().await {
            Some(h) => (h as f64) < self.row.target_humidity_pct,
            None => false,
        }
    }

    /// Last humidity below the minimum sensor threshold — drought alarm.
    pub async fn has_drought(&self) -> bool {
        match self.last_humidity_pct().await {
            Some(h) => (h as f64) < self.row.min_sensor_humidity_pct,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::test_double::ScriptedModbus;
    use crate::modbus::ModbusTransport;

    fn row() -> ZoneRow {
        ZoneRow {
            zone_id: "z1".into(),
            name: "Z1".into(),
            description: String::new(),
            relay_gpio_pin: 19,
            rh_sensor_addr: 0x0A,
            npk_sensor_addr: None,
            min_sensor_humidity_pct: 20.0,
            target_humidity_pct: 55.0,
        }
    }

    async fn zone_with_humidity(pct: f32) -> Zone {
        let mut script = ScriptedModbus::new();
        let raw = (pct * 10.0) as u16;
        script.push_holding(0x0A, Ok(vec![raw, 200, 0, 65]));
        let transport = Arc::new(ModbusTransport::new(Box::new(script)));
        let zone = Zone::new(row(), transport, RelayPolarity::default()).await.unwrap();
        zone.humidity().await.unwrap();
        zone
    }

    #[tokio::test]
    async fn start_watering_is_idempotent() {
        let zone = zone_with_humidity(30.0).await;
        zone.start_watering().await;
        assert!(zone.is_watering().await);
        zone.start_watering().await;
        assert!(zone.is_watering().await);
        zone.stop_watering().await;
        assert!(!zone.is_watering().await);
    }

    #[tokio::test]
    async fn needs_watering_compares_against_target() {
        let zone = zone_with_humidity(30.0).await;
        assert!(zone.needs_watering().await);
    }

    #[tokio::test]
    async fn needs_watering_false_once_target_reached() {
        let zone = zone_with_humidity(80.0).await;
        assert!(!zone.needs_watering().await);
    }

    #[tokio::test]
    async fn has_drought_compares_against_minimum() {
        let zone = zone_with_humidity(10.0).await;
        assert!(zone.has_drought().await);
    }

    #[tokio::test]
    async fn no_reading_yet_means_no_watering_need_and_no_drought() {
        let script = ScriptedModbus::new();
        let transport = Arc::new(ModbusTransport::new(Box::new(script)));
        let zone = Zone::new(row(), transport, RelayPolarity::default()).await.unwrap();
        assert!(!zone.needs_watering().await);
        assert!(!zone.has_drought().await);
    }

    #[tokio::test]
    async fn has_npk_sensor_false_when_not_configured() {
        let zone = zone_with_humidity(30.0).await;
        assert!(!zone.has_npk_sensor().await);
    }

    #[tokio::test]
    async fn has_rh_sensor_goes_false_after_device_absent_then_recovers() {
        let mut script = ScriptedModbus::new();
        script.push_holding(0x0A, Ok(vec![300, 200, 0, 65]));
        script.push_holding(0x0A, Err(crate::error::TransportError::Timeout));
        script.push_holding(0x0A, Ok(vec![300, 200, 0, 65]));
        let transport = Arc::new(ModbusTransport::new(Box::new(script)));
        let zone = Zone::new(row(), transport, RelayPolarity::default()).await.unwrap();

        zone.humidity().await.unwrap();
        assert!(zone.has_rh_sensor().await);

        assert!(zone.humidity().await.is_err());
        assert!(!zone.has_rh_sensor().await);

        zone.humidity().await.unwrap();
        assert!(zone.has_rh_sensor().await);
    }
}
