//! Static zone/sensor topology loading (spec §3 "StaticTopology" addition),
//! grounded in the teacher's `config.rs` TOML load/apply split and in the
//! original's hardcoded `ZONES` dict (`original_source/waterly/config.py`,
//! `model/zone.py`).
//!
//! Unlike the teacher, topology here is not hot-reloaded against an MQTT
//! fleet — it is read once at startup and upserted into the zones table,
//! after which the zone's *dynamic* attributes (target/min humidity) can
//! still be edited in place via `store::Store::upsert_zone`. Named
//! `topology` rather than `config` to keep it distinct from the dynamic
//! [`crate::settings`] module.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::store::{Store, ZoneRow};

#[derive(Debug, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub relay_gpio_pin: i64,
    pub rh_sensor_addr: i64,
    #[serde(default)]
    pub npk_sensor_addr: Option<i64>,
    pub min_sensor_humidity_pct: f64,
    pub target_humidity_pct: f64,
}

/// Read and parse a TOML topology file.
pub fn load(path: &str) -> Result<Topology> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology config: {path}"))?;
    let topology: Topology = toml::from_str(&contents)
        .with_context(|| format!("failed to parse topology config: {path}"))?;
    Ok(topology)
}

/// Upsert every zone from the topology into the database. Re-running this
/// against an already-seeded database is safe and idempotent.
pub async fn apply(topology: &Topology, store: &Store) -> Result<()> {
    for z in &topology.zones {
        store
            .upsert_zone(&ZoneRow {
                zone_id: z.zone_id.clone(),
                name: z.name.clone(),
                description: z.description.clone(),
                relay_gpio_pin: z.relay_gpio_pin,
                rh_sensor_addr: z.rh_sensor_addr,
                npk_sensor_addr: z.npk_sensor_addr,
                min_sensor_humidity_pct: z.min_sensor_humidity_pct,
                target_humidity_pct: z.target_humidity_pct,
            })
            .await
            .with_context(|| format!("failed to upsert zone '{}'", z.zone_id))?;
    }

    tracing::info!(zones = topology.zones.len(), "topology applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[zones]]
zone_id = "z1"
name = "Z1"
relay_gpio_pin = 19
rh_sensor_addr = 10
min_sensor_humidity_pct = 30.0
target_humidity_pct = 55.0

[[zones]]
zone_id = "z2"
name = "Z2"
relay_gpio_pin = 16
rh_sensor_addr = 11
npk_sensor_addr = 32
min_sensor_humidity_pct = 25.0
target_humidity_pct = 50.0
"#;

    #[test]
    fn parses_zones_with_optional_npk_address() {
        let topology: Topology = toml::from_str(SAMPLE).unwrap();
        assert_eq!(topology.zones.len(), 2);
        assert_eq!(topology.zones[0].npk_sensor_addr, None);
        assert_eq!(topology.zones[1].npk_sensor_addr, Some(32));
    }

    #[test]
    fn parse_empty_topology() {
        let topology: Topology = toml::from_str("").unwrap();
        assert!(topology.zones.is_empty());
    }

    #[test]
    fn load_reads_and_parses_a_real_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, SAMPLE.as_bytes()).unwrap();

        let topology = load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(topology.zones.len(), 2);
        assert_eq!(topology.zones[0].zone_id, "z1");
    }

    #[test]
    fn load_missing_file_returns_context_error() {
        let err = load("/nonexistent/path/to/topology.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read topology config"));
    }

    #[tokio::test]
    async fn apply_seeds_database_and_is_idempotent() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let topology: Topology = toml::from_str(SAMPLE).unwrap();

        apply(&topology, &store).await.unwrap();
        apply(&topology, &store).await.unwrap();

        let zones = store.load_zones().await.unwrap();
        assert_eq!(zones.len(), 2);
        assert_eq!(zones[0].zone_id, "z1");
        assert_eq!(zones[1].zone_id, "z2");
        assert_eq!(zones[1].npk_sensor_addr, Some(32));
    }
}
