//! Relay control via GPIO (spec §4.8 "open_bus"/"close_bus"), grounded in
//! the teacher's `valve.rs`: the `gpio` feature gates the real `rppal`
//! driver, a mock stands in without it. The teacher's board keyed many
//! zones behind one struct; here each [`Relay`] owns exactly one zone's
//! pin, since the spec's Zone already holds its own hardware addresses.

use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Many relay boards used with soil irrigation rigs are active-low:
/// driving the GPIO line low energizes the relay coil.
#[derive(Debug, Clone, Copy)]
pub struct RelayPolarity {
    pub active_low: bool,
}

impl Default for RelayPolarity {
    fn default() -> Self {
        Self { active_low: true }
    }
}

#[cfg(feature = "gpio")]
pub struct Relay {
    pin: OutputPin,
    polarity: RelayPolarity,
    zone_id: String,
    on: bool,
}

#[cfg(feature = "gpio")]
impl Relay {
    pub fn new(zone_id: &str, pin_num: u8, polarity: RelayPolarity) -> anyhow::Result<Self> {
        let gpio = Gpio::new()?;
        let mut pin = gpio.get(pin_num)?.into_output();
        // Fail-safe: ensure OFF at construction.
        if polarity.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(Self { pin, polarity, zone_id: zone_id.to_string(), on: false })
    }

    pub fn set(&mut self, on: bool) {
        if self.polarity.active_low {
            if on {
                self.pin.set_low()
            } else {
                self.pin.set_high()
            }
        } else if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        }
        self.on = on;
        info!(zone = %self.zone_id, state = if on { "ON" } else { "OFF" }, "relay");
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }
}

#[cfg(not(feature = "gpio"))]
pub struct Relay {
    zone_id: String,
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub fn new(zone_id: &str, pin_num: u8, _polarity: RelayPolarity) -> anyhow::Result<Self> {
        warn!(zone = zone_id, pin = pin_num, "mock relay registered, no hardware wired");
        Ok(Self { zone_id: zone_id.to_string(), on: false })
    }

    pub fn set(&mut self, on: bool) {
        self.on = on;
        info!(zone = %self.zone_id, state = if on { "ON" } else { "OFF" }, "mock relay");
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_starts_off() {
        let relay = Relay::new("z1", 19, RelayPolarity::default()).unwrap();
        assert!(!relay.is_on());
    }

    #[test]
    fn relay_set_on_and_off() {
        let mut relay = Relay::new("z1", 19, RelayPolarity::default()).unwrap();
        relay.set(true);
        assert!(relay.is_on());
        relay.set(false);
        assert!(!relay.is_on());
    }

    #[test]
    fn relay_remembers_its_zone_id() {
        let relay = Relay::new("z2", 16, RelayPolarity::default()).unwrap();
        assert_eq!(relay.zone_id(), "z2");
    }
}
