//! Flow-meter pulse counter (spec §4.4), grounded in
//! `original_source/waterly/pulses.py`'s `PulseCounter`.
//!
//! The real GPIO edge source is `rppal::gpio::InputPin::set_async_interrupt`
//! behind the `gpio` feature; without it pulses only arrive via
//! [`PulseCounter::simulate`], which is how the scheduler's own tests and
//! the watering-cycle tests drive volume accounting without hardware.

use std::sync::{Arc, Mutex};

use tracing::info;

/// Sensor-specific constant relating flow (L/min) to pulse frequency (Hz).
pub const WATER_FLOW_FREQUENCY_FACTOR: f64 = 5.5;

/// Debounce window applied to the falling-edge interrupt.
pub const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(5);

#[derive(Default)]
struct Counter {
    count: u64,
}

/// Interrupt-driven pulse counter. Cheaply `Clone`-able; all clones share
/// the same counter and GPIO handle.
#[derive(Clone)]
pub struct PulseCounter {
    inner: Arc<Mutex<Counter>>,
    #[cfg(feature = "gpio")]
    pin: Arc<Mutex<Option<rppal::gpio::InputPin>>>,
}

impl PulseCounter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counter::default())),
            #[cfg(feature = "gpio")]
            pin: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach the interrupt handler on `gpio_pin` (pull-up, 5 ms debounce,
    /// falling edge — the sensor pulls the line low on each pulse).
    #[cfg(feature = "gpio")]
    pub fn start(&self, gpio_pin: u8) -> anyhow::Result<()> {
        use rppal::gpio::{Gpio, Trigger};

        let mut input = Gpio::new()?.get(gpio_pin)?.into_input_pullup();
        let inner = self.inner.clone();
        input.set_async_interrupt(Trigger::FallingEdge, Some(DEBOUNCE), move |_level| {
            let mut c = inner.lock().unwrap();
            c.count += 1;
        })?;
        *self.pin.lock().unwrap() = Some(input);
        info!(gpio_pin, "pulse counter started");
        Ok(())
    }

    #[cfg(not(feature = "gpio"))]
    pub fn start(&self, gpio_pin: u8) -> anyhow::Result<()> {
        info!(gpio_pin, "pulse counter started (mock backend, no gpio feature)");
        Ok(())
    }

    /// Inject synthetic pulses — used by tests and by the dummy-mode
    /// simulation entry point named in spec §4.4.
    pub fn simulate(&self, pulses: u32) {
        let mut c = self.inner.lock().unwrap();
        c.count += pulses as u64;
    }

    /// Return the pulse count accumulated since the last reset, and reset
    /// the counter to zero.
    pub fn snapshot_and_reset(&self) -> u64 {
        let mut c = self.inner.lock().unwrap();
        let n = c.count;
        c.count = 0;
        n
    }

    /// `volume(interval_seconds, pulses) = (pulses/interval_seconds)/K ×
    /// (interval_seconds/60)` in liters; `0.0` when `interval_seconds <= 0`.
    pub fn volume_liters(interval_seconds: f64, pulses: u64) -> f64 {
        if interval_seconds <= 0.0 {
            return 0.0;
        }
        let freq_hz = pulses as f64 / interval_seconds;
        let flow_lpm = freq_hz / WATER_FLOW_FREQUENCY_FACTOR;
        flow_lpm * (interval_seconds / 60.0)
    }

    /// Convenience: snapshot-and-reset, then convert to liters over `seconds`.
    pub fn read_and_reset_liters(&self, seconds: f64) -> f64 {
        let pulses = self.snapshot_and_reset();
        Self::volume_liters(seconds, pulses)
    }
}

impl Default for PulseCounter {
    fn default() -> Self {
        Self::new()
    }
}
