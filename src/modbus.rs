//! RS-485 Modbus-RTU transport shared by all soil sensors on the bus
//! (spec §4.1), grounded in `original_source/waterly/dfrobot/base_sensor.py`
//! (`BaseRS485ModbusSensor._read_one`/`_read_many`) and the bus-handling
//! crates the pack already reaches for — `tokio-modbus` (rtu feature) over
//! `tokio-serial` (see `sctg-development-rust-photoacoustic` and
//! `lnicola-read-temperature` in the retrieval pack).
//!
//! Concurrent calls are serialized through a single `tokio::sync::Mutex`
//! wrapping the raw transport, matching the "single-owner bus" contract:
//! only one frame is ever in flight.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Minimum idle time required between frames addressed to different
/// devices on the same bus (spec §4.2/§4.3/§6).
pub const INTER_FRAME_IDLE: Duration = Duration::from_millis(250);

/// Device configuration registers shared by both sensor families
/// (`base_sensor.py`).
pub const REG_DEVICE_ADDRESS: u16 = 0x07D0;
pub const REG_BAUD_RATE: u16 = 0x07D1;

/// Modbus read function, used both as the wire function code and as the
/// "preferred function" sticky state per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    Holding,
    Input,
}

impl FunctionCode {
    fn other(self) -> FunctionCode {
        match self {
            FunctionCode::Holding => FunctionCode::Input,
            FunctionCode::Input => FunctionCode::Holding,
        }
    }
}

/// Seam abstracting the wire-level Modbus operations so the transport can
/// be driven by a real serial port or by a scripted double in tests
/// (spec §2's "Shared hardware platform traits").
#[async_trait]
pub trait RawModbus: Send {
    async fn read_holding(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>, TransportError>;
    async fn read_input(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>, TransportError>;
    async fn write_single(&mut self, slave: u8, reg: u16, value: u16) -> Result<(), TransportError>;
}

/// Real transport over `tokio-serial` via `tokio-modbus`'s RTU client.
pub struct SerialModbus {
    ctx: tokio_modbus::client::Context,
}

impl SerialModbus {
    pub async fn open(path: &str, baud_rate: u32) -> anyhow::Result<Self> {
        use tokio_modbus::client::rtu;
        use tokio_modbus::slave::Slave;
        use tokio_serial::SerialPortBuilderExt;

        let builder = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .timeout(Duration::from_secs(1));
        let port = builder.open_native_async()?;
        let ctx = rtu::attach_slave(port, Slave(0x01));
        Ok(Self { ctx })
    }
}

#[async_trait]
impl RawModbus for SerialModbus {
    async fn read_holding(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        use tokio_modbus::slave::Slave;
        self.ctx.set_slave(Slave(slave));
        self.ctx
            .read_holding_registers(start, count)
            .await
            .map_err(classify_io)?
            .map_err(classify_exception)
    }

    async fn read_input(&mut self, slave: u8, start: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        use tokio_modbus::slave::Slave;
        self.ctx.set_slave(Slave(slave));
        self.ctx
            .read_input_registers(start, count)
            .await
            .map_err(classify_io)?
            .map_err(classify_exception)
    }

    async fn write_single(&mut self, slave: u8, reg: u16, value: u16) -> Result<(), TransportError> {
        use tokio_modbus::slave::Slave;
        self.ctx.set_slave(Slave(slave));
        self.ctx
            .write_single_register(reg, value)
            .await
            .map_err(classify_io)?
            .map_err(classify_exception)
    }
}

fn classify_io(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        TransportError::Timeout
    } else {
        TransportError::Bus(e.to_string())
    }
}

fn classify_exception(e: tokio_modbus::ExceptionCode) -> Result<Vec<u16>, TransportError> {
    Err(TransportError::Protocol(format!("{e:?}")))
}

/// The serialized, presence-tracking, fallback-aware Modbus bus.
pub struct ModbusTransport {
    raw: Mutex<Box<dyn RawModbus>>,
    present: Mutex<HashMap<u8, bool>>,
    preferred: Mutex<HashMap<u8, FunctionCode>>,
}

impl ModbusTransport {
    pub fn new(raw: Box<dyn RawModbus>) -> Self {
        Self {
            raw: Mutex::new(raw),
            present: Mutex::new(HashMap::new()),
            preferred: Mutex::new(HashMap::new()),
        }
    }

    /// Register the function code a device is expected to answer on
    /// first contact (Holding for the RH/T sensor, Input for NPK —
    /// spec §4.1/§4.3). If never set, Holding is assumed.
    pub async fn set_default_preference(&self, slave: u8, fc: FunctionCode) {
        self.preferred.lock().await.entry(slave).or_insert(fc);
    }

    pub async fn is_present(&self, slave: u8) -> bool {
        *self.present.lock().await.get(&slave).unwrap_or(&true)
    }

    async fn mark(&self, slave: u8, present: bool) {
        self.present.lock().await.insert(slave, present);
    }

    /// Read `count` registers starting at `start`, trying the device's
    /// preferred function code first and falling back to the other one on
    /// a framing/protocol error. The function code that succeeds becomes
    /// sticky for subsequent calls (spec §9 "Modbus fallback strategy").
    pub async fn read_registers_preferred(
        &self,
        slave: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let preferred = *self.preferred.lock().await.get(&slave).unwrap_or(&FunctionCode::Holding);
        let mut raw = self.raw.lock().await;

        match self.read_one(&mut raw, slave, preferred, start, count).await {
            Ok(v) => {
                self.mark(slave, true).await;
                Ok(v)
            }
            Err(e) if matches!(e, TransportError::Protocol(_)) => {
                debug!(slave, ?preferred, "preferred function failed, trying fallback");
                let fallback = preferred.other();
                match self.read_one(&mut raw, slave, fallback, start, count).await {
                    Ok(v) => {
                        self.mark(slave, true).await;
                        self.preferred.lock().await.insert(slave, fallback);
                        Ok(v)
                    }
                    Err(e2) => {
                        if e2.marks_absent() {
                            self.mark(slave, false).await;
                        } else {
                            self.mark(slave, true).await;
                        }
                        Err(e2)
                    }
                }
            }
            Err(e) => {
                if e.marks_absent() {
                    self.mark(slave, false).await;
                } else {
                    self.mark(slave, true).await;
                }
                Err(e)
            }
        }
    }

    async fn read_one(
        &self,
        raw: &mut Box<dyn RawModbus>,
        slave: u8,
        fc: FunctionCode,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        match fc {
            FunctionCode::Holding => raw.read_holding(slave, start, count).await,
            FunctionCode::Input => raw.read_input(slave, start, count).await,
        }
    }

    pub async fn write_register(&self, slave: u8, reg: u16, value: u16) -> Result<(), TransportError> {
        let mut raw = self.raw.lock().await;
        match raw.write_single(slave, reg, value).await {
            Ok(()) => {
                self.mark(slave, true).await;
                Ok(())
            }
            Err(e) => {
                if e.marks_absent() {
                    self.mark(slave, false).await;
                } else {
                    self.mark(slave, true).await;
                }
                Err(e)
            }
        }
    }

    /// Device configuration: validated address write (1..247).
    pub async fn set_device_address(&self, slave: u8, new_addr: u8) -> Result<(), TransportError> {
        if !(1..=247).contains(&new_addr) {
            return Err(TransportError::Protocol(format!(
                "device address {new_addr} out of range 1..247"
            )));
        }
        self.write_register(slave, REG_DEVICE_ADDRESS, new_addr as u16).await
    }

    /// Device configuration: baud rate write. The caller (driver owning
    /// the serial port) is responsible for reopening the port at the new
    /// rate afterward — the transport only performs the register write.
    pub async fn set_baud_rate_code(&self, slave: u8, code: u16) -> Result<(), TransportError> {
        if code > 2 {
            return Err(TransportError::Protocol(format!("unknown baud code {code}")));
        }
        self.write_register(slave, REG_BAUD_RATE, code).await
    }

    /// Sleep for the inter-frame idle period required between frames to
    /// different devices (spec §4.2/§4.3/§6).
    pub async fn idle_gap(&self) {
        sleep(INTER_FRAME_IDLE).await;
    }
}

/// Map a baud rate in bps to the device's register code, or `None` if
/// unsupported (only 2400/4800/9600 per spec §4.1).
pub fn baud_to_code(baud: u32) -> Option<u16> {
    match baud {
        2400 => Some(0),
        4800 => Some(1),
        9600 => Some(2),
        _ => None,
    }
}

pub fn code_to_baud(code: u16) -> Option<u32> {
    match code {
        0 => Some(2400),
        1 => Some(4800),
        2 => Some(9600),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_double::ScriptedModbus;
    use super::*;

    #[tokio::test]
    async fn preferred_function_succeeds_directly() {
        let mut dbl = ScriptedModbus::new();
        dbl.push_holding(0x0A, Ok(vec![700]));
        let t = ModbusTransport::new(Box::new(dbl));
        t.set_default_preference(0x0A, FunctionCode::Holding).await;

        let v = t.read_registers_preferred(0x0A, 0x0000, 1).await.unwrap();
        assert_eq!(v, vec![700]);
        assert!(t.is_present(0x0A).await);
    }

    #[tokio::test]
    async fn falls_back_to_other_function_on_protocol_error() {
        // Scenario 6: RH sensor at 0x0A answers on Holding, not Input.
        let mut dbl = ScriptedModbus::new();
        dbl.push_input(0x0A, Err(TransportError::Protocol("illegal function".into())));
        dbl.push_holding(0x0A, Ok(vec![512]));
        let t = ModbusTransport::new(Box::new(dbl));
        t.set_default_preference(0x0A, FunctionCode::Input).await;

        let v = t.read_registers_preferred(0x0A, 0x0000, 1).await.unwrap();
        assert_eq!(v, vec![512]);

        // the fallback (Holding) should now be sticky
        assert_eq!(
            *t.preferred.lock().await.get(&0x0A).unwrap(),
            FunctionCode::Holding
        );
    }

    #[tokio::test]
    async fn timeout_marks_device_absent() {
        let mut dbl = ScriptedModbus::new();
        dbl.push_holding(0x0B, Err(TransportError::Timeout));
        let t = ModbusTransport::new(Box::new(dbl));
        t.set_default_preference(0x0B, FunctionCode::Holding).await;

        assert!(t.read_registers_preferred(0x0B, 0, 1).await.is_err());
        assert!(!t.is_present(0x0B).await);
    }

    #[tokio::test]
    async fn protocol_error_on_both_codes_keeps_device_present() {
        let mut dbl = ScriptedModbus::new();
        dbl.push_holding(0x0A, Err(TransportError::Protocol("bad".into())));
        dbl.push_input(0x0A, Err(TransportError::Protocol("bad".into())));
        let t = ModbusTransport::new(Box::new(dbl));
        t.set_default_preference(0x0A, FunctionCode::Holding).await;

        assert!(t.read_registers_preferred(0x0A, 0, 1).await.is_err());
        // a Modbus exception response means the slave answered
        assert!(t.is_present(0x0A).await);
    }

    #[test]
    fn baud_code_round_trip() {
        for baud in [2400, 4800, 9600] {
            let code = baud_to_code(baud).unwrap();
            assert_eq!(code_to_baud(code), Some(baud));
        }
        assert_eq!(baud_to_code(19200), None);
    }

    #[tokio::test]
    async fn device_address_validation_rejects_out_of_range() {
        let dbl = ScriptedModbus::new();
        let t = ModbusTransport::new(Box::new(dbl));
        assert!(t.set_device_address(0x0A, 0).await.is_err());
        assert!(t.set_device_address(0x0A, 248).await.is_err());
    }
}
