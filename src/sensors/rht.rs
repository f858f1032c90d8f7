//! Soil RH/T/EC/pH/Salinity/TDS sensor driver (spec §4.2), grounded in
//! `original_source/waterly/dfrobot/sen0604.py` (`SEN0604`).

use std::sync::Arc;

use crate::error::TransportError;
use crate::modbus::{FunctionCode, ModbusTransport};

const REG_MOISTURE: u16 = 0x0000;
const REG_TEMPERATURE: u16 = 0x0001;
const REG_EC: u16 = 0x0002;
const REG_PH: u16 = 0x0003;
const REG_SALINITY: u16 = 0x0007;
const REG_TDS: u16 = 0x0008;

/// Plausible operating range for the temperature register, per the
/// DFRobot datasheet (spec §9 resolution of the sign-handling Open
/// Question).
const MIN_PLAUSIBLE_C: f32 = -40.0;
const MAX_PLAUSIBLE_C: f32 = 185.0;

/// One batched read of moisture, temperature, EC and pH.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RhtBlock {
    pub moisture_pct: f32,
    pub temperature_c: f32,
    pub ec_us_cm: u16,
    pub ph: f32,
}

pub struct RhtSensor {
    transport: Arc<ModbusTransport>,
    device_addr: u8,
}

impl RhtSensor {
    pub async fn new(transport: Arc<ModbusTransport>, device_addr: u8) -> Self {
        // Spec §4.1: RH/T sensor prefers Holding Registers (0x03).
        transport
            .set_default_preference(device_addr, FunctionCode::Holding)
            .await;
        Self { transport, device_addr }
    }

    pub fn device_addr(&self) -> u8 {
        self.device_addr
    }

    /// Live presence of this device on the bus (spec §7 `DeviceAbsent`),
    /// sticky until a subsequent read succeeds.
    pub async fn is_present(&self) -> bool {
        self.transport.is_present(self.device_addr).await
    }

    fn decode_temperature(raw: u16) -> Result<f32, TransportError> {
        let c = raw as f32 * 0.1;
        if !(MIN_PLAUSIBLE_C..=MAX_PLAUSIBLE_C).contains(&c) {
            return Err(TransportError::Protocol(format!(
                "implausible temperature register value {raw} ({c} C)"
            )));
        }
        Ok(c)
    }

    /// Batched read of moisture..pH (0x0000-0x0003, contiguous).
    pub async fn read_block(&self) -> Result<RhtBlock, TransportError> {
        let regs = self
            .transport
            .read_registers_preferred(self.device_addr, REG_MOISTURE, 4)
            .await?;
        let moisture_pct = regs[(REG_MOISTURE - REG_MOISTURE) as usize] as f32 * 0.1;
        let temperature_c = Self::decode_temperature(regs[(REG_TEMPERATURE - REG_MOISTURE) as usize])?;
        let ec_us_cm = regs[(REG_EC - REG_MOISTURE) as usize];
        let ph = regs[(REG_PH - REG_MOISTURE) as usize] as f32 * 0.1;
        Ok(RhtBlock { moisture_pct, temperature_c, ec_us_cm, ph })
    }

    /// Batched read of salinity + TDS (0x0007-0x0008, contiguous). Callers
    /// must wait `INTER_FRAME_IDLE` after [`read_block`] before calling
    /// this (spec §4.2).
    pub async fn read_salinity_tds(&self) -> Result<(u16, u16), TransportError> {
        let regs = self
            .transport
            .read_registers_preferred(self.device_addr, REG_SALINITY, 2)
            .await?;
        Ok((regs[0], regs[1]))
    }

    pub async fn read_moisture(&self) -> Result<f32, TransportError> {
        Ok(self.read_block().await?.moisture_pct)
    }

    pub async fn read_temperature_c(&self) -> Result<f32, TransportError> {
        Ok(self.read_block().await?.temperature_c)
    }

    pub async fn read_temperature_f(&self) -> Result<f32, TransportError> {
        let c = self.read_temperature_c().await?;
        Ok(crate::units::convert(c as f64, crate::units::Unit::Celsius, crate::units::Unit::Fahrenheit) as f32)
    }
}
