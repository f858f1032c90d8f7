//! NPK (nitrogen/phosphorus/potassium) sensor driver (spec §4.3), grounded
//! in `original_source/waterly/dfrobot/sen0605.py` (`SEN0605`).

use std::sync::Arc;

use crate::error::TransportError;
use crate::modbus::{FunctionCode, ModbusTransport};

const REG_NITROGEN: u16 = 0x001E;
const REG_PHOSPHORUS: u16 = 0x001F;
const REG_POTASSIUM: u16 = 0x0020;

const REG_N_COEFF_HI: u16 = 0x03E8;
const REG_N_DEVIATION: u16 = 0x03EA;
const REG_P_COEFF_HI: u16 = 0x03F2;
const REG_P_DEVIATION: u16 = 0x03F4;
const REG_K_COEFF_HI: u16 = 0x03FC;
const REG_K_DEVIATION: u16 = 0x03FE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpkReading {
    pub nitrogen_mg_kg: u16,
    pub phosphorus_mg_kg: u16,
    pub potassium_mg_kg: u16,
}

pub struct NpkSensor {
    transport: Arc<ModbusTransport>,
    device_addr: u8,
}

impl NpkSensor {
    pub async fn new(transport: Arc<ModbusTransport>, device_addr: u8) -> Self {
        // sen0605.py: `self._pref_data_func = self.DATA_FUNCTIONS[1]` — Input
        // Registers is this device's learned-at-first-success preference.
        transport
            .set_default_preference(device_addr, FunctionCode::Input)
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

    /// Batched read of N, P, K (0x001E-0x0020, contiguous).
    pub async fn read_all(&self) -> Result<NpkReading, TransportError> {
        let regs = self
            .transport
            .read_registers_preferred(self.device_addr, REG_NITROGEN, 3)
            .await?;
        Ok(NpkReading {
            nitrogen_mg_kg: regs[0],
            phosphorus_mg_kg: regs[1],
            potassium_mg_kg: regs[2],
        })
    }

    /// Decode a big-endian IEEE-754 coefficient from its HI/LO register
    /// pair (`sen0605.py` packs with `struct.pack('>f', ...)` then splits
    /// into two big-endian 16-bit halves).
    fn decode_coefficient(hi: u16, lo: u16) -> f32 {
        let bytes = [
            (hi >> 8) as u8,
            (hi & 0xFF) as u8,
            (lo >> 8) as u8,
            (lo & 0xFF) as u8,
        ];
        f32::from_be_bytes(bytes)
    }

    fn encode_coefficient(value: f32) -> (u16, u16) {
        let bytes = value.to_be_bytes();
        let hi = u16::from_be_bytes([bytes[0], bytes[1]]);
        let lo = u16::from_be_bytes([bytes[2], bytes[3]]);
        (hi, lo)
    }

    async fn read_coefficient(&self, hi_reg: u16) -> Result<f32, TransportError> {
        let regs = self
            .transport
            .read_registers_preferred(self.device_addr, hi_reg, 2)
            .await?;
        Ok(Self::decode_coefficient(regs[0], regs[1]))
    }

    pub async fn nitrogen_coefficient(&self) -> Result<f32, TransportError> {
        self.read_coefficient(REG_N_COEFF_HI).await
    }

    pub async fn phosphorus_coefficient(&self) -> Result<f32, TransportError> {
        self.read_coefficient(REG_P_COEFF_HI).await
    }

    pub async fn potassium_coefficient(&self) -> Result<f32, TransportError> {
        self.read_coefficient(REG_K_COEFF_HI).await
    }

    async fn read_deviation(&self, reg: u16) -> Result<u16, TransportError> {
        let regs = self.transport.read_registers_preferred(self.device_addr, reg, 1).await?;
        Ok(regs[0])
    }

    pub async fn nitrogen_deviation(&self) -> Result<u16, TransportError> {
        self.read_deviation(REG_N_DEVIATION).await
    }

    pub async fn phosphorus_deviation(&self) -> Result<u16, TransportError> {
        self.read_deviation(REG_P_DEVIATION).await
    }

    pub async fn potassium_deviation(&self) -> Result<u16, TransportError> {
        self.read_deviation(REG_K_DEVIATION).await
    }

    /// Write a coefficient, respecting the ≥250 ms gap between the HI and
    /// LO register writes that `sen0605.py` enforces with `sleep(0.25)`.
    pub async fn set_nitrogen_coefficient(&self, value: f32) -> Result<(), TransportError> {
        let (hi, lo) = Self::encode_coefficient(value);
        self.transport.write_register(self.device_addr, REG_N_COEFF_HI, hi).await?;
        self.transport.idle_gap().await;
        self.transport.write_register(self.device_addr, REG_N_COEFF_HI + 1, lo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::test_double::ScriptedModbus;

    #[tokio::test]
    async fn decodes_npk_block() {
        let mut dbl = ScriptedModbus::new();
        dbl.push_input(0x0B, Ok(vec![120, 45, 210]));
        let t = Arc::new(ModbusTransport::new(Box::new(dbl)));
        let sensor = NpkSensor::new(t, 0x0B).await;

        let reading = sensor.read_all().await.unwrap();
        assert_eq!(reading.nitrogen_mg_kg, 120);
        assert_eq!(reading.phosphorus_mg_kg, 45);
        assert_eq!(reading.potassium_mg_kg, 210);
    }

    #[test]
    fn coefficient_round_trips_through_register_pair() {
        let value = 1.25_f32;
        let (hi, lo) = NpkSensor::encode_coefficient(value);
        let decoded = NpkSensor::decode_coefficient(hi, lo);
        assert!((decoded - value).abs() < 1e-6);
    }

    #[tokio::test]
    async fn defaults_to_input_registers_preference() {
        let mut dbl = ScriptedModbus::new();
        dbl.push_input(0x0B, Ok(vec![1, 2, 3]));
        let t = Arc::new(ModbusTransport::new(Box::new(dbl)));
        let sensor = NpkSensor::new(t.clone(), 0x0B).await;
        // a holding-register read was never queued; if the driver tried
        // holding first this would fail with a Timeout
        assert!(sensor.read_all().await.is_ok());
    }
}
