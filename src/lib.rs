//! Autonomous multi-zone garden irrigation controller.
//!
//! Reads RH/T/EC/pH/salinity/TDS and NPK sensors over Modbus-RTU, drives
//! one relay per zone, meters flow with a pulse counter, and runs a
//! once-daily watering cycle gated on gardening season, a configurable
//! start time, and an Open-Meteo rain forecast.

pub mod clock;
pub mod decision;
pub mod error;
pub mod modbus;
pub mod pulses;
pub mod scheduler;
pub mod season;
pub mod sensors;
pub mod settings;
pub mod store;
pub mod topology;
pub mod units;
pub mod valve;
pub mod weather;
pub mod zone;
