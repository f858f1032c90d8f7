pub mod npk;
pub mod rht;

pub use npk::{NpkReading, NpkSensor};
pub use rht::{RhtBlock, RhtSensor};
