pub mod accumulator;
pub mod adjust;
pub mod calibration;
pub mod config;
pub mod coordinator;
pub mod drone;
pub mod error;
pub mod osc;
pub mod protocol;
pub mod transform;
pub mod vision;

pub use error::{Result, RigError};
