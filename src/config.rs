use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;

use crate::osc::DRONE_DEFAULT_ADDR;
use crate::transform::DEFAULT_AXIS_REFLECTION;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub drone: DroneConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionConfig {
    /// Vision service TCP address
    #[serde(default = "default_vision_addr")]
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DroneConfig {
    /// OSC bridge address
    #[serde(default = "default_drone_addr")]
    pub addr: String,
    /// Heartbeat period while armed (ms)
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformConfig {
    /// Diagonal of the axis flip applied before the alignment matrix
    #[serde(default = "default_axis_reflection")]
    pub axis_reflection: [f64; 3],
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_exposure")]
    pub exposure: f64,
    #[serde(default)]
    pub gain: f64,
}

fn default_vision_addr() -> String { "127.0.0.1:3001".to_string() }
fn default_drone_addr() -> String { DRONE_DEFAULT_ADDR.to_string() }
fn default_heartbeat_ms() -> u64 { 500 }
fn default_axis_reflection() -> [f64; 3] { DEFAULT_AXIS_REFLECTION }
fn default_exposure() -> f64 { 100.0 }

impl Default for VisionConfig {
    fn default() -> Self {
        Self { addr: default_vision_addr() }
    }
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            addr: default_drone_addr(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { axis_reflection: default_axis_reflection() }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            exposure: default_exposure(),
            gain: 0.0,
        }
    }
}

impl DroneConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Missing or invalid file → defaults, with a warning.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("config {}: {e:#}; using defaults", path.as_ref().display());
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.drone.heartbeat_ms == 0 {
            bail!("drone.heartbeat_ms must be > 0");
        }
        if self.transform.axis_reflection.iter().any(|v| *v == 0.0 || !v.is_finite()) {
            bail!("transform.axis_reflection entries must be finite and non-zero");
        }
        Ok(())
    }
}
