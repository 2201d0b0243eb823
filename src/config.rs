use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::acquire::AcquirerConfig;
use crate::pixel::{ColorProcessing, PixelFormat};
use crate::sdk::StubConfig;
use crate::worker::WorkerConfig;

const DEFAULT_TOPIC: &str = "polarcamera/image";
const DEFAULT_PUBLISH_RATE_HZ: u32 = 30;
const DEFAULT_GRAB_TIMEOUT_MS: u64 = 1000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;
const DEFAULT_V4L2_WIDTH: u32 = 640;
const DEFAULT_V4L2_HEIGHT: u32 = 480;

pub const CONFIG_ENV: &str = "POLAR_CAMERA_CONFIG";

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    system: Option<SystemKind>,
    topic: Option<String>,
    publish_rate_hz: Option<u32>,
    grab_timeout_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    color_processing: Option<ColorProcessing>,
    stub: Option<StubConfigFile>,
    v4l2: Option<V4l2ConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StubConfigFile {
    devices: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<PixelFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct V4l2ConfigFile {
    width: Option<u32>,
    height: Option<u32>,
}

/// Camera SDK backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemKind {
    #[default]
    Stub,
    V4l2,
}

impl FromStr for SystemKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(SystemKind::Stub),
            "v4l2" => Ok(SystemKind::V4l2),
            other => Err(anyhow!("unknown camera system {:?} (expected stub or v4l2)", other)),
        }
    }
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemKind::Stub => f.write_str("stub"),
            SystemKind::V4l2 => f.write_str("v4l2"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub system: SystemKind,
    pub topic: String,
    pub publish_rate_hz: u32,
    /// `None` blocks on the device until a frame arrives.
    pub grab_timeout: Option<Duration>,
    pub max_consecutive_failures: u32,
    pub color_processing: ColorProcessing,
    pub stub: StubConfig,
    pub v4l2: V4l2Settings,
}

/// Requested capture format for V4L2 devices. The driver may adjust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V4l2Settings {
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Settings {
    fn default() -> Self {
        Self {
            width: DEFAULT_V4L2_WIDTH,
            height: DEFAULT_V4L2_HEIGHT,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            system: SystemKind::Stub,
            topic: DEFAULT_TOPIC.to_string(),
            publish_rate_hz: DEFAULT_PUBLISH_RATE_HZ,
            grab_timeout: grab_timeout_from_ms(DEFAULT_GRAB_TIMEOUT_MS),
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            color_processing: ColorProcessing::default(),
            stub: StubConfig::default(),
            v4l2: V4l2Settings::default(),
        }
    }
}

impl CameraConfig {
    /// Load from the file named by `POLAR_CAMERA_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CameraConfigFile) -> Self {
        let defaults = Self::default();
        let stub_file = file.stub.unwrap_or_default();
        let stub = StubConfig {
            devices: stub_file.devices.unwrap_or(defaults.stub.devices),
            width: stub_file.width.unwrap_or(defaults.stub.width),
            height: stub_file.height.unwrap_or(defaults.stub.height),
            pixel_format: stub_file.pixel_format.unwrap_or(defaults.stub.pixel_format),
            ..defaults.stub
        };
        let v4l2_file = file.v4l2.unwrap_or_default();
        let v4l2 = V4l2Settings {
            width: v4l2_file.width.unwrap_or(defaults.v4l2.width),
            height: v4l2_file.height.unwrap_or(defaults.v4l2.height),
        };
        Self {
            system: file.system.unwrap_or(defaults.system),
            topic: file.topic.unwrap_or(defaults.topic),
            publish_rate_hz: file.publish_rate_hz.unwrap_or(defaults.publish_rate_hz),
            grab_timeout: file
                .grab_timeout_ms
                .map(grab_timeout_from_ms)
                .unwrap_or(defaults.grab_timeout),
            max_consecutive_failures: file
                .max_consecutive_failures
                .unwrap_or(defaults.max_consecutive_failures),
            color_processing: file.color_processing.unwrap_or(defaults.color_processing),
            stub,
            v4l2,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(system) = std::env::var("POLAR_CAMERA_SYSTEM") {
            if !system.trim().is_empty() {
                self.system = system.parse()?;
            }
        }
        if let Ok(topic) = std::env::var("POLAR_CAMERA_TOPIC") {
            if !topic.trim().is_empty() {
                self.topic = topic;
            }
        }
        if let Ok(rate) = std::env::var("POLAR_CAMERA_RATE_HZ") {
            self.publish_rate_hz = rate
                .trim()
                .parse()
                .map_err(|_| anyhow!("POLAR_CAMERA_RATE_HZ must be an integer rate in Hz"))?;
        }
        if let Ok(timeout) = std::env::var("POLAR_CAMERA_GRAB_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("POLAR_CAMERA_GRAB_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.grab_timeout = grab_timeout_from_ms(millis);
        }
        if let Ok(failures) = std::env::var("POLAR_CAMERA_MAX_FAILURES") {
            self.max_consecutive_failures = failures
                .trim()
                .parse()
                .map_err(|_| anyhow!("POLAR_CAMERA_MAX_FAILURES must be an integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.publish_rate_hz == 0 {
            return Err(anyhow!("publish_rate_hz must be greater than zero"));
        }
        if self.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }
        if self.topic.trim().is_empty() {
            return Err(anyhow!("topic must not be empty"));
        }
        if self.stub.width == 0 || self.stub.height == 0 {
            return Err(anyhow!("stub width and height must be greater than zero"));
        }
        if self.v4l2.width == 0 || self.v4l2.height == 0 {
            return Err(anyhow!("v4l2 width and height must be greater than zero"));
        }
        Ok(())
    }

    pub fn acquirer(&self) -> AcquirerConfig {
        AcquirerConfig {
            grab_timeout: self.grab_timeout,
            color_processing: self.color_processing,
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            max_consecutive_failures: self.max_consecutive_failures,
            ..WorkerConfig::default()
        }
    }
}

fn grab_timeout_from_ms(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn read_config_file(path: &Path) -> Result<CameraConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let cfg = CameraConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.system, SystemKind::Stub);
        assert_eq!(cfg.topic, "polarcamera/image");
        assert_eq!(cfg.grab_timeout, Some(Duration::from_millis(1000)));
        assert_eq!(cfg.acquirer().color_processing, ColorProcessing::HqLinear);
        assert_eq!(cfg.worker().max_consecutive_failures, 10);
        Ok(())
    }

    #[test]
    fn zero_timeout_blocks_forever() {
        assert_eq!(grab_timeout_from_ms(0), None);
        assert_eq!(grab_timeout_from_ms(5), Some(Duration::from_millis(5)));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: CameraConfigFile =
            serde_json::from_str(r#"{"stub": {"width": 32}, "color_processing": "nearest_neighbor"}"#)
                .unwrap();
        let cfg = CameraConfig::from_file(file);
        assert_eq!(cfg.stub.width, 32);
        assert_eq!(cfg.stub.height, 480);
        assert_eq!(cfg.stub.pool_size, StubConfig::default().pool_size);
        assert_eq!(cfg.color_processing, ColorProcessing::NearestNeighbor);
        assert_eq!(cfg.publish_rate_hz, 30);
    }

    #[test]
    fn system_kind_parses() {
        assert_eq!("V4L2".parse::<SystemKind>().unwrap(), SystemKind::V4l2);
        assert!("gige".parse::<SystemKind>().is_err());
        assert_eq!(SystemKind::Stub.to_string(), "stub");
    }

    #[test]
    fn rejects_zero_rate() {
        let cfg = CameraConfig {
            publish_rate_hz: 0,
            ..CameraConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
