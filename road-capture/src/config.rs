//! Agent configuration: TOML file plus environment overrides.
//!
//! Search order for the config file: an explicit `--config` path, then
//! `./config/agent.toml`, `/etc/road-capture/agent.toml`,
//! `~/.config/road-capture/agent.toml`. A missing file is fine - every
//! field has a default. Environment variables override the file, and a
//! final validation pass collects every problem before the agent starts.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Baud rates the HS6602 can be configured for.
const SUPPORTED_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Primary camera identifier (`/dev/videoN`, bare index, udev alias).
    pub device: String,
    /// Optional second camera; cycles alternate between the two.
    pub device2: Option<String>,
    /// Requested resolution `[width, height]`.
    pub resolution: (u32, u32),
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            device2: None,
            resolution: (1920, 1080),
            fps: 30,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub slave_address: u8,
    pub timeout_ms: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            slave_address: 1,
            timeout_ms: 500,
        }
    }
}

impl GpsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 2.0,
            max_delay_secs: 60.0,
            exponential_base: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub backend_url: String,
    pub timeout_secs: f64,
    pub retry: RetryConfig,
    pub queue_max_size: usize,
    pub workers: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:8000/api/upload".to_string(),
            timeout_secs: 10.0,
            retry: RetryConfig::default(),
            queue_max_size: 1000,
            workers: 2,
        }
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Device code reported in every upload payload.
    pub device_id: String,
    pub log_level: String,
    pub capture_interval_secs: f64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            device_id: "TERMINAL_001".to_string(),
            log_level: "info".to_string(),
            capture_interval_secs: 1.0,
        }
    }
}

impl SystemConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs_f64(self.capture_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub camera: CameraConfig,
    pub gps: GpsConfig,
    pub upload: UploadConfig,
    pub system: SystemConfig,
}

impl AgentConfig {
    /// Load configuration: file (explicit or searched), environment
    /// overrides, then validation.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit.map(Path::to_path_buf).or_else(find_config_file) {
            Some(path) => {
                info!(path = %path.display(), "loading configuration");
                Self::from_file(&path)?
            }
            None => {
                info!("no configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("BACKEND_API_URL") {
            self.upload.backend_url = url;
        }
        if let Some(port) = lookup("GPS_SERIAL_PORT") {
            self.gps.serial_port = port;
        }
        if let Some(baud) = lookup("GPS_BAUD_RATE") {
            if let Ok(baud) = baud.parse() {
                self.gps.baud_rate = baud;
            }
        }
        if let Some(device) = lookup("CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(device2) = lookup("CAMERA_DEVICE2") {
            self.camera.device2 = Some(device2);
        }
        if let Some(id) = lookup("DEVICE_ID") {
            self.system.device_id = id;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.system.log_level = level;
        }
        if let Some(interval) = lookup("CAPTURE_INTERVAL") {
            if let Ok(interval) = interval.parse() {
                self.system.capture_interval_secs = interval;
            }
        }
    }

    /// Check every field, collecting all problems into one error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            problems.push("camera resolution must be nonzero".to_string());
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            problems.push("jpeg_quality must be between 1 and 100".to_string());
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.gps.baud_rate) {
            problems.push(format!(
                "gps baud_rate {} is not supported by the module",
                self.gps.baud_rate
            ));
        }
        if !(1..=254).contains(&self.gps.slave_address) {
            problems.push("gps slave_address must be between 1 and 254".to_string());
        }
        if self.gps.timeout_ms == 0 {
            problems.push("gps timeout_ms must be positive".to_string());
        }
        if self.upload.backend_url.is_empty() || !self.upload.backend_url.starts_with("http") {
            problems.push("upload backend_url must be an http(s) URL".to_string());
        }
        if self.upload.timeout_secs <= 0.0 {
            problems.push("upload timeout_secs must be positive".to_string());
        }
        if self.upload.retry.max_attempts == 0 {
            problems.push("retry max_attempts must be at least 1".to_string());
        }
        if self.upload.retry.exponential_base < 1.0 {
            problems.push("retry exponential_base must be >= 1.0".to_string());
        }
        if self.upload.queue_max_size == 0 {
            problems.push("upload queue_max_size must be at least 1".to_string());
        }
        if self.upload.workers == 0 {
            problems.push("upload workers must be at least 1".to_string());
        }
        if self.system.capture_interval_secs <= 0.0 {
            problems.push("capture_interval_secs must be positive".to_string());
        }
        if self.system.device_id.is_empty() {
            problems.push("device_id must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn find_config_file() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("config/agent.toml"),
        PathBuf::from("/etc/road-capture/agent.toml"),
    ];
    if let Ok(home) = env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config/road-capture/agent.toml"));
    }
    candidates.into_iter().find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[camera]
device = "/dev/video2"
resolution = [1280, 720]

[system]
device_id = "TERMINAL_042"
capture_interval_secs = 2.5
"#
        )
        .unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.camera.device, "/dev/video2");
        assert_eq!(config.camera.resolution, (1280, 720));
        assert_eq!(config.camera.fps, 30);
        assert_eq!(config.system.device_id, "TERMINAL_042");
        assert_eq!(config.system.capture_interval_secs, 2.5);
        assert_eq!(config.upload.retry.max_attempts, 5);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera = 3").unwrap();
        assert!(matches!(
            AgentConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = AgentConfig::default();
        config.apply_overrides(|key| match key {
            "BACKEND_API_URL" => Some("http://backend:9000/api/upload".to_string()),
            "CAMERA_DEVICE" => Some("1".to_string()),
            "CAPTURE_INTERVAL" => Some("0.5".to_string()),
            _ => None,
        });

        assert_eq!(config.upload.backend_url, "http://backend:9000/api/upload");
        assert_eq!(config.camera.device, "1");
        assert_eq!(config.system.capture_interval_secs, 0.5);
    }

    #[test]
    fn unparseable_numeric_overrides_are_ignored() {
        let mut config = AgentConfig::default();
        config.apply_overrides(|key| match key {
            "GPS_BAUD_RATE" => Some("fast".to_string()),
            _ => None,
        });
        assert_eq!(config.gps.baud_rate, 9600);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = AgentConfig::default();
        config.camera.jpeg_quality = 0;
        config.gps.baud_rate = 1234;
        config.gps.slave_address = 0;
        config.upload.workers = 0;

        let Err(ConfigError::Invalid(problems)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn interval_helpers_convert_to_durations() {
        let config = AgentConfig::default();
        assert_eq!(config.system.capture_interval(), Duration::from_secs(1));
        assert_eq!(config.gps.timeout(), Duration::from_millis(500));
        assert_eq!(config.upload.timeout(), Duration::from_secs(10));
    }
}
