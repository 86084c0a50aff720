//! Configuration management for the camera streamer

use crate::tier::{
    PixelFormat, Resolution, TierPolicy, DEFAULT_EXTENDED_THRESHOLD, DEFAULT_ONCHIP_CAPACITY,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Multipart boundary used by the original firmware's adaptive builds
pub const DEFAULT_BOUNDARY: &str = "123456789000000000000987654321";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete streamer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Memory probing and tier thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Detected extended memory in bytes (0 = none present)
    #[serde(default)]
    pub extended_bytes: u64,

    /// Minimum extended memory for the high tier
    #[serde(default = "default_extended_threshold")]
    pub extended_threshold_bytes: u64,

    /// On-chip memory available to frame buffers
    #[serde(default = "default_onchip_capacity")]
    pub onchip_capacity_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            extended_bytes: 0,
            extended_threshold_bytes: default_extended_threshold(),
            onchip_capacity_bytes: default_onchip_capacity(),
        }
    }
}

/// Camera driver selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    TestPattern,
    Gstreamer,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_driver")]
    pub driver: DriverKind,

    /// Camera device
    /// - macOS: "0" for first webcam
    /// - Raspberry Pi: libcamera camera name
    /// - Linux: "/dev/video0"
    #[serde(default = "default_device")]
    pub device: String,

    /// Sensor output format
    #[serde(default = "default_pixel_format")]
    pub pixel_format: PixelFormat,

    /// Frames per second
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Sensor-side JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u32,

    /// Flip method (optional)
    /// - "vertical-flip"
    /// - "horizontal-flip"
    /// - "rotate-180"
    #[serde(default)]
    pub flip_method: Option<String>,

    /// Make every nth grab fail (test-pattern driver only)
    #[serde(default)]
    pub fail_every: Option<u32>,

    /// Longest a single driver grab may block
    #[serde(default = "default_grab_timeout")]
    pub grab_timeout_ms: u64,

    /// Delay before a consumer retries a failed capture
    #[serde(default = "default_capture_retry")]
    pub capture_retry_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            device: default_device(),
            pixel_format: default_pixel_format(),
            fps: default_fps(),
            jpeg_quality: default_jpeg_quality(),
            flip_method: None,
            fail_every: None,
            grab_timeout_ms: default_grab_timeout(),
            capture_retry_ms: default_capture_retry(),
        }
    }
}

impl CameraConfig {
    pub fn capture_retry(&self) -> Duration {
        Duration::from_millis(self.capture_retry_ms)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

/// Transcoding of non-JPEG frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// JPEG quality for transcoded frames (1-100)
    #[serde(default = "default_encode_quality")]
    pub quality: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: default_encode_quality(),
        }
    }
}

/// MJPEG HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Multipart boundary token, agreed with clients out of band
    #[serde(default = "default_boundary")]
    pub boundary: String,

    /// Pause between parts (0 = as fast as frames arrive)
    #[serde(default)]
    pub frame_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_http_port(),
            boundary: default_boundary(),
            frame_delay_ms: 0,
        }
    }
}

/// Push transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Off,
    Udp,
    Tcp,
}

/// Datagram/stream frame transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_mode")]
    pub mode: TransportMode,

    #[serde(default = "default_dest_host")]
    pub dest_host: String,

    #[serde(default = "default_dest_port")]
    pub dest_port: u16,

    /// Local UDP port (0 = auto-assign)
    #[serde(default)]
    pub local_port: u16,

    /// Period between frames
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Maximum UDP payload per fragment
    #[serde(default = "default_max_chunk")]
    pub max_chunk: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long the TCP sender waits for the receiver's ready byte
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Statistics reporting interval (seconds)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: default_transport_mode(),
            dest_host: default_dest_host(),
            dest_port: default_dest_port(),
            local_port: 0,
            interval_ms: default_interval(),
            max_chunk: default_max_chunk(),
            connect_timeout_ms: default_connect_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            stats_interval_seconds: default_stats_interval(),
        }
    }
}

impl TransportConfig {
    pub fn destination(&self) -> String {
        format!("{}:{}", self.dest_host, self.dest_port)
    }
}

/// Network join supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Detection result reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_report_url")]
    pub url: String,

    #[serde(default = "default_report_interval")]
    pub interval_ms: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_report_url(),
            interval_ms: default_report_interval(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_extended_threshold() -> u64 {
    DEFAULT_EXTENDED_THRESHOLD
}
fn default_onchip_capacity() -> u64 {
    DEFAULT_ONCHIP_CAPACITY
}
fn default_driver() -> DriverKind {
    DriverKind::TestPattern
}
fn default_device() -> String {
    "0".to_string()
}
fn default_pixel_format() -> PixelFormat {
    PixelFormat::Jpeg
}
fn default_fps() -> u32 {
    30
}
fn default_jpeg_quality() -> u32 {
    85
}
fn default_grab_timeout() -> u64 {
    1000
}
fn default_capture_retry() -> u64 {
    100
}
fn default_encode_quality() -> u8 {
    80
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_boundary() -> String {
    DEFAULT_BOUNDARY.to_string()
}
fn default_transport_mode() -> TransportMode {
    TransportMode::Off
}
fn default_dest_host() -> String {
    "127.0.0.1".to_string()
}
fn default_dest_port() -> u16 {
    5005
}
fn default_interval() -> u64 {
    100
}
fn default_max_chunk() -> usize {
    1024
}
fn default_connect_timeout() -> u64 {
    2000
}
fn default_ack_timeout() -> u64 {
    2000
}
fn default_stats_interval() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    1000
}
fn default_report_url() -> String {
    "http://127.0.0.1/api/coordinates".to_string()
}
fn default_report_interval() -> u64 {
    1000
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Tier selection inputs derived from this configuration
    pub fn tier_policy(&self) -> TierPolicy {
        TierPolicy {
            extended_threshold: self.memory.extended_threshold_bytes,
            onchip_capacity: self.memory.onchip_capacity_bytes,
            pixel_format: self.camera.pixel_format,
        }
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let smallest = self.camera.pixel_format.frame_budget(Resolution::Qqvga);
        if self.memory.onchip_capacity_bytes < smallest {
            return Err(ConfigError::Invalid(format!(
                "onchip_capacity_bytes must hold one {} {:?} frame ({} bytes), got {}",
                Resolution::Qqvga,
                self.camera.pixel_format,
                smallest,
                self.memory.onchip_capacity_bytes
            )));
        }

        let cam = &self.camera;
        if cam.fps == 0 || cam.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera: FPS must be between 1 and 120, got {}",
                cam.fps
            )));
        }

        if cam.jpeg_quality == 0 || cam.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "camera: quality must be between 1 and 100, got {}",
                cam.jpeg_quality
            )));
        }

        if cam.grab_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "camera: grab_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.encoder.quality == 0 || self.encoder.quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "encoder: quality must be between 1 and 100, got {}",
                self.encoder.quality
            )));
        }

        // RFC 2046: 1-70 characters, no whitespace we would have to quote
        let boundary = &self.http.boundary;
        if boundary.is_empty()
            || boundary.len() > 70
            || !boundary.bytes().all(|b| b.is_ascii_graphic() && b != b'"')
        {
            return Err(ConfigError::Invalid(format!(
                "http: boundary must be 1-70 printable ASCII characters, got {:?}",
                boundary
            )));
        }

        let transport = &self.transport;
        if transport.mode != TransportMode::Off {
            if transport.dest_port == 0 {
                return Err(ConfigError::Invalid(
                    "transport: dest_port must be > 0".to_string(),
                ));
            }

            if transport.interval_ms == 0 {
                return Err(ConfigError::Invalid(
                    "transport: interval_ms must be > 0".to_string(),
                ));
            }
        }

        // 65507 is the largest IPv4 UDP payload
        if transport.max_chunk == 0 || transport.max_chunk > 65507 - crate::transport::HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transport: max_chunk must be between 1 and {}, got {}",
                65507 - crate::transport::HEADER_SIZE,
                transport.max_chunk
            )));
        }

        if transport.ack_timeout_ms == 0 || transport.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport: timeouts must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http.boundary, DEFAULT_BOUNDARY);
        assert_eq!(config.transport.max_chunk, 1024);
        assert_eq!(config.transport.mode, TransportMode::Off);
        assert_eq!(config.memory.extended_threshold_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[memory]
extended_bytes = 8388608
extended_threshold_bytes = 4194304

[camera]
driver = "test-pattern"
pixel_format = "rgb565"
fps = 15

[http]
port = 80
boundary = "frame"

[transport]
mode = "tcp"
dest_host = "192.168.1.100"
dest_port = 8080
ack_timeout_ms = 500
        "#;

        let config = Config::from_str(toml).unwrap();

        assert_eq!(config.memory.extended_bytes, 8 * 1024 * 1024);
        assert_eq!(config.tier_policy().extended_threshold, 4 * 1024 * 1024);
        assert_eq!(config.camera.pixel_format, PixelFormat::Rgb565);
        assert_eq!(config.camera.fps, 15);
        assert_eq!(config.http.port, 80);
        assert_eq!(config.http.boundary, "frame");
        assert_eq!(config.transport.mode, TransportMode::Tcp);
        assert_eq!(config.transport.destination(), "192.168.1.100:8080");
        assert_eq!(config.transport.ack_timeout_ms, 500);
        assert_eq!(config.transport.max_chunk, 1024);
    }

    #[test]
    fn test_invalid_boundary() {
        let toml = r#"
[http]
boundary = "has space"
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_invalid_chunk() {
        let toml = r#"
[transport]
max_chunk = 0
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_onchip_too_small_for_format() {
        let toml = r#"
[memory]
onchip_capacity_bytes = 4096

[camera]
pixel_format = "rgb888"
        "#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_zero_grab_timeout_rejected() {
        let mut config = Config::default();
        config.camera.grab_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.camera.grab_timeout_ms = 250;
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.grab_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let toml = r#"
[camera]
driver = "v4l"
        "#;
        assert!(matches!(Config::from_str(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = Config::from_str(&toml_str).unwrap();

        assert_eq!(config.http.boundary, parsed.http.boundary);
        assert_eq!(config.transport.mode, parsed.transport.mode);
    }
}
