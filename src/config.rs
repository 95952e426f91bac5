//! Gateway configuration using Figment.
//!
//! Layers, later ones winning:
//! 1. Built-in defaults ([`GatewayConfig::default`])
//! 2. A TOML file (`config/gateway.toml`, or the path given on the command line)
//! 3. Environment variables prefixed with `GATEWAY_`, `__` separating nested keys
//!    (`GATEWAY_NETWORK__RX_PORT=7100`)
//! 4. The deployment variables `CAN_INTERFACE`, `RX_STREAM_PORT`,
//!    `TX_COMMAND_PORT` and `CAN_INPUT`
//!
//! # Example
//! ```no_run
//! use telemetry_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::load(None)?;
//! println!("broadcasting on {}", config.network.rx_port);
//! # Ok::<(), telemetry_gateway::error::GatewayError>(())
//! ```

use crate::error::{AppResult, GatewayError};
use crate::logging::{parse_log_level, OutputFormat};
use crate::types::SourceKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file read when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// Highest BNO055 fusion output rate.
pub const MAX_IMU_RATE_HZ: f64 = 100.0;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Process-level settings
    pub gateway: ProcessConfig,
    /// CAN acquisition and transmit
    pub can: CanConfig,
    /// BNO055 inertial measurement unit
    pub imu: ImuConfig,
    /// u-blox GNSS receiver
    pub gnss: GnssConfig,
    /// TCP listeners and subscriber queues
    pub network: NetworkConfig,
    /// Source reconnect timing
    pub reconnect: ReconnectConfig,
    /// Velocity Kalman filter
    pub fusion: FusionConfig,
    /// Visualization-rate stream
    pub decimator: DecimatorConfig,
    /// Teardown
    pub shutdown: ShutdownConfig,
}

/// Process-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Where inbound CAN frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanInput {
    /// Local bus through Linux SocketCAN
    Socketcan,
    /// A remote bridge connecting to the gateway over TCP
    TcpBridge,
}

/// Framing used on a TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Newline-delimited JSON objects
    Json,
    /// Fixed 21-byte big-endian records
    Binary,
}

/// CAN acquisition and transmit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanConfig {
    /// Run the CAN source
    pub enabled: bool,
    /// SocketCAN interface name (`can0`, `vcan0`)
    pub interface: String,
    /// Frame origin
    pub input: CanInput,
    /// Listen address for the TCP bridge
    pub bridge_bind: String,
    /// Record framing used by the bridge peer
    pub bridge_format: WireFormat,
    /// Bounded wait on each bus read
    pub recv_timeout_ms: u64,
    /// Publish frames with no registered decoder
    pub forward_undecoded: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: "can0".to_string(),
            input: CanInput::Socketcan,
            bridge_bind: "0.0.0.0:5000".to_string(),
            bridge_format: WireFormat::Json,
            recv_timeout_ms: 1000,
            forward_undecoded: false,
        }
    }
}

/// IMU configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// Run the IMU source
    pub enabled: bool,
    /// i2c-dev character device
    pub device: PathBuf,
    /// 7-bit bus address
    pub address: u16,
    /// Polling rate, at most the sensor's fusion output rate
    pub rate_hz: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: PathBuf::from("/dev/i2c-3"),
            address: 0x28,
            rate_hz: MAX_IMU_RATE_HZ,
        }
    }
}

/// GNSS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    /// Run the GNSS source
    pub enabled: bool,
    /// Serial device path
    pub port: String,
    /// Working baud rate
    pub baud: u32,
    /// Factory baud rate; when it differs from `baud` the receiver is switched on connect
    pub initial_baud: u32,
    /// Bounded wait on each serial read
    pub read_timeout_ms: u64,
    /// Send the UBX configuration sequence after opening the port
    pub configure: bool,
    /// Navigation solution rate requested from the receiver
    pub nav_rate_hz: u16,
    /// Save the configuration to the receiver's flash after sending it
    pub persist: bool,
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "/dev/ttymxc1".to_string(),
            baud: 115_200,
            initial_baud: 9_600,
            read_timeout_ms: 1000,
            configure: true,
            nav_rate_hz: 10,
            persist: true,
        }
    }
}

/// TCP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address every listener binds to
    pub bind_host: String,
    /// Broadcast stream port
    pub rx_port: u16,
    /// Command port
    pub tx_port: u16,
    /// Framing of the broadcast stream
    pub wire_format: WireFormat,
    /// Framing of the command stream
    pub command_format: WireFormat,
    /// Encoded records buffered per subscriber before it is dropped
    pub subscriber_queue: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            rx_port: 7000,
            tx_port: 7001,
            wire_format: WireFormat::Json,
            command_format: WireFormat::Json,
            subscriber_queue: 256,
        }
    }
}

/// Reconnect timing shared by every source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay after a disconnect
    pub delay_ms: u64,
    /// Growth per consecutive failure; 1.0 keeps the delay fixed
    pub backoff_multiplier: f64,
    /// Upper bound for the delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: 2000,
            backoff_multiplier: 1.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Velocity fusion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Run the fusion stage
    pub enabled: bool,
    /// Q
    pub process_noise: f64,
    /// R
    pub measurement_noise: f64,
    /// Starting P
    pub initial_covariance: f64,
    /// Starting velocity in m/s
    pub initial_velocity: f64,
    /// Signal integrated as forward acceleration
    pub accel_signal: String,
    /// Signal used as the speed measurement
    pub speed_signal: String,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            process_noise: 0.05,
            measurement_noise: 0.8,
            initial_covariance: 1.0,
            initial_velocity: 0.0,
            accel_signal: "/IMU/accel_x".to_string(),
            speed_signal: "/GNSS/ground_speed".to_string(),
        }
    }
}

/// Downsampling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimationStrategy {
    /// Single-pole IIR filter
    LowPass,
    /// Mean of the last `window` samples
    MovingAverage,
}

/// Decimated stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecimatorConfig {
    /// Serve the decimated stream
    pub enabled: bool,
    /// Filter used before downsampling
    pub strategy: DecimationStrategy,
    /// Low-pass cutoff
    pub cutoff_hz: f64,
    /// Input sample rate assumed by the low-pass filter
    pub sample_rate_hz: f64,
    /// Emit every Nth sample per topic
    pub factor: usize,
    /// Moving-average window
    pub window: usize,
    /// Port of the decimated stream
    pub port: u16,
    /// Sources whose signals are decimated
    pub sources: Vec<SourceKind>,
}

impl Default for DecimatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: DecimationStrategy::LowPass,
            cutoff_hz: 1.0,
            sample_rate_hz: MAX_IMU_RATE_HZ,
            factor: 10,
            window: 3,
            port: 7002,
            sources: vec![SourceKind::Imu],
        }
    }
}

/// Teardown configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for tasks to finish after shutdown is requested
    pub timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl GatewayConfig {
    /// Load, then validate.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(GatewayError::Configuration(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
        }
        let config: Self = Self::figment(path).extract()?;
        config.validate().map_err(GatewayError::Configuration)?;
        Ok(config)
    }

    /// The provider stack without extracting.
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .merge(deployment_env())
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.gateway.log_level)?;

        let host = self.bind_ip()?;
        let mut ports = HashSet::new();
        // Port 0 asks the OS for an ephemeral port and never collides
        let mut claim = |port: u16, what: &str| -> Result<(), String> {
            if port != 0 && !ports.insert(port) {
                return Err(format!("{what} port {port} is already used by another listener"));
            }
            Ok(())
        };
        claim(self.network.rx_port, "rx")?;
        claim(self.network.tx_port, "tx")?;
        if self.decimator.enabled {
            claim(self.decimator.port, "decimator")?;
        }
        if self.can.enabled && self.can.input == CanInput::TcpBridge {
            let bridge = self.bridge_addr()?;
            if bridge.ip() == host || bridge.ip().is_unspecified() || host.is_unspecified() {
                claim(bridge.port(), "can bridge")?;
            }
        }

        if self.network.subscriber_queue == 0 {
            return Err("network.subscriber_queue must be at least 1".to_string());
        }
        if self.can.recv_timeout_ms == 0 {
            return Err("can.recv_timeout_ms must be non-zero".to_string());
        }
        if self.can.enabled && self.can.input == CanInput::Socketcan && self.can.interface.is_empty()
        {
            return Err("can.interface must be set for socketcan input".to_string());
        }
        if !(self.imu.rate_hz > 0.0 && self.imu.rate_hz <= MAX_IMU_RATE_HZ) {
            return Err(format!(
                "Invalid imu.rate_hz {}. Must be in (0, {MAX_IMU_RATE_HZ}]",
                self.imu.rate_hz
            ));
        }
        if self.imu.address > 0x7F {
            return Err(format!("Invalid imu.address 0x{:X}", self.imu.address));
        }
        if self.gnss.baud == 0 || self.gnss.initial_baud == 0 || self.gnss.read_timeout_ms == 0 {
            return Err(
                "gnss.baud, gnss.initial_baud and gnss.read_timeout_ms must be non-zero".to_string(),
            );
        }
        if !(1..=40).contains(&self.gnss.nav_rate_hz) {
            return Err(format!(
                "Invalid gnss.nav_rate_hz {}. Must be 1-40",
                self.gnss.nav_rate_hz
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.delay_ms == 0 {
            return Err("reconnect.delay_ms must be non-zero".to_string());
        }
        if !(reconnect.backoff_multiplier.is_finite() && reconnect.backoff_multiplier >= 1.0) {
            return Err(format!(
                "Invalid reconnect.backoff_multiplier {}. Must be >= 1.0",
                reconnect.backoff_multiplier
            ));
        }
        if reconnect.max_delay_ms < reconnect.delay_ms {
            return Err("reconnect.max_delay_ms must be >= reconnect.delay_ms".to_string());
        }

        let fusion = &self.fusion;
        if !(fusion.process_noise.is_finite() && fusion.process_noise >= 0.0) {
            return Err(format!("Invalid fusion.process_noise {}", fusion.process_noise));
        }
        if !(fusion.measurement_noise.is_finite() && fusion.measurement_noise > 0.0) {
            return Err(format!(
                "Invalid fusion.measurement_noise {}",
                fusion.measurement_noise
            ));
        }
        if !(fusion.initial_covariance.is_finite() && fusion.initial_covariance > 0.0) {
            return Err(format!(
                "Invalid fusion.initial_covariance {}. Must be > 0",
                fusion.initial_covariance
            ));
        }

        let decimator = &self.decimator;
        if decimator.factor == 0 || decimator.window == 0 {
            return Err("decimator.factor and decimator.window must be at least 1".to_string());
        }
        if !(decimator.cutoff_hz.is_finite() && decimator.cutoff_hz > 0.0) {
            return Err(format!("Invalid decimator.cutoff_hz {}", decimator.cutoff_hz));
        }
        if !(decimator.sample_rate_hz.is_finite() && decimator.sample_rate_hz > 0.0) {
            return Err(format!(
                "Invalid decimator.sample_rate_hz {}",
                decimator.sample_rate_hz
            ));
        }

        Ok(())
    }

    /// Parsed listen host.
    pub fn bind_ip(&self) -> Result<IpAddr, String> {
        self.network
            .bind_host
            .parse()
            .map_err(|e| format!("Invalid network.bind_host '{}': {e}", self.network.bind_host))
    }

    /// Parsed bridge listen address.
    pub fn bridge_addr(&self) -> Result<SocketAddr, String> {
        self.can
            .bridge_bind
            .parse()
            .map_err(|e| format!("Invalid can.bridge_bind '{}': {e}", self.can.bridge_bind))
    }

    /// Broadcast stream address.
    pub fn rx_addr(&self) -> AppResult<SocketAddr> {
        self.listen_addr(self.network.rx_port)
    }

    /// Command stream address.
    pub fn tx_addr(&self) -> AppResult<SocketAddr> {
        self.listen_addr(self.network.tx_port)
    }

    /// Decimated stream address.
    pub fn decimator_addr(&self) -> AppResult<SocketAddr> {
        self.listen_addr(self.decimator.port)
    }

    fn listen_addr(&self, port: u16) -> AppResult<SocketAddr> {
        let ip = self.bind_ip().map_err(GatewayError::Configuration)?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Shutdown join timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.timeout_ms)
    }
}

/// Unprefixed variables used by existing deployments.
fn deployment_env() -> Env {
    Env::raw()
        .only(&["CAN_INTERFACE", "RX_STREAM_PORT", "TX_COMMAND_PORT", "CAN_INPUT"])
        .map(|key| {
            let mapped = if key == "CAN_INTERFACE" {
                "can.interface"
            } else if key == "RX_STREAM_PORT" {
                "network.rx_port"
            } else if key == "TX_COMMAND_PORT" {
                "network.tx_port"
            } else {
                "can.input"
            };
            mapped.into()
        })
}
