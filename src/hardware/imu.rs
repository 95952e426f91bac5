//! Bosch BNO055 inertial measurement unit on an I²C register bus.
//!
//! Register access is blocking and runs on the blocking pool. The source polls on
//! a fixed-period interval whose deadlines come from the monotonic clock, so a
//! slow read delays one sample without shifting the ones after it.

use super::SignalSource;
use crate::clock;
use crate::config::ImuConfig;
use crate::error::{AppResult, GatewayError};
use crate::types::{ImuReading, SignalFrame, SourceKind};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::info;

/// BNO055 register map (page 0).
pub mod reg {
    /// Gyroscope X LSB; 6 bytes.
    pub const GYRO_DATA: u8 = 0x14;
    /// Euler heading LSB; 6 bytes.
    pub const EULER_DATA: u8 = 0x1A;
    /// Linear acceleration X LSB; 6 bytes.
    pub const LINEAR_ACCEL_DATA: u8 = 0x28;
    /// Calibration status.
    pub const CALIB_STAT: u8 = 0x35;
    /// Unit selection.
    pub const UNIT_SEL: u8 = 0x3B;
    /// Operating mode.
    pub const OPR_MODE: u8 = 0x3D;
    /// Power mode.
    pub const PWR_MODE: u8 = 0x3E;
    /// System trigger.
    pub const SYS_TRIGGER: u8 = 0x3F;
}

const MODE_CONFIG: u8 = 0x00;
const MODE_NDOF: u8 = 0x0C;
const POWER_NORMAL: u8 = 0x00;

const WRITE_SETTLE: Duration = Duration::from_millis(10);
const CONFIG_MODE_SETTLE: Duration = Duration::from_millis(50);
const FUSION_MODE_SETTLE: Duration = Duration::from_millis(100);

/// LSB per m/s².
const ACCEL_SCALE: f64 = 100.0;
/// LSB per degree/s and per degree.
const ANGLE_SCALE: f64 = 16.0;

/// Blocking byte-register access to one device.
pub trait RegisterBus: Send {
    /// Write a single register.
    fn write_register(&mut self, register: u8, value: u8) -> AppResult<()>;

    /// Fill `buf` starting at `register`.
    fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> AppResult<()>;
}

/// Opens a [`RegisterBus`]. Called on the blocking pool.
pub trait BusOpener: Send + Sync {
    /// Open the bus and address the device.
    fn open(&self) -> AppResult<Box<dyn RegisterBus>>;

    /// Endpoint for logs.
    fn describe(&self) -> String;
}

/// A Linux i2c-dev character device.
#[derive(Debug, Clone)]
pub struct I2cDevOpener {
    device: PathBuf,
    address: u16,
}

impl I2cDevOpener {
    /// Opener for the device at `address` on the bus `device`.
    pub fn new(device: impl Into<PathBuf>, address: u16) -> Self {
        Self {
            device: device.into(),
            address,
        }
    }
}

impl From<&ImuConfig> for I2cDevOpener {
    fn from(config: &ImuConfig) -> Self {
        Self::new(config.device.clone(), config.address)
    }
}

#[cfg(feature = "i2c")]
mod i2c_impl {
    use super::*;
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;

    pub(super) struct LinuxBus(pub(super) LinuxI2CDevice);

    impl RegisterBus for LinuxBus {
        fn write_register(&mut self, register: u8, value: u8) -> AppResult<()> {
            self.0
                .smbus_write_byte_data(register, value)
                .map_err(|e| GatewayError::transport(format!("i2c write 0x{register:02X}: {e}")))
        }

        fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> AppResult<()> {
            self.0
                .write(&[register])
                .and_then(|()| self.0.read(buf))
                .map_err(|e| GatewayError::transport(format!("i2c read 0x{register:02X}: {e}")))
        }
    }
}

impl BusOpener for I2cDevOpener {
    #[cfg(feature = "i2c")]
    fn open(&self) -> AppResult<Box<dyn RegisterBus>> {
        let device = i2cdev::linux::LinuxI2CDevice::new(&self.device, self.address)
            .map_err(|e| GatewayError::transport(format!("open {}: {e}", self.describe())))?;
        Ok(Box::new(i2c_impl::LinuxBus(device)))
    }

    #[cfg(not(feature = "i2c"))]
    fn open(&self) -> AppResult<Box<dyn RegisterBus>> {
        Err(GatewayError::FeatureNotEnabled("i2c".to_string()))
    }

    fn describe(&self) -> String {
        format!("{}@0x{:02X}", self.device.display(), self.address)
    }
}

/// Per-subsystem calibration levels, 0 (uncalibrated) to 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationStatus {
    /// Fusion system.
    pub system: u8,
    /// Gyroscope.
    pub gyro: u8,
    /// Accelerometer.
    pub accel: u8,
    /// Magnetometer.
    pub mag: u8,
}

impl From<u8> for CalibrationStatus {
    fn from(raw: u8) -> Self {
        Self {
            system: (raw >> 6) & 0x03,
            gyro: (raw >> 4) & 0x03,
            accel: (raw >> 2) & 0x03,
            mag: raw & 0x03,
        }
    }
}

/// An initialised BNO055 in NDOF fusion mode.
pub struct Bno055 {
    bus: Box<dyn RegisterBus>,
}

impl Bno055 {
    /// Run the power-up sequence: CONFIG mode, normal power, clear SYS_TRIGGER,
    /// SI units, then NDOF. Blocks for the mode-switch settle times.
    pub fn init(bus: Box<dyn RegisterBus>) -> AppResult<Self> {
        let mut device = Self { bus };
        device.write(reg::OPR_MODE, MODE_CONFIG)?;
        std::thread::sleep(CONFIG_MODE_SETTLE);
        device.write(reg::PWR_MODE, POWER_NORMAL)?;
        device.write(reg::SYS_TRIGGER, 0x00)?;
        device.write(reg::UNIT_SEL, 0x00)?;
        device.write(reg::OPR_MODE, MODE_NDOF)?;
        std::thread::sleep(FUSION_MODE_SETTLE);
        Ok(device)
    }

    fn write(&mut self, register: u8, value: u8) -> AppResult<()> {
        self.bus.write_register(register, value)?;
        std::thread::sleep(WRITE_SETTLE);
        Ok(())
    }

    fn read_vector(&mut self, register: u8, scale: f64) -> AppResult<[f64; 3]> {
        let mut raw = [0u8; 6];
        self.bus.read_registers(register, &mut raw)?;
        Ok([0, 2, 4].map(|i| f64::from(i16::from_le_bytes([raw[i], raw[i + 1]])) / scale))
    }

    /// Current calibration levels.
    pub fn calibration(&mut self) -> AppResult<CalibrationStatus> {
        let mut raw = [0u8; 1];
        self.bus.read_registers(reg::CALIB_STAT, &mut raw)?;
        Ok(CalibrationStatus::from(raw[0]))
    }

    /// One sample: linear acceleration, angular rate, orientation and calibration.
    pub fn read_sample(&mut self) -> AppResult<Vec<ImuReading>> {
        let [ax, ay, az] = self.read_vector(reg::LINEAR_ACCEL_DATA, ACCEL_SCALE)?;
        let [gx, gy, gz] = self.read_vector(reg::GYRO_DATA, ANGLE_SCALE)?;
        let [heading, roll, pitch] = self.read_vector(reg::EULER_DATA, ANGLE_SCALE)?;
        let calibration = self.calibration()?;

        Ok(vec![
            ImuReading::new("accel_x", ax, "m/s^2"),
            ImuReading::new("accel_y", ay, "m/s^2"),
            ImuReading::new("accel_z", az, "m/s^2"),
            ImuReading::new("gyro_x", gx, "dps"),
            ImuReading::new("gyro_y", gy, "dps"),
            ImuReading::new("gyro_z", gz, "dps"),
            ImuReading::new("heading", heading, "deg"),
            ImuReading::new("roll", roll, "deg"),
            ImuReading::new("pitch", pitch, "deg"),
            ImuReading::new("calib_sys", f64::from(calibration.system), ""),
            ImuReading::new("calib_gyro", f64::from(calibration.gyro), ""),
            ImuReading::new("calib_accel", f64::from(calibration.accel), ""),
            ImuReading::new("calib_mag", f64::from(calibration.mag), ""),
        ])
    }
}

/// Polls a [`Bno055`] at a fixed rate.
pub struct ImuSource {
    opener: Arc<dyn BusOpener>,
    period: Duration,
    device: Option<Bno055>,
    ticker: Option<Interval>,
}

impl ImuSource {
    /// Source sampling at `rate_hz`.
    pub fn new(opener: Arc<dyn BusOpener>, rate_hz: f64) -> Self {
        Self {
            opener,
            period: Duration::from_secs_f64(1.0 / rate_hz),
            device: None,
            ticker: None,
        }
    }

    /// Sampling period.
    pub fn period(&self) -> Duration {
        self.period
    }
}

#[async_trait]
impl SignalSource for ImuSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Imu
    }

    fn describe(&self) -> String {
        self.opener.describe()
    }

    async fn connect(&mut self) -> AppResult<()> {
        let opener = self.opener.clone();
        let device = tokio::task::spawn_blocking(move || Bno055::init(opener.open()?)).await??;
        info!(endpoint = %self.opener.describe(), "BNO055 in NDOF mode");

        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        self.device = Some(device);
        Ok(())
    }

    async fn read(&mut self) -> AppResult<Option<SignalFrame>> {
        let ticker = self.ticker.as_mut().ok_or(GatewayError::NotConnected)?;
        ticker.tick().await;
        let timestamp_ns = clock::now_ns();

        let mut device = self.device.take().ok_or(GatewayError::NotConnected)?;
        let (device, sample) = tokio::task::spawn_blocking(move || {
            let sample = device.read_sample();
            (device, sample)
        })
        .await?;
        self.device = Some(device);

        Ok(Some(SignalFrame::imu(sample?, timestamp_ns)))
    }

    fn disconnect(&mut self) {
        self.device = None;
        self.ticker = None;
    }
}
