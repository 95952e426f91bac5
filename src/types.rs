//! Core data model shared by sources, the broadcaster and downstream stages.
//!
//! A [`SignalFrame`] is what a source captures; a [`TelemetryMessage`] is what the
//! broadcaster fans out. The conversion between the two (CAN decoding, IMU and
//! GNSS naming) lives in [`crate::router`].

use crate::error::{AppResult, GatewayError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest classic CAN payload.
pub const CAN_MAX_DLC: usize = 8;
/// Largest 11-bit arbitration ID.
pub const CAN_STANDARD_ID_MAX: u32 = 0x7FF;
/// Largest 29-bit arbitration ID.
pub const CAN_EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Origin of a frame or telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// CAN bus frames.
    Can,
    /// Inertial measurement unit.
    Imu,
    /// GNSS receiver. Serialized as `"gps"` on the wire.
    #[serde(rename = "gps")]
    Gnss,
    /// Output of the velocity fusion stage.
    Fusion,
}

impl SourceKind {
    /// Name used in the JSON stream.
    pub fn wire_name(self) -> &'static str {
        match self {
            SourceKind::Can => "can",
            SourceKind::Imu => "imu",
            SourceKind::Gnss => "gps",
            SourceKind::Fusion => "fusion",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Classic CAN frame, built directly from bus or wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    arbitration_id: u32,
    dlc: u8,
    data: [u8; CAN_MAX_DLC],
    extended: bool,
}

impl CanFrame {
    /// Build a frame, validating the ID range and payload length.
    pub fn new(arbitration_id: u32, payload: &[u8], extended: bool) -> AppResult<Self> {
        if payload.len() > CAN_MAX_DLC {
            return Err(GatewayError::malformed(format!(
                "CAN payload of {} bytes exceeds {}",
                payload.len(),
                CAN_MAX_DLC
            )));
        }
        let max_id = if extended {
            CAN_EXTENDED_ID_MAX
        } else {
            CAN_STANDARD_ID_MAX
        };
        if arbitration_id > max_id {
            return Err(GatewayError::malformed(format!(
                "arbitration ID 0x{arbitration_id:X} out of range for {} frame",
                if extended { "extended" } else { "standard" }
            )));
        }
        let mut data = [0u8; CAN_MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            arbitration_id,
            dlc: payload.len() as u8,
            data,
            extended,
        })
    }

    /// Arbitration identifier.
    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    /// Data length code (0–8).
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// The `dlc` meaningful payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Payload zero-padded to eight bytes.
    pub fn padded_data(&self) -> [u8; CAN_MAX_DLC] {
        self.data
    }

    /// True for 29-bit identifiers.
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} [{}]", self.arbitration_id, self.dlc)?;
        for byte in self.data() {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

/// One named IMU channel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    /// Channel name, e.g. `accel_x`.
    pub name: String,
    /// Value in `unit`.
    pub value: f64,
    /// Engineering unit.
    pub unit: String,
}

impl ImuReading {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// Navigation solution from the GNSS receiver.
///
/// Position, speed and heading stay `None` until the receiver reports a fix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GnssFix {
    /// Degrees, WGS84.
    pub latitude: Option<f64>,
    /// Degrees, WGS84.
    pub longitude: Option<f64>,
    /// Metres above the ellipsoid.
    pub altitude: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Heading of motion in degrees.
    pub heading: Option<f64>,
    /// Satellites used in the solution.
    pub satellites: Option<u8>,
    /// Receiver fix type (0 = none, 2 = 2D, 3 = 3D, ...).
    pub fix_quality: Option<u8>,
    /// North velocity in m/s.
    pub velocity_north: Option<f64>,
    /// East velocity in m/s.
    pub velocity_east: Option<f64>,
}

/// Source-specific content of a [`SignalFrame`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single CAN frame.
    Can(CanFrame),
    /// One batch of IMU readings sharing a timestamp.
    Imu(Vec<ImuReading>),
    /// One navigation solution.
    Gnss(GnssFix),
}

/// A timestamped capture from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalFrame {
    /// Producing source.
    pub source: SourceKind,
    /// Capture time from [`crate::clock::now_ns`].
    pub timestamp_ns: u64,
    /// Captured content.
    pub payload: Payload,
}

impl SignalFrame {
    /// Wrap a CAN frame.
    pub fn can(frame: CanFrame, timestamp_ns: u64) -> Self {
        Self {
            source: SourceKind::Can,
            timestamp_ns,
            payload: Payload::Can(frame),
        }
    }

    /// Wrap a batch of IMU readings.
    pub fn imu(readings: Vec<ImuReading>, timestamp_ns: u64) -> Self {
        Self {
            source: SourceKind::Imu,
            timestamp_ns,
            payload: Payload::Imu(readings),
        }
    }

    /// Wrap a GNSS solution.
    pub fn gnss(fix: GnssFix, timestamp_ns: u64) -> Self {
        Self {
            source: SourceKind::Gnss,
            timestamp_ns,
            payload: Payload::Gnss(fix),
        }
    }
}

/// A named, scaled value delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    /// Hierarchical path such as `/BMS1/pack_current`.
    pub name: String,
    /// Engineering value.
    pub value: f64,
    /// Engineering unit, empty when dimensionless.
    pub unit: String,
    /// Capture time of the frame the value came from.
    pub timestamp_ns: u64,
}

impl DecodedSignal {
    /// Convenience constructor.
    pub fn new(
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            unit: unit.into(),
            timestamp_ns,
        }
    }
}

/// The unit published on the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    /// Producing source.
    pub source: SourceKind,
    /// Capture time shared by every signal in the message.
    pub timestamp_ns: u64,
    /// The raw frame for CAN messages.
    pub can_frame: Option<CanFrame>,
    /// Decoded signals, possibly empty for undecoded CAN frames.
    pub signals: Vec<DecodedSignal>,
}

impl TelemetryMessage {
    /// Message without a raw CAN frame.
    pub fn signals(source: SourceKind, timestamp_ns: u64, signals: Vec<DecodedSignal>) -> Self {
        Self {
            source,
            timestamp_ns,
            can_frame: None,
            signals,
        }
    }

    /// Find a signal by its full name.
    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// An outbound CAN transmission requested by a command client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Destination arbitration ID.
    pub target_arbitration_id: u32,
    /// At most eight bytes.
    pub payload: Vec<u8>,
    /// Send with a 29-bit identifier.
    pub extended: bool,
}

impl Command {
    /// Validate and build the frame that goes on the bus.
    pub fn to_can_frame(&self) -> AppResult<CanFrame> {
        CanFrame::new(self.target_arbitration_id, &self.payload, self.extended)
    }
}
