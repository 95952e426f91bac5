//! Turns captured frames into published telemetry.
//!
//! CAN frames go through the [`DecoderRegistry`]; IMU and GNSS payloads are already
//! named and only get their hierarchical prefix here.

use crate::decoder::DecoderRegistry;
use crate::network::broadcaster::{Broadcaster, PublishReport};
use crate::types::{DecodedSignal, GnssFix, Payload, SignalFrame, TelemetryMessage};
use std::sync::Arc;
use tracing::trace;

/// Prefix for IMU signal names.
pub const IMU_PREFIX: &str = "/IMU";
/// Prefix for GNSS signal names.
pub const GNSS_PREFIX: &str = "/GNSS";

/// Decodes and publishes frames on behalf of every source.
#[derive(Debug, Clone)]
pub struct FrameRouter {
    registry: Arc<DecoderRegistry>,
    broadcaster: Arc<Broadcaster>,
    forward_undecoded: bool,
}

impl FrameRouter {
    /// Router publishing on `broadcaster`.
    pub fn new(
        registry: Arc<DecoderRegistry>,
        broadcaster: Arc<Broadcaster>,
        forward_undecoded: bool,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            forward_undecoded,
        }
    }

    /// The broadcaster frames are published on.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Build the message for `frame`. `None` for CAN frames with no decoded
    /// signals unless undecoded forwarding is on.
    pub fn to_message(&self, frame: SignalFrame) -> Option<TelemetryMessage> {
        let SignalFrame {
            source,
            timestamp_ns,
            payload,
        } = frame;
        match payload {
            Payload::Can(can) => {
                let signals = self.registry.decode(&can, timestamp_ns);
                if signals.is_empty() && !self.forward_undecoded {
                    trace!(frame = %can, "no decoded signals, not forwarded");
                    return None;
                }
                Some(TelemetryMessage {
                    source,
                    timestamp_ns,
                    can_frame: Some(can),
                    signals,
                })
            }
            Payload::Imu(readings) => {
                let signals = readings
                    .into_iter()
                    .map(|r| {
                        DecodedSignal::new(
                            format!("{IMU_PREFIX}/{}", r.name),
                            r.value,
                            r.unit,
                            timestamp_ns,
                        )
                    })
                    .collect();
                Some(TelemetryMessage::signals(source, timestamp_ns, signals))
            }
            Payload::Gnss(fix) => Some(TelemetryMessage::signals(
                source,
                timestamp_ns,
                gnss_signals(&fix, timestamp_ns),
            )),
        }
    }

    /// Convert and publish. Returns `None` when the frame was not forwarded.
    pub fn route(&self, frame: SignalFrame) -> Option<PublishReport> {
        let message = self.to_message(frame)?;
        Some(self.broadcaster.publish(message))
    }
}

/// Named signals for every populated field of `fix`.
pub fn gnss_signals(fix: &GnssFix, timestamp_ns: u64) -> Vec<DecodedSignal> {
    let fields: [(&str, Option<f64>, &str); 9] = [
        ("latitude", fix.latitude, "deg"),
        ("longitude", fix.longitude, "deg"),
        ("altitude", fix.altitude, "m"),
        ("ground_speed", fix.speed, "m/s"),
        ("heading", fix.heading, "deg"),
        ("satellites", fix.satellites.map(f64::from), ""),
        ("fix_type", fix.fix_quality.map(f64::from), ""),
        ("vel_north", fix.velocity_north, "m/s"),
        ("vel_east", fix.velocity_east, "m/s"),
    ];
    fields
        .into_iter()
        .filter_map(|(name, value, unit)| {
            value.map(|v| DecodedSignal::new(format!("{GNSS_PREFIX}/{name}"), v, unit, timestamp_ns))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanFrame, ImuReading, SourceKind};

    fn router(forward_undecoded: bool) -> FrameRouter {
        FrameRouter::new(
            Arc::new(DecoderRegistry::with_defaults()),
            Arc::new(Broadcaster::new(8)),
            forward_undecoded,
        )
    }

    #[test]
    fn can_frames_are_decoded() {
        let frame = CanFrame::new(0x03B, &[0x00, 0x64, 0x00, 0x32], false).unwrap();
        let message = router(false).to_message(SignalFrame::can(frame, 100)).unwrap();
        assert_eq!(message.source, SourceKind::Can);
        assert_eq!(message.can_frame, Some(frame));
        assert_eq!(message.signals.len(), 2);
        assert!((message.signal("/BMS1/pack_voltage").unwrap().value - 5.0).abs() < 1e-9);
    }

    #[test]
    fn undecoded_frames_forwarded_only_when_enabled() {
        let frame = CanFrame::new(0x123, &[1], false).unwrap();
        assert!(router(false).to_message(SignalFrame::can(frame, 0)).is_none());

        let message = router(true).to_message(SignalFrame::can(frame, 0)).unwrap();
        assert!(message.signals.is_empty());
        assert_eq!(message.can_frame, Some(frame));

        // Truncated frame of a known ID behaves like an unknown one
        let short = CanFrame::new(0x03B, &[0x00], false).unwrap();
        assert!(router(false).to_message(SignalFrame::can(short, 0)).is_none());
    }

    #[test]
    fn imu_names_are_prefixed() {
        let readings = vec![
            ImuReading::new("accel_x", 0.5, "m/s^2"),
            ImuReading::new("heading", 90.0, "deg"),
        ];
        let message = router(false).to_message(SignalFrame::imu(readings, 7)).unwrap();
        assert_eq!(message.source, SourceKind::Imu);
        assert_eq!(message.signals[0].name, "/IMU/accel_x");
        assert_eq!(message.signals[1].name, "/IMU/heading");
        assert!(message.signals.iter().all(|s| s.timestamp_ns == 7));
    }

    #[test]
    fn gnss_skips_missing_fields() {
        let fix = GnssFix {
            satellites: Some(4),
            fix_quality: Some(0),
            ..Default::default()
        };
        let signals = gnss_signals(&fix, 1);
        let names: Vec<&str> = signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["/GNSS/satellites", "/GNSS/fix_type"]);
    }

    #[test]
    fn route_publishes() {
        let router = router(false);
        let mut sub = router.broadcaster().subscribe_local(4);
        let report = router
            .route(SignalFrame::gnss(
                GnssFix {
                    speed: Some(3.0),
                    ..Default::default()
                },
                5,
            ))
            .unwrap();
        assert_eq!(report.delivered, 1);
        let message = sub.try_recv().unwrap();
        assert_eq!(message.signals[0].name, "/GNSS/ground_speed");
    }
}
