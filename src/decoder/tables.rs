//! Signal layouts for the vehicle's CAN messages.
//!
//! Each message is described as a list of [`SignalLayout`]s. A frame shorter than
//! the furthest byte any of its layouts reads decodes to nothing.

use super::DecoderRegistry;
use crate::types::{CanFrame, DecodedSignal};

/// Where and how a raw value sits in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Unsigned byte at the offset.
    U8(usize),
    /// Unsigned big-endian 16-bit word at the offset.
    U16Be(usize),
    /// Signed big-endian 16-bit word at the offset.
    I16Be(usize),
}

impl Field {
    /// One past the last byte read.
    pub fn end(self) -> usize {
        match self {
            Field::U8(offset) => offset + 1,
            Field::U16Be(offset) | Field::I16Be(offset) => offset + 2,
        }
    }

    fn read(self, data: &[u8]) -> Option<f64> {
        match self {
            Field::U8(offset) => data.get(offset).map(|b| f64::from(*b)),
            Field::U16Be(offset) => data
                .get(offset..offset + 2)
                .map(|b| f64::from(u16::from_be_bytes([b[0], b[1]]))),
            Field::I16Be(offset) => data
                .get(offset..offset + 2)
                .map(|b| f64::from(i16::from_be_bytes([b[0], b[1]]))),
        }
    }
}

/// One named signal inside a message.
#[derive(Debug, Clone, Copy)]
pub struct SignalLayout {
    /// Published signal name.
    pub name: &'static str,
    /// Raw field location.
    pub field: Field,
    /// Multiplier applied to the raw value.
    pub scale: f64,
    /// Engineering unit.
    pub unit: &'static str,
}

const fn raw(name: &'static str, field: Field, unit: &'static str) -> SignalLayout {
    SignalLayout {
        name,
        field,
        scale: 1.0,
        unit,
    }
}

const fn scaled(name: &'static str, field: Field, scale: f64, unit: &'static str) -> SignalLayout {
    SignalLayout {
        name,
        field,
        scale,
        unit,
    }
}

const PEDALS_APPS: &[SignalLayout] = &[
    raw("/0x90/APPS1raw", Field::U16Be(0), ""),
    raw("/0x90/APPS2raw", Field::U16Be(2), ""),
];

const PEDALS_BSE: &[SignalLayout] = &[
    raw("/0x91/BSE1raw", Field::U16Be(0), ""),
    raw("/0x91/BSE2raw", Field::U16Be(2), ""),
    raw("/0x91/VOL", Field::U16Be(4), ""),
];

const BMS_PACK: &[SignalLayout] = &[
    scaled("/BMS1/pack_current", Field::I16Be(0), 0.1, "A"),
    scaled("/BMS1/pack_voltage", Field::I16Be(2), 0.1, "V"),
];

const BMS_LIMITS: &[SignalLayout] = &[
    scaled("/BMS2/PackDCL", Field::U8(0), 0.1, "A"),
    raw("/BMS2/PackCCL", Field::U8(1), "A"),
    raw("/BMS2/simulatedSOC", Field::U8(3), "%"),
];

const BMS_STATE: &[SignalLayout] = &[
    raw("/BMS3/PackSOC", Field::U8(1), "%"),
    raw("/BMS3/PackOpenVoltage", Field::U16Be(4), "V"),
];

const MOTOR_LEFT: &[SignalLayout] = &[raw("/Motor/RPM_L", Field::U16Be(0), "RPM")];
const MOTOR_RIGHT: &[SignalLayout] = &[raw("/Motor/RPM_R", Field::U16Be(0), "RPM")];
const WHEEL_RIGHT: &[SignalLayout] = &[raw("/Wheel/RPM_R", Field::U16Be(0), "RPM")];
const WHEEL_LEFT: &[SignalLayout] = &[raw("/Wheel/RPM_L", Field::U16Be(0), "RPM")];

/// Arbitration ID to layout table loaded by [`DecoderRegistry::with_defaults`].
pub const DEFAULT_TABLE: &[(u32, &[SignalLayout])] = &[
    (0x090, PEDALS_APPS),
    (0x091, PEDALS_BSE),
    (0x03B, BMS_PACK),
    (0x3CB, BMS_LIMITS),
    (0x6B2, BMS_STATE),
    (0x584, MOTOR_LEFT),
    (0x585, MOTOR_RIGHT),
    (0x586, WHEEL_RIGHT),
    (0x587, WHEEL_LEFT),
];

/// Minimum payload length a layout list needs.
pub fn layout_len(layouts: &[SignalLayout]) -> usize {
    layouts.iter().map(|l| l.field.end()).max().unwrap_or(0)
}

/// Minimum payload length for a default-table ID.
pub fn required_len(arbitration_id: u32) -> Option<usize> {
    DEFAULT_TABLE
        .iter()
        .find(|(id, _)| *id == arbitration_id)
        .map(|(_, layouts)| layout_len(layouts))
}

/// Decode `frame` according to `layouts`.
pub fn decode_layouts(
    layouts: &[SignalLayout],
    frame: &CanFrame,
    timestamp_ns: u64,
) -> Vec<DecodedSignal> {
    let data = frame.data();
    if data.len() < layout_len(layouts) {
        return Vec::new();
    }
    layouts
        .iter()
        .filter_map(|layout| {
            layout.field.read(data).map(|raw| {
                DecodedSignal::new(layout.name, raw * layout.scale, layout.unit, timestamp_ns)
            })
        })
        .collect()
}

/// Register every entry of [`DEFAULT_TABLE`].
pub fn register_defaults(registry: &mut DecoderRegistry) {
    for &(id, layouts) in DEFAULT_TABLE {
        registry.register(id, move |frame, ts| decode_layouts(layouts, frame, ts));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(id: u32, data: &[u8]) -> Vec<DecodedSignal> {
        let frame = CanFrame::new(id, data, false).unwrap();
        let (_, layouts) = DEFAULT_TABLE.iter().find(|(i, _)| *i == id).unwrap();
        decode_layouts(layouts, &frame, 0)
    }

    #[test]
    fn pack_current_is_signed() {
        // -100 * 0.1
        let signals = decode(0x03B, &[0xFF, 0x9C, 0x01, 0x00]);
        assert!((signals[0].value + 10.0).abs() < 1e-9);
        assert!((signals[1].value - 25.6).abs() < 1e-9);
    }

    #[test]
    fn bms_limits_skip_byte_two() {
        let signals = decode(0x3CB, &[200, 30, 0xEE, 87]);
        assert!((signals[0].value - 20.0).abs() < 1e-9);
        assert_eq!(signals[1].value, 30.0);
        assert_eq!(signals[2].name, "/BMS2/simulatedSOC");
        assert_eq!(signals[2].value, 87.0);
    }

    #[test]
    fn open_voltage_reads_bytes_four_and_five() {
        let signals = decode(0x6B2, &[0, 55, 0, 0, 0x01, 0x90]);
        assert_eq!(signals[0].value, 55.0);
        assert_eq!(signals[1].value, 400.0);
    }

    #[test]
    fn rpm_messages_are_unsigned() {
        let signals = decode(0x586, &[0xEA, 0x60]);
        assert_eq!(signals[0].name, "/Wheel/RPM_R");
        assert_eq!(signals[0].value, 60000.0);
    }

    #[test]
    fn layout_lengths() {
        assert_eq!(required_len(0x090), Some(4));
        assert_eq!(required_len(0x091), Some(6));
        assert_eq!(required_len(0x3CB), Some(4));
        assert_eq!(required_len(0x6B2), Some(6));
        assert_eq!(required_len(0x584), Some(2));
        assert_eq!(required_len(0x123), None);
    }
}
