//! u-blox UBX binary protocol.
//!
//! ```text
//! 0xB5 0x62 | class | id | length (u16 LE) | payload | CK_A CK_B
//! ```
//!
//! The checksum is an 8-bit Fletcher sum over class, id, length and payload.

use crate::error::{AppResult, GatewayError};
use crate::types::GnssFix;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sync marker opening every message.
pub const SYNC: [u8; 2] = [0xB5, 0x62];

/// Sync, class, id and length.
pub const HEADER_LEN: usize = 6;

/// Largest payload accepted before the framer resynchronises.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// NAV-PVT payload size.
pub const NAV_PVT_LEN: usize = 92;

/// Message classes and ids used by the gateway.
pub mod msg {
    /// NAV class.
    pub const CLASS_NAV: u8 = 0x01;
    /// CFG class.
    pub const CLASS_CFG: u8 = 0x06;
    /// Standard NMEA sentences, for CFG-MSG.
    pub const CLASS_NMEA: u8 = 0xF0;
    /// NAV-PVT.
    pub const NAV_PVT: u8 = 0x07;
    /// CFG-PRT.
    pub const CFG_PRT: u8 = 0x00;
    /// CFG-MSG.
    pub const CFG_MSG: u8 = 0x01;
    /// CFG-RATE.
    pub const CFG_RATE: u8 = 0x08;
    /// CFG-CFG.
    pub const CFG_CFG: u8 = 0x09;
}

/// One checked UBX message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbxMessage {
    /// Message class.
    pub class: u8,
    /// Message id within the class.
    pub id: u8,
    /// Payload without header or checksum.
    pub payload: Bytes,
}

impl UbxMessage {
    /// Whether this is a NAV-PVT solution.
    pub fn is_nav_pvt(&self) -> bool {
        self.class == msg::CLASS_NAV && self.id == msg::NAV_PVT
    }
}

/// Fletcher checksum over `data`.
pub fn checksum(data: &[u8]) -> [u8; 2] {
    let (mut ck_a, mut ck_b) = (0u8, 0u8);
    for byte in data {
        ck_a = ck_a.wrapping_add(*byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }
    [ck_a, ck_b]
}

/// Encode a complete message.
pub fn encode(class: u8, id: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len() + 2);
    out.put_slice(&SYNC);
    out.put_u8(class);
    out.put_u8(id);
    out.put_u16_le(payload.len() as u16);
    out.put_slice(payload);
    let ck = checksum(&out[2..]);
    out.put_slice(&ck);
    out.freeze()
}

/// Reassembles UBX messages from arbitrary read boundaries.
///
/// Bytes ahead of a sync marker are discarded. A message whose checksum does not
/// match is dropped and scanning resumes just past its sync marker.
#[derive(Debug, Default)]
pub struct UbxFramer {
    buf: BytesMut,
    checksum_errors: u64,
}

impl UbxFramer {
    /// Empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the port.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drop buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Messages dropped for a bad checksum.
    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    /// Next complete, checked message.
    pub fn next_message(&mut self) -> Option<UbxMessage> {
        loop {
            let Some(start) = self.buf.windows(2).position(|w| w == SYNC) else {
                // Keep a trailing first sync byte; its partner may be in the next read
                let keep = usize::from(self.buf.last() == Some(&SYNC[0]));
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
                return None;
            };
            self.buf.advance(start);

            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len = usize::from(u16::from_le_bytes([self.buf[4], self.buf[5]]));
            if len > MAX_PAYLOAD_LEN {
                self.buf.advance(SYNC.len());
                continue;
            }
            let total = HEADER_LEN + len + 2;
            if self.buf.len() < total {
                return None;
            }

            let expected = checksum(&self.buf[2..HEADER_LEN + len]);
            if self.buf[HEADER_LEN + len..total] != expected {
                self.checksum_errors += 1;
                tracing::debug!(
                    class = self.buf[2],
                    id = self.buf[3],
                    len,
                    "dropping UBX message with bad checksum"
                );
                self.buf.advance(SYNC.len());
                continue;
            }

            let mut frame = self.buf.split_to(total);
            let class = frame[2];
            let id = frame[3];
            frame.advance(HEADER_LEN);
            frame.truncate(len);
            return Some(UbxMessage {
                class,
                id,
                payload: frame.freeze(),
            });
        }
    }
}

// =============================================================================
// Receiver configuration
// =============================================================================

/// CFG-PRT for UART1: 8N1, UBX in and out, at `baud`.
pub fn cfg_prt_uart1(baud: u32) -> Bytes {
    let mut payload = BytesMut::with_capacity(20);
    payload.put_u8(1); // portID
    payload.put_u8(0);
    payload.put_u16_le(0); // txReady
    payload.put_u32_le(0x0000_08D0); // mode: 8N1
    payload.put_u32_le(baud);
    payload.put_u16_le(0x0001); // inProtoMask: UBX
    payload.put_u16_le(0x0001); // outProtoMask: UBX
    payload.put_u16_le(0); // flags
    payload.put_u16_le(0);
    encode(msg::CLASS_CFG, msg::CFG_PRT, &payload)
}

/// CFG-MSG setting the output rate of one message on the current port.
pub fn cfg_msg(class: u8, id: u8, rate: u8) -> Bytes {
    encode(msg::CLASS_CFG, msg::CFG_MSG, &[class, id, rate])
}

/// CFG-RATE for a navigation rate of `rate_hz`, aligned to GPS time.
pub fn cfg_rate(rate_hz: u16) -> Bytes {
    let meas_ms = 1000 / rate_hz.clamp(1, 1000);
    let mut payload = BytesMut::with_capacity(6);
    payload.put_u16_le(meas_ms);
    payload.put_u16_le(1); // navRate
    payload.put_u16_le(1); // timeRef: GPS
    encode(msg::CLASS_CFG, msg::CFG_RATE, &payload)
}

/// CFG-CFG storing every configuration section to non-volatile memory.
pub fn cfg_save() -> Bytes {
    let mut payload = BytesMut::with_capacity(12);
    payload.put_u32_le(0); // clearMask
    payload.put_u32_le(0x0000_FFFF); // saveMask
    payload.put_u32_le(0); // loadMask
    encode(msg::CLASS_CFG, msg::CFG_CFG, &payload)
}

/// Messages sent after the port is open at its working baud rate: silence the
/// standard NMEA sentences, enable NAV-PVT, set the solution rate and, with
/// `persist`, save the result to flash.
pub fn configuration_sequence(nav_rate_hz: u16, persist: bool) -> Vec<Bytes> {
    let mut out: Vec<Bytes> = (0x00..=0x0E)
        .map(|id| cfg_msg(msg::CLASS_NMEA, id, 0))
        .collect();
    out.push(cfg_msg(msg::CLASS_NAV, msg::NAV_PVT, 1));
    out.push(cfg_rate(nav_rate_hz));
    if persist {
        out.push(cfg_save());
    }
    out
}

// =============================================================================
// NAV-PVT
// =============================================================================

fn u8_at(payload: &[u8], offset: usize) -> u8 {
    payload[offset]
}

fn i32_at(payload: &[u8], offset: usize) -> i32 {
    (&payload[offset..offset + 4]).get_i32_le()
}

/// Decode a NAV-PVT payload.
///
/// Fix type and satellite count are always reported. Position, height, velocity
/// and heading only once the receiver reports at least a 2D fix.
pub fn parse_nav_pvt(payload: &[u8]) -> AppResult<GnssFix> {
    if payload.len() < NAV_PVT_LEN {
        return Err(GatewayError::malformed(format!(
            "NAV-PVT payload is {} bytes, expected {}",
            payload.len(),
            NAV_PVT_LEN
        )));
    }

    let fix_type = u8_at(payload, 20);
    let mut fix = GnssFix {
        fix_quality: Some(fix_type),
        satellites: Some(u8_at(payload, 23)),
        ..GnssFix::default()
    };
    if fix_type < 2 {
        return Ok(fix);
    }

    fix.longitude = Some(f64::from(i32_at(payload, 24)) * 1e-7);
    fix.latitude = Some(f64::from(i32_at(payload, 28)) * 1e-7);
    fix.altitude = Some(f64::from(i32_at(payload, 32)) / 1000.0);
    fix.velocity_north = Some(f64::from(i32_at(payload, 48)) / 1000.0);
    fix.velocity_east = Some(f64::from(i32_at(payload, 52)) / 1000.0);
    fix.speed = Some(f64::from(i32_at(payload, 60)) / 1000.0);
    fix.heading = Some(f64::from(i32_at(payload, 64)) * 1e-5);
    Ok(fix)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A NAV-PVT payload with the given fix and motion.
    pub(crate) fn nav_pvt_payload(fix_type: u8, lat: f64, lon: f64, ground_speed: f64) -> Vec<u8> {
        let mut p = vec![0u8; NAV_PVT_LEN];
        p[20] = fix_type;
        p[23] = 11;
        p[24..28].copy_from_slice(&((lon * 1e7).round() as i32).to_le_bytes());
        p[28..32].copy_from_slice(&((lat * 1e7).round() as i32).to_le_bytes());
        p[32..36].copy_from_slice(&123_456i32.to_le_bytes());
        p[48..52].copy_from_slice(&1_500i32.to_le_bytes());
        p[52..56].copy_from_slice(&(-250i32).to_le_bytes());
        p[60..64].copy_from_slice(&((ground_speed * 1000.0).round() as i32).to_le_bytes());
        p[64..68].copy_from_slice(&9_000_000i32.to_le_bytes());
        p
    }

    #[test]
    fn checksum_matches_known_message() {
        // CFG-RATE 100 ms, as sent by u-center
        let message = cfg_rate(10);
        assert_eq!(
            &message[..],
            &[0xB5, 0x62, 0x06, 0x08, 0x06, 0x00, 0x64, 0x00, 0x01, 0x00, 0x01, 0x00, 0x7A, 0x12]
        );
    }

    #[test]
    fn reassembles_across_arbitrary_splits() {
        let payload = nav_pvt_payload(3, -23.5, -46.6, 12.5);
        let mut stream = b"$GPGGA,noise*00\r\n".to_vec();
        stream.extend_from_slice(&encode(msg::CLASS_NAV, msg::NAV_PVT, &payload));
        stream.extend_from_slice(&encode(0x05, 0x01, &[0x06, 0x08]));

        for split in [1usize, 2, 5, 7, 33, 97] {
            let mut framer = UbxFramer::new();
            let mut messages = Vec::new();
            for chunk in stream.chunks(split) {
                framer.extend(chunk);
                while let Some(m) = framer.next_message() {
                    messages.push(m);
                }
            }
            assert_eq!(messages.len(), 2, "split {split}");
            assert!(messages[0].is_nav_pvt());
            assert_eq!(&messages[0].payload[..], &payload[..]);
            assert_eq!((messages[1].class, messages[1].id), (0x05, 0x01));
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn corrupted_message_is_dropped_and_next_one_survives() {
        let mut bad = encode(msg::CLASS_NAV, msg::NAV_PVT, &nav_pvt_payload(3, 1.0, 2.0, 3.0)).to_vec();
        bad[30] ^= 0xFF;
        let good = encode(msg::CLASS_CFG, msg::CFG_MSG, &[0x01, 0x07, 0x01]);

        let mut framer = UbxFramer::new();
        framer.extend(&bad);
        framer.extend(&good);
        let message = framer.next_message().unwrap();
        assert_eq!(message.payload, Bytes::from_static(&[0x01, 0x07, 0x01]));
        assert!(framer.next_message().is_none());
        assert_eq!(framer.checksum_errors(), 1);
    }

    #[test]
    fn keeps_split_sync_byte() {
        let mut framer = UbxFramer::new();
        framer.extend(&[0x00, 0x11, 0xB5]);
        assert!(framer.next_message().is_none());
        assert_eq!(framer.buffered(), 1);
        let message = encode(msg::CLASS_CFG, msg::CFG_RATE, &[0; 6]);
        framer.extend(&message[1..]);
        assert!(framer.next_message().is_some());
    }

    #[test]
    fn nav_pvt_fields() {
        let fix = parse_nav_pvt(&nav_pvt_payload(3, -23.5505199, -46.6333094, 12.5)).unwrap();
        assert_eq!(fix.fix_quality, Some(3));
        assert_eq!(fix.satellites, Some(11));
        assert!((fix.latitude.unwrap() - -23.5505199).abs() < 1e-7);
        assert!((fix.longitude.unwrap() - -46.6333094).abs() < 1e-7);
        assert!((fix.altitude.unwrap() - 123.456).abs() < 1e-9);
        assert!((fix.speed.unwrap() - 12.5).abs() < 1e-9);
        assert!((fix.heading.unwrap() - 90.0).abs() < 1e-9);
        assert!((fix.velocity_north.unwrap() - 1.5).abs() < 1e-9);
        assert!((fix.velocity_east.unwrap() - -0.25).abs() < 1e-9);
    }

    #[test]
    fn no_fix_reports_only_status() {
        let fix = parse_nav_pvt(&nav_pvt_payload(0, 10.0, 10.0, 5.0)).unwrap();
        assert_eq!(fix.fix_quality, Some(0));
        assert_eq!(fix.satellites, Some(11));
        assert!(fix.latitude.is_none());
        assert!(fix.speed.is_none());
        assert!(parse_nav_pvt(&[0u8; 40]).is_err());
    }

    #[test]
    fn configuration_sequence_layout() {
        assert_eq!(configuration_sequence(10, false).len(), 17);
        let sequence = configuration_sequence(10, true);
        assert_eq!(sequence.len(), 18);

        let mut framer = UbxFramer::new();
        for message in &sequence {
            framer.extend(message);
        }
        let first = framer.next_message().unwrap();
        assert_eq!((first.class, first.id), (msg::CLASS_CFG, msg::CFG_MSG));
        assert_eq!(&first.payload[..], &[msg::CLASS_NMEA, 0x00, 0x00]);

        let save = (1..sequence.len())
            .filter_map(|_| framer.next_message())
            .last()
            .unwrap();
        assert_eq!((save.class, save.id), (msg::CLASS_CFG, msg::CFG_CFG));
        assert_eq!(&save.payload[..], &[0, 0, 0, 0, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0]);

        let prt = cfg_prt_uart1(115_200);
        assert_eq!(prt.len(), HEADER_LEN + 20 + 2);
        assert_eq!(&prt[HEADER_LEN + 8..HEADER_LEN + 12], &115_200u32.to_le_bytes());
    }
}
