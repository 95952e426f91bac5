//! Stream encodings.
//!
//! Broadcast records are either newline-delimited JSON or fixed 21-byte big-endian
//! CAN records:
//!
//! ```text
//! offset  size  field
//!      0     4  arbitration_id (u32)
//!      4     1  dlc (u8)
//!      5     8  data, zero-padded
//!     13     8  timestamp_ns (u64)
//! ```
//!
//! The same two framings carry inbound records on the command port and from the
//! CAN bridge.

use crate::config::WireFormat;
use crate::error::{AppResult, GatewayError};
use crate::types::{
    CanFrame, Command, TelemetryMessage, CAN_MAX_DLC, CAN_STANDARD_ID_MAX,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of one binary record.
pub const BINARY_RECORD_LEN: usize = 21;

/// Longest JSON line accepted before the buffer is discarded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Serialize)]
struct JsonRecord<'a> {
    source: &'static str,
    timestamp_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    can_id: Option<String>,
    signals: Vec<JsonSignal<'a>>,
}

#[derive(Serialize)]
struct JsonSignal<'a> {
    name: &'a str,
    value: f64,
    unit: &'a str,
}

/// Format an arbitration ID the way the JSON stream does.
pub fn format_can_id(arbitration_id: u32) -> String {
    format!("{arbitration_id:#x}")
}

/// One JSON line, newline included.
pub fn encode_json(message: &TelemetryMessage) -> AppResult<Bytes> {
    let record = JsonRecord {
        source: message.source.wire_name(),
        timestamp_ns: message.timestamp_ns,
        can_id: message
            .can_frame
            .as_ref()
            .map(|f| format_can_id(f.arbitration_id())),
        signals: message
            .signals
            .iter()
            .map(|s| JsonSignal {
                name: &s.name,
                value: s.value,
                unit: &s.unit,
            })
            .collect(),
    };
    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Binary record for a CAN message; other messages have no binary form.
pub fn encode_binary(message: &TelemetryMessage) -> Option<Bytes> {
    message
        .can_frame
        .as_ref()
        .map(|frame| Bytes::copy_from_slice(&encode_can_record(frame, message.timestamp_ns)))
}

/// Fixed-size big-endian record.
pub fn encode_can_record(frame: &CanFrame, timestamp_ns: u64) -> [u8; BINARY_RECORD_LEN] {
    let mut out = [0u8; BINARY_RECORD_LEN];
    let mut buf = &mut out[..];
    buf.put_u32(frame.arbitration_id());
    buf.put_u8(frame.dlc());
    buf.put_slice(&frame.padded_data());
    buf.put_u64(timestamp_ns);
    out
}

/// Parse a binary record. IDs above the 11-bit range are taken as extended.
pub fn decode_can_record(record: &[u8]) -> AppResult<(CanFrame, u64)> {
    if record.len() != BINARY_RECORD_LEN {
        return Err(GatewayError::malformed(format!(
            "binary record is {} bytes, expected {}",
            record.len(),
            BINARY_RECORD_LEN
        )));
    }
    let mut buf = record;
    let id = buf.get_u32();
    let dlc = buf.get_u8() as usize;
    if dlc > CAN_MAX_DLC {
        return Err(GatewayError::malformed(format!("dlc {dlc} exceeds 8")));
    }
    let data = &record[5..5 + dlc];
    buf.advance(CAN_MAX_DLC);
    let timestamp_ns = buf.get_u64();
    let frame = CanFrame::new(id, data, id > CAN_STANDARD_ID_MAX)?;
    Ok((frame, timestamp_ns))
}

/// `"0x03B"`, `"3B"` or a bare JSON number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdField {
    Number(u32),
    Text(String),
}

impl IdField {
    fn value(&self) -> AppResult<u32> {
        match self {
            IdField::Number(n) => Ok(*n),
            IdField::Text(s) => parse_hex_id(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonCanRecord {
    #[serde(alias = "id")]
    can_id: IdField,
    #[serde(default)]
    data: Vec<u8>,
    #[serde(default)]
    extended: Option<bool>,
}

/// Parse a hexadecimal identifier with or without the `0x` prefix.
pub fn parse_hex_id(text: &str) -> AppResult<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16)
        .map_err(|e| GatewayError::malformed(format!("invalid CAN id '{text}': {e}")))
}

/// A CAN frame from a bridge JSON line. Without an explicit `extended` flag the
/// ID width decides.
pub fn parse_json_frame(line: &[u8]) -> AppResult<CanFrame> {
    let record: JsonCanRecord = serde_json::from_slice(line)?;
    let id = record.can_id.value()?;
    let extended = record.extended.unwrap_or(id > CAN_STANDARD_ID_MAX);
    CanFrame::new(id, &record.data, extended)
}

/// A command from a JSON line. Standard IDs unless `extended` is set.
pub fn parse_json_command(line: &[u8]) -> AppResult<Command> {
    let record: JsonCanRecord = serde_json::from_slice(line)?;
    let command = Command {
        target_arbitration_id: record.can_id.value()?,
        payload: record.data,
        extended: record.extended.unwrap_or(false),
    };
    command.to_can_frame()?;
    Ok(command)
}

/// A command from a binary record. The timestamp field is ignored.
pub fn parse_binary_command(record: &[u8]) -> AppResult<Command> {
    let (frame, _) = decode_can_record(record)?;
    Ok(Command {
        target_arbitration_id: frame.arbitration_id(),
        payload: frame.data().to_vec(),
        extended: frame.is_extended(),
    })
}

/// JSON encoding of a frame for the bridge direction.
pub fn encode_json_frame(frame: &CanFrame) -> AppResult<Bytes> {
    let value = serde_json::json!({
        "can_id": format_can_id(frame.arbitration_id()),
        "data": frame.data(),
        "extended": frame.is_extended(),
    });
    let mut line = serde_json::to_vec(&value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Splits an inbound byte stream into records.
#[derive(Debug)]
pub struct RecordFramer {
    format: WireFormat,
    buf: BytesMut,
}

impl RecordFramer {
    /// Empty framer for `format`.
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Framing in use.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffered bytes not yet returned as a record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete record, or `None` until more bytes arrive. Blank JSON lines
    /// are skipped; a JSON line longer than [`MAX_LINE_LEN`] is discarded with an
    /// error.
    pub fn next_record(&mut self) -> AppResult<Option<Bytes>> {
        match self.format {
            WireFormat::Binary => {
                if self.buf.len() < BINARY_RECORD_LEN {
                    return Ok(None);
                }
                Ok(Some(self.buf.split_to(BINARY_RECORD_LEN).freeze()))
            }
            WireFormat::Json => loop {
                let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                    if self.buf.len() > MAX_LINE_LEN {
                        self.buf.clear();
                        return Err(GatewayError::malformed("line exceeds maximum length"));
                    }
                    return Ok(None);
                };
                let mut line = self.buf.split_to(pos + 1);
                if pos > MAX_LINE_LEN {
                    return Err(GatewayError::malformed("line exceeds maximum length"));
                }
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Ok(Some(line.freeze()));
            },
        }
    }

    /// Read from `reader` until a record is available. `Ok(None)` on a clean EOF.
    pub async fn read_record<R>(&mut self, reader: &mut R) -> AppResult<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(record) = self.next_record()? {
                return Ok(Some(record));
            }
            let n = reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    tracing::debug!(bytes = self.buf.len(), "discarding partial record at EOF");
                    self.buf.clear();
                }
                return Ok(None);
            }
        }
    }
}
