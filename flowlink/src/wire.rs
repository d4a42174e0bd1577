//! Wire format serialization and deserialization.
//!
//! Every frame is a single datagram: a message-type byte followed by a
//! type-specific payload. Multi-byte integers are little-endian.
//!
//! ```text
//! PairRequest   0x10 || echo (1)
//! PairConfirm   0x90 || [success (1)]
//! DataRequest   0x11
//! DataResponse  0x91 || count (1) || rates (count × 2) || ages (count × 4)
//! SetConfig     0x12..=0x15 || value (2) || mask (9 × 1, non-zero = selected)
//! ```
//!
//! Payload length is validated against the declared sensor count before any
//! reading takes place, so truncated frames are rejected instead of read past.

use alloc::vec::Vec;

use thiserror::Error;

use crate::types::{
    ConfigKind, MessageType, SelectionMask, SensorReading, SensorReadings, MAX_SENSORS_PER_NODE,
};

/// Bytes per sensor in a data response (u16 rate + u32 age).
const READING_WIRE_SIZE: usize = 6;

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    #[error("unexpected end of frame")]
    UnexpectedEof,
    /// Trailing bytes after a complete payload.
    #[error("invalid frame length")]
    InvalidLength,
    /// Unknown leading type byte.
    #[error("unknown message type 0x{0:02x}")]
    InvalidMessageType(u8),
    /// Declared sensor count above the per-node limit.
    #[error("declared {0} sensors, limit is {limit}", limit = MAX_SENSORS_PER_NODE)]
    CapacityExceeded(usize),
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(v)
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }
}

/// Writer for encoding messages.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    /// Finish writing and return the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    /// Encode this value to the writer.
    fn encode(&self, w: &mut Writer);

    /// Encode and return the bytes.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    /// Decode a value from the reader.
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice (strict: rejects trailing bytes).
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let result = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(result)
    }
}

/// Body of a data response: one reading per local sensor.
///
/// Rates and ages are laid out as two parallel arrays, not interleaved.
impl Encode for SensorReadings {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.len() as u8);
        for reading in self {
            w.write_u16_le(reading.pulse_rate);
        }
        for reading in self {
            w.write_u32_le(reading.last_pulse_age_ms);
        }
    }
}

impl Decode for SensorReadings {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = r.read_u8()? as usize;
        if count > MAX_SENSORS_PER_NODE {
            return Err(DecodeError::CapacityExceeded(count));
        }
        if r.remaining() < count * READING_WIRE_SIZE {
            return Err(DecodeError::UnexpectedEof);
        }

        let mut readings = SensorReadings::new();
        for _ in 0..count {
            let pulse_rate = r.read_u16_le()?;
            // count <= capacity was checked above
            let _ = readings.push(SensorReading {
                pulse_rate,
                last_pulse_age_ms: 0,
            });
        }
        for reading in readings.iter_mut() {
            reading.last_pulse_age_ms = r.read_u32_le()?;
        }
        Ok(readings)
    }
}

/// Configuration update: one value applied to every selected sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub value: u16,
    pub mask: SelectionMask,
}

impl Encode for ConfigUpdate {
    fn encode(&self, w: &mut Writer) {
        w.write_u16_le(self.value);
        for i in 0..MAX_SENSORS_PER_NODE {
            w.write_u8(self.mask.contains(i) as u8);
        }
    }
}

impl Decode for ConfigUpdate {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let value = r.read_u16_le()?;
        let flags: [u8; MAX_SENSORS_PER_NODE] = r.read_array()?;
        let mut mask = SelectionMask::EMPTY;
        for (i, flag) in flags.iter().enumerate() {
            if *flag != 0 {
                mask.set(i);
            }
        }
        Ok(ConfigUpdate { value, mask })
    }
}

/// Top-level protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    PairRequest,
    PairConfirm { success: bool },
    DataRequest,
    DataResponse(SensorReadings),
    SetConfig { kind: ConfigKind, update: ConfigUpdate },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::PairRequest => MessageType::PairRequest,
            Message::PairConfirm { .. } => MessageType::PairConfirm,
            Message::DataRequest => MessageType::DataRequest,
            Message::DataResponse(_) => MessageType::DataResponse,
            Message::SetConfig { kind, .. } => kind.message_type(),
        }
    }

    /// Payload bytes, without the leading type byte.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            // The request echoes its own type so it is never an empty datagram.
            Message::PairRequest => w.write_u8(MessageType::PairRequest.as_u8()),
            Message::PairConfirm { success } => w.write_u8(*success as u8),
            Message::DataRequest => {}
            Message::DataResponse(readings) => readings.encode(&mut w),
            Message::SetConfig { update, .. } => update.encode(&mut w),
        }
        w.finish()
    }

    /// Decode the payload that followed a `kind` type byte.
    ///
    /// Pairing payloads are informational and accepted in any length; an
    /// empty confirm counts as success.
    pub fn decode_payload(kind: MessageType, payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(match kind {
            MessageType::PairRequest => Message::PairRequest,
            MessageType::PairConfirm => Message::PairConfirm {
                success: payload.first().map_or(true, |b| *b != 0),
            },
            MessageType::DataRequest => Message::DataRequest,
            MessageType::DataResponse => {
                Message::DataResponse(SensorReadings::decode_from_slice(payload)?)
            }
            MessageType::SetWindow
            | MessageType::SetDebounce
            | MessageType::SetMinPulsesPerPacket
            | MessageType::SetMaxPackets => {
                let update = ConfigUpdate::decode_from_slice(payload)?;
                // config_kind() is Some for every arm matched here
                let kind = kind.config_kind().ok_or(DecodeError::InvalidMessageType(kind.as_u8()))?;
                Message::SetConfig { kind, update }
            }
        })
    }
}

impl Encode for Message {
    fn encode(&self, w: &mut Writer) {
        w.write_u8(self.message_type().as_u8());
        w.write_bytes(&self.encode_payload());
    }
}

impl Decode for Message {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let (kind, payload) = split_frame(r.read_bytes(r.remaining())?)?;
        Message::decode_payload(kind, payload)
    }
}

/// Split a frame into its message type and the remaining payload.
pub fn split_frame(frame: &[u8]) -> Result<(MessageType, &[u8]), DecodeError> {
    let (&type_byte, payload) = frame.split_first().ok_or(DecodeError::UnexpectedEof)?;
    let kind = MessageType::from_u8(type_byte).ok_or(DecodeError::InvalidMessageType(type_byte))?;
    Ok((kind, payload))
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec;

    use super::*;

    fn readings(pairs: &[(u16, u32)]) -> SensorReadings {
        pairs
            .iter()
            .map(|&(pulse_rate, last_pulse_age_ms)| SensorReading {
                pulse_rate,
                last_pulse_age_ms,
            })
            .collect()
    }

    #[test]
    fn test_data_response_layout() {
        let msg = Message::DataResponse(readings(&[(120, 500), (0, 999_999)]));
        let frame = msg.encode_to_vec();
        assert_eq!(
            frame,
            vec![
                0x91, 2, // type, count
                120, 0, 0, 0, // rates
                0xF4, 0x01, 0, 0, 0x3F, 0x42, 0x0F, 0, // ages
            ]
        );
        assert_eq!(Message::decode_from_slice(&frame), Ok(msg));
    }

    #[test]
    fn test_declared_count_exceeds_payload() {
        // Claims 2 sensors but only carries one rate.
        let payload = [2u8, 120, 0];
        assert_eq!(
            Message::decode_payload(MessageType::DataResponse, &payload),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_count_above_sensor_limit() {
        let mut payload = vec![10u8];
        payload.resize(1 + 10 * READING_WIRE_SIZE, 0);
        assert_eq!(
            Message::decode_payload(MessageType::DataResponse, &payload),
            Err(DecodeError::CapacityExceeded(10))
        );
        assert_eq!(
            DecodeError::CapacityExceeded(10).to_string(),
            "declared 10 sensors, limit is 9"
        );
    }

    #[test]
    fn test_empty_data_response() {
        assert_eq!(
            Message::decode_payload(MessageType::DataResponse, &[0]),
            Ok(Message::DataResponse(SensorReadings::new()))
        );
        assert_eq!(
            Message::decode_payload(MessageType::DataResponse, &[]),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert_eq!(
            Message::decode_payload(MessageType::DataResponse, &[0, 7]),
            Err(DecodeError::InvalidLength)
        );
    }

    #[test]
    fn test_set_config_layout() {
        let mut mask = SelectionMask::EMPTY;
        mask.set(1);
        mask.set(8);
        let msg = Message::SetConfig {
            kind: ConfigKind::Debounce,
            update: ConfigUpdate { value: 300, mask },
        };
        let frame = msg.encode_to_vec();
        assert_eq!(frame, vec![0x13, 0x2C, 0x01, 0, 1, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(Message::decode_from_slice(&frame), Ok(msg));
    }

    #[test]
    fn test_set_config_accepts_any_nonzero_flag() {
        let frame = [0x12, 0xC4, 0x09, 0, 0, 0xFF, 0, 0, 0, 0, 0, 2];
        let Ok(Message::SetConfig { kind, update }) = Message::decode_from_slice(&frame) else {
            panic!("expected config update");
        };
        assert_eq!(kind, ConfigKind::Window);
        assert_eq!(update.value, 2500);
        assert_eq!(update.mask.iter().collect::<Vec<_>>(), [2, 8]);
    }

    #[test]
    fn test_pairing_frames() {
        assert_eq!(Message::PairRequest.encode_to_vec(), vec![0x10, 0x10]);
        assert_eq!(Message::decode_from_slice(&[0x10]), Ok(Message::PairRequest));
        assert_eq!(
            Message::decode_from_slice(&[0x90]),
            Ok(Message::PairConfirm { success: true })
        );
        assert_eq!(
            Message::decode_from_slice(&[0x90, 0]),
            Ok(Message::PairConfirm { success: false })
        );
    }

    #[test]
    fn test_split_frame_errors() {
        assert_eq!(split_frame(&[]), Err(DecodeError::UnexpectedEof));
        assert_eq!(split_frame(&[0x42, 1]), Err(DecodeError::InvalidMessageType(0x42)));
        assert_eq!(split_frame(&[0x11]), Ok((MessageType::DataRequest, &[][..])));
    }
}
