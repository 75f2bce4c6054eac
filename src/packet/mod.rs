//! The CoAP message model and wire codec (RFC 7252 section 3).
//!
//! [`Packet`] is the canonical in-memory form of one datagram.  Encoding and
//! decoding are pure: bytes in, message out, no connection state involved.

pub use block::BlockValue;
pub use code::{MessageClass, MessageType, RequestType, ResponseType};
pub use option::{CoapOption, ObserveOption, PacketOption};

use thiserror::Error;

mod block;
mod code;
mod option;

pub(crate) use option::encode_uint;

/// Errors raised while encoding, decoding or constructing messages.  On the
/// inbound path these are logged and the datagram dropped; they never tear
/// down a connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("packet length {0} is invalid")]
    InvalidPacketLength(usize),

    #[error("unknown protocol version {0}")]
    InvalidVersion(u8),

    #[error("token length {0} exceeds 8 bytes")]
    InvalidTokenLength(u8),

    #[error("Empty message carries a token, options or payload")]
    InvalidEmptyMessage,

    #[error("option delta/length nibble 15 is reserved")]
    ReservedOptionNibble,

    #[error("option value of {0} bytes cannot be encoded")]
    InvalidOptionLength(usize),

    #[error("option number {0} is out of range")]
    OptionNumberOutOfRange(u32),

    #[error("payload marker not followed by a payload")]
    MissingPayload,

    #[error("Uri-Host must be 1..=255 bytes")]
    InvalidUriHost,

    #[error("invalid Uri-Path/Uri-Query segment {0:?}")]
    InvalidUriSegment(String),

    #[error("block number {0} exceeds 20 bits")]
    InvalidBlockNumber(u32),

    #[error("block size exponent {0} is reserved")]
    ReservedBlockSize(u8),
}

/// One CoAP message.  The token is held as a `u64`; its wire form is the
/// big-endian bytes with leading zeros stripped (0..=8 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    mtype: MessageType,
    pub code: MessageClass,
    pub message_id: u16,
    token: u64,
    options: Vec<PacketOption>,
    pub payload: Vec<u8>,
}

impl Default for Packet {
    fn default() -> Packet {
        Packet::new()
    }
}

impl Packet {
    pub fn new() -> Packet {
        Packet {
            mtype: MessageType::Confirmable,
            code: MessageClass::Empty,
            message_id: 0,
            token: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Empty ACK for the given message id (RFC 7252 section 4.2).
    pub(crate) fn ack(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.set_type(MessageType::Acknowledgement);
        packet.message_id = message_id;
        packet
    }

    /// RST quenching an unexpected message (RFC 7252 section 4.3).
    pub(crate) fn reset(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.set_type(MessageType::Reset);
        packet.message_id = message_id;
        packet
    }

    /// Empty CON used as a keepalive ping (RFC 7252 section 4.3).
    pub(crate) fn ping(message_id: u16) -> Packet {
        let mut packet = Packet::new();
        packet.set_type(MessageType::Confirmable);
        packet.message_id = message_id;
        packet
    }

    pub fn get_type(&self) -> MessageType {
        self.mtype
    }

    pub fn set_type(&mut self, mtype: MessageType) {
        self.mtype = mtype;
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn set_token(&mut self, token: u64) {
        self.token = token;
    }

    pub fn options(&self) -> &[PacketOption] {
        &self.options
    }

    /// Append an option instance, keeping the set ordered by number.  Repeats
    /// of the same number are kept in insertion order.
    pub fn add_option<N: Into<u16>>(&mut self, number: N, value: Vec<u8>) {
        let number = number.into();
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, PacketOption { number, value });
    }

    /// Replace every instance of the given option number with one value.
    pub fn set_option<N: Into<u16>>(&mut self, number: N, value: Vec<u8>) {
        let number = number.into();
        self.clear_option(number);
        self.add_option(number, value);
    }

    pub fn clear_option<N: Into<u16>>(&mut self, number: N) {
        let number = number.into();
        self.options.retain(|o| o.number != number);
    }

    /// First value of the given option number, if present.
    pub fn get_option<N: Into<u16>>(&self, number: N) -> Option<&[u8]> {
        let number = number.into();
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// All values of the given option number, in wire order.
    pub fn get_options<N: Into<u16>>(&self, number: N) -> impl Iterator<Item = &[u8]> {
        let number = number.into();
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// Serialize to the RFC 7252 wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        if self.code.is_empty() {
            if self.token != 0 || !self.options.is_empty() || !self.payload.is_empty() {
                return Err(MessageError::InvalidEmptyMessage);
            }
            let mut buf = Vec::with_capacity(4);
            buf.push((1 << 6) | (self.mtype.to_u8() << 4));
            buf.push(0);
            buf.extend_from_slice(&self.message_id.to_be_bytes());
            return Ok(buf);
        }

        let token_bytes = encode_uint(self.token);
        let mut buf = Vec::with_capacity(4 + token_bytes.len() + 16 + self.payload.len());
        buf.push((1 << 6) | (self.mtype.to_u8() << 4) | token_bytes.len() as u8);
        buf.push(self.code.to_u8());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&token_bytes);

        let mut last_number = 0u16;
        for option in &self.options {
            // add_option keeps the set sorted, so the delta never underflows
            let delta = u32::from(option.number - last_number);
            let length = option.value.len();
            if length > 65804 {
                return Err(MessageError::InvalidOptionLength(length));
            }
            let (delta_nibble, delta_ext) = ext_parts(delta);
            let (length_nibble, length_ext) = ext_parts(length as u32);
            buf.push((delta_nibble << 4) | length_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&length_ext);
            buf.extend_from_slice(&option.value);
            last_number = option.number;
        }

        if !self.payload.is_empty() {
            buf.push(0xFF);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }

    /// Parse one datagram.
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, MessageError> {
        if buf.len() < 4 {
            return Err(MessageError::InvalidPacketLength(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != 1 {
            return Err(MessageError::InvalidVersion(version));
        }
        let mtype = MessageType::from_u8(buf[0] >> 4);
        let token_length = (buf[0] & 0x0F) as usize;
        if token_length > 8 {
            return Err(MessageError::InvalidTokenLength(token_length as u8));
        }
        let code = MessageClass::from_u8(buf[1]);
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        if code.is_empty() && (buf.len() != 4 || token_length != 0) {
            return Err(MessageError::InvalidEmptyMessage);
        }
        if buf.len() < 4 + token_length {
            return Err(MessageError::InvalidPacketLength(buf.len()));
        }
        let token = buf[4..4 + token_length]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

        let mut offset = 4 + token_length;
        let mut options = Vec::new();
        let mut payload = Vec::new();
        let mut last_number = 0u32;
        while offset < buf.len() {
            if buf[offset] == 0xFF {
                offset += 1;
                if offset == buf.len() {
                    return Err(MessageError::MissingPayload);
                }
                payload = buf[offset..].to_vec();
                break;
            }
            let header = buf[offset];
            offset += 1;
            let delta = read_ext(header >> 4, buf, &mut offset)?;
            let length = read_ext(header & 0x0F, buf, &mut offset)? as usize;
            let number = last_number + delta;
            if number > u32::from(u16::MAX) {
                return Err(MessageError::OptionNumberOutOfRange(number));
            }
            last_number = number;
            let end = offset
                .checked_add(length)
                .filter(|&end| end <= buf.len())
                .ok_or(MessageError::InvalidPacketLength(buf.len()))?;
            options.push(PacketOption {
                number: number as u16,
                value: buf[offset..end].to_vec(),
            });
            offset = end;
        }

        Ok(Packet {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

/// Split a delta or length into its 4-bit nibble and extension bytes per
/// RFC 7252 section 3.1.  Callers bound `value` to at most 65804.
fn ext_parts(value: u32) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, ((value - 269) as u16).to_be_bytes().to_vec()),
    }
}

fn read_ext(nibble: u8, buf: &[u8], offset: &mut usize) -> Result<u32, MessageError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let ext = *buf
                .get(*offset)
                .ok_or(MessageError::InvalidPacketLength(buf.len()))?;
            *offset += 1;
            Ok(u32::from(ext) + 13)
        }
        14 => {
            if buf.len() < *offset + 2 {
                return Err(MessageError::InvalidPacketLength(buf.len()));
            }
            let ext = u16::from_be_bytes([buf[*offset], buf[*offset + 1]]);
            *offset += 2;
            Ok(u32::from(ext) + 269)
        }
        _ => Err(MessageError::ReservedOptionNibble),
    }
}
