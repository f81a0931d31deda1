use serde::Serialize;
use serde_json::Value;

use crate::error::ProtocolError;

/// Size of the fixed frame header: packet type, payload size, payload type
pub const HEADER_SIZE: usize = 12;

/// Largest payload a peer may announce
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    None,
    Init,
    Debug,
    Data,
}

impl PacketType {
    pub fn code(self) -> i32 {
        match self {
            Self::None => -1,
            Self::Init => 1,
            Self::Debug => 2,
            Self::Data => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::None),
            1 => Some(Self::Init),
            2 => Some(Self::Debug),
            3 => Some(Self::Data),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Init => "INIT",
            Self::Debug => "DEBUG",
            Self::Data => "DATA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Plain,
    Binary,
    Json,
}

impl PayloadType {
    pub fn code(self) -> i32 {
        match self {
            Self::Plain => 0,
            Self::Binary => 1,
            Self::Json => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Plain),
            1 => Some(Self::Binary),
            2 => Some(Self::Json),
            _ => None,
        }
    }
}

/// Packet payload; the variant decides the payload type written to the header
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Plain(String),
    Binary(Vec<u8>),
    Json(Value),
}

impl Payload {
    /// Serialize any value as a JSON payload
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::Plain(_) => PayloadType::Plain,
            Self::Binary(_) => PayloadType::Binary,
            Self::Json(_) => PayloadType::Json,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Plain(text) => text.as_bytes().to_vec(),
            Self::Binary(bytes) => bytes.clone(),
            Self::Json(value) => value.to_string().into_bytes(),
        }
    }

    /// Inverse of [`Payload::to_bytes`]
    pub fn decode(payload_type: PayloadType, bytes: Vec<u8>) -> Result<Self, ProtocolError> {
        match payload_type {
            PayloadType::Binary => Ok(Self::Binary(bytes)),
            PayloadType::Plain => String::from_utf8(bytes)
                .map(Self::Plain)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
            PayloadType::Json => serde_json::from_slice(&bytes)
                .map(Self::Json)
                .map_err(|e| ProtocolError::InvalidPayload(e.to_string())),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Plain(text) => Some(text),
            Self::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    /// Text form of any payload, used for opaque tokens such as settings versions
    pub fn to_text_lossy(&self) -> String {
        match self {
            Self::Plain(text) => text.clone(),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Json(Value::String(text)) => text.clone(),
            Self::Json(value) => value.to_string(),
        }
    }

    /// JSON view of the payload; plain text becomes a JSON string
    pub fn into_json(self) -> Result<Value, ProtocolError> {
        match self {
            Self::Json(value) => Ok(value),
            Self::Plain(text) => Ok(Value::String(text)),
            Self::Binary(_) => Err(ProtocolError::InvalidPayload(
                "expected JSON payload, got binary".to_string(),
            )),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Plain(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub size: usize,
    pub payload_type: PayloadType,
}

impl Header {
    /// Fails when `size` exceeds [`MAX_PAYLOAD_SIZE`]
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        if self.size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::TooLarge(self.size));
        }
        let size = i32::try_from(self.size).map_err(|_| ProtocolError::TooLarge(self.size))?;

        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.packet_type.code().to_le_bytes());
        out[4..8].copy_from_slice(&size.to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_type.code().to_le_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let field = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let (packet_code, size, payload_code) = (field(0), field(4), field(8));

        let packet_type = PacketType::from_code(packet_code)
            .ok_or_else(|| ProtocolError::InvalidHeader(format!("packet type {packet_code}")))?;
        let payload_type = PayloadType::from_code(payload_code)
            .ok_or_else(|| ProtocolError::InvalidHeader(format!("payload type {payload_code}")))?;
        let size = usize::try_from(size)
            .map_err(|_| ProtocolError::InvalidHeader(format!("negative size {size}")))?;
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::InvalidHeader(format!("payload of {size} bytes")));
        }

        Ok(Self {
            packet_type,
            size,
            payload_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Payload,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Payload>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// The packet handed out when nothing (more) can be received
    pub fn none() -> Self {
        Self::new(PacketType::None, "")
    }

    pub fn is_none(&self) -> bool {
        self.packet_type == PacketType::None
    }

    /// Header followed by the payload bytes
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.payload.to_bytes();
        let header = Header {
            packet_type: self.packet_type,
            size: payload.len(),
            payload_type: self.payload.payload_type(),
        }
        .encode()?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one complete frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let header_bytes: &[u8; HEADER_SIZE] = frame
            .get(..HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(ProtocolError::ShortRead {
                received: frame.len(),
                expected: HEADER_SIZE,
            })?;
        let header = Header::decode(header_bytes)?;

        let body = &frame[HEADER_SIZE..];
        if body.len() < header.size {
            return Err(ProtocolError::ShortRead {
                received: body.len(),
                expected: header.size,
            });
        }

        Ok(Self {
            packet_type: header.packet_type,
            payload: Payload::decode(header.payload_type, body[..header.size].to_vec())?,
        })
    }
}
