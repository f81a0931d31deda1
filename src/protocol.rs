mod packet;
mod session;

pub use packet::{HEADER_SIZE, Header, MAX_PAYLOAD_SIZE, Packet, PacketType, Payload, PayloadType};
pub use session::{DEFAULT_IO_TIMEOUT, Session};

use serde_json::{Value, json};

/// Port the container-side orchestrator listens on
pub const DEFAULT_PORT: u16 = 1700;

/// Payload of the server's `INIT` asking the client for its settings blob
pub const REQUEST_SETTINGS: &str = "init";

/// Payload of the server's `INIT` asking the client for the execution request
pub const REQUEST_DATA: &str = "data";

/// Result code of the final `DATA` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    TooManyConnections,
    ListenerTimeout,
    ExecutionTimeout,
    Exception,
}

impl ResultCode {
    pub fn code(self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::TooManyConnections => 1,
            Self::ListenerTimeout => 2,
            Self::ExecutionTimeout => 3,
            Self::Exception => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Ok),
            1 => Some(Self::TooManyConnections),
            2 => Some(Self::ListenerTimeout),
            3 => Some(Self::ExecutionTimeout),
            4 => Some(Self::Exception),
            _ => None,
        }
    }
}

/// `{res, data}` body of the final `DATA` packet
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub code: ResultCode,
    pub data: Value,
}

impl ExecutionResult {
    pub fn new(code: ResultCode, data: Value) -> Self {
        Self { code, data }
    }

    pub fn status(code: ResultCode) -> Self {
        Self::new(code, Value::Null)
    }

    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::Data,
            json!({ "res": self.code.code(), "data": self.data }),
        )
    }
}
