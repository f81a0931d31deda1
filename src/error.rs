use serde::Serialize;
use thiserror::Error;

/// Errors raised while reading or writing frames on a session
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed after {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },

    #[error("no frame received within {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),

    #[error("session is closed")]
    Closed,

    #[error("expected {expected} packet, got {got}")]
    UnexpectedPacket {
        expected: &'static str,
        got: &'static str,
    },
}

/// A violation of the source-level sandbox
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Cannot import {0}: forbidden")]
    ForbiddenImport(String),

    #[error("Cannot import {0}: forbidden for this module...")]
    ForbiddenForModule(String),

    #[error("Cannot import {module}: {name} forbidden")]
    ForbiddenName { module: String, name: String },

    #[error("Cannot import {0}: * forbidden")]
    StarImport(String),

    #[error("Cannot import {0}: specify imports...")]
    NamedImportRequired(String),
}

impl SandboxError {
    /// Text shown in a driver result, prefixed the way the harness prints it
    pub fn report(&self) -> String {
        format!("SandboxError: {self}")
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Frame {
    pub index: usize,
    pub context: String,
}

/// Structured description of a failed request, sent with the `EXCEPTION` result code
#[derive(Debug, Serialize, PartialEq)]
pub struct Traceback {
    pub class: String,
    pub msg: String,
    pub tb: Vec<Frame>,
}

impl Traceback {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let root = err.root_cause();
        let class = if root.downcast_ref::<ProtocolError>().is_some() {
            "ProtocolError"
        } else if root.downcast_ref::<SandboxError>().is_some() {
            "SandboxError"
        } else if root.downcast_ref::<std::io::Error>().is_some() {
            "IoError"
        } else if root.downcast_ref::<serde_json::Error>().is_some() {
            "JsonError"
        } else {
            "Error"
        };

        Self {
            class: class.to_string(),
            msg: root.to_string(),
            tb: err
                .chain()
                .enumerate()
                .map(|(index, cause)| Frame {
                    index,
                    context: cause.to_string(),
                })
                .collect(),
        }
    }
}
