use std::io;
use thiserror::Error;

use crate::device::SessionState;

/// The primary error type for the `amiitag` library.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid tag image size: {0} bytes (expected 532, 540 or 572)")]
    InvalidSize(usize),

    #[error("Invalid UID {0}: check bytes do not match")]
    InvalidUid(String),

    #[error("Invalid payload length: {0} bytes")]
    InvalidPayload(usize),

    #[error("Pages {first}..{} lie outside the 143-page image", first + count)]
    InvalidPageRange { first: usize, count: usize },

    #[error("Invalid figure id: {0}")]
    InvalidFigureId(String),

    #[error("Name is too long ({0} bytes, at most 20)")]
    NameTooLong(usize),

    #[error("Master keys are missing")]
    KeyMissing,

    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    #[error("Key file digest mismatch: expected {expected}, got {actual}")]
    KeyDigestMismatch { expected: String, actual: String },

    #[error("Decryption failed: {0} signature does not verify")]
    DecryptionFailure(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected response to {opcode:#04x}: {response}")]
    UnexpectedResponse { opcode: u8, response: String },

    #[error("Device rejected {opcode:#04x} with status {status}")]
    DeviceRejected { opcode: u8, status: u8 },

    #[error("Device does not support {0}")]
    Unsupported(&'static str),

    #[error("Timeout waiting for device: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Session is not ready (state: {0})")]
    NotReady(SessionState),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Coarse classification a host can use to pick the right user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input file or tag is invalid.
    Format,
    /// Keys are missing or the payload does not authenticate.
    Crypto,
    /// The device answered with something unexpected.
    Protocol,
    /// The device did not answer in time.
    Timeout,
    /// The transport failed; the session needs a reconnect.
    Channel,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSize(_)
            | Error::InvalidUid(_)
            | Error::InvalidPayload(_)
            | Error::InvalidPageRange { .. }
            | Error::InvalidFigureId(_)
            | Error::NameTooLong(_) => ErrorKind::Format,
            Error::KeyMissing
            | Error::InvalidKeyFile(_)
            | Error::KeyDigestMismatch { .. }
            | Error::DecryptionFailure(_) => ErrorKind::Crypto,
            Error::Protocol(_)
            | Error::UnexpectedResponse { .. }
            | Error::DeviceRejected { .. }
            | Error::Unsupported(_) => ErrorKind::Protocol,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Channel(_) | Error::NotReady(_) => ErrorKind::Channel,
            Error::Io(_) | Error::Json(_) | Error::Hex(_) => ErrorKind::Io,
        }
    }

    /// Whether the session must be torn down and reconnected after this error.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Channel(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
