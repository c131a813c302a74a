use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::stream_id::Direction;

/// Who decided to close a connection: the application on top of the engine, or the transport
///  itself (protocol violation, refusal, flow control etc.)
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorSource {
    Application,
    Transport,
}

/// The close code that is exchanged with the peer in a CONNECTION_CLOSE frame, or recorded
///  locally for closes that never hit the wire (`silent`).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct CloseCode {
    pub code: u64,
    pub source: ErrorSource,
    pub silent: bool,
}
impl CloseCode {
    pub fn application(code: u64) -> CloseCode {
        CloseCode {
            code,
            source: ErrorSource::Application,
            silent: false,
        }
    }

    pub fn transport(code: TransportErrorCode) -> CloseCode {
        CloseCode {
            code: code.into(),
            source: ErrorSource::Transport,
            silent: false,
        }
    }

    pub fn silent(code: TransportErrorCode) -> CloseCode {
        CloseCode {
            silent: true,
            ..Self::transport(code)
        }
    }

    pub fn is_transport(&self, code: TransportErrorCode) -> bool {
        self.source == ErrorSource::Transport && self.code == u64::from(code)
    }
}

#[repr(u64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum TransportErrorCode {
    NoError = 0x0,
    InternalError = 0x1,
    /// fixed code for refusing a connection before a session exists (busy, blocklisted, limits,
    ///  failing session handler)
    ConnectionRefused = 0x2,
    FlowControlError = 0x3,
    StreamLimitError = 0x4,
    StreamStateError = 0x5,
    FinalSizeError = 0x6,
    FrameEncodingError = 0x7,
    TransportParameterError = 0x8,
    ProtocolViolation = 0xa,
    ApplicationError = 0xc,
    CryptoError = 0x100,
}

/// Everything the public API reports back to callers.
///
/// The variants follow the error taxonomy of the engine:
/// * argument errors (`InvalidArgType`, `InvalidArgValue`, `OutOfRange`) are returned synchronously
///    before any state is touched
/// * sequencing errors (`Sequencing`, `ReaderReleased`) point to a local programming mistake and
///    are returned synchronously as well
/// * transport outcomes (`ConnectionClosed`, `ConnectionRefused`, `StatelessReset`, `IdleTimeout`,
///    `StreamReset`, ...) reach the application asynchronously through events and rejected futures
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum QuicError {
    #[error("invalid argument type for '{name}': expected {expected}")]
    InvalidArgType { name: String, expected: String },
    #[error("invalid value for '{name}': {reason}")]
    InvalidArgValue { name: String, reason: String },
    #[error("value {value} of '{name}' is out of range {range}")]
    OutOfRange { name: String, value: String, range: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("stream limit reached for {0:?} streams")]
    StreamLimit(Direction),
    #[error("{0}")]
    Sequencing(String),
    #[error("the reader was released")]
    ReaderReleased,
    #[error("stream was reset with code {0}")]
    StreamReset(u64),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("connection closed with code {0:?}")]
    ConnectionClosed(CloseCode),
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed by stateless reset")]
    StatelessReset,
    #[error("connection closed after idle timeout")]
    IdleTimeout,
    #[error("the session was closed before the handshake completed")]
    HandshakeCanceled,
    #[error("application handler failed: {0}")]
    Handler(String),
}

impl QuicError {
    pub(crate) fn arg_type(name: &str, expected: &str) -> QuicError {
        QuicError::InvalidArgType {
            name: name.to_string(),
            expected: expected.to_string(),
        }
    }

    pub(crate) fn arg_value(name: &str, reason: impl Into<String>) -> QuicError {
        QuicError::InvalidArgValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn out_of_range(name: &str, value: impl ToString, range: &str) -> QuicError {
        QuicError::OutOfRange {
            name: name.to_string(),
            value: value.to_string(),
            range: range.to_string(),
        }
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> QuicError {
        QuicError::InvalidState(msg.into())
    }

    pub(crate) fn sequencing(msg: impl Into<String>) -> QuicError {
        QuicError::Sequencing(msg.into())
    }
}
