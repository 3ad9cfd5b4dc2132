//! Error types for the transport core.
//!
//! Three families are kept distinct end to end: local errors surfaced to the
//! application, transport errors carried in CONNECTION_CLOSE frames, and
//! opaque application error codes.

use thiserror::Error;

/// Errors surfaced to the local application through the API and callbacks.
///
/// These never appear on the wire.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalErrorCode {
    /// No error.
    #[error("no error")]
    NoError,

    /// Idle timeout expired.
    #[error("idle timeout")]
    IdleTimeout,

    /// Local endpoint is shutting down.
    #[error("shutting down")]
    ShuttingDown,

    /// Connection torn down by a stateless reset.
    #[error("connection reset")]
    ConnectionReset,

    /// Connection abandoned without close protocol.
    #[error("connection abandoned")]
    ConnectionAbandoned,

    /// Operation attempted after the connection left the open state.
    #[error("connection closed")]
    ConnectionClosed,

    /// Stream id does not name an existing stream.
    #[error("stream does not exist")]
    StreamNotExists,

    /// Stream exists but is closed for the requested direction.
    #[error("stream closed")]
    StreamClosed,

    /// Stream limit reached when creating a new stream.
    #[error("stream limit exceeded")]
    StreamLimitExceeded,

    /// Operation not valid for this stream or state.
    #[error("invalid operation")]
    InvalidOperation,

    /// Write callback argument rejected.
    #[error("invalid write callback")]
    InvalidWriteCallback,

    /// Write payload rejected (e.g. datagram buffer full).
    #[error("invalid write data")]
    InvalidWriteData,

    /// The same callback is already installed.
    #[error("callback already installed")]
    CallbackAlreadyInstalled,

    /// Generic application-level failure.
    #[error("application error")]
    AppError,

    /// Internal invariant violation.
    #[error("internal error")]
    InternalError,

    /// A transport-family error was mapped into the local API.
    #[error("transport error")]
    TransportError,

    /// Pacing was requested but no pacer is installed.
    #[error("pacer not available")]
    PacerNotAvailable,

    /// Peer did not advertise knob frame support.
    #[error("knob frames unsupported by peer")]
    KnobFrameUnsupported,

    /// Too many stream-group retransmission policies installed.
    #[error("retransmission policies limit exceeded")]
    RtxPoliciesLimitExceeded,
}

/// Transport error codes carried in CONNECTION_CLOSE frames
/// (RFC 9000 Section 20.1, plus the migration-failure code).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    /// No error (0x00).
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Connection refused (0x02).
    #[error("connection refused")]
    ConnectionRefused,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControlError,

    /// Stream limit error (0x04).
    #[error("stream limit error")]
    StreamLimitError,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamStateError,

    /// Final size error (0x06).
    #[error("final size error")]
    FinalSizeError,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncodingError,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameterError,

    /// Connection ID limit error (0x09).
    #[error("connection ID limit error")]
    ConnectionIdLimitError,

    /// Protocol violation (0x0A).
    #[error("protocol violation")]
    ProtocolViolation,

    /// Invalid token (0x0B).
    #[error("invalid token")]
    InvalidToken,

    /// Application error (0x0C).
    #[error("application error")]
    ApplicationError,

    /// Crypto buffer exceeded (0x0D).
    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    /// Key update error (0x0E).
    #[error("key update error")]
    KeyUpdateError,

    /// AEAD limit reached (0x0F).
    #[error("AEAD limit reached")]
    AeadLimitReached,

    /// No viable path (0x10).
    #[error("no viable path")]
    NoViablePath,

    /// Path validation to a migrated path failed (0x11).
    #[error("invalid migration")]
    InvalidMigration,

    /// Crypto error (0x0100-0x01FF).
    #[error("crypto error: {0:#x}")]
    Crypto(u16),
}

impl TransportErrorCode {
    /// Convert error to wire format error code.
    pub fn to_wire(self) -> u64 {
        match self {
            TransportErrorCode::NoError => 0x00,
            TransportErrorCode::InternalError => 0x01,
            TransportErrorCode::ConnectionRefused => 0x02,
            TransportErrorCode::FlowControlError => 0x03,
            TransportErrorCode::StreamLimitError => 0x04,
            TransportErrorCode::StreamStateError => 0x05,
            TransportErrorCode::FinalSizeError => 0x06,
            TransportErrorCode::FrameEncodingError => 0x07,
            TransportErrorCode::TransportParameterError => 0x08,
            TransportErrorCode::ConnectionIdLimitError => 0x09,
            TransportErrorCode::ProtocolViolation => 0x0A,
            TransportErrorCode::InvalidToken => 0x0B,
            TransportErrorCode::ApplicationError => 0x0C,
            TransportErrorCode::CryptoBufferExceeded => 0x0D,
            TransportErrorCode::KeyUpdateError => 0x0E,
            TransportErrorCode::AeadLimitReached => 0x0F,
            TransportErrorCode::NoViablePath => 0x10,
            TransportErrorCode::InvalidMigration => 0x11,
            TransportErrorCode::Crypto(code) => 0x0100 + (code as u64),
        }
    }

    /// Convert wire format error code to error.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportErrorCode::NoError,
            0x01 => TransportErrorCode::InternalError,
            0x02 => TransportErrorCode::ConnectionRefused,
            0x03 => TransportErrorCode::FlowControlError,
            0x04 => TransportErrorCode::StreamLimitError,
            0x05 => TransportErrorCode::StreamStateError,
            0x06 => TransportErrorCode::FinalSizeError,
            0x07 => TransportErrorCode::FrameEncodingError,
            0x08 => TransportErrorCode::TransportParameterError,
            0x09 => TransportErrorCode::ConnectionIdLimitError,
            0x0A => TransportErrorCode::ProtocolViolation,
            0x0B => TransportErrorCode::InvalidToken,
            0x0C => TransportErrorCode::ApplicationError,
            0x0D => TransportErrorCode::CryptoBufferExceeded,
            0x0E => TransportErrorCode::KeyUpdateError,
            0x0F => TransportErrorCode::AeadLimitReached,
            0x10 => TransportErrorCode::NoViablePath,
            0x11 => TransportErrorCode::InvalidMigration,
            0x0100..=0x01FF => TransportErrorCode::Crypto(((code - 0x0100) & 0xFF) as u16),
            _ => TransportErrorCode::InternalError,
        }
    }
}

/// Opaque application-defined error code, carried verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApplicationErrorCode(pub u64);

/// Substituted when the application closes without providing a code, so the
/// peer sees an application close rather than a transport close.
pub const GENERIC_APP_NO_ERROR: ApplicationErrorCode = ApplicationErrorCode(0);

/// One of the three error families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicErrorCode {
    Local(LocalErrorCode),
    Transport(TransportErrorCode),
    Application(ApplicationErrorCode),
}

impl QuicErrorCode {
    pub fn as_local(&self) -> Option<LocalErrorCode> {
        match self {
            QuicErrorCode::Local(code) => Some(*code),
            _ => None,
        }
    }

    pub fn as_transport(&self) -> Option<TransportErrorCode> {
        match self {
            QuicErrorCode::Transport(code) => Some(*code),
            _ => None,
        }
    }

    pub fn as_application(&self) -> Option<ApplicationErrorCode> {
        match self {
            QuicErrorCode::Application(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<LocalErrorCode> for QuicErrorCode {
    fn from(code: LocalErrorCode) -> Self {
        QuicErrorCode::Local(code)
    }
}

impl From<TransportErrorCode> for QuicErrorCode {
    fn from(code: TransportErrorCode) -> Self {
        QuicErrorCode::Transport(code)
    }
}

impl From<ApplicationErrorCode> for QuicErrorCode {
    fn from(code: ApplicationErrorCode) -> Self {
        QuicErrorCode::Application(code)
    }
}

/// A close reason: an error code plus a human-readable message.
///
/// The message handed to the local application may carry unsanitized detail;
/// only the sanitized code travels in close frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicError {
    pub code: QuicErrorCode,
    pub message: String,
}

impl QuicError {
    pub fn new(code: impl Into<QuicErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// An error carrying only a code, with the code's display as message.
    pub fn from_code(code: impl Into<QuicErrorCode>) -> Self {
        let code = code.into();
        let message = match code {
            QuicErrorCode::Local(c) => c.to_string(),
            QuicErrorCode::Transport(c) => c.to_string(),
            QuicErrorCode::Application(c) => format!("application error {:#x}", c.0),
        };
        Self { code, message }
    }

    /// Whether this close reason counts as a normal end of connection.
    ///
    /// Benign codes produce `on_connection_end`; everything else produces
    /// `on_connection_error`.
    pub fn is_benign(&self) -> bool {
        match self.code {
            QuicErrorCode::Local(code) => matches!(
                code,
                LocalErrorCode::NoError | LocalErrorCode::IdleTimeout | LocalErrorCode::ShuttingDown
            ),
            QuicErrorCode::Transport(code) => code == TransportErrorCode::NoError,
            QuicErrorCode::Application(code) => code == GENERIC_APP_NO_ERROR,
        }
    }
}

impl std::fmt::Display for QuicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Result alias for API operations that fail with a local error code.
pub type LocalResult<T> = Result<T, LocalErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_wire_format() {
        assert_eq!(TransportErrorCode::NoError.to_wire(), 0x00);
        assert_eq!(TransportErrorCode::ProtocolViolation.to_wire(), 0x0A);
        assert_eq!(TransportErrorCode::InvalidMigration.to_wire(), 0x11);

        let crypto_err = TransportErrorCode::Crypto(0x42);
        assert_eq!(crypto_err.to_wire(), 0x0142);

        assert_eq!(TransportErrorCode::from_wire(0x0A), TransportErrorCode::ProtocolViolation);
        assert_eq!(TransportErrorCode::from_wire(0x0142), TransportErrorCode::Crypto(0x42));
        assert_eq!(TransportErrorCode::from_wire(0x9999), TransportErrorCode::InternalError);
    }

    #[test]
    fn test_benign_classification() {
        assert!(QuicError::from_code(LocalErrorCode::NoError).is_benign());
        assert!(QuicError::from_code(LocalErrorCode::IdleTimeout).is_benign());
        assert!(QuicError::from_code(LocalErrorCode::ShuttingDown).is_benign());
        assert!(QuicError::from_code(TransportErrorCode::NoError).is_benign());
        assert!(QuicError::from_code(GENERIC_APP_NO_ERROR).is_benign());

        assert!(!QuicError::from_code(LocalErrorCode::ConnectionReset).is_benign());
        assert!(!QuicError::from_code(TransportErrorCode::ProtocolViolation).is_benign());
        assert!(!QuicError::from_code(ApplicationErrorCode(7)).is_benign());
    }

    #[test]
    fn test_error_family_accessors() {
        let err = QuicErrorCode::Local(LocalErrorCode::ConnectionReset);
        assert_eq!(err.as_local(), Some(LocalErrorCode::ConnectionReset));
        assert_eq!(err.as_transport(), None);
        assert_eq!(err.as_application(), None);
    }
}
