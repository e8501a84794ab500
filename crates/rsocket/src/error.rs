//! Error types for the RSocket runtime.
//!
//! Errors come in two layers. [`ProtocolError`] is the taxonomy carried by
//! ERROR frames, split between connection scope (stream id 0) and stream
//! scope. [`Error`] is the crate-wide error returned by every public entry
//! point and wraps the protocol taxonomy together with local failures.

use crate::protocol::{Frame, FrameBody, Setup, StreamId};

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for RSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message used when the first frame is not addressed to stream 0.
pub const ERROR_INVALID_STREAM: &str = "SETUP or RESUME is not a frame with stream id of 0";

/// Message used when the first frame is neither SETUP nor RESUME.
pub const ERROR_INVALID_FIRST_FRAME: &str = "first frame must be setup or resume";

/// Message used when the peer attempts to resume a session.
pub const ERROR_UNSUPPORTED_RESUME: &str = "unsupported resume yet";

/// Protocol error code carried by ERROR frames.
///
/// The code space is open: values outside the named constants are
/// representable and map to [`ProtocolError::IllegalArgument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// The SETUP frame is invalid for the server.
    pub const INVALID_SETUP: Self = Self(0x0000_0001);
    /// Some (or all) of the SETUP parameters are not supported.
    pub const UNSUPPORTED_SETUP: Self = Self(0x0000_0002);
    /// The server rejected the SETUP.
    pub const REJECTED_SETUP: Self = Self(0x0000_0003);
    /// The server rejected the RESUME.
    pub const REJECTED_RESUME: Self = Self(0x0000_0004);
    /// The connection is being terminated.
    pub const CONNECTION_ERROR: Self = Self(0x0000_0101);
    /// The connection is being closed gracefully.
    pub const CONNECTION_CLOSE: Self = Self(0x0000_0102);
    /// Application layer logic generated an error.
    pub const APPLICATION_ERROR: Self = Self(0x0000_0201);
    /// The responder rejected the request.
    pub const REJECTED: Self = Self(0x0000_0202);
    /// The responder canceled the request.
    pub const CANCELED: Self = Self(0x0000_0203);
    /// The request is invalid.
    pub const INVALID: Self = Self(0x0000_0204);

    /// Returns the protocol name of a well-known code.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self {
            Self::INVALID_SETUP => Some("INVALID_SETUP"),
            Self::UNSUPPORTED_SETUP => Some("UNSUPPORTED_SETUP"),
            Self::REJECTED_SETUP => Some("REJECTED_SETUP"),
            Self::REJECTED_RESUME => Some("REJECTED_RESUME"),
            Self::CONNECTION_ERROR => Some("CONNECTION_ERROR"),
            Self::CONNECTION_CLOSE => Some("CONNECTION_CLOSE"),
            Self::APPLICATION_ERROR => Some("APPLICATION_ERROR"),
            Self::REJECTED => Some("REJECTED"),
            Self::CANCELED => Some("CANCELED"),
            Self::INVALID => Some("INVALID"),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

/// Whether an error terminates the whole connection or a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Stream id 0; fatal to the connection.
    Connection,
    /// Non-zero stream id; ends one logical exchange.
    Stream,
}

impl ErrorScope {
    /// Scope of an error frame addressed to `stream_id`.
    #[must_use]
    pub const fn of(stream_id: StreamId) -> Self {
        if stream_id == 0 {
            Self::Connection
        } else {
            Self::Stream
        }
    }
}

/// Typed protocol errors, one variant per error code and scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The SETUP frame was invalid.
    #[error("Invalid setup: {0}")]
    InvalidSetup(String),

    /// The SETUP parameters are not supported.
    #[error("Unsupported setup: {0}")]
    UnsupportedSetup(String),

    /// The SETUP was rejected by the responder.
    #[error("Rejected setup: {0}")]
    RejectedSetup(String),

    /// The connection is being terminated.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// An error code was used outside of the scope it belongs to.
    #[error("Illegal argument: {message}")]
    IllegalArgument {
        /// Scope the offending frame was addressed to.
        scope: ErrorScope,
        /// The offending error code.
        code: ErrorCode,
        /// Diagnostic echoing the stream id and original message.
        message: String,
    },

    /// Application handler failure.
    #[error("Application error: {0}")]
    Application(String),

    /// The request was rejected by the responder.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The request was canceled.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// The request was invalid.
    #[error("Invalid: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Maps an error code received on `stream_id` to its typed error.
    ///
    /// The mapping is total: codes that do not belong to the scope implied by
    /// the stream id become [`ProtocolError::IllegalArgument`].
    pub fn from_code(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match (ErrorScope::of(stream_id), code) {
            (ErrorScope::Connection, ErrorCode::INVALID_SETUP) => Self::InvalidSetup(message),
            (ErrorScope::Connection, ErrorCode::UNSUPPORTED_SETUP) => {
                Self::UnsupportedSetup(message)
            }
            (ErrorScope::Connection, ErrorCode::REJECTED_SETUP) => Self::RejectedSetup(message),
            (ErrorScope::Connection, ErrorCode::CONNECTION_ERROR) => {
                Self::ConnectionError(message)
            }
            (ErrorScope::Stream, ErrorCode::APPLICATION_ERROR) => Self::Application(message),
            (ErrorScope::Stream, ErrorCode::REJECTED) => Self::Rejected(message),
            (ErrorScope::Stream, ErrorCode::CANCELED) => Self::Canceled(message),
            (ErrorScope::Stream, ErrorCode::INVALID) => Self::Invalid(message),
            (scope, code) => Self::IllegalArgument {
                scope,
                code,
                message: format!("Invalid Error frame in Stream ID {stream_id}: {code}, '{message}'"),
            },
        }
    }

    /// The error code this error was built from.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSetup(_) => ErrorCode::INVALID_SETUP,
            Self::UnsupportedSetup(_) => ErrorCode::UNSUPPORTED_SETUP,
            Self::RejectedSetup(_) => ErrorCode::REJECTED_SETUP,
            Self::ConnectionError(_) => ErrorCode::CONNECTION_ERROR,
            Self::IllegalArgument { code, .. } => *code,
            Self::Application(_) => ErrorCode::APPLICATION_ERROR,
            Self::Rejected(_) => ErrorCode::REJECTED,
            Self::Canceled(_) => ErrorCode::CANCELED,
            Self::Invalid(_) => ErrorCode::INVALID,
        }
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidSetup(message)
            | Self::UnsupportedSetup(message)
            | Self::RejectedSetup(message)
            | Self::ConnectionError(message)
            | Self::IllegalArgument { message, .. }
            | Self::Application(message)
            | Self::Rejected(message)
            | Self::Canceled(message)
            | Self::Invalid(message) => message,
        }
    }

    /// Whether this error terminates the connection or a single stream.
    #[must_use]
    pub const fn scope(&self) -> ErrorScope {
        match self {
            Self::InvalidSetup(_)
            | Self::UnsupportedSetup(_)
            | Self::RejectedSetup(_)
            | Self::ConnectionError(_) => ErrorScope::Connection,
            Self::IllegalArgument { scope, .. } => *scope,
            Self::Application(_) | Self::Rejected(_) | Self::Canceled(_) | Self::Invalid(_) => {
                ErrorScope::Stream
            }
        }
    }

    /// Builds the ERROR frame announcing this error on stream 0.
    ///
    /// Stream-scope errors cannot be sent on stream 0 and are reported as
    /// `CONNECTION_ERROR`.
    #[must_use]
    pub fn to_connection_frame(&self) -> Frame {
        let code = match self {
            Self::IllegalArgument { .. } => ErrorCode::CONNECTION_ERROR,
            other if other.scope() == ErrorScope::Connection => other.code(),
            _ => ErrorCode::CONNECTION_ERROR,
        };
        Frame::error(0, code, self.message())
    }
}

/// Checks the first frame received on a freshly accepted connection.
///
/// Returns the SETUP parameters when the frame opens the connection
/// correctly.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidSetup`] when the frame is not a SETUP on
/// stream 0 and [`ProtocolError::UnsupportedSetup`] for resumption, leasing
/// or an unknown major version.
pub fn verify_first_frame(frame: &Frame) -> std::result::Result<&Setup, ProtocolError> {
    if frame.stream_id != 0 {
        return Err(ProtocolError::InvalidSetup(ERROR_INVALID_STREAM.to_string()));
    }

    let setup = match &frame.body {
        FrameBody::Setup(setup) => setup,
        FrameBody::Resume(_) => {
            return Err(ProtocolError::UnsupportedSetup(
                ERROR_UNSUPPORTED_RESUME.to_string(),
            ));
        }
        _ => {
            return Err(ProtocolError::InvalidSetup(
                ERROR_INVALID_FIRST_FRAME.to_string(),
            ));
        }
    };

    if setup.resume_token.is_some() {
        return Err(ProtocolError::UnsupportedSetup(
            ERROR_UNSUPPORTED_RESUME.to_string(),
        ));
    }
    if setup.lease {
        return Err(ProtocolError::UnsupportedSetup(
            "leasing is not supported".to_string(),
        ));
    }
    if setup.major_version != Setup::MAJOR_VERSION {
        return Err(ProtocolError::UnsupportedSetup(format!(
            "unsupported protocol version {}.{}",
            setup.major_version, setup.minor_version
        )));
    }
    if setup.keepalive_interval.is_zero() || setup.max_lifetime.is_zero() {
        return Err(ProtocolError::InvalidSetup(
            "keepalive interval and max lifetime must be greater than zero".to_string(),
        ));
    }

    Ok(setup)
}

/// Main error type for RSocket operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Error received from, or reported to, the peer.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Frame encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Local handler failure.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The connection was closed before the operation finished.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation is not valid in the current stream state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Shorthand for an application error.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Application(message.into()))
    }

    /// Shorthand for a rejected request.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::Rejected(message.into()))
    }

    /// Returns the protocol error if this is one.
    #[must_use]
    pub const fn as_protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Protocol(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if this is a cancellation, local or remote.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Canceled(_)))
    }

    /// The code and message sent in an ERROR frame on a non-zero stream.
    ///
    /// Stream-scope protocol errors keep their code. Anything else is an
    /// `APPLICATION_ERROR` carrying the error text.
    #[must_use]
    pub fn to_wire(&self) -> (ErrorCode, String) {
        match self {
            Self::Protocol(ProtocolError::IllegalArgument {
                scope: ErrorScope::Stream,
                message,
                ..
            }) => (ErrorCode::INVALID, message.clone()),
            Self::Protocol(err) if err.scope() == ErrorScope::Stream => {
                (err.code(), err.message().to_string())
            }
            Self::Protocol(err) => (ErrorCode::APPLICATION_ERROR, err.message().to_string()),
            Self::Handler(HandlerError::Internal(message)) => {
                (ErrorCode::APPLICATION_ERROR, message.clone())
            }
            other => (ErrorCode::APPLICATION_ERROR, other.to_string()),
        }
    }
}

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame is malformed.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The frame type is unknown or not supported.
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),
}

/// Handler errors from local request processing.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Handler returned an error.
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    /// Wraps any displayable failure as an internal handler error.
    pub fn internal(err: impl fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// Builds a [`HandlerError::Panicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(panic: &(dyn std::any::Any + Send)) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked(message)
    }
}
