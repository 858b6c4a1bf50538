//! Error types for WebSocket negotiation

use std::fmt;
use std::io;

use http::StatusCode;

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Negotiation error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket
    Io(io::Error),
    /// Invalid HTTP request
    InvalidHttp(&'static str),
    /// Upgrade request is well-formed HTTP but not a valid WebSocket upgrade
    HandshakeFailed(&'static str),
    /// Connection closed before the handshake completed
    ConnectionClosed,
    /// Handshake did not complete within the configured timeout
    Timeout,
    /// Header name or value cannot be used in a response
    InvalidHeader(String),
    /// Rejection status outside 300..=599
    InvalidStatus(u16),
    /// Negotiator broke the negotiation contract
    NegotiationState(&'static str),
    /// Negotiator failed for a reason other than a deliberate rejection
    NegotiationFailed(String),
    /// Extension offer could not be turned into an extension instance
    Extension(String),
    /// Invalid configuration value
    Config(&'static str),
}

impl Error {
    /// Wrap any error raised by negotiation policy code
    pub fn negotiation_failed(err: impl fmt::Display) -> Self {
        Error::NegotiationFailed(err.to_string())
    }

    /// Status code the transport answers with when this error aborts a handshake
    ///
    /// `None` means the peer is gone or the socket is unusable, so no
    /// response is written at all.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Error::Io(_) | Error::ConnectionClosed => None,
            Error::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
            Error::InvalidHttp(_) | Error::HandshakeFailed(_) => Some(StatusCode::BAD_REQUEST),
            Error::InvalidHeader(_)
            | Error::InvalidStatus(_)
            | Error::NegotiationState(_)
            | Error::NegotiationFailed(_)
            | Error::Extension(_)
            | Error::Config(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// True for errors that indicate a bug in a negotiator rather than bad input
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::NegotiationState(_) | Error::InvalidStatus(_) | Error::InvalidHeader(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Timeout => write!(f, "Handshake timed out"),
            Error::InvalidHeader(msg) => write!(f, "Invalid header: {}", msg),
            Error::InvalidStatus(code) => write!(f, "Invalid rejection status: {}", code),
            Error::NegotiationState(msg) => write!(f, "Negotiation state error: {}", msg),
            Error::NegotiationFailed(msg) => write!(f, "Negotiation failed: {}", msg),
            Error::Extension(msg) => write!(f, "Extension error: {}", msg),
            Error::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Error::InvalidHeader(e.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Error::InvalidHeader(e.to_string())
    }
}

/// A deliberate refusal to upgrade, carrying the status and reason to send
///
/// Only [`Negotiation::reject`](crate::negotiation::Negotiation::reject) can
/// create one, so a `Rejection` always corresponds to a rejected context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    status: StatusCode,
    reason: String,
}

impl Rejection {
    pub(crate) fn new(status: StatusCode, reason: String) -> Self {
        Self { status, reason }
    }

    /// Status code of the error response
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase of the error response
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.reason)
    }
}
