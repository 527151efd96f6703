//! Error taxonomy for the retrieval engine.
//!
//! Every failure a caller can observe ends up as a [`FetchError`] stamped
//! into the request's [`UrlStream`](crate::stream::UrlStream). Connection
//! scoped failures are cloned into each affected request, so the type only
//! carries rendered messages and never an `io::Error` directly.

use std::io;

/// Why a server was judged unable to handle pipelined requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenReason {
    /// A response status line repeated the previous pipeline test's line.
    DuplicateResponse,
    /// The connection closed before pipelining was exercised end to end.
    ClosedEarly,
    /// The response after a pipeline test was a 400.
    BadRequestAfterTest,
    /// Two pipeline tests on one connection got different answers.
    InconsistentTests,
}

impl BrokenReason {
    /// Stable diagnostic code reported in logs.
    pub fn code(&self) -> u8 {
        match self {
            BrokenReason::DuplicateResponse => 1,
            BrokenReason::ClosedEarly => 2,
            BrokenReason::BadRequestAfterTest => 3,
            BrokenReason::InconsistentTests => 4,
        }
    }
}

impl std::fmt::Display for BrokenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BrokenReason::DuplicateResponse => "duplicate response",
            BrokenReason::ClosedEarly => "closed before pipelining was exercised",
            BrokenReason::BadRequestAfterTest => "400 after pipeline test",
            BrokenReason::InconsistentTests => "inconsistent pipeline test responses",
        };
        write!(f, "{} (code {})", name, self.code())
    }
}

/// Errors produced while retrieving a URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The URL could not be parsed or names an unknown scheme.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The request is well formed but this engine does not do it.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The server sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Socket level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server closed the connection before the response was complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// No data arrived before the connection deadline.
    #[error("timeout")]
    Timeout,

    /// The request was lost while the connection was being discarded for
    /// mishandling pipelined requests.
    #[error("pipelining broken: {0}")]
    PipeliningBroken(BrokenReason),

    /// An FTP server refused a command.
    #[error("ftp error {code}: {text}")]
    Ftp { code: u16, text: String },

    /// The caller closed the stream before the response finished.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Short machine readable name of the error class.
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl(_) => "invalid-url",
            FetchError::Unsupported(_) => "unsupported",
            FetchError::ProtocolViolation(_) => "protocol-violation",
            FetchError::Transport(_) => "transport",
            FetchError::ConnectionClosed => "connection-closed",
            FetchError::Timeout => "timeout",
            FetchError::PipeliningBroken(_) => "pipelining-broken",
            FetchError::Ftp { .. } => "ftp",
            FetchError::Cancelled => "cancelled",
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => FetchError::Timeout,
            _ => FetchError::Transport(err.to_string()),
        }
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidUrl(err.to_string())
    }
}
