//! TLS error types and engine error interpretation.
//!
//! Two layers of errors live here. [`TlsError`] covers configuration and
//! credential loading, where a descriptive message is what the operator
//! needs. The data path instead speaks POSIX errno through `io::Error`,
//! because the stream contract is errno-based: `WouldBlock` is the retry
//! signal, `EPROTO` is a fatal protocol failure, and raw system errnos pass
//! through from the socket.

use crate::ratelimit::{rate_limited, RateLimit};
use openssl::error::ErrorStack;
use openssl::ssl::ErrorCode;
use std::fmt;
use std::io;
use std::sync::OnceLock;

/// Error type for TLS configuration and credential loading.
#[derive(Debug)]
pub enum TlsError {
    /// Configuration error (missing or inconsistent setup).
    Configuration(String),
    /// Certificate or key material error.
    Certificate(String),
    /// I/O error during configuration.
    Io(io::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "TLS configuration error: {msg}"),
            Self::Certificate(msg) => write!(f, "certificate error: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ErrorStack> for TlsError {
    fn from(err: ErrorStack) -> Self {
        Self::Certificate(err.to_string())
    }
}

/// Directional block signal from the engine's last read or write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Want {
    /// The call completed (successfully or with a final error); no need to
    /// block before retrying.
    #[default]
    Nothing,
    /// The engine needs the socket to become readable.
    Reading,
    /// The engine needs the socket to become writable.
    Writing,
}

/// Shared throttle for engine-level diagnostics. Who knows what can trigger
/// various TLS errors, so they are throttled down quite a bit.
pub(crate) fn ssl_rate_limit() -> &'static RateLimit {
    static RL: OnceLock<RateLimit> = OnceLock::new();
    RL.get_or_init(|| RateLimit::new(10, 25))
}

/// `EPROTO`: handshake failure, unexpected close, or bootstrap rejection.
pub(crate) fn proto_error() -> io::Error {
    io::Error::from_raw_os_error(libc::EPROTO)
}

/// `EAGAIN`: retry after the next poll wake-up.
pub(crate) fn again() -> io::Error {
    io::ErrorKind::WouldBlock.into()
}

/// `ENOPROTOOPT`: required credentials are missing or inconsistent.
pub(crate) fn config_unavailable() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOPROTOOPT)
}

fn io_fallback() -> io::Error {
    io::Error::from_raw_os_error(libc::EIO)
}

/// Maps an engine error from `function` to an errno-style error plus the
/// directional want the caller must store for its next wait computation.
///
/// Wants translate to `WouldBlock`. A syscall error with a captured I/O
/// error propagates that errno; a syscall error with nothing queued is the
/// peer closing mid-record, which is a protocol error. Engine-internal
/// errors surface as `EIO` after a rate-limited diagnostic.
pub(crate) fn interpret_ssl_error(function: &str, err: &openssl::ssl::Error) -> (io::Error, Want) {
    let rl = ssl_rate_limit();
    match err.code() {
        ErrorCode::WANT_READ => (again(), Want::Reading),
        ErrorCode::WANT_WRITE => (again(), Want::Writing),
        ErrorCode::ZERO_RETURN => {
            rate_limited!(rl, error, function, "unexpected SSL_ERROR_ZERO_RETURN");
            (io_fallback(), Want::Nothing)
        }
        ErrorCode::SYSCALL => {
            if let Some(io_err) = err.io_error() {
                rate_limited!(rl, warn, function, error = %io_err, "system error");
                let mapped = io_err
                    .raw_os_error()
                    .map_or_else(io_fallback, io::Error::from_raw_os_error);
                (mapped, Want::Nothing)
            } else if let Some(stack) = err.ssl_error() {
                rate_limited!(rl, warn, function, error = %stack, "TLS error");
                (io_fallback(), Want::Nothing)
            } else {
                rate_limited!(rl, warn, function, "unexpected TLS connection close");
                (proto_error(), Want::Nothing)
            }
        }
        ErrorCode::SSL => {
            if let Some(stack) = err.ssl_error() {
                rate_limited!(rl, warn, function, error = %stack, "TLS error");
            } else {
                rate_limited!(rl, error, function, "SSL_ERROR_SSL without queued error");
            }
            (io_fallback(), Want::Nothing)
        }
        code => {
            rate_limited!(rl, error, function, code = ?code, "bad TLS error code");
            (io_fallback(), Want::Nothing)
        }
    }
}
