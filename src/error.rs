use std::fmt;
use std::io;
use thiserror::Error;

/// Cause categories for [`Error`].
///
/// Every failure raised by the library belongs to exactly one category;
/// matching on the kind is the supported way to branch on failures (the
/// `Display` text is for humans and logs, not for dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Failure that fits no other category. Hopefully never used.
    Unknown,

    /// Internal bookkeeping and the OS readiness report disagree.
    Sync,

    /// The target descriptor string was malformed or failed validation.
    InvalidTarget,

    /// The operation is not valid on this stream, or the stream has
    /// already failed and rejects further I/O.
    InvalidOperation,

    /// The remote end closed the connection, or end of input was reached
    /// before the requested amount of data.
    ConnectionLost,

    /// Low-level I/O failure reported by the operating system.
    Io,

    /// The connection could not be established.
    ConnectionFailed,

    /// Querying the host for serial ports failed.
    Enumeration,

    /// A data stream reported readiness again while the previous
    /// `incoming_data` callback had consumed nothing. Guards against an
    /// infinite busy-readiness loop; indicates a defect in the callback,
    /// not a transient condition.
    PreviousIncomingDataNotRead,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::Unknown => "unknown error",
            ErrorKind::Sync => "synchronization error",
            ErrorKind::InvalidTarget => "invalid target",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::ConnectionLost => "connection lost",
            ErrorKind::Io => "I/O error",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::Enumeration => "enumeration error",
            ErrorKind::PreviousIncomingDataNotRead => "previous incoming data not read",
        };
        f.write_str(text)
    }
}

/// The error type for streamhub operations.
///
/// Every error carries a cause category ([`ErrorKind`]), a human-readable
/// reason, and, when available, the OS error code and message that triggered
/// it plus the target name of the offending stream. The target name is a
/// stable identity: it stays meaningful after the stream itself has been
/// closed and destroyed, so errors never hold a reference into the
/// [`Hub`](crate::Hub).
///
/// Parse-time errors precede stream creation and therefore carry no stream
/// identity.
#[derive(Error, Debug)]
#[error("{kind}: {reason}")]
pub struct Error {
    kind: ErrorKind,
    reason: String,
    os_error: Option<i32>,
    os_message: Option<String>,
    stream: Option<String>,
}

// ============================================================================
// Construction (crate-internal; errors are produced at the point of failure)
// ============================================================================

impl Error {
    pub(crate) fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            os_error: None,
            os_message: None,
            stream: None,
        }
    }

    /// Wraps an OS-level error, folding its message into the reason and
    /// retaining the raw code/message for callers that want them.
    pub(crate) fn from_io(kind: ErrorKind, err: io::Error, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: format!("{}: {}", reason.into(), err),
            os_error: err.raw_os_error(),
            os_message: Some(err.to_string()),
            stream: None,
        }
    }

    /// Attaches the identity (target name) of the stream the error concerns.
    pub(crate) fn with_stream(mut self, target: impl Into<String>) -> Self {
        self.stream = Some(target.into());
        self
    }
}

// ============================================================================
// Inspection
// ============================================================================

impl Error {
    /// The cause category.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The raw OS error code, when the failure originated in an OS call.
    pub fn os_error(&self) -> Option<i32> {
        self.os_error
    }

    /// The OS-provided error message, when the failure originated in an OS
    /// call.
    pub fn os_message(&self) -> Option<&str> {
        self.os_message.as_deref()
    }

    /// Target name of the stream the error concerns, if any. Absent for
    /// parse-time errors, which precede stream creation.
    pub fn stream(&self) -> Option<&str> {
        self.stream.as_deref()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(ErrorKind::Io, err, "I/O failure")
    }
}
