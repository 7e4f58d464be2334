//! Stream contract and concrete stream variants.
//!
//! A [`Stream`] is a blocking byte channel bound to one parsed target
//! descriptor. The public trait carries identity, sticky failure state, and
//! full-buffer blocking I/O; [`StreamExt`] layers typed scalar transfers on
//! top. The crate-internal [`EngineStream`] extension is what the hub's
//! event loop drives: it exposes the readiness source to watch and a probe
//! that detects pending data or end of stream without consuming bytes the
//! application has not seen.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, ErrorKind};
use crate::target::TargetDescriptor;

mod file;
mod serial;
mod stdio;
mod tcp;

use file::FileStream;
use serial::SerialStream;
use stdio::{StdinStream, StdoutStream};
use tcp::{TcpDataStream, TcpListenStream};

// ============================================================================
// Public contract
// ============================================================================

/// A blocking byte stream bound to one connection target.
///
/// Reads and writes transfer whole buffers: `read` blocks until the buffer
/// is completely filled, `write` until every byte has been handed to the OS.
/// There is no protocol framing and no byte transformation; what goes in one
/// end comes out the other.
///
/// Failure is sticky. Once an I/O operation fails, the stream is marked
/// failed and every further operation is rejected with
/// [`ErrorKind::InvalidOperation`](crate::ErrorKind::InvalidOperation)
/// without touching the OS resource again.
pub trait Stream {
    /// The canonical target name this stream was opened on, e.g.
    /// `tcp:host=127.0.0.1;port=5000`. Stable for the life of the stream
    /// and usable as an identity after the stream is gone.
    fn target_name(&self) -> &str;

    /// Whether an operation on this stream has failed.
    fn failed(&self) -> bool;

    /// Human-readable reason of the first failure, or an empty string if
    /// the stream has not failed.
    fn fail_reason(&self) -> &str;

    /// Reads until `buffer` is completely filled.
    ///
    /// Blocks as long as it takes. End of input before the buffer is full
    /// is [`ErrorKind::ConnectionLost`](crate::ErrorKind::ConnectionLost);
    /// any partially read bytes are lost with the stream.
    fn read(&mut self, buffer: &mut [u8]) -> Result<(), Error>;

    /// Writes the whole of `buffer`.
    ///
    /// Blocks until every byte has been accepted by the OS. Success means
    /// the bytes were handed over, not that they are durable; call
    /// [`flush`](Stream::flush) for that.
    fn write(&mut self, buffer: &[u8]) -> Result<(), Error>;

    /// Requests durability for previously written bytes.
    ///
    /// What this means is variant-specific: data sync for files, draining
    /// the transmit buffer for serial ports, a no-op for TCP (which writes
    /// through).
    fn flush(&mut self) -> Result<(), Error>;
}

mod sealed {
    pub trait Sealed {}
}

/// A fixed-width plain-data type that can cross a [`Stream`] as its native
/// in-memory byte representation.
///
/// Implemented for the fixed-width integers and floats only. The trait is
/// sealed: platform-variable types (`usize`) and non-POD types cannot
/// implement it, so [`StreamExt::read_scalar`] and
/// [`StreamExt::write_scalar`] are rejected for them at compile time.
pub trait Scalar: sealed::Sealed + Copy {
    #[doc(hidden)]
    const WIDTH: usize;

    #[doc(hidden)]
    fn write_ne(self, raw: &mut [u8]);

    #[doc(hidden)]
    fn read_ne(raw: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Scalar for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_ne(self, raw: &mut [u8]) {
                    raw.copy_from_slice(&self.to_ne_bytes());
                }

                fn read_ne(raw: &[u8]) -> Self {
                    <$ty>::from_ne_bytes(raw.try_into().expect("scalar width mismatch"))
                }
            }
        )*
    };
}

impl_scalar!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Typed transfers over any [`Stream`].
///
/// The value's native byte representation is moved verbatim; there is no
/// endianness conversion, so both ends of a cross-host link must agree on
/// byte order themselves.
pub trait StreamExt: Stream {
    /// Reads one scalar value.
    fn read_scalar<T: Scalar>(&mut self) -> Result<T, Error> {
        // Widest supported scalar is 8 bytes.
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::WIDTH];
        self.read(raw)?;
        Ok(T::read_ne(raw))
    }

    /// Writes one scalar value.
    fn write_scalar<T: Scalar>(&mut self, value: T) -> Result<(), Error> {
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::WIDTH];
        value.write_ne(raw);
        self.write(raw)
    }
}

impl<S: Stream + ?Sized> StreamExt for S {}

// ============================================================================
// Engine-facing contract
// ============================================================================

/// How the engine watches a stream for incoming activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollSource {
    /// Register this descriptor with the poller and watch for readability.
    Fd(RawFd),
    /// Cannot be registered (regular files) but always has data or end of
    /// stream pending; forces the engine into non-blocking poll cycles.
    AlwaysReady,
    /// Never produces incoming activity (write-only streams).
    NotWatched,
}

/// Result of a non-consuming availability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// At least one byte can be read without blocking.
    Data,
    /// Orderly end of stream.
    Eof,
    /// The readiness report was spurious; nothing is pending.
    Nothing,
}

/// The engine-side extension of [`Stream`].
///
/// Everything the event loop needs beyond the public contract: the
/// readiness source to register, a probe that classifies reported
/// readiness, a consumed-byte counter backing the no-read-progress guard,
/// and the accept operation of listening streams.
pub(crate) trait EngineStream: Stream {
    /// The readiness source the engine should watch.
    fn poll_source(&self) -> PollSource;

    /// Classifies pending activity without consuming application data.
    ///
    /// Called only when the readiness source reported activity (or for
    /// always-ready streams). An `Err` marks the stream failed.
    fn probe(&mut self) -> Result<Probe, Error>;

    /// Total bytes handed to the application through `read` so far.
    fn consumed(&self) -> u64;

    /// Whether this stream produces connections instead of data.
    fn is_listener(&self) -> bool {
        false
    }

    /// Accepts one pending connection on a listening stream.
    ///
    /// `Ok(None)` when the queue is empty or the condition was transient;
    /// `Err` is a hard listener failure. Never called on data streams.
    fn accept(&mut self) -> Result<Option<Box<dyn EngineStream>>, Error> {
        Ok(None)
    }

    /// The local socket address, for socket-backed streams. Lets callers
    /// recover the actual port after binding a listener to port 0.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Opening knobs resolved from configuration by the hub.
#[derive(Debug, Clone)]
pub(crate) struct OpenOptions {
    /// Per-syscall ceiling used to emulate indefinitely blocking serial
    /// reads.
    pub(crate) serial_read_timeout: Duration,
}

/// Opens the stream a parsed descriptor names.
///
/// Establishment failures are
/// [`ErrorKind::ConnectionFailed`](crate::ErrorKind::ConnectionFailed).
pub(crate) fn open(
    descriptor: &TargetDescriptor,
    options: &OpenOptions,
) -> Result<Box<dyn EngineStream>, Error> {
    let target = descriptor.to_string();
    match descriptor {
        TargetDescriptor::File { name, mode } => {
            Ok(Box::new(FileStream::open(name, *mode, target)?))
        }
        TargetDescriptor::Tcp { host, port } => {
            Ok(Box::new(TcpDataStream::connect(host, *port, target)?))
        }
        TargetDescriptor::TcpIn { port, address } => {
            Ok(Box::new(TcpListenStream::bind(address, *port, target)?))
        }
        TargetDescriptor::Serial { .. } => Ok(Box::new(SerialStream::open(descriptor, options)?)),
        TargetDescriptor::Stdin => Ok(Box::new(StdinStream::open(target)?)),
        TargetDescriptor::Stdout => Ok(Box::new(StdoutStream::open(target))),
    }
}

// ============================================================================
// Shared stream state
// ============================================================================

/// Identity, failure latch, and consumed-byte counter shared by every
/// stream variant.
#[derive(Debug)]
pub(crate) struct StreamCore {
    target: String,
    failed: bool,
    fail_reason: String,
    consumed: u64,
}

impl StreamCore {
    pub(crate) fn new(target: String) -> Self {
        Self {
            target,
            failed: false,
            fail_reason: String::new(),
            consumed: 0,
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn fail_reason(&self) -> &str {
        &self.fail_reason
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed
    }

    pub(crate) fn note_consumed(&mut self, amount: usize) {
        self.consumed += amount as u64;
    }

    /// Rejects I/O on a stream that has already failed.
    pub(crate) fn check_usable(&self) -> Result<(), Error> {
        if self.failed {
            Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("stream has failed: {}", self.fail_reason),
            )
            .with_stream(self.target.clone()))
        } else {
            Ok(())
        }
    }

    /// Latches the failure state and builds the error to return.
    pub(crate) fn fail(&mut self, kind: ErrorKind, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        self.failed = true;
        self.fail_reason = reason.clone();
        Error::new(kind, reason).with_stream(self.target.clone())
    }

    /// Latches the failure state from an OS error and builds the error to
    /// return.
    pub(crate) fn fail_io(&mut self, kind: ErrorKind, err: io::Error, reason: &str) -> Error {
        self.failed = true;
        self.fail_reason = format!("{reason}: {err}");
        Error::from_io(kind, err, reason).with_stream(self.target.clone())
    }

    /// Rejects an operation the stream does not support, without latching
    /// the failure state.
    pub(crate) fn reject(&self, reason: &str) -> Error {
        Error::new(ErrorKind::InvalidOperation, reason).with_stream(self.target.clone())
    }
}

// ============================================================================
// One-byte pushback
// ============================================================================

/// One byte of pushback for streams whose availability probe must read to
/// find out whether data or end of stream is pending (files, serial ports,
/// standard input). The probed byte is stashed here and handed back as the
/// first byte of the next `read`.
#[derive(Debug, Default)]
pub(crate) struct Lookahead {
    pending: Option<u8>,
}

impl Lookahead {
    pub(crate) fn stash(&mut self, byte: u8) {
        self.pending = Some(byte);
    }

    pub(crate) fn take(&mut self) -> Option<u8> {
        self.pending.take()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
