//! TCP stream variants.
//!
//! Data connections are plain blocking sockets with `TCP_NODELAY` set, so
//! writes go out immediately and `flush` has nothing to do. Availability is
//! probed with a non-blocking `MSG_PEEK`, which distinguishes pending data
//! from an orderly shutdown without consuming anything. Listening sockets
//! stay non-blocking for the accept path and never transfer data
//! themselves.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;

use tracing::{debug, trace, warn};

use super::{EngineStream, PollSource, Probe, Stream, StreamCore};
use crate::error::{Error, ErrorKind};
use crate::target::TargetDescriptor;

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

// ============================================================================
// Data connection
// ============================================================================

#[derive(Debug)]
pub(crate) struct TcpDataStream {
    core: StreamCore,
    socket: TcpStream,
}

impl TcpDataStream {
    /// Connects to `host:port`, resolving the host if necessary.
    pub(crate) fn connect(host: &str, port: u16, target: String) -> Result<Self, Error> {
        let socket = TcpStream::connect((host, port)).map_err(|err| {
            Error::from_io(
                ErrorKind::ConnectionFailed,
                err,
                format!("cannot connect to {host}:{port}"),
            )
            .with_stream(target.clone())
        })?;
        Self::setup(socket, target)
    }

    /// Wraps a connection produced by a listener's accept.
    pub(crate) fn from_accepted(socket: TcpStream, peer: SocketAddr) -> Result<Self, Error> {
        let target = TargetDescriptor::Tcp {
            host: peer.ip().to_string(),
            port: peer.port(),
        }
        .to_string();
        // Whether an accepted socket inherits the listener's non-blocking
        // mode is platform-dependent.
        socket.set_nonblocking(false).map_err(|err| {
            Error::from_io(
                ErrorKind::ConnectionFailed,
                err,
                "cannot switch accepted connection to blocking",
            )
            .with_stream(target.clone())
        })?;
        Self::setup(socket, target)
    }

    fn setup(socket: TcpStream, target: String) -> Result<Self, Error> {
        socket.set_nodelay(true).map_err(|err| {
            Error::from_io(ErrorKind::ConnectionFailed, err, "cannot set TCP_NODELAY")
                .with_stream(target.clone())
        })?;
        debug!(%target, "opened TCP connection");
        Ok(Self {
            core: StreamCore::new(target),
            socket,
        })
    }
}

impl Stream for TcpDataStream {
    fn target_name(&self) -> &str {
        self.core.target()
    }

    fn failed(&self) -> bool {
        self.core.failed()
    }

    fn fail_reason(&self) -> &str {
        self.core.fail_reason()
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.core.check_usable()?;
        if buffer.is_empty() {
            return Ok(());
        }
        match self.socket.read_exact(buffer) {
            Ok(()) => {
                self.core.note_consumed(buffer.len());
                trace!(len = buffer.len(), target = %self.core.target(), "read from socket");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(self.core.fail_io(
                ErrorKind::ConnectionLost,
                err,
                "connection closed during read",
            )),
            Err(err) if is_connection_error(&err) => Err(self.core.fail_io(
                ErrorKind::ConnectionLost,
                err,
                "connection lost during read",
            )),
            Err(err) => Err(self.core.fail_io(ErrorKind::Io, err, "read failed")),
        }
    }

    fn write(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.core.check_usable()?;
        match self.socket.write_all(buffer) {
            Ok(()) => {
                trace!(len = buffer.len(), target = %self.core.target(), "wrote to socket");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WriteZero || is_connection_error(&err) => {
                Err(self
                    .core
                    .fail_io(ErrorKind::ConnectionLost, err, "connection lost during write"))
            }
            Err(err) => Err(self.core.fail_io(ErrorKind::Io, err, "write failed")),
        }
    }

    // TCP_NODELAY writes through; there is nothing buffered to push out.
    fn flush(&mut self) -> Result<(), Error> {
        self.core.check_usable()
    }
}

impl EngineStream for TcpDataStream {
    fn poll_source(&self) -> PollSource {
        PollSource::Fd(self.socket.as_raw_fd())
    }

    fn probe(&mut self) -> Result<Probe, Error> {
        self.core.check_usable()?;
        self.socket.set_nonblocking(true).map_err(|err| {
            self.core
                .fail_io(ErrorKind::Io, err, "cannot switch socket to non-blocking")
        })?;

        let mut byte = [0u8; 1];
        let peeked = loop {
            match self.socket.peek(&mut byte) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        // Restore blocking mode before interpreting the probe; the public
        // read/write contract depends on it.
        self.socket.set_nonblocking(false).map_err(|err| {
            self.core
                .fail_io(ErrorKind::Io, err, "cannot restore socket to blocking")
        })?;

        match peeked {
            Ok(0) => Ok(Probe::Eof),
            Ok(_) => Ok(Probe::Data),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Probe::Nothing),
            Err(err) if is_connection_error(&err) => Err(self.core.fail_io(
                ErrorKind::ConnectionLost,
                err,
                "connection lost",
            )),
            Err(err) => Err(self.core.fail_io(ErrorKind::Io, err, "probe failed")),
        }
    }

    fn consumed(&self) -> u64 {
        self.core.consumed()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

// ============================================================================
// Listening socket
// ============================================================================

#[derive(Debug)]
pub(crate) struct TcpListenStream {
    core: StreamCore,
    listener: TcpListener,
}

impl TcpListenStream {
    pub(crate) fn bind(address: &str, port: u16, target: String) -> Result<Self, Error> {
        let addr = (address, port)
            .to_socket_addrs()
            .map_err(|err| {
                Error::from_io(
                    ErrorKind::ConnectionFailed,
                    err,
                    format!("cannot resolve listen address {address}"),
                )
                .with_stream(target.clone())
            })?
            .next()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::ConnectionFailed,
                    format!("listen address {address} resolved to nothing"),
                )
                .with_stream(target.clone())
            })?;

        let listener = TcpListener::bind(addr).map_err(|err| {
            Error::from_io(
                ErrorKind::ConnectionFailed,
                err,
                format!("cannot listen on {addr}"),
            )
            .with_stream(target.clone())
        })?;
        // Keep the accept path from ever blocking the event loop.
        listener.set_nonblocking(true).map_err(|err| {
            Error::from_io(
                ErrorKind::ConnectionFailed,
                err,
                "cannot switch listener to non-blocking",
            )
            .with_stream(target.clone())
        })?;

        debug!(%target, local_addr = ?listener.local_addr().ok(), "listening");
        Ok(Self {
            core: StreamCore::new(target),
            listener,
        })
    }
}

impl Stream for TcpListenStream {
    fn target_name(&self) -> &str {
        self.core.target()
    }

    fn failed(&self) -> bool {
        self.core.failed()
    }

    fn fail_reason(&self) -> &str {
        self.core.fail_reason()
    }

    fn read(&mut self, _buffer: &mut [u8]) -> Result<(), Error> {
        Err(self.core.reject("listening streams do not transfer data"))
    }

    fn write(&mut self, _buffer: &[u8]) -> Result<(), Error> {
        Err(self.core.reject("listening streams do not transfer data"))
    }

    fn flush(&mut self) -> Result<(), Error> {
        Err(self.core.reject("listening streams do not transfer data"))
    }
}

impl EngineStream for TcpListenStream {
    fn poll_source(&self) -> PollSource {
        PollSource::Fd(self.listener.as_raw_fd())
    }

    // Listeners are accepted, never probed.
    fn probe(&mut self) -> Result<Probe, Error> {
        Ok(Probe::Nothing)
    }

    fn consumed(&self) -> u64 {
        self.core.consumed()
    }

    fn is_listener(&self) -> bool {
        true
    }

    fn accept(&mut self) -> Result<Option<Box<dyn EngineStream>>, Error> {
        loop {
            match self.listener.accept() {
                Ok((socket, peer)) => {
                    debug!(%peer, target = %self.core.target(), "accepted connection");
                    return Ok(Some(Box::new(TcpDataStream::from_accepted(socket, peer)?)));
                }
                Err(err) => match err.kind() {
                    // Queue drained; nothing more to take this cycle.
                    io::ErrorKind::WouldBlock => return Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
                        warn!(target = %self.core.target(), ?err, "transient accept error");
                        continue;
                    }
                    _ => return Err(self.core.fail_io(ErrorKind::Io, err, "accept failed")),
                },
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
