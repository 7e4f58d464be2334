//! Standard input/output stream variants.
//!
//! The process-standard descriptors are borrowed, never owned: closing
//! stdin or stdout is not this library's call to make, so the wrapped
//! handles are kept in `ManuallyDrop` and the descriptors stay open when
//! the stream is destroyed. Standard input bypasses `std::io::stdin()` on
//! purpose: its internal buffering would pull bytes out of the descriptor
//! behind the readiness poller's back.

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::unix::io::{FromRawFd, RawFd};

use tracing::debug;

use super::{EngineStream, Lookahead, PollSource, Probe, Stream, StreamCore};
use crate::error::{Error, ErrorKind};

const STDIN_FD: RawFd = 0;
const STDOUT_FD: RawFd = 1;

// SAFETY: fd 0 and fd 1 are open for the life of the process and the
// ManuallyDrop wrapper guarantees the File never closes them.
fn borrow_fd(fd: RawFd) -> ManuallyDrop<File> {
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

// ============================================================================
// Standard input
// ============================================================================

#[derive(Debug)]
pub(crate) struct StdinStream {
    core: StreamCore,
    input: ManuallyDrop<File>,
    lookahead: Lookahead,
}

impl StdinStream {
    pub(crate) fn open(target: String) -> Result<Self, Error> {
        debug!(%target, "wrapping standard input");
        Ok(Self {
            core: StreamCore::new(target),
            input: borrow_fd(STDIN_FD),
            lookahead: Lookahead::default(),
        })
    }
}

impl Stream for StdinStream {
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
        let mut filled = 0;
        if let Some(byte) = self.lookahead.take() {
            buffer[0] = byte;
            filled = 1;
        }
        if filled < buffer.len() {
            match self.input.read_exact(&mut buffer[filled..]) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(self.core.fail_io(
                        ErrorKind::ConnectionLost,
                        err,
                        "end of input during read",
                    ));
                }
                Err(err) => return Err(self.core.fail_io(ErrorKind::Io, err, "read failed")),
            }
        }
        self.core.note_consumed(buffer.len());
        Ok(())
    }

    fn write(&mut self, _buffer: &[u8]) -> Result<(), Error> {
        Err(self.core.reject("standard input is read-only"))
    }

    fn flush(&mut self) -> Result<(), Error> {
        Err(self.core.reject("standard input is read-only"))
    }
}

impl EngineStream for StdinStream {
    fn poll_source(&self) -> PollSource {
        PollSource::Fd(STDIN_FD)
    }

    // Only called after the descriptor reported readable, so the one-byte
    // read cannot block.
    fn probe(&mut self) -> Result<Probe, Error> {
        self.core.check_usable()?;
        if self.lookahead.is_pending() {
            return Ok(Probe::Data);
        }
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(Probe::Eof),
                Ok(_) => {
                    self.lookahead.stash(byte[0]);
                    return Ok(Probe::Data);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Probe::Nothing),
                Err(err) => return Err(self.core.fail_io(ErrorKind::Io, err, "probe failed")),
            }
        }
    }

    fn consumed(&self) -> u64 {
        self.core.consumed()
    }
}

// ============================================================================
// Standard output
// ============================================================================

#[derive(Debug)]
pub(crate) struct StdoutStream {
    core: StreamCore,
    output: ManuallyDrop<File>,
}

impl StdoutStream {
    pub(crate) fn open(target: String) -> Self {
        debug!(%target, "wrapping standard output");
        Self {
            core: StreamCore::new(target),
            output: borrow_fd(STDOUT_FD),
        }
    }
}

impl Stream for StdoutStream {
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
        Err(self.core.reject("standard output is write-only"))
    }

    fn write(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.core.check_usable()?;
        match self.output.write_all(buffer) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Err(self.core.fail_io(
                ErrorKind::ConnectionLost,
                err,
                "standard output closed",
            )),
            Err(err) => Err(self.core.fail_io(ErrorKind::Io, err, "write failed")),
        }
    }

    // Writes go straight to the descriptor; nothing is buffered here.
    fn flush(&mut self) -> Result<(), Error> {
        self.core.check_usable()
    }
}

impl EngineStream for StdoutStream {
    fn poll_source(&self) -> PollSource {
        PollSource::NotWatched
    }

    fn probe(&mut self) -> Result<Probe, Error> {
        Ok(Probe::Nothing)
    }

    fn consumed(&self) -> u64 {
        self.core.consumed()
    }
}
