//! File stream variant.
//!
//! A file target is one-directional: `mode=read` opens an existing file and
//! delivers its contents until end of file, `mode=write` creates or
//! truncates and accepts bytes. Regular files cannot be registered with the
//! readiness poller, so read-mode files report as always ready and their
//! availability is probed with a one-byte lookahead read; write-mode files
//! are never watched at all.

use std::fs::File;
use std::io::{self, Read, Write};

use tracing::debug;

use super::{EngineStream, Lookahead, PollSource, Probe, Stream, StreamCore};
use crate::error::{Error, ErrorKind};
use crate::target::FileMode;

#[derive(Debug)]
pub(crate) struct FileStream {
    core: StreamCore,
    mode: FileMode,
    file: File,
    lookahead: Lookahead,
}

impl FileStream {
    pub(crate) fn open(name: &str, mode: FileMode, target: String) -> Result<Self, Error> {
        let file = match mode {
            FileMode::Read => File::open(name),
            FileMode::Write => File::create(name),
        }
        .map_err(|err| {
            Error::from_io(
                ErrorKind::ConnectionFailed,
                err,
                format!("cannot open file '{name}' for {mode}"),
            )
            .with_stream(target.clone())
        })?;
        debug!(%target, "opened file");
        Ok(Self {
            core: StreamCore::new(target),
            mode,
            file,
            lookahead: Lookahead::default(),
        })
    }
}

impl Stream for FileStream {
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
        if self.mode == FileMode::Write {
            return Err(self.core.reject("file is opened for writing"));
        }
        if buffer.is_empty() {
            return Ok(());
        }
        let mut filled = 0;
        if let Some(byte) = self.lookahead.take() {
            buffer[0] = byte;
            filled = 1;
        }
        if filled < buffer.len() {
            match self.file.read_exact(&mut buffer[filled..]) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(self.core.fail_io(
                        ErrorKind::ConnectionLost,
                        err,
                        "end of file during read",
                    ));
                }
                Err(err) => return Err(self.core.fail_io(ErrorKind::Io, err, "read failed")),
            }
        }
        self.core.note_consumed(buffer.len());
        Ok(())
    }

    fn write(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.core.check_usable()?;
        if self.mode == FileMode::Read {
            return Err(self.core.reject("file is opened for reading"));
        }
        self.file
            .write_all(buffer)
            .map_err(|err| self.core.fail_io(ErrorKind::Io, err, "write failed"))
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.core.check_usable()?;
        if self.mode == FileMode::Read {
            return Ok(());
        }
        self.file
            .flush()
            .and_then(|()| self.file.sync_data())
            .map_err(|err| self.core.fail_io(ErrorKind::Io, err, "sync failed"))
    }
}

impl EngineStream for FileStream {
    fn poll_source(&self) -> PollSource {
        match self.mode {
            // epoll rejects regular files; a readable file always has data
            // or end of file pending.
            FileMode::Read => PollSource::AlwaysReady,
            FileMode::Write => PollSource::NotWatched,
        }
    }

    fn probe(&mut self) -> Result<Probe, Error> {
        self.core.check_usable()?;
        if self.lookahead.is_pending() {
            return Ok(Probe::Data);
        }
        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                Ok(0) => return Ok(Probe::Eof),
                Ok(_) => {
                    self.lookahead.stash(byte[0]);
                    return Ok(Probe::Data);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.core.fail_io(ErrorKind::Io, err, "probe failed")),
            }
        }
    }

    fn consumed(&self) -> u64 {
        self.core.consumed()
    }
}
