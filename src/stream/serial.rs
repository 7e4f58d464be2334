//! Serial port stream variant.
//!
//! Opens a TTY through the `serialport` crate with the settings carried by
//! the parsed descriptor. The port may be addressed by device path or by a
//! 1-based index into the enumerator's map; the device path wins when both
//! are present. `serialport` has no indefinitely-blocking read mode, so
//! blocking reads are emulated by retrying a long per-syscall timeout.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use serialport::{DataBits, StopBits, TTYPort};
use tracing::debug;

use super::{EngineStream, Lookahead, OpenOptions, PollSource, Probe, Stream, StreamCore};
use crate::error::{Error, ErrorKind};
use crate::ports;
use crate::target::{FlowControl, Parity, TargetDescriptor};

#[derive(Debug)]
pub(crate) struct SerialStream {
    core: StreamCore,
    port: TTYPort,
    lookahead: Lookahead,
}

impl SerialStream {
    pub(crate) fn open(
        descriptor: &TargetDescriptor,
        options: &OpenOptions,
    ) -> Result<Self, Error> {
        let target = descriptor.to_string();
        let TargetDescriptor::Serial {
            device,
            port,
            baud,
            stop,
            parity,
            fc,
            bits,
        } = descriptor
        else {
            unreachable!("serial stream opened from a non-serial descriptor");
        };

        let device = match device {
            Some(device) => device.clone(),
            None => ports::get_ports()
                .map_err(|err| {
                    Error::new(
                        ErrorKind::ConnectionFailed,
                        format!("cannot resolve serial port index {port}: {err}"),
                    )
                    .with_stream(target.clone())
                })?
                .remove(port)
                .map(|info| info.name)
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::ConnectionFailed,
                        format!("no serial port with index {port}"),
                    )
                    .with_stream(target.clone())
                })?,
        };

        let stop_bits = match stop {
            1 => StopBits::One,
            _ => StopBits::Two,
        };
        let parity = match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let flow_control = match fc {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hard => serialport::FlowControl::Hardware,
        };
        let data_bits = match bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let port = serialport::new(&device, *baud)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .data_bits(data_bits)
            .timeout(options.serial_read_timeout)
            .open_native()
            .map_err(|err| {
                Error::new(
                    ErrorKind::ConnectionFailed,
                    format!("cannot open serial port '{device}': {err}"),
                )
                .with_stream(target.clone())
            })?;

        debug!(%target, %device, "opened serial port");
        Ok(Self {
            core: StreamCore::new(target),
            port,
            lookahead: Lookahead::default(),
        })
    }
}

impl Stream for SerialStream {
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
        while filled < buffer.len() {
            match self.port.read(&mut buffer[filled..]) {
                Ok(0) => {
                    return Err(self
                        .core
                        .fail(ErrorKind::ConnectionLost, "serial port closed during read"));
                }
                Ok(amount) => filled += amount,
                // The configured timeout is a syscall ceiling, not a
                // deadline; keep waiting for the rest of the buffer.
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => return Err(self.core.fail_io(ErrorKind::Io, err, "read failed")),
            }
        }
        self.core.note_consumed(buffer.len());
        Ok(())
    }

    fn write(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.core.check_usable()?;
        self.port
            .write_all(buffer)
            .map_err(|err| self.core.fail_io(ErrorKind::Io, err, "write failed"))
    }

    /// Drains the transmit buffer.
    fn flush(&mut self) -> Result<(), Error> {
        self.core.check_usable()?;
        self.port
            .flush()
            .map_err(|err| self.core.fail_io(ErrorKind::Io, err, "transmit drain failed"))
    }
}

impl EngineStream for SerialStream {
    fn poll_source(&self) -> PollSource {
        PollSource::Fd(self.port.as_raw_fd())
    }

    fn probe(&mut self) -> Result<Probe, Error> {
        self.core.check_usable()?;
        if self.lookahead.is_pending() {
            return Ok(Probe::Data);
        }
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Ok(Probe::Eof),
                Ok(_) => {
                    self.lookahead.stash(byte[0]);
                    return Ok(Probe::Data);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    return Ok(Probe::Nothing)
                }
                Err(err) => return Err(self.core.fail_io(ErrorKind::Io, err, "probe failed")),
            }
        }
    }

    fn consumed(&self) -> u64 {
        self.core.consumed()
    }
}
