//! Target descriptor parsing.
//!
//! A target is a compact string naming a resource a stream can be opened on:
//! `protocol:[param1key=]param1value;...;[paramNkey=]paramNvalue`. Each
//! protocol defines an implicit parameter order so keys can be omitted, but
//! once any parameter is keyed, every following parameter must be keyed too.
//! Parsing is purely textual and performs no I/O; a [`TargetDescriptor`] is
//! validated and immutable once built.
//!
//! Supported protocols and their parameters (in implicit order):
//!
//! - `file`: `name` (required), `mode` (`read` or `write`, default `read`)
//! - `tcp`: `host` (required), `port` (required)
//! - `tcpin`: `port` (default 5000), `address` (default `0.0.0.0`)
//! - `ser`: `device` (no default; wins over `port` when both are given),
//!   `port` (default 1), `baud` (default 115200), `stop` (1 or 2, default
//!   1), `parity` (`none`/`even`/`odd`, default `none`), `fc`
//!   (`none`/`hard`, default `none`), `bits` (5 to 8, default 8)
//! - `stdin`, `stdout`: no parameters

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ErrorKind};

// ============================================================================
// Serial settings
// ============================================================================

/// Parity checking mode of a serial target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        })
    }
}

impl FromStr for Parity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "none" => Ok(Parity::None),
            "even" => Ok(Parity::Even),
            "odd" => Ok(Parity::Odd),
            _ => Err(()),
        }
    }
}

/// Flow control mode of a serial target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Hard,
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowControl::None => "none",
            FlowControl::Hard => "hard",
        })
    }
}

impl FromStr for FlowControl {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "none" => Ok(FlowControl::None),
            "hard" => Ok(FlowControl::Hard),
            _ => Err(()),
        }
    }
}

/// Access mode of a file target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileMode::Read => "read",
            FileMode::Write => "write",
        })
    }
}

impl FromStr for FileMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "read" => Ok(FileMode::Read),
            "write" => Ok(FileMode::Write),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// A parsed, validated connection target.
///
/// Built by [`TargetDescriptor::parse`]; the `Display` implementation
/// renders the canonical fully-keyed form, which re-parses to an equal
/// descriptor. That canonical form is also what streams report as their
/// target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDescriptor {
    /// A local file, read from start or created/truncated for writing.
    File { name: String, mode: FileMode },
    /// An outgoing TCP connection.
    Tcp { host: String, port: u16 },
    /// A listening TCP socket producing new connections on accept.
    TcpIn { port: u16, address: String },
    /// A serial port, addressed by device path or by enumerator index.
    Serial {
        /// System device name; when present it wins over `port`.
        device: Option<String>,
        /// 1-based index into the serial enumerator's map.
        port: u32,
        baud: u32,
        /// Stop bit count, 1 or 2.
        stop: u8,
        parity: Parity,
        fc: FlowControl,
        /// Bits per character, 5 through 8.
        bits: u8,
    },
    /// The process standard input.
    Stdin,
    /// The process standard output.
    Stdout,
}

impl TargetDescriptor {
    /// Parses a target string.
    ///
    /// Fails with [`ErrorKind::InvalidTarget`] when the protocol tag is
    /// unrecognized, a positional parameter follows a keyed one, a value
    /// fails validation, a required parameter is missing, or a protocol
    /// that takes no parameters is given some.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let (protocol, body) = match text.split_once(':') {
            Some((protocol, body)) => (protocol, body),
            None => (text, ""),
        };

        match protocol {
            "file" => {
                let params = ParamSet::parse(protocol, FILE_PARAMS, body)?;
                Ok(TargetDescriptor::File {
                    name: params.get("name").to_owned(),
                    mode: params.get_enum::<FileMode>(protocol, "mode")?,
                })
            }
            "tcp" => {
                let params = ParamSet::parse(protocol, TCP_PARAMS, body)?;
                Ok(TargetDescriptor::Tcp {
                    host: params.get("host").to_owned(),
                    port: params.get_number::<u16>(protocol, "port")?,
                })
            }
            "tcpin" => {
                let params = ParamSet::parse(protocol, TCPIN_PARAMS, body)?;
                Ok(TargetDescriptor::TcpIn {
                    port: params.get_number::<u16>(protocol, "port")?,
                    address: params.get("address").to_owned(),
                })
            }
            "ser" => {
                let params = ParamSet::parse(protocol, SER_PARAMS, body)?;
                let device = match params.get("device") {
                    "" => None,
                    device => Some(device.to_owned()),
                };
                let stop = params.get_number::<u8>(protocol, "stop")?;
                if !matches!(stop, 1 | 2) {
                    return Err(invalid_value(protocol, "stop", &stop.to_string()));
                }
                let bits = params.get_number::<u8>(protocol, "bits")?;
                if !(5..=8).contains(&bits) {
                    return Err(invalid_value(protocol, "bits", &bits.to_string()));
                }
                Ok(TargetDescriptor::Serial {
                    device,
                    port: params.get_number::<u32>(protocol, "port")?,
                    baud: params.get_number::<u32>(protocol, "baud")?,
                    stop,
                    parity: params.get_enum::<Parity>(protocol, "parity")?,
                    fc: params.get_enum::<FlowControl>(protocol, "fc")?,
                    bits,
                })
            }
            "stdin" => {
                ParamSet::parse(protocol, NO_PARAMS, body)?;
                Ok(TargetDescriptor::Stdin)
            }
            "stdout" => {
                ParamSet::parse(protocol, NO_PARAMS, body)?;
                Ok(TargetDescriptor::Stdout)
            }
            _ => Err(Error::new(
                ErrorKind::InvalidTarget,
                format!("unrecognized protocol '{protocol}' in target '{text}'"),
            )),
        }
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetDescriptor::File { name, mode } => {
                write!(f, "file:name={name};mode={mode}")
            }
            TargetDescriptor::Tcp { host, port } => {
                write!(f, "tcp:host={host};port={port}")
            }
            TargetDescriptor::TcpIn { port, address } => {
                write!(f, "tcpin:port={port};address={address}")
            }
            TargetDescriptor::Serial {
                device,
                port,
                baud,
                stop,
                parity,
                fc,
                bits,
            } => {
                f.write_str("ser:")?;
                if let Some(device) = device {
                    write!(f, "device={device};")?;
                }
                write!(
                    f,
                    "port={port};baud={baud};stop={stop};parity={parity};fc={fc};bits={bits}"
                )
            }
            TargetDescriptor::Stdin => f.write_str("stdin:"),
            TargetDescriptor::Stdout => f.write_str("stdout:"),
        }
    }
}

// ============================================================================
// Parameter tables
// ============================================================================

// (name, default); a `None` default makes the parameter required.
type ParamSpec = (&'static str, Option<&'static str>);

const FILE_PARAMS: &[ParamSpec] = &[("name", None), ("mode", Some("read"))];
const TCP_PARAMS: &[ParamSpec] = &[("host", None), ("port", None)];
const TCPIN_PARAMS: &[ParamSpec] = &[("port", Some("5000")), ("address", Some("0.0.0.0"))];
const SER_PARAMS: &[ParamSpec] = &[
    ("device", Some("")),
    ("port", Some("1")),
    ("baud", Some("115200")),
    ("stop", Some("1")),
    ("parity", Some("none")),
    ("fc", Some("none")),
    ("bits", Some("8")),
];
const NO_PARAMS: &[ParamSpec] = &[];

// Ordered parameter collection for one protocol. Positional values fill
// slots in table order; a keyed value may target any slot, but after the
// first keyed value no positional is accepted. A repeated key overwrites
// the earlier assignment.
struct ParamSet {
    values: HashMap<&'static str, String>,
}

impl ParamSet {
    fn parse(protocol: &str, spec: &'static [ParamSpec], body: &str) -> Result<Self, Error> {
        let mut values: HashMap<&'static str, String> = HashMap::new();
        let mut next_positional = 0usize;
        let mut seen_keyed = false;

        if !body.is_empty() {
            for piece in body.split(';') {
                if let Some((key, value)) = piece.split_once('=') {
                    seen_keyed = true;
                    let slot = spec.iter().find(|(name, _)| *name == key).ok_or_else(|| {
                        Error::new(
                            ErrorKind::InvalidTarget,
                            format!("unknown parameter '{key}' for protocol '{protocol}'"),
                        )
                    })?;
                    values.insert(slot.0, value.to_owned());
                } else {
                    if seen_keyed {
                        return Err(Error::new(
                            ErrorKind::InvalidTarget,
                            format!(
                                "positional parameter '{piece}' after a keyed parameter \
                                 in protocol '{protocol}'"
                            ),
                        ));
                    }
                    let slot = spec.get(next_positional).ok_or_else(|| {
                        Error::new(
                            ErrorKind::InvalidTarget,
                            format!(
                                "too many parameters for protocol '{protocol}' \
                                 (takes at most {})",
                                spec.len()
                            ),
                        )
                    })?;
                    values.insert(slot.0, piece.to_owned());
                    next_positional += 1;
                }
            }
        }

        for (name, default) in spec {
            if values.contains_key(name) {
                continue;
            }
            match default {
                Some(default) => {
                    values.insert(name, (*default).to_owned());
                }
                None => {
                    return Err(Error::new(
                        ErrorKind::InvalidTarget,
                        format!("missing required parameter '{name}' for protocol '{protocol}'"),
                    ));
                }
            }
        }

        Ok(Self { values })
    }

    // Every table entry is guaranteed present after `parse`.
    fn get(&self, name: &str) -> &str {
        &self.values[name]
    }

    fn get_number<T: FromStr>(&self, protocol: &str, name: &str) -> Result<T, Error> {
        let raw = self.get(name);
        raw.parse::<T>()
            .map_err(|_| invalid_value(protocol, name, raw))
    }

    fn get_enum<T: FromStr>(&self, protocol: &str, name: &str) -> Result<T, Error> {
        let raw = self.get(name);
        raw.parse::<T>()
            .map_err(|_| invalid_value(protocol, name, raw))
    }
}

fn invalid_value(protocol: &str, name: &str, value: &str) -> Error {
    Error::new(
        ErrorKind::InvalidTarget,
        format!("invalid value '{value}' for parameter '{name}' of protocol '{protocol}'"),
    )
}
