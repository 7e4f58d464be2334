//! Serial port enumeration.
//!
//! A pure query against host state: no ports is a valid, empty result, not
//! an error. The returned indices are 1-based and deterministic (sorted by
//! device name), and are the same indices `ser:port=N` targets resolve.

use std::collections::BTreeMap;

use serialport::SerialPortType;
use tracing::debug;

use crate::error::{Error, ErrorKind};

/// One enumerated serial device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// System device name, e.g. `/dev/ttyUSB0`.
    pub name: String,
    /// Human-readable description for UX purposes.
    pub description: String,
}

/// Lists the serial ports available on this host.
///
/// Fails with [`ErrorKind::Enumeration`] only when the host query itself
/// fails; a host without serial devices yields an empty map.
pub fn get_ports() -> Result<BTreeMap<u32, PortInfo>, Error> {
    let mut ports = serialport::available_ports().map_err(|err| {
        Error::new(
            ErrorKind::Enumeration,
            format!("cannot enumerate serial ports: {err}"),
        )
    })?;
    ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));

    debug!(count = ports.len(), "enumerated serial ports");
    Ok(ports
        .into_iter()
        .enumerate()
        .map(|(index, port)| {
            let description = describe(&port.port_type);
            (
                index as u32 + 1,
                PortInfo {
                    name: port.port_name,
                    description,
                },
            )
        })
        .collect())
}

fn describe(kind: &SerialPortType) -> String {
    match kind {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("USB serial port");
            format!("{product} ({:04x}:{:04x})", usb.vid, usb.pid)
        }
        SerialPortType::PciPort => "PCI serial port".to_owned(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_owned(),
        SerialPortType::Unknown => "serial port".to_owned(),
    }
}
