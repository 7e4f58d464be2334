//! streamhub - unified byte streams behind one event loop
//!
//! streamhub gives TCP sockets, serial ports, files, and standard I/O a
//! single blocking byte-stream contract and multiplexes any number of them
//! in one single-threaded readiness loop. Describe a resource with a
//! compact target string, hand it to a [`Hub`], and receive
//! connection-lifecycle and data-ready callbacks as activity arrives.
//!
//! # Target naming
//!
//! A target is `protocol:[key=]value;...`. Each protocol defines an
//! implicit parameter order, so keys may be omitted; once a parameter is
//! keyed, all following ones must be keyed too. `tcp:host=H;port=P` and
//! `tcp:H;P` name the same target.
//!
//! | protocol | parameters (positional order, with defaults) |
//! |----------|----------------------------------------------|
//! | `file`   | `name`, `mode` (`read`) |
//! | `tcp`    | `host`, `port` |
//! | `tcpin`  | `port` (`5000`), `address` (`0.0.0.0`) |
//! | `ser`    | `device`, `port` (`1`), `baud` (`115200`), `stop` (`1`), `parity` (`none`), `fc` (`none`), `bits` (`8`) |
//! | `stdin`  | (none) |
//! | `stdout` | (none) |
//!
//! # Example
//!
//! ```no_run
//! use streamhub::{Hub, HubContext, HubHandler};
//!
//! struct Echo;
//!
//! impl HubHandler for Echo {
//!     fn incoming_data(&mut self, ctx: &mut HubContext<'_>, id: usize) {
//!         let stream = ctx.stream(id).unwrap();
//!         let mut byte = [0u8; 1];
//!         if stream.read(&mut byte).is_ok() {
//!             let _ = stream.write(&byte);
//!         }
//!     }
//! }
//!
//! let config = config::Config::builder().build().unwrap();
//! let mut hub = Hub::new(&config, Box::new(Echo)).unwrap();
//! hub.connect("tcpin:port=5000").unwrap();
//! hub.run().unwrap();
//! ```

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod hub;
pub(crate) mod ports;
pub(crate) mod stream;
pub(crate) mod target;

// These are the intended public API
pub use error::{Error, ErrorKind};
pub use hub::{Hub, HubContext, HubHandle, HubHandler, NoopHandler};
pub use ports::{get_ports, PortInfo};
pub use stream::{Scalar, Stream, StreamExt};
pub use target::{FileMode, FlowControl, Parity, TargetDescriptor};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::{Error, ErrorKind};
    pub use crate::hub::{Hub, HubContext, HubHandle, HubHandler, NoopHandler};
    pub use crate::ports::{get_ports, PortInfo};
    pub use crate::stream::{Stream, StreamExt};
    pub use crate::target::TargetDescriptor;
}
