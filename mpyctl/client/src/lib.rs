//! Host-side client for MicroPython boards.
//!
//! Drives the device's interactive REPL as a machine-usable protocol over
//! two transports, USB serial and the WebSocket-based WebREPL: raw-mode
//! script execution with framed responses, a small filesystem layer on top
//! of it, terminal pass-through and device reset.
//!
//! ```no_run
//! use mpyctl_client::{Device, RunScriptOptions};
//!
//! # async fn demo() -> mpyctl_client::Result<()> {
//! let device = Device::new();
//! device.connect_serial("/dev/ttyUSB0", 115_200).await?;
//! let response = device.run_script("print(2+3)", RunScriptOptions::default()).await?;
//! assert_eq!(response.stdout, "5\n");
//! device.disconnect().await?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod conn;
mod device;
mod error;
mod fs;
mod script;
mod state;
mod transport;

pub use device::{CloseCallback, Device, TerminalDataCallback};
pub use error::{Error, RemoteErrno, Result, TransportError};
pub use fs::{FileEntry, StatResult};
pub use script::{Resolve, RunScriptOptions, ScriptResponse, StreamingCallback};
pub use state::ConnectionState;
pub use transport::{
    DEFAULT_BAUD, SerialTransport, Transport, TransportKind, WebSocketTransport, available_ports,
};
