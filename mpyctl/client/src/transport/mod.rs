//! Byte-stream transports linking the host to a device.

use crate::error::TransportError;
use async_trait::async_trait;

mod serial;
mod websocket;

pub use serial::{DEFAULT_BAUD, SerialTransport, available_ports};
pub use websocket::WebSocketTransport;

/// Which kind of link a transport drives. Fixed at connect time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportKind {
    Serial { path: String, baud: u32 },
    Network { host: String },
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serial { path, baud } => write!(f, "serial:{path}@{baud}"),
            Self::Network { host } => write!(f, "ws://{host}:{}", websocket::WEBREPL_PORT),
        }
    }
}

/// The sending half of a bidirectional device link.
///
/// Inbound bytes are delivered as arbitrary-sized chunks, in arrival order,
/// through the channel returned by the concrete `connect` constructors. The
/// sender side of that channel is dropped exactly once when the link dies,
/// which is the close event consumers observe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write bytes to the device. Ordered, never re-framed.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the link. Idempotent.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Pulse the modem control lines to hard-reset the device. Returns
    /// `false` when the link has no control lines.
    async fn pulse_reset(&mut self) -> Result<bool, TransportError> {
        Ok(false)
    }

    fn kind(&self) -> &TransportKind;
}
