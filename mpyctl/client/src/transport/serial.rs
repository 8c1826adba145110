//! USB serial transport.

use super::{Transport, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream,
    StopBits,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span};

/// Default baud rate for MicroPython boards.
pub const DEFAULT_BAUD: u32 = 115_200;

const READ_BUF_SIZE: usize = 4096;

/// Serial link to a device: 8N1, no flow control, DTR asserted.
pub struct SerialTransport {
    kind: TransportKind,
    writer: Option<WriteHalf<SerialStream>>,
    shutdown: CancellationToken,
    #[cfg(unix)]
    fd: std::os::unix::io::RawFd,
}

impl SerialTransport {
    /// Open the device path and spawn the inbound read task. Returns the
    /// transport and the channel delivering inbound chunks.
    pub async fn connect(
        path: &str,
        baud: u32,
    ) -> Result<(Self, UnboundedReceiver<Vec<u8>>), TransportError> {
        let mut port = tokio_serial::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| map_open_error(path, e))?;

        port.write_data_terminal_ready(true)
            .map_err(|e| TransportError::Unavailable(format!("assert DTR on {path}: {e}")))?;

        #[cfg(unix)]
        let fd = {
            use std::os::unix::io::AsRawFd;
            port.as_raw_fd()
        };

        let (reader, writer) = tokio::io::split(port);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        task::spawn(
            read_loop(reader, tx, shutdown.clone()).instrument(debug_span!("serial_read", path)),
        );

        Ok((
            Self {
                kind: TransportKind::Serial {
                    path: path.into(),
                    baud,
                },
                writer: Some(writer),
                shutdown,
                #[cfg(unix)]
                fd,
            },
            rx,
        ))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::PeerClosed)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    /// Classic DTR/RTS reset pulse: EN low for 100 ms with DTR released.
    #[cfg(unix)]
    async fn pulse_reset(&mut self) -> Result<bool, TransportError> {
        if self.writer.is_none() {
            return Err(TransportError::PeerClosed);
        }
        set_modem_line(self.fd, libc::TIOCM_DTR, false)?;
        set_modem_line(self.fd, libc::TIOCM_RTS, true)?;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        set_modem_line(self.fd, libc::TIOCM_RTS, false)?;
        Ok(true)
    }

    fn kind(&self) -> &TransportKind {
        &self.kind
    }
}

async fn read_loop(
    mut reader: ReadHalf<SerialStream>,
    tx: UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("serial stream reached EOF");
                break;
            }
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("serial read ended: {e}");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn set_modem_line(
    fd: std::os::unix::io::RawFd,
    line: libc::c_int,
    assert: bool,
) -> Result<(), TransportError> {
    let request = if assert { libc::TIOCMBIS } else { libc::TIOCMBIC };
    match unsafe { libc::ioctl(fd, request, &line) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error().into()),
    }
}

fn map_open_error(path: &str, e: tokio_serial::Error) -> TransportError {
    match e.kind {
        tokio_serial::ErrorKind::NoDevice => {
            TransportError::Unavailable(format!("no device at {path}"))
        }
        tokio_serial::ErrorKind::Io(kind) if kind == std::io::ErrorKind::PermissionDenied => {
            TransportError::PermissionDenied(path.into())
        }
        tokio_serial::ErrorKind::Io(kind) if kind == std::io::ErrorKind::NotFound => {
            TransportError::Unavailable(format!("no device at {path}"))
        }
        _ => TransportError::Unavailable(format!("open {path}: {e}")),
    }
}

/// Paths of serial ports that look like attached boards, USB devices first.
pub fn available_ports() -> Vec<String> {
    let Ok(mut ports) = tokio_serial::available_ports() else {
        return Vec::new();
    };
    ports.sort_by_key(|p| !matches!(p.port_type, SerialPortType::UsbPort(_)));
    ports.into_iter().map(|p| p.port_name).collect()
}
