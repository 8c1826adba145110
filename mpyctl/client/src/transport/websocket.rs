//! WebREPL WebSocket transport.

use super::{Transport, TransportKind};
use crate::error::TransportError;
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span};

/// The fixed WebREPL listening port.
pub(super) const WEBREPL_PORT: u16 = 8266;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket link to a WebREPL daemon, binary frames on path `/`.
pub struct WebSocketTransport {
    kind: TransportKind,
    sink: Option<SplitSink<WsStream, Message>>,
    shutdown: CancellationToken,
}

impl WebSocketTransport {
    /// Connect to `ws://<host>:8266/` and spawn the inbound read task.
    pub async fn connect(
        host: &str,
    ) -> Result<(Self, UnboundedReceiver<Vec<u8>>), TransportError> {
        let url = format!("ws://{host}:{WEBREPL_PORT}/");
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| map_ws_error(&url, e))?;
        let (sink, source) = stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        task::spawn(
            read_loop(source, tx, shutdown.clone()).instrument(debug_span!("ws_read", %url)),
        );

        Ok((
            Self {
                kind: TransportKind::Network { host: host.into() },
                sink: Some(sink),
                shutdown,
            },
            rx,
        ))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let sink = self.sink.as_mut().ok_or(TransportError::PeerClosed)?;
        sink.send(Message::binary(data.to_vec()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::PeerClosed,
                other => TransportError::Unavailable(other.to_string()),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        Ok(())
    }

    fn kind(&self) -> &TransportKind {
        &self.kind
    }
}

/// Forward data frames to the chunk channel. WebREPL daemons use text
/// frames for REPL output and binary frames elsewhere; both carry protocol
/// bytes for us.
async fn read_loop(
    mut source: SplitStream<WsStream>,
    tx: UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = source.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let chunk = match message {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_bytes().to_vec(),
            Ok(Message::Close(frame)) => {
                debug!("peer sent close frame: {frame:?}");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("websocket read ended: {e}");
                break;
            }
        };
        if tx.send(chunk).is_err() {
            break;
        }
    }
}

fn map_ws_error(url: &str, e: WsError) -> TransportError {
    match e {
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut => {
                TransportError::Unavailable(format!("connect {url}: {io}"))
            }
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(url.into()),
            _ => TransportError::Io(io),
        },
        WsError::Http(response) => TransportError::HandshakeFailed(format!(
            "{url} answered HTTP {}",
            response.status()
        )),
        other => TransportError::HandshakeFailed(format!("{url}: {other}")),
    }
}
