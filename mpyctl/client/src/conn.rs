//! The REPL protocol engine: handshakes, response framing, flow control.

use crate::{
    buffer::SharedBuffer,
    error::{Error, Result},
    script::{ScriptResponse, StreamingCallback, dedent},
    state::ConnectionState,
    transport::Transport,
};
use memchr::memmem;
use std::{sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) const CTRL_B: u8 = 0x02;
pub(crate) const CTRL_C: u8 = 0x03;
pub(crate) const CTRL_D: u8 = 0x04;
const CTRL_A: u8 = 0x01;

/// Terminates the stdout and stderr sections of a raw-mode response.
const EOT: u8 = 0x04;
/// The raw-mode prompt closing a response frame.
const PROMPT: u8 = b'>';
/// Window-grow acknowledgement during raw-paste input.
const PASTE_ACK: u8 = 0x01;

const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
const FRIENDLY_PROMPT: &[u8] = b">>>";
const RAW_PASTE_PROBE: &[u8] = &[0x05, b'A', 0x01];
const PASSWORD_PROMPT: &[u8] = b"Password:";
const WEBREPL_CONNECTED: &[u8] = b"WebREPL connected";
const ACCESS_DENIED: &[u8] = b"Access denied";

/// Bounded wait for any handshake landmark.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bounded wait for the response tail after an interrupt.
const INTERRUPT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

enum Outcome<T> {
    Done(T),
    Canceled,
    TimedOut,
}

/// One live link: the transport write half, the shared inbound buffer and
/// the interaction mode. All protocol sequencing happens through here.
pub(crate) struct Connection {
    transport: Box<dyn Transport>,
    buffer: Arc<SharedBuffer>,
    state: ConnectionState,
    /// State to restore when the terminal consumer detaches.
    resume: ConnectionState,
    /// Raw-paste capability. Probed on every connect, never carried over.
    raw_paste: bool,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, buffer: Arc<SharedBuffer>) -> Self {
        Self {
            transport,
            buffer,
            state: ConnectionState::Closed,
            resume: ConnectionState::Closed,
            raw_paste: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drive the fresh link up to raw mode: optional WebREPL login, double
    /// interrupt, raw entry, raw-paste probe.
    pub async fn open(&mut self, password: Option<&str>) -> Result<()> {
        self.state.advance(ConnectionState::Opening)?;
        if let Some(password) = password {
            self.state.advance(ConnectionState::WebReplUnauthenticated)?;
            self.login(password).await?;
        }
        self.state.advance(ConnectionState::FriendlyRepl)?;
        self.enter_raw().await?;
        self.probe_raw_paste().await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        trace!("sending {} bytes", data.len());
        self.transport.send(data).await.map_err(|e| {
            debug!("transport send failed: {e}");
            Error::ConnectionLost
        })
    }

    /// Run `source` to completion under the caller's deadline and cancel
    /// handle. Cancellation and timeouts interrupt the device and consume
    /// the response tail so the next request starts clean.
    pub async fn run_script(
        &mut self,
        prepared: &[u8],
        deadline: Option<Instant>,
        cancel: Option<CancellationToken>,
        streaming: &mut Option<StreamingCallback>,
    ) -> Result<ScriptResponse> {
        let outcome = {
            let work = async {
                self.submit(prepared).await?;
                Self::collect(&self.buffer, streaming).await
            };
            tokio::pin!(work);
            bounded(&mut work, deadline, cancel).await
        };
        match outcome {
            Outcome::Done(result) => result,
            Outcome::Canceled => {
                self.interrupt().await?;
                Err(Error::Canceled)
            }
            Outcome::TimedOut => {
                self.interrupt().await?;
                Err(Error::Timeout)
            }
        }
    }

    /// Send phase only, for first-prompt resolution: returns once the
    /// device has acknowledged receipt with `OK`.
    pub async fn submit_bounded(
        &mut self,
        prepared: &[u8],
        deadline: Option<Instant>,
        cancel: Option<CancellationToken>,
    ) -> Result<()> {
        let outcome = {
            let work = self.submit(prepared);
            tokio::pin!(work);
            bounded(&mut work, deadline, cancel).await
        };
        match outcome {
            Outcome::Done(result) => result,
            Outcome::Canceled => {
                self.interrupt().await?;
                Err(Error::Canceled)
            }
            Outcome::TimedOut => {
                self.interrupt().await?;
                Err(Error::Timeout)
            }
        }
    }

    /// Make sure the device accepts machine input, re-entering raw mode
    /// from the friendly prompt if a previous operation left it there.
    pub async fn ensure_raw(&mut self) -> Result<()> {
        match self.state {
            state if state.is_raw() => Ok(()),
            ConnectionState::FriendlyRepl => {
                self.enter_raw().await?;
                if self.raw_paste {
                    self.state.advance(ConnectionState::RawPasteRepl)?;
                }
                Ok(())
            }
            other => Err(Error::InvalidResponse(format!(
                "cannot run scripts in state {other}"
            ))),
        }
    }

    /// Hand the stream to a terminal consumer.
    pub fn enter_terminal(&mut self) -> Result<()> {
        if self.state == ConnectionState::TerminalMode {
            return Ok(());
        }
        self.resume = self.state;
        self.state.advance(ConnectionState::TerminalMode)
    }

    /// Detach the terminal consumer and restore the previous mode.
    pub fn leave_terminal(&mut self) -> Result<()> {
        if self.state == ConnectionState::TerminalMode {
            self.state.advance(self.resume)?;
        }
        Ok(())
    }

    /// Return the device to the friendly prompt. Best effort, used on the
    /// way out.
    pub async fn exit_raw(&mut self) -> Result<()> {
        if self.state.is_raw() {
            self.send(&[CTRL_B]).await?;
            self.state.advance(ConnectionState::FriendlyRepl)?;
        }
        Ok(())
    }

    /// Soft-reset the device. It will drop the link, so no reply is read.
    pub async fn soft_reset(&mut self) -> Result<()> {
        self.send(&[CTRL_B]).await?;
        self.send(&[CTRL_D]).await
    }

    /// Pulse the control lines for a hard reset; falls back to the soft
    /// path on links without control lines.
    pub async fn hard_reset(&mut self) -> Result<()> {
        match self.transport.pulse_reset().await {
            Ok(true) => Ok(()),
            Ok(false) => self.soft_reset().await,
            Err(e) => {
                debug!("reset pulse failed: {e}");
                Err(Error::ConnectionLost)
            }
        }
    }

    pub async fn close_transport(&mut self) {
        let _ = self.state.advance(ConnectionState::Closing);
        if let Err(e) = self.transport.close().await {
            debug!("transport close failed: {e}");
        }
        let _ = self.state.advance(ConnectionState::Closed);
    }

    async fn login(&mut self, password: &str) -> Result<()> {
        self.wait_handshake("password prompt", |buf| {
            buf.take_until(PASSWORD_PROMPT).map(drop)
        })
        .await?;
        self.send(password.as_bytes()).await?;
        self.send(b"\r\n").await?;

        // The device answers with a `WebREPL connected` line on success and
        // `Access denied` (or drops the link) on a wrong password. Echoed
        // input lines in between are skipped.
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let line = match time::timeout_at(deadline, self.buffer.wait_for(|buf| buf.take_line()))
                .await
            {
                Ok(Ok(line)) => line,
                Ok(Err(Error::ConnectionLost)) => return Err(Error::AuthFailed),
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::HandshakeFailed(
                        "timed out waiting for WebREPL login reply".into(),
                    ));
                }
            };
            if memmem::find(&line, WEBREPL_CONNECTED).is_some() {
                return Ok(());
            }
            if memmem::find(&line, ACCESS_DENIED).is_some() {
                return Err(Error::AuthFailed);
            }
        }
    }

    async fn enter_raw(&mut self) -> Result<()> {
        // Interrupt twice to stop any running program, then wait for the
        // friendly prompt to quiesce before switching modes.
        self.send(&[b'\r', CTRL_C, CTRL_C]).await?;
        self.wait_handshake("friendly prompt", |buf| {
            buf.take_until(FRIENDLY_PROMPT).map(drop)
        })
        .await?;
        self.buffer.clear();
        self.send(&[CTRL_A]).await?;
        self.wait_handshake("raw REPL banner", |buf| buf.take_until(RAW_BANNER).map(drop))
            .await?;
        self.state.advance(ConnectionState::RawRepl)
    }

    /// Probe for window-flow-controlled raw-paste support. `R\x01` means
    /// yes and opens a paste session, which is finished off as an empty
    /// script; `R\x00` means understood-but-disabled. Anything else is an
    /// older firmware that buffered the probe as program input, so an
    /// interrupt clears it and the engine stays on the plain raw path.
    async fn probe_raw_paste(&mut self) -> Result<()> {
        self.send(RAW_PASTE_PROBE).await?;
        let answer = time::timeout(
            HANDSHAKE_TIMEOUT,
            self.buffer.wait_for(|buf| buf.peek(2).map(<[u8]>::to_vec)),
        )
        .await;
        match answer {
            Ok(Ok(two)) if two == b"R\x01" => {
                self.buffer.with(|buf| buf.consume(2));
                let _ = self.read_paste_window().await?;
                self.send(&[CTRL_D]).await?;
                self.read_ok(true).await?;
                let mut sink = None;
                Self::collect(&self.buffer, &mut sink).await?;
                self.raw_paste = true;
                self.state.advance(ConnectionState::RawPasteRepl)
            }
            Ok(Ok(two)) if two == b"R\x00" => {
                debug!("device disables raw-paste");
                self.buffer.with(|buf| buf.consume(2));
                Ok(())
            }
            Ok(Ok(_)) | Err(_) => {
                debug!("no raw-paste support detected");
                self.send(&[CTRL_C]).await?;
                let _ = time::timeout(
                    INTERRUPT_DRAIN_TIMEOUT,
                    self.buffer
                        .wait_for(|buf| buf.find(&[PROMPT]).map(|at| buf.consume(at + 1))),
                )
                .await;
                self.buffer.clear();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// Send the prepared source and consume the `OK` acknowledgement.
    async fn submit(&mut self, prepared: &[u8]) -> Result<()> {
        let pasted = if self.raw_paste {
            self.paste_submit(prepared).await?
        } else {
            false
        };
        if !pasted {
            self.send(prepared).await?;
            self.send(&[CTRL_D]).await?;
        }
        self.read_ok(pasted).await
    }

    /// Window-flow-controlled source upload. Returns `false` when the
    /// device declines this paste session, in which case the caller falls
    /// back to the plain raw path.
    async fn paste_submit(&mut self, prepared: &[u8]) -> Result<bool> {
        self.send(RAW_PASTE_PROBE).await?;
        let two = self
            .wait_handshake("raw-paste session header", |buf| {
                let header = buf.peek(2)?.to_vec();
                buf.consume(2);
                Some(header)
            })
            .await?;
        match &two[..] {
            b"R\x01" => {}
            b"R\x00" => return Ok(false),
            other => {
                return Err(Error::InvalidResponse(format!(
                    "unexpected raw-paste header {other:02x?}"
                )));
            }
        }

        let increment = self.read_paste_window().await? as usize;
        let mut window = increment;
        let mut sent = 0;
        while sent < prepared.len() {
            // Absorb pending acknowledgements without blocking; block only
            // once the window is exhausted. A device `\x04` aborts input.
            let pending = self.buffer.with(|buf| {
                let byte = buf.peek(1)?[0];
                buf.consume(1);
                Some(byte)
            });
            let byte = match pending {
                Some(byte) => Some(byte),
                None if window == 0 => Some(self.next_byte().await?),
                None => None,
            };
            match byte {
                Some(PASTE_ACK) => {
                    window += increment;
                    continue;
                }
                Some(EOT) => {
                    debug!("device aborted raw-paste input after {sent} bytes");
                    self.send(&[CTRL_D]).await?;
                    return Ok(true);
                }
                Some(other) => {
                    return Err(Error::InvalidResponse(format!(
                        "unexpected byte {other:#04x} during raw-paste input"
                    )));
                }
                None => {}
            }
            let n = window.min(prepared.len() - sent);
            self.send(&prepared[sent..sent + n]).await?;
            sent += n;
            window -= n;
        }
        self.send(&[CTRL_D]).await?;
        Ok(true)
    }

    /// Parse the response frame after `OK`: stdout, `\x04`, stderr, `\x04`,
    /// `>`. Both sentinels are removed from the emitted sections.
    pub(crate) async fn collect(
        buffer: &SharedBuffer,
        streaming: &mut Option<StreamingCallback>,
    ) -> Result<ScriptResponse> {
        let stdout = Self::read_section(buffer, streaming).await?;
        let stderr = Self::read_section(buffer, streaming).await?;
        Self::read_prompt(buffer).await?;
        Ok(ScriptResponse::from_raw(stdout, stderr))
    }

    pub(crate) fn shared_buffer(&self) -> Arc<SharedBuffer> {
        self.buffer.clone()
    }

    /// Interrupt the current request and consume the response tail through
    /// the prompt, leaving the device ready for the next request.
    ///
    /// A request interrupted mid-response still produces the closing
    /// `\x04>` pair; bare `>` inside traceback text like `<stdin>` must
    /// not end the drain. A request interrupted before the device started
    /// answering only reprints the prompt, hence the fallback.
    async fn interrupt(&mut self) -> Result<()> {
        self.send(&[CTRL_C]).await?;
        let tail = time::timeout(
            INTERRUPT_DRAIN_TIMEOUT,
            self.buffer
                .wait_for(|buf| buf.take_until(&[EOT, PROMPT]).map(drop)),
        )
        .await;
        if let Ok(result) = tail {
            return result.map(drop);
        }
        let prompt = time::timeout(
            INTERRUPT_DRAIN_TIMEOUT,
            self.buffer
                .wait_for(|buf| buf.take_until(&[PROMPT]).map(drop)),
        )
        .await;
        match prompt {
            Ok(result) => result.map(drop),
            Err(_) => Err(Error::InvalidResponse("no prompt after interrupt".into())),
        }
    }

    /// Consume the `OK` acknowledgement opening a response frame. After a
    /// paste upload the device may still have window acks in flight; those
    /// always precede the acknowledgement and are dropped here.
    async fn read_ok(&self, skip_acks: bool) -> Result<()> {
        let head = self
            .buffer
            .wait_for(|buf| {
                if skip_acks {
                    while buf.peek(1).is_some_and(|head| head[0] == PASTE_ACK) {
                        buf.consume(1);
                    }
                }
                let head = buf.peek(2)?.to_vec();
                buf.consume(2);
                Some(head)
            })
            .await?;
        if head == b"OK" {
            Ok(())
        } else {
            Err(Error::InvalidResponse(format!(
                "expected OK acknowledgement, got {head:02x?}"
            )))
        }
    }

    async fn read_section(
        buffer: &SharedBuffer,
        streaming: &mut Option<StreamingCallback>,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let (chunk, done) = buffer
                .wait_for(|buf| match buf.take_until(&[EOT]) {
                    Some(head) => Some((head, true)),
                    None if buf.is_empty() => None,
                    None => Some((buf.take_all(), false)),
                })
                .await?;
            if !chunk.is_empty() {
                if let Some(sink) = streaming.as_mut() {
                    sink(&chunk);
                }
                out.extend_from_slice(&chunk);
            }
            if done {
                return Ok(out);
            }
        }
    }

    async fn read_prompt(buffer: &SharedBuffer) -> Result<()> {
        let byte = buffer
            .wait_for(|buf| {
                let byte = buf.peek(1)?[0];
                buf.consume(1);
                Some(byte)
            })
            .await?;
        if byte == PROMPT {
            Ok(())
        } else {
            Err(Error::InvalidResponse(format!(
                "expected prompt, got {byte:#04x}"
            )))
        }
    }

    async fn read_paste_window(&self) -> Result<u16> {
        let raw = self
            .wait_handshake("raw-paste window size", |buf| {
                let raw = buf.peek(2)?.to_vec();
                buf.consume(2);
                Some(raw)
            })
            .await?;
        let window = u16::from_le_bytes([raw[0], raw[1]]);
        if window == 0 {
            return Err(Error::InvalidResponse("zero raw-paste window".into()));
        }
        trace!("raw-paste window increment: {window}");
        Ok(window)
    }

    async fn next_byte(&self) -> Result<u8> {
        self.buffer
            .wait_for(|buf| {
                let byte = buf.peek(1)?[0];
                buf.consume(1);
                Some(byte)
            })
            .await
    }

    async fn wait_handshake<T>(
        &self,
        what: &str,
        pred: impl FnMut(&mut crate::buffer::ReceiveBuffer) -> Option<T>,
    ) -> Result<T> {
        match time::timeout(HANDSHAKE_TIMEOUT, self.buffer.wait_for(pred)).await {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeFailed(format!(
                "timed out waiting for {what}"
            ))),
        }
    }
}

/// Prepare a source string for transmission.
pub(crate) fn prepare_source(source: &str, disable_dedent: bool) -> Vec<u8> {
    let prepared = if disable_dedent {
        source.to_owned()
    } else {
        dedent(source)
    };
    prepared.into_bytes()
}

/// Race `work` against the caller's cancel handle and deadline.
async fn bounded<F>(
    work: &mut std::pin::Pin<&mut F>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
) -> Outcome<F::Output>
where
    F: Future,
{
    let canceled = async {
        match &cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let timed_out = async {
        match deadline {
            Some(at) => time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = work.as_mut() => Outcome::Done(result),
        _ = canceled => Outcome::Canceled,
        _ = timed_out => Outcome::TimedOut,
    }
}
