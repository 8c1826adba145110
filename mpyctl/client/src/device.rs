//! The public device client.

use crate::{
    buffer::SharedBuffer,
    conn::{Connection, prepare_source},
    error::{Error, Result},
    fs::{self, FileEntry, StatResult},
    script::{Resolve, RunScriptOptions, ScriptResponse},
    transport::{SerialTransport, Transport, WebSocketTransport},
};
use parking_lot::Mutex as SyncMutex;
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{
    sync::{Mutex, OwnedMutexGuard, mpsc::UnboundedReceiver},
    task,
    time::Instant,
};
use tracing::{Instrument, debug, debug_span};

/// Consumer of decoded terminal bytes.
pub type TerminalDataCallback = Box<dyn FnMut(&[u8]) + Send>;
/// Invoked exactly once when an established link closes, however it closes.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// One connection to one MicroPython device.
///
/// Cheap to clone; all clones share the same link. Requests are serialized
/// first-in-first-out: at most one script is outstanding at any time and
/// every other caller queues behind it.
#[derive(Clone, Default)]
pub struct Device {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    conn: Arc<Mutex<Option<Connection>>>,
    connected: Arc<AtomicBool>,
    /// The handshake completed at some point on the current link, so the
    /// close callback is owed exactly one invocation.
    established: Arc<AtomicBool>,
    terminal: Arc<AtomicBool>,
    close_fired: Arc<AtomicBool>,
    callbacks: Arc<SyncMutex<Callbacks>>,
}

#[derive(Default)]
struct Callbacks {
    on_terminal_data: Option<TerminalDataCallback>,
    on_close: Option<CloseCallback>,
}

impl Device {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect over USB serial and drive the REPL into raw mode.
    pub async fn connect_serial(&self, path: &str, baud: u32) -> Result<()> {
        let (transport, inbound) = SerialTransport::connect(path, baud).await?;
        self.attach(Box::new(transport), inbound, None).await
    }

    /// Connect to a WebREPL daemon, log in and drive the REPL into raw mode.
    pub async fn connect_network(&self, host: &str, password: &str) -> Result<()> {
        let (transport, inbound) = WebSocketTransport::connect(host).await?;
        self.attach(Box::new(transport), inbound, Some(password)).await
    }

    /// Attach a caller-provided transport. `inbound` must deliver the
    /// device's bytes in arrival order; `password` enables the
    /// WebREPL-style login handshake.
    pub async fn connect_with(
        &self,
        transport: Box<dyn Transport>,
        inbound: UnboundedReceiver<Vec<u8>>,
        password: Option<&str>,
    ) -> Result<()> {
        self.attach(transport, inbound, password).await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_terminal_mode(&self) -> bool {
        self.inner.terminal.load(Ordering::SeqCst)
    }

    /// Send `Ctrl-B` to land the device back on the friendly prompt, then
    /// drop the link. No-op when already closed.
    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.inner.conn.clone().lock_owned().await;
        if let Some(conn) = guard.as_mut() {
            let _ = conn.exit_raw().await;
            teardown(&self.inner, &mut guard).await;
        }
        Ok(())
    }

    /// Reset the device. Soft resets send `Ctrl-D`; hard resets pulse the
    /// serial control lines. Either way the device drops the link, so the
    /// connection is torn down without awaiting a reply.
    pub async fn reset(&self, soft: bool) -> Result<()> {
        let mut guard = self.inner.conn.clone().lock_owned().await;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        let result = if soft {
            conn.soft_reset().await
        } else {
            conn.hard_reset().await
        };
        teardown(&self.inner, &mut guard).await;
        result
    }

    /// Run a Python snippet on the device and return its framed response.
    ///
    /// Requests complete in submission order. A remote exception is a
    /// normal outcome reported in [`ScriptResponse::exception`], not an
    /// error; the link stays in raw mode ready for the next request.
    pub async fn run_script(
        &self,
        source: &str,
        mut opts: RunScriptOptions,
    ) -> Result<ScriptResponse> {
        let prepared = prepare_source(source, opts.disable_dedent);
        let deadline = opts.timeout.map(|timeout| Instant::now() + timeout);

        let mut guard = self.inner.conn.clone().lock_owned().await;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };

        // Route bytes to the protocol buffer for the duration of the
        // request; an attached terminal consumer receives nothing.
        let was_terminal = self.inner.terminal.swap(false, Ordering::SeqCst);
        if was_terminal {
            conn.leave_terminal()?;
        }

        let result = match conn.ensure_raw().await {
            Err(e) => Err(e),
            Ok(()) => match opts.resolve {
                Resolve::OnCompletion => {
                    conn.run_script(&prepared, deadline, opts.cancel.clone(), &mut opts.streaming)
                        .await
                }
                Resolve::FirstPrompt => {
                    match conn.submit_bounded(&prepared, deadline, opts.cancel.clone()).await {
                        Ok(()) => {
                            self.spawn_tail_drain(guard, opts.streaming.take(), was_terminal);
                            return Ok(ScriptResponse::default());
                        }
                        Err(e) => Err(e),
                    }
                }
            },
        };

        match &result {
            Err(Error::ConnectionLost | Error::InvalidResponse(_) | Error::HandshakeFailed(_)) => {
                teardown(&self.inner, &mut guard).await;
            }
            _ => {
                if was_terminal
                    && let Some(conn) = guard.as_mut()
                {
                    let _ = conn.enter_terminal();
                    self.inner.terminal.store(true, Ordering::SeqCst);
                }
            }
        }
        result
    }

    /// Forward every inbound byte to the terminal consumer until
    /// [`Device::leave_terminal`]. The engine does no local echo.
    pub async fn enter_terminal(&self) -> Result<()> {
        let mut guard = self.inner.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        conn.enter_terminal()?;
        self.inner.terminal.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Detach the terminal consumer and restore protocol routing.
    pub async fn leave_terminal(&self) -> Result<()> {
        let mut guard = self.inner.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            conn.leave_terminal()?;
        }
        self.inner.terminal.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Send raw keystrokes to the device. Control bytes pass through
    /// verbatim; intercepting a local quit key is the caller's business.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(Error::NotConnected);
        };
        conn.send(data).await
    }

    /// Register the terminal consumer.
    pub fn on_terminal_data(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        self.inner.callbacks.lock().on_terminal_data = Some(Box::new(callback));
    }

    /// Register the close callback, invoked exactly once per established
    /// link.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.callbacks.lock().on_close = Some(Box::new(callback));
    }

    /// List directory entries, sorted by path.
    pub async fn list_files(&self, dir: &str, recursive: bool) -> Result<Vec<FileEntry>> {
        let response = self.run_fs(fs::ls_script(dir, recursive)).await?;
        fs::parse_listing(&response.stdout)
    }

    /// Stat a remote path. Missing paths report `exists: false` instead of
    /// an error.
    pub async fn stat_path(&self, path: &str) -> Result<StatResult> {
        let response = self.run_fs(fs::stat_script(path)).await?;
        fs::parse_stat(&response.stdout)
    }

    /// Download a file. Bytes travel base64-encoded over the REPL channel.
    pub async fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        let response = self.run_fs(fs::get_script(path)).await?;
        fs::parse_b64_stream(&response.stdout)
    }

    /// Upload a file, replacing any existing content.
    pub async fn put_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.run_fs(fs::put_script(path, data)).await.map(drop)
    }

    /// SHA-256 of a remote file as lowercase hex.
    pub async fn get_file_hash(&self, path: &str) -> Result<String> {
        let response = self.run_fs(fs::hash_script(path)).await?;
        fs::parse_hash(&response.stdout)
    }

    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.run_fs(fs::mkdir_script(path)).await.map(drop)
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.run_fs(fs::rename_script(old, new)).await.map(drop)
    }

    /// Delete a file or directory. With `recursive`, directories are
    /// walked once and removed bottom-up, children before parents.
    pub async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        if recursive && self.stat_path(path).await?.is_dir {
            let mut entries = self.list_files(path, true).await?;
            fs::deepest_first(&mut entries);
            for entry in &entries {
                self.run_fs(fs::remove_script(&entry.filename)).await?;
            }
        }
        self.run_fs(fs::remove_script(path)).await.map(drop)
    }

    /// Recursive copy of a remote directory to the local filesystem. The
    /// tree is listed once, directories are created before their children
    /// and each regular file is fetched with one `get_file`.
    pub async fn download_tree(&self, src: &str, dest: &Path) -> Result<Vec<FileEntry>> {
        let entries = self.list_files(src, true).await?;
        tokio::fs::create_dir_all(dest).await?;
        for entry in &entries {
            let relative = entry
                .filename
                .strip_prefix(src)
                .unwrap_or(&entry.filename)
                .trim_start_matches('/');
            let target = dest.join(relative);
            if entry.is_dir {
                tokio::fs::create_dir_all(&target).await?;
            } else {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let data = self.get_file(&entry.filename).await?;
                tokio::fs::write(&target, data).await?;
            }
        }
        Ok(entries)
    }

    /// Run a filesystem snippet, translating remote exceptions into typed
    /// errors. Recognized `OSError`s become [`Error::RemoteOs`]; the raw
    /// traceback is preserved on the value either way.
    async fn run_fs(&self, script: String) -> Result<ScriptResponse> {
        let opts = RunScriptOptions {
            disable_dedent: true,
            ..Default::default()
        };
        let response = self.run_script(&script, opts).await?;
        if let Some(exception) = response.exception.clone() {
            return Err(Error::from_remote(exception, response.stderr));
        }
        Ok(response)
    }

    async fn attach(
        &self,
        transport: Box<dyn Transport>,
        inbound: UnboundedReceiver<Vec<u8>>,
        password: Option<&str>,
    ) -> Result<()> {
        let mut guard = self.inner.conn.clone().lock_owned().await;
        if guard.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let buffer = Arc::new(SharedBuffer::default());
        self.inner.terminal.store(false, Ordering::SeqCst);
        self.inner.established.store(false, Ordering::SeqCst);
        self.inner.close_fired.store(false, Ordering::SeqCst);
        task::spawn(
            route_inbound(
                inbound,
                buffer.clone(),
                self.inner.terminal.clone(),
                self.inner.established.clone(),
                self.inner.close_fired.clone(),
                self.inner.connected.clone(),
                self.inner.callbacks.clone(),
            )
            .instrument(debug_span!("router")),
        );

        let mut conn = Connection::new(transport, buffer);
        match conn.open(password).await {
            Ok(()) => {
                debug!("device ready in state {}", conn.state());
                self.inner.connected.store(true, Ordering::SeqCst);
                self.inner.established.store(true, Ordering::SeqCst);
                *guard = Some(conn);
                Ok(())
            }
            Err(e) => {
                conn.close_transport().await;
                Err(e)
            }
        }
    }

    /// Drain the response tail of a first-prompt request in the background
    /// while keeping the request lock, so submission order survives early
    /// resolution.
    fn spawn_tail_drain(
        &self,
        mut guard: OwnedMutexGuard<Option<Connection>>,
        mut streaming: Option<crate::script::StreamingCallback>,
        restore_terminal: bool,
    ) {
        let inner = self.inner.clone();
        task::spawn(
            async move {
                let buffer = match guard.as_mut() {
                    Some(conn) => conn.shared_buffer(),
                    None => return,
                };
                match Connection::collect(&buffer, &mut streaming).await {
                    Ok(_) => {
                        if restore_terminal
                            && let Some(conn) = guard.as_mut()
                        {
                            let _ = conn.enter_terminal();
                            inner.terminal.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => {
                        // Typically the device resetting and dropping the
                        // link before finishing the frame.
                        debug!("response tail drain ended: {e}");
                        teardown(&inner, &mut guard).await;
                    }
                }
            }
            .instrument(debug_span!("drain_tail")),
        );
    }
}

/// Close the link and clear the connection slot. The close callback fires
/// through the router when the inbound channel drains.
async fn teardown(inner: &Arc<Inner>, guard: &mut OwnedMutexGuard<Option<Connection>>) {
    if let Some(mut conn) = guard.take() {
        conn.close_transport().await;
    }
    inner.connected.store(false, Ordering::SeqCst);
    inner.terminal.store(false, Ordering::SeqCst);
}

/// Deliver inbound chunks to exactly one consumer: the protocol buffer, or
/// the terminal callback while a terminal is attached and no request is
/// pending. Channel exhaustion is the close event.
async fn route_inbound(
    mut inbound: UnboundedReceiver<Vec<u8>>,
    buffer: Arc<SharedBuffer>,
    terminal: Arc<AtomicBool>,
    established: Arc<AtomicBool>,
    close_fired: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    callbacks: Arc<SyncMutex<Callbacks>>,
) {
    while let Some(chunk) = inbound.recv().await {
        if terminal.load(Ordering::SeqCst) {
            let mut callbacks = callbacks.lock();
            if let Some(on_data) = callbacks.on_terminal_data.as_mut() {
                on_data(&chunk);
            }
            // A terminal with no registered consumer drops the bytes.
        } else {
            buffer.push(&chunk);
        }
    }
    debug!("inbound channel closed");
    connected.store(false, Ordering::SeqCst);
    buffer.close();
    if established.load(Ordering::SeqCst) && !close_fired.swap(true, Ordering::SeqCst) {
        let on_close = callbacks.lock().on_close.take();
        if let Some(on_close) = on_close {
            on_close();
        }
    }
}
