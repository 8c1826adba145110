//! An in-process device emulator speaking the raw REPL wire protocol,
//! plugged in behind the public transport seam.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use mpyctl_client::{Device, Transport, TransportError, TransportKind};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How the emulator answers the raw-paste probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeReply {
    /// `R\x01` plus a window advertisement.
    Supported,
    /// `R\x00`: understood but disabled.
    Disabled,
    /// No answer at all, like firmware that predates the probe.
    Silent,
}

#[derive(Clone, Debug)]
pub struct FakeConfig {
    pub password: Option<String>,
    pub probe_reply: ProbeReply,
    /// Raw-paste window increment advertised per session.
    pub window: u16,
    /// Preloaded filesystem: path to file contents or `None` for a dir.
    pub files: Vec<(String, Option<Vec<u8>>)>,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            password: None,
            probe_reply: ProbeReply::Supported,
            window: 256,
            files: Vec::new(),
        }
    }
}

impl FakeConfig {
    pub fn with_files(files: &[(&str, Option<&[u8]>)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(path, data)| ((*path).to_owned(), data.map(<[u8]>::to_vec)))
                .collect(),
            ..Self::default()
        }
    }
}

/// Spawn the emulator task and hand back its transport seam.
pub fn spawn_device(config: FakeConfig) -> (Box<dyn Transport>, UnboundedReceiver<Vec<u8>>) {
    let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
    tokio::spawn(device_task(config, to_device_rx, to_host_tx));
    (
        Box::new(FakeTransport {
            to_device: Some(to_device_tx),
        }),
        to_host_rx,
    )
}

/// Connect a fresh [`Device`] to a spawned emulator.
pub async fn connect(config: FakeConfig) -> Device {
    let password = config.password.clone();
    let (transport, inbound) = spawn_device(config);
    let device = Device::new();
    device
        .connect_with(transport, inbound, password.as_deref())
        .await
        .expect("connect to emulator");
    device
}

static FAKE_KIND: TransportKind = TransportKind::Network {
    host: String::new(),
};

struct FakeTransport {
    to_device: Option<UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.to_device
            .as_ref()
            .ok_or(TransportError::PeerClosed)?
            .send(data.to_vec())
            .map_err(|_| TransportError::PeerClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.to_device.take();
        Ok(())
    }

    fn kind(&self) -> &TransportKind {
        &FAKE_KIND
    }
}

async fn device_task(
    config: FakeConfig,
    mut inbound: UnboundedReceiver<Vec<u8>>,
    outbound: UnboundedSender<Vec<u8>>,
) {
    let mut emulator = Emulator::new(config, outbound);
    emulator.start();
    while let Some(chunk) = inbound.recv().await {
        emulator.input.extend(chunk);
        if !emulator.process() {
            break;
        }
    }
    // Dropping the outbound sender is the close event the host observes.
}

#[derive(Debug)]
enum Mode {
    Login { line: Vec<u8> },
    Friendly,
    RawIdle,
    Probe { got: usize },
    PasteRecv { body: Vec<u8>, since_ack: usize },
    Running,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Node {
    Dir,
    File(Vec<u8>),
}

const TRACEBACK_HEAD: &str =
    "Traceback (most recent call last):\n  File \"<stdin>\", line 1, in <module>\n";

struct Emulator {
    config: FakeConfig,
    outbound: UnboundedSender<Vec<u8>>,
    input: VecDeque<u8>,
    mode: Mode,
    source: Vec<u8>,
    files: BTreeMap<String, Node>,
}

impl Emulator {
    fn new(config: FakeConfig, outbound: UnboundedSender<Vec<u8>>) -> Self {
        let files = config
            .files
            .iter()
            .map(|(path, data)| {
                let node = match data {
                    Some(data) => Node::File(data.clone()),
                    None => Node::Dir,
                };
                (path.clone(), node)
            })
            .collect();
        let mode = if config.password.is_some() {
            Mode::Login { line: Vec::new() }
        } else {
            Mode::Friendly
        };
        Self {
            config,
            outbound,
            input: VecDeque::new(),
            mode,
            source: Vec::new(),
            files,
        }
    }

    fn start(&mut self) {
        if self.config.password.is_some() {
            self.send(b"Password: ");
        }
    }

    fn send(&mut self, data: &[u8]) {
        let _ = self.outbound.send(data.to_vec());
    }

    /// Send in small pieces so the host exercises chunk reassembly.
    fn send_chunked(&mut self, data: &[u8]) {
        for piece in data.chunks(16) {
            self.send(piece);
        }
    }

    /// Consume buffered input; `false` ends the connection.
    fn process(&mut self) -> bool {
        while let Some(byte) = self.input.pop_front() {
            let mode = std::mem::replace(&mut self.mode, Mode::Friendly);
            match self.step(mode, byte) {
                Some(next) => self.mode = next,
                None => return false,
            }
        }
        true
    }

    /// One byte through the device state machine; `None` drops the link.
    fn step(&mut self, mode: Mode, byte: u8) -> Option<Mode> {
        Some(match mode {
            Mode::Login { mut line } => {
                if byte != b'\n' {
                    line.push(byte);
                    return Some(Mode::Login { line });
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let expected = self.config.password.clone().unwrap_or_default();
                if line == expected.as_bytes() {
                    self.send(b"\r\nWebREPL connected\r\n>>> ");
                    Mode::Friendly
                } else {
                    self.send(b"\r\nAccess denied\r\n");
                    return None;
                }
            }
            Mode::Friendly => match byte {
                0x03 => {
                    self.send(b"\r\nKeyboardInterrupt\r\n>>> ");
                    Mode::Friendly
                }
                0x01 => {
                    self.send(b"raw REPL; CTRL-B to exit\r\n>");
                    self.source.clear();
                    Mode::RawIdle
                }
                0x04 => return None, // soft reset drops the link
                _ => Mode::Friendly,
            },
            Mode::RawIdle => match byte {
                0x05 if self.source.is_empty() => Mode::Probe { got: 1 },
                0x04 => {
                    let source = std::mem::take(&mut self.source);
                    self.execute(&source)
                }
                0x03 => {
                    self.source.clear();
                    self.send(b">");
                    Mode::RawIdle
                }
                0x02 => {
                    self.send(
                        b"\r\nMicroPython emulator\r\nType \"help()\" for more information.\r\n>>> ",
                    );
                    self.source.clear();
                    Mode::Friendly
                }
                other => {
                    self.source.push(other);
                    Mode::RawIdle
                }
            },
            Mode::Probe { got } => match (byte, got) {
                (b'A', 1) => Mode::Probe { got: 2 },
                (0x01, 2) => match self.config.probe_reply {
                    ProbeReply::Supported => {
                        let [lo, hi] = self.config.window.to_le_bytes();
                        self.send(&[b'R', 0x01, lo, hi]);
                        Mode::PasteRecv {
                            body: Vec::new(),
                            since_ack: 0,
                        }
                    }
                    ProbeReply::Disabled => {
                        self.send(b"R\x00");
                        Mode::RawIdle
                    }
                    ProbeReply::Silent => {
                        self.source.extend([0x05, b'A', 0x01]);
                        Mode::RawIdle
                    }
                },
                (other, _) => {
                    self.source.push(0x05);
                    self.source.push(other);
                    Mode::RawIdle
                }
            },
            Mode::PasteRecv {
                mut body,
                mut since_ack,
            } => {
                if byte == 0x04 {
                    return Some(self.execute(&body));
                }
                body.push(byte);
                since_ack += 1;
                if since_ack >= self.config.window as usize {
                    since_ack = 0;
                    self.send(&[0x01]);
                }
                Mode::PasteRecv { body, since_ack }
            }
            Mode::Running => {
                if byte == 0x03 {
                    self.send(b"\x04Traceback (most recent call last):\n  File \"<stdin>\", line 2, in <module>\nKeyboardInterrupt: \n\x04>");
                    Mode::RawIdle
                } else {
                    Mode::Running
                }
            }
        })
    }

    fn execute(&mut self, source: &[u8]) -> Mode {
        let text = String::from_utf8_lossy(source).into_owned();
        if text.contains("while True") && text.contains("time.sleep") {
            self.send(b"OK");
            return Mode::Running;
        }
        let (stdout, stderr) = self.evaluate(&text);
        self.send(b"OK");
        self.send_chunked(&stdout);
        self.send(&[0x04]);
        self.send_chunked(&stderr);
        self.send(&[0x04, b'>']);
        Mode::RawIdle
    }

    fn evaluate(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let text = text.trim_end_matches('\n');
        if text.is_empty() {
            return (Vec::new(), Vec::new());
        }
        if text == "print(2+3)" {
            return (b"5\n".to_vec(), Vec::new());
        }
        if let Some(inner) = text
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
            && let Ok(value) = inner.parse::<i64>()
        {
            return (format!("{value}\n").into_bytes(), Vec::new());
        }
        if text == "raise ValueError('x')" {
            return (
                Vec::new(),
                format!("{TRACEBACK_HEAD}ValueError: x\n").into_bytes(),
            );
        }
        if let Some(rest) = text.strip_prefix("for i in range(")
            && let Some(end) = rest.find(')')
            && let Ok(n) = rest[..end].parse::<u64>()
        {
            let mut stdout = String::new();
            for i in 0..n {
                stdout.push_str(&format!("{i}\n"));
            }
            return (stdout.into_bytes(), Vec::new());
        }
        if text.starts_with("import os\ndef _ls(") {
            return self.eval_listing(text);
        }
        if text.starts_with("import os\ntry:") && text.contains("os.stat(") {
            return self.eval_stat(text);
        }
        if text.contains("b2a_base64") {
            return self.eval_get(text);
        }
        if text.contains("a2b_base64") {
            return self.eval_put(text);
        }
        if text.contains("uhashlib") {
            return self.eval_hash(text);
        }
        if text.contains("os.mkdir(") {
            return self.eval_mkdir(text);
        }
        if text.contains("os.rename(") {
            return self.eval_rename(text);
        }
        if text.contains("os.remove(") {
            return self.eval_remove(text);
        }
        (
            Vec::new(),
            format!("{TRACEBACK_HEAD}RuntimeError: unsupported script\n").into_bytes(),
        )
    }

    fn eval_listing(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let Some(call) = text.rfind("_ls(").map(|at| &text[at..]) else {
            return os_error(2, "ENOENT");
        };
        let dir = quoted(call).into_iter().next().unwrap_or_default();
        let recursive = call.contains("True");
        if !self.is_dir(&dir) {
            return os_error(2, "ENOENT");
        }
        let mut out = String::new();
        self.walk(&dir, recursive, &mut out);
        (out.into_bytes(), Vec::new())
    }

    fn eval_stat(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let path = first_quoted(text);
        let line = match self.files.get(&path) {
            Some(Node::Dir) => "1,1,0,100,200".to_owned(),
            Some(Node::File(data)) => format!("1,0,{},100,200", data.len()),
            None if path == "/" => "1,1,0,100,200".to_owned(),
            None => "0,0,0,0,0".to_owned(),
        };
        (format!("{line}\n").into_bytes(), Vec::new())
    }

    fn eval_get(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let path = first_quoted(text);
        let Some(Node::File(data)) = self.files.get(&path).cloned() else {
            return os_error(2, "ENOENT");
        };
        let mut stdout = String::new();
        for chunk in data.chunks(1024) {
            stdout.push_str(&BASE64.encode(chunk));
            stdout.push('\n');
        }
        stdout.push('\n');
        (stdout.into_bytes(), Vec::new())
    }

    fn eval_put(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let args = quoted(text);
        let Some(path) = args.first().cloned() else {
            return os_error(2, "ENOENT");
        };
        if !self.parent_exists(&path) {
            return os_error(2, "ENOENT");
        }
        let mut data = Vec::new();
        for payload in args.iter().skip(2) {
            match BASE64.decode(payload) {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(_) => {
                    return (
                        Vec::new(),
                        format!("{TRACEBACK_HEAD}ValueError: invalid base64\n").into_bytes(),
                    );
                }
            }
        }
        self.files.insert(path, Node::File(data));
        (Vec::new(), Vec::new())
    }

    fn eval_hash(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let path = first_quoted(text);
        let Some(Node::File(data)) = self.files.get(&path) else {
            return os_error(2, "ENOENT");
        };
        let digest = Sha256::digest(data);
        (format!("{digest:x}\n").into_bytes(), Vec::new())
    }

    fn eval_mkdir(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let path = first_quoted(text);
        if self.files.contains_key(&path) || path == "/" {
            return os_error(17, "EEXIST");
        }
        if !self.parent_exists(&path) {
            return os_error(2, "ENOENT");
        }
        self.files.insert(path, Node::Dir);
        (Vec::new(), Vec::new())
    }

    fn eval_rename(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let args = quoted(text);
        let [old, new] = &args[..] else {
            return os_error(2, "ENOENT");
        };
        let Some(node) = self.files.remove(old) else {
            return os_error(2, "ENOENT");
        };
        if node == Node::Dir {
            let prefix = format!("{old}/");
            let moved: Vec<_> = self
                .files
                .range(prefix.clone()..)
                .take_while(|(path, _)| path.starts_with(&prefix))
                .map(|(path, node)| (path.clone(), node.clone()))
                .collect();
            for (path, node) in moved {
                self.files.remove(&path);
                self.files
                    .insert(format!("{new}{}", &path[old.len()..]), node);
            }
        }
        self.files.insert(new.clone(), node);
        (Vec::new(), Vec::new())
    }

    fn eval_remove(&mut self, text: &str) -> (Vec<u8>, Vec<u8>) {
        let path = first_quoted(text);
        match self.files.get(&path) {
            None => os_error(2, "ENOENT"),
            Some(Node::Dir) if self.has_children(&path) => os_error(39, "ENOTEMPTY"),
            Some(_) => {
                self.files.remove(&path);
                (Vec::new(), Vec::new())
            }
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.files.get(path), Some(Node::Dir))
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rfind('/') {
            Some(0) | None => true,
            Some(at) => self.is_dir(&path[..at]),
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.files.keys().any(|other| other.starts_with(&prefix))
    }

    fn walk(&mut self, dir: &str, recursive: bool, out: &mut String) {
        let prefix = if dir == "/" {
            "/".to_owned()
        } else {
            format!("{dir}/")
        };
        let children: Vec<(String, Node)> = self
            .files
            .iter()
            .filter(|(path, _)| {
                path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect();
        for (path, node) in children {
            match node {
                Node::Dir => {
                    out.push_str(&format!("{path} | d | 0\n"));
                    if recursive {
                        self.walk(&path, recursive, out);
                    }
                }
                Node::File(data) => {
                    out.push_str(&format!("{path} | f | {}\n", data.len()));
                }
            }
        }
    }
}

fn os_error(errno: u32, name: &str) -> (Vec<u8>, Vec<u8>) {
    (
        Vec::new(),
        format!("{TRACEBACK_HEAD}OSError: [Errno {errno}] {name}\n").into_bytes(),
    )
}

/// All `'...'` literals in a snippet, in order. Emulator-side parsing only;
/// test paths avoid embedded quotes.
fn quoted(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('\'') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('\'') else { break };
        out.push(after[..end].to_owned());
        rest = &after[end + 1..];
    }
    out
}

fn first_quoted(text: &str) -> String {
    quoted(text).into_iter().next().unwrap_or_default()
}
