//! Inbound byte accumulation and the wait-for-bytes primitive.

use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use memchr::memmem;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Contiguous inbound byte buffer with an implicit consumed watermark.
///
/// The engine either consumes a prefix up to and including a known marker,
/// or peeks for one of several markers without consuming anything.
#[derive(Debug, Default)]
pub(crate) struct ReceiveBuffer {
    buf: BytesMut,
}

impl ReceiveBuffer {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Byte offset of the first occurrence of `marker`, if buffered.
    pub fn find(&self, marker: &[u8]) -> Option<usize> {
        memmem::find(&self.buf, marker)
    }

    /// Consume everything up to and including `marker`, returning the bytes
    /// that preceded it. `None` if the marker is not buffered yet.
    pub fn take_until(&mut self, marker: &[u8]) -> Option<Vec<u8>> {
        let at = self.find(marker)?;
        let head = self.buf.split_to(at).to_vec();
        self.buf.advance(marker.len());
        Some(head)
    }

    /// Peek at the first `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        (self.buf.len() >= n).then(|| &self.buf[..n])
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Drain the whole buffer.
    pub fn take_all(&mut self) -> Vec<u8> {
        self.buf.split().to_vec()
    }

    /// Consume one newline-terminated line, stripping the `\r\n` or `\n`
    /// terminator. Used by the WebREPL login handshake.
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let mut line = self.take_until(b"\n")?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

/// The wait-for-bytes primitive: a [`ReceiveBuffer`] shared between the
/// inbound router task and protocol code. Waiters register a predicate and
/// are woken whenever new bytes arrive; closing the buffer wakes everyone
/// with [`Error::ConnectionLost`].
#[derive(Debug, Default)]
pub(crate) struct SharedBuffer {
    state: Mutex<Shared>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct Shared {
    buf: ReceiveBuffer,
    closed: bool,
}

impl SharedBuffer {
    pub fn push(&self, chunk: &[u8]) {
        self.state.lock().buf.push(chunk);
        self.notify.notify_waiters();
    }

    /// Mark the connection as gone and wake all waiters.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn clear(&self) {
        self.state.lock().buf.take_all();
    }

    /// Apply `f` to the buffer once, without waiting.
    pub fn with<T>(&self, f: impl FnOnce(&mut ReceiveBuffer) -> T) -> T {
        f(&mut self.state.lock().buf)
    }

    /// Suspend until `pred` consumes a match from the buffer. The predicate
    /// runs under the buffer lock and must either consume what it matched
    /// and return `Some`, or leave the buffer untouched and return `None`.
    pub async fn wait_for<T>(
        &self,
        mut pred: impl FnMut(&mut ReceiveBuffer) -> Option<T>,
    ) -> Result<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(found) = pred(&mut state.buf) {
                    return Ok(found);
                }
                if state.closed {
                    return Err(Error::ConnectionLost);
                }
            }
            notified.await;
        }
    }
}
