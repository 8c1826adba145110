//! Device interaction mode tracking.

use crate::error::{Error, Result};
use tracing::trace;

/// The interaction mode of a connected device.
///
/// Transitions form a DAG rooted at [`ConnectionState::Closed`]; the engine
/// never skips a state silently.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionState {
    /// No link.
    Closed,
    /// Transport open in progress.
    Opening,
    /// WebREPL link up, password not accepted yet.
    WebReplUnauthenticated,
    /// The human-facing `>>>` prompt.
    FriendlyRepl,
    /// Machine mode, `>` prompt, sentinel-framed responses.
    RawRepl,
    /// Raw mode with window-flow-controlled paste input.
    RawPasteRepl,
    /// Every inbound byte goes to the terminal consumer.
    TerminalMode,
    /// Orderly shutdown in progress.
    Closing,
}

impl ConnectionState {
    /// Whether the edge `self -> next` exists in the transition DAG.
    pub fn can_enter(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        // Any state may close, and any live state may hand the stream to a
        // terminal consumer.
        if matches!(next, Closing | Closed) {
            return true;
        }
        if next == TerminalMode {
            return self != Closed;
        }
        matches!(
            (self, next),
            (Closed, Opening)
                | (Opening, WebReplUnauthenticated)
                | (Opening, FriendlyRepl)
                | (WebReplUnauthenticated, FriendlyRepl)
                | (FriendlyRepl, RawRepl)
                | (RawRepl, RawPasteRepl)
                | (RawRepl, FriendlyRepl)
                | (RawPasteRepl, FriendlyRepl)
                | (TerminalMode, FriendlyRepl)
                | (TerminalMode, RawRepl)
                | (TerminalMode, RawPasteRepl)
        )
    }

    /// Move to `next`, or fail on an edge outside the DAG.
    pub fn advance(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_enter(next) {
            return Err(Error::InvalidResponse(format!(
                "illegal state transition {self} -> {next}"
            )));
        }
        trace!("state {self} -> {next}");
        *self = next;
        Ok(())
    }

    pub fn is_raw(self) -> bool {
        matches!(self, Self::RawRepl | Self::RawPasteRepl)
    }
}
