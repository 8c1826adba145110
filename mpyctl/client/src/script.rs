//! Run-script options, responses and source preparation.

use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sink invoked with each inbound output chunk as it arrives.
pub type StreamingCallback = Box<dyn FnMut(&[u8]) + Send>;

/// When a `run_script` call resolves.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Resolve {
    /// Resolve after the full response has been parsed.
    #[default]
    OnCompletion,
    /// Resolve as soon as the device acknowledges receipt. The response
    /// tail is drained in the background while keeping request order.
    FirstPrompt,
}

/// Options for [`crate::Device::run_script`].
#[derive(Default)]
pub struct RunScriptOptions {
    pub resolve: Resolve,
    /// Deadline for the whole request; infinite if `None`.
    pub timeout: Option<Duration>,
    /// Keep the source verbatim instead of stripping the common leading
    /// whitespace from every line.
    pub disable_dedent: bool,
    /// Cancel handle; canceling interrupts the device and fails the call.
    pub cancel: Option<CancellationToken>,
    /// Streaming sink receiving output chunks in transport-arrival order.
    pub streaming: Option<StreamingCallback>,
}

impl std::fmt::Debug for RunScriptOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScriptOptions")
            .field("resolve", &self.resolve)
            .field("timeout", &self.timeout)
            .field("disable_dedent", &self.disable_dedent)
            .field("cancel", &self.cancel.is_some())
            .field("streaming", &self.streaming.is_some())
            .finish()
    }
}

/// The structured result of one remote script execution.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ScriptResponse {
    /// Remote stdout, UTF-8 with invalid sequences replaced.
    pub stdout: String,
    /// Remote stderr, usually a traceback, same decoding.
    pub stderr: String,
    /// Last non-empty stderr line (exception class and message), if any.
    pub exception: Option<String>,
}

impl ScriptResponse {
    pub(crate) fn from_raw(stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let exception = extract_exception(&stderr);
        Self {
            stdout,
            stderr,
            exception,
        }
    }
}

/// Last non-empty line of a traceback, e.g. `ValueError: x`.
pub(crate) fn extract_exception(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
        .map(Into::into)
}

/// Strip the minimum common leading whitespace from every non-blank line.
/// Lets callers keep scripts indented inside their own source.
pub(crate) fn dedent(source: &str) -> String {
    let indent = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);
    if indent == 0 {
        return source.into();
    }
    let mut out = source
        .lines()
        .map(|line| if line.len() >= indent { &line[indent..] } else { line.trim_start() })
        .collect::<Vec<_>>()
        .join("\n");
    if source.ends_with('\n') {
        out.push('\n');
    }
    out
}
