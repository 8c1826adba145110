//! Interactive terminal pass-through.

use anyhow::{Context, Result};
use mpyctl_client::Device;
use std::io::Write;
use tokio::io::AsyncReadExt;

/// Local detach key, intercepted before forwarding. Everything else,
/// including Ctrl-A through Ctrl-D, goes to the device verbatim.
const QUIT: u8 = 0x0b; // Ctrl-K

pub async fn run(device: &Device) -> Result<()> {
    device.on_terminal_data(|chunk| {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(chunk);
        let _ = stdout.flush();
    });
    device.enter_terminal().await?;

    eprintln!("connected; Ctrl-K detaches");
    // Land on the friendly prompt so the user sees `>>>` right away.
    device.send_data(&[0x02]).await?;

    let _guard = RawMode::enable().context("switch local tty to raw mode")?;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        let n = stdin.read(&mut buf).await.context("read stdin")?;
        if n == 0 {
            break;
        }
        match buf[..n].iter().position(|&b| b == QUIT) {
            Some(at) => {
                if at > 0 {
                    device.send_data(&buf[..at]).await?;
                }
                break;
            }
            None => device.send_data(&buf[..n]).await?,
        }
    }

    device.leave_terminal().await?;
    eprintln!("\ndetached");
    Ok(())
}

/// Puts the local tty into raw mode for the lifetime of the value.
#[cfg(unix)]
struct RawMode {
    original: nix::sys::termios::Termios,
}

#[cfg(unix)]
impl RawMode {
    fn enable() -> Result<Self> {
        use nix::sys::termios::{self, SetArg};
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin).context("tcgetattr")?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("tcsetattr")?;
        Ok(Self { original })
    }
}

#[cfg(unix)]
impl Drop for RawMode {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};
        let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.original);
    }
}

#[cfg(not(unix))]
struct RawMode;

#[cfg(not(unix))]
impl RawMode {
    fn enable() -> Result<Self> {
        Ok(Self)
    }
}
