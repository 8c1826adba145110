//! Command-line configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

macro_rules! prefix {
    () => {
        "MPYCTL_"
    };
}

#[derive(Debug, Parser)]
#[command(
    name = "mpyctl",
    version,
    about = "Control MicroPython boards over serial and WebREPL."
)]
pub struct Cli {
    #[arg(
        env = concat!(prefix!(), "SERIAL"),
        global = true,
        long,
        short = 's',
        value_name = "PATH"
    )]
    /// Serial device path. The first attached board is picked when omitted.
    pub serial: Option<String>,

    #[arg(
        default_value_t = mpyctl_client::DEFAULT_BAUD,
        env = concat!(prefix!(), "BAUD"),
        global = true,
        long,
        value_name = "RATE"
    )]
    /// Serial baud rate.
    pub baud: u32,

    #[arg(
        env = concat!(prefix!(), "HOST"),
        global = true,
        long,
        short = 'H',
        value_name = "HOST"
    )]
    /// WebREPL host. Takes precedence over the serial link when set.
    pub host: Option<String>,

    #[arg(
        env = concat!(prefix!(), "PASSWORD"),
        global = true,
        long,
        short = 'p',
        value_name = "PASSWORD"
    )]
    /// WebREPL password.
    pub password: Option<String>,

    #[arg(
        default_value = "warn",
        env = concat!(prefix!(), "LOG_LEVEL"),
        global = true,
        long,
        value_name = "FILTER"
    )]
    /// Log filter, e.g. `info` or `mpyctl_client=trace`.
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List serial ports that look like attached boards.
    Devices,

    /// List files on the device.
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(long, short)]
        recursive: bool,
        #[arg(long)]
        json: bool,
    },

    /// Print a remote file to stdout.
    Cat { path: String },

    /// Download a file or, with `-r`, a whole directory tree.
    Get {
        src: String,
        dest: Option<PathBuf>,
        #[arg(long, short)]
        recursive: bool,
    },

    /// Upload a local file.
    Put {
        src: PathBuf,
        dest: Option<String>,
    },

    /// Delete a file or directory.
    Rm {
        path: String,
        #[arg(long, short)]
        recursive: bool,
    },

    /// Create a directory.
    Mkdir { path: String },

    /// Rename a file or directory.
    Mv { old: String, new: String },

    /// Print the SHA-256 digest of a remote file.
    Sha256 { path: String },

    /// Stat a remote path.
    Stat {
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Run a Python script from a file, or inline with `-c`.
    Run {
        file: Option<PathBuf>,
        #[arg(long, short = 'c', value_name = "CODE", conflicts_with = "file")]
        code: Option<String>,
        #[arg(long, value_name = "MS")]
        timeout: Option<u64>,
    },

    /// Attach an interactive terminal. Ctrl-K detaches.
    Repl,

    /// Reset the device, soft by default.
    Reset {
        #[arg(long)]
        hard: bool,
    },

    /// Show version information.
    Version {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Wire the log filter into the tracing subscriber, logging to stderr
    /// so command output stays clean on stdout.
    pub fn init_logging(&self) -> Result<()> {
        let filter = EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("parse log filter {:?}", self.log_level))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("init tracing subscriber: {e}"))
    }
}
