//! Subcommand handlers, thin wrappers over the public client API.

use crate::{
    cli::{Cli, Command},
    repl, version,
};
use anyhow::{Context, Result, bail};
use mpyctl_client::{Device, FileEntry, RunScriptOptions, available_ports};
use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;

pub async fn dispatch(cli: Cli) -> Result<()> {
    // Commands that don't need a device link.
    match &cli.command {
        Command::Devices => return devices(),
        Command::Version { json } => return version::Version::new().print(*json),
        _ => {}
    }

    let device = connect(&cli).await?;
    let result = run(&device, &cli.command).await;
    let disconnect = device.disconnect().await;
    result?;
    disconnect.context("disconnect")?;
    Ok(())
}

async fn connect(cli: &Cli) -> Result<Device> {
    let device = Device::new();
    if let Some(host) = &cli.host {
        let password = cli
            .password
            .as_deref()
            .context("--password is required for WebREPL connections")?;
        device
            .connect_network(host, password)
            .await
            .with_context(|| format!("connect to {host}"))?;
    } else {
        let path = match &cli.serial {
            Some(path) => path.clone(),
            None => available_ports()
                .into_iter()
                .next()
                .context("no serial device found; pass --serial or --host")?,
        };
        device
            .connect_serial(&path, cli.baud)
            .await
            .with_context(|| format!("open {path}"))?;
    }
    Ok(device)
}

async fn run(device: &Device, command: &Command) -> Result<()> {
    match command {
        Command::Devices | Command::Version { .. } => unreachable!("handled in dispatch"),
        Command::Ls {
            path,
            recursive,
            json,
        } => {
            let entries = device.list_files(path, *recursive).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
        }
        Command::Cat { path } => {
            let data = device.get_file(path).await?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Command::Get {
            src,
            dest,
            recursive,
        } => {
            if *recursive {
                let dest = dest.clone().unwrap_or_else(|| local_name(src));
                let entries = device.download_tree(src, &dest).await?;
                let files = entries.iter().filter(|e| !e.is_dir).count();
                println!("{files} file(s) copied to {}", dest.display());
            } else {
                let dest = dest.clone().unwrap_or_else(|| local_name(src));
                let data = device.get_file(src).await?;
                fs::write(&dest, data)
                    .await
                    .with_context(|| format!("write {}", dest.display()))?;
            }
        }
        Command::Put { src, dest } => {
            let data = fs::read(src)
                .await
                .with_context(|| format!("read {}", src.display()))?;
            let dest = match dest {
                Some(dest) => dest.clone(),
                None => remote_name(src)?,
            };
            device.put_file(&dest, &data).await?;
        }
        Command::Rm { path, recursive } => device.remove(path, *recursive).await?,
        Command::Mkdir { path } => device.mkdir(path).await?,
        Command::Mv { old, new } => device.rename(old, new).await?,
        Command::Sha256 { path } => println!("{}", device.get_file_hash(path).await?),
        Command::Stat { path, json } => {
            let stat = device.stat_path(path).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&stat)?);
            } else if !stat.exists {
                println!("{path}: not found");
            } else {
                let kind = if stat.is_dir { "directory" } else { "file" };
                println!("{path}: {kind}, {} bytes, mtime {}", stat.size, stat.mtime);
            }
        }
        Command::Run {
            file,
            code,
            timeout,
        } => {
            let source = match (file, code) {
                (_, Some(code)) => code.clone(),
                (Some(file), None) => fs::read_to_string(file)
                    .await
                    .with_context(|| format!("read {}", file.display()))?,
                (None, None) => bail!("pass a script file or -c CODE"),
            };
            let opts = RunScriptOptions {
                timeout: timeout.map(Duration::from_millis),
                streaming: Some(Box::new(|chunk| {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(chunk);
                    let _ = stdout.flush();
                })),
                ..Default::default()
            };
            let response = device.run_script(&source, opts).await?;
            if let Some(exception) = response.exception {
                bail!("script raised {exception}");
            }
        }
        Command::Repl => repl::run(device).await?,
        Command::Reset { hard } => device.reset(!hard).await?,
    }
    Ok(())
}

fn devices() -> Result<()> {
    let ports = available_ports();
    if ports.is_empty() {
        println!("no serial devices found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn format_entry(entry: &FileEntry) -> String {
    let marker = if entry.is_dir { "/" } else { "" };
    format!("{:>9}  {}{marker}", entry.size, entry.filename)
}

/// Local destination for a download: the remote basename.
fn local_name(remote: &str) -> PathBuf {
    PathBuf::from(remote.rsplit('/').next().unwrap_or(remote))
}

/// Remote destination for an upload: `/` plus the local basename.
fn remote_name(local: &Path) -> Result<String> {
    let name = local
        .file_name()
        .with_context(|| format!("{} has no file name", local.display()))?;
    Ok(format!("/{}", name.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_entries_format_with_a_dir_marker() {
        let dir = FileEntry {
            filename: "/d".into(),
            is_dir: true,
            size: 0,
        };
        let file = FileEntry {
            filename: "/a.py".into(),
            is_dir: false,
            size: 12,
        };
        assert!(format_entry(&dir).ends_with("/d/"));
        assert!(format_entry(&file).ends_with("/a.py"));
    }

    #[test]
    fn transfer_names_default_to_basenames() {
        assert_eq!(local_name("/d/e/c.py"), PathBuf::from("c.py"));
        assert_eq!(local_name("/a.py"), PathBuf::from("a.py"));
        assert_eq!(
            remote_name(Path::new("src/main.py")).expect("name"),
            "/main.py"
        );
        assert!(remote_name(Path::new("..")).is_err());
    }
}
