// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// Host-side client for the USB serial transfer protocol
mod cancel;
mod codec;
mod download;
mod error;
mod handshake;
mod inspect;
mod link;
mod protocol;
mod serial;
mod upload;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, warn};
use cancel::CancelToken;
use error::{Error, Result};
use link::Link;
use serial::RealSerialPort;
use upload::{Confirmation, UploadConfig, UploadFsm, UploadRequest};

const DEFAULT_PORT: &str = "/dev/ttyACM0";
const DEFAULT_TARGET_DIR: &str = "/system";
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "usbxfer")]
#[command(about = "Talk to a device's flash filesystem over the USB serial transfer protocol", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyACM0 or COM3)
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Seconds to wait for PING and FSINFO answers
    #[arg(long, default_value = "2", value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=3600))]
    timeout: u64,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports
    Ports,
    /// Check that the device answers
    Ping,
    /// Show filesystem usage
    Info,
    /// Recursively list the device filesystem
    List {
        /// Start directory
        #[arg(short, long, default_value = "/")]
        root: String,

        /// Skip the initial PING/PONG handshake
        #[arg(long)]
        no_ping: bool,
    },
    /// Upload a file
    Upload {
        /// File to send
        file: PathBuf,

        /// Directory on the device
        #[arg(short, long, default_value = DEFAULT_TARGET_DIR)]
        target_dir: String,

        /// Bytes per paced write (0 = single write)
        #[arg(long, default_value = "1024", value_name = "BYTES")]
        chunk: usize,

        /// Delay in milliseconds after each chunk
        #[arg(long, default_value = "0", value_name = "MS")]
        delay: u64,
    },
    /// Send a test payload
    Test {
        /// Payload size when no file is given
        #[arg(long, default_value = "4096", value_name = "BYTES")]
        size: usize,

        /// Name to store the payload under
        #[arg(long, default_value = "usb_test.bin")]
        name: String,

        /// Send the bytes of this file instead of generated data
        #[arg(long)]
        file: Option<PathBuf>,

        /// Bytes per paced write (default: single write)
        #[arg(long, value_name = "BYTES")]
        chunk: Option<usize>,

        /// Delay in milliseconds after each chunk
        #[arg(long, default_value = "0", value_name = "MS")]
        delay: u64,
    },
    /// Download a file
    Download {
        /// Path on the device
        remote: String,

        /// Directory to save into
        #[arg(short, long = "output", value_name = "DIR", default_value = ".")]
        output_dir: PathBuf,
    },
    /// Delete a file
    Delete {
        /// Path on the device
        remote: String,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            eprintln!("\nInterrupted again, exiting");
            std::process::exit(1);
        }
        eprintln!("\nInterrupted, stopping...");
        handler_token.cancel();
    }) {
        warn!("could not install Ctrl-C handler: {}", e);
    }

    let result = match &cli.command {
        Commands::Ports => list_ports(),
        Commands::Ping => run_ping(&cli, &cancel),
        Commands::Info => run_info(&cli, &cancel),
        Commands::List { root, no_ping } => run_list(&cli, &cancel, root, *no_ping),
        Commands::Upload { file, target_dir, chunk, delay } => {
            run_upload(&cli, &cancel, file, target_dir, *chunk, *delay)
        }
        Commands::Test { size, name, file, chunk, delay } => {
            run_test(&cli, &cancel, *size, name, file.as_deref(), *chunk, *delay)
        }
        Commands::Download { remote, output_dir } => run_download(&cli, &cancel, remote, output_dir),
        Commands::Delete { remote } => run_delete(&cli, &cancel, remote),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_link(cli: &Cli, cancel: &CancelToken) -> Result<Link> {
    println!("Opening serial port: {} ({} baud)", cli.port, cli.baud);
    let port = RealSerialPort::open(&cli.port, cli.baud, PORT_READ_TIMEOUT)?;
    Ok(Link::new(Box::new(port)).with_cancel(cancel.clone()))
}

fn exchange_timeout(cli: &Cli) -> Duration {
    Duration::from_secs(cli.timeout)
}

fn transfer_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn kb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0
}

fn list_ports() -> Result<()> {
    let ports = serial::available_ports().map_err(|e| Error::Transport(e.into()))?;
    if ports.is_empty() {
        println!("(no serial ports found)");
    }
    for (name, kind) in ports {
        println!("  - {}: {}", name, kind);
    }
    Ok(())
}

fn run_ping(cli: &Cli, cancel: &CancelToken) -> Result<()> {
    let mut link = open_link(cli, cancel)?;
    handshake::ping(&mut link, exchange_timeout(cli))?;
    println!("PONG received");
    link.close();
    Ok(())
}

fn run_info(cli: &Cli, cancel: &CancelToken) -> Result<()> {
    let mut link = open_link(cli, cancel)?;
    handshake::ping(&mut link, exchange_timeout(cli))?;
    let info = inspect::query_usage(&mut link, exchange_timeout(cli))?;
    link.close();

    println!(
        "Filesystem: total={:.1} KB  used={:.1} KB  free={:.1} KB",
        kb(info.total),
        kb(info.used),
        kb(info.free)
    );
    Ok(())
}

fn run_list(cli: &Cli, cancel: &CancelToken, root: &str, no_ping: bool) -> Result<()> {
    let root = inspect::normalize_path(root);
    let mut link = open_link(cli, cancel)?;
    if !no_ping {
        handshake::ping(&mut link, exchange_timeout(cli))?;
    }
    let info = inspect::query_usage(&mut link, exchange_timeout(cli))?;
    let entries = inspect::list_tree(&mut link, &root, &inspect::ListConfig::default())?;
    link.close();

    if entries.is_empty() {
        println!("(empty)");
    }
    for entry in &entries {
        let kind = if entry.is_dir { "<DIR>" } else { "     " };
        let size = if entry.is_dir { "-".to_string() } else { entry.size.to_string() };
        println!("{}  {:>10}  {}", kind, size, entry.path);
    }

    println!(
        "\nFilesystem: total={:.1} KB  used={:.1} KB  free={:.1} KB",
        kb(info.total),
        kb(info.used),
        kb(info.free)
    );
    Ok(())
}

fn run_upload(cli: &Cli, cancel: &CancelToken, file: &Path, target_dir: &str, chunk: usize, delay: u64) -> Result<()> {
    let size = std::fs::metadata(file).map_err(Error::File)?.len();
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Invalid(format!("{} has no usable file name", file.display())))?;
    let target_dir = inspect::normalize_path(target_dir);

    println!("File:   {}", filename);
    println!("Size:   {} bytes ({:.1} KB)", size, kb(size));
    println!("Target: {}/{}", target_dir.trim_end_matches('/'), filename);

    let mut link = open_link(cli, cancel)?;
    match handshake::ping(&mut link, exchange_timeout(cli)) {
        Ok(()) => println!("PONG received"),
        Err(e) if e.is_timeout() => println!("Warning: no PONG response (continuing anyway)"),
        Err(e) => return Err(e),
    }

    let request = UploadRequest {
        source: Box::new(File::open(file).map_err(Error::File)?),
        filename,
        total_size: size,
        target_dir: Some(target_dir),
    };
    let config = UploadConfig {
        chunk_size: (chunk > 0).then_some(chunk),
        chunk_delay: Duration::from_millis(delay),
        ..UploadConfig::default()
    };
    send(link, request, config)
}

fn run_test(
    cli: &Cli,
    cancel: &CancelToken,
    size: usize,
    name: &str,
    file: Option<&Path>,
    chunk: Option<usize>,
    delay: u64,
) -> Result<()> {
    let (data, filename) = match file {
        Some(path) => {
            let data = std::fs::read(path).map_err(Error::File)?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| Error::Invalid(format!("{} has no usable file name", path.display())))?;
            (data, name)
        }
        None => ((0..size).map(|i| (i % 256) as u8).collect::<Vec<u8>>(), name.to_string()),
    };

    let mut link = open_link(cli, cancel)?;
    handshake::ping(&mut link, exchange_timeout(cli))?;
    println!("PONG received");

    let request = UploadRequest {
        total_size: data.len() as u64,
        source: Box::new(std::io::Cursor::new(data)),
        filename,
        target_dir: None,
    };
    let config = UploadConfig {
        chunk_size: chunk.filter(|&c| c > 0),
        chunk_delay: Duration::from_millis(delay),
        start_timeout: Duration::from_secs(4),
        ..UploadConfig::default()
    };
    send(link, request, config)
}

fn send(link: Link, request: UploadRequest, config: UploadConfig) -> Result<()> {
    let pb = transfer_bar(request.total_size);
    let session = UploadFsm::new(link, request, config, Some(pb.clone()))?;

    match upload::run_session(session) {
        Ok(outcome) => {
            match outcome.confirmation {
                Confirmation::Confirmed => {
                    println!("Upload complete: {} ({} bytes)", outcome.filename, outcome.bytes_sent);
                }
                Confirmation::ProgressOnly => {
                    println!(
                        "Upload complete: {} ({} bytes; PROG confirmed, END may have been missed)",
                        outcome.filename, outcome.bytes_sent
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(e)
        }
    }
}

fn run_download(cli: &Cli, cancel: &CancelToken, remote: &str, output_dir: &Path) -> Result<()> {
    if !output_dir.is_dir() {
        return Err(Error::File(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Output directory not found: {}", output_dir.display()),
        )));
    }

    let mut link = open_link(cli, cancel)?;
    handshake::ping(&mut link, exchange_timeout(cli))?;

    let pb = transfer_bar(0);
    let result = download::download_to_dir(&mut link, remote, output_dir, &download::DownloadConfig::default(), Some(&pb));
    link.close();

    match result {
        Ok((path, report)) => {
            pb.finish();
            println!("Saved {} ({} bytes) to {}", report.name, report.size, path.display());
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(e)
        }
    }
}

fn run_delete(cli: &Cli, cancel: &CancelToken, remote: &str) -> Result<()> {
    let mut link = open_link(cli, cancel)?;
    handshake::ping(&mut link, exchange_timeout(cli))?;
    let removed = inspect::delete_file(&mut link, remote, exchange_timeout(cli))?;
    link.close();
    println!("Deleted {}", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_bounded() {
        assert!(Cli::try_parse_from(["usbxfer", "--timeout", "0", "ping"]).is_err());
        assert!(Cli::try_parse_from(["usbxfer", "--timeout", "18446744073709551615", "ping"]).is_err());
        let cli = Cli::try_parse_from(["usbxfer", "--timeout", "3600", "ping"]).unwrap();
        assert_eq!(exchange_timeout(&cli), Duration::from_secs(3600));
    }

    #[test]
    fn test_download_output_flag() {
        let cli = Cli::try_parse_from(["usbxfer", "download", "/system/a.bin", "--output", "/tmp"]).unwrap();
        match cli.command {
            Commands::Download { remote, output_dir } => {
                assert_eq!(remote, "/system/a.bin");
                assert_eq!(output_dir, PathBuf::from("/tmp"));
            }
            _ => panic!("Expected download command"),
        }
    }
}
