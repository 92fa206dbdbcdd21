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

//! File download over `READ`
//!
//! The header line announces the size, then exactly that many raw bytes
//! follow outside of line framing, then a `READEND` trailer.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use indicatif::ProgressBar;
use tracing::{debug, warn};
use crate::codec::Response;
use crate::error::{Error, Result};
use crate::inspect::normalize_path;
use crate::link::Link;
use crate::protocol::*;

const BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Wait for the `READ` header and the `READEND` trailer
    pub header_timeout: Duration,
    /// Longest gap allowed between payload bytes
    pub idle_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    /// File name as announced by the device
    pub name: String,
    pub size: u64,
}

/// Read a remote file into `out`.
pub fn download(
    link: &mut Link,
    remote: &str,
    out: &mut dyn Write,
    config: &DownloadConfig,
    progress: Option<&ProgressBar>,
) -> Result<DownloadReport> {
    let remote = normalize_path(remote);
    link.send_command(&format!("{CMD_READ} {remote}"))?;

    let (size, name) = read_header(link, &remote, config.header_timeout)?;
    debug!("receiving {} ({} bytes)", name, size);
    if let Some(pb) = progress {
        pb.set_length(size);
    }

    let mut buf = [0u8; BLOCK_SIZE];
    let mut received: u64 = 0;
    while received < size {
        let want = (size - received).min(BLOCK_SIZE as u64) as usize;
        let n = link.read_raw(&mut buf[..want], config.idle_timeout)?;
        if n == 0 {
            return Err(Error::Timeout(format!(
                "file data for {remote} ({received} of {size} bytes received)"
            )));
        }
        out.write_all(&buf[..n]).map_err(Error::File)?;
        received += n as u64;
        if let Some(pb) = progress {
            pb.set_position(received);
        }
    }

    let count = read_trailer(link, &remote, config.header_timeout)?;
    if count != received {
        return Err(Error::Protocol(format!(
            "{TAG_READEND} reports {count} bytes, received {received}"
        )));
    }

    Ok(DownloadReport { name, size })
}

/// Download into `dir`, named after the device's file name. A partial file
/// is removed on failure.
pub fn download_to_dir(
    link: &mut Link,
    remote: &str,
    dir: &Path,
    config: &DownloadConfig,
    progress: Option<&ProgressBar>,
) -> Result<(PathBuf, DownloadReport)> {
    // The device echoes the basename, so the local name is known up front.
    let local_name = normalize_path(remote)
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Invalid(format!("{remote:?} names no file")))?;
    let target = dir.join(local_name);

    let mut file = File::create(&target).map_err(Error::File)?;
    let result = download(link, remote, &mut file, config, progress)
        .and_then(|report| file.flush().map(|_| report).map_err(Error::File));

    match result {
        Ok(report) => Ok((target, report)),
        Err(e) => {
            drop(file);
            if let Err(rm) = std::fs::remove_file(&target) {
                warn!("could not remove partial {}: {}", target.display(), rm);
            }
            Err(e)
        }
    }
}

fn read_header(link: &mut Link, remote: &str, timeout: Duration) -> Result<(u64, String)> {
    let deadline = Instant::now() + timeout;
    loop {
        match link.read_line(deadline)? {
            Some(Response::Success { tag, args }) if tag == TAG_READ => {
                let size = args
                    .first()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::Protocol(format!("bad {TAG_READ} header {:?}", args)))?;
                let name = args.get(1).cloned().unwrap_or_default();
                return Ok((size, name));
            }
            Some(Response::Failure { message }) => {
                return Err(Error::Device { message, path: Some(remote.to_string()) });
            }
            Some(_) => continue,
            None => return Err(Error::Timeout(format!("{TAG_READ} header for {remote}"))),
        }
    }
}

fn read_trailer(link: &mut Link, remote: &str, timeout: Duration) -> Result<u64> {
    let deadline = Instant::now() + timeout;
    loop {
        match link.read_line(deadline)? {
            Some(Response::Success { tag, args }) if tag == TAG_READEND => {
                return args
                    .first()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::Protocol(format!("bad {TAG_READEND} trailer {:?}", args)));
            }
            Some(Response::Failure { message }) => {
                return Err(Error::Device { message, path: Some(remote.to_string()) });
            }
            Some(_) => continue,
            None => return Err(Error::Timeout(format!("{TAG_READEND} for {remote}"))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;

    fn bytes(b: &[u8]) -> Option<&[u8]> {
        Some(b)
    }

    fn script(parts: &[Option<&[u8]>]) -> Vec<Option<u8>> {
        let mut responses = Vec::new();
        for part in parts {
            match part {
                Some(bytes) => responses.extend(bytes.iter().map(|&b| Some(b))),
                None => responses.push(None),
            }
        }
        responses
    }

    #[test]
    fn test_download_binary_payload() {
        // Payload contains newlines and lookalike text; it must not be framed.
        let payload: &[u8] = b"\x00\xffUSB ERR x\n\r\nabc";
        let responses = script(&[
            bytes(b"[USB] READ /slides/a.bin\nUSB OK READ 17 a.bin\n"),
            bytes(payload),
            bytes(b"USB OK READEND 17\n"),
        ]);
        let mock = MockSerialPort::new(responses, b"READ /slides/a.bin\n".to_vec());
        let mut link = Link::new(Box::new(mock));

        let mut out = Vec::new();
        let report = download(&mut link, "slides/a.bin", &mut out, &DownloadConfig::default(), None).unwrap();
        assert_eq!(report, DownloadReport { name: "a.bin".to_string(), size: 17 });
        assert_eq!(out, payload);
    }

    #[test]
    fn test_download_idle_timeout() {
        let responses = script(&[
            bytes(b"USB OK READ 6 b.txt\nabc"),
            None,
            bytes(b"def"),
            bytes(b"USB OK READEND 6\n"),
        ]);
        let mock = MockSerialPort::new(responses, b"READ /b.txt\n".to_vec());
        let mut link = Link::new(Box::new(mock));

        let mut out = Vec::new();
        // One silent read means the device stalled past the idle bound
        let err = download(&mut link, "/b.txt", &mut out, &DownloadConfig::default(), None).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(out, b"abc");

        // Drain what the device still sends so the mock is fully consumed
        let mut rest = [0u8; 32];
        link.read_raw(&mut rest, Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn test_download_missing_file() {
        let mock = MockSerialPort::from_lines(
            &[Some("USB ERR READNOENT Datei nicht gefunden: /nope.jpg")],
            b"READ /nope.jpg\n",
        );
        let mut link = Link::new(Box::new(mock));
        let mut out = Vec::new();
        match download(&mut link, "/nope.jpg", &mut out, &DownloadConfig::default(), None) {
            Err(Error::Device { message, path }) => {
                assert!(message.starts_with("READNOENT"));
                assert_eq!(path.as_deref(), Some("/nope.jpg"));
            }
            other => panic!("Expected device error, got {:?}", other),
        }
    }

    #[test]
    fn test_download_count_mismatch() {
        let responses = script(&[bytes(b"USB OK READ 2 c.bin\nxyUSB OK READEND 3\n")]);
        let mock = MockSerialPort::new(responses, b"READ /c.bin\n".to_vec());
        let mut link = Link::new(Box::new(mock));
        let mut out = Vec::new();
        let err = download(&mut link, "/c.bin", &mut out, &DownloadConfig::default(), None).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_download_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let responses = script(&[bytes(b"USB OK READ 4 logo.jpg\n\xff\xd8\xff\xd9USB OK READEND 4\n")]);
        let mock = MockSerialPort::new(responses, b"READ /system/logo.jpg\n".to_vec());
        let mut link = Link::new(Box::new(mock));

        let (path, report) =
            download_to_dir(&mut link, "/system/logo.jpg", dir.path(), &DownloadConfig::default(), None).unwrap();
        assert_eq!(path, dir.path().join("logo.jpg"));
        assert_eq!(report.size, 4);
        assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8\xff\xd9");
    }

    #[test]
    fn test_download_to_dir_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let responses = script(&[bytes(b"USB OK READ 10 big.bin\nonly")]);
        let mock = MockSerialPort::new(responses, b"READ /big.bin\n".to_vec());
        let mut link = Link::new(Box::new(mock));

        let err = download_to_dir(&mut link, "/big.bin", dir.path(), &DownloadConfig::default(), None).unwrap_err();
        assert!(err.is_timeout());
        assert!(!dir.path().join("big.bin").exists());
    }
}
