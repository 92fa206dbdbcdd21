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

//! Read-side filesystem operations: usage, recursive listing, deletion

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use crate::codec::Response;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::*;

// ============================================================================
// Types
// ============================================================================

/// Filesystem usage as the device reports it. `used + free` need not equal
/// `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// One node of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ListConfig {
    /// Bound on each single-directory exchange
    pub per_dir_timeout: Duration,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            per_dir_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Usage Query
// ============================================================================

pub fn query_usage(link: &mut Link, timeout: Duration) -> Result<FsInfo> {
    link.send_command(CMD_FSINFO)?;

    let deadline = Instant::now() + timeout;
    loop {
        match link.read_line(deadline)? {
            Some(Response::Success { tag, args }) if tag == TAG_FSINFO => return parse_fsinfo(&args),
            Some(Response::Failure { message }) => return Err(Error::device(message)),
            Some(_) => continue,
            None => return Err(Error::Timeout("FSINFO response".to_string())),
        }
    }
}

fn parse_fsinfo(args: &[String]) -> Result<FsInfo> {
    if args.len() < 3 {
        return Err(Error::Protocol(format!(
            "FSINFO needs 3 numeric fields, got {:?}",
            args
        )));
    }

    let tail = &args[args.len() - 3..];
    let field = |i: usize| {
        tail[i].parse::<u64>().map_err(|_| {
            Error::Protocol(format!("non-numeric FSINFO field {:?} in {:?}", tail[i], args))
        })
    };

    Ok(FsInfo {
        total: field(0)?,
        used: field(1)?,
        free: field(2)?,
    })
}

// ============================================================================
// Recursive Listing
// ============================================================================

/// List `root` and everything below it.
///
/// Directories are expanded from an explicit work list, each at most once.
/// The result holds one entry per distinct path, sorted by path byte-wise;
/// any failing or stalled directory aborts the whole traversal.
pub fn list_tree(link: &mut Link, root: &str, config: &ListConfig) -> Result<Vec<Entry>> {
    let root = normalize_path(root);
    let mut pending = vec![root];
    let mut visited: HashSet<String> = HashSet::new();
    let mut discovered: BTreeMap<String, Entry> = BTreeMap::new();

    while let Some(dir) = pending.pop() {
        if !visited.insert(dir.clone()) {
            continue;
        }

        for entry in list_dir(link, &dir, config.per_dir_timeout)? {
            if entry.is_dir && !visited.contains(&entry.path) {
                pending.push(entry.path.clone());
            }
            discovered.entry(entry.path.clone()).or_insert(entry);
        }
    }

    info!("listed {} entries in {} directories", discovered.len(), visited.len());
    Ok(discovered.into_values().collect())
}

/// One `LIST` exchange for a single directory.
fn list_dir(link: &mut Link, dir: &str, timeout: Duration) -> Result<Vec<Entry>> {
    let command = if dir == "/" {
        CMD_LIST.to_string()
    } else {
        format!("{CMD_LIST} {dir}")
    };
    link.send_command(&command)?;

    let mut entries = Vec::new();
    let deadline = Instant::now() + timeout;
    loop {
        match link.read_line(deadline)? {
            Some(resp) if resp.is_success(TAG_LISTDONE) => return Ok(entries),
            Some(Response::Success { tag, args }) if tag == TAG_LIST => {
                if let Some(entry) = parse_entry(dir, &args) {
                    entries.push(entry);
                }
            }
            Some(Response::Failure { message }) => {
                return Err(Error::Device { message, path: Some(dir.to_string()) });
            }
            Some(_) => continue,
            None => return Err(Error::Timeout(format!("LIST response for {dir}"))),
        }
    }
}

/// Build an entry from the trailing `<type> <name> <size>` arguments.
fn parse_entry(dir: &str, args: &[String]) -> Option<Entry> {
    if args.len() < 3 {
        debug!("skipping short LIST line {:?}", args);
        return None;
    }

    let tail = &args[args.len() - 3..];
    let name = tail[1].as_str();
    if name == "." || name == ".." {
        return None;
    }

    let path = join_path(dir, name);
    if path == dir {
        return None;
    }

    Some(Entry {
        path,
        is_dir: tail[0] == ENTRY_DIR,
        size: tail[2].parse().unwrap_or(0),
    })
}

// ============================================================================
// Deletion
// ============================================================================

/// Remove one file. The device refuses directories and protected paths.
pub fn delete_file(link: &mut Link, path: &str, timeout: Duration) -> Result<String> {
    let path = normalize_path(path);
    if path == "/" {
        return Err(Error::Invalid("refusing to delete /".to_string()));
    }
    link.send_command(&format!("{CMD_DELETE} {path}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        match link.read_line(deadline)? {
            Some(Response::Success { tag, args }) if tag == TAG_DELETE => {
                return Ok(args.first().cloned().unwrap_or(path));
            }
            Some(Response::Failure { message }) => {
                return Err(Error::Device { message, path: Some(path) });
            }
            Some(_) => continue,
            None => return Err(Error::Timeout(format!("DELETE confirmation for {path}"))),
        }
    }
}

// ============================================================================
// Path Helpers
// ============================================================================

/// Absolute, slash-separated form with `.`, `..`, empty and trailing
/// segments resolved.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// `name` relative to `parent`, unless the device already reported it
/// absolute.
pub fn join_path(parent: &str, name: &str) -> String {
    if name.starts_with('/') {
        normalize_path(name)
    } else {
        normalize_path(&format!("{parent}/{name}"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;

    fn entry(path: &str, is_dir: bool, size: u64) -> Entry {
        Entry { path: path.to_string(), is_dir, size }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("system"), "/system");
        assert_eq!(normalize_path("//system//fonts/"), "/system/fonts");
        assert_eq!(normalize_path("/system/./fonts/../img"), "/system/img");
        assert_eq!(normalize_path("/../.."), "/");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "file.txt"), "/file.txt");
        assert_eq!(join_path("/system", "logo.jpg"), "/system/logo.jpg");
        assert_eq!(join_path("/system", "/slides/a.jpg"), "/slides/a.jpg");
    }

    #[test]
    fn test_fsinfo_scenario() {
        let mock = MockSerialPort::from_lines(
            &[Some("USB OK FSINFO TAG 1048576 419430 629146")],
            b"FSINFO\n",
        );
        let mut link = Link::new(Box::new(mock));
        let info = query_usage(&mut link, Duration::from_secs(2)).unwrap();
        assert_eq!(info, FsInfo { total: 1048576, used: 419430, free: 629146 });
    }

    #[test]
    fn test_fsinfo_without_leading_tag() {
        let mock = MockSerialPort::from_lines(
            &[Some("[FS] mounted"), Some("USB OK FSINFO 1507328 8192 1499136")],
            b"FSINFO\n",
        );
        let mut link = Link::new(Box::new(mock));
        let info = query_usage(&mut link, Duration::from_secs(2)).unwrap();
        assert_eq!(info, FsInfo { total: 1507328, used: 8192, free: 1499136 });
    }

    #[test]
    fn test_fsinfo_malformed() {
        let mock = MockSerialPort::from_lines(&[Some("USB OK FSINFO 1024 512")], b"FSINFO\n");
        let mut link = Link::new(Box::new(mock));
        assert!(matches!(query_usage(&mut link, Duration::from_secs(2)), Err(Error::Protocol(_))));

        let mock = MockSerialPort::from_lines(&[Some("USB OK FSINFO TAG 1024 lots 512")], b"FSINFO\n");
        let mut link = Link::new(Box::new(mock));
        assert!(matches!(query_usage(&mut link, Duration::from_secs(2)), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_fsinfo_device_error_and_timeout() {
        let mock = MockSerialPort::from_lines(&[Some("USB ERR FSFAIL")], b"FSINFO\n");
        let mut link = Link::new(Box::new(mock));
        assert!(matches!(query_usage(&mut link, Duration::from_secs(2)).unwrap_err(), Error::Device { .. }));

        let mock = MockSerialPort::from_lines(&[Some("USB OK PONG")], b"FSINFO\n");
        let mut link = Link::new(Box::new(mock));
        assert!(query_usage(&mut link, Duration::from_secs(2)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_list_scenario() {
        let mock = MockSerialPort::from_lines(
            &[
                Some("USB OK LIST a b D dirA 0"),
                Some("USB OK LIST a b F file.txt 123"),
                Some("USB OK LISTDONE"),
                Some("USB OK LISTDONE"),
            ],
            b"LIST\nLIST /dirA\n",
        );
        let mut link = Link::new(Box::new(mock));
        let entries = list_tree(&mut link, "/", &ListConfig::default()).unwrap();
        assert_eq!(entries, vec![entry("/dirA", true, 0), entry("/file.txt", false, 123)]);
    }

    #[test]
    fn test_list_empty_directory() {
        let mock = MockSerialPort::from_lines(&[Some("USB OK LISTDONE 0")], b"LIST /slides\n");
        let mut link = Link::new(Box::new(mock));
        let entries = list_tree(&mut link, "/slides/", &ListConfig::default()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_list_sorted_and_unique() {
        // /b is reported twice (once relative, once absolute from inside /a)
        // and must be expanded only once.
        let mock = MockSerialPort::from_lines(
            &[
                Some("USB OK LIST F z.txt 1"),
                Some("USB OK LIST D b 0"),
                Some("debug: scanning"),
                Some("USB OK LIST D a 0"),
                Some("USB OK LIST F . 0"),
                Some("USB OK LISTDONE 4"),
                // LIST /a (popped first: last pushed)
                Some("USB OK LIST D /b 0"),
                Some("USB OK LIST F m.bin 20"),
                Some("USB OK LISTDONE 2"),
                // LIST /b
                Some("USB OK LIST F c.jpg 300"),
                Some("USB OK LIST D .. 0"),
                Some("USB OK LISTDONE 2"),
            ],
            b"LIST\nLIST /a\nLIST /b\n",
        );
        let mut link = Link::new(Box::new(mock));
        let entries = list_tree(&mut link, "/", &ListConfig::default()).unwrap();
        assert_eq!(
            entries,
            vec![
                entry("/a", true, 0),
                entry("/a/m.bin", false, 20),
                entry("/b", true, 0),
                entry("/b/c.jpg", false, 300),
                entry("/z.txt", false, 1),
            ]
        );
    }

    #[test]
    fn test_list_failure_aborts_traversal() {
        let mock = MockSerialPort::from_lines(
            &[
                Some("USB OK LIST D broken 0"),
                Some("USB OK LIST F ok.txt 5"),
                Some("USB OK LISTDONE 2"),
                Some("USB ERR LISTOPEN /broken"),
            ],
            b"LIST\nLIST /broken\n",
        );
        let mut link = Link::new(Box::new(mock));
        match list_tree(&mut link, "/", &ListConfig::default()) {
            Err(Error::Device { message, path }) => {
                assert_eq!(message, "LISTOPEN /broken");
                assert_eq!(path.as_deref(), Some("/broken"));
            }
            other => panic!("Expected device error, got {:?}", other),
        }
    }

    #[test]
    fn test_list_stalled_directory_times_out() {
        let mock = MockSerialPort::from_lines(
            &[Some("USB OK LIST F half.txt 5"), None],
            b"LIST /system\n",
        );
        let mut link = Link::new(Box::new(mock));
        let err = list_tree(&mut link, "/system", &ListConfig::default()).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_list_bad_size_and_short_lines() {
        let mock = MockSerialPort::from_lines(
            &[
                Some("USB OK LIST F"),
                Some("USB OK LIST F weird.bin many"),
                Some("USB OK LISTDONE"),
            ],
            b"LIST\n",
        );
        let mut link = Link::new(Box::new(mock));
        let entries = list_tree(&mut link, "/", &ListConfig::default()).unwrap();
        assert_eq!(entries, vec![entry("/weird.bin", false, 0)]);
    }

    #[test]
    fn test_delete_file() {
        let mock = MockSerialPort::from_lines(
            &[Some("USB OK DELETE /slides/old.jpg")],
            b"DELETE /slides/old.jpg\n",
        );
        let mut link = Link::new(Box::new(mock));
        let removed = delete_file(&mut link, "slides//old.jpg", Duration::from_secs(2)).unwrap();
        assert_eq!(removed, "/slides/old.jpg");
    }

    #[test]
    fn test_delete_protected() {
        let mock = MockSerialPort::from_lines(
            &[Some("USB ERR DELPROT Datei geschützt")],
            b"DELETE /system/bootlogo.jpg\n",
        );
        let mut link = Link::new(Box::new(mock));
        let err = delete_file(&mut link, "/system/bootlogo.jpg", Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
    }
}
