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

//! USB transfer protocol constants
//!
//! Commands are ASCII lines terminated by `\n`. Every protocol response starts
//! with one of the two prefixes below; anything else on the wire is firmware
//! debug output.

/// Line terminator for commands and responses
pub const LINE_END: u8 = b'\n';

/// Prefix of a success response, followed by `<tag> [args...]`
pub const OK_PREFIX: &str = "USB OK ";

/// Prefix of a failure response, followed by the device's message
pub const ERR_PREFIX: &str = "USB ERR ";

// ============================================================================
// Commands (host -> device)
// ============================================================================

/// Liveness probe
pub const CMD_PING: &str = "PING";

/// Filesystem usage query
pub const CMD_FSINFO: &str = "FSINFO";

/// Single directory listing, optionally followed by a directory path
pub const CMD_LIST: &str = "LIST";

/// Begin an upload: `START <size> <filename> [<targetDir>]`
pub const CMD_START: &str = "START";

/// Upload payload complete
pub const CMD_END: &str = "END";

/// Abandon the active upload
pub const CMD_ABORT: &str = "ABORT";

/// Download a file: `READ <path>`
pub const CMD_READ: &str = "READ";

/// Remove a file: `DELETE <path>`
pub const CMD_DELETE: &str = "DELETE";

// ============================================================================
// Success tags (device -> host)
// ============================================================================

/// Answer to PING
pub const TAG_PONG: &str = "PONG";

/// Answer to FSINFO, trailing args are total, used and free bytes
pub const TAG_FSINFO: &str = "FSINFO";

/// One directory entry, trailing args are type, name and size
pub const TAG_LIST: &str = "LIST";

/// End of a directory listing
pub const TAG_LISTDONE: &str = "LISTDONE";

/// Upload accepted, payload may follow
pub const TAG_START: &str = "START";

/// Upload progress acknowledgement
pub const TAG_PROG: &str = "PROG";

/// Upload written to flash
pub const TAG_END: &str = "END";

/// Download header: `READ <size> <name>`
pub const TAG_READ: &str = "READ";

/// Download trailer: `READEND <count>`
pub const TAG_READEND: &str = "READEND";

/// File removed
pub const TAG_DELETE: &str = "DELETE";

/// Entry type marker for directories in a LIST line
pub const ENTRY_DIR: &str = "D";
