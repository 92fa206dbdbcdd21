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

//! Line framing and response classification

use crate::protocol::{ERR_PREFIX, LINE_END, OK_PREFIX};

// ============================================================================
// Response
// ============================================================================

/// One classified response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `USB OK <tag> [args...]`
    Success { tag: String, args: Vec<String> },
    /// `USB ERR <message>`
    Failure { message: String },
    /// Anything else, typically firmware debug output
    Unclassified(String),
}

impl Response {
    /// Classify a decoded line. Empty lines never classify.
    pub fn classify(line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        // Prefixes include their trailing space, so match the trimmed
        // "USB OK" / "USB ERR" forms too when nothing follows.
        if let Some(rest) = strip_prefix_word(line, OK_PREFIX) {
            let mut words = rest.split_whitespace();
            return Some(match words.next() {
                Some(tag) => Response::Success {
                    tag: tag.to_string(),
                    args: words.map(str::to_string).collect(),
                },
                None => Response::Unclassified(line.to_string()),
            });
        }

        if let Some(rest) = strip_prefix_word(line, ERR_PREFIX) {
            return Some(Response::Failure { message: rest.trim().to_string() });
        }

        Some(Response::Unclassified(line.to_string()))
    }

    pub fn is_success(&self, expected: &str) -> bool {
        matches!(self, Response::Success { tag, .. } if tag == expected)
    }
}

fn strip_prefix_word<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)
        .or_else(|| (line == prefix.trim_end()).then_some(""))
}

// ============================================================================
// Line Reader
// ============================================================================

/// Accumulates received bytes and splits them on the line terminator.
///
/// A partial line stays buffered until its terminator arrives, so short reads
/// never lose data.
#[derive(Debug, Default)]
pub struct LineReader {
    buffer: Vec<u8>,
}

impl LineReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its terminator or a trailing `\r`.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == LINE_END)?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Move up to `out.len()` buffered bytes into `out` without framing.
    pub fn take_raw(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.buffer.len());
        out[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        n
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
