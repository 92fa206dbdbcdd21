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

//! Exclusive, scoped ownership of one serial link

use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use crate::cancel::CancelToken;
use crate::codec::{LineReader, Response};
use crate::error::{Error, Result};
use crate::protocol::LINE_END;
use crate::serial::SerialPort;

const READ_CHUNK: usize = 256;

/// A serial port plus the line framing state of its input stream.
///
/// Exactly one operation holds a `Link` at a time. Dropping it flushes and
/// releases the port, so every exit path closes the link.
pub struct Link {
    serial: Box<dyn SerialPort>,
    reader: LineReader,
    cancel: CancelToken,
}

impl Link {
    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        Link {
            serial,
            reader: LineReader::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Write one command line and flush it.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        debug!("-> {}", command);
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(LINE_END);

        let mut written = 0;
        while written < line.len() {
            let n = self.serial.write(&line[written..])?;
            if n == 0 {
                return Err(Error::Transport(std::io::Error::new(
                    ErrorKind::WriteZero,
                    format!("link accepted no bytes of {command}"),
                )));
            }
            written += n;
        }
        self.serial.flush()?;
        Ok(())
    }

    /// Write raw payload bytes, returning how many the transport accepted.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.serial.write(buf)?)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.serial.flush()?)
    }

    /// Bytes written but not yet physically transmitted.
    pub fn outstanding_output(&mut self) -> Result<u32> {
        Ok(self.serial.bytes_to_write()?)
    }

    /// Drop everything received so far, buffered or not.
    pub fn discard_input(&mut self) -> Result<()> {
        if self.reader.buffered() > 0 {
            trace!("discarding {} buffered bytes", self.reader.buffered());
        }
        self.reader.clear();
        self.serial.clear_input()?;
        Ok(())
    }

    /// Read the next non-empty response line.
    ///
    /// Returns `Ok(None)` once `deadline` passes without a complete line;
    /// whether that is fatal is the caller's decision.
    pub fn read_line(&mut self, deadline: Instant) -> Result<Option<Response>> {
        loop {
            while let Some(line) = self.reader.next_line() {
                if let Some(response) = Response::classify(&line) {
                    debug!("<- {}", line.trim());
                    return Ok(Some(response));
                }
            }

            self.cancel.check()?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut buf = [0u8; READ_CHUNK];
            match self.serial.read_timeout(&mut buf, deadline - now) {
                Ok(n) => self.reader.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    /// Read the next response line, waiting at most `timeout`.
    pub fn read_line_within(&mut self, timeout: Duration) -> Result<Option<Response>> {
        self.read_line(Instant::now() + timeout)
    }

    /// Read unframed bytes, serving anything the line reader already holds
    /// first. Returns `Ok(0)` when `timeout` elapses with nothing received.
    pub fn read_raw(&mut self, out: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.reader.buffered() > 0 {
            return Ok(self.reader.take_raw(out));
        }

        self.cancel.check()?;

        match self.serial.read_timeout(out, timeout) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Release the link. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Err(e) = self.serial.flush() {
            debug!("flush on close failed: {}", e);
        }
        debug!("link closed");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn test_send_command_appends_terminator() {
        let mock = MockSerialPort::from_lines(&[], b"FSINFO\n");
        let mut link = Link::new(Box::new(mock));
        link.send_command("FSINFO").unwrap();
    }

    #[test]
    fn test_send_command_retries_partial_writes() {
        let mock = MockSerialPort::from_lines(&[], b"LIST /system\n")
            .accept_at_most(4)
            .expect_write_sizes(vec![4, 4, 4, 1]);
        let mut link = Link::new(Box::new(mock));
        link.send_command("LIST /system").unwrap();
    }

    #[test]
    fn test_read_line_skips_empty_lines() {
        let mock = MockSerialPort::from_lines(&[Some(""), Some("\r"), Some("USB OK PONG")], b"");
        let mut link = Link::new(Box::new(mock));
        let resp = link.read_line(soon()).unwrap();
        assert!(resp.unwrap().is_success("PONG"));
    }

    #[test]
    fn test_read_line_timeout_is_not_an_error() {
        let mock = MockSerialPort::from_lines(&[None], b"");
        let mut link = Link::new(Box::new(mock));
        assert_eq!(link.read_line(soon()).unwrap(), None);
    }

    #[test]
    fn test_partial_line_survives_timeout() {
        let mut responses: Vec<Option<u8>> = b"USB OK PO".iter().map(|&b| Some(b)).collect();
        responses.push(None);
        responses.extend(b"NG\n".iter().map(|&b| Some(b)));
        let mock = MockSerialPort::new(responses, vec![]);
        let mut link = Link::new(Box::new(mock));

        assert_eq!(link.read_line(soon()).unwrap(), None);
        assert!(link.read_line(soon()).unwrap().unwrap().is_success("PONG"));
    }

    #[test]
    fn test_past_deadline_does_not_read() {
        let mock = MockSerialPort::from_lines(&[Some("USB OK PONG")], b"");
        let mut link = Link::new(Box::new(mock));
        assert_eq!(link.read_line(Instant::now() - Duration::from_millis(1)).unwrap(), None);
        assert!(link.read_line(soon()).unwrap().unwrap().is_success("PONG"));
    }

    #[test]
    fn test_read_line_observes_cancel() {
        let mock = MockSerialPort::from_lines(&[], b"");
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut link = Link::new(Box::new(mock)).with_cancel(cancel);
        assert!(matches!(link.read_line(soon()), Err(Error::Cancelled)));
    }

    #[test]
    fn test_read_raw_drains_line_buffer_first() {
        let mut responses: Vec<Option<u8>> = b"USB OK READ 4 x\nab".iter().map(|&b| Some(b)).collect();
        responses.push(None);
        responses.extend(b"cd".iter().map(|&b| Some(b)));
        let mock = MockSerialPort::new(responses, vec![]);
        let mut link = Link::new(Box::new(mock));

        assert!(link.read_line(soon()).unwrap().unwrap().is_success("READ"));

        let mut out = [0u8; 4];
        assert_eq!(link.read_raw(&mut out, Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(&out[..2], b"ab");
        assert_eq!(link.read_raw(&mut out, Duration::from_secs(1)).unwrap(), 0);
        assert_eq!(link.read_raw(&mut out, Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(&out[..2], b"cd");
    }
}
