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

use std::io::{Read, Write};
use std::time::Duration;
use serialport::{ClearBuffer, SerialPort as SerialPortTrait};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte-level operations the transfer protocol needs from a link.
///
/// Implementations own no protocol knowledge; line framing lives in
/// [`crate::codec`].
pub trait SerialPort: Send {
    /// Write as much of `buf` as the port accepts, returning the count.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Block until some bytes arrive or `timeout` elapses. An elapsed
    /// timeout is reported as `ErrorKind::TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;

    fn flush(&mut self) -> std::io::Result<()>;

    /// Bytes queued for transmission but not yet on the wire.
    fn bytes_to_write(&mut self) -> std::io::Result<u32>;

    /// Drop anything received but not yet read.
    fn clear_input(&mut self) -> std::io::Result<()>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)?;
        self.port.read(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }

    fn bytes_to_write(&mut self) -> std::io::Result<u32> {
        Ok(self.port.bytes_to_write()?)
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        Ok(self.port.clear(ClearBuffer::Input)?)
    }
}

/// Name and kind of every serial port the OS reports
pub fn available_ports() -> Result<Vec<(String, String)>, serialport::Error> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let product = info.product.unwrap_or_else(|| "USB".to_string());
                    format!("{} ({:04x}:{:04x})", product, info.vid, info.pid)
                }
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "unknown".to_string(),
            };
            (p.port_name, kind)
        })
        .collect())
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    write_sizes: Vec<usize>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    expected_write_sizes: Option<Vec<usize>>,
    // Cap on bytes accepted by a single write (None = accept all)
    accept_limit: Option<usize>,
    // Output queue never drains
    stalled: bool,
    // Writes after this many calls fail with BrokenPipe
    write_budget: Option<usize>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            write_sizes: Vec::new(),
            expected_writes,
            expected_write_sizes: None,
            accept_limit: None,
            stalled: false,
            write_budget: None,
        }
    }

    /// Script device output line by line. `None` produces one read timeout.
    pub fn from_lines(lines: &[Option<&str>], expected_writes: &[u8]) -> Self {
        let mut responses = Vec::new();
        for line in lines {
            match line {
                Some(text) => {
                    responses.extend(text.bytes().map(Some));
                    responses.push(Some(b'\n'));
                }
                None => responses.push(None),
            }
        }
        Self::new(responses, expected_writes.to_vec())
    }

    pub fn expect_write_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.expected_write_sizes = Some(sizes);
        self
    }

    pub fn accept_at_most(mut self, limit: usize) -> Self {
        self.accept_limit = Some(limit);
        self
    }

    pub fn stall_output(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn fail_writes_after(mut self, calls: usize) -> Self {
        self.write_budget = Some(calls);
        self
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.write_budget.is_some_and(|budget| self.write_sizes.len() >= budget) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Mock port gone"));
        }
        let n = match self.accept_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        self.write_log.extend_from_slice(&buf[..n]);
        self.write_sizes.push(n);
        Ok(n)
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn bytes_to_write(&mut self) -> std::io::Result<u32> {
        Ok(if self.stalled { 64 } else { 0 })
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:?}\nGot {} bytes:\n{:?}",
            self.expected_writes.len(),
            String::from_utf8_lossy(&self.expected_writes),
            self.write_log.len(),
            String::from_utf8_lossy(&self.write_log)
        );

        if let Some(sizes) = &self.expected_write_sizes {
            assert_eq!(&self.write_sizes, sizes, "MockSerialPort write sizes mismatch");
        }
    }
}
