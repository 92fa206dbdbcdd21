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

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open serial port: {0}")]
    Open(#[from] serialport::Error),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("device error{}: {message}", path_suffix(.path))]
    Device {
        message: String,
        path: Option<String>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("file error: {0}")]
    File(std::io::Error),

    #[error("invalid request: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn path_suffix(path: &Option<String>) -> String {
    match path {
        Some(p) => format!(" for {p}"),
        None => String::new(),
    }
}

impl Error {
    pub fn device(message: impl Into<String>) -> Self {
        Error::Device { message: message.into(), path: None }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        assert_eq!(Error::device("NOSPACE").to_string(), "device error: NOSPACE");

        let err = Error::Device {
            message: "LISTOPEN /gone".to_string(),
            path: Some("/gone".to_string()),
        };
        assert_eq!(err.to_string(), "device error for /gone: LISTOPEN /gone");
    }

    #[test]
    fn test_io_error_is_transport() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!err.is_timeout());
    }
}
