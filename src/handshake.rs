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

use std::time::{Duration, Instant};
use tracing::debug;
use crate::codec::Response;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::{CMD_PING, TAG_PONG};

/// Confirm the device is in transfer mode and answering.
///
/// Debug text the firmware prints before `PONG` is skipped. A timeout is
/// returned to the caller as-is; nothing is retried here.
pub fn ping(link: &mut Link, timeout: Duration) -> Result<()> {
    link.discard_input()?;
    link.send_command(CMD_PING)?;

    let deadline = Instant::now() + timeout;
    loop {
        match link.read_line(deadline)? {
            Some(resp) if resp.is_success(TAG_PONG) => return Ok(()),
            Some(Response::Failure { message }) => return Err(Error::device(message)),
            Some(other) => debug!("ignoring while waiting for PONG: {:?}", other),
            None => return Err(Error::Timeout("PONG; is USB transfer mode active?".to_string())),
        }
    }
}
