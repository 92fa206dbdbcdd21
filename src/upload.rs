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

use std::io::{ErrorKind, Read};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use indicatif::ProgressBar;
use tracing::{debug, info, trace, warn};
use crate::codec::Response;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::*;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Largest single payload write; `None` writes the whole payload at once
    pub chunk_size: Option<usize>,
    /// Pause after each drained chunk
    pub chunk_delay: Duration,
    /// Wait for `USB OK START`
    pub start_timeout: Duration,
    /// Bound on the output queue draining after each chunk
    pub drain_timeout: Duration,
    pub drain_poll: Duration,
    /// Completion polling budget after `END`
    pub completion_attempts: usize,
    pub completion_poll: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: Some(1024),
            chunk_delay: Duration::ZERO,
            start_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(2),
            drain_poll: Duration::from_millis(10),
            completion_attempts: 15,
            completion_poll: Duration::from_secs(2),
        }
    }
}

/// What the caller asks to upload
pub struct UploadRequest {
    pub source: Box<dyn Read + Send>,
    pub filename: String,
    pub total_size: u64,
    pub target_dir: Option<String>,
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// `USB OK END` was received
    Confirmed,
    /// Only `USB OK PROG` was seen before the device went quiet. The file is
    /// very likely written but this can be a false positive.
    ProgressOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub filename: String,
    pub bytes_sent: u64,
    pub confirmation: Confirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Negotiating,
    Transferring,
    AwaitingCompletion,
}

// ============================================================================
// States
// ============================================================================

pub struct Idle;
pub struct Negotiating;
pub struct Transferring;
pub struct AwaitingCompletion;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct UploadFsm<State> {
    state: PhantomData<State>,
    link: Link,
    source: Box<dyn Read + Send>,
    filename: String,
    target_dir: Option<String>,
    total_size: u64,
    bytes_sent: u64,
    chunk: Vec<u8>,
    chunk_offset: usize,
    config: UploadConfig,
    progress: Option<ProgressBar>,
}

// ============================================================================
// Trait
// ============================================================================

pub enum Step {
    Next(Box<dyn UploadState>),
    Done(UploadOutcome),
}

/// Each state consumes the session and yields the next one. `Err` is the
/// `Failed` terminal state; `Step::Done` is `Completed`.
pub trait UploadState: Send {
    fn phase(&self) -> Phase;
    fn bytes_sent(&self) -> u64;
    fn step(self: Box<Self>) -> Result<Step>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> UploadFsm<S> {
    fn transition<T>(self) -> Box<UploadFsm<T>> {
        Box::new(UploadFsm {
            state: PhantomData,
            link: self.link,
            source: self.source,
            filename: self.filename,
            target_dir: self.target_dir,
            total_size: self.total_size,
            bytes_sent: self.bytes_sent,
            chunk: self.chunk,
            chunk_offset: self.chunk_offset,
            config: self.config,
            progress: self.progress,
        })
    }

    fn state_name() -> &'static str {
        let type_name = std::any::type_name::<S>();
        type_name.split("::").last().unwrap_or(type_name)
    }

    /// Best-effort `ABORT` when the caller interrupted the session.
    fn abort_if_cancelled<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(Error::Cancelled)) {
            warn!("upload cancelled in {}, sending {}", Self::state_name(), CMD_ABORT);
            self.send_abort();
        }
        result
    }

    /// Best-effort `ABORT` on any failure, so the device stops waiting for
    /// payload that will never come.
    fn abort_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("upload failed in {} ({}), sending {}", Self::state_name(), e, CMD_ABORT);
            self.send_abort();
        }
        result
    }

    /// Write failures are swallowed since the link is being released anyway.
    fn send_abort(&mut self) {
        if let Err(e) = self.link.send_command(CMD_ABORT) {
            debug!("{} not delivered: {}", CMD_ABORT, e);
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl UploadState for UploadFsm<Idle> {
    fn phase(&self) -> Phase {
        Phase::Idle
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn step(self: Box<Self>) -> Result<Step> {
        let mut fsm = *self;
        let mut command = format!("{} {} {}", CMD_START, fsm.total_size, fsm.filename);
        if let Some(dir) = &fsm.target_dir {
            command.push(' ');
            command.push_str(dir);
        }
        fsm.link.send_command(&command)?;

        let next = fsm.transition::<Negotiating>();
        Ok(Step::Next(next))
    }
}

impl UploadState for UploadFsm<Negotiating> {
    fn phase(&self) -> Phase {
        Phase::Negotiating
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn step(self: Box<Self>) -> Result<Step> {
        let mut fsm = *self;
        let deadline = Instant::now() + fsm.config.start_timeout;
        loop {
            match fsm.link.read_line(deadline)? {
                Some(resp) if resp.is_success(TAG_START) => {
                    info!("device accepted {} ({} bytes)", fsm.filename, fsm.total_size);
                    let next = fsm.transition::<Transferring>();
                    return Ok(Step::Next(next));
                }
                Some(Response::Failure { message }) => return Err(Error::device(message)),
                Some(_) => continue,
                None => return Err(Error::Timeout(format!("{} acknowledgement", CMD_START))),
            }
        }
    }
}

impl UploadFsm<Transferring> {
    /// Refill the chunk buffer from the payload source, never past
    /// `total_size`.
    fn next_chunk(&mut self) -> Result<()> {
        let remaining = self.total_size - self.bytes_sent;
        let limit = match self.config.chunk_size {
            Some(size) if size > 0 => (size as u64).min(remaining),
            _ => remaining,
        };

        self.chunk.resize(limit as usize, 0);
        self.chunk_offset = 0;
        self.source.read_exact(&mut self.chunk).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::File(std::io::Error::new(
                    e.kind(),
                    format!("payload ended before {} bytes", self.total_size),
                ))
            } else {
                Error::File(e)
            }
        })
    }

    /// Wait for the transport to put every queued byte on the wire.
    fn wait_for_drain(&mut self) -> Result<()> {
        self.link.flush()?;
        let started = Instant::now();
        loop {
            let outstanding = self.link.outstanding_output()?;
            if outstanding == 0 {
                return Ok(());
            }
            if started.elapsed() > self.config.drain_timeout {
                return Err(Error::Transport(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("{} bytes still queued after {:?}", outstanding, self.config.drain_timeout),
                )));
            }
            trace!("{} bytes outstanding", outstanding);
            self.link.cancel_token().check()?;
            std::thread::sleep(self.config.drain_poll);
        }
    }

    fn send_some(&mut self) -> Result<()> {
        self.link.cancel_token().check()?;

        if self.chunk_offset >= self.chunk.len() {
            self.next_chunk()?;
        }

        let accepted = self.link.write(&self.chunk[self.chunk_offset..])?;
        if accepted == 0 {
            return Err(Error::Transport(std::io::Error::new(
                ErrorKind::WriteZero,
                "link accepted no payload bytes",
            )));
        }
        self.chunk_offset += accepted;
        self.bytes_sent += accepted as u64;
        debug!("sent {}/{} bytes", self.bytes_sent, self.total_size);
        if let Some(pb) = &self.progress {
            pb.set_position(self.bytes_sent);
        }

        self.wait_for_drain()?;
        if !self.config.chunk_delay.is_zero() {
            std::thread::sleep(self.config.chunk_delay);
        }
        Ok(())
    }
}

impl UploadState for UploadFsm<Transferring> {
    fn phase(&self) -> Phase {
        Phase::Transferring
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn step(self: Box<Self>) -> Result<Step> {
        let mut fsm = *self;

        if fsm.bytes_sent < fsm.total_size {
            let result = fsm.send_some();
            fsm.abort_on_error(result)?;
            return Ok(Step::Next(Box::new(fsm)));
        }

        fsm.link.send_command(CMD_END)?;
        let next = fsm.transition::<AwaitingCompletion>();
        Ok(Step::Next(next))
    }
}

impl UploadFsm<AwaitingCompletion> {
    /// The device may answer `END` with `PROG` then `END`, or `PROG` alone
    /// when the final line is lost. `END` decides; `PROG` followed by one
    /// silent poll, or by debug chatter until the attempt budget runs out,
    /// is accepted as a soft success.
    fn await_completion(&mut self) -> Result<Confirmation> {
        let mut progress_seen = false;

        for attempt in 1..=self.config.completion_attempts {
            match self.link.read_line_within(self.config.completion_poll)? {
                Some(resp) if resp.is_success(TAG_END) => return Ok(Confirmation::Confirmed),
                Some(resp) if resp.is_success(TAG_PROG) => {
                    debug!("progress acknowledged on attempt {}", attempt);
                    progress_seen = true;
                }
                Some(Response::Failure { message }) => return Err(Error::device(message)),
                Some(_) => {}
                None if progress_seen => {
                    warn!("no {} after {}; assuming upload completed", TAG_END, TAG_PROG);
                    return Ok(Confirmation::ProgressOnly);
                }
                None => {}
            }
        }

        if progress_seen {
            warn!("{} never arrived after {}; assuming upload completed", TAG_END, TAG_PROG);
            return Ok(Confirmation::ProgressOnly);
        }
        Err(Error::Timeout(format!("{} confirmation", CMD_END)))
    }
}

impl UploadState for UploadFsm<AwaitingCompletion> {
    fn phase(&self) -> Phase {
        Phase::AwaitingCompletion
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn step(self: Box<Self>) -> Result<Step> {
        let mut fsm = *self;
        let result = fsm.await_completion();
        let confirmation = fsm.abort_if_cancelled(result)?;

        if let Some(pb) = &fsm.progress {
            pb.finish();
        }
        Ok(Step::Done(UploadOutcome {
            filename: fsm.filename,
            bytes_sent: fsm.bytes_sent,
            confirmation,
        }))
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl UploadFsm<Idle> {
    pub fn new(
        link: Link,
        request: UploadRequest,
        config: UploadConfig,
        progress: Option<ProgressBar>,
    ) -> Result<Box<dyn UploadState>> {
        if request.filename.is_empty() || request.filename.contains(char::is_whitespace) {
            return Err(Error::Invalid(format!(
                "filename {:?} cannot be sent in a command line",
                request.filename
            )));
        }
        if let Some(dir) = &request.target_dir {
            if dir.contains(char::is_whitespace) {
                return Err(Error::Invalid(format!("target directory {:?} contains whitespace", dir)));
            }
        }

        Ok(Box::new(UploadFsm {
            state: PhantomData::<Idle>,
            link,
            source: request.source,
            filename: request.filename,
            target_dir: request.target_dir,
            total_size: request.total_size,
            bytes_sent: 0,
            chunk: Vec::new(),
            chunk_offset: 0,
            config,
            progress,
        }))
    }
}

/// Drive a session to its terminal state. The link closes when the session
/// is dropped, whichever way it ends.
pub fn run_session(mut state: Box<dyn UploadState>) -> Result<UploadOutcome> {
    let mut phase = state.phase();
    loop {
        let sent = state.bytes_sent();
        match state.step() {
            Ok(Step::Next(next)) => {
                if next.phase() != phase {
                    debug!("upload {:?} -> {:?}", phase, next.phase());
                    phase = next.phase();
                }
                state = next;
            }
            Ok(Step::Done(outcome)) => return Ok(outcome),
            Err(e) => {
                debug!("upload failed in {:?} after {} bytes: {}", phase, sent, e);
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
