// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! One authenticated connection to a director and its prompt state

use crate::auth;
use crate::codec::WireCodec;
use crate::config::{Credential, Endpoint, SessionSettings};
use crate::error::{ConnectionId, DirConsoleError, Result};
use crate::message::{ControlCode, DialogKind, Frame, Severity, WriteOutcome};
use crate::ops;
use crate::tls::TlsContext;
use crate::transport::{self, FramedTransport, Transport};
use futures::{SinkExt, StreamExt};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Session state readable without holding the Session itself.
///
/// The pool and the notification listener scan these while another task
/// may be in the middle of an exchange on the Session.
#[derive(Debug, Default)]
pub struct SessionFlags {
    connected: AtomicBool,
    at_prompt: AtomicBool,
    at_main_prompt: AtomicBool,
    notify: AtomicBool,
    messages_pending: AtomicBool,
}

impl SessionFlags {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn at_prompt(&self) -> bool {
        self.at_prompt.load(Ordering::Acquire)
    }

    pub fn at_main_prompt(&self) -> bool {
        self.at_main_prompt.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.at_prompt() && self.at_main_prompt()
    }

    pub fn is_notify_enabled(&self) -> bool {
        self.notify.load(Ordering::Acquire)
    }

    /// Returns the previous state
    pub fn set_notify(&self, enable: bool) -> bool {
        self.notify.swap(enable, Ordering::AcqRel)
    }

    pub fn messages_pending(&self) -> bool {
        self.messages_pending.load(Ordering::Acquire)
    }

    pub fn clear_messages_pending(&self) {
        self.messages_pending.store(false, Ordering::Release);
    }

    fn set_prompt(&self, at_prompt: bool, at_main_prompt: bool) {
        self.at_prompt.store(at_prompt, Ordering::Release);
        self.at_main_prompt.store(at_main_prompt, Ordering::Release);
    }

    /// Mark the Session dead ahead of it noticing its cancellation
    pub(crate) fn mark_terminated(&self) {
        self.notify.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.set_prompt(false, false);
    }
}

/// What one protocol step of an exchange produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Line(String),
    Message(Severity, String),
    Dialog(DialogKind),
    /// The director is waiting for input
    Done,
    Continue,
}

/// A physical connection to a director.
///
/// Created disconnected; [`Session::connect`] opens and authenticates the
/// socket. Once the connection is lost or [`Session::terminate`] is called
/// the Session stays disconnected for good.
pub struct Session {
    id: ConnectionId,
    endpoint: Endpoint,
    credential: Credential,
    tls: Option<TlsContext>,
    settings: SessionSettings,
    framed: Option<FramedTransport>,
    flags: Arc<SessionFlags>,
    cancel: CancellationToken,
    depth: u32,
    blank_sent: bool,
    api_mode: bool,
    greeting: Option<String>,
    partial_since: Option<Instant>,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        endpoint: Endpoint,
        credential: Credential,
        tls: Option<TlsContext>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id,
            endpoint,
            credential,
            tls,
            settings,
            framed: None,
            flags: Arc::new(SessionFlags::default()),
            cancel: CancellationToken::new(),
            depth: 0,
            blank_sent: false,
            api_mode: false,
            greeting: None,
            partial_since: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn flags(&self) -> Arc<SessionFlags> {
        self.flags.clone()
    }

    /// Token that terminates this Session when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Open the socket and authenticate. A no-op on a connected Session.
    pub async fn connect(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(DirConsoleError::Disconnected);
        }

        let label = self.endpoint.display_addr();
        debug!(conn = self.id, endpoint = %label, "connecting");
        let tcp = transport::open(&self.endpoint, self.settings.connect_timeout).await?;
        let framed = Framed::new(Transport::Plain(tcp), WireCodec);
        let (framed, greeting) =
            auth::authenticate(framed, &self.endpoint, &self.credential, self.tls.as_ref()).await?;

        self.framed = Some(framed);
        self.greeting = Some(greeting);
        self.depth = 0;
        self.blank_sent = false;
        self.flags.connected.store(true, Ordering::Release);
        self.flags.set_prompt(true, true);
        debug!(conn = self.id, endpoint = %label, "connected");

        if let Some(level) = self.endpoint.api_level {
            self.enable_api(level).await?;
        }
        self.flags.set_notify(true);
        Ok(())
    }

    /// Text of the director's `1000 OK:` line
    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    pub fn is_in_command(&self) -> bool {
        self.depth > 0
    }

    pub fn command_depth(&self) -> u32 {
        self.depth
    }

    pub fn is_ready(&self) -> bool {
        self.flags.is_ready()
    }

    pub fn at_prompt(&self) -> bool {
        self.flags.at_prompt()
    }

    pub fn at_main_prompt(&self) -> bool {
        self.flags.at_main_prompt()
    }

    pub fn is_api_mode(&self) -> bool {
        self.api_mode
    }

    pub fn set_notify(&self, enable: bool) -> bool {
        self.flags.set_notify(enable)
    }

    pub fn is_notify_enabled(&self) -> bool {
        self.flags.is_notify_enabled()
    }

    pub fn messages_pending(&self) -> bool {
        self.flags.messages_pending()
    }

    pub fn clear_messages_pending(&self) {
        self.flags.clear_messages_pending();
    }

    /// Send one command line.
    ///
    /// A blank line right after another blank line is not transmitted and
    /// yields [`WriteOutcome::Discarded`].
    pub async fn write(&mut self, line: &str) -> Result<WriteOutcome> {
        let framed = self.framed.as_mut().ok_or(DirConsoleError::Disconnected)?;

        let blank = line.trim().is_empty();
        if blank && self.blank_sent {
            trace!(conn = self.id, "discarding repeated blank line");
            return Ok(WriteOutcome::Discarded);
        }
        self.blank_sent = blank;
        self.flags.set_prompt(false, false);

        trace!(conn = self.id, command = line, "write");
        match framed.send(Frame::text(line)).await {
            Ok(()) => Ok(WriteOutcome::Sent(line.len())),
            Err(e) => {
                warn!(conn = self.id, error = %e, "write failed, closing session");
                self.terminate();
                Err(e)
            }
        }
    }

    /// Read one frame, applying its effect on the prompt state.
    ///
    /// Waits in `poll_interval` slices so that a terminate from another
    /// task, or a stalled partial frame, is noticed promptly.
    pub async fn read(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.poll(self.settings.poll_interval).await? {
                return Ok(frame);
            }
        }
    }

    /// Wait at most `wait` for a frame
    pub async fn poll(&mut self, wait: Duration) -> Result<Option<Frame>> {
        enum Wake {
            Cancelled,
            Received(Option<Result<Frame>>),
            Idle,
        }

        loop {
            let wake = {
                let framed = self.framed.as_mut().ok_or(DirConsoleError::Disconnected)?;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Wake::Cancelled,
                    next = framed.next() => Wake::Received(next),
                    _ = tokio::time::sleep(wait) => Wake::Idle,
                }
            };

            match wake {
                Wake::Cancelled => {
                    self.terminate();
                    return Err(DirConsoleError::Disconnected);
                }
                Wake::Idle => {
                    self.check_partial_frame()?;
                    return Ok(None);
                }
                Wake::Received(None) => {
                    debug!(conn = self.id, "director closed the connection");
                    self.terminate();
                    return Ok(Some(Frame::Control(ControlCode::HardEof)));
                }
                Wake::Received(Some(Err(e))) => {
                    warn!(conn = self.id, error = %e, "read failed, closing session");
                    self.terminate();
                    return Err(e);
                }
                Wake::Received(Some(Ok(frame))) => {
                    self.partial_since = None;
                    if self.apply(&frame) {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    fn check_partial_frame(&mut self) -> Result<()> {
        let buffered = match &self.framed {
            Some(framed) => framed.read_buffer().len(),
            None => return Err(DirConsoleError::Disconnected),
        };
        if buffered == 0 {
            self.partial_since = None;
            return Ok(());
        }
        let since = *self.partial_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.settings.frame_timeout {
            warn!(conn = self.id, buffered, "frame never completed, closing session");
            self.terminate();
            return Err(DirConsoleError::protocol(
                format!(
                    "Short read: {} bytes of an incomplete frame after {:?}",
                    buffered, self.settings.frame_timeout
                ),
                buffered,
            ));
        }
        Ok(())
    }

    /// Update state for a received frame. Returns false when the frame is
    /// consumed here and must not reach the caller.
    fn apply(&mut self, frame: &Frame) -> bool {
        let code = match frame {
            Frame::Text(_) => return true,
            Frame::Control(code) => *code,
        };
        trace!(conn = self.id, %code, depth = self.depth, "control");

        match code {
            ControlCode::CmdBegin => {
                self.depth += 1;
                self.flags.set_prompt(false, false);
            }
            ControlCode::CmdOk | ControlCode::CmdFailed => {
                self.depth = self.depth.saturating_sub(1);
                self.flags.set_prompt(false, false);
            }
            ControlCode::MainPrompt => self.flags.set_prompt(true, true),
            ControlCode::SubPrompt => self.flags.set_prompt(true, false),
            ControlCode::HardEof => self.terminate(),
            ControlCode::MsgsPending => {
                self.flags.messages_pending.store(true, Ordering::Release);
            }
            ControlCode::Eod if self.api_mode => return false,
            ControlCode::Eod if self.depth == 0 => self.flags.set_prompt(true, true),
            _ => {}
        }
        true
    }

    /// Read one frame and classify it for an exchange loop
    pub(crate) async fn next_step(&mut self) -> Result<Step> {
        let frame = self.read().await?;
        self.step_from(frame).await
    }

    /// Classify a frame already read. Message codes pull their text frame.
    pub(crate) async fn step_from(&mut self, frame: Frame) -> Result<Step> {
        let code = match frame {
            Frame::Text(text) => return Ok(Step::Line(text)),
            Frame::Control(code) => code,
        };

        if let Some(severity) = code.severity() {
            return match self.read().await? {
                Frame::Text(text) => Ok(Step::Message(severity, text)),
                Frame::Control(ControlCode::HardEof) => Err(DirConsoleError::Disconnected),
                Frame::Control(other) => {
                    self.terminate();
                    Err(DirConsoleError::protocol(
                        format!("{} followed by {} instead of message text", code, other),
                        0,
                    ))
                }
            };
        }
        if let Some(kind) = code.dialog_kind() {
            return Ok(Step::Dialog(kind));
        }

        Ok(match code {
            ControlCode::HardEof => return Err(DirConsoleError::Disconnected),
            ControlCode::SubPrompt => Step::Done,
            ControlCode::MainPrompt if self.depth == 0 => Step::Done,
            ControlCode::Eod if self.depth == 0 => Step::Done,
            _ => Step::Continue,
        })
    }

    /// Switch the director into API mode for this connection
    pub async fn enable_api(&mut self, level: u8) -> Result<()> {
        self.write(&ops::api_command(level)).await?;
        loop {
            match self.next_step().await? {
                Step::Done => break,
                Step::Message(severity, text) => {
                    debug!(conn = self.id, ?severity, text = %text.trim_end(), "during .api");
                }
                _ => {}
            }
        }
        self.api_mode = true;
        debug!(conn = self.id, level, "API mode enabled");
        Ok(())
    }

    /// Disable notifications and close the socket. Safe to call repeatedly.
    pub fn terminate(&mut self) {
        self.cancel.cancel();
        self.flags.mark_terminated();
        if self.framed.take().is_some() {
            debug!(conn = self.id, "session terminated");
        }
    }

    /// Suspend notifications until the returned guard is dropped
    pub fn quiet(&mut self) -> QuietSession<'_> {
        let previous = self.set_notify(false);
        QuietSession {
            session: self,
            previous,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// A Session with notifications switched off.
///
/// Dropping the guard restores the previous notification state, unless the
/// Session was terminated in the meantime.
pub struct QuietSession<'a> {
    session: &'a mut Session,
    previous: bool,
}

impl Deref for QuietSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for QuietSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for QuietSession<'_> {
    fn drop(&mut self) {
        if self.session.is_connected() && !self.session.cancel.is_cancelled() {
            self.session.set_notify(self.previous);
        }
    }
}
