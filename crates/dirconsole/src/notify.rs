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

//! Background listener for output the director sends to an idle Session

use crate::error::{ConnectionId, Result};
use crate::handler::{self, ConsoleHandler};
use crate::message::{ControlCode, Frame, PendingDialog};
use crate::ops;
use crate::session::{Session, SessionFlags, Step};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Drains unsolicited frames from one Session while it is idle and its
/// notifications are enabled.
///
/// The Session lock is held for at most one poll interval at a time, so a
/// caller waiting to run a command gets in between two polls.
pub struct NotificationDispatcher {
    conn: ConnectionId,
    session: Arc<Mutex<Session>>,
    flags: Arc<SessionFlags>,
    cancel: CancellationToken,
    handler: Arc<dyn ConsoleHandler>,
    poll_interval: Duration,
    auto_fetch_messages: bool,
}

impl NotificationDispatcher {
    pub fn new(
        conn: ConnectionId,
        session: Arc<Mutex<Session>>,
        flags: Arc<SessionFlags>,
        cancel: CancellationToken,
        handler: Arc<dyn ConsoleHandler>,
    ) -> Self {
        Self {
            conn,
            session,
            flags,
            cancel,
            handler,
            poll_interval: Duration::from_millis(50),
            auto_fetch_messages: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run `.messages` as soon as the director reports pending messages
    pub fn with_auto_fetch(mut self, enable: bool) -> Self {
        self.auto_fetch_messages = enable;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        debug!(conn = self.conn, "notification listener started");
        loop {
            if self.cancel.is_cancelled() || !self.flags.is_connected() {
                break;
            }
            if !(self.flags.is_ready() && self.flags.is_notify_enabled()) {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            let mut session = tokio::select! {
                _ = self.cancel.cancelled() => break,
                guard = self.session.lock() => guard,
            };
            // Someone may have started an exchange while we waited
            if !(session.is_ready() && session.is_notify_enabled()) {
                continue;
            }

            let polled = session.poll(self.poll_interval).await;
            let outcome = match polled {
                Ok(None) => Ok(()),
                Ok(Some(frame)) => self.dispatch(&mut session, frame).await,
                Err(e) => Err(e),
            };
            drop(session);

            if let Err(e) = outcome {
                debug!(conn = self.conn, error = %e, "notification listener stopping");
                break;
            }
            // Let a queued command take the lock
            tokio::task::yield_now().await;
        }
        self.handler.on_disconnected(self.conn).await;
        debug!(conn = self.conn, "notification listener finished");
    }

    async fn dispatch(&self, session: &mut Session, frame: Frame) -> Result<()> {
        trace!(conn = self.conn, ?frame, "unsolicited frame");
        let pending = frame == Frame::Control(ControlCode::MsgsPending);
        let handler = self.handler.as_ref();

        match session.step_from(frame).await? {
            Step::Line(line) => handler.on_text_line(self.conn, &line).await,
            Step::Message(severity, text) => {
                handler::route_message(handler, self.conn, severity, &text).await
            }
            Step::Dialog(kind) => {
                let mut quiet = session.quiet();
                let body = handler::collect_dialog_body(&mut quiet, handler).await?;
                let dialog = PendingDialog {
                    conn: self.conn,
                    kind,
                    body,
                };
                match handler::offer_dialog(&mut quiet, handler, dialog).await? {
                    Some(unhandled) => {
                        // Left at the sub-prompt for a caller to answer
                        for line in &unhandled.body {
                            handler.on_text_line(self.conn, line).await;
                        }
                    }
                    None if quiet.at_prompt() => {}
                    None => {
                        let mut lines = Vec::new();
                        handler::drive_exchange(&mut quiet, handler, &mut lines).await?;
                        for line in &lines {
                            handler.on_text_line(self.conn, line).await;
                        }
                    }
                }
            }
            Step::Continue if pending => {
                handler.on_messages_pending(self.conn).await;
                if self.auto_fetch_messages {
                    let mut quiet = session.quiet();
                    let lines =
                        handler::run_exchange(&mut quiet, handler, &ops::messages_command()).await?;
                    quiet.clear_messages_pending();
                    for line in &lines {
                        handler.on_text_line(self.conn, line).await;
                    }
                }
            }
            Step::Continue | Step::Done => {}
        }
        Ok(())
    }
}
