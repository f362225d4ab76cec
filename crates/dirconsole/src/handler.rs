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

//! Callbacks for server-initiated output and the command exchange loop

use crate::error::{ConnectionId, Result};
use crate::message::{PendingDialog, Severity, WriteOutcome};
use crate::session::{Session, Step};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

/// Receiver for everything the director sends outside a caller's result
/// lines. Every method has a no-op default.
#[async_trait]
pub trait ConsoleHandler: Send + Sync {
    /// Unsolicited text on an idle Session
    async fn on_text_line(&self, _conn: ConnectionId, _line: &str) {}

    /// Text announced by `ERROR_MSG`, `WARNING_MSG` or `INFO_MSG`
    async fn on_message(&self, _conn: ConnectionId, _severity: Severity, _text: &str) {}

    /// The director has queued messages for `.messages`
    async fn on_messages_pending(&self, _conn: ConnectionId) {}

    /// An interactive request from the director.
    ///
    /// Return `Ok(true)` after answering it through `session`. Returning
    /// `Ok(false)` leaves the Session at its sub-prompt and hands the
    /// dialog text back as command output.
    async fn on_dialog(
        &self,
        _session: DialogSession<'_>,
        _dialog: PendingDialog,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn on_disconnected(&self, _conn: ConnectionId) {}
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConsoleHandler for NoopHandler {}

/// The Session a dialog arrived on, lent to the handler while it answers
pub struct DialogSession<'a> {
    session: &'a mut Session,
}

impl<'a> DialogSession<'a> {
    pub(crate) fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    pub fn conn(&self) -> ConnectionId {
        self.session.id()
    }

    /// Send the answer and let the surrounding exchange collect the rest
    pub async fn answer(&mut self, line: &str) -> Result<WriteOutcome> {
        self.session.write(line).await
    }

    /// Send a line and collect everything up to the next prompt.
    ///
    /// Nested dialogs are not offered to any handler; their text is
    /// returned with the rest.
    pub async fn run(&mut self, line: &str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        if !self.session.write(line).await?.was_sent() {
            return Ok(lines);
        }
        loop {
            match self.session.next_step().await? {
                Step::Line(text) => lines.push(text),
                Step::Message(severity, text) => log_message(self.session.id(), severity, &text),
                Step::Done => return Ok(lines),
                Step::Dialog(_) | Step::Continue => {}
            }
        }
    }
}

fn log_message(conn: ConnectionId, severity: Severity, text: &str) {
    let text = text.trim_end();
    match severity {
        Severity::Error => error!(conn, "{}", text),
        Severity::Warning => warn!(conn, "{}", text),
        Severity::Info => info!(conn, "{}", text),
    }
}

pub(crate) async fn route_message(
    handler: &dyn ConsoleHandler,
    conn: ConnectionId,
    severity: Severity,
    text: &str,
) {
    log_message(conn, severity, text);
    handler.on_message(conn, severity, text).await;
}

/// Gather the text of a dialog up to the prompt that ends it
pub(crate) async fn collect_dialog_body(
    session: &mut Session,
    handler: &dyn ConsoleHandler,
) -> Result<Vec<String>> {
    let mut body = Vec::new();
    loop {
        match session.next_step().await? {
            Step::Line(text) => body.push(text),
            Step::Message(severity, text) => {
                route_message(handler, session.id(), severity, &text).await
            }
            Step::Done => return Ok(body),
            Step::Dialog(_) | Step::Continue => {}
        }
    }
}

/// Offer a dialog to the handler. Returns the dialog back if it was not
/// handled.
pub(crate) async fn offer_dialog(
    session: &mut Session,
    handler: &dyn ConsoleHandler,
    dialog: PendingDialog,
) -> Result<Option<PendingDialog>> {
    debug!(conn = dialog.conn, kind = ?dialog.kind, lines = dialog.body.len(), "dialog");
    let handled = handler
        .on_dialog(DialogSession::new(session), dialog.clone())
        .await?;
    Ok(if handled { None } else { Some(dialog) })
}

/// Collect output until the director is waiting for input
pub(crate) async fn drive_exchange(
    session: &mut Session,
    handler: &dyn ConsoleHandler,
    lines: &mut Vec<String>,
) -> Result<()> {
    let conn = session.id();
    loop {
        match session.next_step().await? {
            Step::Line(text) => lines.push(text),
            Step::Message(severity, text) => route_message(handler, conn, severity, &text).await,
            Step::Continue => {}
            Step::Done => return Ok(()),
            Step::Dialog(kind) => {
                let body = collect_dialog_body(session, handler).await?;
                let dialog = PendingDialog { conn, kind, body };
                match offer_dialog(session, handler, dialog).await? {
                    Some(unhandled) => {
                        lines.extend(unhandled.body);
                        return Ok(());
                    }
                    // The handler ran its own exchange to a prompt
                    None if session.at_prompt() => return Ok(()),
                    None => {}
                }
            }
        }
    }
}

/// Write `command` and collect its output
pub(crate) async fn run_exchange(
    session: &mut Session,
    handler: &dyn ConsoleHandler,
    command: &str,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    if session.write(command).await?.was_sent() {
        drive_exchange(session, handler, &mut lines).await?;
    }
    Ok(lines)
}
