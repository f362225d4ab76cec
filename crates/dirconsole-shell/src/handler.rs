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

//! Terminal output for director notifications

use async_trait::async_trait;
use dirconsole::{ConnectionId, ConsoleHandler, Severity};

/// Render a director message for the terminal
pub fn format_message(conn: ConnectionId, severity: Severity, text: &str) -> String {
    let label = match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    };
    format!("[{}] {}: {}", conn, label, text.trim_end())
}

/// Render a line that arrived while no command was running
pub fn format_unsolicited(conn: ConnectionId, line: &str) -> String {
    format!("[{}] {}", conn, line.trim_end())
}

/// Prints notifications to stderr so they never mix with command output.
///
/// Dialogs keep the default and are declined: their text comes back as
/// command output and the user answers at the next prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellHandler;

#[async_trait]
impl ConsoleHandler for ShellHandler {
    async fn on_text_line(&self, conn: ConnectionId, line: &str) {
        eprintln!("{}", format_unsolicited(conn, line));
    }

    async fn on_message(&self, conn: ConnectionId, severity: Severity, text: &str) {
        eprintln!("{}", format_message(conn, severity, text));
    }

    async fn on_messages_pending(&self, conn: ConnectionId) {
        eprintln!("[{}] You have messages.", conn);
    }

    async fn on_disconnected(&self, conn: ConnectionId) {
        eprintln!("[{}] Director connection closed.", conn);
    }
}
