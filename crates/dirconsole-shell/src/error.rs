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

//! Error handling for the shell

use dirconsole::DirConsoleError;
use std::time::Duration;
use thiserror::Error;

pub type ShellResult<T> = Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Console(#[from] DirConsoleError),

    #[error("Worker thread has died or disconnected")]
    WorkerDisconnected,

    /// The worker did not answer in time. The director may still be busy.
    #[error("No reply from worker after {duration:?} while {operation}")]
    WorkerTimeout { operation: String, duration: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            ShellError::Console(e) => match e.root() {
                DirConsoleError::Config(_) | DirConsoleError::TlsContext(_) => 78,
                DirConsoleError::Auth { .. }
                | DirConsoleError::TlsPolicy { .. }
                | DirConsoleError::HandshakeRejected { .. } => 77,
                DirConsoleError::Connect { .. } => 69,
                DirConsoleError::Io(_) => 74,
                _ => 1,
            },
            ShellError::WorkerDisconnected | ShellError::WorkerTimeout { .. } => 70,
            ShellError::Io(_) => 74,
        }
    }
}
