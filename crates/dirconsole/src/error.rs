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

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DirConsoleError>;

/// Small integer naming one Session inside a pool. Id 0 is the default
/// connection and always exists once the pool is initialized.
pub type ConnectionId = u32;

/// Phase of the connection handshake an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Hello,
    CramMd5,
    Tls,
    GreetingAck,
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPhase::Hello => write!(f, "hello"),
            AuthPhase::CramMd5 => write!(f, "CRAM-MD5"),
            AuthPhase::Tls => write!(f, "TLS"),
            AuthPhase::GreetingAck => write!(f, "greeting-ack"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirConsoleError {
    /// The socket could not be opened. Retryable.
    #[error("Cannot connect to director at \"{endpoint}\": {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// Challenge/response failed. Needs new credentials.
    #[error("Director authorization problem at \"{endpoint}\" during {phase}: {reason}")]
    Auth {
        endpoint: String,
        phase: AuthPhase,
        reason: String,
    },

    #[error("Authorization problem during TLS: remote server at \"{endpoint}\" {detail}")]
    TlsPolicy { endpoint: String, detail: String },

    #[error("Director at \"{endpoint}\" rejected Hello command during greeting-ack: {response}")]
    HandshakeRejected { endpoint: String, response: String },

    #[error("Protocol error at byte {position}: {message}{}", .buffer_preview.as_deref().unwrap_or(""))]
    Protocol {
        message: String,
        position: usize,
        buffer_preview: Option<String>,
    },

    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout after {duration:?} while {operation}")]
    Timeout { operation: String, duration: Duration },

    #[error("Session is disconnected")]
    Disconnected,

    #[error("Connection {0} not found")]
    SessionNotFound(ConnectionId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS context error: {0}")]
    TlsContext(String),

    /// Any Session error surfaced through the pool, tagged with its id
    #[error("connection {conn}: {source}")]
    Connection {
        conn: ConnectionId,
        #[source]
        source: Box<DirConsoleError>,
    },
}

impl DirConsoleError {
    /// Create a protocol error with context
    pub fn protocol(message: impl Into<String>, position: usize) -> Self {
        Self::Protocol {
            message: message.into(),
            position,
            buffer_preview: None,
        }
    }

    /// Create a protocol error with a hex preview of the offending bytes
    pub fn protocol_with_preview(
        message: impl Into<String>,
        position: usize,
        buffer: &[u8],
    ) -> Self {
        let preview_len = buffer.len().min(64);
        let hex_preview = buffer[..preview_len]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");

        Self::Protocol {
            message: message.into(),
            position,
            buffer_preview: Some(format!(" (buffer preview: {})", hex_preview)),
        }
    }

    pub(crate) fn auth(endpoint: impl Into<String>, phase: AuthPhase, reason: impl Into<String>) -> Self {
        Self::Auth {
            endpoint: endpoint.into(),
            phase,
            reason: reason.into(),
        }
    }

    /// Tag an error with the connection it came from. Already tagged errors
    /// are left alone.
    pub fn with_connection(self, conn: ConnectionId) -> Self {
        match self {
            Self::Connection { .. } => self,
            other => Self::Connection {
                conn,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any connection tag removed
    pub fn root(&self) -> &Self {
        match self {
            Self::Connection { source, .. } => source.root(),
            other => other,
        }
    }

    /// Connection id attached by the pool, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connection { conn, .. } => Some(*conn),
            _ => None,
        }
    }

    /// True when the Session that produced this error has been torn down
    /// and must be replaced rather than reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::Protocol { .. } | Self::Io(_) | Self::Disconnected | Self::Timeout { .. }
        )
    }
}
