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

//! # Director console client
//!
//! An async client for the backup director's console protocol: framed
//! text and control codes over TCP, mutual CRAM-MD5 authentication with
//! optional TLS, and a pool of command Sessions with push notifications.
//!
//! ## Example
//!
//! ```no_run
//! use dirconsole::{Credential, Endpoint, SessionPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::new("backup.example", 9101);
//!     let pool = SessionPool::new(endpoint, Credential::user_agent("secret"))?;
//!     let conn = pool.connect().await?;
//!     for line in pool.run_command(conn, ".jobs").await? {
//!         println!("{}", line);
//!     }
//!     pool.terminate_all();
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
mod error;
mod handler;
pub mod logging;
mod message;
mod notify;
pub mod ops;
mod pool;
mod session;
mod tls;
mod transport;

pub use codec::{MAX_FRAME_LEN, WireCodec};
pub use config::{ConsoleConfig, Credential, Endpoint, SessionSettings, TlsSettings};
pub use error::{AuthPhase, ConnectionId, DirConsoleError, Result};
pub use handler::{ConsoleHandler, DialogSession, NoopHandler};
pub use message::{ControlCode, DialogKind, Frame, PendingDialog, Severity, WriteOutcome};
pub use notify::NotificationDispatcher;
pub use pool::SessionPool;
pub use session::{QuietSession, Session, SessionFlags};
pub use tls::{PassphraseProvider, StaticPassphrase, TlsContext};
pub use transport::{Transport, close_tls};
