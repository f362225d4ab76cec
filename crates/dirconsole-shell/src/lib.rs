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

//! Line-oriented shell for a backup director
//!
//! Backs the `dirsh` binary: a blocking input loop in front of a worker
//! thread that owns the [`dirconsole::SessionPool`].

pub mod error;
pub mod handler;
pub mod input;
pub mod worker;

pub use error::{ShellError, ShellResult};
pub use handler::ShellHandler;
pub use input::Input;
pub use worker::Worker;

use std::path::Path;
use zeroize::Zeroizing;

/// Environment variable holding the client key passphrase
pub const PASSPHRASE_ENV: &str = "DIRSH_KEY_PASSPHRASE";

/// Reads the client key passphrase from [`PASSPHRASE_ENV`]
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvPassphrase;

impl dirconsole::PassphraseProvider for EnvPassphrase {
    fn passphrase(&self, key_path: &Path) -> Option<Zeroizing<String>> {
        let value = std::env::var(PASSPHRASE_ENV).ok().map(Zeroizing::new);
        if value.is_none() {
            tracing::warn!(key = %key_path.display(), "key is encrypted and {} is not set", PASSPHRASE_ENV);
        }
        value
    }
}
