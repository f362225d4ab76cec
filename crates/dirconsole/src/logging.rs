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

//! Subscriber setup for binaries built on this crate
//!
//! The library itself only emits `tracing` events; nothing here runs unless
//! a front end calls [`init_logging`].

use crate::error::{DirConsoleError, Result};
use std::fs::OpenOptions;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn already_set(e: impl std::fmt::Display) -> DirConsoleError {
    DirConsoleError::Config(format!("logging already initialised: {}", e))
}

/// Install a global subscriber.
///
/// `verbosity` 0 is errors only, each step up adds a level until 4 (trace).
/// `RUST_LOG` overrides the computed filter. Logs go to stderr unless
/// `log_file` is given, in which case they are appended to it.
pub fn init_logging(verbosity: u8, log_file: Option<&Path>, format: LogFormat) -> Result<()> {
    let level = level_for(verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("dirconsole={},dirsh={}", level, level))
    });
    let detailed = verbosity >= 3;

    match (log_file, format) {
        (None, LogFormat::Text) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(detailed)
                    .with_line_number(detailed),
            )
            .try_init()
            .map_err(already_set)?,
        (None, LogFormat::Json) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(already_set)?,
        (Some(path), format) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            match format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .with_writer(file)
                            .with_ansi(false)
                            .with_file(detailed)
                            .with_line_number(detailed),
                    )
                    .try_init()
                    .map_err(already_set)?,
                LogFormat::Json => tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json().with_writer(file))
                    .try_init()
                    .map_err(already_set)?,
            }
        }
    }

    Ok(())
}
