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

//! Dot-command builders for the director's query namespace
//!
//! Each command answers with one Text frame per record.

/// Line the director prints for a query that matched nothing
pub const NO_RESULTS: &str = "No results to list.";

pub fn jobs_command() -> String {
    ".jobs".to_string()
}

pub fn clients_command() -> String {
    ".clients".to_string()
}

pub fn filesets_command() -> String {
    ".filesets".to_string()
}

pub fn pools_command() -> String {
    ".pools".to_string()
}

pub fn storage_command() -> String {
    ".storage".to_string()
}

pub fn messages_command() -> String {
    ".messages".to_string()
}

pub fn api_command(level: u8) -> String {
    format!(".api {}", level)
}

pub fn defaults_command(job: &str) -> String {
    format!(".defaults job=\"{}\"", quote(job))
}

pub fn sql_command(query: &str) -> String {
    format!(".sql query=\"{}\"", quote(query))
}

/// Escape a value for use inside a double-quoted argument
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            // Multi-line queries are sent as one line
            '\n' | '\r' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Remove the "no results" marker from query output
pub fn strip_no_results(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .filter(|line| line.trim_end() != NO_RESULTS)
        .collect()
}
