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

//! What the user typed at the `*` prompt

/// One line of shell input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Quit,
    /// `sql <query>`: run through `.sql` and drop the no-results line
    Query(String),
    /// `notify on|off`
    Notify(bool),
    /// Anything else goes to the director unchanged, blank lines included
    Console(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim();

        match trimmed {
            "quit" | "exit" => return Input::Quit,
            "notify on" => return Input::Notify(true),
            "notify off" => return Input::Notify(false),
            _ => {}
        }
        if let Some(query) = trimmed.strip_prefix("sql ") {
            let query = query.trim();
            if !query.is_empty() {
                return Input::Query(query.to_string());
            }
        }
        Input::Console(line.to_string())
    }
}
