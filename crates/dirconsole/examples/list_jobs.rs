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

//! List a director's jobs and clients
//!
//! Needs a reachable director and its console password:
//! ```bash
//! DIRECTOR_PASSWORD=secret cargo run -p dirconsole --example list_jobs -- backup.example
//! ```

use dirconsole::config::DEFAULT_DIRECTOR_PORT;
use dirconsole::logging::{LogFormat, init_logging};
use dirconsole::{Credential, DirConsoleError, Endpoint, Result, SessionPool};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(2, None, LogFormat::Text)?;

    let address = std::env::args().nth(1).unwrap_or_else(|| "localhost".to_string());
    let password = std::env::var("DIRECTOR_PASSWORD")
        .map_err(|_| DirConsoleError::Config("DIRECTOR_PASSWORD is not set".into()))?;

    let endpoint = Endpoint::new(address, DEFAULT_DIRECTOR_PORT);
    println!("Connecting to director at {}...", endpoint.display_addr());
    let pool = SessionPool::new(endpoint, Credential::user_agent(&password))?;
    let conn = pool.connect().await?;
    if let Some(greeting) = pool.greeting(conn).await? {
        println!("{}", greeting);
    }

    println!("\nJobs:");
    for job in pool.jobs().await? {
        println!("  {}", job);
    }

    println!("\nClients:");
    for client in pool.clients().await? {
        println!("  {}", client);
    }

    println!("\nLast five jobs:");
    let rows = pool
        .run_query(
            Some(conn),
            "SELECT JobId, Name, JobStatus FROM Job ORDER BY JobId DESC LIMIT 5",
        )
        .await?;
    for row in rows {
        println!("  {}", row);
    }

    pool.terminate_all();
    Ok(())
}
