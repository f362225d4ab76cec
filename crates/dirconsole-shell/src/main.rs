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

//! dirsh: talk to a backup director from the terminal

use clap::Parser;
use dirconsole::logging::{LogFormat, init_logging};
use dirconsole::{ConnectionId, ConsoleConfig, SessionPool};
use dirconsole_shell::{EnvPassphrase, Input, ShellError, ShellHandler, ShellResult, Worker};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "dirsh", version, about = "Console shell for a backup director")]
struct Args {
    /// Console configuration file (JSON)
    #[arg(short = 'C', long)]
    config: PathBuf,

    /// Director to connect to (defaults to the first one configured)
    #[arg(short = 'D', long)]
    director: Option<String>,

    /// Run these commands and exit instead of reading stdin
    #[arg(short = 'c', long = "command")]
    commands: Vec<String>,

    /// Seconds to wait for a command to reach a prompt
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Increase log verbosity (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dirsh: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: Args) -> ShellResult<()> {
    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging(args.verbose, args.log_file.as_deref(), format)?;

    let config = ConsoleConfig::load(&args.config)?;
    let pool = SessionPool::from_config(&config, args.director.as_deref(), Some(&EnvPassphrase))?
        .with_handler(Arc::new(ShellHandler));
    let address = pool.endpoint().display_addr();

    let worker = Worker::spawn(pool)?;
    let conn = worker.connect_blocking()?;
    let timeout = Duration::from_secs(args.timeout);

    if !args.commands.is_empty() {
        let mut stdout = std::io::stdout().lock();
        for line in &args.commands {
            if !execute(&worker, conn, Input::parse(line), timeout, &mut stdout)? {
                break;
            }
        }
        return Ok(());
    }

    eprintln!("Connecting to Director {}", address);
    if let Some(greeting) = worker.greeting_blocking(conn)? {
        eprintln!("{}", greeting);
    }
    interactive(&worker, conn, timeout)
}

fn interactive(worker: &Worker, conn: ConnectionId, timeout: Duration) -> ShellResult<()> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut stdout = std::io::stdout();
    let mut line = String::new();

    loop {
        write!(stdout, "*")?;
        stdout.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        match execute(worker, conn, Input::parse(&line), timeout, &mut stdout.lock()) {
            Ok(true) => {}
            Ok(false) => break,
            // A dead Session is not worth prompting for
            Err(ShellError::Console(e)) if !e.is_fatal() => eprintln!("dirsh: {}", e),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Carry out one input line. Returns false when the shell should exit.
fn execute(
    worker: &Worker,
    conn: ConnectionId,
    input: Input,
    timeout: Duration,
    out: &mut impl Write,
) -> ShellResult<bool> {
    let lines = match input {
        Input::Quit => return Ok(false),
        Input::Notify(enable) => {
            worker.notify_blocking(conn, enable)?;
            return Ok(true);
        }
        Input::Query(query) => worker.query_blocking(&query)?,
        Input::Console(command) => worker.command_blocking(Some(conn), &command, timeout)?,
    };
    for line in lines {
        write!(out, "{}", line)?;
        if !line.ends_with('\n') {
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(true)
}
