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

//! Background worker thread that owns the SessionPool
//!
//! The shell's input loop is plain blocking code. Everything async happens
//! on this thread's runtime; requests and replies travel over std channels.

use crate::error::{ShellError, ShellResult};
use dirconsole::{ConnectionId, Result as ConsoleResult, SessionPool};
use std::sync::mpsc::{Sender, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// How long a blocking call waits for the worker beyond the command's own
/// timeout
const REPLY_GRACE: Duration = Duration::from_secs(30);

type Reply<T> = Sender<ConsoleResult<T>>;

/// Commands that can be sent to the worker thread
pub enum WorkerCommand {
    Connect(Reply<ConnectionId>),
    Greeting(ConnectionId, Reply<Option<String>>),
    /// Run a console command on the given Session, or any free one
    Command(Option<ConnectionId>, String, Duration, Reply<Vec<String>>),
    Query(String, Reply<Vec<String>>),
    Notify(ConnectionId, bool, Reply<bool>),
    Shutdown,
}

/// Handle to the background worker thread
pub struct Worker {
    command_tx: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread and hand it `pool`
    ///
    /// The runtime is multi-threaded so that notification listeners keep
    /// running while the thread waits for the next command.
    pub fn spawn(pool: SessionPool) -> ShellResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dirsh-io")
            .enable_all()
            .build()?;
        let (command_tx, command_rx) = channel::<WorkerCommand>();

        let thread = thread::Builder::new()
            .name("dirsh-worker".to_string())
            .spawn(move || {
                loop {
                    let Ok(command) = command_rx.recv() else {
                        // Channel closed, exit
                        break;
                    };
                    match command {
                        WorkerCommand::Connect(reply) => {
                            let _ = reply.send(runtime.block_on(pool.connect()));
                        }
                        WorkerCommand::Greeting(conn, reply) => {
                            let _ = reply.send(runtime.block_on(pool.greeting(conn)));
                        }
                        WorkerCommand::Command(conn, line, timeout, reply) => {
                            let result = runtime.block_on(async {
                                let conn = match conn {
                                    Some(conn) => conn,
                                    None => pool.acquire_free().await?,
                                };
                                pool.run_command_with_timeout(conn, &line, timeout).await
                            });
                            let _ = reply.send(result);
                        }
                        WorkerCommand::Query(query, reply) => {
                            let _ = reply.send(runtime.block_on(pool.run_query(None, &query)));
                        }
                        WorkerCommand::Notify(conn, enable, reply) => {
                            let _ = reply.send(pool.notify(conn, enable));
                        }
                        WorkerCommand::Shutdown => break,
                    }
                }
                pool.terminate_all();
                runtime.block_on(pool.join_listeners());
                debug!("worker finished");
            })?;

        Ok(Self {
            command_tx,
            thread: Some(thread),
        })
    }

    fn request<T>(
        &self,
        operation: &str,
        wait: Duration,
        build: impl FnOnce(Reply<T>) -> WorkerCommand,
    ) -> ShellResult<T> {
        let (reply_tx, reply_rx) = channel();
        self.command_tx
            .send(build(reply_tx))
            .map_err(|_| ShellError::WorkerDisconnected)?;

        match reply_rx.recv_timeout(wait) {
            Ok(result) => Ok(result?),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(ShellError::WorkerTimeout {
                operation: operation.to_string(),
                duration: wait,
            }),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(ShellError::WorkerDisconnected)
            }
        }
    }

    /// Open the default connection (blocking call with 30s timeout)
    pub fn connect_blocking(&self) -> ShellResult<ConnectionId> {
        self.request("connecting", REPLY_GRACE, WorkerCommand::Connect)
    }

    pub fn greeting_blocking(&self, conn: ConnectionId) -> ShellResult<Option<String>> {
        self.request("reading greeting", REPLY_GRACE, |reply| {
            WorkerCommand::Greeting(conn, reply)
        })
    }

    /// Run one console command and wait for its output
    pub fn command_blocking(
        &self,
        conn: Option<ConnectionId>,
        line: &str,
        timeout: Duration,
    ) -> ShellResult<Vec<String>> {
        let line = line.to_string();
        self.request("running command", timeout + REPLY_GRACE, move |reply| {
            WorkerCommand::Command(conn, line, timeout, reply)
        })
    }

    pub fn query_blocking(&self, query: &str) -> ShellResult<Vec<String>> {
        let query = query.to_string();
        self.request("running query", REPLY_GRACE, move |reply| {
            WorkerCommand::Query(query, reply)
        })
    }

    /// Switch notifications for `conn`; returns the previous state
    pub fn notify_blocking(&self, conn: ConnectionId, enable: bool) -> ShellResult<bool> {
        self.request("switching notifications", REPLY_GRACE, |reply| {
            WorkerCommand::Notify(conn, enable, reply)
        })
    }

    /// Terminate every Session and wait for the thread to exit
    pub fn shutdown(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
