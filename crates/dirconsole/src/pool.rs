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

//! Growable set of Sessions to one director, keyed by connection id

use crate::config::{ConsoleConfig, Credential, Endpoint, SessionSettings};
use crate::error::{ConnectionId, DirConsoleError, Result};
use crate::handler::{self, ConsoleHandler, NoopHandler};
use crate::notify::NotificationDispatcher;
use crate::ops;
use crate::session::{Session, SessionFlags};
use crate::tls::{PassphraseProvider, TlsContext};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pool entry. The flags and token are copies of the Session's own, so the
/// pool can inspect and cancel a Session that another task has locked.
struct SessionSlot {
    session: Arc<tokio::sync::Mutex<Session>>,
    flags: Arc<SessionFlags>,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl SessionSlot {
    fn shutdown(&self) {
        self.cancel.cancel();
        self.flags.mark_terminated();
        // Close the socket now when nobody is mid-exchange
        if let Ok(mut session) = self.session.try_lock() {
            session.terminate();
        }
    }
}

/// Owns every Session opened to one director.
///
/// Connection id 0 is the default connection created by
/// [`SessionPool::connect`]. Further Sessions are opened on demand by
/// [`SessionPool::acquire_free`] when every existing one is busy.
pub struct SessionPool {
    endpoint: Endpoint,
    credential: Credential,
    tls: Option<TlsContext>,
    settings: SessionSettings,
    handler: Arc<dyn ConsoleHandler>,
    slots: RwLock<BTreeMap<ConnectionId, SessionSlot>>,
    next_id: Mutex<ConnectionId>,
}

impl SessionPool {
    pub fn new(endpoint: Endpoint, credential: Credential) -> Result<Self> {
        Self::with_passphrase(endpoint, credential, None)
    }

    /// Build a pool, decrypting the client key with `passphrase` if needed
    pub fn with_passphrase(
        endpoint: Endpoint,
        credential: Credential,
        passphrase: Option<&dyn PassphraseProvider>,
    ) -> Result<Self> {
        let tls = if endpoint.tls.wants_tls() {
            Some(TlsContext::from_settings(&endpoint.tls, passphrase)?)
        } else {
            None
        };
        Ok(Self {
            endpoint,
            credential,
            tls,
            settings: SessionSettings::default(),
            handler: Arc::new(NoopHandler),
            slots: RwLock::new(BTreeMap::new()),
            next_id: Mutex::new(0),
        })
    }

    /// Pool for a director named in `config` (or the first one)
    pub fn from_config(
        config: &ConsoleConfig,
        director: Option<&str>,
        passphrase: Option<&dyn PassphraseProvider>,
    ) -> Result<Self> {
        let (endpoint, credential) = config.select(director)?;
        Ok(Self::with_passphrase(endpoint, credential, passphrase)?
            .with_settings(config.session_settings()))
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ConsoleHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Replace the TLS context built from the endpoint settings
    pub fn with_tls_context(mut self, context: TlsContext) -> Self {
        self.tls = Some(context);
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open the default connection (id 0) if it is not there yet
    pub async fn connect(&self) -> Result<ConnectionId> {
        if self.slots.read().contains_key(&0) {
            return Ok(0);
        }
        self.open_session().await
    }

    /// Find an idle Session with notifications on, or open a new one
    pub async fn acquire_free(&self) -> Result<ConnectionId> {
        {
            let slots = self.slots.read();
            if let Some((&id, _)) = slots
                .iter()
                .find(|(_, slot)| slot.flags.is_ready() && slot.flags.is_notify_enabled())
            {
                return Ok(id);
            }
        }
        self.prune_dead();
        self.open_session().await
    }

    /// Drop terminated Sessions other than the default one
    fn prune_dead(&self) {
        let mut slots = self.slots.write();
        slots.retain(|&id, slot| {
            let keep = id == 0 || slot.flags.is_connected();
            if !keep {
                debug!(conn = id, "removing dead session");
            }
            keep
        });
    }

    async fn open_session(&self) -> Result<ConnectionId> {
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        let mut session = Session::new(
            id,
            self.endpoint.clone(),
            self.credential.clone(),
            self.tls.clone(),
            self.settings.clone(),
        );
        if let Err(e) = session.connect().await {
            // Give the id back unless a later one was handed out meanwhile
            let mut next = self.next_id.lock();
            if *next == id + 1 {
                *next = id;
            }
            return Err(e.with_connection(id));
        }

        let flags = session.flags();
        let cancel = session.cancel_token();
        let session = Arc::new(tokio::sync::Mutex::new(session));
        let listener = self.settings.listen_for_notifications.then(|| {
            NotificationDispatcher::new(
                id,
                session.clone(),
                flags.clone(),
                cancel.clone(),
                self.handler.clone(),
            )
            .with_poll_interval(self.settings.poll_interval)
            .with_auto_fetch(self.settings.auto_fetch_messages)
            .spawn()
        });

        self.slots.write().insert(
            id,
            SessionSlot {
                session,
                flags,
                cancel,
                listener,
            },
        );
        info!(conn = id, endpoint = %self.endpoint.display_addr(), "session opened");
        Ok(id)
    }

    fn session(&self, id: ConnectionId) -> Result<Arc<tokio::sync::Mutex<Session>>> {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.session.clone())
            .ok_or(DirConsoleError::SessionNotFound(id))
    }

    fn flags(&self, id: ConnectionId) -> Result<Arc<SessionFlags>> {
        self.slots
            .read()
            .get(&id)
            .map(|slot| slot.flags.clone())
            .ok_or(DirConsoleError::SessionNotFound(id))
    }

    /// Send `command` on Session `id` and collect its output lines.
    ///
    /// Notifications stay off for the whole exchange and get their previous
    /// state back afterwards, on error paths included.
    pub async fn run_command(&self, id: ConnectionId, command: &str) -> Result<Vec<String>> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        if !session.is_connected() {
            return Err(DirConsoleError::Disconnected.with_connection(id));
        }
        let mut quiet = session.quiet();
        handler::run_exchange(&mut quiet, self.handler.as_ref(), command)
            .await
            .map_err(|e| e.with_connection(id))
    }

    /// As [`SessionPool::run_command`], terminating the Session if the
    /// director does not reach a prompt in time
    pub async fn run_command_with_timeout(
        &self,
        id: ConnectionId,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        match tokio::time::timeout(timeout, self.run_command(id, command)).await {
            Ok(result) => result,
            Err(_) => {
                self.terminate(id);
                Err(DirConsoleError::Timeout {
                    operation: format!("running {}", command),
                    duration: timeout,
                }
                .with_connection(id))
            }
        }
    }

    /// Run an SQL query through `.sql`, on `conn` or on any free Session
    pub async fn run_query(&self, conn: Option<ConnectionId>, query: &str) -> Result<Vec<String>> {
        let id = match conn {
            Some(id) => id,
            None => self.acquire_free().await?,
        };
        let lines = self.run_command(id, &ops::sql_command(query)).await?;
        Ok(ops::strip_no_results(lines))
    }

    async fn run_on_free(&self, command: &str) -> Result<Vec<String>> {
        let id = self.acquire_free().await?;
        self.run_command(id, command).await
    }

    pub async fn jobs(&self) -> Result<Vec<String>> {
        self.run_on_free(&ops::jobs_command()).await
    }

    pub async fn clients(&self) -> Result<Vec<String>> {
        self.run_on_free(&ops::clients_command()).await
    }

    pub async fn filesets(&self) -> Result<Vec<String>> {
        self.run_on_free(&ops::filesets_command()).await
    }

    pub async fn pools(&self) -> Result<Vec<String>> {
        self.run_on_free(&ops::pools_command()).await
    }

    pub async fn storage(&self) -> Result<Vec<String>> {
        self.run_on_free(&ops::storage_command()).await
    }

    /// Fetch queued messages on Session `id` and clear its pending flag
    pub async fn messages(&self, id: ConnectionId) -> Result<Vec<String>> {
        let lines = self.run_command(id, &ops::messages_command()).await?;
        self.flags(id)?.clear_messages_pending();
        Ok(lines)
    }

    pub async fn defaults(&self, job: &str) -> Result<Vec<String>> {
        self.run_on_free(&ops::defaults_command(job)).await
    }

    /// Returns the previous state
    pub fn notify(&self, id: ConnectionId, enable: bool) -> Result<bool> {
        Ok(self.flags(id)?.set_notify(enable))
    }

    pub fn is_notify_enabled(&self, id: ConnectionId) -> Result<bool> {
        Ok(self.flags(id)?.is_notify_enabled())
    }

    pub fn is_ready(&self, id: ConnectionId) -> Result<bool> {
        Ok(self.flags(id)?.is_ready())
    }

    pub fn messages_pending(&self, id: ConnectionId) -> Result<bool> {
        Ok(self.flags(id)?.messages_pending())
    }

    /// Greeting the director sent when Session `id` connected
    pub async fn greeting(&self, id: ConnectionId) -> Result<Option<String>> {
        let session = self.session(id)?;
        let session = session.lock().await;
        Ok(session.greeting().map(str::to_string))
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.slots.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Terminate one Session. It stays in the pool as dead until replaced.
    pub fn terminate(&self, id: ConnectionId) -> bool {
        match self.slots.read().get(&id) {
            Some(slot) => {
                slot.shutdown();
                true
            }
            None => false,
        }
    }

    /// Terminate and remove every Session
    pub fn terminate_all(&self) {
        let drained = std::mem::take(&mut *self.slots.write());
        for (id, slot) in &drained {
            debug!(conn = id, "terminating");
            slot.shutdown();
        }
        *self.next_id.lock() = 0;
        if !drained.is_empty() {
            info!(sessions = drained.len(), "all sessions terminated");
        }
    }

    /// Wait for every notification listener to finish
    pub async fn join_listeners(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .slots
            .write()
            .values_mut()
            .filter_map(|slot| slot.listener.take())
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values() {
            slot.shutdown();
        }
    }
}
