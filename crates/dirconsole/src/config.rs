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

//! Director endpoints, console identities and client settings

use crate::error::{DirConsoleError, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// Default director console port
pub const DEFAULT_DIRECTOR_PORT: u16 = 9101;

/// Identity used when no console resource is configured
pub const USER_AGENT_NAME: &str = "*UserAgent*";

/// TLS policy and certificate material for one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enable: bool,
    pub require: bool,
    /// Use TLS only to protect the authentication exchange
    pub authenticate: bool,
    pub ca_certificate_file: Option<PathBuf>,
    pub ca_certificate_dir: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl TlsSettings {
    /// Whether a TLS context has to be built for these settings
    pub fn wants_tls(&self) -> bool {
        self.enable || self.require || self.authenticate
    }
}

/// Where a director listens and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Zero disables keepalive
    pub heartbeat_interval: Duration,
    pub tls: TlsSettings,
    /// When set, each new Session switches the director into API mode
    pub api_level: Option<u8>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            name: address.clone(),
            address,
            port,
            heartbeat_interval: Duration::ZERO,
            tls: TlsSettings::default(),
            api_level: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_api_level(mut self, level: u8) -> Self {
        self.api_level = Some(level);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// `host:port` as it appears in error messages
    pub fn display_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Logical name plus the shared secret for CRAM-MD5.
///
/// The secret kept here is the hex MD5 digest of the configured password,
/// which is what the director keys its HMAC with.
#[derive(Clone)]
pub struct Credential {
    name: String,
    key: Zeroizing<String>,
}

impl Credential {
    /// Console identity from a plaintext password
    pub fn new(name: impl Into<String>, password: &str) -> Self {
        Self {
            name: name.into(),
            key: Zeroizing::new(password_digest(password)),
        }
    }

    /// Default identity that authenticates with the director's own password
    pub fn user_agent(password: &str) -> Self {
        Self::new(USER_AGENT_NAME, password)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Lowercase hex MD5 of a configured password
pub fn password_digest(password: &str) -> String {
    let digest = Md5::digest(password.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Timing knobs shared by every Session of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long one wait inside `read()` lasts before re-checking state
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// How long a partially received frame may stay incomplete
    pub frame_timeout: Duration,
    pub auto_fetch_messages: bool,
    pub listen_for_notifications: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(15),
            frame_timeout: Duration::from_secs(60),
            auto_fetch_messages: false,
            listen_for_notifications: true,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_DIRECTOR_PORT
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_frame_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorResource {
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: String,
    /// Seconds, 0 = off
    #[serde(default)]
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleResource {
    pub name: String,
    pub password: String,
    /// Director this console belongs to; `None` applies to all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub director: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResource {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_frame_timeout_secs")]
    pub frame_timeout_secs: u64,
    #[serde(default)]
    pub auto_fetch_messages: bool,
    #[serde(default = "default_true")]
    pub listen_for_notifications: bool,
}

impl Default for SettingsResource {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            frame_timeout_secs: default_frame_timeout_secs(),
            auto_fetch_messages: false,
            listen_for_notifications: true,
        }
    }
}

impl From<&SettingsResource> for SessionSettings {
    fn from(res: &SettingsResource) -> Self {
        Self {
            poll_interval: Duration::from_millis(res.poll_interval_ms.max(1)),
            connect_timeout: Duration::from_secs(res.connect_timeout_secs),
            frame_timeout: Duration::from_secs(res.frame_timeout_secs),
            auto_fetch_messages: res.auto_fetch_messages,
            listen_for_notifications: res.listen_for_notifications,
        }
    }
}

/// Parsed console configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub directors: Vec<DirectorResource>,
    #[serde(default)]
    pub consoles: Vec<ConsoleResource>,
    #[serde(default)]
    pub settings: SettingsResource,
}

impl ConsoleConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DirConsoleError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| DirConsoleError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.directors.is_empty() {
            return Err(DirConsoleError::Config(
                "at least one director must be configured".to_string(),
            ));
        }
        for dir in &self.directors {
            if dir.address.trim().is_empty() {
                return Err(DirConsoleError::Config(format!(
                    "director \"{}\" has no address",
                    dir.name
                )));
            }
            check_tls(&format!("director \"{}\"", dir.name), &dir.tls)?;
        }
        for con in &self.consoles {
            if let Some(tls) = &con.tls {
                check_tls(&format!("console \"{}\"", con.name), tls)?;
            }
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::from(&self.settings)
    }

    /// Pick the endpoint and identity to connect with.
    ///
    /// A console resource bound to the chosen director (or bound to none)
    /// supplies the name, password and TLS settings; otherwise the
    /// `*UserAgent*` identity with the director password is used.
    pub fn select(&self, director: Option<&str>) -> Result<(Endpoint, Credential)> {
        let dir = match director {
            Some(name) => self
                .directors
                .iter()
                .find(|d| d.name == name)
                .ok_or_else(|| {
                    DirConsoleError::Config(format!("director \"{}\" is not configured", name))
                })?,
            None => self
                .directors
                .first()
                .ok_or_else(|| DirConsoleError::Config("no director configured".into()))?,
        };

        let console = self
            .consoles
            .iter()
            .find(|c| c.director.as_deref() == Some(dir.name.as_str()))
            .or_else(|| self.consoles.iter().find(|c| c.director.is_none()));

        let mut endpoint = Endpoint::new(dir.address.clone(), dir.port);
        endpoint.name = dir.name.clone();
        endpoint.heartbeat_interval = Duration::from_secs(dir.heartbeat_interval);
        endpoint.api_level = dir.api_level;
        endpoint.tls = dir.tls.clone();

        let credential = match console {
            Some(con) => {
                if let Some(tls) = &con.tls {
                    endpoint.tls = tls.clone();
                }
                Credential::new(con.name.clone(), &con.password)
            }
            None => Credential::user_agent(&dir.password),
        };

        Ok((endpoint, credential))
    }
}

fn check_tls(owner: &str, tls: &TlsSettings) -> Result<()> {
    if tls.wants_tls() && tls.ca_certificate_file.is_none() && tls.ca_certificate_dir.is_none() {
        return Err(DirConsoleError::Config(format!(
            "{} enables TLS but defines neither a CA certificate file nor a CA certificate directory",
            owner
        )));
    }
    if tls.certificate.is_some() != tls.key.is_some() {
        return Err(DirConsoleError::Config(format!(
            "{} must define both a TLS certificate and a TLS key, or neither",
            owner
        )));
    }
    Ok(())
}
