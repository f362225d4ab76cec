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

//! TLS client context built from CA and client certificate material

use crate::config::TlsSettings;
use crate::error::{DirConsoleError, Result};
use pkcs8::EncryptedPrivateKeyInfo;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::debug;
use zeroize::Zeroizing;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Supplies the passphrase for an encrypted client key.
///
/// Called at most once per context build, and only when the key file is
/// encrypted.
pub trait PassphraseProvider: Send + Sync {
    fn passphrase(&self, key_path: &Path) -> Option<Zeroizing<String>>;
}

/// Fixed passphrase, mostly useful for tests and non-interactive tools
pub struct StaticPassphrase(Zeroizing<String>);

impl StaticPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }
}

impl PassphraseProvider for StaticPassphrase {
    fn passphrase(&self, _key_path: &Path) -> Option<Zeroizing<String>> {
        Some(self.0.clone())
    }
}

/// Opaque handle used by the handshake to upgrade a socket
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn from_settings(
        settings: &TlsSettings,
        passphrase: Option<&dyn PassphraseProvider>,
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();

        if let Some(file) = &settings.ca_certificate_file {
            for cert in read_certificates(file)? {
                add_root(&mut roots, cert, file)?;
            }
        }
        if let Some(dir) = &settings.ca_certificate_dir {
            let entries = std::fs::read_dir(dir).map_err(|e| {
                DirConsoleError::TlsContext(format!("cannot read {}: {}", dir.display(), e))
            })?;
            for entry in entries {
                let path = entry
                    .map_err(|e| DirConsoleError::TlsContext(format!("{}: {}", dir.display(), e)))?
                    .path();
                if !path.is_file() {
                    continue;
                }
                // Hash links and stray files that are not PEM are skipped
                match read_certificates(&path) {
                    Ok(certs) => {
                        for cert in certs {
                            add_root(&mut roots, cert, &path)?;
                        }
                    }
                    Err(e) => debug!(path = %path.display(), error = %e, "skipping CA file"),
                }
            }
        }

        if roots.is_empty() {
            return Err(DirConsoleError::TlsContext(
                "no trusted CA certificates were loaded".to_string(),
            ));
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| DirConsoleError::TlsContext(format!("protocol versions: {}", e)))?
        .with_root_certificates(roots);

        let config = match (&settings.certificate, &settings.key) {
            (Some(cert_path), Some(key_path)) => {
                let chain = read_certificates(cert_path)?;
                if chain.is_empty() {
                    return Err(DirConsoleError::TlsContext(format!(
                        "no certificates found in {}",
                        cert_path.display()
                    )));
                }
                let key = read_private_key(key_path, passphrase)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| DirConsoleError::TlsContext(format!("client certificate: {}", e)))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(DirConsoleError::TlsContext(
                    "a client certificate needs a matching key".to_string(),
                ));
            }
        };

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.config.clone())
    }

    pub(crate) fn server_name(&self, address: &str) -> Result<ServerName<'static>> {
        ServerName::try_from(address.to_owned())
            .map_err(|e| DirConsoleError::TlsContext(format!("invalid server name {}: {}", address, e)))
    }
}

fn add_root(roots: &mut RootCertStore, cert: CertificateDer<'static>, source: &Path) -> Result<()> {
    roots.add(cert).map_err(|e| {
        DirConsoleError::TlsContext(format!("bad CA certificate in {}: {}", source.display(), e))
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| DirConsoleError::TlsContext(format!("cannot read {}: {}", path.display(), e)))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DirConsoleError::TlsContext(format!("{}: {}", path.display(), e)))
}

fn read_private_key(
    path: &Path,
    passphrase: Option<&dyn PassphraseProvider>,
) -> Result<PrivateKeyDer<'static>> {
    let pem = Zeroizing::new(read_pem(path)?);
    let text = String::from_utf8_lossy(&pem);
    if !text.contains(ENCRYPTED_KEY_LABEL) {
        return PrivateKeyDer::from_pem_slice(&pem)
            .map_err(|e| DirConsoleError::TlsContext(format!("{}: {}", path.display(), e)));
    }

    let provider = passphrase.ok_or_else(|| {
        DirConsoleError::TlsContext(format!(
            "{} is encrypted and no passphrase provider is configured",
            path.display()
        ))
    })?;
    let secret = provider.passphrase(path).ok_or_else(|| {
        DirConsoleError::TlsContext(format!("no passphrase given for {}", path.display()))
    })?;

    let (label, der) = pkcs8::der::Document::from_pem(&text)
        .map_err(|e| DirConsoleError::TlsContext(format!("{}: {}", path.display(), e)))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(DirConsoleError::TlsContext(format!(
            "{}: unexpected PEM label {}",
            path.display(),
            label
        )));
    }
    let encrypted = EncryptedPrivateKeyInfo::try_from(der.as_bytes())
        .map_err(|e| DirConsoleError::TlsContext(format!("{}: {}", path.display(), e)))?;
    let document = encrypted.decrypt(secret.as_bytes()).map_err(|_| {
        DirConsoleError::TlsContext(format!("cannot decrypt {}: wrong passphrase?", path.display()))
    })?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        document.as_bytes().to_vec(),
    )))
}
