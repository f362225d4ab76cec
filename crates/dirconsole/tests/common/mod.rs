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

//! In-process director for integration tests
//!
//! Speaks the real handshake and framing on 127.0.0.1, then plays a
//! scripted conversation per accepted connection.

#![allow(dead_code)]

use dirconsole::auth::{self, TlsDecision, TlsNeed};
use dirconsole::config::password_digest;
use bytes::BytesMut;
use dirconsole::{ControlCode, Credential, Endpoint, Frame, SessionSettings, WireCodec, close_tls};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

pub const PASSWORD: &str = "dir-secret";
pub const GREETING: &str = "1000 OK: 103 backup-dir Version: 15.0.2 (21 March 2024)\n";

pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type ServerFramed = Framed<Box<dyn Io>, WireCodec>;

/// Socket that first yields the bytes a codec had already pulled off it
pub struct Rewind<T> {
    buffered: BytesMut,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(buffered: BytesMut, inner: T) -> Self {
        Self { buffered, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// One scripted action of the mock director
#[derive(Clone, Debug)]
pub enum Step {
    /// Wait for this exact command line from the console
    Expect(String),
    Send(Frame),
    /// Bytes written straight to the socket, bypassing the codec
    SendRaw(Vec<u8>),
    Pause(Duration),
    /// Drop the connection
    Close,
}

pub fn expect(line: &str) -> Step {
    Step::Expect(line.to_string())
}

pub fn text(line: &str) -> Step {
    Step::Send(Frame::text(line))
}

pub fn ctl(code: ControlCode) -> Step {
    Step::Send(Frame::Control(code))
}

pub fn pause_ms(ms: u64) -> Step {
    Step::Pause(Duration::from_millis(ms))
}

pub struct MockDirectorBuilder {
    password: String,
    tls_need: TlsNeed,
    greeting: String,
    acceptor: Option<TlsAcceptor>,
    authenticate_only: bool,
    scripts: Vec<Vec<Step>>,
}

impl MockDirectorBuilder {
    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn tls_need(mut self, need: TlsNeed) -> Self {
        self.tls_need = need;
        self
    }

    pub fn greeting(mut self, greeting: &str) -> Self {
        self.greeting = greeting.to_string();
        self
    }

    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    /// Close TLS again right after its handshake and greet in plaintext
    pub fn authenticate_only(mut self) -> Self {
        self.authenticate_only = true;
        self
    }

    /// Script for the next accepted connection. Connections beyond the
    /// last script just idle after the handshake.
    pub fn script(mut self, steps: Vec<Step>) -> Self {
        self.scripts.push(steps);
        self
    }

    pub async fn spawn(self) -> MockDirector {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let shared = Arc::new(self);

        let accept_state = state.clone();
        tokio::spawn(async move {
            let mut index = 0;
            while let Ok((tcp, _)) = listener.accept().await {
                let script = shared.scripts.get(index).cloned().unwrap_or_default();
                index += 1;
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = accept_state.clone();
                let config = shared.clone();
                tokio::spawn(async move {
                    serve(Box::new(tcp), &config, script, &conn_state).await;
                });
            }
        });

        MockDirector { addr, state }
    }
}

#[derive(Default)]
struct MockState {
    accepted: AtomicUsize,
    authenticated: AtomicUsize,
    tls_sessions: AtomicUsize,
    hello: Mutex<Vec<String>>,
    received: Mutex<Vec<String>>,
}

pub struct MockDirector {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockDirector {
    pub fn builder() -> MockDirectorBuilder {
        MockDirectorBuilder {
            password: PASSWORD.to_string(),
            tls_need: TlsNeed::None,
            greeting: GREETING.to_string(),
            acceptor: None,
            authenticate_only: false,
            scripts: Vec::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port())
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn authenticated(&self) -> usize {
        self.state.authenticated.load(Ordering::SeqCst)
    }

    pub fn tls_sessions(&self) -> usize {
        self.state.tls_sessions.load(Ordering::SeqCst)
    }

    pub async fn hello_lines(&self) -> Vec<String> {
        self.state.hello.lock().await.clone()
    }

    pub async fn received(&self) -> Vec<String> {
        self.state.received.lock().await.clone()
    }

    /// Wait until at least `count` command lines have arrived
    pub async fn wait_for_received(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let received = self.received().await;
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received().await
    }
}

async fn serve(io: Box<dyn Io>, config: &MockDirectorBuilder, script: Vec<Step>, state: &MockState) {
    let mut framed: ServerFramed = Framed::new(io, WireCodec);
    let key = password_digest(&config.password);

    let hello = match framed.next().await {
        Some(Ok(Frame::Text(line))) => line,
        _ => return,
    };
    state.hello.lock().await.push(hello);

    if auth::challenge_peer(&mut framed, "console", &key, config.tls_need)
        .await
        .is_err()
    {
        return;
    }
    let console_need = match auth::respond_to_challenge(&mut framed, "console", &key).await {
        Ok(need) => need,
        Err(_) => return,
    };
    state.authenticated.fetch_add(1, Ordering::SeqCst);

    match auth::negotiate_tls(config.tls_need, console_need) {
        TlsDecision::Refuse(_) => return,
        TlsDecision::Upgrade => {
            let Some(acceptor) = &config.acceptor else {
                return;
            };
            // The ClientHello may already sit in the codec's buffer
            let parts = framed.into_parts();
            let io = Rewind::new(parts.read_buf, parts.io);
            let tls = match acceptor.accept(io).await {
                Ok(tls) => tls,
                Err(_) => return,
            };
            state.tls_sessions.fetch_add(1, Ordering::SeqCst);
            framed = if config.authenticate_only {
                let (io, conn) = tls.into_inner();
                match close_tls(io, conn).await {
                    Ok(io) => Framed::new(Box::new(io) as Box<dyn Io>, WireCodec),
                    Err(_) => return,
                }
            } else {
                Framed::new(Box::new(tls) as Box<dyn Io>, WireCodec)
            };
        }
        TlsDecision::Plaintext => {}
    }

    if framed.send(Frame::text(config.greeting.as_str())).await.is_err() {
        return;
    }

    for step in script {
        match step {
            Step::Expect(line) => match framed.next().await {
                Some(Ok(Frame::Text(got))) => {
                    state.received.lock().await.push(got.clone());
                    assert_eq!(got, line, "mock director got an unexpected command");
                }
                _ => return,
            },
            Step::Send(frame) => {
                if framed.send(frame).await.is_err() {
                    return;
                }
            }
            Step::SendRaw(bytes) => {
                let io = framed.get_mut();
                if io.write_all(&bytes).await.is_err() || io.flush().await.is_err() {
                    return;
                }
            }
            Step::Pause(duration) => tokio::time::sleep(duration).await,
            Step::Close => return,
        }
    }

    // Idle until the console hangs up, recording anything it still sends
    while let Some(Ok(frame)) = framed.next().await {
        if let Frame::Text(line) = frame {
            state.received.lock().await.push(line);
        }
    }
}

pub fn credential() -> Credential {
    Credential::user_agent(PASSWORD)
}

/// Settings that keep tests quick
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        poll_interval: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(5),
        frame_timeout: Duration::from_secs(5),
        auto_fetch_messages: false,
        listen_for_notifications: true,
    }
}

/// Poll `condition` for up to two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A CA and a server certificate for 127.0.0.1
pub struct TestPki {
    pub dir: tempfile::TempDir,
    pub ca_file: std::path::PathBuf,
    pub acceptor: TlsAcceptor,
}

pub fn test_pki() -> TestPki {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::net::{IpAddr, Ipv4Addr};

    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name.push(DnType::CommonName, "Test Backup CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut leaf_params = CertificateParams::default();
    leaf_params.distinguished_name.push(DnType::CommonName, "backup-dir");
    leaf_params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];
    let leaf_key = KeyPair::generate().unwrap();
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let ca_file = dir.path().join("ca.pem");
    std::fs::write(&ca_file, ca_cert.pem()).unwrap();

    let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![leaf_cert.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
    )
    .unwrap();

    TestPki {
        dir,
        ca_file,
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
    }
}
