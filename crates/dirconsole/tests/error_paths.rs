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

//! Error path tests for dirconsole
//!
//! These tests verify that handshake and protocol failures surface as the
//! right error and leave the Session in a sane state. They run against the
//! in-process mock director.

mod common;

use common::*;
use dirconsole::auth::TlsNeed;
use dirconsole::{AuthPhase, ControlCode, DirConsoleError, Session, SessionPool, TlsSettings};
use std::time::Duration;

fn pool_for(director: &MockDirector) -> SessionPool {
    SessionPool::new(director.endpoint(), credential())
        .expect("pool")
        .with_settings(fast_settings())
}

/// Unused local port
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn test_connection_refused() {
    let port = closed_port().await;
    let pool = SessionPool::new(dirconsole::Endpoint::new("127.0.0.1", port), credential())
        .unwrap()
        .with_settings(fast_settings());

    let result = pool.connect().await;
    match result {
        Err(err) => {
            assert_eq!(err.connection_id(), Some(0));
            match err.root() {
                DirConsoleError::Connect { endpoint, source } => {
                    assert_eq!(endpoint, &format!("127.0.0.1:{}", port));
                    assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
                }
                other => panic!("Expected Connect error, got: {:?}", other),
            }
            assert!(!err.is_fatal(), "connect failures are retryable");
        }
        Ok(_) => panic!("Expected error, but connection succeeded"),
    }
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_wrong_password() {
    let director = MockDirector::builder().password("not-the-same").spawn().await;
    let pool = pool_for(&director);

    let err = pool.connect().await.unwrap_err();
    match err.root() {
        DirConsoleError::Auth { phase, reason, .. } => {
            assert_eq!(*phase, AuthPhase::CramMd5);
            assert!(
                reason.contains("Passwords or names not the same"),
                "Unexpected reason: {}",
                reason
            );
        }
        other => panic!("Expected Auth error, got: {:?}", other),
    }
    assert_eq!(director.authenticated(), 0);
}

#[tokio::test]
async fn test_greeting_rejected() {
    let director = MockDirector::builder()
        .greeting("1999 Authorization failed.\n")
        .spawn()
        .await;
    let pool = pool_for(&director);

    let err = pool.connect().await.unwrap_err();
    match err.root() {
        DirConsoleError::HandshakeRejected { endpoint, response } => {
            assert_eq!(endpoint, &format!("127.0.0.1:{}", director.port()));
            assert_eq!(response, "1999 Authorization failed.");
        }
        other => panic!("Expected HandshakeRejected error, got: {:?}", other),
    }
    assert!(err.to_string().contains("1999 Authorization failed."));
}

#[tokio::test]
async fn test_required_tls_not_offered() {
    let director = MockDirector::builder().tls_need(TlsNeed::None).spawn().await;
    let endpoint = director.endpoint().with_tls(TlsSettings {
        require: true,
        ..TlsSettings::default()
    });
    // The policy check happens before any TLS context would be used
    let mut session = Session::new(0, endpoint, credential(), None, fast_settings());

    let err = session.connect().await.unwrap_err();
    match &err {
        DirConsoleError::TlsPolicy { endpoint, detail } => {
            assert_eq!(endpoint, &format!("127.0.0.1:{}", director.port()));
            assert_eq!(detail, "did not advertise required TLS support.");
        }
        other => panic!("Expected TlsPolicy error, got: {:?}", other),
    }
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_director_requires_tls() {
    let director = MockDirector::builder().tls_need(TlsNeed::Required).spawn().await;
    let pool = pool_for(&director);

    let err = pool.connect().await.unwrap_err();
    match err.root() {
        DirConsoleError::TlsPolicy { detail, .. } => {
            assert_eq!(detail, "Remote server requires TLS.");
        }
        other => panic!("Expected TlsPolicy error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_tls_without_ca_is_a_config_error() {
    let endpoint = dirconsole::Endpoint::new("127.0.0.1", 9101).with_tls(TlsSettings {
        enable: true,
        ..TlsSettings::default()
    });
    let result = SessionPool::new(endpoint, credential());
    assert!(
        matches!(result, Err(DirConsoleError::TlsContext(_))),
        "Expected TlsContext error"
    );
}

#[tokio::test]
async fn test_unknown_session_id() {
    let director = MockDirector::builder().spawn().await;
    let pool = pool_for(&director);
    pool.connect().await.unwrap();

    match pool.run_command(7, "status").await {
        Err(DirConsoleError::SessionNotFound(7)) => {}
        Err(other) => panic!("Expected SessionNotFound, got: {:?}", other),
        Ok(_) => panic!("Expected error for unknown connection"),
    }
    assert!(pool.is_ready(7).is_err());
}

#[tokio::test]
async fn test_unknown_sentinel_terminates_session() {
    let director = MockDirector::builder()
        .script(vec![expect("status"), Step::SendRaw((-6i32).to_be_bytes().to_vec())])
        .spawn()
        .await;
    let pool = pool_for(&director);
    pool.connect().await.unwrap();

    let err = pool.run_command(0, "status").await.unwrap_err();
    assert_eq!(err.connection_id(), Some(0));
    match err.root() {
        DirConsoleError::Protocol { message, .. } => {
            assert!(message.contains("-6"), "Message should name the sentinel: {}", message);
        }
        other => panic!("Expected Protocol error, got: {:?}", other),
    }
    assert!(err.is_fatal());
    assert!(!pool.is_ready(0).unwrap());
    assert!(!pool.is_notify_enabled(0).unwrap(), "dead sessions stay silent");
}

#[tokio::test]
async fn test_oversized_packet() {
    let director = MockDirector::builder()
        .script(vec![
            expect("status"),
            Step::SendRaw(2_000_000i32.to_be_bytes().to_vec()),
        ])
        .spawn()
        .await;
    let pool = pool_for(&director);
    pool.connect().await.unwrap();

    let err = pool.run_command(0, "status").await.unwrap_err();
    assert!(err.to_string().contains("too big"), "got: {}", err);
}

#[tokio::test]
async fn test_hangup_mid_frame() {
    let mut partial = 20i32.to_be_bytes().to_vec();
    partial.extend_from_slice(b"Job");
    let director = MockDirector::builder()
        .script(vec![expect("status"), Step::SendRaw(partial), Step::Close])
        .spawn()
        .await;
    let pool = pool_for(&director);
    pool.connect().await.unwrap();

    let err = pool.run_command(0, "status").await.unwrap_err();
    assert!(
        matches!(err.root(), DirConsoleError::Protocol { .. }),
        "Expected Protocol error, got: {:?}",
        err
    );
}

#[tokio::test]
async fn test_stalled_frame_is_short_read() {
    let mut partial = 20i32.to_be_bytes().to_vec();
    partial.extend_from_slice(b"Job");
    let director = MockDirector::builder()
        .script(vec![expect("status"), Step::SendRaw(partial), pause_ms(3_000)])
        .spawn()
        .await;
    let mut settings = fast_settings();
    settings.frame_timeout = Duration::from_millis(200);
    let pool = SessionPool::new(director.endpoint(), credential())
        .unwrap()
        .with_settings(settings);
    pool.connect().await.unwrap();

    let err = pool.run_command(0, "status").await.unwrap_err();
    match err.root() {
        DirConsoleError::Protocol { message, .. } => {
            assert!(message.contains("Short read"), "got: {}", message);
        }
        other => panic!("Expected Protocol error, got: {:?}", other),
    }
    assert!(!pool.is_ready(0).unwrap());
}

#[tokio::test]
async fn test_message_code_without_text() {
    let director = MockDirector::builder()
        .script(vec![
            expect("status"),
            ctl(ControlCode::ErrorMsg),
            ctl(ControlCode::MainPrompt),
        ])
        .spawn()
        .await;
    let pool = pool_for(&director);
    pool.connect().await.unwrap();

    let err = pool.run_command(0, "status").await.unwrap_err();
    assert!(matches!(err.root(), DirConsoleError::Protocol { .. }));
    assert!(!pool.is_ready(0).unwrap());
}

#[test]
fn test_codec_rejects_unknown_sentinel() {
    use dirconsole::codec::decode_frame;

    let result = decode_frame(&(-3i32).to_be_bytes());
    match result {
        Err(DirConsoleError::Protocol { message, position, .. }) => {
            assert!(message.contains("-3"));
            assert_eq!(position, 0);
        }
        Err(other) => panic!("Expected Protocol error, got: {:?}", other),
        Ok(frame) => panic!("Expected error, decoded: {:?}", frame),
    }
}
