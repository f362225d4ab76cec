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

//! Connection handshake: name exchange, mutual CRAM-MD5 and TLS negotiation
//!
//! Every message of the handshake travels as a Text frame. The exchange
//! from the console side is:
//!
//! 1. `Hello <name> calling`
//! 2. answer the director's `auth cram-md5[c] <challenge> ssl=<n>`
//! 3. challenge the director and check its answer
//! 4. compare TLS needs, upgrade the socket if both sides allow it
//! 5. read the `1000 OK:` greeting

use crate::config::{Credential, Endpoint, TlsSettings};
use crate::error::{AuthPhase, DirConsoleError, Result};
use crate::message::{ControlCode, Frame};
use crate::tls::TlsContext;
use crate::transport::{self, FramedTransport};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hmac::{Hmac, Mac};
use md5::Md5;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Upper bound for the whole handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub const AUTH_OK: &str = "1000 OK auth\n";
pub const AUTH_FAILED: &str = "1999 Authorization failed.\n";
pub const GREETING_OK_PREFIX: &str = "1000 OK:";

const BASE64_DIGITS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// TLS requirement each side advertises in its challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsNeed {
    None = 0,
    Ok = 1,
    Required = 2,
}

impl TlsNeed {
    /// Local requirement for a set of TLS settings. Authenticate-only TLS
    /// always requires the upgrade.
    pub fn from_settings(settings: &TlsSettings) -> Self {
        if settings.require || settings.authenticate {
            TlsNeed::Required
        } else if settings.enable {
            TlsNeed::Ok
        } else {
            TlsNeed::None
        }
    }

    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(TlsNeed::None),
            1 => Some(TlsNeed::Ok),
            2 => Some(TlsNeed::Required),
            _ => None,
        }
    }

    pub fn wire_value(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for TlsNeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsNeed::None => write!(f, "NONE"),
            TlsNeed::Ok => write!(f, "OK"),
            TlsNeed::Required => write!(f, "REQUIRED"),
        }
    }
}

/// Outcome of comparing both sides' TLS needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsDecision {
    Plaintext,
    Upgrade,
    /// Needs cannot be reconciled; carries the reason
    Refuse(String),
}

pub fn negotiate_tls(local: TlsNeed, remote: TlsNeed) -> TlsDecision {
    let neither_ok = local != TlsNeed::Ok && remote != TlsNeed::Ok;
    if remote < local && neither_ok {
        return TlsDecision::Refuse("did not advertise required TLS support.".to_string());
    }
    if remote > local && neither_ok {
        return TlsDecision::Refuse("Remote server requires TLS.".to_string());
    }
    if local >= TlsNeed::Ok && remote >= TlsNeed::Ok {
        TlsDecision::Upgrade
    } else {
        TlsDecision::Plaintext
    }
}

/// Replace spaces so a name survives the peer's whitespace-split parser
pub fn bash_spaces(name: &str) -> String {
    name.replace(' ', "\u{1}")
}

pub fn unbash_spaces(name: &str) -> String {
    name.replace('\u{1}', " ")
}

pub fn hello_line(name: &str) -> String {
    format!("Hello {} calling\n", bash_spaces(name))
}

pub fn hmac_md5(key: &[u8], challenge: &[u8]) -> [u8; 16] {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Md5>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC key length is unrestricted"),
    };
    mac.update(challenge);
    mac.finalize().into_bytes().into()
}

/// Encode bytes in the director's unpadded base64.
///
/// The compatible form is plain RFC 4648 base64 without padding. The legacy
/// form sign-extends every byte and leaves the final partial group
/// unshifted, which older directors still produce and expect.
pub fn bin_to_base64(bin: &[u8], compatible: bool) -> String {
    if compatible {
        return STANDARD_NO_PAD.encode(bin);
    }

    let mut out = String::with_capacity(bin.len() * 4 / 3 + 2);
    let mut reg: u32 = 0;
    let mut rem: u32 = 0;
    let mut i = 0;
    while i < bin.len() {
        if rem < 6 {
            reg = (reg << 8) | (bin[i] as i8 as i32 as u32);
            i += 1;
            rem += 8;
        }
        out.push(BASE64_DIGITS[((reg >> (rem - 6)) & 0x3f) as usize] as char);
        rem -= 6;
    }
    if rem > 0 {
        let mask = (1u32 << rem) - 1;
        out.push(BASE64_DIGITS[(reg & mask) as usize] as char);
    }
    out
}

/// A parsed `auth cram-md5` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub text: String,
    /// `cram-md5c`: the answer must use compatible base64
    pub compatible: bool,
    pub tls_need: TlsNeed,
}

impl Challenge {
    pub fn line(&self) -> String {
        let verb = if self.compatible { "cram-md5c" } else { "cram-md5" };
        format!("auth {} {} ssl={}\n", verb, self.text, self.tls_need.wire_value())
    }

    pub fn expected_response(&self, key: &str) -> String {
        bin_to_base64(&hmac_md5(key.as_bytes(), self.text.as_bytes()), self.compatible)
    }

    /// Either encoding of the right digest is accepted
    pub fn verify(&self, key: &str, response: &str) -> bool {
        let digest = hmac_md5(key.as_bytes(), self.text.as_bytes());
        let response = response.trim_end_matches(['\n', '\r', '\0']);
        response == bin_to_base64(&digest, true) || response == bin_to_base64(&digest, false)
    }
}

pub fn parse_challenge(line: &str) -> Option<Challenge> {
    let mut words = line.split_whitespace();
    if words.next()? != "auth" {
        return None;
    }
    let compatible = match words.next()? {
        "cram-md5c" => true,
        "cram-md5" => false,
        _ => return None,
    };
    let text = words.next()?.to_string();
    let tls_need = match words.next() {
        Some(field) => {
            let value = field.strip_prefix("ssl=")?.parse::<i32>().ok()?;
            TlsNeed::from_wire(value)?
        }
        // Legacy directors omit the field entirely
        None if !compatible => TlsNeed::None,
        None => return None,
    };
    Some(Challenge {
        text,
        compatible,
        tls_need,
    })
}

/// Fresh challenge text of the form `<random.seconds@host>`
pub fn make_challenge() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("<{}.{}@{}>", rand::random::<u32>(), seconds, host)
}

async fn recv_line<S>(io: &mut S, endpoint: &str, phase: AuthPhase) -> Result<String>
where
    S: Stream<Item = Result<Frame>> + Unpin,
{
    match io.next().await {
        Some(Ok(Frame::Text(text))) => Ok(text),
        Some(Ok(Frame::Control(ControlCode::HardEof))) | None => Err(DirConsoleError::auth(
            endpoint,
            phase,
            "connection closed by peer",
        )),
        Some(Ok(Frame::Control(code))) => Err(DirConsoleError::auth(
            endpoint,
            phase,
            format!("unexpected {} signal", code),
        )),
        Some(Err(e)) => Err(DirConsoleError::auth(endpoint, phase, e.to_string())),
    }
}

async fn send_line<S>(io: &mut S, endpoint: &str, phase: AuthPhase, line: &str) -> Result<()>
where
    S: Sink<Frame, Error = DirConsoleError> + Unpin,
{
    io.send(Frame::text(line))
        .await
        .map_err(|e| DirConsoleError::auth(endpoint, phase, e.to_string()))
}

/// Answer the peer's challenge. Returns the TLS need the peer advertised.
pub async fn respond_to_challenge<S>(io: &mut S, endpoint: &str, key: &str) -> Result<TlsNeed>
where
    S: Stream<Item = Result<Frame>> + Sink<Frame, Error = DirConsoleError> + Unpin,
{
    let phase = AuthPhase::CramMd5;
    let line = recv_line(io, endpoint, phase).await?;
    let challenge = parse_challenge(&line).ok_or_else(|| {
        DirConsoleError::auth(endpoint, phase, format!("bad challenge: {}", line.trim_end()))
    })?;
    debug!(compatible = challenge.compatible, remote_tls = %challenge.tls_need, "received challenge");

    send_line(io, endpoint, phase, &challenge.expected_response(key)).await?;
    let ack = recv_line(io, endpoint, phase).await?;
    if ack.trim_end() != AUTH_OK.trim_end() {
        return Err(DirConsoleError::auth(
            endpoint,
            phase,
            "peer rejected our response. Passwords or names not the same",
        ));
    }
    Ok(challenge.tls_need)
}

/// Challenge the peer and check its answer, acknowledging either way
pub async fn challenge_peer<S>(io: &mut S, endpoint: &str, key: &str, local: TlsNeed) -> Result<()>
where
    S: Stream<Item = Result<Frame>> + Sink<Frame, Error = DirConsoleError> + Unpin,
{
    let phase = AuthPhase::CramMd5;
    let challenge = Challenge {
        text: make_challenge(),
        compatible: true,
        tls_need: local,
    };
    send_line(io, endpoint, phase, &challenge.line()).await?;

    let response = recv_line(io, endpoint, phase).await?;
    if challenge.verify(key, &response) {
        send_line(io, endpoint, phase, AUTH_OK).await
    } else {
        // Best effort, the error below is what matters
        let _ = send_line(io, endpoint, phase, AUTH_FAILED).await;
        Err(DirConsoleError::auth(
            endpoint,
            phase,
            "peer answered our challenge wrongly. Passwords or names not the same",
        ))
    }
}

/// Authenticate a freshly opened connection.
///
/// Returns the connection (upgraded to TLS when negotiated) and the greeting
/// the director sent once it accepted us.
pub(crate) async fn authenticate(
    framed: FramedTransport,
    endpoint: &Endpoint,
    credential: &Credential,
    tls: Option<&TlsContext>,
) -> Result<(FramedTransport, String)> {
    let mut phase = AuthPhase::Hello;
    let outcome = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        run_handshake(framed, endpoint, credential, tls, &mut phase),
    )
    .await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(DirConsoleError::auth(
            endpoint.display_addr(),
            phase,
            format!("no response within {:?}", HANDSHAKE_TIMEOUT),
        )),
    }
}

async fn run_handshake(
    mut framed: FramedTransport,
    endpoint: &Endpoint,
    credential: &Credential,
    tls: Option<&TlsContext>,
    phase: &mut AuthPhase,
) -> Result<(FramedTransport, String)> {
    let label = endpoint.display_addr();
    let local = TlsNeed::from_settings(&endpoint.tls);

    *phase = AuthPhase::Hello;
    debug!(endpoint = %label, name = credential.name(), "sending hello");
    send_line(&mut framed, &label, *phase, &hello_line(credential.name())).await?;

    *phase = AuthPhase::CramMd5;
    let remote = respond_to_challenge(&mut framed, &label, credential.key()).await?;
    challenge_peer(&mut framed, &label, credential.key(), local).await?;
    debug!(endpoint = %label, local = %local, remote = %remote, "CRAM-MD5 complete");

    *phase = AuthPhase::Tls;
    match negotiate_tls(local, remote) {
        TlsDecision::Refuse(detail) => {
            warn!(endpoint = %label, local = %local, remote = %remote, "TLS policy mismatch");
            return Err(DirConsoleError::TlsPolicy {
                endpoint: label,
                detail,
            });
        }
        TlsDecision::Upgrade => {
            let context = tls.ok_or_else(|| {
                DirConsoleError::TlsContext(format!("no TLS context configured for {}", label))
            })?;
            framed = transport::upgrade(framed, context, endpoint).await?;
            if endpoint.tls.authenticate {
                debug!(endpoint = %label, "authenticate-only TLS, returning to plaintext");
                framed = transport::downgrade(framed, endpoint).await?;
            }
        }
        TlsDecision::Plaintext => {}
    }

    *phase = AuthPhase::GreetingAck;
    let greeting = recv_line(&mut framed, &label, *phase).await?;
    let greeting = greeting.trim_end_matches(['\n', '\r']).to_string();
    if !greeting.starts_with(GREETING_OK_PREFIX) {
        return Err(DirConsoleError::HandshakeRejected {
            endpoint: label,
            response: greeting,
        });
    }
    debug!(endpoint = %label, %greeting, "director accepted console");
    Ok((framed, greeting))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bash_round_trip() {
        let bashed = bash_spaces("restore operator");
        assert!(!bashed.contains(' '));
        assert_eq!(unbash_spaces(&bashed), "restore operator");
        assert_eq!(hello_line("a b"), "Hello a\u{1}b calling\n");
    }

    #[test]
    fn test_hmac_md5_rfc2104_vector() {
        // RFC 2104 test case 2
        let digest = hmac_md5(b"Jefe", b"what do ya want for nothing?");
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn test_base64_single_byte() {
        assert_eq!(bin_to_base64(&[0xff], true), "/w");
        assert_eq!(bin_to_base64(&[0xff], false), "/D");
    }

    #[test]
    fn test_base64_digest_tail() {
        let mut digest = [0u8; 16];
        digest[15] = 0x01;
        let prefix = "A".repeat(21);
        assert_eq!(bin_to_base64(&digest, true), format!("{}Q", prefix));
        assert_eq!(bin_to_base64(&digest, false), format!("{}B", prefix));
    }

    #[test]
    fn test_base64_forms_agree_on_full_groups() {
        // Three low bytes: no sign extension and no partial group
        assert_eq!(bin_to_base64(b"abc", true), "YWJj");
        assert_eq!(bin_to_base64(b"abc", false), "YWJj");
    }

    #[test]
    fn test_parse_challenge_forms() {
        let c = parse_challenge("auth cram-md5c <1.2@dir> ssl=1\n").unwrap();
        assert!(c.compatible);
        assert_eq!(c.text, "<1.2@dir>");
        assert_eq!(c.tls_need, TlsNeed::Ok);

        let c = parse_challenge("auth cram-md5 <1.2@dir> ssl=2").unwrap();
        assert!(!c.compatible);
        assert_eq!(c.tls_need, TlsNeed::Required);

        let c = parse_challenge("auth cram-md5 <1.2@dir>").unwrap();
        assert_eq!(c.tls_need, TlsNeed::None);

        assert!(parse_challenge("auth cram-md5c <1.2@dir>").is_none());
        assert!(parse_challenge("auth cram-md5c <1.2@dir> ssl=7").is_none());
        assert!(parse_challenge("hello there").is_none());
    }

    #[test]
    fn test_challenge_line_parses_back() {
        let challenge = Challenge {
            text: make_challenge(),
            compatible: true,
            tls_need: TlsNeed::Required,
        };
        assert_eq!(parse_challenge(&challenge.line()), Some(challenge));
    }

    #[test]
    fn test_verify_accepts_both_encodings() {
        let challenge = Challenge {
            text: "<42.1700000000@dir>".to_string(),
            compatible: true,
            tls_need: TlsNeed::None,
        };
        let digest = hmac_md5(b"key", challenge.text.as_bytes());
        assert!(challenge.verify("key", &bin_to_base64(&digest, true)));
        assert!(challenge.verify("key", &format!("{}\n", bin_to_base64(&digest, false))));
        assert!(!challenge.verify("other", &bin_to_base64(&digest, true)));
    }

    #[test]
    fn test_make_challenge_shape() {
        let text = make_challenge();
        assert!(text.starts_with('<') && text.ends_with('>'));
        assert!(text.contains('@'));
        assert!(!text.contains(' '));
    }

    #[test]
    fn test_local_need_from_settings() {
        let mut settings = TlsSettings::default();
        assert_eq!(TlsNeed::from_settings(&settings), TlsNeed::None);
        settings.enable = true;
        assert_eq!(TlsNeed::from_settings(&settings), TlsNeed::Ok);
        settings.require = true;
        assert_eq!(TlsNeed::from_settings(&settings), TlsNeed::Required);

        let authenticate_only = TlsSettings {
            enable: true,
            authenticate: true,
            ..Default::default()
        };
        assert_eq!(TlsNeed::from_settings(&authenticate_only), TlsNeed::Required);
    }

    #[test]
    fn test_negotiate_tls_matrix() {
        use TlsNeed::*;
        assert_eq!(negotiate_tls(None, None), TlsDecision::Plaintext);
        assert_eq!(negotiate_tls(Ok, None), TlsDecision::Plaintext);
        assert_eq!(negotiate_tls(None, Ok), TlsDecision::Plaintext);
        assert_eq!(negotiate_tls(Ok, Ok), TlsDecision::Upgrade);
        assert_eq!(negotiate_tls(Required, Ok), TlsDecision::Upgrade);
        assert_eq!(negotiate_tls(Ok, Required), TlsDecision::Upgrade);
        assert_eq!(negotiate_tls(Required, Required), TlsDecision::Upgrade);

        match negotiate_tls(Required, None) {
            TlsDecision::Refuse(detail) => {
                assert!(detail.contains("did not advertise required TLS support"))
            }
            other => panic!("Expected refusal, got: {:?}", other),
        }
        match negotiate_tls(None, Required) {
            TlsDecision::Refuse(detail) => assert!(detail.contains("Remote server requires TLS")),
            other => panic!("Expected refusal, got: {:?}", other),
        }
    }
}
