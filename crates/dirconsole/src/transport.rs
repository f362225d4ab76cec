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

//! Byte stream under the frame codec, plain TCP or TLS on the same socket

use crate::codec::WireCodec;
use crate::config::Endpoint;
use crate::error::{AuthPhase, DirConsoleError, Result};
use crate::tls::TlsContext;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use std::io::Read;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_util::codec::Framed;
use tracing::debug;

pub(crate) type FramedTransport = Framed<Transport, WireCodec>;

/// Largest TLS record on the wire: 2^14 bytes of payload plus expansion
const MAX_TLS_RECORD: usize = 16_384 + 2_048;
const TLS_HEADER_LEN: usize = 5;

pub enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Socket for one connect attempt.
///
/// A non-zero heartbeat interval switches SO_KEEPALIVE on. Probe timing is
/// left to the operating system, so only zero versus non-zero matters.
fn socket_for(addr: &SocketAddr, endpoint: &Endpoint) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(!endpoint.heartbeat_interval.is_zero())?;
    Ok(socket)
}

/// Open a TCP connection to `endpoint`, trying each resolved address in turn.
pub(crate) async fn open(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let label = endpoint.display_addr();
    let connect = async {
        let mut last_err = None;
        for addr in lookup_host((endpoint.address.as_str(), endpoint.port)).await? {
            let socket = socket_for(&addr, endpoint)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err::<TcpStream, io::Error>(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        }))
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(DirConsoleError::Connect {
            endpoint: label,
            source,
        }),
        Err(_) => Err(DirConsoleError::Connect {
            endpoint: label,
            source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

/// Run a TLS client handshake on the socket under `framed`.
///
/// The director stays silent until our ClientHello, so any buffered input at
/// this point means the peers are out of step.
pub(crate) async fn upgrade(
    framed: FramedTransport,
    context: &TlsContext,
    endpoint: &Endpoint,
) -> Result<FramedTransport> {
    let label = endpoint.display_addr();
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(DirConsoleError::auth(
            label,
            AuthPhase::Tls,
            format!("{} unexpected bytes before TLS handshake", parts.read_buf.len()),
        ));
    }
    let tcp = match parts.io {
        Transport::Plain(tcp) => tcp,
        Transport::Tls(_) => {
            return Err(DirConsoleError::auth(label, AuthPhase::Tls, "connection is already encrypted"));
        }
    };

    let server_name = context.server_name(&endpoint.address)?;
    let tls = context
        .connector()
        .connect(server_name, tcp)
        .await
        .map_err(|e| DirConsoleError::auth(label, AuthPhase::Tls, format!("TLS negotiation failed: {}", e)))?;

    debug!(endpoint = %endpoint.display_addr(), "TLS established");
    Ok(Framed::new(Transport::Tls(Box::new(tls)), WireCodec))
}

/// Close the TLS layer and continue in plaintext on the same socket.
///
/// Used for authenticate-only TLS once the handshake has protected the
/// authentication exchange.
pub(crate) async fn downgrade(framed: FramedTransport, endpoint: &Endpoint) -> Result<FramedTransport> {
    let label = endpoint.display_addr();
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        return Err(DirConsoleError::auth(
            label,
            AuthPhase::Tls,
            format!("{} bytes of plaintext read before TLS shutdown", parts.read_buf.len()),
        ));
    }
    match parts.io {
        Transport::Tls(tls) => {
            let (tcp, conn) = tls.into_inner();
            let tcp = close_tls(tcp, conn).await.map_err(|e| {
                DirConsoleError::auth(label, AuthPhase::Tls, format!("TLS shutdown failed: {}", e))
            })?;
            debug!(endpoint = %endpoint.display_addr(), "TLS closed, continuing in plaintext");
            Ok(Framed::new(Transport::Plain(tcp), WireCodec))
        }
        Transport::Plain(tcp) => Ok(Framed::new(Transport::Plain(tcp), WireCodec)),
    }
}

/// Shut a TLS session down in order and hand back the socket under it.
///
/// Sends our close_notify, then reads whole records until the peer's
/// close_notify arrives. Records are read by their header length, so no
/// byte the peer sends after its close_notify is consumed. Session tickets
/// and application data that arrive before it are dropped.
pub async fn close_tls<S>(mut io: S, conn: impl Into<rustls::Connection>) -> io::Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn: rustls::Connection = conn.into();
    conn.send_close_notify();
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out)?;
    }
    io.write_all(&out).await?;
    io.flush().await?;

    // Records read during the handshake may already hold the close_notify
    let mut state = conn.process_new_packets().map_err(tls_error)?;
    let mut record = Vec::with_capacity(TLS_HEADER_LEN + MAX_TLS_RECORD);
    loop {
        discard_plaintext(&mut conn, state.plaintext_bytes_to_read())?;
        if state.peer_has_closed() {
            return Ok(io);
        }

        record.resize(TLS_HEADER_LEN, 0);
        io.read_exact(&mut record).await?;
        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
        if len > MAX_TLS_RECORD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("TLS record of {} bytes", len),
            ));
        }
        record.resize(TLS_HEADER_LEN + len, 0);
        io.read_exact(&mut record[TLS_HEADER_LEN..]).await?;

        let mut pending = record.as_slice();
        while !pending.is_empty() {
            conn.read_tls(&mut pending)?;
        }
        state = conn.process_new_packets().map_err(tls_error)?;
    }
}

fn discard_plaintext(conn: &mut rustls::Connection, len: usize) -> io::Result<()> {
    if len > 0 {
        let mut skipped = vec![0u8; len];
        conn.reader().read_exact(&mut skipped)?;
        debug!(bytes = len, "dropped application data before close_notify");
    }
    Ok(())
}

fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
