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

/// Length-prefixed frame codec for the director console protocol
///
/// Frame format:
/// - 4-byte big-endian signed length
/// - `length > 0`: that many bytes of text follow
/// - `length == 0`: empty text frame, nothing follows
/// - `length < 0`: no payload, the value selects a [`ControlCode`]
use crate::error::{DirConsoleError, Result};
use crate::message::{ControlCode, Frame};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Largest text payload accepted from the peer (1,000,000 bytes). The
/// director never sends more in a single packet.
pub const MAX_FRAME_LEN: usize = 1_000_000;

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_frame(frame, &mut buf);
    buf.to_vec()
}

fn put_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Text(text) => {
            dst.reserve(HEADER_LEN + text.len());
            dst.put_i32(text.len() as i32);
            dst.put_slice(text.as_bytes());
        }
        Frame::Control(code) => {
            dst.reserve(HEADER_LEN);
            dst.put_i32(code.wire_value());
        }
    }
}

/// Decode text as UTF-8, falling back to Latin-1 for anything else
fn decode_text(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => payload.iter().map(|&b| b as char).collect(),
    }
}

/// Decode one frame from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and the
/// number of bytes it occupied. A text payload is only consumed once it is
/// complete.
pub fn decode_frame(data: &[u8]) -> Result<Option<(Frame, usize)>> {
    if data.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&data[..HEADER_LEN]);
    let length = i32::from_be_bytes(header);

    if length < 0 {
        let code = ControlCode::from_wire(length).ok_or_else(|| {
            DirConsoleError::protocol_with_preview(
                format!("Unknown control sentinel {}", length),
                0,
                &data[..HEADER_LEN],
            )
        })?;
        return Ok(Some((Frame::Control(code), HEADER_LEN)));
    }

    let length = length as usize;
    if length > MAX_FRAME_LEN {
        return Err(DirConsoleError::protocol(
            format!(
                "Packet size too big: {} bytes exceeds maximum of {} bytes",
                length, MAX_FRAME_LEN
            ),
            0,
        ));
    }

    let end = HEADER_LEN + length;
    if data.len() < end {
        return Ok(None);
    }

    Ok(Some((Frame::Text(decode_text(&data[HEADER_LEN..end])), end)))
}

/// tokio-util codec over [`decode_frame`] / [`encode_frame`]
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = DirConsoleError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match decode_frame(src)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => {
                if src.len() >= HEADER_LEN {
                    // Reserve room for the rest of the declared payload
                    let declared = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                    if declared > 0 {
                        src.reserve(HEADER_LEN + declared as usize - src.len());
                    }
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(DirConsoleError::protocol_with_preview(
                format!("Connection closed with {} bytes of an incomplete frame", src.len()),
                src.len(),
                src,
            )),
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = DirConsoleError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        Encoder::<&Frame>::encode(self, &frame, dst)
    }
}

impl<'a> Encoder<&'a Frame> for WireCodec {
    type Error = DirConsoleError;

    fn encode(&mut self, frame: &'a Frame, dst: &mut BytesMut) -> Result<()> {
        if let Frame::Text(text) = frame {
            if text.len() > MAX_FRAME_LEN {
                return Err(DirConsoleError::protocol(
                    format!("Refusing to send {} byte packet", text.len()),
                    0,
                ));
            }
        }
        put_frame(frame, dst);
        Ok(())
    }
}
