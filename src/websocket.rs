// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! RFC 6455 WebSocket framing adapter.
//!
//! Exists purely so the RFB protocol engine can talk to noVNC-style
//! browser clients without knowing framing differs: after
//! [`handshake`], [`WebSocketStream::read`]/[`WebSocketStream::write`]
//! present the same reliable byte-stream shape as a raw `TcpStream`.
//! Detection of which transport a new connection is speaking happens one
//! level up, by peeking the first bytes for a `GET ` prefix.

use crate::error::{Result, VncError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The first bytes of a connection that identify it as an HTTP/WebSocket
/// upgrade rather than raw RFB. Callers peek this many bytes (without
/// consuming them) to decide which path to take.
pub const DETECTION_PEEK_LEN: usize = 16;

/// Returns true if `peeked` (the first bytes read from a new connection)
/// looks like an HTTP request line, case-insensitively.
#[must_use]
pub fn looks_like_websocket(peeked: &[u8]) -> bool {
    peeked.len() >= 4 && peeked[..4].eq_ignore_ascii_case(b"GET ")
}

/// Negotiated subprotocol, controlling how payload bytes are framed on
/// top of the already-binary WebSocket frames (`base64` is for browser
/// contexts where a genuinely binary subprotocol wasn't offered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subprotocol {
    /// `binary`: frame payloads are raw RFB bytes.
    Binary,
    /// `base64`: frame payloads are base64-encoded RFB bytes.
    Base64,
}

/// Performs the RFC 6455 opening handshake on `stream`, reading the HTTP
/// request headers already peeked into `request_head` (the full request,
/// ending in `\r\n\r\n`) and replying with `101 Switching Protocols`.
///
/// # Errors
///
/// Returns [`VncError::Protocol`] if the request is missing
/// `Sec-WebSocket-Key` or doesn't ask for WebSocket upgrade, or
/// [`VncError::Transport`] on a write failure.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    request_head: &str,
) -> Result<Subprotocol> {
    let key = find_header(request_head, "sec-websocket-key")
        .ok_or_else(|| VncError::Protocol("WebSocket handshake missing Sec-WebSocket-Key".to_string()))?;

    let subprotocol = find_header(request_head, "sec-websocket-protocol")
        .and_then(|offered| {
            let mut options = offered.split(',').map(str::trim);
            if options.clone().any(|p| p.eq_ignore_ascii_case("binary")) {
                Some(Subprotocol::Binary)
            } else if options.any(|p| p.eq_ignore_ascii_case("base64")) {
                Some(Subprotocol::Base64)
            } else {
                None
            }
        })
        .unwrap_or(Subprotocol::Binary);

    let accept = compute_accept(&key);

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    response.push_str(match subprotocol {
        Subprotocol::Binary => "Sec-WebSocket-Protocol: binary\r\n",
        Subprotocol::Base64 => "Sec-WebSocket-Protocol: base64\r\n",
    });
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    Ok(subprotocol)
}

fn compute_accept(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn find_header<'a>(request_head: &'a str, name: &str) -> Option<&'a str> {
    request_head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

const OPCODE_CONTINUATION: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xA;

/// Wraps an underlying stream, presenting reassembled, unmasked RFB bytes
/// after the WebSocket handshake has completed.
pub struct WebSocketStream<S> {
    inner: S,
    subprotocol: Subprotocol,
    max_payload_bytes: usize,
    read_buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WebSocketStream<S> {
    /// Wraps `inner` (already past the handshake) for framed RFB I/O.
    #[must_use]
    pub fn new(inner: S, subprotocol: Subprotocol, max_payload_bytes: usize) -> Self {
        Self { inner, subprotocol, max_payload_bytes, read_buf: Vec::new() }
    }

    /// Reads the next application-data message (binary or text,
    /// base64-decoded if negotiated), handling ping/pong/close frames
    /// inline without surfacing them to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Protocol`] if a frame violates framing rules or
    /// exceeds `max_payload_bytes`, or [`VncError::Transport`] on I/O failure.
    pub async fn read_message(&mut self) -> Result<Vec<u8>> {
        loop {
            let (opcode, payload) = self.read_frame().await?;
            match opcode {
                OPCODE_BINARY | OPCODE_TEXT | OPCODE_CONTINUATION => {
                    return match self.subprotocol {
                        Subprotocol::Binary => Ok(payload),
                        Subprotocol::Base64 => BASE64
                            .decode(&payload)
                            .map_err(|e| VncError::Protocol(format!("invalid base64 WebSocket payload: {e}"))),
                    };
                }
                OPCODE_PING => self.write_frame(OPCODE_PONG, &payload).await?,
                OPCODE_PONG => {} // ignore
                OPCODE_CLOSE => {
                    self.write_frame(OPCODE_CLOSE, &payload).await?;
                    return Err(VncError::Protocol("WebSocket peer closed the connection".to_string()));
                }
                other => {
                    return Err(VncError::Protocol(format!("unsupported WebSocket opcode {other}")));
                }
            }
        }
    }

    /// Writes `data` as one unmasked binary (or base64-text, if
    /// negotiated) WebSocket frame.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Transport`] on I/O failure.
    pub async fn write_message(&mut self, data: &[u8]) -> Result<()> {
        match self.subprotocol {
            Subprotocol::Binary => self.write_frame(OPCODE_BINARY, data).await,
            Subprotocol::Base64 => {
                let encoded = BASE64.encode(data);
                self.write_frame(OPCODE_TEXT, encoded.as_bytes()).await
            }
        }
    }

    async fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 2];
        self.inner.read_exact(&mut header).await?;

        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0F;
        let masked = header[1] & 0x80 != 0;
        let len_field = header[1] & 0x7F;

        if !masked {
            return Err(VncError::Protocol("client WebSocket frame must be masked".to_string()));
        }

        let payload_len: usize = match len_field {
            126 => {
                let mut ext = [0u8; 2];
                self.inner.read_exact(&mut ext).await?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.inner.read_exact(&mut ext).await?;
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };

        if self.read_buf.len() + payload_len > self.max_payload_bytes {
            return Err(VncError::Protocol(format!(
                "WebSocket message exceeds {} byte cap",
                self.max_payload_bytes
            )));
        }

        let mut mask = [0u8; 4];
        self.inner.read_exact(&mut mask).await?;

        let mut payload = vec![0u8; payload_len];
        self.inner.read_exact(&mut payload).await?;
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        if !fin {
            self.read_buf.extend_from_slice(&payload);
            // Fragmented frame: recurse until the final frame arrives, then
            // return the whole reassembled message with the final opcode.
            let (final_opcode, rest) = Box::pin(self.read_frame()).await?;
            let mut whole = std::mem::take(&mut self.read_buf);
            whole.extend_from_slice(&rest);
            return Ok((final_opcode, whole));
        }

        if self.read_buf.is_empty() {
            Ok((opcode, payload))
        } else {
            let mut whole = std::mem::take(&mut self.read_buf);
            whole.extend_from_slice(&payload);
            Ok((opcode, whole))
        }
    }

    async fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 10);
        frame.push(0x80 | opcode); // FIN set, no extensions

        let len = payload.len();
        if len < 126 {
            frame.push(len as u8);
        } else if len <= u16::MAX as usize {
            frame.push(126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        frame.extend_from_slice(payload); // server frames are unmasked

        self.inner.write_all(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_get_prefix_case_insensitively() {
        assert!(looks_like_websocket(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_websocket(b"get / HTTP/1.1\r\n"));
        assert!(!looks_like_websocket(&[0x03, 0x00, 0x00, 0x00]));
    }

    #[test]
    fn accept_key_matches_rfc_6455_example() {
        // From RFC 6455 §1.3's worked example.
        let accept = compute_accept("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn finds_header_case_insensitively() {
        let head = "GET / HTTP/1.1\r\nSec-WebSocket-Key: abc123\r\nHost: x\r\n";
        assert_eq!(find_header(head, "sec-websocket-key"), Some("abc123"));
    }

    #[test]
    fn chooses_binary_subprotocol_when_offered() {
        let head = "GET / HTTP/1.1\r\nSec-WebSocket-Protocol: base64, binary\r\n";
        assert_eq!(find_header(head, "sec-websocket-protocol"), Some("base64, binary"));
    }
}
