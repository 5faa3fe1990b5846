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

//! VNC Remote Framebuffer (RFB) protocol constants and structures.
//!
//! This module provides the fundamental building blocks for VNC protocol communication,
//! including protocol version negotiation, message types, security handshakes, encodings,
//! and pixel format definitions. It implements the RFB protocol as specified in RFC 6143.
//!
//! # Protocol Overview
//!
//! The VNC RFB protocol operates in the following phases:
//! 1. **Protocol Version** - Server and client agree on protocol version
//! 2. **Security Handshake** - Authentication method selection and execution
//! 3. **Initialization** - Exchange of framebuffer parameters and capabilities
//! 4. **Normal Operation** - Ongoing message exchange for input events and screen updates

use crate::error::VncError;
use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// The RFB protocol version string advertised by the server.
///
/// This server speaks RFB 3.8 but understands version handshakes down to
/// 3.3, since the security-result phase differs between them (see
/// [`RfbVersion`]).
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// Protocol version negotiated during the version handshake.
///
/// Affects only the shape of the security handshake that follows: 3.3
/// has the server unilaterally choose and announce a single security
/// type, while 3.7 and 3.8 have the server offer a list and the client
/// pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfbVersion {
    /// RFB 3.3: server dictates the security type.
    V3_3,
    /// RFB 3.7: client selects from an offered list; no SecurityResult reason string on failure.
    V3_7,
    /// RFB 3.8: like 3.7, plus a reason string accompanies a failed SecurityResult.
    V3_8,
}

impl RfbVersion {
    /// Parses the 12-byte `"RFB xxx.yyy\n"` version line sent by a client
    /// and negotiates down to the greatest of `{3.3, 3.7, 3.8}` that is
    /// `≤` the client's advertised `(major, minor)`.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Protocol`] if the line isn't exactly 12 bytes
    /// with the `"RFB "` prefix, a `.` separator, and a trailing `\n`; if
    /// the major/minor fields aren't ASCII decimal integers; or if the
    /// client's version is older than 3.3 (no supported version is `≤`
    /// it).
    pub fn parse(line: &[u8]) -> crate::error::Result<Self> {
        if line.len() != 12 || &line[0..4] != b"RFB " || line[7] != b'.' || line[11] != b'\n' {
            return Err(VncError::Protocol(format!(
                "malformed RFB version line: {:?}",
                String::from_utf8_lossy(line)
            )));
        }
        let parse_field = |field: &[u8]| {
            std::str::from_utf8(field).ok().and_then(|s| s.parse::<u32>().ok())
        };
        let major = parse_field(&line[4..7]).ok_or_else(|| {
            VncError::Protocol(format!("non-numeric RFB major version: {:?}", String::from_utf8_lossy(line)))
        })?;
        let minor = parse_field(&line[8..11]).ok_or_else(|| {
            VncError::Protocol(format!("non-numeric RFB minor version: {:?}", String::from_utf8_lossy(line)))
        })?;

        [(3, 8, RfbVersion::V3_8), (3, 7, RfbVersion::V3_7), (3, 3, RfbVersion::V3_3)]
            .into_iter()
            .find(|&(m, n, _)| (m, n) <= (major, minor))
            .map(|(_, _, version)| version)
            .ok_or_else(|| VncError::Protocol(format!("unsupported RFB version {major}.{minor}")))
    }

    /// Whether the security handshake uses the 3.7+ offered-list form.
    #[must_use]
    pub fn offers_security_list(self) -> bool {
        !matches!(self, RfbVersion::V3_3)
    }

    /// Whether a failed `SecurityResult` carries a reason string (3.8 only).
    #[must_use]
    pub fn security_result_has_reason(self) -> bool {
        matches!(self, RfbVersion::V3_8)
    }
}

// Client-to-Server Message Types

/// Message type: Client requests to change the pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: Client specifies supported encodings.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: Client requests a framebuffer update.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: Client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-Client Message Types

/// Message type: Server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: Server sets colour map entries.
#[allow(dead_code)]
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;

/// Message type: Server sends a bell (beep) notification.
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: Server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encoding Types — the canonical encoder family plus the pseudo-encodings
// clients use to negotiate cursor/resize/quality/compression behavior.

/// Encoding type: Raw pixel data.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: Copy Rectangle.
pub const ENCODING_COPYRECT: i32 = 1;

/// Encoding type: Rise-and-Run-length Encoding.
pub const ENCODING_RRE: i32 = 2;

/// Encoding type: Hextile.
pub const ENCODING_HEXTILE: i32 = 5;

/// Encoding type: Tight.
pub const ENCODING_TIGHT: i32 = 7;

/// Encoding type: Zlib-compressed Run-Length Encoding.
pub const ENCODING_ZRLE: i32 = 16;

/// Encoding type: H.264 video.
///
/// Defined by the RFB registry but not implemented: mainline VNC dropped
/// H.264 support in v0.9.11 (2016) as broken and unmaintained. Kept only
/// so a client offering it doesn't trip an "unknown encoding" error.
#[allow(dead_code)]
pub const ENCODING_H264: i32 = 0x4832_3634;

/// Pseudo-encoding: Rich Cursor.
pub const ENCODING_CURSOR: i32 = -239;

/// Pseudo-encoding: Desktop Size.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

/// Pseudo-encoding: Extended Desktop Size.
pub const ENCODING_EXTENDED_DESKTOP_SIZE: i32 = -308;

/// Pseudo-encoding: JPEG Quality Level 0 (lowest quality, highest compression).
pub const ENCODING_QUALITY_LEVEL_0: i32 = -32;

/// Pseudo-encoding: JPEG Quality Level 9 (highest quality, lowest compression).
pub const ENCODING_QUALITY_LEVEL_9: i32 = -23;

/// Pseudo-encoding: Compression Level 0 (no compression, fastest).
pub const ENCODING_COMPRESS_LEVEL_0: i32 = -256;

/// Pseudo-encoding: Compression Level 9 (maximum compression, slowest).
pub const ENCODING_COMPRESS_LEVEL_9: i32 = -247;

// Hextile subencoding flags

/// Hextile: Raw pixel data for this tile.
pub const HEXTILE_RAW: u8 = 1 << 0;

/// Hextile: Background color is specified.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 1 << 1;

/// Hextile: Foreground color is specified.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 1 << 2;

/// Hextile: Tile contains subrectangles.
pub const HEXTILE_ANY_SUBRECTS: u8 = 1 << 3;

/// Hextile: Subrectangles are colored (not monochrome).
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 1 << 4;

// Security Types

/// Security type: Invalid/Unknown.
#[allow(dead_code)]
pub const SECURITY_TYPE_INVALID: u8 = 0;

/// Security type: None (no authentication).
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: VNC Authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Security result: Authentication successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security result: Authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Represents the pixel format of the VNC framebuffer.
///
/// This struct defines how pixel data is interpreted, including color depth,
/// endianness, and RGB component details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel.
    pub bits_per_pixel: u8,
    /// Depth of the pixel in bits.
    pub depth: u8,
    /// Flag indicating if the pixel data is big-endian (1) or little-endian (0).
    pub big_endian_flag: u8,
    /// Flag indicating if the pixel format is true-colour (1) or colormapped (0).
    pub true_colour_flag: u8,
    /// Maximum red color value.
    pub red_max: u16,
    /// Maximum green color value.
    pub green_max: u16,
    /// Maximum blue color value.
    pub blue_max: u16,
    /// Number of shifts to apply to get the red color component.
    pub red_shift: u8,
    /// Number of shifts to apply to get the green color component.
    pub green_shift: u8,
    /// Number of shifts to apply to get the blue color component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Creates a standard 32-bit RGBA pixel format.
    #[must_use]
    pub fn rgba32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// Creates the `BGR0`-layout 32-bit pixel format (blue in byte 0).
    ///
    /// Many truecolor clients negotiate this format; it's the common case
    /// for the zero-copy fast path in [`crate::translate`].
    #[must_use]
    pub fn bgr0() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Checks if this `PixelFormat` is compatible with the standard 32-bit RGBA format.
    #[must_use]
    pub fn is_compatible_with_rgba32(&self) -> bool {
        *self == Self::rgba32()
    }

    /// Validates that this pixel format is supported by the server.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.bits_per_pixel != 8
            && self.bits_per_pixel != 16
            && self.bits_per_pixel != 24
            && self.bits_per_pixel != 32
        {
            return false;
        }

        if self.depth == 0 || self.depth > 32 {
            return false;
        }

        if self.true_colour_flag == 0 && self.bits_per_pixel != 8 {
            return false;
        }

        if self.true_colour_flag != 0 {
            #[allow(clippy::cast_possible_truncation)]
            let bits_needed = |max: u16| -> u8 {
                if max == 0 {
                    0
                } else {
                    (16 - max.leading_zeros()) as u8
                }
            };

            let red_bits = bits_needed(self.red_max);
            let green_bits = bits_needed(self.green_max);
            let blue_bits = bits_needed(self.blue_max);

            if red_bits + green_bits + blue_bits > self.depth {
                return false;
            }

            if self.red_shift >= 32 || self.green_shift >= 32 || self.blue_shift >= 32 {
                return false;
            }
        }

        true
    }

    /// Creates a 16-bit RGB565 pixel format.
    #[must_use]
    pub fn rgb565() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// Creates a 16-bit RGB555 pixel format.
    #[must_use]
    pub fn rgb555() -> Self {
        Self {
            bits_per_pixel: 16,
            depth: 15,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 31,
            blue_max: 31,
            red_shift: 10,
            green_shift: 5,
            blue_shift: 0,
        }
    }

    /// Creates an 8-bit BGR233 pixel format.
    #[must_use]
    pub fn bgr233() -> Self {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    /// Bytes per pixel implied by `bits_per_pixel`.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }

    /// Writes the pixel format data into a `BytesMut` buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Reads and deserializes a `PixelFormat` from a `BytesMut` buffer.
    ///
    /// # Errors
    ///
    /// Returns `Err` if fewer than 16 bytes remain in the buffer.
    pub fn from_bytes(buf: &mut BytesMut) -> io::Result<Self> {
        if buf.len() < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "not enough bytes for PixelFormat",
            ));
        }

        let pf = Self {
            bits_per_pixel: buf.get_u8(),
            depth: buf.get_u8(),
            big_endian_flag: buf.get_u8(),
            true_colour_flag: buf.get_u8(),
            red_max: buf.get_u16(),
            green_max: buf.get_u16(),
            blue_max: buf.get_u16(),
            red_shift: buf.get_u8(),
            green_shift: buf.get_u8(),
            blue_shift: buf.get_u8(),
        };
        buf.advance(3);
        Ok(pf)
    }
}

/// Represents the `ServerInit` message sent during VNC initialization.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The name of the desktop (e.g., "Android VNC Server").
    pub name: String,
}

impl ServerInit {
    /// Serializes the `ServerInit` message into a byte buffer.
    #[allow(clippy::cast_possible_truncation)] // desktop name length is bounded well under u32
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);

        let name_bytes = self.name.as_bytes();
        buf.put_u32(name_bytes.len() as u32);
        buf.put_slice(name_bytes);
    }
}

/// All client-to-server message types, parsed from the wire by [`parse_client_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Client requests a specific pixel format for framebuffer updates.
    SetPixelFormat(PixelFormat),

    /// Client specifies the list of encodings it supports, in preference order.
    SetEncodings(Vec<i32>),

    /// Client requests a framebuffer update for a specific region.
    FramebufferUpdateRequest {
        /// If true, only send changes since the last update; if false, send full refresh.
        incremental: bool,
        /// X coordinate of the requested region.
        x: u16,
        /// Y coordinate of the requested region.
        y: u16,
        /// Width of the requested region.
        width: u16,
        /// Height of the requested region.
        height: u16,
    },

    /// Client sends a keyboard key event.
    KeyEvent {
        /// True if the key is pressed, false if released.
        down: bool,
        /// The X Window System keysym value of the key.
        key: u32,
    },

    /// Client sends a pointer (mouse) event.
    PointerEvent {
        /// Bitmask of currently pressed mouse buttons.
        button_mask: u8,
        /// X coordinate of the pointer.
        x: u16,
        /// Y coordinate of the pointer.
        y: u16,
    },

    /// Client sends clipboard (cut text) data.
    ClientCutText(String),
}

/// Minimum bytes needed to know the fixed-size portion of a message of
/// type `msg_type`, not counting the leading type byte itself.
fn fixed_body_len(msg_type: u8) -> Option<usize> {
    match msg_type {
        CLIENT_MSG_SET_PIXEL_FORMAT => Some(3 + 16), // padding + PixelFormat
        CLIENT_MSG_SET_ENCODINGS => Some(1 + 2),     // padding + count
        CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => Some(9),
        CLIENT_MSG_KEY_EVENT => Some(7),
        CLIENT_MSG_POINTER_EVENT => Some(5),
        CLIENT_MSG_CLIENT_CUT_TEXT => Some(3 + 4), // padding + length
        _ => None,
    }
}

/// Attempts to parse one client message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` doesn't yet hold a complete message (the
/// caller should read more bytes from the socket and retry) without
/// consuming anything. On success, the consumed bytes are advanced out of
/// `buf`. `max_cut_text_bytes` bounds `ClientCutText` payload size, and
/// `max_set_encodings` bounds the `SetEncodings` count, matching
/// [`crate::config::Config::max_client_cut_text_bytes`] and
/// [`crate::config::Config::max_set_encodings`] respectively.
///
/// # Errors
///
/// Returns `Err` for an unrecognized message type, a cut-text length
/// exceeding `max_cut_text_bytes`, or a `SetEncodings` count exceeding
/// `max_set_encodings`.
pub fn parse_client_message(
    buf: &mut BytesMut,
    max_cut_text_bytes: usize,
    max_set_encodings: usize,
) -> crate::error::Result<Option<ClientMessage>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let msg_type = buf[0];

    let Some(min_body) = fixed_body_len(msg_type) else {
        return Err(VncError::Protocol(format!("unknown client message type {msg_type}")));
    };

    if buf.len() < 1 + min_body {
        return Ok(None);
    }

    match msg_type {
        CLIENT_MSG_SET_PIXEL_FORMAT => {
            let mut header = buf.split_to(1 + 3 + 16);
            header.advance(1 + 3);
            let pf = PixelFormat::from_bytes(&mut header)?;
            Ok(Some(ClientMessage::SetPixelFormat(pf)))
        }
        CLIENT_MSG_SET_ENCODINGS => {
            let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if count > max_set_encodings {
                return Err(VncError::Protocol(format!(
                    "SetEncodings count {count} exceeds limit {max_set_encodings}"
                )));
            }
            let total = 1 + 3 + count * 4;
            if buf.len() < total {
                return Ok(None);
            }
            let mut msg = buf.split_to(total);
            msg.advance(4);
            let mut encodings = Vec::with_capacity(count);
            for _ in 0..count {
                encodings.push(msg.get_i32());
            }
            Ok(Some(ClientMessage::SetEncodings(encodings)))
        }
        CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => {
            let mut msg = buf.split_to(1 + 9);
            msg.advance(1);
            let incremental = msg.get_u8() != 0;
            let x = msg.get_u16();
            let y = msg.get_u16();
            let width = msg.get_u16();
            let height = msg.get_u16();
            Ok(Some(ClientMessage::FramebufferUpdateRequest { incremental, x, y, width, height }))
        }
        CLIENT_MSG_KEY_EVENT => {
            let mut msg = buf.split_to(1 + 7);
            msg.advance(1);
            let down = msg.get_u8() != 0;
            msg.advance(2);
            let key = msg.get_u32();
            Ok(Some(ClientMessage::KeyEvent { down, key }))
        }
        CLIENT_MSG_POINTER_EVENT => {
            let mut msg = buf.split_to(1 + 5);
            msg.advance(1);
            let button_mask = msg.get_u8();
            let x = msg.get_u16();
            let y = msg.get_u16();
            Ok(Some(ClientMessage::PointerEvent { button_mask, x, y }))
        }
        CLIENT_MSG_CLIENT_CUT_TEXT => {
            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            if len > max_cut_text_bytes {
                return Err(VncError::Protocol(format!(
                    "ClientCutText length {len} exceeds limit {max_cut_text_bytes}"
                )));
            }
            let total = 1 + 7 + len;
            if buf.len() < total {
                return Ok(None);
            }
            let mut msg = buf.split_to(total);
            msg.advance(8);
            let text = String::from_utf8_lossy(&msg).into_owned();
            Ok(Some(ClientMessage::ClientCutText(text)))
        }
        _ => unreachable!("fixed_body_len only returns Some for recognized types"),
    }
}

/// Represents a rectangle header in a framebuffer update message.
#[derive(Debug)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding type used for this rectangle's pixel data.
    pub encoding: i32,
}

impl Rectangle {
    /// Writes the rectangle header to a byte buffer.
    pub fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_strings() {
        assert_eq!(RfbVersion::parse(b"RFB 003.008\n").unwrap(), RfbVersion::V3_8);
        assert_eq!(RfbVersion::parse(b"RFB 003.007\n").unwrap(), RfbVersion::V3_7);
        assert_eq!(RfbVersion::parse(b"RFB 003.003\n").unwrap(), RfbVersion::V3_3);
    }

    #[test]
    fn future_minor_version_negotiates_down_to_newest_supported() {
        assert_eq!(RfbVersion::parse(b"RFB 003.009\n").unwrap(), RfbVersion::V3_8);
    }

    #[test]
    fn future_major_version_negotiates_down_to_newest_supported() {
        assert_eq!(RfbVersion::parse(b"RFB 004.000\n").unwrap(), RfbVersion::V3_8);
    }

    #[test]
    fn malformed_version_line_is_a_protocol_error() {
        assert!(matches!(RfbVersion::parse(b"garbage!!!!\n"), Err(VncError::Protocol(_))));
        assert!(matches!(RfbVersion::parse(b"RFB 003.008"), Err(VncError::Protocol(_))));
        assert!(matches!(RfbVersion::parse(b"RFB 00a.008\n"), Err(VncError::Protocol(_))));
    }

    #[test]
    fn version_older_than_3_3_is_rejected() {
        assert!(matches!(RfbVersion::parse(b"RFB 003.002\n"), Err(VncError::Protocol(_))));
        assert!(matches!(RfbVersion::parse(b"RFB 002.009\n"), Err(VncError::Protocol(_))));
    }

    #[test]
    fn pixel_format_round_trips() {
        let pf = PixelFormat::rgba32();
        let mut buf = BytesMut::new();
        pf.write_to(&mut buf);
        assert_eq!(buf.len(), 16);
        let parsed = PixelFormat::from_bytes(&mut buf).unwrap();
        assert_eq!(parsed, pf);
    }

    #[test]
    fn set_pixel_format_needs_full_message_before_parsing() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[CLIENT_MSG_SET_PIXEL_FORMAT, 0, 0, 0]);
        assert!(parse_client_message(&mut buf, 1024, 1024).unwrap().is_none());
        assert_eq!(buf.len(), 4); // nothing consumed
    }

    #[test]
    fn parses_framebuffer_update_request() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, 1]);
        buf.extend_from_slice(&10u16.to_be_bytes());
        buf.extend_from_slice(&20u16.to_be_bytes());
        buf.extend_from_slice(&100u16.to_be_bytes());
        buf.extend_from_slice(&200u16.to_be_bytes());
        let msg = parse_client_message(&mut buf, 1024, 1024).unwrap().unwrap();
        assert_eq!(
            msg,
            ClientMessage::FramebufferUpdateRequest { incremental: true, x: 10, y: 20, width: 100, height: 200 }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_cut_text_over_limit() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[CLIENT_MSG_CLIENT_CUT_TEXT, 0, 0, 0]);
        buf.extend_from_slice(&1000u32.to_be_bytes());
        let err = parse_client_message(&mut buf, 100, 1024).unwrap_err();
        assert!(matches!(err, VncError::Protocol(_)));
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF, 0, 0, 0]);
        let err = parse_client_message(&mut buf, 1024, 1024).unwrap_err();
        assert!(matches!(err, VncError::Protocol(_)));
    }

    #[test]
    fn rejects_set_encodings_over_limit() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[CLIENT_MSG_SET_ENCODINGS, 0]);
        buf.extend_from_slice(&10u16.to_be_bytes());
        let err = parse_client_message(&mut buf, 1024, 4).unwrap_err();
        assert!(matches!(err, VncError::Protocol(_)));
    }

    #[test]
    fn set_encodings_within_limit_waits_for_full_payload() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[CLIENT_MSG_SET_ENCODINGS, 0]);
        buf.extend_from_slice(&2u16.to_be_bytes());
        // only the header has arrived so far, no encoding entries yet
        assert!(parse_client_message(&mut buf, 1024, 4).unwrap().is_none());
        assert_eq!(buf.len(), 4); // nothing consumed
    }
}
