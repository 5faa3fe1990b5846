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

//! Encoder family (RFB 0/1/2/5/16/7): each encoding converts one dirty
//! rectangle's pixels into its wire body.
//!
//! Stateless encoders (Raw, RRE, Hextile) implement [`Encoding`]
//! uniformly over `bytes_per_pixel`, via [`get_encoder`]. CopyRect, ZRLE,
//! and Tight aren't reachable through that trait: CopyRect carries no
//! pixel payload at all (see [`copyrect::detect_shift`]), and ZRLE/Tight
//! carry zlib state across rectangles for the life of a connection (see
//! [`zrle::encode_zrle_persistent`]/[`tight::encode_tight_persistent`]),
//! so the session loop calls those directly instead.

pub mod common;
pub mod copyrect;
pub mod hextile;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod zrle;

use crate::protocol::{ENCODING_HEXTILE, ENCODING_RAW, ENCODING_RRE};
use bytes::BytesMut;

/// Converts one rectangle's pixel bytes (already in the client's
/// negotiated format) into this encoding's wire body.
pub trait Encoding: Send + Sync {
    /// Encodes `pixels` (`width * height * bytes_per_pixel` bytes,
    /// row-major, no row padding) into this encoding's wire body; the
    /// caller writes the rectangle header and encoding-type tag.
    fn encode(&self, pixels: &[u8], width: u16, height: u16, bytes_per_pixel: usize) -> BytesMut;
}

/// Returns the stateless encoder for `encoding_type`, or `None` for
/// CopyRect/ZRLE/Tight (which need more state than this trait carries)
/// or an unrecognized type.
#[must_use]
pub fn get_encoder(encoding_type: i32) -> Option<Box<dyn Encoding>> {
    match encoding_type {
        ENCODING_RAW => Some(Box::new(raw::RawEncoding)),
        ENCODING_RRE => Some(Box::new(rre::RreEncoding)),
        ENCODING_HEXTILE => Some(Box::new(hextile::HextileEncoding)),
        _ => None,
    }
}

/// Content hint guiding [`EncoderManager::select`]'s preference order,
/// derived from recent change-detection history (see the session loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentHint {
    /// Mostly-unchanging desktop (idle editor, dialog sitting open).
    Static,
    /// General mixed content with no strong signal either way.
    Dynamic,
    /// Large-area scrolling (terminal scrollback, document, web page).
    Scrolling,
    /// High-bandwidth, low-latency peer (loopback or LAN).
    Lan,
    /// No history yet — the first few updates of a session.
    Default,
}

/// Picks one server-supported encoding type the client also advertised
/// via `SetEncodings`, from a fixed preference list per content hint.
pub struct EncoderManager;

impl EncoderManager {
    /// Returns the first entry of `hint`'s preference list present in
    /// `client_encodings`, or [`ENCODING_RAW`] if none matched (every RFB
    /// client is required to support Raw).
    #[must_use]
    pub fn select(client_encodings: &[i32], hint: ContentHint) -> i32 {
        Self::preference_list(hint)
            .iter()
            .copied()
            .find(|candidate| client_encodings.contains(candidate))
            .unwrap_or(ENCODING_RAW)
    }

    /// Preference lists per §4.5: note `Tight` (7) deliberately never
    /// appears here — the spec's content-hint lists enumerate only
    /// `{ZRLE, Hextile, RRE, CopyRect, Raw}`; a client that advertises
    /// Tight only gets it via a hint this table doesn't cover.
    fn preference_list(hint: ContentHint) -> &'static [i32] {
        use crate::protocol::{ENCODING_COPYRECT, ENCODING_ZRLE};

        match hint {
            ContentHint::Static => &[ENCODING_ZRLE, ENCODING_HEXTILE, ENCODING_RRE, ENCODING_RAW],
            ContentHint::Dynamic => &[ENCODING_HEXTILE, ENCODING_RRE, ENCODING_RAW, ENCODING_ZRLE],
            ContentHint::Scrolling => {
                &[ENCODING_COPYRECT, ENCODING_HEXTILE, ENCODING_RRE, ENCODING_ZRLE, ENCODING_RAW]
            }
            ContentHint::Lan => &[ENCODING_RAW, ENCODING_HEXTILE, ENCODING_RRE, ENCODING_ZRLE],
            ContentHint::Default => {
                &[ENCODING_ZRLE, ENCODING_HEXTILE, ENCODING_RRE, ENCODING_COPYRECT, ENCODING_RAW]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ENCODING_COPYRECT, ENCODING_TIGHT, ENCODING_ZRLE};

    #[test]
    fn falls_back_to_raw_when_nothing_else_advertised() {
        assert_eq!(EncoderManager::select(&[], ContentHint::Default), ENCODING_RAW);
    }

    #[test]
    fn scrolling_prefers_copyrect() {
        let client = vec![ENCODING_RAW, ENCODING_ZRLE, ENCODING_COPYRECT];
        assert_eq!(EncoderManager::select(&client, ContentHint::Scrolling), ENCODING_COPYRECT);
    }

    #[test]
    fn lan_prefers_raw_over_tight() {
        let client = vec![ENCODING_TIGHT, ENCODING_RAW];
        assert_eq!(EncoderManager::select(&client, ContentHint::Lan), ENCODING_RAW);
    }

    #[test]
    fn falls_back_through_list_to_first_supported() {
        let client = vec![ENCODING_HEXTILE];
        assert_eq!(EncoderManager::select(&client, ContentHint::Static), ENCODING_HEXTILE);
    }

    #[test]
    fn get_encoder_has_no_stateful_variants() {
        assert!(get_encoder(ENCODING_ZRLE).is_none());
        assert!(get_encoder(ENCODING_TIGHT).is_none());
        assert!(get_encoder(ENCODING_COPYRECT).is_none());
    }
}
