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

//! Pixel format translation between server and client formats.
//!
//! The framebuffer always stores pixels in the server's native 32bpp RGBA
//! layout. This module converts that into whatever format a client
//! negotiated via `SetPixelFormat`, picking the cheapest applicable path:
//!
//! - **BGR0 identity**: client format matches the server's native layout
//!   byte-for-byte — no copy-free path exists across an owned buffer, but no
//!   per-pixel math is needed either, just a bulk copy.
//! - **RGB0 swap**: client wants red/blue swapped relative to the server's
//!   layout — a per-pixel byte swap, no scaling.
//! - **16bpp scale+pack**: client wants a narrower truecolor format (e.g.
//!   RGB565) — component values are scaled through a cached lookup table.
//! - **8bpp LUT**: client wants an 8-bit palette-free truecolor format (e.g.
//!   BGR233) — same cached-table approach, narrower still.
//! - **Generic fallback**: anything else (unusual shifts, color-mapped
//!   formats) falls back to the fully general per-pixel extract/pack path.

use crate::protocol::PixelFormat;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-component scale-up lookup table: maps an 8-bit channel value (0-255)
/// to the client format's native range (0..=max).
struct ComponentLut {
    red: [u16; 256],
    green: [u16; 256],
    blue: [u16; 256],
}

impl ComponentLut {
    fn build(red_max: u16, green_max: u16, blue_max: u16) -> Self {
        let mut lut = ComponentLut { red: [0; 256], green: [0; 256], blue: [0; 256] };
        for v in 0..=255u16 {
            lut.red[v as usize] = downscale_component(v as u8, red_max);
            lut.green[v as usize] = downscale_component(v as u8, green_max);
            lut.blue[v as usize] = downscale_component(v as u8, blue_max);
        }
        lut
    }
}

/// Key identifying a client pixel format's scaling behavior: the triple of
/// max component values plus the shifts that place them in the word.
type LutKey = (u16, u16, u16, u8, u8, u8);

/// Caches per-client-format scale-up tables so repeated frames to the same
/// client don't rebuild them. Own one of these per session (or per server,
/// if most clients share a format); it is not a process-wide singleton.
#[derive(Default)]
pub struct TranslationCache {
    luts: Mutex<HashMap<LutKey, Arc<ComponentLut>>>,
}

impl TranslationCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lut_for(&self, format: &PixelFormat) -> Arc<ComponentLut> {
        let key: LutKey = (
            format.red_max,
            format.green_max,
            format.blue_max,
            format.red_shift,
            format.green_shift,
            format.blue_shift,
        );
        let mut luts = self.luts.lock().expect("translation cache mutex poisoned");
        luts.entry(key)
            .or_insert_with(|| {
                Arc::new(ComponentLut::build(format.red_max, format.green_max, format.blue_max))
            })
            .clone()
    }

    /// Translates `src` (RGBA32 pixel data matching `server_format`) into
    /// `client_format`, picking the cheapest applicable path.
    ///
    /// # Panics
    ///
    /// Panics if `src.len()` is not a multiple of 4 (the server framebuffer
    /// is always 32bpp).
    pub fn translate(
        &self,
        src: &[u8],
        server_format: &PixelFormat,
        client_format: &PixelFormat,
    ) -> BytesMut {
        assert_eq!(src.len() % 4, 0, "source data must be RGBA32 (4 bytes per pixel)");

        if pixel_formats_equal(server_format, client_format) {
            return BytesMut::from(src); // BGR0/identity fast path
        }

        if client_format.bits_per_pixel == 32
            && client_format.true_colour_flag != 0
            && client_format.red_max == 255
            && client_format.green_max == 255
            && client_format.blue_max == 255
            && client_format.big_endian_flag == server_format.big_endian_flag
            && is_channel_permutation(server_format, client_format)
        {
            return swap_channels_32(src, server_format, client_format); // RGB0 swap
        }

        match client_format.bits_per_pixel {
            16 | 8 if client_format.true_colour_flag != 0 => {
                self.scale_and_pack(src, server_format, client_format)
            }
            _ => generic_translate(src, server_format, client_format),
        }
    }

    fn scale_and_pack(
        &self,
        src: &[u8],
        server_format: &PixelFormat,
        client_format: &PixelFormat,
    ) -> BytesMut {
        let lut = self.lut_for(client_format);
        let pixel_count = src.len() / 4;
        let bpp = client_format.bytes_per_pixel();
        let mut dst = BytesMut::with_capacity(pixel_count * bpp);

        for chunk in src.chunks_exact(4) {
            let (r, g, b) = extract_rgb(chunk, server_format);
            let pixel_value = (u32::from(lut.red[r as usize]) << client_format.red_shift)
                | (u32::from(lut.green[g as usize]) << client_format.green_shift)
                | (u32::from(lut.blue[b as usize]) << client_format.blue_shift);

            if client_format.bits_per_pixel == 16 {
                let bytes = if client_format.big_endian_flag != 0 {
                    (pixel_value as u16).to_be_bytes()
                } else {
                    (pixel_value as u16).to_le_bytes()
                };
                dst.extend_from_slice(&bytes);
            } else {
                dst.extend_from_slice(&[pixel_value as u8]);
            }
        }

        dst
    }
}

/// True when `a` and `b` describe the same 32bpp truecolor word with
/// shifts that are a permutation of each other (a byte-level RGB swap) —
/// the case the RGB0/BGR0 swap path handles without any scaling math.
fn is_channel_permutation(a: &PixelFormat, b: &PixelFormat) -> bool {
    let mut a_shifts = [a.red_shift, a.green_shift, a.blue_shift];
    let mut b_shifts = [b.red_shift, b.green_shift, b.blue_shift];
    a_shifts.sort_unstable();
    b_shifts.sort_unstable();
    a_shifts == b_shifts && a_shifts == [0, 8, 16]
}

fn swap_channels_32(src: &[u8], server_format: &PixelFormat, client_format: &PixelFormat) -> BytesMut {
    let mut dst = BytesMut::with_capacity(src.len());
    for chunk in src.chunks_exact(4) {
        let (r, g, b) = extract_rgb(chunk, server_format);
        let pixel_value = (u32::from(r) << client_format.red_shift)
            | (u32::from(g) << client_format.green_shift)
            | (u32::from(b) << client_format.blue_shift);
        let bytes = if client_format.big_endian_flag != 0 {
            pixel_value.to_be_bytes()
        } else {
            pixel_value.to_le_bytes()
        };
        dst.extend_from_slice(&bytes);
    }
    dst
}

/// Fully general per-pixel extract/pack path for formats the named fast
/// paths don't cover (24bpp, color-mapped, unusual shift combinations).
fn generic_translate(src: &[u8], server_format: &PixelFormat, client_format: &PixelFormat) -> BytesMut {
    let pixel_count = src.len() / 4;
    let bytes_per_pixel = client_format.bytes_per_pixel();
    let mut dst = BytesMut::with_capacity(pixel_count * bytes_per_pixel);

    for chunk in src.chunks_exact(4) {
        let (r, g, b) = extract_rgb(chunk, server_format);
        pack_pixel(&mut dst, r, g, b, client_format);
    }

    dst
}

fn extract_rgb(pixel: &[u8], format: &PixelFormat) -> (u8, u8, u8) {
    let pixel_value = match format.bits_per_pixel {
        8 => u32::from(pixel[0]),
        16 => {
            if format.big_endian_flag != 0 {
                u32::from(u16::from_be_bytes([pixel[0], pixel[1]]))
            } else {
                u32::from(u16::from_le_bytes([pixel[0], pixel[1]]))
            }
        }
        32 => {
            if format.big_endian_flag != 0 {
                u32::from_be_bytes([pixel[0], pixel[1], pixel[2], pixel[3]])
            } else {
                u32::from_le_bytes([pixel[0], pixel[1], pixel[2], pixel[3]])
            }
        }
        24 => {
            if format.big_endian_flag != 0 {
                (u32::from(pixel[0]) << 16) | (u32::from(pixel[1]) << 8) | u32::from(pixel[2])
            } else {
                (u32::from(pixel[2]) << 16) | (u32::from(pixel[1]) << 8) | u32::from(pixel[0])
            }
        }
        _ => u32::from(pixel[0]),
    };

    let r_raw = (pixel_value >> format.red_shift) & u32::from(format.red_max);
    let g_raw = (pixel_value >> format.green_shift) & u32::from(format.green_max);
    let b_raw = (pixel_value >> format.blue_shift) & u32::from(format.blue_max);

    (
        scale_component(r_raw, format.red_max),
        scale_component(g_raw, format.green_max),
        scale_component(b_raw, format.blue_max),
    )
}

fn pack_pixel(dst: &mut BytesMut, r: u8, g: u8, b: u8, format: &PixelFormat) {
    let r_scaled = downscale_component(r, format.red_max);
    let g_scaled = downscale_component(g, format.green_max);
    let b_scaled = downscale_component(b, format.blue_max);

    let pixel_value = (u32::from(r_scaled) << format.red_shift)
        | (u32::from(g_scaled) << format.green_shift)
        | (u32::from(b_scaled) << format.blue_shift);

    match format.bits_per_pixel {
        8 => dst.extend_from_slice(&[pixel_value as u8]),
        16 => {
            let bytes = if format.big_endian_flag != 0 {
                (pixel_value as u16).to_be_bytes()
            } else {
                (pixel_value as u16).to_le_bytes()
            };
            dst.extend_from_slice(&bytes);
        }
        24 => {
            let bytes = if format.big_endian_flag != 0 {
                [(pixel_value >> 16) as u8, (pixel_value >> 8) as u8, pixel_value as u8]
            } else {
                [pixel_value as u8, (pixel_value >> 8) as u8, (pixel_value >> 16) as u8]
            };
            dst.extend_from_slice(&bytes);
        }
        32 => {
            let bytes = if format.big_endian_flag != 0 {
                pixel_value.to_be_bytes()
            } else {
                pixel_value.to_le_bytes()
            };
            dst.extend_from_slice(&bytes);
        }
        _ => dst.extend_from_slice(&[pixel_value as u8]),
    }
}

#[inline]
fn scale_component(value: u32, max: u16) -> u8 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return value as u8;
    }
    ((u64::from(value) * 255) / u64::from(max)) as u8
}

#[inline]
fn downscale_component(value: u8, max: u16) -> u16 {
    if max == 0 {
        return 0;
    }
    if max == 255 {
        return u16::from(value);
    }
    ((u32::from(value) * u32::from(max)) / 255) as u16
}

fn pixel_formats_equal(a: &PixelFormat, b: &PixelFormat) -> bool {
    a.bits_per_pixel == b.bits_per_pixel
        && a.depth == b.depth
        && (a.big_endian_flag == b.big_endian_flag || a.bits_per_pixel == 8)
        && a.true_colour_flag == b.true_colour_flag
        && (a.true_colour_flag == 0
            || (a.red_max == b.red_max
                && a.green_max == b.green_max
                && a.blue_max == b.blue_max
                && a.red_shift == b.red_shift
                && a.green_shift == b.green_shift
                && a.blue_shift == b.blue_shift))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_path_is_a_bulk_copy() {
        let format = PixelFormat::rgba32();
        let cache = TranslationCache::new();
        let src = vec![255u8, 0, 0, 0, 0, 255, 0, 0];
        let dst = cache.translate(&src, &format, &format);
        assert_eq!(&src[..], &dst[..]);
    }

    #[test]
    fn rgb0_swap_path_exchanges_red_and_blue_bytes() {
        let server_format = PixelFormat::bgr0(); // red_shift 16, blue_shift 0
        let client_format = PixelFormat::rgba32(); // red_shift 0, blue_shift 16
        let cache = TranslationCache::new();

        // BGR0 word for pure red (R=255): byte0=blue=0, byte1=green=0, byte2=red=255
        let src = vec![0u8, 0, 255, 0];
        let dst = cache.translate(&src, &server_format, &client_format);
        // RGB0 word for pure red: byte0=red=255
        assert_eq!(&dst[..], &[255, 0, 0, 0]);
    }

    #[test]
    fn scales_rgba32_to_rgb565() {
        let server_format = PixelFormat::rgba32();
        let client_format = PixelFormat::rgb565();
        let cache = TranslationCache::new();

        let src = vec![255u8, 0, 0, 0]; // pure red
        let dst = cache.translate(&src, &server_format, &client_format);

        assert_eq!(dst.len(), 2);
        let value = u16::from_le_bytes([dst[0], dst[1]]);
        assert_eq!(value, 0xF800);
    }

    #[test]
    fn lut_is_reused_across_calls_for_the_same_format() {
        let cache = TranslationCache::new();
        let client_format = PixelFormat::rgb565();
        let lut_a = cache.lut_for(&client_format);
        let lut_b = cache.lut_for(&client_format);
        assert!(Arc::ptr_eq(&lut_a, &lut_b));
    }

    #[test]
    fn scale_component_matches_expected_rounding() {
        assert_eq!(scale_component(0, 31), 0);
        assert_eq!(scale_component(31, 31), 255);
        assert_eq!(scale_component(15, 31), 123);
        assert_eq!(scale_component(128, 255), 128);
    }

    #[test]
    fn downscale_component_matches_expected_rounding() {
        assert_eq!(downscale_component(0, 31), 0);
        assert_eq!(downscale_component(255, 31), 31);
        assert_eq!(downscale_component(128, 31), 15);
        assert_eq!(downscale_component(128, 255), 128);
    }
}
