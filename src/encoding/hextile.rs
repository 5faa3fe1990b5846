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

//! VNC Hextile encoding (RFC 6143 §7.7.3): the rectangle is split into
//! 16x16 tiles, each independently raw / solid / monochrome-with-subrects
//! / colored-with-subrects, with background/foreground pixels carried
//! forward between tiles when unchanged.

use super::common::{analyze_tile_colors, decode_pixels, extract_tile, find_subrects, write_pixel};
use super::Encoding;
use crate::protocol::{
    HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED, HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW,
    HEXTILE_SUBRECTS_COLOURED,
};
use bytes::{BufMut, BytesMut};

/// Implements VNC "Hextile" over pixels already in the client's
/// negotiated `bytes_per_pixel` width.
pub struct HextileEncoding;

impl Encoding for HextileEncoding {
    #[allow(clippy::similar_names)] // last_bg/last_fg are standard Hextile terminology
    #[allow(clippy::cast_possible_truncation)] // Hextile packs coordinates into a 4-bit nibble (tiles are <=16px)
    fn encode(&self, data: &[u8], width: u16, height: u16, bytes_per_pixel: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        let pixels = decode_pixels(data, bytes_per_pixel);

        let mut last_bg: Option<u32> = None;
        let mut last_fg: Option<u32> = None;

        for tile_y in (0..height).step_by(16) {
            for tile_x in (0..width).step_by(16) {
                let tile_w = std::cmp::min(16, width - tile_x);
                let tile_h = std::cmp::min(16, height - tile_y);

                let tile_pixels = extract_tile(&pixels, width as usize, tile_x as usize, tile_y as usize, tile_w as usize, tile_h as usize);
                let (is_solid, is_mono, bg, fg) = analyze_tile_colors(&tile_pixels);

                let mut subencoding: u8 = 0;
                let tile_start = buf.len();
                buf.put_u8(0); // reserved for subencoding byte

                if is_solid {
                    if Some(bg) != last_bg {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        write_pixel(&mut buf, bg, bytes_per_pixel);
                        last_bg = Some(bg);
                    }
                } else {
                    let subrects = find_subrects(&tile_pixels, tile_w as usize, tile_h as usize, bg);

                    let raw_size = tile_w as usize * tile_h as usize * bytes_per_pixel;
                    let bg_overhead = if Some(bg) == last_bg { 0 } else { bytes_per_pixel };
                    let fg_overhead = if is_mono && Some(fg) != last_fg { bytes_per_pixel } else { 0 };
                    let subrect_data = subrects.len() * if is_mono { 2 } else { bytes_per_pixel + 2 };
                    let encoded_size = bg_overhead + fg_overhead + 1 + subrect_data;

                    if subrects.is_empty() || subrects.len() > 255 || encoded_size > raw_size {
                        buf.truncate(tile_start);
                        buf.put_u8(HEXTILE_RAW);
                        for &pixel in &tile_pixels {
                            write_pixel(&mut buf, pixel, bytes_per_pixel);
                        }
                        last_bg = None;
                        last_fg = None;
                        continue;
                    }

                    if Some(bg) != last_bg {
                        subencoding |= HEXTILE_BACKGROUND_SPECIFIED;
                        write_pixel(&mut buf, bg, bytes_per_pixel);
                        last_bg = Some(bg);
                    }

                    subencoding |= HEXTILE_ANY_SUBRECTS;

                    if is_mono {
                        if Some(fg) != last_fg {
                            subencoding |= HEXTILE_FOREGROUND_SPECIFIED;
                            write_pixel(&mut buf, fg, bytes_per_pixel);
                            last_fg = Some(fg);
                        }

                        buf.put_u8(subrects.len() as u8);
                        for sr in subrects {
                            buf.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                            buf.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                        }
                    } else {
                        subencoding |= HEXTILE_SUBRECTS_COLOURED;
                        last_fg = None;

                        buf.put_u8(subrects.len() as u8);
                        for sr in subrects {
                            write_pixel(&mut buf, sr.color, bytes_per_pixel);
                            buf.put_u8(((sr.x as u8) << 4) | (sr.y as u8));
                            buf.put_u8((((sr.w - 1) as u8) << 4) | ((sr.h - 1) as u8));
                        }
                    }
                }

                buf[tile_start] = subencoding;
            }
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_tile_only_sets_background_once() {
        let data = vec![3u8; 16 * 16 * 4];
        let encoded = HextileEncoding.encode(&data, 16, 16, 4);
        assert_eq!(encoded[0], HEXTILE_BACKGROUND_SPECIFIED);
    }

    #[test]
    fn works_at_two_bytes_per_pixel() {
        let data = vec![0xAB, 0xCD].repeat(16 * 16);
        let encoded = HextileEncoding.encode(&data, 16, 16, 2);
        assert_eq!(encoded[0], HEXTILE_BACKGROUND_SPECIFIED);
        assert_eq!(&encoded[1..3], &[0xAB, 0xCD]);
    }

    #[test]
    fn multi_tile_rectangle_emits_one_header_per_tile() {
        let data = vec![0u8; 32 * 16 * 4];
        let encoded = HextileEncoding.encode(&data, 32, 16, 4);
        // Two 16x16 tiles, each solid: subencoding byte + bg pixel once each
        // (first tile sets bg, second tile's bg is unchanged so it's just the byte).
        assert_eq!(encoded.len(), 1 + 4 + 1);
    }
}
