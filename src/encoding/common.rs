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

//! Helpers shared across the stateless, `bytes_per_pixel`-generic encoders
//! (Raw, RRE, Hextile). Pixels are treated as opaque little-endian words
//! of `bytes_per_pixel` bytes — background/subrect/tile analysis never
//! needs to know what the bytes actually mean, only whether two pixels
//! are equal.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// A subrectangle of one color, as found by [`find_subrects`].
#[derive(Debug)]
pub struct Subrect {
    /// The pixel value of this subrectangle, as decoded by [`read_pixel`].
    pub color: u32,
    /// X coordinate of the subrectangle's top-left corner.
    pub x: u16,
    /// Y coordinate of the subrectangle's top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub w: u16,
    /// Height in pixels.
    pub h: u16,
}

/// Decodes one pixel (`bytes_per_pixel` bytes, little-endian, zero-extended
/// to `u32`) so equality comparisons and palette lookups work uniformly
/// regardless of the client's negotiated pixel width.
#[inline]
#[must_use]
pub fn read_pixel(chunk: &[u8]) -> u32 {
    let mut value = 0u32;
    for (i, &b) in chunk.iter().enumerate().take(4) {
        value |= u32::from(b) << (8 * i);
    }
    value
}

/// Writes a pixel value produced by [`read_pixel`] back out in the same
/// little-endian, `bytes_per_pixel`-wide layout.
pub fn write_pixel(buf: &mut BytesMut, pixel: u32, bytes_per_pixel: usize) {
    for i in 0..bytes_per_pixel.min(4) {
        buf.put_u8(((pixel >> (8 * i)) & 0xFF) as u8);
    }
}

/// Writes a pixel as 24-bit RGB (3 bytes): Tight's TPIXEL representation
/// for the common 32bpp/depth-24 true-color case, where the padding byte
/// is simply never sent.
pub fn put_pixel24(buf: &mut BytesMut, pixel: u32) {
    write_pixel(buf, pixel, 3);
}

/// Decodes a `bytes_per_pixel`-wide pixel buffer into per-pixel values.
#[must_use]
pub fn decode_pixels(data: &[u8], bytes_per_pixel: usize) -> Vec<u32> {
    data.chunks_exact(bytes_per_pixel).map(read_pixel).collect()
}

/// Finds the most common color in the pixel array.
#[must_use]
pub fn get_background_color(pixels: &[u32]) -> u32 {
    if pixels.is_empty() {
        return 0;
    }

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *counts.entry(pixel).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(color, _)| color)
        .unwrap_or(pixels[0])
}

/// Finds maximal same-color subrectangles of non-background pixels,
/// choosing the larger of a horizontal-first or vertical-first growth at
/// each unclaimed pixel.
#[must_use]
pub fn find_subrects(pixels: &[u32], width: usize, height: usize, bg_color: u32) -> Vec<Subrect> {
    let mut subrects = Vec::new();
    let mut marked = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if marked[idx] || pixels[idx] == bg_color {
                continue;
            }

            let color = pixels[idx];

            let mut max_w = 0;
            for test_x in x..width {
                let test_idx = y * width + test_x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_w = test_x - x + 1;
            }

            let mut h = 1;
            'outer: for test_y in (y + 1)..height {
                for test_x in x..(x + max_w) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'outer;
                    }
                }
                h = test_y - y + 1;
            }

            let mut best_w = max_w;
            let mut best_h = h;

            let mut max_h = 0;
            for test_y in y..height {
                let test_idx = test_y * width + x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_h = test_y - y + 1;
            }

            let mut w2 = 1;
            'outer2: for test_x in (x + 1)..width {
                for test_y in y..(y + max_h) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'outer2;
                    }
                }
                w2 = test_x - x + 1;
            }

            if w2 * max_h > best_w * best_h {
                best_w = w2;
                best_h = max_h;
            }

            for dy in 0..best_h {
                for dx in 0..best_w {
                    marked[(y + dy) * width + (x + dx)] = true;
                }
            }

            subrects.push(Subrect { color, x: x as u16, y: y as u16, w: best_w as u16, h: best_h as u16 });
        }
    }

    subrects
}

/// Extracts a `tw`x`th` tile at `(x, y)` from a decoded pixel array.
#[must_use]
pub fn extract_tile(pixels: &[u32], width: usize, x: usize, y: usize, tw: usize, th: usize) -> Vec<u32> {
    let mut tile = Vec::with_capacity(tw * th);
    for dy in 0..th {
        for dx in 0..tw {
            tile.push(pixels[(y + dy) * width + (x + dx)]);
        }
    }
    tile
}

/// Classifies a tile as solid, monochrome, or multicolor: `(is_solid,
/// is_mono, bg_color, fg_color)`. `fg_color` is meaningless unless
/// `is_mono` and not `is_solid`.
#[must_use]
pub fn analyze_tile_colors(pixels: &[u32]) -> (bool, bool, u32, u32) {
    if pixels.is_empty() {
        return (true, true, 0, 0);
    }

    let mut colors: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *colors.entry(pixel).or_insert(0) += 1;
    }

    if colors.len() == 1 {
        return (true, true, pixels[0], 0);
    }

    if colors.len() == 2 {
        let mut sorted: Vec<_> = colors.into_iter().collect();
        sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
        return (false, true, sorted[0].0, sorted[1].0);
    }

    let bg = get_background_color(pixels);
    (false, false, bg, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_pixel_round_trips_at_every_width() {
        for bpp in [1, 2, 3, 4] {
            let mut buf = BytesMut::new();
            write_pixel(&mut buf, 0x0011_2233, bpp);
            assert_eq!(buf.len(), bpp);
            let decoded = read_pixel(&buf);
            let mask = if bpp >= 4 { u32::MAX } else { (1u32 << (8 * bpp)) - 1 };
            assert_eq!(decoded, 0x0011_2233 & mask);
        }
    }

    #[test]
    fn background_color_is_the_most_frequent() {
        let pixels = [1u32, 1, 2, 1, 3];
        assert_eq!(get_background_color(&pixels), 1);
    }

    #[test]
    fn solid_tile_is_detected() {
        let pixels = [7u32; 16];
        assert_eq!(analyze_tile_colors(&pixels), (true, true, 7, 0));
    }

    #[test]
    fn find_subrects_covers_every_foreground_pixel() {
        let pixels = [0u32, 0, 1, 1, 0, 0, 1, 1];
        let subrects = find_subrects(&pixels, 4, 2, 0);
        let covered: usize = subrects.iter().map(|s| s.w as usize * s.h as usize).sum();
        assert_eq!(covered, 4);
    }
}
