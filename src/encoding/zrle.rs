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

//! ZRLE (Zlib Run-Length Encoding, RFC 6143 §7.7.5) for VNC.
//!
//! The rectangle is tiled 64x64, each tile picked among Raw / Solid /
//! Packed-Palette / Packed-Palette-RLE / Plain-RLE by an estimated-size
//! comparison, and the concatenated tile stream is compressed through one
//! persistent zlib stream shared across rectangles for the connection's
//! lifetime (sync-flushed per rectangle so the client's decompressor
//! carries state forward, per RFC 6143's single-stream requirement).
//!
//! Pixels are written as CPIXEL: 3 bytes (R, G, B) when the client's
//! format is 32bpp/depth-24 true-color, else the full `bytes_per_pixel`
//! width, matching RFC 6143 §7.6.6.

use bytes::{BufMut, BytesMut};
use flate2::{Compress, FlushCompress, Status};
use std::collections::HashMap;

use crate::protocol::PixelFormat;

const TILE_SIZE: usize = 64;

/// CPIXEL width for `format`: 3 bytes for the common 32bpp/depth-24
/// true-color case (the padding byte is never sent), else the full pixel.
fn cpixel_size(format: &PixelFormat) -> usize {
    if format.bits_per_pixel == 32 && format.depth == 24 {
        3
    } else {
        format.bytes_per_pixel()
    }
}

fn read_pixel(chunk: &[u8]) -> u32 {
    let mut value = 0u32;
    for (i, &b) in chunk.iter().enumerate().take(4) {
        value |= u32::from(b) << (8 * i);
    }
    value
}

fn write_cpixel(buf: &mut BytesMut, pixel: u32, cpixel_bytes: usize) {
    for i in 0..cpixel_bytes {
        buf.put_u8(((pixel >> (8 * i)) & 0xFF) as u8);
    }
}

/// Analyzes pixel data to count RLE runs, single pixels, and unique colors.
fn analyze_runs_and_palette(pixels: &[u32]) -> (usize, usize, HashMap<u32, usize>) {
    let mut runs = 0;
    let mut single_pixels = 0;
    let mut unique_colors: HashMap<u32, usize> = HashMap::new();

    if pixels.is_empty() {
        return (0, 0, unique_colors);
    }

    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        *unique_colors.entry(color).or_insert(0) += 1;

        let mut run_len = 1;
        while i + run_len < pixels.len() && pixels[i + run_len] == color {
            run_len += 1;
        }

        if run_len == 1 {
            single_pixels += 1;
        } else {
            runs += 1;
        }
        i += run_len;
    }
    (runs, single_pixels, unique_colors)
}

/// Encodes one rectangle as ZRLE, compressing the tile stream through
/// `compressor` so the client's matching decompressor stays in sync
/// across calls. `format` is the client's negotiated pixel format; the
/// caller is expected to have already translated `data` into it.
///
/// # Errors
///
/// Returns an I/O error if the zlib stream reports a buffer error.
pub fn encode_zrle_persistent(
    data: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
    compressor: &mut Compress,
) -> std::io::Result<Vec<u8>> {
    let bpp = format.bytes_per_pixel();
    let cpixel = cpixel_size(format);
    let width = width as usize;
    let height = height as usize;
    let mut uncompressed_data = BytesMut::new();

    for y in (0..height).step_by(TILE_SIZE) {
        for x in (0..width).step_by(TILE_SIZE) {
            let tile_w = (width - x).min(TILE_SIZE);
            let tile_h = (height - y).min(TILE_SIZE);
            let tile_data = extract_tile(data, width, x, y, tile_w, tile_h, bpp);
            encode_tile(&mut uncompressed_data, &tile_data, tile_w, tile_h, bpp, cpixel);
        }
    }

    let input = &uncompressed_data[..];
    let compressed = compress_persistent(compressor, input)?;

    let mut result = BytesMut::with_capacity(4 + compressed.len());
    result.put_u32(compressed.len() as u32);
    result.extend_from_slice(&compressed);

    log::info!(
        "ZRLE: compressed {}->{} bytes ({width}x{height} tiles)",
        uncompressed_data.len(),
        compressed.len()
    );

    Ok(result.to_vec())
}

/// Runs `data` through `stream` with a sync-flush, leaving the stream
/// open so the client's decompressor carries state into the next call.
fn compress_persistent(stream: &mut Compress, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut chunk = vec![0u8; 65536];
    let before_in = stream.total_in();
    let before_out = stream.total_out();
    let mut input_pos = 0usize;

    loop {
        let status = stream.compress(&data[input_pos..], &mut chunk, FlushCompress::Sync)?;
        let consumed = (stream.total_in() - before_in) as usize - input_pos;
        let produced_so_far = output.len() as u64;
        let produced = (stream.total_out() - before_out) - produced_so_far;
        if produced > 0 {
            output.extend_from_slice(&chunk[..produced as usize]);
        }
        input_pos += consumed;

        match status {
            Status::StreamEnd => break,
            Status::BufError => {
                return Err(std::io::Error::other("zrle zlib stream buffer error"));
            }
            Status::Ok if input_pos >= data.len() => break,
            Status::Ok => {}
        }
    }

    Ok(output)
}

/// Encodes a single tile, choosing the best sub-encoding.
fn encode_tile(buf: &mut BytesMut, tile_data: &[u8], width: usize, height: usize, bpp: usize, cpixel: usize) {
    let pixels: Vec<u32> = tile_data.chunks_exact(bpp).map(read_pixel).collect();
    let (runs, single_pixels, unique_colors) = analyze_runs_and_palette(&pixels);

    if unique_colors.len() == 1 {
        encode_solid_color_tile(buf, pixels[0], cpixel);
        return;
    }

    let mut use_rle = false;
    let mut use_palette = false;

    let mut estimated_bytes = width * height * cpixel;
    let plain_rle_bytes = (cpixel + 1) * (runs + single_pixels);

    if plain_rle_bytes < estimated_bytes {
        use_rle = true;
        estimated_bytes = plain_rle_bytes;
    }

    if unique_colors.len() < 128 {
        let palette: Vec<_> = unique_colors.keys().copied().collect();
        let palette_size = palette.len();

        let palette_rle_bytes = cpixel * palette_size + 2 * runs + single_pixels;
        if palette_rle_bytes < estimated_bytes {
            use_rle = true;
            use_palette = true;
            estimated_bytes = palette_rle_bytes;
        }

        if palette_size < 17 {
            let bits_per_packed_pixel = match palette_size {
                2 => 1,
                3..=4 => 2,
                _ => 4,
            };
            let packed_bytes = cpixel * palette_size + (width * height * bits_per_packed_pixel).div_ceil(8);
            if packed_bytes < estimated_bytes {
                use_rle = false;
                use_palette = true;
            }
        }
    }

    if !use_palette {
        if use_rle {
            buf.put_u8(128);
            encode_rle(buf, &pixels, cpixel);
        } else {
            encode_raw_tile(buf, &pixels, cpixel);
        }
    } else {
        let palette: Vec<_> = unique_colors.keys().copied().collect();
        let color_to_idx: HashMap<_, _> = palette.iter().enumerate().map(|(i, &c)| (c, i as u8)).collect();

        if use_rle {
            encode_packed_palette_rle_tile(buf, &pixels, &palette, &color_to_idx, cpixel);
        } else {
            encode_packed_palette_tile(buf, &pixels, &unique_colors, cpixel);
        }
    }
}

fn extract_tile(full_frame: &[u8], frame_width: usize, x: usize, y: usize, width: usize, height: usize, bpp: usize) -> Vec<u8> {
    let mut tile_data = Vec::with_capacity(width * height * bpp);
    for row in 0..height {
        let start = ((y + row) * frame_width + x) * bpp;
        let end = start + width * bpp;
        tile_data.extend_from_slice(&full_frame[start..end]);
    }
    tile_data
}

fn encode_solid_color_tile(buf: &mut BytesMut, color: u32, cpixel: usize) {
    buf.put_u8(1); // Solid color sub-encoding
    write_cpixel(buf, color, cpixel);
}

fn encode_raw_tile(buf: &mut BytesMut, pixels: &[u32], cpixel: usize) {
    buf.put_u8(0); // Raw sub-encoding
    for &pixel in pixels {
        write_cpixel(buf, pixel, cpixel);
    }
}

fn encode_packed_palette_tile(buf: &mut BytesMut, pixels: &[u32], unique_colors: &HashMap<u32, usize>, cpixel: usize) {
    let palette: Vec<_> = unique_colors.keys().copied().collect();
    let palette_size = palette.len();
    let bits_per_pixel = match palette_size {
        2 => 1,
        3..=4 => 2,
        _ => 4,
    };

    buf.put_u8(palette_size as u8); // Packed palette sub-encoding

    for &color in &palette {
        write_cpixel(buf, color, cpixel);
    }

    let mut packed_byte = 0u8;
    let mut bit_pos = 0u8;
    let color_to_idx: HashMap<_, _> = palette.iter().enumerate().map(|(i, &c)| (c, i)).collect();

    for &pixel in pixels {
        let idx = color_to_idx[&pixel] as u8;
        let shift = 8 - bit_pos - bits_per_pixel;
        packed_byte |= idx << shift;
        bit_pos += bits_per_pixel;
        if bit_pos >= 8 {
            buf.put_u8(packed_byte);
            packed_byte = 0;
            bit_pos = 0;
        }
    }

    if bit_pos > 0 {
        buf.put_u8(packed_byte);
    }
}

fn encode_packed_palette_rle_tile(buf: &mut BytesMut, pixels: &[u32], palette: &[u32], color_to_idx: &HashMap<u32, u8>, cpixel: usize) {
    let palette_size = palette.len();
    buf.put_u8(128 | (palette_size as u8)); // Packed palette RLE sub-encoding

    for &color in palette {
        write_cpixel(buf, color, cpixel);
    }

    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        let index = color_to_idx[&color];

        let mut run_len = 1;
        while i + run_len < pixels.len() && pixels[i + run_len] == color {
            run_len += 1;
        }

        if run_len == 1 {
            buf.put_u8(index);
        } else {
            buf.put_u8(index | 128);
            let mut remaining_len = run_len - 1;
            while remaining_len > 127 {
                buf.put_u8(127 | 128);
                remaining_len -= 127;
            }
            buf.put_u8(remaining_len as u8);
        }
        i += run_len;
    }
}

/// Encodes pixel data using run-length encoding (RFC 6143 §7.6.6).
fn encode_rle(buf: &mut BytesMut, pixels: &[u32], cpixel: usize) {
    let mut i = 0;
    while i < pixels.len() {
        let color = pixels[i];
        let mut run_len = 1;
        while i + run_len < pixels.len() && pixels[i + run_len] == color {
            run_len += 1;
        }
        write_cpixel(buf, color, cpixel);

        let mut len_to_encode = run_len - 1;
        while len_to_encode > 127 {
            buf.put_u8(127 | 128);
            len_to_encode -= 127;
        }
        buf.put_u8(len_to_encode as u8);

        i += run_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;

    fn solid_frame(width: usize, height: usize, r: u8, g: u8, b: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height * 4);
        for _ in 0..(width * height) {
            data.extend_from_slice(&[r, g, b, 0]);
        }
        data
    }

    #[test]
    fn solid_tile_uses_solid_subencoding() {
        let data = solid_frame(64, 64, 5, 10, 15);
        let format = PixelFormat::rgba32();
        let mut compressor = Compress::new(Compression::new(6), true);
        let encoded = encode_zrle_persistent(&data, 64, 64, &format, &mut compressor).unwrap();
        assert!(encoded.len() > 4); // 4-byte length prefix + compressed tile stream
    }

    #[test]
    fn cpixel_is_three_bytes_for_32bpp_depth24() {
        let format = PixelFormat::rgba32();
        assert_eq!(cpixel_size(&format), 3);
    }

    #[test]
    fn cpixel_is_full_width_for_16bpp() {
        let format = PixelFormat::rgb565();
        assert_eq!(cpixel_size(&format), 2);
    }

    #[test]
    fn persistent_stream_stays_open_across_rectangles() {
        let data = solid_frame(16, 16, 1, 2, 3);
        let format = PixelFormat::rgba32();
        let mut compressor = Compress::new(Compression::new(6), true);
        let before = compressor.total_in();
        encode_zrle_persistent(&data, 16, 16, &format, &mut compressor).unwrap();
        encode_zrle_persistent(&data, 16, 16, &format, &mut compressor).unwrap();
        assert!(compressor.total_in() > before);
    }
}
