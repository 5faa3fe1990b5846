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

//! VNC Tight encoding (RFC 6143 §7.7.4): the densest encoding, combining
//! rectangle splitting, solid-area extraction, palette/gradient filters,
//! and up to three persistent zlib streams shared across rectangles for
//! the lifetime of a connection.
//!
//! # Architecture
//!
//! ## Layer 1: high-level optimization (`encode_rect_optimized`)
//! - Rectangle splitting and subdivision
//! - Solid area detection and extraction
//! - Size limit enforcement (`TIGHT_MAX_RECT_SIZE`, `TIGHT_MAX_RECT_WIDTH`)
//!
//! ## Layer 2: low-level encoding (`encode_subrect`)
//! - Palette analysis
//! - Mode selection: solid / mono / indexed / gradient / full-color / JPEG
//! - Persistent-stream compression and wire format generation
//!
//! # Wire format
//!
//! The first byte is a compression control: the high nibble names the
//! class (`Fill`, `Jpeg`, `NoZlib`, or a stream id 0/2/3 for Basic), and
//! when the explicit-filter bit is set, a filter id byte follows
//! (`Copy`, `Palette`, or `Gradient`). Stream id 1 is reserved and never
//! emitted. Every payload but `Fill` is prefixed with a compact length
//! unless it is under [`TIGHT_MIN_TO_COMPRESS`] bytes, in which case it's
//! written directly with no length field at all.
//!
//! Pixels are written as TPIXEL: 3 bytes (R, G, B) when the client's
//! format is 32bpp/depth-24 true-color, else the full `bytes_per_pixel`
//! width, matching RFC 6143 §7.7.4 — the same rule ZRLE applies to CPIXEL.

use super::common::{read_pixel, write_pixel};
use crate::protocol::PixelFormat;
use bytes::{BufMut, BytesMut};
use flate2::{Compress, Compression, FlushCompress, Status};
use log::info;
use std::collections::HashMap;

const TIGHT_EXPLICIT_FILTER: u8 = 0x04;
const TIGHT_FILL: u8 = 0x08;
const TIGHT_JPEG: u8 = 0x09;
const TIGHT_NO_ZLIB: u8 = 0x0A;

const TIGHT_FILTER_COPY: u8 = 0x00;
const TIGHT_FILTER_PALETTE: u8 = 0x01;
const TIGHT_FILTER_GRADIENT: u8 = 0x02;

/// Persistent stream carrying Basic-class data with no filter applied.
pub const STREAM_BASIC: u8 = 0;
/// Reserved by the protocol; never assigned a stream.
#[allow(dead_code)]
pub const STREAM_RESERVED: u8 = 1;
/// Persistent stream carrying Palette-filtered data (mono and indexed).
pub const STREAM_PALETTE: u8 = 2;
/// Persistent stream carrying Gradient-filtered data.
pub const STREAM_GRADIENT: u8 = 3;

const TIGHT_MIN_TO_COMPRESS: usize = 12;
const MIN_SPLIT_RECT_SIZE: usize = 4096;
const MIN_SOLID_SUBRECT_SIZE: usize = 2048;
const MAX_SPLIT_TILE_SIZE: u16 = 16;
const TIGHT_MAX_RECT_SIZE: usize = 65536;
const TIGHT_MAX_RECT_WIDTH: u16 = 2048;

/// Region size above which the Gradient filter is considered over Palette,
/// per the content heuristic: only worth the per-pixel prediction cost
/// once the region is both large and too colorful for a tight palette.
const GRADIENT_MIN_PIXELS: usize = 1024;
/// Palette would need more entries than this for Gradient to be tried.
const GRADIENT_PALETTE_THRESHOLD: usize = 96;

/// TPIXEL width for `format`: 3 bytes for the common 32bpp/depth-24
/// true-color case (the padding byte is never sent), else the full pixel.
fn cpixel_size(format: &PixelFormat) -> usize {
    if format.bits_per_pixel == 32 && format.depth == 24 {
        3
    } else {
        format.bytes_per_pixel()
    }
}

struct TightConf {
    mono_min_rect_size: usize,
    idx_zlib_level: u8,
    mono_zlib_level: u8,
    raw_zlib_level: u8,
}

const TIGHT_CONF: [TightConf; 4] = [
    TightConf { mono_min_rect_size: 6, idx_zlib_level: 0, mono_zlib_level: 0, raw_zlib_level: 0 },
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 1, mono_zlib_level: 1, raw_zlib_level: 1 },
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 3, mono_zlib_level: 3, raw_zlib_level: 2 },
    TightConf { mono_min_rect_size: 32, idx_zlib_level: 7, mono_zlib_level: 7, raw_zlib_level: 5 },
];

#[derive(Debug, Clone)]
struct Rect {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
}

struct EncodeResult {
    rectangles: Vec<(Rect, BytesMut)>,
}

/// The three persistent zlib streams a Tight-speaking client keeps state
/// for across rectangles (RFC 6143 §7.7.4). Stream 1 is reserved and
/// never instantiated. Held per-connection; never shared across clients.
pub struct TightStreams {
    level: u8,
    basic: Compress,
    palette: Compress,
    gradient: Compress,
}

impl TightStreams {
    /// Creates fresh streams at `level` (0-9, clamped to zlib's 0-9 range).
    #[must_use]
    pub fn new(level: u8) -> Self {
        let compression = Compression::new(u32::from(level.min(9)));
        Self {
            level,
            basic: Compress::new(compression, true),
            palette: Compress::new(compression, true),
            gradient: Compress::new(compression, true),
        }
    }

    /// Resets all three streams, e.g. on pixel-format change or an
    /// explicit client-requested compression reset. Also used lazily
    /// when the configured compression level changes.
    pub fn reset(&mut self, level: u8) {
        *self = Self::new(level);
    }

    fn stream_mut(&mut self, id: u8) -> &mut Compress {
        match id {
            STREAM_BASIC => &mut self.basic,
            STREAM_PALETTE => &mut self.palette,
            STREAM_GRADIENT => &mut self.gradient,
            _ => unreachable!("stream 1 is reserved and never selected"),
        }
    }
}

/// Encodes one rectangle of `format`-shaped framebuffer data as Tight,
/// compressing Basic/Palette/Gradient payloads through `streams` so the
/// client's matching decompressors stay in sync across calls. `format`
/// is the client's negotiated pixel format; the caller is expected to
/// have already translated `data` into it.
///
/// Large regions (≥ [`MIN_SPLIT_RECT_SIZE`] pixels) are internally split
/// into several smaller Tight sub-rectangles for better solid-area and
/// palette locality; each returned entry is `(x, y, w, h, body)` relative
/// to `data`'s origin and needs its own RFB rectangle header on the
/// wire — the caller must not treat these as one rectangle's payload.
pub fn encode_tight_persistent(
    data: &[u8],
    width: u16,
    height: u16,
    quality: u8,
    compression: u8,
    format: &PixelFormat,
    streams: &mut TightStreams,
) -> Vec<(u16, u16, u16, u16, BytesMut)> {
    if streams.level != compression {
        streams.reset(compression);
    }
    let bpp = format.bytes_per_pixel();
    let cpixel = cpixel_size(format);
    let rect = Rect { x: 0, y: 0, w: width, h: height };
    let result = encode_rect_optimized(data, width, &rect, quality, compression, bpp, cpixel, streams);
    result.rectangles.into_iter().map(|(r, buf)| (r.x, r.y, r.w, r.h, buf)).collect()
}

#[allow(clippy::too_many_arguments)]
fn encode_rect_optimized(
    framebuffer: &[u8],
    fb_width: u16,
    rect: &Rect,
    quality: u8,
    compression: u8,
    bpp: usize,
    cpixel: usize,
    streams: &mut TightStreams,
) -> EncodeResult {
    let mut rectangles = Vec::new();
    let compression = normalize_compression_level(compression, quality);

    if (rect.w as usize * rect.h as usize) < MIN_SPLIT_RECT_SIZE {
        let buf = encode_subrect(framebuffer, fb_width, rect, quality, compression, bpp, cpixel, streams);
        rectangles.push((rect.clone(), buf));
        return EncodeResult { rectangles };
    }

    let n_max_width = rect.w.min(TIGHT_MAX_RECT_WIDTH);
    let n_max_rows = (TIGHT_MAX_RECT_SIZE / n_max_width as usize) as u16;

    let mut current_y = rect.y;
    let mut remaining_h = rect.h;

    while current_y < rect.y + rect.h {
        if (current_y - rect.y) >= n_max_rows {
            let chunk_rect = Rect {
                x: rect.x,
                y: rect.y + (current_y - rect.y - n_max_rows),
                w: rect.w,
                h: n_max_rows,
            };
            let buf = encode_subrect(framebuffer, fb_width, &chunk_rect, quality, compression, bpp, cpixel, streams);
            rectangles.push((chunk_rect, buf));
            remaining_h -= n_max_rows;
        }

        let dy_end = (current_y + MAX_SPLIT_TILE_SIZE).min(rect.y + rect.h);
        let dh = dy_end - current_y;

        let mut current_x = rect.x;
        while current_x < rect.x + rect.w {
            let dx_end = (current_x + MAX_SPLIT_TILE_SIZE).min(rect.x + rect.w);
            let dw = dx_end - current_x;

            if let Some(color_value) = check_solid_tile(framebuffer, fb_width, current_x, current_y, dw, dh, None, bpp) {
                let (w_best, h_best) = find_best_solid_area(
                    framebuffer, fb_width, current_x, current_y,
                    rect.w - (current_x - rect.x), remaining_h - (current_y - rect.y), color_value, bpp,
                );

                if w_best * h_best != rect.w * remaining_h && (w_best as usize * h_best as usize) < MIN_SOLID_SUBRECT_SIZE {
                    current_x += dw;
                    continue;
                }

                let (x_best, y_best, w_best, h_best) = extend_solid_area(
                    framebuffer, fb_width, rect.x, current_y, rect.w, remaining_h,
                    color_value, current_x, current_y, w_best, h_best, bpp,
                );

                if y_best != current_y {
                    let top_rect = Rect { x: rect.x, y: current_y, w: rect.w, h: y_best - current_y };
                    let buf = encode_subrect(framebuffer, fb_width, &top_rect, quality, compression, bpp, cpixel, streams);
                    rectangles.push((top_rect, buf));
                }

                if x_best != rect.x {
                    let left_rect = Rect { x: rect.x, y: y_best, w: x_best - rect.x, h: h_best };
                    let sub_result = encode_rect_optimized(framebuffer, fb_width, &left_rect, quality, compression, bpp, cpixel, streams);
                    rectangles.extend(sub_result.rectangles);
                }

                let solid_rect = Rect { x: x_best, y: y_best, w: w_best, h: h_best };
                let buf = encode_solid_rect(color_value, cpixel);
                rectangles.push((solid_rect, buf));

                if x_best + w_best != rect.x + rect.w {
                    let right_rect = Rect {
                        x: x_best + w_best, y: y_best, w: rect.w - (x_best - rect.x) - w_best, h: h_best,
                    };
                    let sub_result = encode_rect_optimized(framebuffer, fb_width, &right_rect, quality, compression, bpp, cpixel, streams);
                    rectangles.extend(sub_result.rectangles);
                }

                if y_best + h_best != current_y + remaining_h {
                    let bottom_rect = Rect {
                        x: rect.x, y: y_best + h_best, w: rect.w, h: remaining_h - (y_best - current_y) - h_best,
                    };
                    let sub_result = encode_rect_optimized(framebuffer, fb_width, &bottom_rect, quality, compression, bpp, cpixel, streams);
                    rectangles.extend(sub_result.rectangles);
                }

                return EncodeResult { rectangles };
            }

            current_x += dw;
        }

        current_y += dh;
    }

    let buf = encode_subrect(framebuffer, fb_width, rect, quality, compression, bpp, cpixel, streams);
    rectangles.push((rect.clone(), buf));
    EncodeResult { rectangles }
}

fn normalize_compression_level(compression: u8, quality: u8) -> u8 {
    let mut level = compression;
    if level == 9 {
        level = 3;
    } else if level > 1 {
        level = if quality < 10 { level.min(2) } else { level.min(1) };
    }
    level
}

#[allow(clippy::too_many_arguments)]
fn encode_subrect(
    framebuffer: &[u8],
    fb_width: u16,
    rect: &Rect,
    quality: u8,
    compression: u8,
    bpp: usize,
    cpixel: usize,
    streams: &mut TightStreams,
) -> BytesMut {
    if rect.w > TIGHT_MAX_RECT_WIDTH || ((rect.w as usize) * (rect.h as usize)) > TIGHT_MAX_RECT_SIZE {
        return encode_large_rect(framebuffer, fb_width, rect, quality, compression, bpp, cpixel, streams);
    }

    let pixels = extract_rect_pixels(framebuffer, fb_width, rect, bpp);
    let palette = analyze_palette(&pixels, rect.w as usize * rect.h as usize, compression, bpp);
    let pixel_count = rect.w as usize * rect.h as usize;

    match palette.num_colors {
        0 => {
            // JPEG needs genuine 3-channel truecolor input; other formats
            // (e.g. rgb565) fall through to the lossless full-color path.
            if quality < 10 && cpixel == 3 {
                encode_jpeg_rect(&pixels, rect.w, rect.h, quality, bpp)
            } else if should_use_gradient(pixel_count, 257) {
                encode_gradient_rect(&pixels, rect.w, rect.h, compression, bpp, cpixel, streams)
            } else {
                encode_full_color_rect(&pixels, rect.w, rect.h, compression, bpp, cpixel, streams)
            }
        }
        1 => encode_solid_rect(palette.colors[0], cpixel),
        2 => encode_mono_rect(&pixels, rect.w, rect.h, palette.colors[0], palette.colors[1], compression, bpp, cpixel, streams),
        _ => encode_indexed_rect(&pixels, rect.w, rect.h, &palette.colors[..palette.num_colors], compression, bpp, cpixel, streams),
    }
}

/// Gradient is only worth the per-pixel residual cost for large, busy
/// regions where a palette would need too many entries to be compact.
fn should_use_gradient(pixel_count: usize, palette_colors: usize) -> bool {
    pixel_count >= GRADIENT_MIN_PIXELS && palette_colors > GRADIENT_PALETTE_THRESHOLD
}

#[allow(clippy::too_many_arguments)]
fn encode_large_rect(
    framebuffer: &[u8],
    fb_width: u16,
    rect: &Rect,
    quality: u8,
    compression: u8,
    bpp: usize,
    cpixel: usize,
    streams: &mut TightStreams,
) -> BytesMut {
    let subrect_max_width = rect.w.min(TIGHT_MAX_RECT_WIDTH);
    let subrect_max_height = (TIGHT_MAX_RECT_SIZE / subrect_max_width as usize) as u16;

    let mut output = BytesMut::new();
    let mut dy = 0;
    while dy < rect.h {
        let mut dx = 0;
        while dx < rect.w {
            let rw = (rect.w - dx).min(TIGHT_MAX_RECT_WIDTH);
            let rh = (rect.h - dy).min(subrect_max_height);
            let sub_rect = Rect { x: rect.x + dx, y: rect.y + dy, w: rw, h: rh };
            let buf = encode_subrect(framebuffer, fb_width, &sub_rect, quality, compression, bpp, cpixel, streams);
            output.extend_from_slice(&buf);
            dx += TIGHT_MAX_RECT_WIDTH;
        }
        dy += subrect_max_height;
    }
    output
}

fn check_solid_tile(framebuffer: &[u8], fb_width: u16, x: u16, y: u16, w: u16, h: u16, need_same_color: Option<u32>, bpp: usize) -> Option<u32> {
    let offset = (y as usize * fb_width as usize + x as usize) * bpp;
    let first_color = read_pixel(&framebuffer[offset..offset + bpp]);

    if let Some(required) = need_same_color {
        if first_color != required {
            return None;
        }
    }

    for dy in 0..h {
        let row_offset = ((y + dy) as usize * fb_width as usize + x as usize) * bpp;
        for dx in 0..w {
            let pix_offset = row_offset + dx as usize * bpp;
            let color = read_pixel(&framebuffer[pix_offset..pix_offset + bpp]);
            if color != first_color {
                return None;
            }
        }
    }
    Some(first_color)
}

#[allow(clippy::too_many_arguments)]
fn find_best_solid_area(framebuffer: &[u8], fb_width: u16, x: u16, y: u16, w: u16, h: u16, color_value: u32, bpp: usize) -> (u16, u16) {
    let mut w_best = 0;
    let mut h_best = 0;
    let mut w_prev = w;

    let mut dy = 0;
    while dy < h {
        let dh = (h - dy).min(MAX_SPLIT_TILE_SIZE);
        let dw = w_prev.min(MAX_SPLIT_TILE_SIZE);

        if check_solid_tile(framebuffer, fb_width, x, y + dy, dw, dh, Some(color_value), bpp).is_none() {
            break;
        }

        let mut dx = dw;
        while dx < w_prev {
            let dw_check = (w_prev - dx).min(MAX_SPLIT_TILE_SIZE);
            if check_solid_tile(framebuffer, fb_width, x + dx, y + dy, dw_check, dh, Some(color_value), bpp).is_none() {
                break;
            }
            dx += dw_check;
        }

        w_prev = dx;
        if (w_prev as usize * (dy + dh) as usize) > (w_best as usize * h_best as usize) {
            w_best = w_prev;
            h_best = dy + dh;
        }
        dy += dh;
    }
    (w_best, h_best)
}

#[allow(clippy::too_many_arguments)]
fn extend_solid_area(
    framebuffer: &[u8], fb_width: u16, base_x: u16, base_y: u16, max_w: u16, max_h: u16,
    color_value: u32, mut x: u16, mut y: u16, mut w: u16, mut h: u16, bpp: usize,
) -> (u16, u16, u16, u16) {
    while y > base_y {
        if check_solid_tile(framebuffer, fb_width, x, y - 1, w, 1, Some(color_value), bpp).is_none() {
            break;
        }
        y -= 1;
        h += 1;
    }
    while y + h < base_y + max_h {
        if check_solid_tile(framebuffer, fb_width, x, y + h, w, 1, Some(color_value), bpp).is_none() {
            break;
        }
        h += 1;
    }
    while x > base_x {
        if check_solid_tile(framebuffer, fb_width, x - 1, y, 1, h, Some(color_value), bpp).is_none() {
            break;
        }
        x -= 1;
        w += 1;
    }
    while x + w < base_x + max_w {
        if check_solid_tile(framebuffer, fb_width, x + w, y, 1, h, Some(color_value), bpp).is_none() {
            break;
        }
        w += 1;
    }
    (x, y, w, h)
}

struct Palette {
    num_colors: usize,
    colors: [u32; 256],
}

fn analyze_palette(pixels: &[u8], pixel_count: usize, compression: u8, bpp: usize) -> Palette {
    let conf_idx = match compression {
        0 => 0,
        1 => 1,
        2 | 3 => 2,
        _ => 3,
    };
    let conf = &TIGHT_CONF[conf_idx];

    let mut palette = Palette { num_colors: 0, colors: [0; 256] };
    if pixel_count == 0 {
        return palette;
    }

    let c0 = read_pixel(&pixels[0..bpp]);
    let mut i = bpp;
    while i < pixels.len() && read_pixel(&pixels[i..i + bpp]) == c0 {
        i += bpp;
    }

    if i >= pixels.len() {
        palette.num_colors = 1;
        palette.colors[0] = c0;
        return palette;
    }

    if pixel_count >= conf.mono_min_rect_size {
        let n0 = i / bpp;
        let c1 = read_pixel(&pixels[i..i + bpp]);
        let mut n1 = 0;

        i += bpp;
        while i < pixels.len() {
            let color = read_pixel(&pixels[i..i + bpp]);
            if color == c1 {
                n1 += 1;
            } else if color != c0 {
                break;
            }
            i += bpp;
        }

        if i >= pixels.len() {
            palette.num_colors = 2;
            if n0 > n1 {
                palette.colors[0] = c0;
                palette.colors[1] = c1;
            } else {
                palette.colors[0] = c1;
                palette.colors[1] = c0;
            }
            return palette;
        }
    }

    palette.num_colors = 0;
    palette
}

/// Extracts a `rect`-shaped window of raw, `bpp`-wide pixel bytes from
/// `framebuffer`, unchanged from whatever format the caller translated
/// the source frame into.
fn extract_rect_pixels(framebuffer: &[u8], fb_width: u16, rect: &Rect, bpp: usize) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(rect.w as usize * rect.h as usize * bpp);
    for y in 0..rect.h {
        let row_offset = ((rect.y + y) as usize * fb_width as usize + rect.x as usize) * bpp;
        let row_end = row_offset + rect.w as usize * bpp;
        pixels.extend_from_slice(&framebuffer[row_offset..row_end]);
    }
    pixels
}

/// Truncates each `bpp`-wide pixel down to its low `cpixel` bytes, tightly
/// packed — the same truncation [`write_pixel`] performs when writing a
/// single pixel, applied across a whole buffer.
fn extract_channel_bytes(pixels: &[u8], bpp: usize, cpixel: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity((pixels.len() / bpp) * cpixel);
    for chunk in pixels.chunks_exact(bpp) {
        out.extend_from_slice(&chunk[..cpixel]);
    }
    out
}

fn encode_solid_rect(color: u32, cpixel: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + cpixel);
    buf.put_u8(TIGHT_FILL << 4);
    write_pixel(&mut buf, color, cpixel);
    info!("Tight solid: 0x{color:06x}, {} bytes", buf.len());
    buf
}

#[allow(clippy::too_many_arguments)]
fn encode_mono_rect(pixels: &[u8], width: u16, height: u16, bg: u32, fg: u32, compression: u8, bpp: usize, cpixel: usize, streams: &mut TightStreams) -> BytesMut {
    let conf_idx = match compression { 0 => 0, 1 => 1, 2 | 3 => 2, _ => 3 };
    let zlib_level = TIGHT_CONF[conf_idx].mono_zlib_level;
    let bitmap = encode_mono_bitmap(pixels, width, height, bg, bpp);

    let mut buf = BytesMut::new();
    if zlib_level == 0 {
        buf.put_u8((TIGHT_NO_ZLIB | TIGHT_EXPLICIT_FILTER) << 4);
    } else {
        buf.put_u8((STREAM_PALETTE | TIGHT_EXPLICIT_FILTER) << 4);
    }
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8(1);
    write_pixel(&mut buf, bg, cpixel);
    write_pixel(&mut buf, fg, cpixel);

    compress_data(&mut buf, &bitmap, zlib_level, STREAM_PALETTE, streams);
    info!("Tight mono: {width}x{height}, {} bytes", buf.len());
    buf
}

fn encode_indexed_rect(pixels: &[u8], width: u16, height: u16, palette: &[u32], compression: u8, bpp: usize, cpixel: usize, streams: &mut TightStreams) -> BytesMut {
    let conf_idx = match compression { 0 => 0, 1 => 1, 2 | 3 => 2, _ => 3 };
    let zlib_level = TIGHT_CONF[conf_idx].idx_zlib_level;

    let mut color_map = HashMap::new();
    for (idx, &color) in palette.iter().enumerate() {
        color_map.insert(color, idx as u8);
    }

    let mut indices = Vec::with_capacity(width as usize * height as usize);
    for chunk in pixels.chunks_exact(bpp) {
        let color = read_pixel(chunk);
        indices.push(*color_map.get(&color).unwrap_or(&0));
    }

    let mut buf = BytesMut::new();
    if zlib_level == 0 {
        buf.put_u8((TIGHT_NO_ZLIB | TIGHT_EXPLICIT_FILTER) << 4);
    } else {
        buf.put_u8((STREAM_PALETTE | TIGHT_EXPLICIT_FILTER) << 4);
    }
    buf.put_u8(TIGHT_FILTER_PALETTE);
    buf.put_u8((palette.len() - 1) as u8);
    for &color in palette {
        write_pixel(&mut buf, color, cpixel);
    }

    compress_data(&mut buf, &indices, zlib_level, STREAM_PALETTE, streams);
    info!("Tight indexed: {} colors, {width}x{height}, {} bytes", palette.len(), buf.len());
    buf
}

/// Encodes a truecolor rectangle using the Gradient filter: each output
/// channel byte is replaced by its residual from the `left + top -
/// topleft` predictor, which compresses well for smooth photographic
/// gradients that defeat a small palette. Operates on the already
/// `cpixel`-truncated channel bytes, so it generalizes to any pixel
/// width without assuming a specific channel layout.
fn encode_gradient_rect(pixels: &[u8], width: u16, height: u16, compression: u8, bpp: usize, cpixel: usize, streams: &mut TightStreams) -> BytesMut {
    let conf_idx = match compression { 0 => 0, 1 => 1, 2 | 3 => 2, _ => 3 };
    let zlib_level = TIGHT_CONF[conf_idx].raw_zlib_level;
    let w = width as usize;
    let h = height as usize;

    let channel_bytes = extract_channel_bytes(pixels, bpp, cpixel);
    let mut residuals = Vec::with_capacity(w * h * cpixel);
    let channel = |x: usize, y: usize, c: usize| -> i32 { i32::from(channel_bytes[(y * w + x) * cpixel + c]) };

    for y in 0..h {
        for x in 0..w {
            for c in 0..cpixel {
                let left = if x > 0 { channel(x - 1, y, c) } else { 0 };
                let top = if y > 0 { channel(x, y - 1, c) } else { 0 };
                let topleft = if x > 0 && y > 0 { channel(x - 1, y - 1, c) } else { 0 };
                let predicted = (left + top - topleft).clamp(0, 255);
                let residual = (channel(x, y, c) - predicted) as u8;
                residuals.push(residual);
            }
        }
    }

    let mut buf = BytesMut::new();
    if zlib_level == 0 {
        buf.put_u8((TIGHT_NO_ZLIB | TIGHT_EXPLICIT_FILTER) << 4);
    } else {
        buf.put_u8((STREAM_GRADIENT | TIGHT_EXPLICIT_FILTER) << 4);
    }
    buf.put_u8(TIGHT_FILTER_GRADIENT);
    compress_data(&mut buf, &residuals, zlib_level, STREAM_GRADIENT, streams);
    info!("Tight gradient: {width}x{height}, {} bytes", buf.len());
    buf
}

fn encode_full_color_rect(pixels: &[u8], width: u16, height: u16, compression: u8, bpp: usize, cpixel: usize, streams: &mut TightStreams) -> BytesMut {
    let conf_idx = match compression { 0 => 0, 1 => 1, 2 | 3 => 2, _ => 3 };
    let zlib_level = TIGHT_CONF[conf_idx].raw_zlib_level;

    let channel_bytes = extract_channel_bytes(pixels, bpp, cpixel);

    let mut buf = BytesMut::new();
    if zlib_level == 0 {
        buf.put_u8(TIGHT_NO_ZLIB << 4);
    } else {
        buf.put_u8(STREAM_BASIC << 4);
    }
    // Copy filter is the implicit default (no explicit-filter bit, no filter byte).
    compress_data(&mut buf, &channel_bytes, zlib_level, STREAM_BASIC, streams);
    info!("Tight full-color: {width}x{height}, {} bytes", buf.len());
    buf
}

fn encode_jpeg_rect(pixels: &[u8], width: u16, height: u16, quality: u8, bpp: usize) -> BytesMut {
    #[cfg(feature = "turbojpeg")]
    {
        use crate::jpeg::TurboJpegEncoder;

        let rgb_data = extract_channel_bytes(pixels, bpp, 3);

        let jpeg_data = match TurboJpegEncoder::new() {
            Ok(mut encoder) => match encoder.compress_rgb(&rgb_data, width, height, quality) {
                Ok(data) => data,
                Err(e) => {
                    info!("TurboJPEG failed: {e}, using full-color");
                    let mut fallback_streams = TightStreams::new(6);
                    return encode_full_color_rect(pixels, width, height, 6, bpp, 3, &mut fallback_streams);
                }
            },
            Err(e) => {
                info!("TurboJPEG init failed: {e}, using full-color");
                let mut fallback_streams = TightStreams::new(6);
                return encode_full_color_rect(pixels, width, height, 6, bpp, 3, &mut fallback_streams);
            }
        };

        let mut buf = BytesMut::new();
        buf.put_u8(TIGHT_JPEG << 4);
        write_compact_length(&mut buf, jpeg_data.len());
        buf.put_slice(&jpeg_data);
        info!("Tight JPEG: {width}x{height}, quality {quality}, {} bytes", jpeg_data.len());
        buf
    }

    #[cfg(not(feature = "turbojpeg"))]
    {
        info!("TurboJPEG not enabled, using full-color (quality={quality})");
        let mut fallback_streams = TightStreams::new(6);
        encode_full_color_rect(pixels, width, height, 6, bpp, 3, &mut fallback_streams)
    }
}

/// Compresses `data` through the persistent stream `stream_id`, or writes
/// it plain (with or without a length prefix per the small-payload rule)
/// when `zlib_level == 0` or the payload is too small to bother.
fn compress_data(buf: &mut BytesMut, data: &[u8], zlib_level: u8, stream_id: u8, streams: &mut TightStreams) {
    if data.len() < TIGHT_MIN_TO_COMPRESS {
        buf.put_slice(data);
        return;
    }

    if zlib_level == 0 {
        write_compact_length(buf, data.len());
        buf.put_slice(data);
        return;
    }

    match compress_persistent(streams.stream_mut(stream_id), data) {
        Ok(compressed) => {
            write_compact_length(buf, compressed.len());
            buf.put_slice(&compressed);
        }
        Err(_) => {
            write_compact_length(buf, data.len());
            buf.put_slice(data);
        }
    }
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
                return Err(std::io::Error::other("tight zlib stream buffer error"));
            }
            Status::Ok if input_pos >= data.len() => break,
            Status::Ok => {}
        }
    }

    Ok(output)
}

fn encode_mono_bitmap(pixels: &[u8], width: u16, height: u16, bg: u32, bpp: usize) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let bytes_per_row = w.div_ceil(8);
    let mut bitmap = vec![0u8; bytes_per_row * h];

    let mut bitmap_idx = 0;
    for y in 0..h {
        let mut byte_val = 0u8;
        let mut bit_pos = 7i32;

        for x in 0..w {
            let pix_offset = (y * w + x) * bpp;
            let color = read_pixel(&pixels[pix_offset..pix_offset + bpp]);
            if color != bg {
                byte_val |= 1 << bit_pos;
            }
            if bit_pos == 0 {
                bitmap[bitmap_idx] = byte_val;
                bitmap_idx += 1;
                byte_val = 0;
                bit_pos = 7;
            } else {
                bit_pos -= 1;
            }
        }

        if w % 8 != 0 {
            bitmap[bitmap_idx] = byte_val;
            bitmap_idx += 1;
        }
    }
    bitmap
}

fn write_compact_length(buf: &mut BytesMut, len: usize) {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len < 16384 {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 7) as u8);
    } else {
        buf.put_u8(((len & 0x7F) | 0x80) as u8);
        buf.put_u8((((len >> 7) & 0x7F) | 0x80) as u8);
        buf.put_u8((len >> 14) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u16, height: u16, r: u8, g: u8, b: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&[r, g, b, 0]);
        }
        data
    }

    #[test]
    fn solid_rectangle_uses_fill_class() {
        let data = solid_frame(32, 32, 10, 20, 30);
        let mut streams = TightStreams::new(6);
        let format = PixelFormat::rgba32();
        let encoded = encode_tight_persistent(&data, 32, 32, 80, 6, &format, &mut streams);
        assert_eq!(encoded.len(), 1);
        let (x, y, w, h, body) = &encoded[0];
        assert_eq!((*x, *y, *w, *h), (0, 0, 32, 32));
        assert_eq!(body[0] >> 4, TIGHT_FILL);
        assert_eq!(&body[1..4], &[10, 20, 30]);
    }

    #[test]
    fn cpixel_is_three_bytes_for_32bpp_depth24() {
        assert_eq!(cpixel_size(&PixelFormat::rgba32()), 3);
    }

    #[test]
    fn cpixel_is_full_width_for_16bpp() {
        assert_eq!(cpixel_size(&PixelFormat::rgb565()), 2);
    }

    /// A client negotiating a 2-bytes/pixel format (rgb565) must not
    /// overrun `extract_rect_pixels`' bpp-wide stride, and the Fill body
    /// must carry the full 2-byte pixel rather than a truncated TPIXEL.
    #[test]
    fn solid_rectangle_with_16bpp_format_does_not_panic_or_truncate() {
        let mut data = Vec::with_capacity(16 * 16 * 2);
        for _ in 0..(16 * 16) {
            data.extend_from_slice(&0x1234u16.to_le_bytes());
        }
        let mut streams = TightStreams::new(6);
        let format = PixelFormat::rgb565();
        let encoded = encode_tight_persistent(&data, 16, 16, 80, 6, &format, &mut streams);
        assert_eq!(encoded.len(), 1);
        let (_, _, _, _, body) = &encoded[0];
        assert_eq!(body.len(), 3, "Fill control byte + 2-byte pixel, not a truncated TPIXEL");
        assert_eq!(&body[1..3], &0x1234u16.to_le_bytes());
    }

    #[test]
    fn compact_length_round_trips_three_ranges() {
        let mut short = BytesMut::new();
        write_compact_length(&mut short, 100);
        assert_eq!(short.len(), 1);

        let mut medium = BytesMut::new();
        write_compact_length(&mut medium, 1000);
        assert_eq!(medium.len(), 2);

        let mut long = BytesMut::new();
        write_compact_length(&mut long, 100_000);
        assert_eq!(long.len(), 3);
    }

    #[test]
    fn persistent_stream_stays_open_across_calls() {
        let mut streams = TightStreams::new(6);
        let before = streams.basic.total_in();
        let data = vec![7u8; 64];
        compress_persistent(&mut streams.basic, &data).unwrap();
        compress_persistent(&mut streams.basic, &data).unwrap();
        assert_eq!(streams.basic.total_in() - before, 128);
    }

    #[test]
    fn reset_replaces_all_three_streams() {
        let mut streams = TightStreams::new(6);
        compress_persistent(&mut streams.basic, &[1u8; 64]).unwrap();
        assert!(streams.basic.total_in() > 0);
        streams.reset(6);
        assert_eq!(streams.basic.total_in(), 0);
    }

    #[test]
    fn large_region_splits_into_multiple_addressable_subrects() {
        // 128x128 = 16384 px, well above MIN_SPLIT_RECT_SIZE; each returned
        // entry must carry its own (x, y, w, h) so the caller can emit a
        // separate rectangle header per chunk instead of one bogus blob.
        let data = solid_frame(128, 128, 1, 2, 3);
        let mut streams = TightStreams::new(6);
        let format = PixelFormat::rgba32();
        let encoded = encode_tight_persistent(&data, 128, 128, 80, 6, &format, &mut streams);
        assert!(encoded.len() >= 1);
        for (_, _, w, h, _) in &encoded {
            assert!(*w > 0 && *h > 0);
        }
    }

    #[test]
    fn stream_one_is_never_selected() {
        // STREAM_BASIC/PALETTE/GRADIENT are 0/2/3; 1 is skipped entirely.
        assert_eq!(STREAM_BASIC, 0);
        assert_eq!(STREAM_PALETTE, 2);
        assert_eq!(STREAM_GRADIENT, 3);
    }
}
