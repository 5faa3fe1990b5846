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

//! VNC RRE (Rise-and-Run-length Encoding, RFC 6143 §7.7.2): a background
//! pixel plus a list of same-color subrectangles. Effective for large
//! solid regions (window chrome, terminal backgrounds); degrades to one
//! subrectangle per foreground pixel on busy content.

use super::common::{decode_pixels, find_subrects, get_background_color, write_pixel};
use super::Encoding;
use bytes::{BufMut, BytesMut};

/// Implements VNC "RRE". Wire format:
/// `[subrect_count: u32][bg_pixel: bpp][{pixel: bpp, x,y,w,h: u16}, ...]`.
pub struct RreEncoding;

impl Encoding for RreEncoding {
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&self, data: &[u8], width: u16, height: u16, bytes_per_pixel: usize) -> BytesMut {
        let pixels = decode_pixels(data, bytes_per_pixel);
        let bg_color = get_background_color(&pixels);
        let subrects = find_subrects(&pixels, width as usize, height as usize, bg_color);

        let encoded_size = 4 + bytes_per_pixel + subrects.len() * (bytes_per_pixel + 8);
        let mut buf = BytesMut::with_capacity(encoded_size);

        buf.put_u32(subrects.len() as u32);
        write_pixel(&mut buf, bg_color, bytes_per_pixel);

        for subrect in subrects {
            write_pixel(&mut buf, subrect.color, bytes_per_pixel);
            buf.put_u16(subrect.x);
            buf.put_u16(subrect.y);
            buf.put_u16(subrect.w);
            buf.put_u16(subrect.h);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solid_rectangle_produces_zero_subrects() {
        let data = vec![9u8; 16 * 16 * 4];
        let encoded = RreEncoding.encode(&data, 16, 16, 4);
        let count = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(count, 0);
    }

    #[test]
    fn works_at_two_bytes_per_pixel() {
        let mut data = vec![0u8; 8 * 8 * 2];
        data[0] = 0xFF; // one differing pixel
        data[1] = 0xFF;
        let encoded = RreEncoding.encode(&data, 8, 8, 2);
        let count = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(count, 1);
    }
}
