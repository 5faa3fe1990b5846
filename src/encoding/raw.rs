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

//! VNC Raw encoding (RFC 6143 §7.7.1): pixel data sent verbatim in the
//! client's negotiated pixel format. The mandatory fallback every RFB
//! client must support; used when nothing more compact applies.

use super::Encoding;
use bytes::BytesMut;

/// Implements the VNC "Raw" encoding: the rectangle body is exactly
/// `width * height * bytes_per_pixel` bytes of already-client-format
/// pixel data, row-major, with no padding between rows.
pub struct RawEncoding;

impl Encoding for RawEncoding {
    fn encode(&self, data: &[u8], _width: u16, _height: u16, _bytes_per_pixel: usize) -> BytesMut {
        BytesMut::from(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_is_identity_over_already_formatted_pixels() {
        let data = vec![1u8, 2, 3, 4, 5, 6];
        let encoded = RawEncoding.encode(&data, 1, 2, 3);
        assert_eq!(&encoded[..], &data[..]);
    }
}
