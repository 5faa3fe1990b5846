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

//! VNC Authentication (RFC 6143 §7.2.2): a DES-ECB challenge/response
//! keyed on the connection password, with the RFC's well-known quirk that
//! each key byte's bits are reversed before use.

use crate::error::{Result, VncError};
use des::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

/// 16-byte challenge the server sends to start a VNC-Auth exchange.
pub type Challenge = [u8; 16];

/// Handles the VNC-Auth challenge/response for one connection.
pub struct VncAuth {
    key: [u8; 8],
}

impl VncAuth {
    /// Builds the DES key from `password`: the first 8 bytes (NUL-padded
    /// if shorter), each byte bit-reversed MSB↔LSB.
    #[must_use]
    pub fn new(password: &str) -> Self {
        let mut key = [0u8; 8];
        let bytes = password.as_bytes();
        let n = bytes.len().min(8);
        key[..n].copy_from_slice(&bytes[..n]);
        for byte in &mut key {
            *byte = byte.reverse_bits();
        }
        Self { key }
    }

    /// Generates a fresh 16-byte random challenge to send to the client.
    #[must_use]
    pub fn generate_challenge() -> Challenge {
        let mut challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }

    /// Verifies a 16-byte client response against the expected
    /// `DES_ECB(challenge)` computed over both 8-byte blocks.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Authentication`] if the response doesn't match.
    pub fn verify_response(&self, challenge: &Challenge, response: &[u8; 16]) -> Result<()> {
        let expected = self.encrypt_challenge(challenge);
        if response == &expected {
            Ok(())
        } else {
            Err(VncError::Authentication("VNC-Auth challenge response mismatch".to_string()))
        }
    }

    fn encrypt_challenge(&self, challenge: &Challenge) -> [u8; 16] {
        let cipher = Des::new(GenericArray::from_slice(&self.key));
        let mut out = [0u8; 16];
        for (block_in, block_out) in challenge.chunks_exact(8).zip(out.chunks_exact_mut(8)) {
            let mut block = GenericArray::clone_from_slice(block_in);
            cipher.encrypt_block(&mut block);
            block_out.copy_from_slice(&block);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_reversal_matches_rfc_example() {
        // RFC 6143 example: 'h' = 0x68 reverses to 0x16, 'e' = 0x65 reverses to 0xA6.
        let auth = VncAuth::new("hello");
        assert_eq!(auth.key[0], 0x16);
        assert_eq!(auth.key[1], 0xA6);
    }

    #[test]
    fn short_password_is_nul_padded() {
        let auth = VncAuth::new("hi");
        // 'h' reversed is 0x16, remaining bytes are NUL (0x00 reversed is still 0x00).
        assert_eq!(auth.key[0], 0x16);
        assert_eq!(auth.key[2..], [0u8; 6]);
    }

    #[test]
    fn correct_response_verifies() {
        let auth = VncAuth::new("hello");
        let challenge = [0u8; 16];
        let response = auth.encrypt_challenge(&challenge);
        assert!(auth.verify_response(&challenge, &response).is_ok());
    }

    #[test]
    fn wrong_response_is_rejected() {
        let auth = VncAuth::new("hello");
        let challenge = [0u8; 16];
        let bogus = [0xFFu8; 16];
        let err = auth.verify_response(&challenge, &bogus).unwrap_err();
        assert!(matches!(err, VncError::Authentication(_)));
    }

    #[test]
    fn different_passwords_produce_different_responses() {
        let a = VncAuth::new("hello");
        let b = VncAuth::new("world");
        let challenge = [0u8; 16];
        assert_ne!(a.encrypt_challenge(&challenge), b.encrypt_challenge(&challenge));
    }
}
