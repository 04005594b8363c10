// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integrity primitives: CRC-32 and CRC-16.
//!
//! Every persisted structure and the application image are protected by
//! CRC-32/MPEG-2, which is what the STM32F4 hardware CRC unit computes
//! over a stream of 32-bit words: polynomial 0x04C11DB7, initial value
//! 0xFFFFFFFF, no reflection, no final XOR. The boot stage uses the
//! hardware unit through the [`Crc32Engine`] trait; everything that has to
//! run on the host (validators, tests, the incremental image check) uses
//! the software implementation, and the two agree bit-for-bit.
//!
//! Byte streams are folded into little-endian words before hashing, which
//! matches what the hardware sees when it walks flash word by word. A
//! trailing partial word is padded with 0xFF, the erased-flash value.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_16_IBM_3740, CRC_32_MPEG_2};

/// The word-stream CRC used for all 32-bit integrity checks.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// CRC-16/CCITT-FALSE, used only by the small non-safety parameter record.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// A CRC-32 calculator fed one 32-bit word at a time.
///
/// Implemented by the STM32F4 CRC peripheral driver and by [`SoftCrc32`].
/// Callers must `reset()` before starting a new computation; the engines
/// are otherwise stateful across `feed_word` calls by design.
pub trait Crc32Engine {
    fn reset(&mut self);
    fn feed_word(&mut self, word: u32);
    fn value(&self) -> u32;

    /// Resets, feeds every word of `words`, and returns the result.
    fn words(&mut self, words: &[u32]) -> u32 {
        self.reset();
        for &w in words {
            self.feed_word(w);
        }
        self.value()
    }
}

/// Software mirror of the hardware CRC unit.
///
/// The shift register is advanced exactly the way the peripheral does it,
/// so a word stream produces the same value on host and target.
pub struct SoftCrc32 {
    state: u32,
}

const POLY: u32 = 0x04C1_1DB7;
const INIT: u32 = 0xFFFF_FFFF;

impl SoftCrc32 {
    pub const fn new() -> Self {
        Self { state: INIT }
    }
}

impl Default for SoftCrc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32Engine for SoftCrc32 {
    fn reset(&mut self) {
        self.state = INIT;
    }

    fn feed_word(&mut self, word: u32) {
        self.state ^= word;
        for _ in 0..32 {
            if self.state & 0x8000_0000 != 0 {
                self.state = (self.state << 1) ^ POLY;
            } else {
                self.state <<= 1;
            }
        }
    }

    fn value(&self) -> u32 {
        self.state
    }
}

/// CRC-32 over a byte slice through an arbitrary engine, using the
/// word-stream convention described in the crate docs.
pub fn crc32_bytes_with(engine: &mut impl Crc32Engine, data: &[u8]) -> u32 {
    engine.reset();
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        engine.feed_word(word);
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        // Pad the final word with the erased-flash value.
        let mut last = [0xFFu8; 4];
        last[..rem.len()].copy_from_slice(rem);
        engine.feed_word(u32::from_le_bytes(last));
    }
    engine.value()
}

/// CRC-32 over a byte slice with the software engine. This is the
/// reference for every stored CRC field.
pub fn crc32_bytes(data: &[u8]) -> u32 {
    crc32_bytes_with(&mut SoftCrc32::new(), data)
}

/// An incremental CRC-32 over a byte stream, for the runtime image check.
///
/// Feeding a stream in arbitrary block sizes produces the same value as
/// [`crc32_bytes`] over the concatenation, provided every intermediate
/// block length is a multiple of four (the caller controls block size, so
/// this holds by construction for the 4 KiB image blocks).
pub struct Crc32Digest {
    engine: SoftCrc32,
}

impl Crc32Digest {
    pub fn new() -> Self {
        let mut engine = SoftCrc32::new();
        engine.reset();
        Self { engine }
    }

    pub fn update(&mut self, block: &[u8]) {
        debug_assert_eq!(block.len() % 4, 0);
        for chunk in block.chunks_exact(4) {
            self.engine
                .feed_word(u32::from_le_bytes(chunk.try_into().unwrap()));
        }
    }

    pub fn value(&self) -> u32 {
        self.engine.value()
    }
}

impl Default for Crc32Digest {
    fn default() -> Self {
        Self::new()
    }
}

/// CRC-16 over a byte slice.
pub fn crc16_bytes(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_mpeg2_reference() {
        // The soft engine fed little-endian words must agree with the crc
        // crate's CRC-32/MPEG-2 over the equivalent big-endian byte order.
        let words = [0x1234_5678u32, 0x9ABC_DEF0, 0x0000_0001];
        let mut engine = SoftCrc32::new();
        let ours = engine.words(&words);

        let mut digest = CRC32.digest();
        for w in words {
            digest.update(&w.to_be_bytes());
        }
        assert_eq!(ours, digest.finalize());
    }

    #[test]
    fn byte_and_word_views_agree() {
        let words = [0xDEAD_BEEFu32, 0x0BAD_F00D];
        let mut bytes = Vec::new();
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        let mut engine = SoftCrc32::new();
        assert_eq!(crc32_bytes(&bytes), engine.words(&words));
    }

    #[test]
    fn trailing_bytes_pad_with_ff() {
        // A 5-byte input hashes like the same input completed to 8 bytes
        // with erased-flash padding.
        let short = [0x11u8, 0x22, 0x33, 0x44, 0x55];
        let padded = [0x11u8, 0x22, 0x33, 0x44, 0x55, 0xFF, 0xFF, 0xFF];
        assert_eq!(crc32_bytes(&short), crc32_bytes(&padded));
    }

    #[test]
    fn incremental_equals_single_pass() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
        let whole = crc32_bytes(&data);

        for block in [4usize, 64, 256, 1000 * 4] {
            let mut digest = Crc32Digest::new();
            for chunk in data.chunks(block) {
                digest.update(chunk);
            }
            assert_eq!(digest.value(), whole, "block size {block}");
        }
    }

    #[test]
    fn crc_detects_single_byte_corruption() {
        let mut data: Vec<u8> = (0u8..=255).collect();
        let good = crc32_bytes(&data);
        data[17] ^= 0x01;
        assert_ne!(crc32_bytes(&data), good);
    }

    #[test]
    fn crc16_known_vector() {
        // "123456789" under CRC-16/CCITT-FALSE.
        assert_eq!(crc16_bytes(b"123456789"), 0x29B1);
    }
}
