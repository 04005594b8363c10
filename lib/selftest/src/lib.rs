// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processor, memory, image, and clock self-tests.
//!
//! Startup mode runs everything to completion and fails fast on the first
//! failing test: CPU pattern test, non-destructive RAM march test,
//! full-image flash CRC, clock tolerance. Runtime mode replaces the full
//! image CRC with [`FlashCrcCheck`], which carries its digest across
//! monitor cycles and hashes one bounded block per call so the check never
//! monopolizes the highest-priority thread.
//!
//! The CPU test is a simplified pattern test. A certified deployment
//! replaces it with a qualified core self-test library executing the
//! documented assembly sequences; nothing here claims that coverage.

#![cfg_attr(not(test), no_std)]

use integrity::Crc32Digest;

/// Self-test failure, carrying enough context for the error log params.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SelfTestError {
    Cpu,
    /// March test mismatch at the given word index.
    Ram { index: usize },
    FlashCrc { computed: u32, expected: u32 },
    Clock { measured_hz: u32 },
}

/// CPU register/datapath pattern test.
pub fn run_cpu() -> Result<(), SelfTestError> {
    // The volatile round-trips keep the compiler from folding the
    // comparisons away.
    let mut cell: u32 = 0;
    let slot = core::ptr::addr_of_mut!(cell);

    for pattern in [0xAAAA_AAAAu32, 0x5555_5555] {
        unsafe {
            core::ptr::write_volatile(slot, pattern);
            if core::ptr::read_volatile(slot) != pattern {
                return Err(SelfTestError::Cpu);
            }
        }
    }

    // Walking ones across the word.
    for bit in 0..32 {
        let pattern = 1u32 << bit;
        unsafe {
            core::ptr::write_volatile(slot, pattern);
            if core::ptr::read_volatile(slot) != pattern {
                return Err(SelfTestError::Cpu);
            }
        }
    }

    Ok(())
}

/// Number of words the march test exercises (and must save).
const MARCH_WORDS: usize = 256;

/// Non-destructive six-phase march test over the leading portion of
/// `region` (up to [`MARCH_WORDS`] words).
///
/// Phases: write 0 ascending; read 0 / write 1 ascending; read 1 / write 0
/// ascending; read 0 / write 1 descending; read 1 / write 0 descending;
/// final read 0. Original contents are restored on success and on every
/// failure path.
pub fn run_ram(region: &mut [u32]) -> Result<(), SelfTestError> {
    let count = region.len().min(MARCH_WORDS);
    let region = &mut region[..count];

    let mut saved = [0u32; MARCH_WORDS];
    saved[..count].copy_from_slice(region);

    let result = march(region);

    region.copy_from_slice(&saved[..count]);
    result
}

fn march(r: &mut [u32]) -> Result<(), SelfTestError> {
    let n = r.len();

    for w in r.iter_mut() {
        write_cell(w, 0);
    }
    for i in 0..n {
        if read_cell(&r[i]) != 0 {
            return Err(SelfTestError::Ram { index: i });
        }
        write_cell(&mut r[i], !0);
    }
    for i in 0..n {
        if read_cell(&r[i]) != !0 {
            return Err(SelfTestError::Ram { index: i });
        }
        write_cell(&mut r[i], 0);
    }
    for i in (0..n).rev() {
        if read_cell(&r[i]) != 0 {
            return Err(SelfTestError::Ram { index: i });
        }
        write_cell(&mut r[i], !0);
    }
    for i in (0..n).rev() {
        if read_cell(&r[i]) != !0 {
            return Err(SelfTestError::Ram { index: i });
        }
        write_cell(&mut r[i], 0);
    }
    for i in 0..n {
        if read_cell(&r[i]) != 0 {
            return Err(SelfTestError::Ram { index: i });
        }
    }

    Ok(())
}

// Volatile accessors so the march sequence actually touches memory in
// order instead of being collapsed by the optimizer.
fn write_cell(cell: &mut u32, value: u32) {
    unsafe { core::ptr::write_volatile(cell, value) }
}

fn read_cell(cell: &u32) -> u32 {
    unsafe { core::ptr::read_volatile(cell) }
}

/// Splits a raw image region into its payload and the trailing stored CRC
/// word.
pub fn split_image(image_with_crc: &[u8]) -> (&[u8], u32) {
    let (payload, tail) = image_with_crc.split_at(image_with_crc.len() - 4);
    let expected = u32::from_le_bytes(tail.try_into().unwrap_or([0; 4]));
    (payload, expected)
}

/// Single-pass image CRC comparison, used at startup and by the boot
/// stage.
pub fn check_flash_crc(payload: &[u8], expected: u32) -> Result<(), SelfTestError> {
    let computed = integrity::crc32_bytes(payload);
    if computed != expected {
        return Err(SelfTestError::FlashCrc { computed, expected });
    }
    Ok(())
}

/// Progress of the incremental image check.
#[derive(Copy, Clone, Debug, PartialEq)]
#[must_use]
pub enum CrcProgress {
    /// More image remains; `offset` bytes hashed so far.
    InProgress { offset: usize },
    /// The whole image has been hashed and compared.
    Done(Result<(), SelfTestError>),
}

/// Incremental flash CRC state, persisted across monitor cycles.
///
/// The digest is a true continuation, so the final value is identical to
/// the single-pass computation over the same bytes.
pub struct FlashCrcCheck {
    offset: usize,
    digest: Crc32Digest,
    block_size: usize,
}

impl FlashCrcCheck {
    pub fn new() -> Self {
        Self::with_block_size(abi::FLASH_CRC_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        debug_assert!(block_size % 4 == 0 && block_size != 0);
        Self {
            offset: 0,
            digest: Crc32Digest::new(),
            block_size,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Hashes the next block of `payload`. Returns `Done` once the final
    /// block has been folded in and compared against `expected`.
    pub fn step(&mut self, payload: &[u8], expected: u32) -> CrcProgress {
        let remaining = payload.len() - self.offset;
        let take = remaining.min(self.block_size);
        if take > 0 {
            self.digest
                .update(&payload[self.offset..self.offset + take]);
            self.offset += take;
        }

        if self.offset < payload.len() {
            return CrcProgress::InProgress {
                offset: self.offset,
            };
        }

        let computed = self.digest.value();
        CrcProgress::Done(if computed == expected {
            Ok(())
        } else {
            Err(SelfTestError::FlashCrc { computed, expected })
        })
    }
}

impl Default for FlashCrcCheck {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock-frequency tolerance check against the expected system clock.
pub fn run_clock(measured_hz: u32) -> Result<(), SelfTestError> {
    let expected = abi::EXPECTED_SYSCLK_HZ as u64;
    let tolerance = abi::CLOCK_TOLERANCE_PERCENT as u64;
    let min = expected * (100 - tolerance) / 100;
    let max = expected * (100 + tolerance) / 100;
    let measured = measured_hz as u64;
    if measured < min || measured > max {
        return Err(SelfTestError::Clock { measured_hz });
    }
    Ok(())
}

/// Full startup sequence, failing fast in test order.
pub fn run_startup(
    ram_region: &mut [u32],
    image_payload: &[u8],
    expected_crc: u32,
    measured_hz: u32,
) -> Result<(), SelfTestError> {
    run_cpu()?;
    run_ram(ram_region)?;
    check_flash_crc(image_payload, expected_crc)?;
    run_clock(measured_hz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_test_passes_on_working_hardware() {
        assert_eq!(run_cpu(), Ok(()));
    }

    #[test]
    fn ram_test_passes_and_restores_contents() {
        let original: Vec<u32> = (0..300u32).map(|i| i.wrapping_mul(2654435761)).collect();
        let mut region = original.clone();
        assert_eq!(run_ram(&mut region), Ok(()));
        assert_eq!(region, original);
    }

    #[test]
    fn ram_test_handles_short_regions() {
        let mut region = [0xDEAD_BEEFu32; 7];
        assert_eq!(run_ram(&mut region), Ok(()));
        assert_eq!(region, [0xDEAD_BEEFu32; 7]);
    }

    fn build_image(len_words: usize) -> Vec<u8> {
        let mut image: Vec<u8> = (0..len_words as u32)
            .flat_map(|i| i.wrapping_mul(0x0101_0101).to_le_bytes())
            .collect();
        let crc = integrity::crc32_bytes(&image);
        image.extend_from_slice(&crc.to_le_bytes());
        image
    }

    #[test]
    fn full_image_crc_accepts_valid_image() {
        let image = build_image(1024);
        let (payload, expected) = split_image(&image);
        assert_eq!(check_flash_crc(payload, expected), Ok(()));
    }

    #[test]
    fn full_image_crc_rejects_corruption() {
        let mut image = build_image(1024);
        image[100] ^= 0x01;
        let (payload, expected) = split_image(&image);
        assert!(check_flash_crc(payload, expected).is_err());
    }

    #[test]
    fn incremental_matches_single_pass() {
        let image = build_image(5000);
        let (payload, expected) = split_image(&image);

        let mut check = FlashCrcCheck::with_block_size(4096);
        let mut steps = 0;
        let result = loop {
            steps += 1;
            match check.step(payload, expected) {
                CrcProgress::InProgress { .. } => continue,
                CrcProgress::Done(r) => break r,
            }
        };
        assert_eq!(result, Ok(()));
        // 5000 words = 20000 bytes, 4096-byte blocks -> 5 steps.
        assert_eq!(steps, 5);
    }

    #[test]
    fn incremental_detects_corruption() {
        let mut image = build_image(3000);
        image[4097] ^= 0x80;
        let (payload, expected) = split_image(&image);

        let mut check = FlashCrcCheck::new();
        let result = loop {
            match check.step(payload, expected) {
                CrcProgress::InProgress { .. } => continue,
                CrcProgress::Done(r) => break r,
            }
        };
        match result {
            Err(SelfTestError::FlashCrc { computed, .. }) => {
                assert_ne!(computed, expected);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn clock_tolerance_bounds() {
        assert_eq!(run_clock(168_000_000), Ok(()));
        assert_eq!(run_clock(160_000_000), Ok(()));
        assert_eq!(run_clock(176_000_000), Ok(()));
        assert!(run_clock(159_000_000).is_err());
        assert!(run_clock(177_000_000).is_err());
        assert!(run_clock(0).is_err());
    }

    #[test]
    fn startup_fails_fast_on_clock() {
        let image = build_image(64);
        let (payload, expected) = split_image(&image);
        let mut ram = [0u32; 16];
        assert_eq!(
            run_startup(&mut ram, payload, expected, 100_000_000),
            Err(SelfTestError::Clock {
                measured_hz: 100_000_000
            })
        );
    }
}
