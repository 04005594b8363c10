// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the STM32F4 hardware CRC unit.
//!
//! The unit computes CRC-32/MPEG-2 over a stream of 32-bit words, which
//! is exactly the algorithm `integrity` defines in software; the two are
//! interchangeable behind [`integrity::Crc32Engine`]. The peripheral
//! clock (AHB1ENR bit 12) must be enabled before construction.
//!
//! The unit is a single shared resource with one accumulator; the owner
//! of a [`HwCrc32`] value holds exclusive use of it by construction.

#![no_std]

use integrity::Crc32Engine;
use stm32f4::stm32f407 as device;

pub struct HwCrc32 {
    regs: &'static device::crc::RegisterBlock,
}

impl HwCrc32 {
    /// # Safety
    ///
    /// The caller must ensure the CRC clock is enabled and that no other
    /// `HwCrc32` exists.
    pub unsafe fn new() -> Self {
        Self {
            regs: &*device::CRC::ptr(),
        }
    }
}

impl Crc32Engine for HwCrc32 {
    fn reset(&mut self) {
        // CR bit 0 resets the accumulator to 0xFFFFFFFF.
        self.regs.cr.write(|w| unsafe { w.bits(1) });
    }

    fn feed_word(&mut self, word: u32) {
        self.regs.dr.write(|w| unsafe { w.bits(word) });
    }

    fn value(&self) -> u32 {
        self.regs.dr.read().bits()
    }
}
