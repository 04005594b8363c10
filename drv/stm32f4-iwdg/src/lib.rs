// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the STM32F4 independent watchdog (IWDG).
//!
//! The IWDG runs from its own low-speed oscillator, so it keeps counting
//! through core clock failures, which is the point. Once started it can
//! never be stopped; the only way out is reset.
//!
//! With the 32 kHz LSI, prescaler /64 and reload 500 give a nominal
//! 1 second timeout against the 500 ms feed period.

#![no_std]

use stm32f4::stm32f407 as device;

const KEY_ACCESS: u32 = 0x5555;
const KEY_START: u32 = 0xCCCC;
const KEY_FEED: u32 = 0xAAAA;

/// Prescaler register value for divide-by-64.
const PRESCALER_DIV64: u32 = 0b100;
const RELOAD: u32 = 500;

pub struct Iwdg {
    regs: &'static device::iwdg::RegisterBlock,
}

impl Iwdg {
    /// # Safety
    ///
    /// The caller must ensure no other `Iwdg` exists.
    pub unsafe fn new() -> Self {
        Self {
            regs: &*device::IWDG::ptr(),
        }
    }

    /// Configures and starts the countdown. Irreversible.
    pub fn start(&mut self) {
        self.regs.kr.write(|w| unsafe { w.bits(KEY_ACCESS) });
        self.regs.pr.write(|w| unsafe { w.bits(PRESCALER_DIV64) });
        self.regs.rlr.write(|w| unsafe { w.bits(RELOAD) });
        self.regs.kr.write(|w| unsafe { w.bits(KEY_START) });
        self.feed_now();
    }

    fn feed_now(&mut self) {
        self.regs.kr.write(|w| unsafe { w.bits(KEY_FEED) });
    }
}

impl liveness::Watchdog for Iwdg {
    fn feed(&mut self) {
        self.feed_now();
    }
}
