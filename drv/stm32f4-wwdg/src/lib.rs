// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the STM32F4 window watchdog (WWDG).
//!
//! The second, windowed dog of the dual-watchdog configuration: the
//! counter must be refreshed after it drops below the window value and
//! before it reaches 0x40, or the hardware resets the system. Refreshing
//! too early is itself a reset, which catches runaway loops that feed
//! blindly.
//!
//! The early-wakeup interrupt fires at 0x40, one counter tick before
//! reset, and is the last chance to log the failure. The WWDG clock
//! (APB1ENR bit 11) must be enabled before construction.

#![no_std]

use stm32f4::stm32f407 as device;

const CR_WDGA: u32 = 1 << 7;
/// Refresh value: top counter bit set, full count.
const COUNTER_RELOAD: u32 = 0x7F;
/// Open the refresh window at half the count range.
const WINDOW: u32 = 0x5F;
const CFR_EWI: u32 = 1 << 9;
/// Prescaler /8 for the slowest countdown available.
const CFR_WDGTB_DIV8: u32 = 0b11 << 7;

pub struct Wwdg {
    regs: &'static device::wwdg::RegisterBlock,
}

impl Wwdg {
    /// # Safety
    ///
    /// The caller must ensure the WWDG clock is enabled and that no
    /// other `Wwdg` exists.
    pub unsafe fn new() -> Self {
        Self {
            regs: &*device::WWDG::ptr(),
        }
    }

    /// Arms the window watchdog with the early-wakeup interrupt enabled.
    /// Irreversible short of a reset.
    pub fn start(&mut self) {
        self.regs
            .cfr
            .write(|w| unsafe { w.bits(CFR_WDGTB_DIV8 | CFR_EWI | WINDOW) });
        self.regs
            .cr
            .write(|w| unsafe { w.bits(CR_WDGA | COUNTER_RELOAD) });
    }

    pub fn early_wakeup_pending(&self) -> bool {
        self.regs.sr.read().bits() & 1 != 0
    }

    pub fn clear_early_wakeup(&mut self) {
        self.regs.sr.write(|w| unsafe { w.bits(0) });
    }
}

impl liveness::Watchdog for Wwdg {
    fn feed(&mut self) {
        self.regs
            .cr
            .write(|w| unsafe { w.bits(CR_WDGA | COUNTER_RELOAD) });
    }
}
