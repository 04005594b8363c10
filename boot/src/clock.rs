// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clock tree bring-up and measurement.
//!
//! Brings the system to 168 MHz from the 8 MHz external crystal:
//! HSE -> PLL (M=8, N=336, P=2) -> SYSCLK, with five flash wait states
//! and the AHB/APB dividers the peripherals expect. Every oscillator and
//! lock wait is bounded by an iteration budget; a crystal that never
//! stabilizes becomes a typed error instead of a hang.
//!
//! `sysclk_hz` recomputes the actual frequency from the register state
//! rather than reporting the constant we tried to program, which is what
//! makes the clock self-test a real check.

use stm32f4::stm32f407 as device;

/// External crystal frequency.
const HSE_HZ: u32 = 8_000_000;
/// Internal RC oscillator frequency, the reset-default clock.
const HSI_HZ: u32 = 16_000_000;

const PLL_M: u32 = 8;
const PLL_N: u32 = 336;
const PLL_P: u32 = 2;
const PLL_Q: u32 = 7;

/// Iteration budget for oscillator/lock waits (tens of ms at boot clock).
const READY_BUDGET: u32 = 500_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClockError {
    HseTimeout,
    PllTimeout,
    SwitchTimeout,
}

fn rcc() -> &'static device::rcc::RegisterBlock {
    unsafe { &*device::RCC::ptr() }
}

fn wait(mut ready: impl FnMut() -> bool, error: ClockError) -> Result<(), ClockError> {
    for _ in 0..READY_BUDGET {
        if ready() {
            return Ok(());
        }
    }
    Err(error)
}

/// Configures the 168 MHz clock tree. Called once, before anything that
/// cares about timing.
pub fn configure() -> Result<(), ClockError> {
    let rcc = rcc();

    // Power interface on, regulator at scale 1 for 168 MHz.
    rcc.apb1enr.modify(|_, w| w.pwren().set_bit());
    let pwr = unsafe { &*device::PWR::ptr() };
    pwr.cr.modify(|_, w| w.vos().set_bit());

    // External crystal.
    rcc.cr.modify(|_, w| w.hseon().set_bit());
    wait(|| rcc.cr.read().hserdy().bit_is_set(), ClockError::HseTimeout)?;

    // PLL: 8 MHz / M * N / P = 168 MHz; /Q = 48 MHz for the USB domain.
    rcc.pllcfgr.write(|w| unsafe {
        w.pllsrc()
            .set_bit()
            .pllm()
            .bits(PLL_M as u8)
            .plln()
            .bits(PLL_N as u16)
            .pllp()
            .bits(((PLL_P / 2) - 1) as u8)
            .pllq()
            .bits(PLL_Q as u8)
    });
    rcc.cr.modify(|_, w| w.pllon().set_bit());
    wait(|| rcc.cr.read().pllrdy().bit_is_set(), ClockError::PllTimeout)?;

    // Five wait states before raising the core clock.
    let flash = unsafe { &*device::FLASH::ptr() };
    flash.acr.modify(|_, w| unsafe { w.latency().bits(5) });

    // AHB /1, APB1 /4, APB2 /2, then switch SYSCLK to the PLL.
    rcc.cfgr.modify(|_, w| unsafe {
        w.hpre().bits(0b0000).ppre1().bits(0b101).ppre2().bits(0b100)
    });
    rcc.cfgr.modify(|_, w| unsafe { w.sw().bits(0b10) });
    wait(
        || rcc.cfgr.read().sws().bits() == 0b10,
        ClockError::SwitchTimeout,
    )
}

/// Enables the clock to the hardware CRC unit.
pub fn enable_crc_clock() {
    rcc().ahb1enr.modify(|_, w| w.crcen().set_bit());
}

/// Computes the current SYSCLK from the register state.
pub fn sysclk_hz() -> u32 {
    let rcc = rcc();
    match rcc.cfgr.read().sws().bits() {
        0b00 => HSI_HZ,
        0b01 => HSE_HZ,
        0b10 => {
            let pllcfgr = rcc.pllcfgr.read();
            let m = u32::from(pllcfgr.pllm().bits()).max(1);
            let n = u32::from(pllcfgr.plln().bits());
            let p = (u32::from(pllcfgr.pllp().bits()) + 1) * 2;
            let source = if pllcfgr.pllsrc().bit_is_set() {
                HSE_HZ
            } else {
                HSI_HZ
            };
            source / m * n / p
        }
        _ => 0,
    }
}
