// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the STM32F4 embedded flash controller, scoped to the
//! config sector.
//!
//! Implements [`calstore::ConfigFlash`] over sector 3, the 16 KiB
//! calibration sector between the boot and application images. Erase and
//! program operations unlock the controller, do their work with the
//! busy-flag wait bounded by an explicit iteration budget, and re-lock on
//! every exit path. A wait that exceeds its budget surfaces as
//! [`FlashError::Timeout`] rather than hanging the safety path.
//!
//! Reads go straight through the memory bus; the controller is only
//! involved for mutation.

#![no_std]

use calstore::{ConfigFlash, FlashError};
use ringbuf::{ringbuf, ringbuf_entry};
use stm32f4::stm32f407 as device;

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

const SR_BSY: u32 = 1 << 16;
/// Program/erase sequence, parallelism, alignment, and write-protection
/// error bits, cleared by writing them back.
const SR_ERRORS: u32 = (1 << 7) | (1 << 6) | (1 << 5) | (1 << 4) | (1 << 1);

const CR_PG: u32 = 1 << 0;
const CR_SER: u32 = 1 << 1;
const CR_SNB_SHIFT: u32 = 3;
/// Program parallelism x32 (the supply is 3.3 V).
const CR_PSIZE_X32: u32 = 0b10 << 8;
const CR_STRT: u32 = 1 << 16;
const CR_LOCK: u32 = 1 << 31;

/// Iteration budget for the busy wait. A sector erase takes on the order
/// of a second; this bounds it at roughly four.
const BUSY_BUDGET: u32 = 40_000_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    None,
    EraseStart,
    EraseDone,
    Program { offset: u32, len: usize },
    Timeout,
    ControllerError { sr: u32 },
}

ringbuf!(Trace, 16, Trace::None);

pub struct ConfigSector {
    regs: &'static device::flash::RegisterBlock,
}

impl ConfigSector {
    /// # Safety
    ///
    /// The caller must ensure no other `ConfigSector` exists; the flash
    /// controller has a single command interface.
    pub unsafe fn new() -> Self {
        Self {
            regs: &*device::FLASH::ptr(),
        }
    }

    fn unlock(&mut self) {
        if self.regs.cr.read().bits() & CR_LOCK != 0 {
            self.regs.keyr.write(|w| unsafe { w.bits(KEY1) });
            self.regs.keyr.write(|w| unsafe { w.bits(KEY2) });
        }
    }

    fn lock(&mut self) {
        self.regs
            .cr
            .modify(|r, w| unsafe { w.bits(r.bits() | CR_LOCK) });
    }

    fn wait_not_busy(&mut self) -> Result<(), FlashError> {
        for _ in 0..BUSY_BUDGET {
            if self.regs.sr.read().bits() & SR_BSY == 0 {
                return Ok(());
            }
        }
        ringbuf_entry!(Trace::Timeout);
        Err(FlashError::Timeout)
    }

    fn check_and_clear_errors(&mut self) -> Result<(), FlashError> {
        let sr = self.regs.sr.read().bits();
        if sr & SR_ERRORS != 0 {
            ringbuf_entry!(Trace::ControllerError { sr });
            self.regs.sr.write(|w| unsafe { w.bits(sr & SR_ERRORS) });
            return Err(FlashError::Hardware);
        }
        Ok(())
    }
}

impl ConfigFlash for ConfigSector {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let len = buf.len() as u32;
        if offset.checked_add(len).map_or(true, |end| {
            end > abi::map::CONFIG_FLASH_SIZE
        }) {
            return Err(FlashError::Bounds);
        }
        let base = (abi::map::CONFIG_FLASH_START + offset) as *const u8;
        for (i, byte) in buf.iter_mut().enumerate() {
            // Safety: bounds-checked against the config region above.
            *byte = unsafe { core::ptr::read_volatile(base.add(i)) };
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<(), FlashError> {
        ringbuf_entry!(Trace::EraseStart);
        // A half-erased sector must never be observable from an
        // interrupt handler; the whole operation is one critical
        // section.
        let result = cortex_m::interrupt::free(|_| {
            self.unlock();
            let result = (|| {
                self.wait_not_busy()?;
                self.regs.cr.write(|w| unsafe {
                    w.bits(
                        CR_SER
                            | u32::from(abi::map::CONFIG_FLASH_SECTOR)
                                << CR_SNB_SHIFT
                            | CR_PSIZE_X32,
                    )
                });
                self.regs.cr.modify(|r, w| unsafe {
                    w.bits(r.bits() | CR_STRT)
                });
                self.wait_not_busy()?;
                self.check_and_clear_errors()
            })();
            self.regs.cr.write(|w| unsafe { w.bits(0) });
            self.lock();
            result
        });
        cortex_m::asm::dsb();
        if result.is_ok() {
            ringbuf_entry!(Trace::EraseDone);
        }
        result
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        // Word-granular programming only; the persisted records are all
        // word-sized and word-aligned.
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(FlashError::Bounds);
        }
        let len = data.len() as u32;
        if offset.checked_add(len).map_or(true, |end| {
            end > abi::map::CONFIG_FLASH_SIZE
        }) {
            return Err(FlashError::Bounds);
        }
        ringbuf_entry!(Trace::Program {
            offset,
            len: data.len()
        });

        // Same critical-section rule as erase: no partially programmed
        // word is ever visible to preempting code.
        let result = cortex_m::interrupt::free(|_| {
            self.unlock();
            let result = (|| {
                self.wait_not_busy()?;
                self.regs
                    .cr
                    .write(|w| unsafe { w.bits(CR_PG | CR_PSIZE_X32) });

                let base = (abi::map::CONFIG_FLASH_START + offset) as *mut u32;
                for (i, chunk) in data.chunks_exact(4).enumerate() {
                    let word =
                        u32::from_le_bytes(chunk.try_into().unwrap_or([0; 4]));
                    // Safety: bounds-checked against the config region,
                    // and the controller is in programming mode.
                    unsafe {
                        core::ptr::write_volatile(base.add(i), word);
                    }
                    self.wait_not_busy()?;
                    self.check_and_clear_errors()?;
                }
                Ok(())
            })();
            self.regs.cr.write(|w| unsafe { w.bits(0) });
            self.lock();
            result
        });
        cortex_m::asm::dsb();
        result
    }
}
