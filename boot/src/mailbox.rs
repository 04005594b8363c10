// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The debugger-shared mailbox, mapped onto its fixed CCM RAM slots.
//!
//! The wire contract lives in `abi::factory`: one command word written by
//! the debugger and cleared by us, one response word written only by us,
//! and a data buffer holding exactly one calibration record. Every store
//! is followed by a DSB so the debugger, reading through the debug port,
//! never observes a half-published update.

use abi::{factory, SafetyParams};
use bootcore::factory::Mailbox;
use zerocopy_util::{read_record_volatile, write_record_volatile};

pub struct HwMailbox {
    _private: (),
}

impl HwMailbox {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Mailbox for HwMailbox {
    fn command(&self) -> u32 {
        // Safety: fixed, always-mapped RAM slot.
        unsafe { core::ptr::read_volatile(factory::CMD_ADDR as *const u32) }
    }

    fn clear_command(&mut self) {
        unsafe {
            core::ptr::write_volatile(
                factory::CMD_ADDR as *mut u32,
                factory::CMD_NONE,
            );
        }
        cortex_m::asm::dsb();
    }

    fn set_response(&mut self, response: u32) {
        unsafe {
            core::ptr::write_volatile(factory::RSP_ADDR as *mut u32, response);
        }
        cortex_m::asm::dsb();
    }

    fn read_record(&self) -> SafetyParams {
        unsafe { read_record_volatile(factory::DATA_ADDR as *const u8) }
    }

    fn write_record(&mut self, record: &SafetyParams) {
        unsafe {
            write_record_volatile(factory::DATA_ADDR as *mut u8, record);
        }
        cortex_m::asm::dsb();
    }
}

mod zerocopy_util {
    use abi::SafetyParams;
    use zerocopy::{FromBytes, IntoBytes};

    /// # Safety
    ///
    /// `src` must point at a readable record-sized region.
    pub unsafe fn read_record_volatile(src: *const u8) -> SafetyParams {
        let mut bytes = [0u8; abi::SAFETY_PARAMS_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = core::ptr::read_volatile(src.add(i));
        }
        SafetyParams::read_from_bytes(&bytes)
            .unwrap_or_else(|_| SafetyParams::defaults())
    }

    /// # Safety
    ///
    /// `dst` must point at a writable record-sized region.
    pub unsafe fn write_record_volatile(dst: *mut u8, record: &SafetyParams) {
        for (i, b) in record.as_bytes().iter().enumerate() {
            core::ptr::write_volatile(dst.add(i), *b);
        }
    }
}
