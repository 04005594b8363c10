// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MPU register access.
//!
//! Configuration writes run inside an interrupt-free critical section: a
//! partially applied region table is not an acceptable state for an
//! interrupt handler to observe. Every mutation ends with DSB + ISB, the
//! sequence the architecture requires before the new mapping is
//! guaranteed to apply to subsequent accesses.

use cortex_m::peripheral::mpu::RegisterBlock;
use cortex_m::peripheral::MPU;

use crate::{
    encode_rasr, encode_rbar, validate_table, MpuError, RegionConfig,
};

const CTRL_ENABLE: u32 = 1 << 0;
const CTRL_PRIVDEFENA: u32 = 1 << 2;
const SHCSR_MEMFAULTENA: u32 = 1 << 16;

fn mpu() -> &'static RegisterBlock {
    // Shared reference only; all writes below go through the VolatileCell
    // API, so no aliasing is violated by conjuring this.
    unsafe { &*MPU::PTR }
}

/// Reports whether the hardware implements any MPU regions at all.
pub fn is_present() -> bool {
    let dregion = (mpu()._type.read() >> 8) & 0xFF;
    dregion != 0
}

/// Validates and applies a region table in region-index order.
pub fn apply_regions(regions: &[RegionConfig]) -> Result<(), MpuError> {
    if !is_present() {
        return Err(MpuError::NotPresent);
    }
    validate_table(regions)?;

    cortex_m::interrupt::free(|_| {
        for config in regions {
            unsafe {
                mpu().rnr.write(u32::from(config.region_number));
                mpu().rbar.write(encode_rbar(config));
                mpu().rasr.write(encode_rasr(config));
            }
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    });
    Ok(())
}

/// Enables enforcement with the privileged default map as background
/// region, and unmasks the MemManage fault so violations are reported
/// rather than escalated to hard fault.
pub fn enable() {
    cortex_m::interrupt::free(|_| {
        unsafe {
            mpu().ctrl.write(CTRL_ENABLE | CTRL_PRIVDEFENA);
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();

        // Safety: read-modify-write of SHCSR with interrupts masked.
        unsafe {
            let scb = &*cortex_m::peripheral::SCB::PTR;
            scb.shcsr.modify(|v| v | SHCSR_MEMFAULTENA);
        }
    });
}

/// Disables enforcement. The default memory map applies afterwards.
pub fn disable() {
    cortex_m::interrupt::free(|_| {
        cortex_m::asm::dmb();
        unsafe {
            mpu().ctrl.write(0);
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    });
}

pub fn is_enabled() -> bool {
    mpu().ctrl.read() & CTRL_ENABLE != 0
}

/// Reads back one region's raw RBAR/RASR pair for audit.
pub fn read_region(region_number: u8) -> Result<(u32, u32), MpuError> {
    if region_number >= crate::NUM_REGIONS {
        return Err(MpuError::BadRegionNumber);
    }
    cortex_m::interrupt::free(|_| {
        unsafe {
            mpu().rnr.write(u32::from(region_number));
        }
        Ok((mpu().rbar.read(), mpu().rasr.read()))
    })
}
