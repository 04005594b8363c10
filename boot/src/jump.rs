// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot-to-application hand-off.
//!
//! By the time control reaches [`launch`], the image has been CRC-checked
//! and its vector-table head has passed the plausibility checks. What
//! remains is making the processor forget the boot stage ever ran, in a
//! fixed order with barriers between the steps that change interrupt
//! routing: global interrupt disable; every NVIC source disabled and its
//! pending bit cleared; SysTick stopped and its pending bit cleared; VTOR
//! moved to the application's vector table; then the stack switch and the
//! branch, which never return.

use bootcore::image::ImageInfo;

const NVIC_REGS: usize = 8;
const ICSR_PENDSTCLR: u32 = 1 << 25;

pub fn launch(vectors: ImageInfo) -> ! {
    cortex_m::interrupt::disable();

    unsafe {
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        for i in 0..NVIC_REGS {
            nvic.icer[i].write(0xFFFF_FFFF);
            nvic.icpr[i].write(0xFFFF_FFFF);
        }

        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.csr.write(0);
        syst.rvr.write(0);
        syst.cvr.write(0);

        let scb = &*cortex_m::peripheral::SCB::PTR;
        scb.icsr.write(ICSR_PENDSTCLR);
        scb.vtor.write(abi::map::APP_FLASH_START);
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    unsafe {
        cortex_m::register::msp::write(vectors.initial_sp);
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();

    unsafe {
        core::arch::asm!(
            "bx {entry}",
            entry = in(reg) vectors.entry,
            options(noreturn),
        );
    }
}
