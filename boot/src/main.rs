// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot stage for the STM32F407 safety firmware.
//!
//! This binary wires the `bootcore` sequencer to the real hardware: the
//! clock tree, the flash controller, the hardware CRC unit, the factory
//! mailbox in CCM RAM, and finally the hand-off jump. All decisions live
//! in `bootcore`; everything here either reads a register or executes a
//! terminal action the sequencer decided on.
//!
//! Terminal actions:
//! - `JumpToApp`: arm the independent watchdog, apply the protective MPU
//!   region table, and transfer control to the application, never to
//!   return.
//! - `ResetAfterFactory`: processor reset, so the next boot re-runs the
//!   whole sequence from a clean slate.
//! - `Safe`: interrupts off, park. Recovery is a power cycle or a
//!   debugger.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod run {
    extern crate panic_halt;

    use cortex_m_rt::entry;

    use abi::map;
    use bootcore::factory::{FactoryEnv, FactorySession, SessionOutcome};
    use bootcore::image::ImageInfo;
    use bootcore::{BootEnv, BootOutcome, BootSequencer};
    use calstore::StoreError;
    use drv_stm32f4_crc::HwCrc32;
    use drv_stm32f4_flash::ConfigSector;
    use drv_stm32f4_iwdg::Iwdg;
    use selftest::SelfTestError;

    use crate::clock;
    use crate::jump;
    use crate::mailbox::HwMailbox;

    /// Boot-reserved scratch RAM for the startup march test, kept out of
    /// the boot stage's own data by the linker script.
    fn ram_test_region() -> &'static mut [u32] {
        // Safety: the linker reserves this window; nothing else in the
        // boot stage references it.
        unsafe {
            core::slice::from_raw_parts_mut(
                map::RAM_TEST_START as *mut u32,
                map::RAM_TEST_SIZE as usize / 4,
            )
        }
    }

    fn app_region() -> &'static [u8] {
        // Safety: fixed flash addresses; flash is always mapped.
        unsafe {
            core::slice::from_raw_parts(
                map::APP_FLASH_START as *const u8,
                map::APP_FLASH_SIZE as usize,
            )
        }
    }

    fn boot_region() -> &'static [u8] {
        // Safety: as above.
        unsafe {
            core::slice::from_raw_parts(
                map::BOOT_FLASH_START as *const u8,
                map::BOOT_FLASH_SIZE as usize,
            )
        }
    }

    fn debugger_attached() -> bool {
        const DHCSR_C_DEBUGEN: u32 = 1 << 0;
        let dcb = unsafe { &*cortex_m::peripheral::DCB::PTR };
        dcb.dhcsr.read() & DHCSR_C_DEBUGEN != 0
    }

    struct HwEnv {
        flash: ConfigSector,
        crc: HwCrc32,
        iwdg: Iwdg,
    }

    impl BootEnv for HwEnv {
        type Flash = ConfigSector;

        fn flash(&mut self) -> &mut ConfigSector {
            &mut self.flash
        }

        fn run_selftest(&mut self) -> Result<(), SelfTestError> {
            selftest::run_cpu()?;
            selftest::run_ram(ram_test_region())?;
            // The boot image carries its own trailing CRC; this one goes
            // through the hardware unit.
            let (payload, expected) = selftest::split_image(boot_region());
            let computed = integrity::crc32_bytes_with(&mut self.crc, payload);
            if computed != expected {
                return Err(SelfTestError::FlashCrc { computed, expected });
            }
            selftest::run_clock(clock::sysclk_hz())
        }

        fn app_vectors(&self) -> ImageInfo {
            let vectors = map::APP_FLASH_START as *const u32;
            // Safety: fixed, always-mapped flash addresses.
            unsafe {
                ImageInfo {
                    initial_sp: core::ptr::read_volatile(vectors),
                    entry: core::ptr::read_volatile(vectors.add(1)),
                }
            }
        }

        fn app_image(&self) -> (&[u8], u32) {
            selftest::split_image(app_region())
        }

        fn run_factory_session(&mut self) -> SessionOutcome {
            let mut mailbox = HwMailbox::new();
            let mut env = HwFactoryEnv {
                flash: &mut self.flash,
                iwdg: &mut self.iwdg,
            };
            FactorySession::new().run(&mut env, &mut mailbox)
        }
    }

    struct HwFactoryEnv<'a> {
        flash: &'a mut ConfigSector,
        iwdg: &'a mut Iwdg,
    }

    impl FactoryEnv for HwFactoryEnv<'_> {
        fn debugger_attached(&self) -> bool {
            debugger_attached()
        }

        fn feed_watchdog(&mut self) {
            // Harmless before the dog is started; mandatory afterwards.
            use liveness::Watchdog;
            self.iwdg.feed();
        }

        fn read_params(&mut self) -> Result<abi::SafetyParams, StoreError> {
            calstore::read_params(self.flash)
        }

        fn write_params(
            &mut self,
            record: &abi::SafetyParams,
        ) -> Result<(), StoreError> {
            calstore::write_params(self.flash, record)
        }

        fn mark_cal_valid(&mut self) -> Result<(), StoreError> {
            let mut cfg = match calstore::read_boot_config(self.flash) {
                Ok(cfg) => cfg,
                Err(StoreError::NotProvisioned) => abi::BootConfig::blank(),
                Err(e) => return Err(e),
            };
            cfg.cal_valid = 1;
            calstore::write_boot_config(self.flash, &mut cfg)
        }
    }

    #[entry]
    fn main() -> ! {
        // Clock bring-up failure is a safe-state condition all of its
        // own; nothing else can be trusted below a working clock tree.
        if clock::configure().is_err() {
            safe_halt();
        }
        clock::enable_crc_clock();

        // Safety: sole constructions; this is the only code running.
        let mut env = HwEnv {
            flash: unsafe { ConfigSector::new() },
            crc: unsafe { HwCrc32::new() },
            iwdg: unsafe { Iwdg::new() },
        };

        let mut sequencer = BootSequencer::new();
        match sequencer.run(&mut env) {
            BootOutcome::JumpToApp(vectors) => {
                // The application runs under the protective region table
                // from its first instruction. A table the hardware
                // rejects is a safe-state condition, not something to
                // shrug off.
                if drv_armv7m_mpu::hw::apply_regions(
                    &drv_armv7m_mpu::DEFAULT_REGIONS,
                )
                .is_err()
                {
                    safe_halt();
                }
                drv_armv7m_mpu::hw::enable();

                // Arm the dog last; the application's monitor takes over
                // feeding within its first cycle.
                env.iwdg.start();

                jump::launch(vectors);
            }
            BootOutcome::ResetAfterFactory => {
                cortex_m::peripheral::SCB::sys_reset();
            }
            BootOutcome::Safe(_error) => safe_halt(),
        }
    }

    /// Boot-stage safe state: interrupts off, core parked. There are no
    /// outputs to drive this early, so the defined safe condition is
    /// simply "do nothing, forever".
    fn safe_halt() -> ! {
        cortex_m::interrupt::disable();
        loop {
            cortex_m::asm::wfi();
        }
    }

}

#[cfg(target_os = "none")]
mod clock;
#[cfg(target_os = "none")]
mod jump;
#[cfg(target_os = "none")]
mod mailbox;

// The boot stage is hardware-only; a host build produces an inert stub so
// workspace-wide builds and test runs stay green.
#[cfg(not(target_os = "none"))]
fn main() {}
