// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared safety ABI definitions.
//!
//! Everything that must agree between the boot stage and the running
//! application lives here: the flash memory map, the magic numbers and
//! persisted record layouts, the safety state and error taxonomies, the
//! watchdog token assignments, and the factory mailbox word values.
//!
//! The boot stage and the application are built separately and meet only
//! through flash contents and fixed RAM addresses, so changes to anything
//! in this crate are ABI breaks and need both images rebuilt.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub mod bits;

/// Flash and RAM layout for the STM32F407VG target.
///
/// The config sector sits between the boot image and the application image
/// so that neither image rewrite disturbs calibration data.
pub mod map {
    /// Boot stage flash (sectors 0-2).
    pub const BOOT_FLASH_START: u32 = 0x0800_0000;
    pub const BOOT_FLASH_SIZE: u32 = 0x0000_C000;
    pub const BOOT_FLASH_END: u32 = BOOT_FLASH_START + BOOT_FLASH_SIZE - 1;

    /// Config/calibration flash (sector 3, erased as one unit).
    pub const CONFIG_FLASH_START: u32 = 0x0800_C000;
    pub const CONFIG_FLASH_SIZE: u32 = 0x0000_4000;
    pub const CONFIG_FLASH_SECTOR: u8 = 3;

    /// Application flash (sectors 4-7). The last word holds the image CRC.
    pub const APP_FLASH_START: u32 = 0x0801_0000;
    pub const APP_FLASH_SIZE: u32 = 0x0007_0000;
    pub const APP_FLASH_END: u32 = APP_FLASH_START + APP_FLASH_SIZE - 1;
    pub const APP_CRC_ADDR: u32 = APP_FLASH_START + APP_FLASH_SIZE - 4;

    pub const RAM_START: u32 = 0x2000_0000;
    pub const RAM_SIZE: u32 = 0x0002_0000;
    pub const RAM_END: u32 = RAM_START + RAM_SIZE;

    /// Core-coupled RAM, used for thread stacks and the factory mailbox.
    pub const CCMRAM_START: u32 = 0x1000_0000;
    pub const CCMRAM_SIZE: u32 = 0x0001_0000;

    /// Subset of main RAM exercised by the startup march test.
    pub const RAM_TEST_START: u32 = 0x2001_8000;
    pub const RAM_TEST_SIZE: u32 = 0x0000_8000;

    pub const PERIPH_START: u32 = 0x4000_0000;
    pub const PERIPH_SIZE: u32 = 0x2000_0000;
}

/// Magic number marking a programmed `BootConfig` record.
pub const BOOT_CONFIG_MAGIC: u32 = 0xC0F1_6000;
/// Magic number marking a programmed `SafetyParams` record.
pub const SAFETY_PARAMS_MAGIC: u32 = 0xCA11_B000;
/// Magic number marking a programmed `NonSafetyParams` record.
pub const NONSAFETY_PARAMS_MAGIC: u32 = 0xEE9A_0000;
/// Current `SafetyParams` layout version.
pub const SAFETY_PARAMS_VERSION: u16 = 0x0100;

/// Expected system clock and the tolerance applied by the clock self-test.
pub const EXPECTED_SYSCLK_HZ: u32 = 168_000_000;
pub const CLOCK_TOLERANCE_PERCENT: u32 = 5;

/// Monitor thread period. All the periodic check intervals below are
/// multiples of this.
pub const SAFETY_MONITOR_PERIOD_MS: u64 = 100;
pub const STACK_CHECK_INTERVAL_MS: u64 = 100;
pub const FLOW_VERIFY_INTERVAL_MS: u64 = 1_000;
pub const FLASH_CRC_INTERVAL_MS: u64 = 300_000;
pub const PARAM_CHECK_INTERVAL_MS: u64 = 10_000;
pub const FLASH_CRC_BLOCK_SIZE: usize = 4_096;

/// Maximum residency in degraded mode before the system is forced safe.
pub const DEGRADED_TIMEOUT_MS: u64 = 30_000;

/// Watchdog feed cadence and the freshness bound on liveness tokens.
pub const WDG_FEED_PERIOD_MS: u64 = 500;
pub const WDG_TOKEN_TIMEOUT_MS: u64 = 800;

/// Liveness token bit assignments, one bit per participating thread.
pub mod token {
    pub const SAFETY: u8 = 0x01;
    pub const MAIN: u8 = 0x02;
    pub const COMM: u8 = 0x04;
    pub const ALL: u8 = SAFETY | MAIN | COMM;
}

/// Thread stacks are pre-filled with this pattern so the stack monitor can
/// find the high-water mark.
pub const STACK_FILL_PATTERN: u32 = 0xEFEF_EFEF;
pub const STACK_WARNING_PERCENT: u32 = 70;
pub const STACK_CRITICAL_PERCENT: u32 = 90;

/// Seed for both flow-monitor signature accumulators.
pub const FLOW_SIGNATURE_SEED: u32 = 0x5A5A_5A5A;

/// Program-flow checkpoint identifiers.
///
/// Boot checkpoints occupy 0x01-0x0F, application checkpoints 0x10-0x3F.
/// The boot sequence visits its checkpoints in exactly the order listed;
/// the boot flow verifier depends on that.
pub mod checkpoint {
    pub const BOOT_INIT: u8 = 0x01;
    pub const BOOT_SELFTEST_START: u8 = 0x02;
    pub const BOOT_SELFTEST_END: u8 = 0x07;
    pub const BOOT_PARAMS_CHECK: u8 = 0x08;
    pub const BOOT_CONFIG_CHECK: u8 = 0x09;
    pub const BOOT_APP_VERIFY: u8 = 0x0B;
    pub const BOOT_JUMP_PREPARE: u8 = 0x0C;
    pub const BOOT_JUMP_EXECUTE: u8 = 0x0D;

    pub const APP_INIT: u8 = 0x10;
    pub const APP_SAFETY_MONITOR: u8 = 0x11;
    pub const APP_WATCHDOG_FEED: u8 = 0x12;
    pub const APP_SELFTEST_START: u8 = 0x13;
    pub const APP_SELFTEST_END: u8 = 0x14;
    pub const APP_MAIN_LOOP: u8 = 0x15;
    pub const APP_COMM_HANDLER: u8 = 0x16;
    pub const APP_PARAM_CHECK: u8 = 0x17;
}

/// Factory calibration mailbox contract.
///
/// Three fixed slots at the base of CCM RAM, written by an attached
/// debugger and polled by the boot stage: a command word, a response word,
/// and a data buffer sized to one `SafetyParams` record. The firmware is
/// the only writer of the response slot; the debugger is the only writer
/// of the command slot, and the firmware clears it after processing.
pub mod factory {
    pub const CMD_ADDR: u32 = super::map::CCMRAM_START;
    pub const RSP_ADDR: u32 = CMD_ADDR + 4;
    pub const DATA_ADDR: u32 = CMD_ADDR + 8;

    pub const CMD_NONE: u32 = 0;
    /// "RCAL": copy the persisted record into the data buffer.
    pub const CMD_READ_CAL: u32 = u32::from_be_bytes(*b"RCAL");
    /// "WCAL": validate and persist the record in the data buffer.
    pub const CMD_WRITE_CAL: u32 = u32::from_be_bytes(*b"WCAL");
    /// "VRFY": re-read and fully re-validate the persisted record.
    pub const CMD_VERIFY: u32 = u32::from_be_bytes(*b"VRFY");
    /// "EXIT": end the session; accepted only after a successful verify.
    pub const CMD_EXIT: u32 = u32::from_be_bytes(*b"EXIT");
    /// "ABRT": end the session unconditionally.
    pub const CMD_ABORT: u32 = u32::from_be_bytes(*b"ABRT");

    pub const RSP_READY: u32 = u32::from_be_bytes(*b"REDY");
    pub const RSP_BUSY: u32 = u32::from_be_bytes(*b"BUSY");
    pub const RSP_OK: u32 = u32::from_be_bytes(*b"OKOK");
    pub const RSP_ERROR: u32 = u32::from_be_bytes(*b"ERRO");
}

/// Safety operating states.
///
/// The permitted transitions form a closed table; see
/// [`SafetyState::can_transition_to`]. `Safe` is terminal and can only be
/// left by processor reset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SafetyState {
    Init = 0,
    StartupTest = 1,
    Normal = 2,
    Degraded = 3,
    Safe = 4,
}

impl SafetyState {
    /// Checks whether `next` is a permitted successor of `self`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::StartupTest)
                | (Self::Init, Self::Safe)
                | (Self::StartupTest, Self::Normal)
                | (Self::StartupTest, Self::Safe)
                | (Self::Normal, Self::Degraded)
                | (Self::Normal, Self::Safe)
                | (Self::Degraded, Self::Normal)
                | (Self::Degraded, Self::Safe)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::StartupTest => "STARTUP_TEST",
            Self::Normal => "NORMAL",
            Self::Degraded => "DEGRADED",
            Self::Safe => "SAFE",
        }
    }
}

/// The closed safety error taxonomy.
///
/// Each member is permanently bound to a [`Severity`]; the state machine
/// dispatches on severity alone, never on ad hoc per-error logic. The
/// numeric codes are stable because they appear in the persisted error log
/// and in `BootConfig::last_error`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SafetyError {
    CpuTest = 1,
    RamTest = 2,
    FlashCrc = 3,
    Clock = 4,
    Watchdog = 5,
    StackOverflow = 6,
    FlowMonitor = 7,
    ParamInvalid = 8,
    RuntimeTest = 9,
    MpuFault = 10,
    HardFault = 11,
    BusFault = 12,
    UsageFault = 13,
    Nmi = 14,
    Internal = 15,
}

/// Error severity classes, in increasing order of reaction strength.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Severity {
    /// Logged and reported through the error hook only.
    Warning,
    /// Forces degraded mode, or the safe state if already degraded.
    Serious,
    /// Forces the safe state immediately.
    Critical,
}

impl SafetyError {
    pub fn severity(self) -> Severity {
        match self {
            Self::CpuTest
            | Self::RamTest
            | Self::HardFault
            | Self::BusFault
            | Self::UsageFault
            | Self::Nmi => Severity::Critical,
            Self::FlashCrc
            | Self::Clock
            | Self::Watchdog
            | Self::FlowMonitor
            | Self::MpuFault => Severity::Serious,
            Self::StackOverflow
            | Self::ParamInvalid
            | Self::RuntimeTest
            | Self::Internal => Severity::Warning,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CpuTest => "CPU_TEST",
            Self::RamTest => "RAM_TEST",
            Self::FlashCrc => "FLASH_CRC",
            Self::Clock => "CLOCK",
            Self::Watchdog => "WATCHDOG",
            Self::StackOverflow => "STACK_OVERFLOW",
            Self::FlowMonitor => "FLOW_MONITOR",
            Self::ParamInvalid => "PARAM_INVALID",
            Self::RuntimeTest => "RUNTIME_TEST",
            Self::MpuFault => "MPU_FAULT",
            Self::HardFault => "HARDFAULT",
            Self::BusFault => "BUSFAULT",
            Self::UsageFault => "USAGEFAULT",
            Self::Nmi => "NMI",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Boot configuration record, first structure in the config sector.
///
/// CRC-trailed and magic-prefixed like every persisted structure. The boot
/// stage clears `factory_mode` after a completed factory session; the
/// factory protocol sets `cal_valid` after a verified calibration write.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct BootConfig {
    pub magic: u32,
    /// Nonzero diverts the next boot into the factory protocol.
    pub factory_mode: u32,
    /// Nonzero once a calibration record has been written and verified.
    pub cal_valid: u32,
    /// Cached application image CRC for quick comparison.
    pub app_crc: u32,
    pub boot_count: u32,
    /// Code of the last error recorded by the boot stage.
    pub last_error: u32,
    pub reserved: [u32; 2],
    /// CRC-32 over every preceding byte of this struct.
    pub crc: u32,
}

pub const BOOT_CONFIG_SIZE: usize = core::mem::size_of::<BootConfig>();
static_assertions::const_assert_eq!(BOOT_CONFIG_SIZE, 36);

impl BootConfig {
    /// A blank record as written on first provisioning: valid magic,
    /// everything else zero. The caller computes the trailing CRC.
    pub fn blank() -> Self {
        Self {
            magic: BOOT_CONFIG_MAGIC,
            factory_mode: 0,
            cal_valid: 0,
            app_crc: 0,
            boot_count: 0,
            last_error: 0,
            reserved: [0; 2],
            crc: 0,
        }
    }
}

/// Safety-critical calibration record, stored directly after `BootConfig`
/// in the config sector.
///
/// The hall fields carry a second, bitwise-complemented copy so a single
/// corrupted word is caught even when the CRC is not consulted. Invariant:
/// `hall_*[i].to_bits() == !hall_*_inv[i].to_bits()` and `crc32` covers
/// every preceding byte.
#[derive(
    Copy, Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct SafetyParams {
    pub magic: u32,
    pub version: u16,
    /// Declared size of this structure, checked against the real one.
    pub size: u16,

    pub hall_offset: [f32; 3],
    pub hall_gain: [f32; 3],
    /// Bitwise complements of `hall_offset`.
    pub hall_offset_inv: [f32; 3],
    /// Bitwise complements of `hall_gain`.
    pub hall_gain_inv: [f32; 3],

    pub adc_gain: [f32; 8],
    pub adc_offset: [f32; 8],

    pub safety_threshold: [f32; 4],

    pub reserved: [u32; 7],

    /// CRC-32 over every preceding byte of this struct.
    pub crc32: u32,
}

pub const SAFETY_PARAMS_SIZE: usize = core::mem::size_of::<SafetyParams>();
static_assertions::const_assert_eq!(SAFETY_PARAMS_SIZE, 168);

impl SafetyParams {
    /// Factory defaults: unity gains, zero offsets, conservative
    /// thresholds. Redundant copies are filled in; the trailing CRC is the
    /// caller's job since only the store layer knows the CRC engine.
    pub fn defaults() -> Self {
        let mut p = Self {
            magic: SAFETY_PARAMS_MAGIC,
            version: SAFETY_PARAMS_VERSION,
            size: SAFETY_PARAMS_SIZE as u16,
            hall_offset: [0.0; 3],
            hall_gain: [1.0; 3],
            hall_offset_inv: [0.0; 3],
            hall_gain_inv: [0.0; 3],
            adc_gain: [1.0; 8],
            adc_offset: [0.0; 8],
            safety_threshold: [1000.0, 2000.0, 3000.0, 4000.0],
            reserved: [0; 7],
            crc32: 0,
        };
        p.refresh_redundancy();
        p
    }

    /// Regenerates the inverted copies from the primary hall fields. Call
    /// after any mutation of `hall_offset` or `hall_gain`.
    pub fn refresh_redundancy(&mut self) {
        for i in 0..3 {
            self.hall_offset_inv[i] = bits::f32_complement(self.hall_offset[i]);
            self.hall_gain_inv[i] = bits::f32_complement(self.hall_gain[i]);
        }
    }
}

/// Offsets of the persisted records within the config sector.
pub const BOOT_CONFIG_OFFSET: u32 = 0;
pub const SAFETY_PARAMS_OFFSET: u32 = BOOT_CONFIG_SIZE as u32;

/// Non-safety parameter record (communication settings). Corruption here
/// is never fatal; the boot stage falls back to defaults.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct NonSafetyParams {
    pub magic: u32,
    pub can_baudrate: u32,
    pub can_id_base: u32,
    pub comm_timeout_ms: u16,
    pub reserved: u16,
    pub crc16: u16,
    pub padding: u16,
}

impl NonSafetyParams {
    pub fn defaults() -> Self {
        Self {
            magic: NONSAFETY_PARAMS_MAGIC,
            can_baudrate: 500_000,
            can_id_base: 0x100,
            comm_timeout_ms: 1_000,
            reserved: 0,
            crc16: 0,
            padding: 0,
        }
    }
}

/// Permitted ranges for calibration fields. Anything outside these (or any
/// NaN/infinity) is rejected by the validator and by the factory protocol.
pub mod range {
    pub const HALL_OFFSET_MIN: f32 = -1000.0;
    pub const HALL_OFFSET_MAX: f32 = 1000.0;
    pub const HALL_GAIN_MIN: f32 = 0.5;
    pub const HALL_GAIN_MAX: f32 = 2.0;
    pub const ADC_GAIN_MIN: f32 = 0.8;
    pub const ADC_GAIN_MAX: f32 = 1.2;
    pub const ADC_OFFSET_MIN: f32 = -500.0;
    pub const ADC_OFFSET_MAX: f32 = 500.0;
    pub const THRESHOLD_MIN: f32 = 0.0;
    pub const THRESHOLD_MAX: f32 = 10_000.0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_is_closed() {
        let states = [
            SafetyState::Init,
            SafetyState::StartupTest,
            SafetyState::Normal,
            SafetyState::Degraded,
            SafetyState::Safe,
        ];
        // Safe is terminal.
        for s in states {
            assert!(!SafetyState::Safe.can_transition_to(s));
        }
        // No state may re-enter Init.
        for s in states {
            assert!(!s.can_transition_to(SafetyState::Init));
        }
        assert!(SafetyState::Init.can_transition_to(SafetyState::StartupTest));
        assert!(!SafetyState::Init.can_transition_to(SafetyState::Normal));
        assert!(SafetyState::Degraded.can_transition_to(SafetyState::Normal));
    }

    #[test]
    fn every_error_has_a_severity() {
        // Pin the class assignments the dispatch policy depends on.
        assert_eq!(SafetyError::Nmi.severity(), Severity::Critical);
        assert_eq!(SafetyError::Watchdog.severity(), Severity::Serious);
        assert_eq!(SafetyError::ParamInvalid.severity(), Severity::Warning);
    }

    #[test]
    fn defaults_pass_their_own_redundancy() {
        let p = SafetyParams::defaults();
        for i in 0..3 {
            assert!(bits::is_complement_f32(
                p.hall_offset[i],
                p.hall_offset_inv[i]
            ));
            assert!(bits::is_complement_f32(
                p.hall_gain[i],
                p.hall_gain_inv[i]
            ));
        }
    }

    #[test]
    fn factory_words_are_distinct() {
        let words = [
            factory::CMD_READ_CAL,
            factory::CMD_WRITE_CAL,
            factory::CMD_VERIFY,
            factory::CMD_EXIT,
            factory::CMD_ABORT,
        ];
        for (i, a) in words.iter().enumerate() {
            assert_ne!(*a, factory::CMD_NONE);
            for b in &words[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
