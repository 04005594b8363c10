// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ARMv7-M MPU region guard.
//!
//! The address space is partitioned by a fixed six-region table: the
//! application flash (read/execute), main RAM and the stack RAM
//! (read/write, never execute), the peripheral space (device memory),
//! the calibration flash (read-only), and the boot flash (privileged
//! read-only, so the application cannot touch its own recovery path).
//! Unmapped addresses fall back to "privileged access only".
//!
//! Register encodings and table validation are pure functions, checked on
//! the host; the actual register writes live in the `hw` module and run
//! with interrupts masked, bracketed by the barriers the architecture
//! requires before a new mapping is guaranteed visible.

#![cfg_attr(target_os = "none", no_std)]

use abi::map;

#[cfg(target_os = "none")]
pub mod hw;

/// RASR size-field encoding: a region spans `1 << (n + 1)` bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionSize(pub u8);

impl RegionSize {
    pub const KB16: Self = Self(13);
    pub const KB64: Self = Self(15);
    pub const KB128: Self = Self(16);
    pub const KB512: Self = Self(18);
    pub const MB512: Self = Self(28);

    pub const fn bytes(self) -> u64 {
        1u64 << (self.0 + 1)
    }
}

/// RASR AP-field encodings. "Priv" is the boot stage and kernel;
/// everything else is unprivileged.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum AccessPermission {
    NoAccess = 0b000,
    PrivReadWrite = 0b001,
    FullAccess = 0b011,
    PrivReadOnly = 0b101,
    ReadOnly = 0b110,
}

impl AccessPermission {
    pub fn allows_unprivileged_write(self) -> bool {
        matches!(self, Self::FullAccess)
    }
}

/// TEX-field values used by the region table. The memory type is the
/// combination of TEX with the S/C/B bits, which stay explicit in
/// [`RegionConfig`].
pub mod tex {
    pub const STRONGLY_ORDERED: u8 = 0b000;
    pub const DEVICE: u8 = 0b000;
    pub const NORMAL_WRITE_THROUGH: u8 = 0b000;
    pub const NORMAL_WRITE_BACK: u8 = 0b001;
}

bitflags::bitflags! {
    /// MemManage fault status bits (the MMFSR byte of CFSR), for fault
    /// logging and diagnostics.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MemFaultStatus: u8 {
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;
    }
}

/// One MPU region. Mirrors the RNR/RBAR/RASR programming model.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionConfig {
    pub base_address: u32,
    pub region_number: u8,
    pub size: RegionSize,
    pub access: AccessPermission,
    pub execute_never: bool,
    pub shareable: bool,
    pub cacheable: bool,
    pub bufferable: bool,
    pub tex: u8,
    /// One disable bit per eighth of the region, LSB first.
    pub subregion_disable: u8,
    pub enabled: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MpuError {
    /// Region index beyond what the hardware provides.
    BadRegionNumber,
    /// Size exponent outside the architectural 32 B..4 GiB range.
    BadSize,
    /// Base address not aligned to the region size.
    Misaligned,
    /// The table would leave code or the boot area writable.
    WritableCode,
    /// Hardware reports no MPU.
    NotPresent,
}

/// Regions available on the Cortex-M4 MPU.
pub const NUM_REGIONS: u8 = 8;

/// Rejects malformed regions before any register is written.
pub fn validate_region(config: &RegionConfig) -> Result<(), MpuError> {
    if config.region_number >= NUM_REGIONS {
        return Err(MpuError::BadRegionNumber);
    }
    if config.size.0 < 4 || config.size.0 > 31 {
        return Err(MpuError::BadSize);
    }
    let size_mask = (config.size.bytes() - 1) as u32;
    if config.base_address & size_mask != 0 {
        return Err(MpuError::Misaligned);
    }
    Ok(())
}

/// Validates a whole table, including the invariant that no region grants
/// unprivileged writes over the application code or the boot area.
pub fn validate_table(regions: &[RegionConfig]) -> Result<(), MpuError> {
    for config in regions {
        validate_region(config)?;

        if config.access.allows_unprivileged_write() {
            let start = u64::from(config.base_address);
            let end = start + config.size.bytes();
            let code = u64::from(map::APP_FLASH_START)
                ..=u64::from(map::APP_FLASH_END);
            let boot = u64::from(map::BOOT_FLASH_START)
                ..=u64::from(map::BOOT_FLASH_END);
            if code.contains(&start)
                || boot.contains(&start)
                || (start < *code.start() && end > *code.start())
            {
                return Err(MpuError::WritableCode);
            }
        }
    }
    Ok(())
}

/// RBAR value for a region programmed via RNR (no VALID bit).
pub fn encode_rbar(config: &RegionConfig) -> u32 {
    config.base_address & !0x1F
}

/// RASR value for a region.
pub fn encode_rasr(config: &RegionConfig) -> u32 {
    (config.enabled as u32)
        | u32::from(config.size.0) << 1
        | u32::from(config.subregion_disable) << 8
        | (config.bufferable as u32) << 16
        | (config.cacheable as u32) << 17
        | (config.shareable as u32) << 18
        | u32::from(config.tex) << 19
        | (config.access as u32) << 24
        | (config.execute_never as u32) << 28
}

/// The fixed partitioning applied at init, in region-index order.
pub const DEFAULT_REGIONS: [RegionConfig; 6] = [
    // Region 0: application flash, read + execute. 512 KiB class with
    // the last subregion disabled to fit the 448 KiB region.
    RegionConfig {
        base_address: 0x0800_0000,
        region_number: 0,
        size: RegionSize::KB512,
        access: AccessPermission::ReadOnly,
        execute_never: false,
        shareable: false,
        cacheable: true,
        bufferable: false,
        tex: tex::NORMAL_WRITE_THROUGH,
        subregion_disable: 0x80,
        enabled: true,
    },
    // Region 1: main RAM, read/write, never execute.
    RegionConfig {
        base_address: map::RAM_START,
        region_number: 1,
        size: RegionSize::KB128,
        access: AccessPermission::FullAccess,
        execute_never: true,
        shareable: true,
        cacheable: true,
        bufferable: true,
        tex: tex::NORMAL_WRITE_BACK,
        subregion_disable: 0,
        enabled: true,
    },
    // Region 2: CCM RAM holding thread stacks. Strongly ordered so
    // stack probes are never reordered past the accesses they guard.
    RegionConfig {
        base_address: map::CCMRAM_START,
        region_number: 2,
        size: RegionSize::KB64,
        access: AccessPermission::FullAccess,
        execute_never: true,
        shareable: false,
        cacheable: false,
        bufferable: false,
        tex: tex::STRONGLY_ORDERED,
        subregion_disable: 0,
        enabled: true,
    },
    // Region 3: peripheral space, device memory.
    RegionConfig {
        base_address: map::PERIPH_START,
        region_number: 3,
        size: RegionSize::MB512,
        access: AccessPermission::FullAccess,
        execute_never: true,
        shareable: true,
        cacheable: false,
        bufferable: true,
        tex: tex::DEVICE,
        subregion_disable: 0,
        enabled: true,
    },
    // Region 4: calibration flash, read-only to everyone. Writes go
    // through the flash controller, never through this window.
    RegionConfig {
        base_address: map::CONFIG_FLASH_START,
        region_number: 4,
        size: RegionSize::KB16,
        access: AccessPermission::ReadOnly,
        execute_never: true,
        shareable: false,
        cacheable: true,
        bufferable: false,
        tex: tex::NORMAL_WRITE_THROUGH,
        subregion_disable: 0,
        enabled: true,
    },
    // Region 5: boot flash. Privileged read-only; 64 KiB class with the
    // upper subregions disabled to fit the 48 KiB image.
    RegionConfig {
        base_address: map::BOOT_FLASH_START,
        region_number: 5,
        size: RegionSize::KB64,
        access: AccessPermission::PrivReadOnly,
        execute_never: true,
        shareable: false,
        cacheable: true,
        bufferable: false,
        tex: tex::NORMAL_WRITE_THROUGH,
        subregion_disable: 0xC0,
        enabled: true,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_valid() {
        assert_eq!(validate_table(&DEFAULT_REGIONS), Ok(()));
    }

    #[test]
    fn misaligned_base_is_rejected() {
        let mut bad = DEFAULT_REGIONS[1];
        bad.base_address += 0x100;
        assert_eq!(validate_region(&bad), Err(MpuError::Misaligned));
    }

    #[test]
    fn region_number_bounds() {
        let mut bad = DEFAULT_REGIONS[0];
        bad.region_number = NUM_REGIONS;
        assert_eq!(validate_region(&bad), Err(MpuError::BadRegionNumber));
    }

    #[test]
    fn writable_code_region_is_rejected() {
        let mut bad = DEFAULT_REGIONS[0];
        bad.access = AccessPermission::FullAccess;
        assert_eq!(validate_table(&[bad]), Err(MpuError::WritableCode));
    }

    #[test]
    fn writable_boot_region_is_rejected() {
        let mut bad = DEFAULT_REGIONS[5];
        bad.access = AccessPermission::FullAccess;
        assert_eq!(validate_table(&[bad]), Err(MpuError::WritableCode));
    }

    #[test]
    fn size_encoding() {
        assert_eq!(RegionSize::KB16.bytes(), 16 * 1024);
        assert_eq!(RegionSize::KB512.bytes(), 512 * 1024);
        assert_eq!(RegionSize::MB512.bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn rasr_encoding_matches_field_layout() {
        let region = DEFAULT_REGIONS[1];
        let rasr = encode_rasr(&region);
        assert_eq!(rasr & 1, 1, "enable");
        assert_eq!((rasr >> 1) & 0x1F, u32::from(RegionSize::KB128.0));
        assert_eq!((rasr >> 24) & 0x7, AccessPermission::FullAccess as u32);
        assert_eq!(rasr >> 28 & 1, 1, "execute never");
        // Write-back normal memory: TEX=001, C=1, B=1, S=1.
        assert_eq!((rasr >> 19) & 0x7, 0b001);
        assert_eq!((rasr >> 16) & 0x7, 0b111);
    }

    #[test]
    fn rbar_strips_low_bits() {
        let mut region = DEFAULT_REGIONS[0];
        region.base_address |= 0x10;
        assert_eq!(encode_rbar(&region) & 0x1F, 0);
    }

    #[test]
    fn fault_status_decodes() {
        let status = MemFaultStatus::from_bits_truncate(0x82);
        assert!(status.contains(MemFaultStatus::MMARVALID));
        assert!(status.contains(MemFaultStatus::DACCVIOL));
        assert!(!status.contains(MemFaultStatus::IACCVIOL));
    }
}
