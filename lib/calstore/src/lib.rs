// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Calibration flash storage layout.
//!
//! The config sector holds, at fixed offsets, the `BootConfig` record and
//! the `SafetyParams` record, both magic-prefixed and CRC-trailed. The
//! sector is erased and rewritten as a unit: a writer first captures the
//! sibling record's raw bytes, erases, then programs both images back and
//! verifies the result by read-back. There is no partial-update path on
//! purpose; a torn write must never leave one record silently stale.
//!
//! All access goes through the [`ConfigFlash`] trait, whose operations are
//! bounded by timeouts in the hardware driver and fail with typed errors.
//! Tests run against a RAM-backed NOR model that enforces program-after-
//! erase discipline.

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "test-flash"))]
extern crate std;

use abi::{BootConfig, NonSafetyParams, SafetyParams};
use zerocopy::{FromBytes, IntoBytes};

/// Errors surfaced by flash hardware drivers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    /// A busy-wait exceeded its bound.
    Timeout,
    /// The controller reported a program/erase failure.
    Hardware,
    /// Access outside the config region.
    Bounds,
}

/// Bounded-time access to the config flash sector.
pub trait ConfigFlash {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    /// Erases the whole config sector to 0xFF.
    fn erase(&mut self) -> Result<(), FlashError>;
    /// Programs previously erased bytes.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreError {
    Flash(FlashError),
    /// The record's magic is absent; nothing has ever been written.
    NotProvisioned,
    BadCrc,
    /// Read-back after programming disagreed with what was written.
    VerifyFailed,
}

impl From<FlashError> for StoreError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

const NONSAFETY_OFFSET: u32 =
    abi::SAFETY_PARAMS_OFFSET + abi::SAFETY_PARAMS_SIZE as u32;

fn crc_payload(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len() - core::mem::size_of::<u32>()]
}

/// Reads and structurally validates the boot configuration record.
pub fn read_boot_config(
    flash: &impl ConfigFlash,
) -> Result<BootConfig, StoreError> {
    let mut bytes = [0u8; abi::BOOT_CONFIG_SIZE];
    flash.read(abi::BOOT_CONFIG_OFFSET, &mut bytes)?;
    let cfg = BootConfig::read_from_bytes(&bytes)
        .map_err(|_| StoreError::BadCrc)?;
    if cfg.magic != abi::BOOT_CONFIG_MAGIC {
        return Err(StoreError::NotProvisioned);
    }
    if integrity::crc32_bytes(crc_payload(&bytes)) != cfg.crc {
        return Err(StoreError::BadCrc);
    }
    Ok(cfg)
}

/// Reads the calibration record, checking magic and CRC. Semantic
/// validation (ranges, redundancy) is the validator's job, not ours.
pub fn read_params(
    flash: &impl ConfigFlash,
) -> Result<SafetyParams, StoreError> {
    let mut bytes = [0u8; abi::SAFETY_PARAMS_SIZE];
    flash.read(abi::SAFETY_PARAMS_OFFSET, &mut bytes)?;
    let p = SafetyParams::read_from_bytes(&bytes)
        .map_err(|_| StoreError::BadCrc)?;
    if p.magic != abi::SAFETY_PARAMS_MAGIC {
        return Err(StoreError::NotProvisioned);
    }
    if integrity::crc32_bytes(crc_payload(&bytes)) != p.crc32 {
        return Err(StoreError::BadCrc);
    }
    Ok(p)
}

/// Reads the calibration record without any structural checks, for the
/// runtime periodic re-check which applies its own (cheaper) CRC step.
pub fn read_params_unchecked(
    flash: &impl ConfigFlash,
) -> Result<SafetyParams, FlashError> {
    let mut bytes = [0u8; abi::SAFETY_PARAMS_SIZE];
    flash.read(abi::SAFETY_PARAMS_OFFSET, &mut bytes)?;
    Ok(SafetyParams::read_from_bytes(&bytes)
        .unwrap_or_else(|_| SafetyParams::defaults()))
}

/// Reads the non-safety record, falling back to defaults on any defect.
/// Corruption here is never fatal.
pub fn read_nonsafety_or_defaults(flash: &impl ConfigFlash) -> NonSafetyParams {
    let mut bytes = [0u8; core::mem::size_of::<NonSafetyParams>()];
    if flash.read(NONSAFETY_OFFSET, &mut bytes).is_err() {
        return NonSafetyParams::defaults();
    }
    let Ok(p) = NonSafetyParams::read_from_bytes(&bytes) else {
        return NonSafetyParams::defaults();
    };
    if p.magic != abi::NONSAFETY_PARAMS_MAGIC {
        return NonSafetyParams::defaults();
    }
    let payload = &bytes[..bytes.len() - 4];
    if integrity::crc16_bytes(payload) != p.crc16 {
        return NonSafetyParams::defaults();
    }
    p
}

/// Computes and installs the trailing CRC of a boot config record.
pub fn seal_boot_config(cfg: &mut BootConfig) {
    cfg.magic = abi::BOOT_CONFIG_MAGIC;
    let crc = integrity::crc32_bytes(crc_payload(cfg.as_bytes()));
    cfg.crc = crc;
}

/// Computes and installs the CRC-16 of a non-safety record.
pub fn seal_nonsafety(p: &mut NonSafetyParams) {
    p.magic = abi::NONSAFETY_PARAMS_MAGIC;
    let bytes = p.as_bytes();
    let crc = integrity::crc16_bytes(&bytes[..bytes.len() - 4]);
    p.crc16 = crc;
}

/// Writes a (sealed) boot config record, preserving whatever occupies the
/// rest of the sector, and verifies by read-back.
pub fn write_boot_config(
    flash: &mut impl ConfigFlash,
    cfg: &mut BootConfig,
) -> Result<(), StoreError> {
    seal_boot_config(cfg);
    rewrite_sector(flash, Some(cfg.as_bytes()), None)
}

/// Writes a calibration record. The record must already carry a valid
/// trailing CRC (see `params::seal`); this layer refuses to guess one.
pub fn write_params(
    flash: &mut impl ConfigFlash,
    p: &SafetyParams,
) -> Result<(), StoreError> {
    let bytes = p.as_bytes();
    if integrity::crc32_bytes(crc_payload(bytes)) != p.crc32 {
        return Err(StoreError::BadCrc);
    }
    rewrite_sector(flash, None, Some(bytes))
}

/// Erase-and-rewrite of the whole sector. For each record slot, the new
/// image is used when given, otherwise the current contents are carried
/// over verbatim (whatever their validity; this layer does not destroy
/// records it was not asked to touch).
fn rewrite_sector(
    flash: &mut impl ConfigFlash,
    new_config: Option<&[u8]>,
    new_params: Option<&[u8]>,
) -> Result<(), StoreError> {
    let mut config_image = [0u8; abi::BOOT_CONFIG_SIZE];
    match new_config {
        Some(img) => config_image.copy_from_slice(img),
        None => flash.read(abi::BOOT_CONFIG_OFFSET, &mut config_image)?,
    }

    let mut params_image = [0u8; abi::SAFETY_PARAMS_SIZE];
    match new_params {
        Some(img) => params_image.copy_from_slice(img),
        None => flash.read(abi::SAFETY_PARAMS_OFFSET, &mut params_image)?,
    }

    let mut nonsafety_image = [0u8; core::mem::size_of::<NonSafetyParams>()];
    flash.read(NONSAFETY_OFFSET, &mut nonsafety_image)?;

    flash.erase()?;
    flash.program(abi::BOOT_CONFIG_OFFSET, &config_image)?;
    flash.program(abi::SAFETY_PARAMS_OFFSET, &params_image)?;
    flash.program(NONSAFETY_OFFSET, &nonsafety_image)?;

    // Read back both records; a mismatch means the sector cannot be
    // trusted at all.
    let mut check = [0u8; abi::SAFETY_PARAMS_SIZE];
    flash.read(abi::BOOT_CONFIG_OFFSET, &mut check[..abi::BOOT_CONFIG_SIZE])?;
    if check[..abi::BOOT_CONFIG_SIZE] != config_image {
        return Err(StoreError::VerifyFailed);
    }
    flash.read(abi::SAFETY_PARAMS_OFFSET, &mut check)?;
    if check != params_image {
        return Err(StoreError::VerifyFailed);
    }
    Ok(())
}

/// RAM-backed NOR flash model for host tests: erase sets 0xFF, programming
/// a byte that is not erased is a hardware error.
#[cfg(any(test, feature = "test-flash"))]
pub struct RamFlash {
    pub bytes: std::vec::Vec<u8>,
}

#[cfg(any(test, feature = "test-flash"))]
impl RamFlash {
    pub fn erased() -> Self {
        Self {
            bytes: std::vec![0xFF; abi::map::CONFIG_FLASH_SIZE as usize],
        }
    }
}

#[cfg(any(test, feature = "test-flash"))]
impl ConfigFlash for RamFlash {
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(FlashError::Bounds);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), FlashError> {
        self.bytes.fill(0xFF);
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.bytes.len() {
            return Err(FlashError::Bounds);
        }
        for (dst, &src) in self.bytes[start..end].iter_mut().zip(data) {
            if *dst != 0xFF {
                return Err(FlashError::Hardware);
            }
            *dst = src;
        }
        Ok(())
    }
}
