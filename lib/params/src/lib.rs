// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safety parameter validation.
//!
//! A calibration record is accepted only after the full pipeline passes:
//! header (magic, version, declared size), CRC-32 over everything but the
//! trailing CRC word, per-field range checks with explicit NaN/infinity
//! rejection, and the bitwise-redundancy check of the inverted copies.
//! The pipeline short-circuits on the first failure so the reported error
//! names the earliest defect.
//!
//! The runtime re-check deliberately runs only the CRC step against the
//! persisted copy; it exists to catch flash decay cheaply, not to repeat
//! the semantic checks that passed at boot.

#![cfg_attr(not(test), no_std)]

use abi::{bits, range, SafetyParams};
use zerocopy::IntoBytes;

/// Validation failure, naming the first pipeline step that rejected the
/// record. Indices identify the failing array slot for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamError {
    BadMagic,
    BadSize,
    BadCrc,
    HallRange { index: u8 },
    AdcRange { index: u8 },
    ThresholdRange { index: u8 },
    Redundancy { index: u8 },
}

/// Running totals kept by the [`Validator`], surfaced by diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ValidationStats {
    pub validation_count: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    pub last_result: Option<Result<(), ParamError>>,
}

/// Stateless full validation of one record.
pub fn validate(p: &SafetyParams) -> Result<(), ParamError> {
    check_header(p)?;
    check_crc(p)?;
    check_hall(p)?;
    check_adc(p)?;
    check_thresholds(p)?;
    check_redundancy(p)
}

/// Range and finiteness checks only, without header, CRC, or redundancy.
///
/// This is the factory protocol's acceptance gate for records arriving
/// from the debugger, which carry meaningful field values but no header
/// or CRC yet (sealing happens after acceptance).
pub fn check_ranges(p: &SafetyParams) -> Result<(), ParamError> {
    check_hall(p)?;
    check_adc(p)?;
    check_thresholds(p)
}

/// CRC-only check, for the periodic re-validation of the persisted copy.
pub fn check_crc(p: &SafetyParams) -> Result<(), ParamError> {
    let bytes = p.as_bytes();
    let payload = &bytes[..bytes.len() - core::mem::size_of::<u32>()];
    if integrity::crc32_bytes(payload) != p.crc32 {
        return Err(ParamError::BadCrc);
    }
    Ok(())
}

/// Recomputes the redundant copies and the trailing CRC so that `p` passes
/// [`validate`] (assuming its fields are in range). This is the only
/// sanctioned way to produce a well-formed record for persisting.
pub fn seal(p: &mut SafetyParams) {
    p.magic = abi::SAFETY_PARAMS_MAGIC;
    p.version = abi::SAFETY_PARAMS_VERSION;
    p.size = abi::SAFETY_PARAMS_SIZE as u16;
    p.refresh_redundancy();
    let bytes = p.as_bytes();
    let crc =
        integrity::crc32_bytes(&bytes[..bytes.len() - core::mem::size_of::<u32>()]);
    p.crc32 = crc;
}

fn check_header(p: &SafetyParams) -> Result<(), ParamError> {
    if p.magic != abi::SAFETY_PARAMS_MAGIC {
        return Err(ParamError::BadMagic);
    }
    // A version mismatch alone is tolerated; layout changes bump the size
    // too, and that is what we enforce.
    if usize::from(p.size) != abi::SAFETY_PARAMS_SIZE {
        return Err(ParamError::BadSize);
    }
    Ok(())
}

fn in_range(v: f32, min: f32, max: f32) -> bool {
    v.is_finite() && v >= min && v <= max
}

fn check_hall(p: &SafetyParams) -> Result<(), ParamError> {
    for i in 0..3 {
        if !in_range(
            p.hall_offset[i],
            range::HALL_OFFSET_MIN,
            range::HALL_OFFSET_MAX,
        ) {
            return Err(ParamError::HallRange { index: i as u8 });
        }
        if !in_range(p.hall_gain[i], range::HALL_GAIN_MIN, range::HALL_GAIN_MAX)
        {
            return Err(ParamError::HallRange { index: i as u8 + 3 });
        }
    }
    Ok(())
}

fn check_adc(p: &SafetyParams) -> Result<(), ParamError> {
    for i in 0..8 {
        if !in_range(p.adc_gain[i], range::ADC_GAIN_MIN, range::ADC_GAIN_MAX) {
            return Err(ParamError::AdcRange { index: i as u8 });
        }
        if !in_range(
            p.adc_offset[i],
            range::ADC_OFFSET_MIN,
            range::ADC_OFFSET_MAX,
        ) {
            return Err(ParamError::AdcRange { index: i as u8 + 8 });
        }
    }
    Ok(())
}

fn check_thresholds(p: &SafetyParams) -> Result<(), ParamError> {
    for i in 0..4 {
        if !in_range(
            p.safety_threshold[i],
            range::THRESHOLD_MIN,
            range::THRESHOLD_MAX,
        ) {
            return Err(ParamError::ThresholdRange { index: i as u8 });
        }
    }
    Ok(())
}

fn check_redundancy(p: &SafetyParams) -> Result<(), ParamError> {
    for i in 0..3 {
        if !bits::is_complement_f32(p.hall_offset[i], p.hall_offset_inv[i]) {
            return Err(ParamError::Redundancy { index: i as u8 });
        }
        if !bits::is_complement_f32(p.hall_gain[i], p.hall_gain_inv[i]) {
            return Err(ParamError::Redundancy { index: i as u8 + 3 });
        }
    }
    Ok(())
}

/// Stateful validator owning the accepted-record cache and statistics.
///
/// One instance lives in the safety monitor; the boot stage uses the free
/// functions directly since it keeps no cache.
#[derive(Default)]
pub struct Validator {
    stats: ValidationStats,
    cached: Option<SafetyParams>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the full pipeline; on success the record becomes the cached
    /// copy handed out by [`Validator::current`].
    pub fn validate(&mut self, p: &SafetyParams) -> Result<(), ParamError> {
        self.stats.validation_count += 1;
        let result = validate(p);
        match result {
            Ok(()) => {
                self.stats.pass_count += 1;
                self.cached = Some(*p);
            }
            Err(_) => {
                self.stats.fail_count += 1;
                self.cached = None;
            }
        }
        self.stats.last_result = Some(result);
        result
    }

    /// Cheap periodic re-check of the persisted copy. Any mismatch drops
    /// the cached record; callers report the resulting warning.
    pub fn periodic_check(
        &mut self,
        persisted: &SafetyParams,
    ) -> Result<(), ParamError> {
        if self.cached.is_none() {
            return Err(ParamError::BadCrc);
        }
        let result = check_crc(persisted);
        if result.is_err() {
            self.cached = None;
            self.stats.fail_count += 1;
        }
        self.stats.last_result = Some(result);
        result
    }

    pub fn current(&self) -> Option<&SafetyParams> {
        self.cached.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.cached.is_some()
    }

    pub fn stats(&self) -> &ValidationStats {
        &self.stats
    }
}
