// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-level redundancy helpers.
//!
//! The calibration record stores a bitwise-complemented shadow of each
//! safety-relevant float. Comparing a value against its shadow catches any
//! single-bit corruption of either copy without touching the CRC. The bit
//! reinterpretation needed for that lives here, and only here; nothing else
//! in the system is allowed to treat floats as raw words.

/// Returns the float whose bit pattern is the complement of `v`'s.
///
/// The result is frequently a NaN or a denormal. It is never interpreted
/// numerically, only compared bit-for-bit.
pub fn f32_complement(v: f32) -> f32 {
    f32::from_bits(!v.to_bits())
}

/// Checks that `inverse` holds the exact bitwise complement of `value`.
pub fn is_complement_f32(value: f32, inverse: f32) -> bool {
    value.to_bits() == !inverse.to_bits()
}

/// Word-sized variant for non-float fields.
pub fn is_complement_u32(value: u32, inverse: u32) -> bool {
    value == !inverse
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement_round_trips() {
        for v in [0.0f32, -0.0, 1.0, -1.5, 1234.567, f32::MIN_POSITIVE] {
            assert!(is_complement_f32(v, f32_complement(v)));
        }
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let v = 42.125f32;
        let inv = f32_complement(v);
        for bit in 0..32 {
            let damaged = f32::from_bits(inv.to_bits() ^ (1 << bit));
            assert!(
                !is_complement_f32(v, damaged),
                "flip of bit {bit} went undetected"
            );
        }
    }

    #[test]
    fn u32_complement() {
        assert!(is_complement_u32(0xA5A5_A5A5, 0x5A5A_5A5A));
        assert!(!is_complement_u32(0xA5A5_A5A5, 0x5A5A_5A5B));
    }
}
