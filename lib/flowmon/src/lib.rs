// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Program-flow monitor.
//!
//! Threads record checkpoints as they pass known points in their control
//! flow; the monitor folds each checkpoint identifier into a rolling
//! signature and periodically verifies it. The fold is order-sensitive
//! (rotate-then-XOR with a multiplicative spread of the identifier), so
//! visiting the same checkpoints in a different order, or a different
//! number of times, yields a different signature.
//!
//! Checkpoint recording is a handful of single-word atomic updates, safe
//! to call from any thread without locking. Verification and reset belong
//! to the safety monitor alone.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Multiplier spreading a checkpoint id across the signature word.
const SPREAD: u32 = 0x9E37_79B9;

fn mix(signature: u32, checkpoint: u8) -> u32 {
    signature.rotate_left(1) ^ (checkpoint as u32).wrapping_mul(SPREAD)
}

/// Shared flow-monitoring state. One instance serves all threads.
pub struct FlowMonitor {
    signature: AtomicU32,
    /// Expected end-of-window signature; zero means "not set".
    expected: AtomicU32,
    checkpoint_count: AtomicU32,
    last_checkpoint: AtomicU32,
    /// Low 32 bits of the last checkpoint's timestamp.
    last_checkpoint_time: AtomicU32,
    sequence_complete: AtomicBool,
    error_detected: AtomicBool,
}

impl FlowMonitor {
    pub const fn new() -> Self {
        Self {
            signature: AtomicU32::new(abi::FLOW_SIGNATURE_SEED),
            expected: AtomicU32::new(0),
            checkpoint_count: AtomicU32::new(0),
            last_checkpoint: AtomicU32::new(0),
            last_checkpoint_time: AtomicU32::new(0),
            sequence_complete: AtomicBool::new(false),
            error_detected: AtomicBool::new(false),
        }
    }

    /// Folds `checkpoint` into the signature. Callable from any thread.
    pub fn checkpoint(&self, checkpoint: u8, now_ms: u64) {
        let mut new_sig = 0;
        // The closure may run more than once under contention; it must
        // stay a pure function of the observed value.
        let _ = self.signature.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |sig| {
                new_sig = mix(sig, checkpoint);
                Some(new_sig)
            },
        );
        self.last_checkpoint
            .store(checkpoint as u32, Ordering::Relaxed);
        self.last_checkpoint_time
            .store(now_ms as u32, Ordering::Relaxed);
        self.checkpoint_count.fetch_add(1, Ordering::Relaxed);

        let expected = self.expected.load(Ordering::Relaxed);
        if expected != 0 && new_sig == expected {
            self.sequence_complete.store(true, Ordering::Relaxed);
        }
    }

    /// Verifies the current window and, on success, resets the
    /// accumulator for the next one.
    ///
    /// Failure modes: the accumulated signature disagrees with the
    /// expected value (when one is set), or no checkpoint at all was
    /// recorded since the last verification (a liveness failure). Either
    /// sets the sticky `error_detected` flag and leaves the accumulator
    /// untouched for post-mortem inspection.
    pub fn verify(&self) -> bool {
        let expected = self.expected.load(Ordering::Relaxed);
        if expected != 0 && self.signature.load(Ordering::Relaxed) != expected
        {
            self.error_detected.store(true, Ordering::Relaxed);
            return false;
        }

        if self.checkpoint_count.load(Ordering::Relaxed) == 0 {
            self.error_detected.store(true, Ordering::Relaxed);
            return false;
        }

        self.signature
            .store(abi::FLOW_SIGNATURE_SEED, Ordering::Relaxed);
        self.checkpoint_count.store(0, Ordering::Relaxed);
        self.sequence_complete.store(false, Ordering::Relaxed);
        true
    }

    /// Unconditional reset to the seed state. Clears the sticky error.
    pub fn reset(&self) {
        self.signature
            .store(abi::FLOW_SIGNATURE_SEED, Ordering::Relaxed);
        self.checkpoint_count.store(0, Ordering::Relaxed);
        self.last_checkpoint.store(0, Ordering::Relaxed);
        self.sequence_complete.store(false, Ordering::Relaxed);
        self.error_detected.store(false, Ordering::Relaxed);
    }

    /// Sets the expected end-of-window signature. Zero disables the
    /// comparison, leaving only the liveness check.
    pub fn set_expected(&self, expected: u32) {
        self.expected.store(expected, Ordering::Relaxed);
    }

    pub fn signature(&self) -> u32 {
        self.signature.load(Ordering::Relaxed)
    }

    pub fn error_detected(&self) -> bool {
        self.error_detected.load(Ordering::Relaxed)
    }

    pub fn sequence_complete(&self) -> bool {
        self.sequence_complete.load(Ordering::Relaxed)
    }

    /// Checks that `checkpoint` was the most recent one recorded and that
    /// it happened within `timeout_ms` of `now_ms`.
    pub fn checkpoint_recent(
        &self,
        checkpoint: u8,
        timeout_ms: u32,
        now_ms: u64,
    ) -> bool {
        if self.last_checkpoint.load(Ordering::Relaxed) != checkpoint as u32 {
            return false;
        }
        let stamped = self.last_checkpoint_time.load(Ordering::Relaxed);
        (now_ms as u32).wrapping_sub(stamped) <= timeout_ms
    }

    /// Computes the signature a given checkpoint sequence would produce,
    /// for deriving `set_expected` values.
    pub fn signature_of(sequence: &[u8]) -> u32 {
        sequence
            .iter()
            .fold(abi::FLOW_SIGNATURE_SEED, |sig, &cp| mix(sig, cp))
    }
}

impl Default for FlowMonitor {
    fn default() -> Self {
        Self::new()
    }
}
