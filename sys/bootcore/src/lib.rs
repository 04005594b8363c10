// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-stage decision logic.
//!
//! The sequencer is a strictly ordered, one-shot state machine:
//! Init -> SelfTest -> ValidateParams -> CheckConfig -> [FactoryMode] ->
//! VerifyApp -> JumpToApp, with the safe state reachable from every step
//! on failure. It runs over the [`BootEnv`] trait and returns a terminal
//! [`BootOutcome`]; the irreversible actions — the application jump, the
//! processor reset, the safe-state halt — are executed by the boot binary,
//! which keeps every decision in this crate host-testable.
//!
//! A completed factory session never falls through into the application:
//! the factory-mode flag is cleared and a reset is requested, so the boot
//! sequence always restarts from Init after any configuration change.

#![cfg_attr(not(test), no_std)]

pub mod factory;
pub mod flow;
pub mod image;

use abi::checkpoint;
use calstore::{ConfigFlash, StoreError};
use flow::BootFlow;
use image::{ImageError, ImageInfo};
use params::ParamError;
use selftest::SelfTestError;

/// Sequencer states, in visit order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootState {
    Init,
    SelfTest,
    ValidateParams,
    CheckConfig,
    FactoryMode,
    VerifyApp,
    JumpToApp,
    Safe,
}

/// Why a boot ended in the safe state.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BootError {
    SelfTest(SelfTestError),
    ParamStore(StoreError),
    ParamInvalid(ParamError),
    AppImage(ImageError),
    AppCrc { computed: u32, expected: u32 },
    FlowMismatch { signature: u32 },
    ConfigWrite(StoreError),
}

impl BootError {
    /// Maps to the shared error taxonomy for logs and diagnostics.
    pub fn safety_error(&self) -> abi::SafetyError {
        match self {
            Self::SelfTest(SelfTestError::Cpu) => abi::SafetyError::CpuTest,
            Self::SelfTest(SelfTestError::Ram { .. }) => {
                abi::SafetyError::RamTest
            }
            Self::SelfTest(SelfTestError::FlashCrc { .. }) => {
                abi::SafetyError::FlashCrc
            }
            Self::SelfTest(SelfTestError::Clock { .. }) => {
                abi::SafetyError::Clock
            }
            Self::ParamStore(_) | Self::ParamInvalid(_) => {
                abi::SafetyError::ParamInvalid
            }
            Self::AppImage(_) | Self::AppCrc { .. } => {
                abi::SafetyError::FlashCrc
            }
            Self::FlowMismatch { .. } => abi::SafetyError::FlowMonitor,
            Self::ConfigWrite(_) => abi::SafetyError::Internal,
        }
    }
}

/// Terminal result of a boot attempt. Exactly one of these comes out of
/// every [`BootSequencer::run`].
#[derive(Copy, Clone, Debug, PartialEq)]
#[must_use]
pub enum BootOutcome {
    /// Hand control to the application at these vectors. Never returns.
    JumpToApp(ImageInfo),
    /// Enter the boot safe state with the given cause.
    Safe(BootError),
    /// A factory session ran; reset the processor.
    ResetAfterFactory,
}

/// Platform surface consumed by the sequencer.
pub trait BootEnv {
    type Flash: ConfigFlash;

    fn flash(&mut self) -> &mut Self::Flash;

    /// The full startup self-test battery (CPU, RAM, boot image CRC,
    /// clock), fail-fast.
    fn run_selftest(&mut self) -> Result<(), SelfTestError>;

    /// First two words of the application's vector table.
    fn app_vectors(&self) -> ImageInfo;

    /// Application image payload and its stored trailing CRC.
    fn app_image(&self) -> (&[u8], u32);

    /// Runs a factory calibration session to completion.
    fn run_factory_session(&mut self) -> factory::SessionOutcome;
}

pub struct BootSequencer {
    state: BootState,
    flow: BootFlow,
}

impl BootSequencer {
    pub fn new() -> Self {
        Self {
            state: BootState::Init,
            flow: BootFlow::new(),
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn run(&mut self, env: &mut impl BootEnv) -> BootOutcome {
        self.state = BootState::Init;
        self.flow.checkpoint(checkpoint::BOOT_INIT);

        self.state = BootState::SelfTest;
        self.flow.checkpoint(checkpoint::BOOT_SELFTEST_START);
        if let Err(e) = env.run_selftest() {
            return self.fail(BootError::SelfTest(e));
        }
        self.flow.checkpoint(checkpoint::BOOT_SELFTEST_END);

        self.state = BootState::ValidateParams;
        self.flow.checkpoint(checkpoint::BOOT_PARAMS_CHECK);
        let record = match calstore::read_params(env.flash()) {
            Ok(r) => r,
            Err(e) => return self.fail(BootError::ParamStore(e)),
        };
        if let Err(e) = params::validate(&record) {
            return self.fail(BootError::ParamInvalid(e));
        }

        // Non-safety parameters: corruption falls back to defaults and is
        // not a reason to refuse to boot.
        let _comm = calstore::read_nonsafety_or_defaults(env.flash());

        self.state = BootState::CheckConfig;
        self.flow.checkpoint(checkpoint::BOOT_CONFIG_CHECK);
        let config = match calstore::read_boot_config(env.flash()) {
            Ok(mut cfg) => {
                cfg.boot_count = cfg.boot_count.wrapping_add(1);
                if let Err(e) =
                    calstore::write_boot_config(env.flash(), &mut cfg)
                {
                    return self.fail(BootError::ConfigWrite(e));
                }
                Some(cfg)
            }
            // An unreadable config skips the factory check; the boot
            // continues on the assumption of normal mode.
            Err(_) => None,
        };

        if let Some(mut cfg) = config {
            if cfg.factory_mode != 0 {
                self.state = BootState::FactoryMode;
                let _outcome = env.run_factory_session();

                // Whatever the session did, the flag is consumed and the
                // processor restarts from a clean slate.
                cfg.factory_mode = 0;
                if let Err(e) =
                    calstore::write_boot_config(env.flash(), &mut cfg)
                {
                    return self.fail(BootError::ConfigWrite(e));
                }
                return BootOutcome::ResetAfterFactory;
            }
        }

        self.state = BootState::VerifyApp;
        self.flow.checkpoint(checkpoint::BOOT_APP_VERIFY);
        let vectors = env.app_vectors();
        if let Err(e) = image::check_plausibility(vectors) {
            return self.fail(BootError::AppImage(e));
        }
        let (payload, expected) = env.app_image();
        let computed = integrity::crc32_bytes(payload);
        if computed != expected {
            return self.fail(BootError::AppCrc { computed, expected });
        }

        self.state = BootState::JumpToApp;
        self.flow.checkpoint(checkpoint::BOOT_JUMP_PREPARE);
        if !self.flow.verify(flow::JUMP_SIGNATURE) {
            return self.fail(BootError::FlowMismatch {
                signature: self.flow.signature(),
            });
        }
        self.flow.checkpoint(checkpoint::BOOT_JUMP_EXECUTE);

        BootOutcome::JumpToApp(vectors)
    }

    fn fail(&mut self, error: BootError) -> BootOutcome {
        self.state = BootState::Safe;
        BootOutcome::Safe(error)
    }
}

impl Default for BootSequencer {
    fn default() -> Self {
        Self::new()
    }
}
