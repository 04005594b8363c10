// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The safety monitor thread.
//!
//! This is the highest-priority thread in the application, woken by a
//! fixed-period sleep and never time-sliced. It is the sole writer of the
//! watchdog, flow, and self-test state and the only runtime caller of the
//! safety state machine's mutating entry points; application threads
//! limit themselves to reporting liveness tokens and recording flow
//! checkpoints.
//!
//! Each cycle: record the monitor's own checkpoint and token, run the
//! watchdog liveness protocol, then multiplex the slower periodic checks
//! (stack watermarks, flow verification, the incremental image CRC, the
//! calibration CRC re-check) and enforce the degraded-mode residency
//! bound.
//!
//! The thread itself (stack, priority, creation) belongs to the RTOS and
//! is consumed through the [`Kernel`] trait; [`SafetyMonitor::step`] is
//! one cycle of the loop, which is what the tests drive.

#![cfg_attr(not(test), no_std)]

pub mod diag;
pub mod fault;
pub mod schedule;

use abi::{checkpoint, token, SafetyError};
use calstore::ConfigFlash;
use flowmon::FlowMonitor;
use liveness::{FeedOutcome, LivenessMonitor, TokenBoard, Watchdog};
use safecore::{SafeAction, SafetyContext, SafetyHooks};
use schedule::{Check, Schedule};
use selftest::{CrcProgress, FlashCrcCheck, SelfTestError};
use stackmon::{StackMonitor, StackVerdict};

/// The RTOS surface the monitor needs. Thread creation and scheduling
/// stay outside; this is just time, sleep, and the terminal halt.
pub trait Kernel {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
    fn sysclk_hz(&self) -> u32;
    /// Disables interrupts and parks the core for the watchdog reset.
    fn halt(&self) -> !;
}

/// Cycle counters, surfaced by diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MonitorStats {
    pub run_count: u32,
    pub wdg_feeds: u32,
    pub selftest_runs: u32,
    pub stack_checks: u32,
    pub flow_checks: u32,
    pub param_checks: u32,
    pub errors_detected: u32,
}

pub struct SafetyMonitor<'a, P, W, F>
where
    P: Watchdog,
    W: Watchdog,
    F: ConfigFlash,
{
    ctx: &'a mut SafetyContext,
    board: &'a TokenBoard,
    flow: &'a FlowMonitor,
    liveness: LivenessMonitor<'a>,
    validator: params::Validator,
    stacks: StackMonitor,
    schedule: Schedule,
    flash_check: Option<FlashCrcCheck>,
    stats: MonitorStats,
    primary: P,
    windowed: Option<W>,
    flash: F,
    ram_test: &'a mut [u32],
    app_payload: &'a [u8],
    app_crc: u32,
}

impl<'a, P, W, F> SafetyMonitor<'a, P, W, F>
where
    P: Watchdog,
    W: Watchdog,
    F: ConfigFlash,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &'a mut SafetyContext,
        board: &'a TokenBoard,
        flow: &'a FlowMonitor,
        primary: P,
        windowed: Option<W>,
        flash: F,
        ram_test: &'a mut [u32],
        app_payload: &'a [u8],
        app_crc: u32,
        now_ms: u64,
    ) -> Self {
        Self {
            liveness: LivenessMonitor::new(board),
            ctx,
            board,
            flow,
            validator: params::Validator::new(),
            stacks: StackMonitor::new(),
            schedule: Schedule::new(now_ms),
            flash_check: None,
            stats: MonitorStats::default(),
            primary,
            windowed,
            flash,
            ram_test,
            app_payload,
            app_crc,
        }
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn stacks_mut(&mut self) -> &mut StackMonitor {
        &mut self.stacks
    }

    /// Startup sequence: state machine into StartupTest, the full
    /// self-test battery, parameter re-validation, then Normal and the
    /// watchdog armed. A self-test failure is terminal; it is never
    /// retried.
    pub fn startup(
        &mut self,
        hooks: &mut impl SafetyHooks,
        now_ms: u64,
        sysclk_hz: u32,
    ) -> Result<(), SafeAction> {
        self.flow.checkpoint(checkpoint::APP_INIT, now_ms);

        if self.ctx.begin_startup_test(hooks).is_err() {
            return Err(self.ctx.enter_safe(
                hooks,
                SafetyError::Internal,
                now_ms,
            ));
        }

        if let Err(e) = selftest::run_startup(
            self.ram_test,
            self.app_payload,
            self.app_crc,
            sysclk_hz,
        ) {
            let (error, p1, p2) = describe_selftest_error(&e);
            return Err(self.ctx.handle_fault(hooks, error, p1, p2, now_ms));
        }
        self.ctx.mark_startup_passed();

        // Re-validate the calibration the boot stage accepted. Failure
        // here is a Warning: the boot copy was good enough to boot, and
        // the application decides what to disable without it.
        match calstore::read_params(&self.flash) {
            Ok(record) if self.validator.validate(&record).is_ok() => {
                self.ctx.set_params_valid(true);
            }
            _ => {
                self.ctx.set_params_valid(false);
                let _ = self.ctx.report_error(
                    hooks,
                    SafetyError::ParamInvalid,
                    0,
                    0,
                    now_ms,
                );
            }
        }

        if self.ctx.enter_normal(hooks).is_err() {
            return Err(self.ctx.enter_safe(
                hooks,
                SafetyError::Internal,
                now_ms,
            ));
        }

        self.liveness.start(now_ms);
        self.ctx.set_watchdog_active(true);
        Ok(())
    }

    /// One monitor cycle. Returns the safe action when any check forced
    /// the safe state; the caller executes it.
    pub fn step(
        &mut self,
        hooks: &mut impl SafetyHooks,
        now_ms: u64,
    ) -> Option<SafeAction> {
        self.stats.run_count = self.stats.run_count.wrapping_add(1);
        self.flow.checkpoint(checkpoint::APP_SAFETY_MONITOR, now_ms);
        self.board.report(token::SAFETY, now_ms);

        match self.liveness.process(
            now_ms,
            &mut self.primary,
            self.windowed.as_mut(),
        ) {
            FeedOutcome::Idle => {}
            FeedOutcome::Fed | FeedOutcome::FedDegraded => {
                self.stats.wdg_feeds += 1;
                self.flow.checkpoint(checkpoint::APP_WATCHDOG_FEED, now_ms);
            }
            FeedOutcome::TokensMissing { received, required } => {
                // The dog was still fed; the reaction is the state
                // machine's call.
                self.stats.wdg_feeds += 1;
                self.stats.errors_detected += 1;
                if let Some(action) = self.ctx.report_error(
                    hooks,
                    SafetyError::Watchdog,
                    u32::from(received),
                    u32::from(required),
                    now_ms,
                ) {
                    return Some(action);
                }
            }
        }

        if self.schedule.due(Check::Stack, now_ms) {
            self.stats.stack_checks += 1;
            if let Some(worst) = self.stacks.check_all() {
                if let StackVerdict::Critical { percent } = worst.verdict {
                    self.stats.errors_detected += 1;
                    if let Some(action) = self.ctx.report_error(
                        hooks,
                        SafetyError::StackOverflow,
                        worst.slot as u32,
                        percent,
                        now_ms,
                    ) {
                        return Some(action);
                    }
                }
            }
        }

        if self.schedule.due(Check::FlowVerify, now_ms) {
            self.stats.flow_checks += 1;
            if !self.flow.verify() {
                self.stats.errors_detected += 1;
                let signature = self.flow.signature();
                let action = self.ctx.report_error(
                    hooks,
                    SafetyError::FlowMonitor,
                    signature,
                    0,
                    now_ms,
                );
                // Start a clean window either way; a stuck accumulator
                // would turn one fault into a permanent error source.
                self.flow.reset();
                self.flow.checkpoint(checkpoint::APP_SAFETY_MONITOR, now_ms);
                if let Some(action) = action {
                    return Some(action);
                }
            }
        }

        if self.schedule.due(Check::ParamCrc, now_ms)
            && self.validator.is_valid()
        {
            self.stats.param_checks += 1;
            self.flow.checkpoint(checkpoint::APP_PARAM_CHECK, now_ms);
            let drifted = match calstore::read_params_unchecked(&self.flash) {
                Ok(persisted) => {
                    self.validator.periodic_check(&persisted).is_err()
                }
                Err(_) => true,
            };
            if drifted {
                self.stats.errors_detected += 1;
                self.ctx.set_params_valid(false);
                if let Some(action) = self.ctx.report_error(
                    hooks,
                    SafetyError::ParamInvalid,
                    0,
                    1,
                    now_ms,
                ) {
                    return Some(action);
                }
            }
        }

        if self.schedule.due(Check::FlashCrc, now_ms)
            && self.flash_check.is_none()
        {
            self.flow.checkpoint(checkpoint::APP_SELFTEST_START, now_ms);
            self.flash_check = Some(FlashCrcCheck::new());
        }
        // One bounded block per cycle; the image check never owns the
        // whole cycle.
        if let Some(check) = self.flash_check.as_mut() {
            match check.step(self.app_payload, self.app_crc) {
                CrcProgress::InProgress { .. } => {}
                CrcProgress::Done(result) => {
                    self.flash_check = None;
                    self.stats.selftest_runs += 1;
                    self.flow.checkpoint(checkpoint::APP_SELFTEST_END, now_ms);
                    if let Err(SelfTestError::FlashCrc {
                        computed,
                        expected,
                    }) = result
                    {
                        self.stats.errors_detected += 1;
                        if let Some(action) = self.ctx.report_error(
                            hooks,
                            SafetyError::FlashCrc,
                            computed,
                            expected,
                            now_ms,
                        ) {
                            return Some(action);
                        }
                    }
                }
            }
        }

        self.ctx.check_degraded_timeout(hooks, now_ms)
    }

    /// Early-wakeup interrupt path for the windowed watchdog: one last
    /// chance to refresh, and if the tokens do not justify it, the near
    /// miss is logged before the hardware reset lands.
    pub fn window_warning(
        &mut self,
        hooks: &mut impl SafetyHooks,
        now_ms: u64,
    ) {
        let Some(windowed) = self.windowed.as_mut() else {
            return;
        };
        match self.liveness.handle_window_warning(now_ms, windowed) {
            liveness::WindowWarning::Recovered => {}
            liveness::WindowWarning::NearMiss { received } => {
                self.stats.errors_detected += 1;
                let _ = self.ctx.report_error(
                    hooks,
                    SafetyError::Watchdog,
                    0xAADD_0000,
                    u32::from(received),
                    now_ms,
                );
            }
        }
    }

    /// The thread body. Runs startup, then cycles forever; a safe-state
    /// decision ends in the policy's terminal behavior.
    pub fn run(
        mut self,
        kernel: &impl Kernel,
        hooks: &mut impl SafetyHooks,
    ) -> ! {
        if let Err(action) =
            self.startup(hooks, kernel.now_ms(), kernel.sysclk_hz())
        {
            self.hold_safe(kernel, action);
        }
        loop {
            if let Some(action) = self.step(hooks, kernel.now_ms()) {
                self.hold_safe(kernel, action);
            }
            kernel.sleep_ms(abi::SAFETY_MONITOR_PERIOD_MS);
        }
    }

    fn hold_safe(&mut self, kernel: &impl Kernel, action: SafeAction) -> ! {
        match action {
            SafeAction::HaltForWatchdogReset => kernel.halt(),
            SafeAction::FeedAndHold => loop {
                // Outputs are safe; keep the dogs alive until someone
                // intervenes from outside.
                self.primary.feed();
                if let Some(w) = self.windowed.as_mut() {
                    w.feed();
                }
                kernel.sleep_ms(abi::WDG_FEED_PERIOD_MS / 2);
            },
        }
    }
}

fn describe_selftest_error(e: &SelfTestError) -> (SafetyError, u32, u32) {
    match *e {
        SelfTestError::Cpu => (SafetyError::CpuTest, 0, 0),
        SelfTestError::Ram { index } => {
            (SafetyError::RamTest, index as u32, 0)
        }
        SelfTestError::FlashCrc { computed, expected } => {
            (SafetyError::FlashCrc, computed, expected)
        }
        SelfTestError::Clock { measured_hz } => {
            (SafetyError::Clock, measured_hz, abi::EXPECTED_SYSCLK_HZ)
        }
    }
}
