// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The safety state machine.
//!
//! [`SafetyContext`] is the single authority over the system's safety
//! state. There is exactly one instance per boot, created before any
//! other thread exists and mutated only by the boot path and the safety
//! monitor thread; everything else observes it read-only. There are no
//! ambient globals here on purpose — tests build as many contexts as they
//! like.
//!
//! The error reaction policy is deliberately dumb: [`report_error`]
//! dispatches on the error's severity class and nothing else. Critical
//! errors force the safe state. Serious errors degrade a normal system
//! and force a degraded one safe. Warnings are logged and reported, full
//! stop. Anything cleverer belongs in the error taxonomy, not here.
//!
//! The safe state is terminal within a boot cycle. What happens there —
//! starve the watchdog and take the reset, or keep feeding and hold for
//! external intervention — is a [`SafePolicy`] choice resolved once at
//! startup. `enter_safe` returns the selected [`SafeAction`]; the
//! (possibly diverging) execution of that action belongs to the caller's
//! target shell, which keeps this crate host-testable.
//!
//! [`report_error`]: SafetyContext::report_error

#![cfg_attr(not(test), no_std)]

pub mod log;

use abi::{SafetyError, SafetyState, Severity};
use log::{ErrorLog, ErrorLogEntry};

/// Notification hooks for error and state-change events.
/// Implementations must be quick and must not call back into the
/// context.
pub trait SafetyHooks {
    fn on_error(&mut self, error: SafetyError);
    fn on_state_change(&mut self, old: SafetyState, new: SafetyState);
    /// Drive every safety-critical output to its defined safe value.
    fn set_safe_outputs(&mut self);
}

/// Hooks that do nothing, for early boot and tests.
pub struct NullHooks;

impl SafetyHooks for NullHooks {
    fn on_error(&mut self, _error: SafetyError) {}
    fn on_state_change(&mut self, _old: SafetyState, _new: SafetyState) {}
    fn set_safe_outputs(&mut self) {}
}

/// Start-up-resolved policy values. One instance, built by the platform
/// init code, never changed afterwards.
#[derive(Copy, Clone, Debug)]
pub struct SafePolicy {
    /// When false, Serious errors skip degraded mode and go straight to
    /// the safe state.
    pub degraded_mode_enabled: bool,
    /// What to do after entering the safe state: keep feeding the
    /// watchdog (hold for external intervention) or stop and let it
    /// reset the processor.
    pub feed_watchdog_in_safe: bool,
    /// Maximum degraded-mode residency before the system is forced safe.
    pub degraded_timeout_ms: u64,
}

impl Default for SafePolicy {
    fn default() -> Self {
        Self {
            degraded_mode_enabled: true,
            feed_watchdog_in_safe: true,
            degraded_timeout_ms: abi::DEGRADED_TIMEOUT_MS,
        }
    }
}

/// The terminal action selected by the policy on entry to the safe state.
/// Marked `must_use`: dropping this on the floor means the system never
/// actually becomes safe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum SafeAction {
    /// Keep feeding the watchdog; outputs stay safe until someone with a
    /// debugger or a power switch intervenes.
    FeedAndHold,
    /// Disable interrupts and busy-wait for the watchdog reset.
    HaltForWatchdogReset,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateError {
    /// The requested edge is not in the transition table. State is
    /// unchanged.
    InvalidTransition {
        from: SafetyState,
        to: SafetyState,
    },
    /// Normal operation requested before the startup tests passed.
    StartupIncomplete,
}

/// Process-wide safety context. See the crate docs for the ownership
/// rules.
pub struct SafetyContext {
    state: SafetyState,
    last_error: Option<SafetyError>,
    error_count: u32,
    startup_test_passed: bool,
    params_valid: bool,
    mpu_enabled: bool,
    watchdog_active: bool,
    startup_time_ms: u64,
    degraded_enter_ms: u64,
    policy: SafePolicy,
    log: ErrorLog,
}

impl SafetyContext {
    pub fn new(policy: SafePolicy, now_ms: u64) -> Self {
        Self {
            state: SafetyState::Init,
            last_error: None,
            error_count: 0,
            startup_test_passed: false,
            params_valid: false,
            mpu_enabled: false,
            watchdog_active: false,
            startup_time_ms: now_ms,
            degraded_enter_ms: 0,
            policy,
            log: ErrorLog::new(),
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn last_error(&self) -> Option<SafetyError> {
        self.last_error
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn policy(&self) -> &SafePolicy {
        &self.policy
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.log
    }

    pub fn uptime_ms(&self, now_ms: u64) -> u64 {
        now_ms.wrapping_sub(self.startup_time_ms)
    }

    /// True while the system is allowed to do useful work.
    pub fn is_operational(&self) -> bool {
        matches!(self.state, SafetyState::Normal | SafetyState::Degraded)
    }

    pub fn startup_test_passed(&self) -> bool {
        self.startup_test_passed
    }

    pub fn params_valid(&self) -> bool {
        self.params_valid
    }

    pub fn set_params_valid(&mut self, valid: bool) {
        self.params_valid = valid;
    }

    pub fn set_mpu_enabled(&mut self, enabled: bool) {
        self.mpu_enabled = enabled;
    }

    pub fn mpu_enabled(&self) -> bool {
        self.mpu_enabled
    }

    pub fn set_watchdog_active(&mut self, active: bool) {
        self.watchdog_active = active;
    }

    pub fn watchdog_active(&self) -> bool {
        self.watchdog_active
    }

    /// Requests a transition to `new`. Edges outside the table fail with
    /// `InvalidTransition` and leave the state untouched; the safe state
    /// rejects everything.
    pub fn set_state(
        &mut self,
        hooks: &mut impl SafetyHooks,
        new: SafetyState,
    ) -> Result<(), StateError> {
        let old = self.state;
        if !old.can_transition_to(new) {
            return Err(StateError::InvalidTransition { from: old, to: new });
        }
        self.state = new;
        hooks.on_state_change(old, new);
        Ok(())
    }

    /// Init -> StartupTest, at the head of the startup sequence.
    pub fn begin_startup_test(
        &mut self,
        hooks: &mut impl SafetyHooks,
    ) -> Result<(), StateError> {
        self.set_state(hooks, SafetyState::StartupTest)
    }

    /// Records that the startup test battery passed. A prerequisite for
    /// [`SafetyContext::enter_normal`].
    pub fn mark_startup_passed(&mut self) {
        self.startup_test_passed = true;
    }

    /// StartupTest -> Normal, gated on the startup tests having passed.
    pub fn enter_normal(
        &mut self,
        hooks: &mut impl SafetyHooks,
    ) -> Result<(), StateError> {
        if !self.startup_test_passed {
            return Err(StateError::StartupIncomplete);
        }
        self.set_state(hooks, SafetyState::Normal)
    }

    /// Degraded -> Normal, after the condition that degraded us clears.
    pub fn recover_to_normal(
        &mut self,
        hooks: &mut impl SafetyHooks,
    ) -> Result<(), StateError> {
        if self.state != SafetyState::Degraded {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: SafetyState::Normal,
            });
        }
        self.set_state(hooks, SafetyState::Normal)
    }

    /// Enters degraded mode because of `error`. Only valid from Normal;
    /// with degraded mode disabled by policy this goes straight to the
    /// safe state and reports the action the caller must execute.
    pub fn enter_degraded(
        &mut self,
        hooks: &mut impl SafetyHooks,
        error: SafetyError,
        now_ms: u64,
    ) -> Result<(), SafeAction> {
        if !self.policy.degraded_mode_enabled {
            return Err(self.enter_safe(hooks, error, now_ms));
        }
        if self.state == SafetyState::Normal {
            let old = self.state;
            self.state = SafetyState::Degraded;
            self.degraded_enter_ms = now_ms;
            self.last_error = Some(error);
            hooks.on_state_change(old, SafetyState::Degraded);
            hooks.on_error(error);
        }
        Ok(())
    }

    /// Forces the safe state. Irreversible within this boot cycle: once
    /// here, every further state-changing call is rejected and repeat
    /// entries are no-ops that just restate the policy action.
    pub fn enter_safe(
        &mut self,
        hooks: &mut impl SafetyHooks,
        error: SafetyError,
        now_ms: u64,
    ) -> SafeAction {
        let action = if self.policy.feed_watchdog_in_safe {
            SafeAction::FeedAndHold
        } else {
            SafeAction::HaltForWatchdogReset
        };

        if self.state == SafetyState::Safe {
            return action;
        }

        self.log.push(ErrorLogEntry {
            timestamp_ms: now_ms,
            code: error.code(),
            param1: 0,
            param2: 0,
        });

        hooks.set_safe_outputs();

        let old = self.state;
        self.state = SafetyState::Safe;
        self.last_error = Some(error);
        self.error_count = self.error_count.saturating_add(1);

        hooks.on_state_change(old, SafetyState::Safe);
        hooks.on_error(error);

        action
    }

    /// The primary error entry point: logs unconditionally, then reacts
    /// purely according to the error's severity class.
    ///
    /// Returns the safe action when the reaction reached the safe state;
    /// the caller must execute it.
    pub fn report_error(
        &mut self,
        hooks: &mut impl SafetyHooks,
        error: SafetyError,
        param1: u32,
        param2: u32,
        now_ms: u64,
    ) -> Option<SafeAction> {
        // The log write happens before and independent of whatever the
        // dispatch below decides; no error is ever silently dropped.
        self.log.push(ErrorLogEntry {
            timestamp_ms: now_ms,
            code: error.code(),
            param1,
            param2,
        });

        self.last_error = Some(error);
        self.error_count = self.error_count.saturating_add(1);

        match error.severity() {
            Severity::Critical => {
                Some(self.enter_safe(hooks, error, now_ms))
            }
            Severity::Serious => match self.state {
                SafetyState::Normal => {
                    match self.enter_degraded(hooks, error, now_ms) {
                        Ok(()) => None,
                        Err(action) => Some(action),
                    }
                }
                SafetyState::Degraded => {
                    // One shed of functionality has already been spent.
                    Some(self.enter_safe(hooks, error, now_ms))
                }
                _ => {
                    hooks.on_error(error);
                    None
                }
            },
            Severity::Warning => {
                hooks.on_error(error);
                None
            }
        }
    }

    /// Fault-handler entry: a processor fault bypasses the severity
    /// dispatch and forces the safe state directly, with the fault
    /// details in the log params.
    pub fn handle_fault(
        &mut self,
        hooks: &mut impl SafetyHooks,
        error: SafetyError,
        param1: u32,
        param2: u32,
        now_ms: u64,
    ) -> SafeAction {
        self.log.push(ErrorLogEntry {
            timestamp_ms: now_ms,
            code: error.code(),
            param1,
            param2,
        });
        self.last_error = Some(error);
        self.error_count = self.error_count.saturating_add(1);
        self.enter_safe(hooks, error, now_ms)
    }

    /// Enforces the degraded-mode residency bound. Call once per monitor
    /// cycle.
    pub fn check_degraded_timeout(
        &mut self,
        hooks: &mut impl SafetyHooks,
        now_ms: u64,
    ) -> Option<SafeAction> {
        if self.state != SafetyState::Degraded {
            return None;
        }
        let resident = now_ms.wrapping_sub(self.degraded_enter_ms);
        if resident > self.policy.degraded_timeout_ms {
            Some(self.enter_safe(hooks, SafetyError::Internal, now_ms))
        } else {
            None
        }
    }

    /// Clears the latched error. Permitted only in Normal.
    pub fn clear_error(&mut self) -> Result<(), StateError> {
        if self.state != SafetyState::Normal {
            return Err(StateError::InvalidTransition {
                from: self.state,
                to: self.state,
            });
        }
        self.last_error = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHooks {
        errors: Vec<SafetyError>,
        transitions: Vec<(SafetyState, SafetyState)>,
        safe_outputs_set: u32,
    }

    impl SafetyHooks for RecordingHooks {
        fn on_error(&mut self, error: SafetyError) {
            self.errors.push(error);
        }
        fn on_state_change(&mut self, old: SafetyState, new: SafetyState) {
            self.transitions.push((old, new));
        }
        fn set_safe_outputs(&mut self) {
            self.safe_outputs_set += 1;
        }
    }

    fn normal_context(hooks: &mut RecordingHooks) -> SafetyContext {
        let mut ctx = SafetyContext::new(SafePolicy::default(), 0);
        ctx.begin_startup_test(hooks).unwrap();
        ctx.mark_startup_passed();
        ctx.enter_normal(hooks).unwrap();
        ctx
    }

    #[test]
    fn normal_requires_startup_pass() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = SafetyContext::new(SafePolicy::default(), 0);
        ctx.begin_startup_test(&mut hooks).unwrap();
        assert_eq!(
            ctx.enter_normal(&mut hooks),
            Err(StateError::StartupIncomplete)
        );
        ctx.mark_startup_passed();
        ctx.enter_normal(&mut hooks).unwrap();
        assert!(ctx.is_operational());
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        let err = ctx.set_state(&mut hooks, SafetyState::Init).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: SafetyState::Normal,
                to: SafetyState::Init
            }
        );
        assert_eq!(ctx.state(), SafetyState::Normal);
    }

    #[test]
    fn safe_state_is_terminal() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        let _ = ctx.enter_safe(&mut hooks, SafetyError::Nmi, 10);
        assert_eq!(ctx.state(), SafetyState::Safe);

        for target in [
            SafetyState::Init,
            SafetyState::StartupTest,
            SafetyState::Normal,
            SafetyState::Degraded,
            SafetyState::Safe,
        ] {
            assert!(ctx.set_state(&mut hooks, target).is_err());
        }
        assert_eq!(ctx.state(), SafetyState::Safe);
    }

    #[test]
    fn critical_error_forces_safe() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        let action =
            ctx.report_error(&mut hooks, SafetyError::RamTest, 0xDEAD, 0, 5);
        assert_eq!(action, Some(SafeAction::FeedAndHold));
        assert_eq!(ctx.state(), SafetyState::Safe);
        assert_eq!(hooks.safe_outputs_set, 1);
        assert_eq!(ctx.last_error(), Some(SafetyError::RamTest));
    }

    #[test]
    fn serious_error_escalates_through_degraded() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);

        // First Serious error: shed functionality, keep running.
        let action =
            ctx.report_error(&mut hooks, SafetyError::FlashCrc, 1, 2, 100);
        assert_eq!(action, None);
        assert_eq!(ctx.state(), SafetyState::Degraded);
        assert!(ctx.is_operational());

        // Second Serious error while degraded: out of chances.
        let action =
            ctx.report_error(&mut hooks, SafetyError::FlowMonitor, 0, 0, 200);
        assert_eq!(action, Some(SafeAction::FeedAndHold));
        assert_eq!(ctx.state(), SafetyState::Safe);
    }

    #[test]
    fn warning_only_notifies() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        let action =
            ctx.report_error(&mut hooks, SafetyError::ParamInvalid, 3, 0, 50);
        assert_eq!(action, None);
        assert_eq!(ctx.state(), SafetyState::Normal);
        assert_eq!(hooks.errors, [SafetyError::ParamInvalid]);
        assert_eq!(ctx.error_count(), 1);
    }

    #[test]
    fn errors_in_safe_state_still_log() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        let _ = ctx.enter_safe(&mut hooks, SafetyError::Nmi, 0);
        let before = ctx.error_log().len();

        let action =
            ctx.report_error(&mut hooks, SafetyError::FlashCrc, 0, 0, 10);
        // Already safe; the repeat action is restated, no transition.
        assert_eq!(action, Some(SafeAction::FeedAndHold));
        assert_eq!(ctx.error_log().len(), before + 1);
    }

    #[test]
    fn degraded_timeout_forces_safe() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        ctx.report_error(&mut hooks, SafetyError::Clock, 0, 0, 1_000);
        assert_eq!(ctx.state(), SafetyState::Degraded);

        assert_eq!(ctx.check_degraded_timeout(&mut hooks, 20_000), None);
        let action = ctx.check_degraded_timeout(&mut hooks, 32_000);
        assert_eq!(action, Some(SafeAction::FeedAndHold));
        assert_eq!(ctx.state(), SafetyState::Safe);
        assert_eq!(ctx.last_error(), Some(SafetyError::Internal));
    }

    #[test]
    fn recovery_from_degraded() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        ctx.report_error(&mut hooks, SafetyError::Clock, 0, 0, 0);
        assert_eq!(ctx.state(), SafetyState::Degraded);
        ctx.recover_to_normal(&mut hooks).unwrap();
        assert_eq!(ctx.state(), SafetyState::Normal);
        // Recovery is only legal from Degraded.
        assert!(ctx.recover_to_normal(&mut hooks).is_err());
    }

    #[test]
    fn policy_halt_action() {
        let mut hooks = RecordingHooks::default();
        let policy = SafePolicy {
            feed_watchdog_in_safe: false,
            ..SafePolicy::default()
        };
        let mut ctx = SafetyContext::new(policy, 0);
        let action = ctx.enter_safe(&mut hooks, SafetyError::CpuTest, 0);
        assert_eq!(action, SafeAction::HaltForWatchdogReset);
    }

    #[test]
    fn policy_without_degraded_mode_goes_straight_safe() {
        let mut hooks = RecordingHooks::default();
        let policy = SafePolicy {
            degraded_mode_enabled: false,
            ..SafePolicy::default()
        };
        let mut ctx = SafetyContext::new(policy, 0);
        ctx.begin_startup_test(&mut hooks).unwrap();
        ctx.mark_startup_passed();
        ctx.enter_normal(&mut hooks).unwrap();

        let action =
            ctx.report_error(&mut hooks, SafetyError::FlashCrc, 0, 0, 0);
        assert_eq!(action, Some(SafeAction::FeedAndHold));
        assert_eq!(ctx.state(), SafetyState::Safe);
    }

    #[test]
    fn fault_handler_reaches_safe_from_any_state() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = SafetyContext::new(SafePolicy::default(), 0);
        // Still in Init; a hard fault must not be deferred.
        let action = ctx.handle_fault(
            &mut hooks,
            SafetyError::HardFault,
            0x2000_0100,
            0,
            1,
        );
        assert_eq!(action, SafeAction::FeedAndHold);
        assert_eq!(ctx.state(), SafetyState::Safe);
        let newest = ctx.error_log().iter_recent().next().unwrap();
        assert_eq!(newest.param1, 0x2000_0100);
    }

    #[test]
    fn clear_error_only_in_normal() {
        let mut hooks = RecordingHooks::default();
        let mut ctx = normal_context(&mut hooks);
        ctx.report_error(&mut hooks, SafetyError::RuntimeTest, 0, 0, 0);
        assert!(ctx.clear_error().is_ok());
        assert_eq!(ctx.last_error(), None);

        ctx.report_error(&mut hooks, SafetyError::Clock, 0, 0, 0);
        assert_eq!(ctx.state(), SafetyState::Degraded);
        assert!(ctx.clear_error().is_err());
    }

    #[test]
    fn transitions_are_reported_to_hooks() {
        let mut hooks = RecordingHooks::default();
        let _ctx = normal_context(&mut hooks);
        assert_eq!(
            hooks.transitions,
            [
                (SafetyState::Init, SafetyState::StartupTest),
                (SafetyState::StartupTest, SafetyState::Normal),
            ]
        );
    }
}
