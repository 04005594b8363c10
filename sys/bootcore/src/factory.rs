// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Factory calibration protocol.
//!
//! Calibration is written over a debugger connection or not at all: the
//! session refuses to start without an attached debugger, and losing the
//! attachment mid-session is an authorization failure, not a retry. The
//! debugger talks through the fixed mailbox slots defined in `abi` —
//! command word, response word, one-record data buffer.
//!
//! Response discipline: every accepted command flips the response word to
//! BUSY before any processing and to OKOK/ERRO afterwards, so an external
//! reader polling the slot never observes an indeterminate state. The
//! command word is cleared by the firmware after processing; the debugger
//! writes it, we consume it.
//!
//! Exit is earned, not granted: `EXIT` succeeds only from the Complete
//! state, which is reachable only through a successful `VRFY` of what is
//! actually in flash. `ABRT` works from anywhere.

use abi::{factory, SafetyParams};
use calstore::StoreError;

/// Protocol states, advanced by [`FactorySession::poll`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FactoryState {
    Init,
    Idle,
    ReadCal,
    WriteCal,
    Verify,
    Complete,
    Error,
}

/// How a session ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum SessionOutcome {
    /// Verified calibration, clean exit.
    Completed,
    /// Operator abort.
    Aborted,
    /// Exit requested before a successful verify.
    ExitWithoutVerify,
    /// Debugger detached (or was never attached) outside Complete.
    AuthorizationLost,
}

/// The debugger-shared mailbox. The boot binary maps this onto the fixed
/// RAM slots; tests script it.
pub trait Mailbox {
    fn command(&self) -> u32;
    fn clear_command(&mut self);
    fn set_response(&mut self, response: u32);
    fn read_record(&self) -> SafetyParams;
    fn write_record(&mut self, record: &SafetyParams);
}

/// Everything the protocol needs from the platform: authorization,
/// watchdog care, and the persisted record.
pub trait FactoryEnv {
    fn debugger_attached(&self) -> bool;
    fn feed_watchdog(&mut self);
    fn read_params(&mut self) -> Result<SafetyParams, StoreError>;
    fn write_params(&mut self, record: &SafetyParams)
        -> Result<(), StoreError>;
    /// Records `cal_valid` in the boot configuration.
    fn mark_cal_valid(&mut self) -> Result<(), StoreError>;
}

pub struct FactorySession {
    state: FactoryState,
}

impl FactorySession {
    pub fn new() -> Self {
        Self {
            state: FactoryState::Init,
        }
    }

    pub fn state(&self) -> FactoryState {
        self.state
    }

    /// Authorizes and arms the session. On success the mailbox shows
    /// READY with no command pending.
    pub fn start(
        &mut self,
        env: &mut impl FactoryEnv,
        mailbox: &mut impl Mailbox,
    ) -> Result<(), SessionOutcome> {
        if !env.debugger_attached() {
            return Err(SessionOutcome::AuthorizationLost);
        }
        mailbox.clear_command();
        mailbox.set_response(factory::RSP_READY);
        self.state = FactoryState::Idle;
        Ok(())
    }

    /// Processes at most one pending command. Returns the session
    /// outcome when a terminating command was handled.
    pub fn poll(
        &mut self,
        env: &mut impl FactoryEnv,
        mailbox: &mut impl Mailbox,
    ) -> Option<SessionOutcome> {
        let cmd = mailbox.command();
        if cmd == factory::CMD_NONE {
            return None;
        }

        mailbox.set_response(factory::RSP_BUSY);

        match cmd {
            factory::CMD_READ_CAL => {
                let ok = self.handle_read(env, mailbox);
                self.state = FactoryState::ReadCal;
                self.finish_command(mailbox, ok);
                None
            }
            factory::CMD_WRITE_CAL => {
                let ok = self.handle_write(env, mailbox);
                self.state = FactoryState::WriteCal;
                self.finish_command(mailbox, ok);
                None
            }
            factory::CMD_VERIFY => {
                let ok = self.handle_verify(env);
                self.state = if ok {
                    FactoryState::Complete
                } else {
                    FactoryState::Verify
                };
                self.finish_command(mailbox, ok);
                None
            }
            factory::CMD_EXIT => {
                if self.state == FactoryState::Complete {
                    self.finish_command(mailbox, true);
                    Some(SessionOutcome::Completed)
                } else {
                    self.finish_command(mailbox, false);
                    Some(SessionOutcome::ExitWithoutVerify)
                }
            }
            factory::CMD_ABORT => {
                self.state = FactoryState::Error;
                self.finish_command(mailbox, true);
                Some(SessionOutcome::Aborted)
            }
            _ => {
                self.finish_command(mailbox, false);
                None
            }
        }
    }

    /// Runs the session to completion: feed the dog, watch the debugger,
    /// process commands. A session that was already started continues
    /// where it left off.
    pub fn run(
        &mut self,
        env: &mut impl FactoryEnv,
        mailbox: &mut impl Mailbox,
    ) -> SessionOutcome {
        if self.state == FactoryState::Init {
            if let Err(outcome) = self.start(env, mailbox) {
                return outcome;
            }
        }
        loop {
            env.feed_watchdog();
            if !env.debugger_attached() {
                return if self.state == FactoryState::Complete {
                    SessionOutcome::Completed
                } else {
                    SessionOutcome::AuthorizationLost
                };
            }
            if let Some(outcome) = self.poll(env, mailbox) {
                return outcome;
            }
        }
    }

    fn finish_command(&mut self, mailbox: &mut impl Mailbox, ok: bool) {
        mailbox.set_response(if ok {
            factory::RSP_OK
        } else {
            factory::RSP_ERROR
        });
        mailbox.clear_command();
    }

    fn handle_read(
        &mut self,
        env: &mut impl FactoryEnv,
        mailbox: &mut impl Mailbox,
    ) -> bool {
        match env.read_params() {
            Ok(record) => {
                mailbox.write_record(&record);
                true
            }
            Err(StoreError::NotProvisioned) => {
                // Nothing stored yet; hand the debugger the defaults
                // rather than stale buffer contents.
                mailbox.write_record(&SafetyParams::defaults());
                true
            }
            Err(_) => false,
        }
    }

    fn handle_write(
        &mut self,
        env: &mut impl FactoryEnv,
        mailbox: &mut impl Mailbox,
    ) -> bool {
        let mut record = mailbox.read_record();
        // Reject out-of-range or non-finite fields before flash is
        // touched; an invalid record must never reach storage.
        if params::check_ranges(&record).is_err() {
            return false;
        }
        params::seal(&mut record);
        env.write_params(&record).is_ok()
    }

    fn handle_verify(&mut self, env: &mut impl FactoryEnv) -> bool {
        let record = match env.read_params() {
            Ok(r) => r,
            Err(_) => return false,
        };
        if params::validate(&record).is_err() {
            return false;
        }
        env.mark_cal_valid().is_ok()
    }
}

impl Default for FactorySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted debugger: whenever the firmware observes an empty
    /// command slot, the "debugger" deposits its next queued command.
    struct FakeMailbox {
        commands: std::cell::RefCell<VecDeque<u32>>,
        current: std::cell::Cell<u32>,
        responses: Vec<u32>,
        record: SafetyParams,
    }

    impl FakeMailbox {
        fn with_commands(commands: &[u32]) -> Self {
            Self {
                commands: std::cell::RefCell::new(
                    commands.iter().copied().collect(),
                ),
                current: std::cell::Cell::new(factory::CMD_NONE),
                responses: Vec::new(),
                record: SafetyParams::defaults(),
            }
        }
    }

    impl Mailbox for FakeMailbox {
        fn command(&self) -> u32 {
            if self.current.get() == factory::CMD_NONE {
                if let Some(next) = self.commands.borrow_mut().pop_front() {
                    self.current.set(next);
                }
            }
            self.current.get()
        }
        fn clear_command(&mut self) {
            self.current.set(factory::CMD_NONE);
        }
        fn set_response(&mut self, response: u32) {
            self.responses.push(response);
        }
        fn read_record(&self) -> SafetyParams {
            self.record
        }
        fn write_record(&mut self, record: &SafetyParams) {
            self.record = *record;
        }
    }

    struct FakeEnv {
        attached: bool,
        feeds: u32,
        stored: Option<SafetyParams>,
        cal_valid: bool,
        write_fails: bool,
    }

    impl FakeEnv {
        fn attached() -> Self {
            Self {
                attached: true,
                feeds: 0,
                stored: None,
                cal_valid: false,
                write_fails: false,
            }
        }
    }

    impl FactoryEnv for FakeEnv {
        fn debugger_attached(&self) -> bool {
            self.attached
        }
        fn feed_watchdog(&mut self) {
            self.feeds += 1;
        }
        fn read_params(&mut self) -> Result<SafetyParams, StoreError> {
            self.stored.ok_or(StoreError::NotProvisioned)
        }
        fn write_params(
            &mut self,
            record: &SafetyParams,
        ) -> Result<(), StoreError> {
            if self.write_fails {
                return Err(StoreError::Flash(calstore::FlashError::Timeout));
            }
            self.stored = Some(*record);
            Ok(())
        }
        fn mark_cal_valid(&mut self) -> Result<(), StoreError> {
            self.cal_valid = true;
            Ok(())
        }
    }

    fn calibration() -> SafetyParams {
        let mut p = SafetyParams::defaults();
        p.hall_offset[0] = 12.5;
        p.hall_gain[2] = 1.25;
        p
    }

    #[test]
    fn full_calibration_session() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[
            factory::CMD_WRITE_CAL,
            factory::CMD_VERIFY,
            factory::CMD_EXIT,
        ]);
        mb.record = calibration();

        let outcome = FactorySession::new().run(&mut env, &mut mb);
        assert_eq!(outcome, SessionOutcome::Completed);
        assert!(env.cal_valid);
        assert!(env.feeds > 0);

        // The persisted record is sealed and fully valid.
        let stored = env.stored.unwrap();
        assert_eq!(params::validate(&stored), Ok(()));
        assert_eq!(stored.hall_offset[0], 12.5);
    }

    #[test]
    fn responses_go_busy_then_final() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[factory::CMD_READ_CAL]);
        let mut session = FactorySession::new();
        session.start(&mut env, &mut mb).unwrap();
        assert_eq!(session.poll(&mut env, &mut mb), None);

        assert_eq!(
            mb.responses,
            [factory::RSP_READY, factory::RSP_BUSY, factory::RSP_OK]
        );
    }

    #[test]
    fn invalid_record_is_rejected_without_writing() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[factory::CMD_WRITE_CAL]);
        let mut bad = calibration();
        bad.hall_gain[0] = 99.0;
        mb.record = bad;

        let mut session = FactorySession::new();
        session.start(&mut env, &mut mb).unwrap();
        assert_eq!(session.poll(&mut env, &mut mb), None);

        assert_eq!(env.stored, None);
        assert_eq!(*mb.responses.last().unwrap(), factory::RSP_ERROR);
    }

    #[test]
    fn exit_before_verify_fails() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[
            factory::CMD_WRITE_CAL,
            factory::CMD_EXIT,
        ]);
        mb.record = calibration();

        let outcome = FactorySession::new().run(&mut env, &mut mb);
        assert_eq!(outcome, SessionOutcome::ExitWithoutVerify);
        assert!(!env.cal_valid);
    }

    #[test]
    fn verify_checks_flash_not_mailbox() {
        // A write that silently failed must make VRFY fail too.
        let mut env = FakeEnv::attached();
        env.write_fails = true;
        let mut mb = FakeMailbox::with_commands(&[
            factory::CMD_WRITE_CAL,
            factory::CMD_VERIFY,
            factory::CMD_EXIT,
        ]);
        mb.record = calibration();

        let outcome = FactorySession::new().run(&mut env, &mut mb);
        assert_eq!(outcome, SessionOutcome::ExitWithoutVerify);
        assert!(!env.cal_valid);
    }

    #[test]
    fn abort_works_from_anywhere() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[
            factory::CMD_WRITE_CAL,
            factory::CMD_ABORT,
        ]);
        mb.record = calibration();

        let outcome = FactorySession::new().run(&mut env, &mut mb);
        assert_eq!(outcome, SessionOutcome::Aborted);
    }

    #[test]
    fn detach_mid_session_loses_authorization() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[factory::CMD_READ_CAL]);
        let mut session = FactorySession::new();
        session.start(&mut env, &mut mb).unwrap();
        let _ = session.poll(&mut env, &mut mb);

        // The run loop notices the detach on its next iteration.
        env.attached = false;
        let outcome = session.run(&mut env, &mut mb);
        assert_eq!(outcome, SessionOutcome::AuthorizationLost);
    }

    #[test]
    fn session_refuses_to_start_without_debugger() {
        let mut env = FakeEnv::attached();
        env.attached = false;
        let mut mb = FakeMailbox::with_commands(&[]);
        let outcome = FactorySession::new().run(&mut env, &mut mb);
        assert_eq!(outcome, SessionOutcome::AuthorizationLost);
    }

    #[test]
    fn read_of_unprovisioned_flash_returns_defaults() {
        let mut env = FakeEnv::attached();
        let mut mb = FakeMailbox::with_commands(&[factory::CMD_READ_CAL]);
        mb.record = calibration(); // stale buffer contents

        let mut session = FactorySession::new();
        session.start(&mut env, &mut mb).unwrap();
        assert_eq!(session.poll(&mut env, &mut mb), None);

        assert_eq!(mb.record, SafetyParams::defaults());
        assert_eq!(*mb.responses.last().unwrap(), factory::RSP_OK);
    }
}
