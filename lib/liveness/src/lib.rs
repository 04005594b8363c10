// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-thread watchdog liveness accounting.
//!
//! Each participating thread proves it is still running by setting its
//! token bit once per cycle. The safety monitor aggregates the bits and
//! feeds the hardware watchdog only while every required token is fresh.
//! A missing token does not starve the dog into a blind reset: the monitor
//! reports the failure, drops into watchdog-degraded mode (which disables
//! the token gate), and keeps feeding, leaving the reaction to the safety
//! state machine.
//!
//! The split between [`TokenBoard`] and [`LivenessMonitor`] is the
//! concurrency contract: the board is written by many threads through
//! single-word atomic ORs and read by exactly one consumer; the monitor
//! state is touched by the safety monitor thread alone, so it needs no
//! synchronization at all.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// A hardware watchdog that can be refreshed.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Shared token state, one instance for the whole system.
///
/// Token reporting is idempotent within a cycle and lock-free; each bit
/// has a single writer, and the aggregate is consumed by one reader.
pub struct TokenBoard {
    received: AtomicU8,
    /// Low 32 bits of each bit's last report time.
    stamped: [AtomicU32; 8],
}

impl TokenBoard {
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            received: AtomicU8::new(0),
            stamped: [ZERO; 8],
        }
    }

    /// Records `token` (a bit mask, normally one bit) as alive at
    /// `now_ms`. Called by every participating thread, every cycle.
    pub fn report(&self, token: u8, now_ms: u64) {
        self.received.fetch_or(token, Ordering::Relaxed);
        for bit in 0..8 {
            if token & (1 << bit) != 0 {
                self.stamped[bit].store(now_ms as u32, Ordering::Relaxed);
            }
        }
    }

    /// True when every bit of `required` is present and was reported
    /// within `timeout_ms` of `now_ms`.
    pub fn all_fresh(&self, required: u8, timeout_ms: u64, now_ms: u64) -> bool {
        let received = self.received.load(Ordering::Relaxed);
        for bit in 0..8 {
            if required & (1 << bit) == 0 {
                continue;
            }
            if received & (1 << bit) == 0 {
                return false;
            }
            let age = (now_ms as u32)
                .wrapping_sub(self.stamped[bit].load(Ordering::Relaxed));
            if u64::from(age) > timeout_ms {
                return false;
            }
        }
        true
    }

    pub fn received(&self) -> u8 {
        self.received.load(Ordering::Relaxed)
    }

    /// Clears the accumulated bits for the next cycle. Timestamps are
    /// left alone; freshness, not presence, ages them out.
    pub fn clear(&self) {
        self.received.store(0, Ordering::Relaxed);
    }

    fn clear_stamps(&self) {
        for s in &self.stamped {
            s.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TokenBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// What a `process` cycle did. `#[must_use]` because `TokensMissing` is a
/// Serious error the caller has to report.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum FeedOutcome {
    /// Watchdog not started, or the feed period has not elapsed.
    Idle,
    /// All tokens fresh; the dog was fed.
    Fed,
    /// Watchdog-degraded mode: fed without consulting tokens.
    FedDegraded,
    /// One or more required tokens missing or stale. The monitor entered
    /// degraded mode and still fed the dog; the caller must report this.
    TokensMissing { received: u8, required: u8 },
}

/// Near-miss handling for the windowed watchdog's early-wakeup interrupt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum WindowWarning {
    /// Tokens were fresh; the windowed dog was refreshed in time.
    Recovered,
    /// Tokens were not fresh. The hardware reset is imminent; the caller
    /// gets one chance to log before it happens.
    NearMiss { received: u8 },
}

/// Status snapshot for diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LivenessStatus {
    pub tokens_received: u8,
    pub tokens_required: u8,
    pub feed_count: u32,
    pub windowed_feed_count: u32,
    pub degraded: bool,
    pub last_feed_ms: u64,
}

/// Per-monitor liveness state. Owned and driven by the safety monitor.
pub struct LivenessMonitor<'a> {
    board: &'a TokenBoard,
    required: u8,
    enabled: bool,
    degraded: bool,
    last_feed_ms: u64,
    feed_count: u32,
    windowed_feed_count: u32,
}

impl<'a> LivenessMonitor<'a> {
    pub fn new(board: &'a TokenBoard) -> Self {
        Self {
            board,
            required: abi::token::ALL,
            enabled: false,
            degraded: false,
            last_feed_ms: 0,
            feed_count: 0,
            windowed_feed_count: 0,
        }
    }

    /// Arms the monitor. The hardware watchdog itself is started by the
    /// platform init code; from here on it must be fed.
    pub fn start(&mut self, now_ms: u64) {
        self.enabled = true;
        self.last_feed_ms = now_ms;
    }

    pub fn set_required_tokens(&mut self, mask: u8) {
        self.required = mask;
    }

    /// True when every required token is fresh. Degraded mode always
    /// passes, so the dog keeps being fed while the system sheds load.
    pub fn check_all_tokens(&self, now_ms: u64) -> bool {
        if self.degraded {
            return true;
        }
        self.board
            .all_fresh(self.required, abi::WDG_TOKEN_TIMEOUT_MS, now_ms)
    }

    /// One monitor cycle: feed the windowed dog (every cycle, inside its
    /// window) and, at the feed period, gate the primary dog on token
    /// freshness.
    pub fn process<P: Watchdog, W: Watchdog>(
        &mut self,
        now_ms: u64,
        primary: &mut P,
        mut windowed: Option<&mut W>,
    ) -> FeedOutcome {
        if !self.enabled {
            return FeedOutcome::Idle;
        }

        let tokens_ok = self.check_all_tokens(now_ms);

        // The windowed dog's period is one monitor cycle; refresh it now
        // while we are inside its open window.
        if let Some(w) = windowed.as_deref_mut() {
            if tokens_ok || self.degraded {
                w.feed();
                self.windowed_feed_count =
                    self.windowed_feed_count.wrapping_add(1);
            }
        }

        if now_ms.wrapping_sub(self.last_feed_ms) < abi::WDG_FEED_PERIOD_MS {
            return FeedOutcome::Idle;
        }

        if self.degraded {
            self.feed(now_ms, primary);
            return FeedOutcome::FedDegraded;
        }

        if tokens_ok {
            self.feed(now_ms, primary);
            return FeedOutcome::Fed;
        }

        // Token failure. Degrade so the next cycles keep the hardware dog
        // alive instead of converting a software stall into a blind
        // reset, but feed this cycle too; the reset decision belongs to
        // the state machine, not to the feed path.
        let received = self.board.received();
        self.degraded = true;
        self.feed(now_ms, primary);
        FeedOutcome::TokensMissing {
            received,
            required: self.required,
        }
    }

    fn feed<P: Watchdog>(&mut self, now_ms: u64, primary: &mut P) {
        primary.feed();
        self.last_feed_ms = now_ms;
        self.feed_count = self.feed_count.wrapping_add(1);
        self.board.clear();
    }

    /// Early-wakeup interrupt path for the windowed watchdog: the counter
    /// is about to expire. Refresh if the tokens justify it; otherwise
    /// report the near miss so it can be logged before the reset lands.
    pub fn handle_window_warning<W: Watchdog>(
        &mut self,
        now_ms: u64,
        windowed: &mut W,
    ) -> WindowWarning {
        if self.enabled && self.check_all_tokens(now_ms) {
            windowed.feed();
            self.windowed_feed_count = self.windowed_feed_count.wrapping_add(1);
            WindowWarning::Recovered
        } else {
            WindowWarning::NearMiss {
                received: self.board.received(),
            }
        }
    }

    pub fn enter_degraded(&mut self) {
        self.degraded = true;
    }

    /// Leaves degraded mode and restarts token accounting from scratch.
    pub fn exit_degraded(&mut self) {
        self.degraded = false;
        self.board.clear();
        self.board.clear_stamps();
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn status(&self) -> LivenessStatus {
        LivenessStatus {
            tokens_received: self.board.received(),
            tokens_required: self.required,
            feed_count: self.feed_count,
            windowed_feed_count: self.windowed_feed_count,
            degraded: self.degraded,
            last_feed_ms: self.last_feed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeDog {
        feeds: u32,
    }

    impl Watchdog for FakeDog {
        fn feed(&mut self) {
            self.feeds += 1;
        }
    }

    fn report_all(board: &TokenBoard, now: u64) {
        board.report(abi::token::SAFETY, now);
        board.report(abi::token::MAIN, now);
        board.report(abi::token::COMM, now);
    }

    #[test]
    fn feeds_when_all_tokens_fresh() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut dog = FakeDog::default();
        uut.start(0);

        report_all(&board, 100);
        assert_eq!(
            uut.process::<_, FakeDog>(500, &mut dog, None),
            FeedOutcome::Fed
        );
        assert_eq!(dog.feeds, 1);
        // Tokens are consumed by the feed.
        assert_eq!(board.received(), 0);
    }

    #[test]
    fn idle_before_feed_period() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut dog = FakeDog::default();
        uut.start(0);

        report_all(&board, 100);
        assert_eq!(
            uut.process::<_, FakeDog>(499, &mut dog, None),
            FeedOutcome::Idle
        );
        assert_eq!(dog.feeds, 0);
    }

    #[test]
    fn missing_token_degrades_but_still_feeds() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut dog = FakeDog::default();
        uut.start(0);

        board.report(abi::token::SAFETY, 100);
        board.report(abi::token::MAIN, 100);
        // COMM never reports.
        let outcome = uut.process::<_, FakeDog>(500, &mut dog, None);
        assert_eq!(
            outcome,
            FeedOutcome::TokensMissing {
                received: abi::token::SAFETY | abi::token::MAIN,
                required: abi::token::ALL,
            }
        );
        assert_eq!(dog.feeds, 1);
        assert!(uut.is_degraded());

        // Subsequent cycles feed without the gate.
        assert_eq!(
            uut.process::<_, FakeDog>(1_000, &mut dog, None),
            FeedOutcome::FedDegraded
        );
        assert_eq!(dog.feeds, 2);
    }

    #[test]
    fn stale_token_fails_freshness() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        uut.start(0);

        report_all(&board, 0);
        // 900 ms later the stamps are past the 800 ms freshness bound.
        assert!(!uut.check_all_tokens(900));
        assert!(uut.check_all_tokens(700));
    }

    #[test]
    fn exit_degraded_restarts_accounting() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut dog = FakeDog::default();
        uut.start(0);

        let _ = uut.process::<_, FakeDog>(500, &mut dog, None);
        assert!(uut.is_degraded());

        uut.exit_degraded();
        assert!(!uut.is_degraded());
        // Freshly cleared stamps must not count as fresh.
        assert!(!uut.check_all_tokens(900));

        report_all(&board, 900);
        assert_eq!(
            uut.process::<_, FakeDog>(1_000, &mut dog, None),
            FeedOutcome::Fed
        );
    }

    #[test]
    fn windowed_dog_fed_every_cycle() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut primary = FakeDog::default();
        let mut windowed = FakeDog::default();
        uut.start(0);

        for cycle in 1..=5u64 {
            report_all(&board, cycle * 100);
            let _ = uut.process(cycle * 100, &mut primary, Some(&mut windowed));
        }
        assert_eq!(windowed.feeds, 5);
        // The primary only fires on the 500 ms boundary.
        assert_eq!(primary.feeds, 1);
    }

    #[test]
    fn window_warning_near_miss_when_tokens_stale() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut windowed = FakeDog::default();
        uut.start(0);

        report_all(&board, 0);
        assert_eq!(
            uut.handle_window_warning(100, &mut windowed),
            WindowWarning::Recovered
        );
        assert_eq!(windowed.feeds, 1);

        assert_eq!(
            uut.handle_window_warning(2_000, &mut windowed),
            WindowWarning::NearMiss {
                received: abi::token::ALL
            }
        );
        assert_eq!(windowed.feeds, 1);
    }

    #[test]
    fn not_started_means_idle() {
        let board = TokenBoard::new();
        let mut uut = LivenessMonitor::new(&board);
        let mut dog = FakeDog::default();
        report_all(&board, 0);
        assert_eq!(
            uut.process::<_, FakeDog>(10_000, &mut dog, None),
            FeedOutcome::Idle
        );
        assert_eq!(dog.feeds, 0);
    }
}
