// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic-check scheduling.
//!
//! The monitor thread wakes on a fixed period and multiplexes several
//! slower periodic checks over it. Each check keeps an absolute deadline;
//! firing advances the deadline by whole periods from the old deadline,
//! not from "now", so a late wakeup does not shift the cadence.

use enum_map::{Enum, EnumMap};

/// The periodic checks the monitor runs on top of its base cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
pub enum Check {
    Stack,
    FlowVerify,
    FlashCrc,
    ParamCrc,
}

impl Check {
    fn period_ms(self) -> u64 {
        match self {
            Self::Stack => abi::STACK_CHECK_INTERVAL_MS,
            Self::FlowVerify => abi::FLOW_VERIFY_INTERVAL_MS,
            Self::FlashCrc => abi::FLASH_CRC_INTERVAL_MS,
            Self::ParamCrc => abi::PARAM_CHECK_INTERVAL_MS,
        }
    }
}

pub struct Schedule {
    deadlines: EnumMap<Check, u64>,
}

impl Schedule {
    pub fn new(now_ms: u64) -> Self {
        let mut deadlines: EnumMap<Check, u64> = EnumMap::default();
        for (check, deadline) in deadlines.iter_mut() {
            *deadline = now_ms + check.period_ms();
        }
        Self { deadlines }
    }

    /// True when `check` is due; consumes the firing and schedules the
    /// next one.
    pub fn due(&mut self, check: Check, now_ms: u64) -> bool {
        let deadline = self.deadlines[check];
        if now_ms < deadline {
            return false;
        }
        let period = check.period_ms();
        let missed = (now_ms - deadline) / period;
        self.deadlines[check] = deadline + (missed + 1) * period;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_due_at_start() {
        let mut s = Schedule::new(0);
        assert!(!s.due(Check::Stack, 0));
        assert!(!s.due(Check::FlowVerify, 999));
    }

    #[test]
    fn fires_once_per_period() {
        let mut s = Schedule::new(0);
        assert!(s.due(Check::FlowVerify, 1_000));
        assert!(!s.due(Check::FlowVerify, 1_100));
        assert!(s.due(Check::FlowVerify, 2_000));
    }

    #[test]
    fn late_wakeup_keeps_cadence() {
        let mut s = Schedule::new(0);
        // Sleep through two whole flow periods; one consolidated firing,
        // and the next deadline stays on the original grid.
        assert!(s.due(Check::FlowVerify, 3_250));
        assert!(!s.due(Check::FlowVerify, 3_900));
        assert!(s.due(Check::FlowVerify, 4_000));
    }

    #[test]
    fn checks_are_independent() {
        let mut s = Schedule::new(0);
        assert!(s.due(Check::Stack, 100));
        assert!(!s.due(Check::FlowVerify, 100));
    }
}
