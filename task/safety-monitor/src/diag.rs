// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic text output.
//!
//! Renders a fixed-format summary of the safety context — state, last
//! error, counters, flags, and the most recent error-log entries — to a
//! byte sink. The sink is whatever the platform provides (RTT, a UART);
//! this module only needs "send bytes, bounded, tell me if it failed".

use core::fmt::Write;

use safecore::SafetyContext;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiagError {
    /// The sink could not accept the bytes within its bound.
    SinkFailed,
}

/// Blocking byte output with a bounded wait, provided by the platform.
pub trait DiagSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DiagError>;
}

struct SinkWriter<'a, S: DiagSink> {
    sink: &'a mut S,
}

impl<S: DiagSink> Write for SinkWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.sink
            .write_all(s.as_bytes())
            .map_err(|_| core::fmt::Error)
    }
}

/// Number of error-log entries included in a dump.
const DUMP_LOG_ENTRIES: usize = 4;

/// Writes the diagnostic summary to `sink`.
pub fn dump(
    ctx: &SafetyContext,
    sink: &mut impl DiagSink,
    now_ms: u64,
) -> Result<(), DiagError> {
    let mut w = SinkWriter { sink };

    let result = (|| -> core::fmt::Result {
        writeln!(w, "========== safety diagnostics ==========")?;
        writeln!(w, "state:       {}", ctx.state().name())?;
        match ctx.last_error() {
            Some(e) => writeln!(w, "last error:  {}", e.name())?,
            None => writeln!(w, "last error:  NONE")?,
        }
        writeln!(w, "error count: {}", ctx.error_count())?;
        writeln!(w, "uptime:      {} ms", ctx.uptime_ms(now_ms))?;
        writeln!(
            w,
            "startup ok:  {}",
            if ctx.startup_test_passed() { "yes" } else { "no" }
        )?;
        writeln!(
            w,
            "params ok:   {}",
            if ctx.params_valid() { "yes" } else { "no" }
        )?;
        writeln!(
            w,
            "mpu active:  {}",
            if ctx.mpu_enabled() { "yes" } else { "no" }
        )?;
        writeln!(
            w,
            "wdg active:  {}",
            if ctx.watchdog_active() { "yes" } else { "no" }
        )?;

        writeln!(w, "--- error log (last {DUMP_LOG_ENTRIES}) ---")?;
        for entry in ctx.error_log().iter_recent().take(DUMP_LOG_ENTRIES) {
            writeln!(
                w,
                "[{}] code={} p1={:#010x} p2={:#010x}",
                entry.timestamp_ms, entry.code, entry.param1, entry.param2
            )?;
        }
        writeln!(w, "========================================")
    })();

    match result {
        Ok(()) => Ok(()),
        Err(_) => Err(DiagError::SinkFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safecore::{NullHooks, SafePolicy};

    #[derive(Default)]
    struct StringSink {
        buf: Vec<u8>,
    }

    impl DiagSink for StringSink {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), DiagError> {
            self.buf.extend_from_slice(bytes);
            Ok(())
        }
    }

    struct BrokenSink;

    impl DiagSink for BrokenSink {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), DiagError> {
            Err(DiagError::SinkFailed)
        }
    }

    #[test]
    fn dump_contains_state_and_errors() {
        let mut hooks = NullHooks;
        let mut ctx = SafetyContext::new(SafePolicy::default(), 0);
        ctx.begin_startup_test(&mut hooks).unwrap();
        ctx.mark_startup_passed();
        ctx.enter_normal(&mut hooks).unwrap();
        ctx.report_error(
            &mut hooks,
            abi::SafetyError::StackOverflow,
            72,
            0,
            1_234,
        );

        let mut sink = StringSink::default();
        dump(&ctx, &mut sink, 5_000).unwrap();
        let text = String::from_utf8(sink.buf).unwrap();

        assert!(text.contains("state:       NORMAL"));
        assert!(text.contains("last error:  STACK_OVERFLOW"));
        assert!(text.contains("error count: 1"));
        assert!(text.contains("uptime:      5000 ms"));
        assert!(text.contains("[1234] code=6"));
    }

    #[test]
    fn sink_failure_is_reported() {
        let ctx = SafetyContext::new(SafePolicy::default(), 0);
        assert_eq!(
            dump(&ctx, &mut BrokenSink, 0),
            Err(DiagError::SinkFailed)
        );
    }
}
