//! Retry bookkeeping, the delay law and the polling summary.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    config::AsyncConfig,
    mode::{get_step_mode, StepMode},
    step::StepCtx,
    Result,
};

pub const REASON_NON_RETRYABLE: &str = "Non-retryable error encountered";
pub const REASON_TIMEOUT: &str = "Timeout or context cancelled";
pub const REASON_CANCELLED: &str = "Context cancelled";

pub const POLLING_SUMMARY_ATTACHMENT: &str = "Polling Summary";

const LOG_MAX_CHARS: usize = 80;
const LOG_PREVIEW_CHARS: usize = 20;
const LOG_TRUNCATED_SUFFIX: &str = "... [truncated for security]";

/// Structured record of one DSL call's retry history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollingSummary {
    pub attempts: u32,
    pub elapsed_time: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout_reason: String,
}

impl PollingSummary {
    pub(crate) fn new(attempts: u32, elapsed: Duration, success: bool) -> PollingSummary {
        PollingSummary {
            attempts,
            elapsed_time: format!("{elapsed:?}"),
            success,
            ..Default::default()
        }
    }
}

/// Per-call scratch pad of the retry loop.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based once the first attempt started.
    pub attempt: u32,
    pub cfg: AsyncConfig,
    pub deadline: Instant,
    pub current_delay: Duration,
    pub last_error: Option<String>,
    /// Reasons of the latest attempt only.
    pub failed_reasons: Vec<String>,
}

impl RetryContext {
    pub fn new(cfg: AsyncConfig, deadline: Instant) -> RetryContext {
        RetryContext {
            attempt: 0,
            cfg,
            deadline,
            current_delay: cfg.interval,
            last_error: None,
            failed_reasons: Vec::new(),
        }
    }

    /// Delay before the next attempt.
    ///
    /// Backoff grows the stored base from the second attempt on, capped at
    /// `max_interval`. Jitter is applied to the returned value only.
    pub fn calculate_next_delay(&mut self) -> Duration {
        let mut delay = self.current_delay;

        let backoff = &self.cfg.backoff;
        if backoff.enabled && self.attempt > 1 {
            delay = Duration::try_from_secs_f64(delay.as_secs_f64() * backoff.factor)
                .unwrap_or(backoff.max_interval)
                .min(backoff.max_interval);
            self.current_delay = delay;
        }

        if self.cfg.jitter > 0.0 {
            let amount = delay.as_secs_f64() * self.cfg.jitter;
            let delta = rand::rng().random_range(-amount..=amount);
            delay = shift_delay(delay, delta, self.cfg.interval);
        }

        delay
    }
}

/// Move `delay` by `delta` seconds. A negative or unrepresentable result
/// becomes `fallback`.
fn shift_delay(delay: Duration, delta: f64, fallback: Duration) -> Duration {
    let shifted = delay.as_secs_f64() + delta;
    if shifted < 0.0 {
        return fallback;
    }
    Duration::try_from_secs_f64(shifted).unwrap_or(fallback)
}

/// Human readable failure text of a call that did not meet its expectations.
pub fn final_failure_message(summary: &PollingSummary) -> String {
    if summary.failed_checks.is_empty() {
        return "Expectations not met within timeout".to_string();
    }

    let mut msg = format!(
        "Expectations not met after {} attempts ({}):\n",
        summary.attempts, summary.elapsed_time
    );
    for (i, reason) in summary.failed_checks.iter().enumerate() {
        msg.push_str(&format!("  [{}] {reason}\n", i + 1));
    }
    if !summary.last_error.is_empty() {
        msg.push_str(&format!("Last error: {}", summary.last_error));
    }
    msg
}

/// Shorten a reason before it reaches logs. Short reasons pass unchanged.
pub fn sanitize_for_log(reason: &str) -> String {
    if reason.chars().count() <= LOG_MAX_CHARS {
        return reason.to_string();
    }
    let preview: String = reason.chars().take(LOG_PREVIEW_CHARS).collect();
    format!("{preview}{LOG_TRUNCATED_SUFFIX}")
}

pub fn attach_polling_summary(step: &StepCtx, summary: &PollingSummary) -> Result<()> {
    step.attach_json(POLLING_SUMMARY_ATTACHMENT, summary)
}

/// Attach the summary when the step polls. Sync and cleanup steps stay quiet.
pub fn attach_if_async(step: &StepCtx, summary: &PollingSummary) -> Result<()> {
    if get_step_mode(step) == StepMode::Async {
        attach_polling_summary(step, summary)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BackoffConfig;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn config(jitter: f64, backoff: bool) -> AsyncConfig {
        AsyncConfig {
            enabled: true,
            timeout: Duration::from_secs(1),
            interval: Duration::from_millis(100),
            backoff: BackoffConfig {
                enabled: backoff,
                factor: 1.5,
                max_interval: Duration::from_millis(500),
            },
            jitter,
        }
    }

    #[test]
    fn backoff_law() {
        let mut rc = RetryContext::new(config(0.0, true), Instant::now());
        let delays: Vec<f64> = (1..=6)
            .map(|attempt| {
                rc.attempt = attempt;
                rc.calculate_next_delay().as_secs_f64() * 1000.0
            })
            .collect();

        for (got, want) in delays.iter().zip([100.0, 150.0, 225.0, 337.5, 500.0, 500.0]) {
            assert!((got - want).abs() < 1.0, "got {got}ms, want {want}ms");
        }
        assert!(rc.current_delay <= Duration::from_millis(500));
    }

    #[test]
    fn backoff_disabled_keeps_interval() {
        let mut rc = RetryContext::new(config(0.0, false), Instant::now());
        for attempt in 1..=4 {
            rc.attempt = attempt;
            assert_eq!(rc.calculate_next_delay(), Duration::from_millis(100));
        }
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut rc = RetryContext::new(config(0.5, false), Instant::now());
        rc.attempt = 1;
        for _ in 0..200 {
            let d = rc.calculate_next_delay();
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150), "{d:?}");
        }
        assert_eq!(rc.current_delay, Duration::from_millis(100));
    }

    #[test]
    fn wide_jitter_never_goes_negative() {
        let mut rc = RetryContext::new(config(3.0, true), Instant::now());
        for attempt in 1..=50 {
            rc.attempt = attempt;
            let d = rc.calculate_next_delay();
            assert!(d <= Duration::from_millis(2000), "{d:?}");
        }
    }

    #[test_case(0.03, Duration::from_millis(130); "positive shift")]
    #[test_case(-0.04, Duration::from_millis(60); "negative shift")]
    #[test_case(-0.1, Duration::ZERO; "shift to zero")]
    #[test_case(-0.25, Duration::from_millis(100); "below zero falls back")]
    #[test_case(f64::INFINITY, Duration::from_millis(100); "unrepresentable falls back")]
    fn shifted_delay(delta: f64, expected: Duration) {
        let got = shift_delay(Duration::from_millis(100), delta, Duration::from_millis(100));
        assert!(
            got.abs_diff(expected) < Duration::from_micros(1),
            "got {got:?}, want {expected:?}"
        );
    }

    #[test]
    fn negative_shift_returns_interval_not_base() {
        let interval = Duration::from_millis(100);
        let grown = Duration::from_millis(337);
        assert_eq!(shift_delay(grown, -0.5, interval), interval);
    }

    #[test]
    fn failure_message() {
        let summary = PollingSummary {
            attempts: 3,
            elapsed_time: "1.5s".into(),
            failed_checks: vec!["status is 500".into(), "field missing".into()],
            last_error: "connection reset".into(),
            ..Default::default()
        };
        assert_eq!(
            final_failure_message(&summary),
            "Expectations not met after 3 attempts (1.5s):\n  [1] status is 500\n  [2] field missing\nLast error: connection reset"
        );

        assert_eq!(
            final_failure_message(&PollingSummary::default()),
            "Expectations not met within timeout"
        );
    }

    #[test]
    fn summary_json_skips_empty_fields() -> eyre::Result<()> {
        let summary = PollingSummary::new(1, Duration::from_millis(3), true);
        let json = serde_json::to_value(&summary)?;
        assert_eq!(
            json,
            serde_json::json!({"attempts": 1, "elapsed_time": "3ms", "success": true})
        );
        Ok(())
    }

    #[test_case("short reason", "short reason"; "short")]
    #[test_case(&"x".repeat(80), &"x".repeat(80); "boundary")]
    #[test_case(&"y".repeat(81), &format!("{}... [truncated for security]", "y".repeat(20)); "long")]
    fn sanitize(input: &str, expected: &str) {
        assert_eq!(sanitize_for_log(input), expected);
    }

    #[test]
    fn summary_attached_only_in_async_mode() {
        let summary = PollingSummary::new(2, Duration::from_millis(10), false);

        let sync = StepCtx::new("sync");
        attach_if_async(&sync, &summary).unwrap();
        assert!(sync.snapshot().attachment(POLLING_SUMMARY_ATTACHMENT).is_none());

        let cleanup = StepCtx::new("cleanup").cleanup_mode();
        attach_if_async(&cleanup, &summary).unwrap();
        assert!(cleanup.snapshot().attachment(POLLING_SUMMARY_ATTACHMENT).is_none());

        let polled = StepCtx::new("async").async_mode();
        attach_if_async(&polled, &summary).unwrap();
        assert!(polled.snapshot().attachment(POLLING_SUMMARY_ATTACHMENT).is_some());
    }
}
