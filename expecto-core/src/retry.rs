//! # Retry engine
//!
//! ```text
//!        +----------------------------------------------+
//!        v                                              |
//! +-------------+    +-----------+    +-----------+     |
//! | executor()  | -> | checker() | -> | classify  | ----+ retryable, time left:
//! +-------------+    +-----------+    +-----------+       sleep(next delay)
//!                                       |   |   |
//!                     all ok -----------+   |   +------- deadline or cancel
//!                     fatal reason ---------+            -> timeout
//! ```
//!
//! The loop owns its [`RetryContext`], so concurrent calls never share a
//! delay or an attempt counter.

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::*;

use crate::{
    check::CheckResult,
    config::AsyncConfig,
    context::Context,
    expect::Expectation,
    polling::{
        sanitize_for_log, PollingSummary, RetryContext, REASON_CANCELLED, REASON_NON_RETRYABLE,
        REASON_TIMEOUT,
    },
    step::StepCtx,
    Error,
};

/// What one executor invocation produced. A `None` value is a nil result,
/// and a value may come together with an error.
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: Option<T>,
    pub error: Option<Error>,
}

impl<T> Outcome<T> {
    pub fn new(value: Option<T>, error: Option<Error>) -> Outcome<T> {
        Outcome { value, error }
    }

    pub fn ok(value: T) -> Outcome<T> {
        Outcome {
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: Error) -> Outcome<T> {
        Outcome {
            value: None,
            error: Some(error),
        }
    }

    pub fn nil() -> Outcome<T> {
        Outcome {
            value: None,
            error: None,
        }
    }
}

impl<T> From<crate::Result<T>> for Outcome<T> {
    fn from(res: crate::Result<T>) -> Self {
        match res {
            Ok(v) => Outcome::ok(v),
            Err(e) => Outcome::err(e),
        }
    }
}

/// Performs the transport call. Must honour cancellation of the given context.
pub type Executor<'a, T> = Box<dyn Fn(Context) -> BoxFuture<'a, Outcome<T>> + Send + Sync + 'a>;

/// Runs every predicate against one `(value, error)` pair, in declaration order.
pub type Checker<'a, T> =
    Box<dyn Fn(Option<&T>, Option<&Error>) -> Vec<CheckResult> + Send + Sync + 'a>;

pub type Convert<'a, T, E> = Box<dyn Fn(&T) -> E + Send + Sync + 'a>;

/// Terminal state of one DSL call.
#[derive(Debug)]
pub struct Execution<T> {
    pub value: Option<T>,
    pub error: Option<Error>,
    pub summary: PollingSummary,
}

pub fn build_expectations_checker<'a, T: 'a>(expectations: &'a [Expectation<T>]) -> Checker<'a, T> {
    Box::new(move |value: Option<&T>, err: Option<&Error>| {
        expectations.iter().map(|e| (e.check)(err, value)).collect()
    })
}

pub fn build_expectations_checker_with_convert<'a, T: 'a, E: 'a>(
    expectations: &'a [Expectation<E>],
    convert: Convert<'a, T, E>,
) -> Checker<'a, T> {
    Box::new(move |value: Option<&T>, err: Option<&Error>| {
        let converted = value.map(|v| convert(v));
        expectations
            .iter()
            .map(|e| (e.check)(err, converted.as_ref()))
            .collect()
    })
}

/// Poll `executor` until `checker` is satisfied, a check fails fatally, or
/// the deadline (the earlier of `cfg.timeout` and the context's) passes.
pub async fn execute_with_retry<T>(
    ctx: &Context,
    step: &StepCtx,
    cfg: AsyncConfig,
    executor: &Executor<'_, T>,
    checker: &Checker<'_, T>,
) -> Execution<T> {
    let cfg = cfg.normalized();
    let mut deadline = Instant::now() + cfg.timeout;
    if let Some(d) = ctx.deadline() {
        deadline = deadline.min(d);
    }
    let ctx = ctx.with_deadline(deadline);

    let mut rc = RetryContext::new(cfg, deadline);
    let started = Instant::now();

    loop {
        rc.attempt += 1;
        debug!(attempt = rc.attempt, "executing attempt");

        let Outcome { value, error } = executor(ctx.clone()).await;
        rc.last_error = error.as_ref().map(|e| e.to_string());

        let results = checker(value.as_ref(), error.as_ref());
        rc.failed_reasons.clear();
        let mut all_ok = true;
        let mut has_retryable = false;
        for res in results {
            if !res.ok {
                all_ok = false;
                has_retryable |= res.retryable;
                rc.failed_reasons.push(res.reason);
            }
        }

        if all_ok {
            return Execution {
                value,
                error: None,
                summary: PollingSummary::new(rc.attempt, started.elapsed(), true),
            };
        }

        if !has_retryable {
            let mut summary = PollingSummary::new(rc.attempt, started.elapsed(), false);
            summary.failed_checks = std::mem::take(&mut rc.failed_reasons);
            summary.timeout_reason = REASON_NON_RETRYABLE.to_string();
            summary.last_error = rc.last_error.take().unwrap_or_default();
            return Execution {
                value,
                error,
                summary,
            };
        }

        if Instant::now() > deadline || ctx.is_done() {
            return timed_out(&ctx, &mut rc, started, REASON_TIMEOUT, value);
        }

        let delay = rc.calculate_next_delay();

        let mut preview = sanitize_for_log(&rc.failed_reasons[0]);
        if rc.failed_reasons.len() > 1 {
            preview.push_str(&format!(" (and {} more)", rc.failed_reasons.len() - 1));
        }
        let notice = format!(
            "Retry attempt {}: {} failed check(s), delay {delay:?}. Reason: {preview}",
            rc.attempt,
            rc.failed_reasons.len()
        );
        info!("{notice}");
        step.log(notice);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.done() => {
                return timed_out(&ctx, &mut rc, started, REASON_CANCELLED, value);
            }
        }
    }
}

fn timed_out<T>(
    ctx: &Context,
    rc: &mut RetryContext,
    started: Instant,
    reason: &str,
    value: Option<T>,
) -> Execution<T> {
    let ctx_err = ctx.err().unwrap_or(Error::DeadlineExceeded);

    let mut summary = PollingSummary::new(rc.attempt, started.elapsed(), false);
    summary.failed_checks = std::mem::take(&mut rc.failed_reasons);
    summary.timeout_reason = reason.to_string();
    summary.last_error = rc.last_error.take().unwrap_or_else(|| ctx_err.to_string());

    Execution {
        value,
        error: Some(ctx_err),
        summary,
    }
}

/// Invoke `executor` exactly once.
pub async fn execute_single<T>(ctx: &Context, executor: &Executor<'_, T>) -> Execution<T> {
    let started = Instant::now();
    let Outcome { value, error } = executor(ctx.clone()).await;

    let mut summary = PollingSummary::new(1, started.elapsed(), error.is_none());
    if let Some(e) = &error {
        summary.last_error = e.to_string();
    }

    Execution {
        value,
        error,
        summary,
    }
}
