//! # Expectations
//!
//! An [`Expectation`] is a named predicate plus a reporter. The predicate
//! classifies one `(error, value)` pair into a [`CheckResult`], and the
//! reporter turns the final verdict into exactly one assertion on the step.
//!
//! ```text
//! pre-check ──> extract (column / JSON path) ──> value check ──> CheckResult
//!                                                                    │
//!                              step + assertion mode ──> report <────┘
//! ```
//!
//! Transport builders compose expectations from the pieces in
//! [`precheck`], [`checks`], [`builders`] and [`json_source`].

pub mod builders;
pub mod checks;
pub mod json_source;
pub mod precheck;

use eyre::eyre;
use std::sync::Arc;

use crate::{
    check::CheckResult,
    mode::{assertion_mode_for, get_step_mode, pick_asserter, AssertionMode},
    step::StepCtx,
    Error, Result,
};

pub use builders::*;
pub use checks::*;
pub use json_source::{BytesJsonSource, JsonSource};
pub use precheck::*;

pub type CheckFn<T> = Box<dyn Fn(Option<&Error>, Option<&T>) -> CheckResult + Send + Sync>;

pub type ReportFn<T> = Arc<
    dyn Fn(&StepCtx, AssertionMode, Option<&Error>, Option<&T>, &CheckResult) -> Result<()>
        + Send
        + Sync,
>;

pub struct Expectation<T> {
    pub name: String,
    pub check: CheckFn<T>,
    pub report: ReportFn<T>,
}

impl<T> std::fmt::Debug for Expectation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expectation").field("name", &self.name).finish()
    }
}

impl<T> Expectation<T> {
    pub fn new<C, R>(name: impl Into<String>, check: C, report: R) -> Expectation<T>
    where
        C: Fn(Option<&Error>, Option<&T>) -> CheckResult + Send + Sync + 'static,
        R: Fn(&StepCtx, AssertionMode, Option<&Error>, Option<&T>, &CheckResult) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        Expectation {
            name: name.into(),
            check: Box::new(check),
            report: Arc::new(report),
        }
    }

    /// Like [`Expectation::new`], reusing an already built reporter.
    pub fn with_report<C>(name: impl Into<String>, check: C, report: ReportFn<T>) -> Expectation<T>
    where
        C: Fn(Option<&Error>, Option<&T>) -> CheckResult + Send + Sync + 'static,
    {
        Expectation {
            name: name.into(),
            check: Box::new(check),
            report,
        }
    }

    /// Run the predicate and report its verdict.
    pub fn check_and_report(
        &self,
        step: &StepCtx,
        mode: AssertionMode,
        err: Option<&Error>,
        value: Option<&T>,
    ) -> Result<()> {
        let res = (self.check)(err, value);
        (self.report)(step, mode, err, value, &res)
    }
}

/// `[name] reason` on failure, `[name]` on success.
pub fn standard_report<T>(name: impl Into<String>) -> ReportFn<T> {
    let name = name.into();
    Arc::new(move |step, mode, _err, _value, res| {
        let a = pick_asserter(step, mode);
        if res.ok {
            a.is_true(true, format!("[{name}]"))
        } else {
            a.is_true(false, format!("[{name}] {}", res.reason))
        }
    })
}

/// Like [`standard_report`], rendering the observed value on success.
pub fn standard_report_with_actual<T, F>(name: impl Into<String>, get_actual: F) -> ReportFn<T>
where
    F: Fn(Option<&T>) -> String + Send + Sync + 'static,
{
    let name = name.into();
    Arc::new(move |step, mode, _err, value, res| {
        let a = pick_asserter(step, mode);
        if res.ok {
            a.is_true(true, format!("[{name}] actual: {}", get_actual(value)))
        } else {
            a.is_true(false, format!("[{name}] {}", res.reason))
        }
    })
}

/// Re-run every check and report it. Stops at the first failed Require.
pub fn report_all<T>(
    step: &StepCtx,
    mode: AssertionMode,
    expectations: &[Expectation<T>],
    err: Option<&Error>,
    value: Option<&T>,
) -> Result<()> {
    for exp in expectations {
        exp.check_and_report(step, mode, err, value)?;
    }
    Ok(())
}

/// Report `expectations` with the assertion mode of `step`. `on_empty` runs
/// instead when the list is empty.
pub fn assert_expectations<T, F>(
    step: &StepCtx,
    expectations: &[Expectation<T>],
    err: Option<&Error>,
    value: Option<&T>,
    on_empty: F,
) -> Result<()>
where
    F: FnOnce(&StepCtx, AssertionMode, Option<&Error>) -> Result<()>,
{
    let mode = assertion_mode_for(get_step_mode(step));
    if expectations.is_empty() {
        return on_empty(step, mode, err);
    }
    report_all(step, mode, expectations, err, value)
}

/// Append `exp` unless the call was already sent, in which case the step breaks.
pub fn add_expectation<T>(
    step: &StepCtx,
    sent: bool,
    expectations: &mut Vec<Expectation<T>>,
    exp: Expectation<T>,
    dsl_name: &str,
) -> Result<()> {
    if sent {
        return Err(step.break_now(crate::dsl_errors::expectations_after_send(dsl_name)));
    }
    expectations.push(exp);
    Ok(())
}

pub fn validate_json_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Unexpected(eyre!("JSON path cannot be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::step::Status;
    use pretty_assertions::assert_eq;

    fn equals(expected: i32) -> Expectation<i32> {
        let name = format!("value == {expected}");
        Expectation::with_report(
            name.clone(),
            move |_err, v: Option<&i32>| match v {
                Some(v) if *v == expected => CheckResult::ok(),
                Some(v) => CheckResult::retry(format!("got {v}")),
                None => CheckResult::retry("Response is nil"),
            },
            standard_report(name),
        )
    }

    #[test]
    fn report_all_under_assert_reports_every_failure() -> eyre::Result<()> {
        let step = StepCtx::new("report-all-assert");
        let exps = vec![equals(1), equals(2), equals(3)];
        report_all(&step, AssertionMode::Assert, &exps, None, Some(&2))?;

        let messages: Vec<_> = step
            .snapshot()
            .checks
            .into_iter()
            .map(|c| (c.passed, c.message))
            .collect();
        assert_eq!(
            messages,
            vec![
                (false, "[value == 1] got 2".to_string()),
                (true, "[value == 2]".to_string()),
                (false, "[value == 3] got 2".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn report_all_under_require_stops_at_first_failure() {
        let step = StepCtx::new("report-all-require");
        let exps = vec![equals(1), equals(2)];
        let res = report_all(&step, AssertionMode::Require, &exps, None, Some(&2));

        assert!(matches!(res, Err(Error::AssertionFailed(_))));
        assert_eq!(step.snapshot().checks.len(), 1);
    }

    #[test]
    fn assert_expectations_calls_on_empty() -> eyre::Result<()> {
        let step = StepCtx::new("assert-empty").async_mode();
        let err = Error::Http("connection refused".into());
        let mut seen = None;
        assert_expectations::<i32, _>(&step, &[], Some(&err), None, |step, mode, err| {
            seen = Some(mode);
            pick_asserter(step, mode).no_error(err, "HTTP request failed")
        })?;

        assert_eq!(seen, Some(AssertionMode::Assert));
        let record = step.snapshot();
        assert_eq!(
            record.checks[0].message,
            "HTTP request failed: http error: connection refused"
        );
        assert_eq!(record.status, Status::Failed);
        Ok(())
    }

    #[test]
    fn add_after_send_breaks_the_step() {
        let step = StepCtx::new("add-after-send");
        let mut exps = Vec::new();
        add_expectation(&step, false, &mut exps, equals(1), "HTTP").unwrap();
        let res = add_expectation(&step, true, &mut exps, equals(2), "HTTP");

        assert_eq!(exps.len(), 1);
        assert!(res.as_ref().is_err_and(Error::is_broken));
        let record = step.snapshot();
        assert_eq!(record.status, Status::Broken);
        assert_eq!(
            record.checks[0].message,
            "HTTP DSL Error: Expectations must be added before Send()."
        );
    }

    #[test]
    fn standard_report_with_actual_renders_value() -> eyre::Result<()> {
        let step = StepCtx::new("with-actual");
        let report = standard_report_with_actual::<i32, _>("answer", |v| format!("{v:?}"));
        report(&step, AssertionMode::Assert, None, Some(&42), &CheckResult::ok())?;
        assert_eq!(step.snapshot().checks[0].message, "[answer] actual: Some(42)");
        Ok(())
    }

    #[test]
    fn json_path_must_not_be_empty() {
        assert!(validate_json_path("a.b").is_ok());
        let err = validate_json_path("").unwrap_err();
        assert_eq!(err.to_string(), "JSON path cannot be empty");
    }
}
