//! # DSL execution shell
//!
//! Every transport builder funnels its terminal `send` through
//! [`execute_dsl`]. The shell decides between polling and a single shot,
//! guards against nil results, wires the expectations into a checker and
//! lets the caller post-process the summary.
//!
//! ```text
//!              step mode ─┐
//!                         v
//! executor ─> nil guard ─> retry? ──yes──> execute_with_retry(checker)
//!                           │                      │
//!                           └──no──> execute_single┤
//!                                                  v
//!                                    post_process(value, err, &mut summary)
//! ```
//!
//! `TResult` is what the executor yields and `TExpect` is what the
//! expectations inspect. When they differ a `convert` function bridges them.

use std::{
    any::{type_name, Any, TypeId},
    sync::Arc,
};

use futures::FutureExt;

use crate::{
    check::CheckResult,
    config::AsyncConfig,
    context::Context,
    expect::Expectation,
    mode::{get_step_mode, StepMode},
    polling::PollingSummary,
    retry::{
        build_expectations_checker_with_convert, execute_single, execute_with_retry, Checker,
        Convert, Execution, Executor, Outcome,
    },
    step::StepCtx,
    Error, Result,
};

pub type PostProcess<'a, R> =
    Box<dyn Fn(Option<&R>, Option<&Error>, &mut PollingSummary) + Send + Sync + 'a>;

pub type NilResultFactory<'a, R> = Arc<dyn Fn(Option<&Error>) -> R + Send + Sync + 'a>;

/// Implemented by results that may carry an application-level error inside
/// the envelope.
pub trait ErrorGetter {
    fn get_error(&self) -> Option<String>;
}

/// Implemented by results that record transport failures instead of
/// returning them.
pub trait NetworkErrorGetter {
    fn get_network_error(&self) -> Option<&str>;
}

/// Everything one DSL call needs.
pub struct DslConfig<'a, R, E = R> {
    ctx: Context,
    step: StepCtx,
    async_config: AsyncConfig,
    executor: Executor<'a, R>,
    expectations: &'a [Expectation<E>],
    convert: Option<Convert<'a, R, E>>,
    checker: Option<Checker<'a, R>>,
    post_process: Option<PostProcess<'a, R>>,
    nil_result_factory: Option<NilResultFactory<'a, R>>,
}

impl<'a, R, E> DslConfig<'a, R, E> {
    pub fn new(
        ctx: Context,
        step: StepCtx,
        async_config: AsyncConfig,
        executor: Executor<'a, R>,
    ) -> DslConfig<'a, R, E> {
        DslConfig {
            ctx,
            step,
            async_config,
            executor,
            expectations: &[],
            convert: None,
            checker: None,
            post_process: None,
            nil_result_factory: None,
        }
    }

    pub fn expectations(mut self, expectations: &'a [Expectation<E>]) -> Self {
        self.expectations = expectations;
        self
    }

    pub fn convert(mut self, convert: impl Fn(&R) -> E + Send + Sync + 'a) -> Self {
        self.convert = Some(Box::new(convert));
        self
    }

    /// Replaces the expectation-driven checker.
    pub fn checker(
        mut self,
        checker: impl Fn(Option<&R>, Option<&Error>) -> Vec<CheckResult> + Send + Sync + 'a,
    ) -> Self {
        self.checker = Some(Box::new(checker));
        self
    }

    pub fn post_process(
        mut self,
        post_process: impl Fn(Option<&R>, Option<&Error>, &mut PollingSummary) + Send + Sync + 'a,
    ) -> Self {
        self.post_process = Some(Box::new(post_process));
        self
    }

    /// Fabricates a surrogate when the executor yields no value.
    pub fn nil_result_factory(
        mut self,
        factory: impl Fn(Option<&Error>) -> R + Send + Sync + 'a,
    ) -> Self {
        self.nil_result_factory = Some(Arc::new(factory));
        self
    }
}

/// Run one DSL call.
///
/// Polls when the step is async, polling is enabled and there is something
/// to wait for. Otherwise the executor runs exactly once. Returns
/// `Err(Error::Broken)` only for a framework misconfiguration.
pub async fn execute_dsl<'a, R, E>(cfg: DslConfig<'a, R, E>) -> Result<Execution<R>>
where
    R: Send + 'static,
    E: 'static,
{
    let DslConfig {
        ctx,
        step,
        async_config,
        executor,
        expectations,
        convert,
        checker,
        post_process,
        nil_result_factory,
    } = cfg;

    let mode = get_step_mode(&step);
    let has_expectations = !expectations.is_empty() || checker.is_some();
    let use_retry = mode == StepMode::Async && has_expectations && async_config.enabled;

    let executor = guard_nil(executor, nil_result_factory);

    let mut exec = if use_retry {
        let checker = match checker {
            Some(checker) => checker,
            None => match convert {
                Some(convert) => build_expectations_checker_with_convert(expectations, convert),
                None => identity_checker(&step, expectations)?,
            },
        };
        execute_with_retry(&ctx, &step, async_config, &executor, &checker).await
    } else {
        execute_single(&ctx, &executor).await
    };

    if let Some(post_process) = &post_process {
        post_process(exec.value.as_ref(), exec.error.as_ref(), &mut exec.summary);
    }

    Ok(exec)
}

/// A missing value becomes the factory's surrogate, and a missing error
/// becomes [`Error::UnexpectedNil`].
fn guard_nil<'a, R: Send + 'a>(
    executor: Executor<'a, R>,
    factory: Option<NilResultFactory<'a, R>>,
) -> Executor<'a, R> {
    Box::new(move |ctx| {
        let attempt = executor(ctx);
        let factory = factory.clone();
        async move {
            let Outcome { mut value, mut error } = attempt.await;
            if value.is_none() {
                if let Some(factory) = &factory {
                    value = Some(factory(error.as_ref()));
                }
                if error.is_none() {
                    error = Some(Error::UnexpectedNil);
                }
            }
            Outcome { value, error }
        }
        .boxed()
    })
}

/// Checker for `R == E` without a converter. A type mismatch is a framework
/// bug and breaks the step.
fn identity_checker<'a, R: 'static, E: 'static>(
    step: &StepCtx,
    expectations: &'a [Expectation<E>],
) -> Result<Checker<'a, R>> {
    if !expectations.is_empty() && TypeId::of::<R>() != TypeId::of::<E>() {
        return Err(step.break_now(format!(
            "DSL Configuration Error: TResult ({}) != TExpect ({}) but Convert function not provided. \
             This is a framework bug - please report it.",
            type_name::<R>(),
            type_name::<E>()
        )));
    }

    Ok(Box::new(move |value: Option<&R>, err: Option<&Error>| {
        let value = value.and_then(|v| (v as &dyn Any).downcast_ref::<E>());
        expectations.iter().map(|e| (e.check)(err, value)).collect()
    }))
}

/// Demote a successful summary when the envelope holds an error.
pub fn post_process_summary<R: ErrorGetter>(
    value: Option<&R>,
    err: Option<&Error>,
    summary: &mut PollingSummary,
) {
    if err.is_some() {
        return;
    }
    if let Some(e) = value.and_then(ErrorGetter::get_error) {
        summary.success = false;
        if summary.last_error.is_empty() {
            summary.last_error = e;
        }
    }
}

/// Demote a successful summary when the result recorded a network error.
pub fn post_process_network_error<R: NetworkErrorGetter>(
    value: Option<&R>,
    err: Option<&Error>,
    summary: &mut PollingSummary,
) {
    if err.is_some() {
        return;
    }
    if let Some(e) = value
        .and_then(NetworkErrorGetter::get_network_error)
        .filter(|e| !e.is_empty())
    {
        summary.success = false;
        if summary.last_error.is_empty() {
            summary.last_error = e.to_string();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::BackoffConfig,
        expect::{assert_expectations, standard_report},
        mode::AssertionMode,
        step::Status,
    };
    use pretty_assertions::assert_eq;
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    fn async_config() -> AsyncConfig {
        AsyncConfig {
            enabled: true,
            timeout: Duration::from_millis(100),
            interval: Duration::from_millis(10),
            backoff: BackoffConfig {
                enabled: false,
                ..Default::default()
            },
            jitter: 0.0,
        }
    }

    fn equals(expected: &'static str) -> Expectation<String> {
        let name = format!("value == {expected}");
        Expectation::with_report(
            name.clone(),
            move |_err, v: Option<&String>| match v {
                Some(v) if v == expected => CheckResult::ok(),
                _ => CheckResult::retry(format!("expected {expected}")),
            },
            standard_report(name),
        )
    }

    fn counting<'a>(calls: &'a AtomicU32, f: fn(u32) -> Outcome<String>) -> Executor<'a, String> {
        Box::new(move |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { f(n) }.boxed()
        })
    }

    #[tokio::test]
    async fn sync_without_expectations_runs_once() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let cfg: DslConfig<'_, String> = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-sync-plain"),
            async_config(),
            counting(&calls, |_| Outcome::ok("result".into())),
        );
        let exec = execute_dsl(cfg).await?;

        assert_eq!(exec.value.as_deref(), Some("result"));
        assert!(exec.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.summary.attempts, 1);
        assert!(exec.summary.success);
        Ok(())
    }

    #[tokio::test]
    async fn sync_mode_bypasses_retry() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let step = StepCtx::new("dsl-sync-bypass");
        let exps = vec![Expectation::with_report(
            "never",
            |_err, _v: Option<&String>| CheckResult::retry("not yet"),
            standard_report("never"),
        )];
        let cfg = DslConfig::new(
            Context::background(),
            step.clone(),
            AsyncConfig {
                timeout: Duration::from_secs(1),
                ..async_config()
            },
            counting(&calls, |_| Outcome::ok("ok".into())),
        )
        .expectations(&exps);
        let exec = execute_dsl(cfg).await?;

        assert_eq!(exec.summary.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let res = assert_expectations(&step, &exps, exec.error.as_ref(), exec.value.as_ref(), |_, _, _| Ok(()));
        assert!(matches!(res, Err(Error::AssertionFailed(_))));
        let checks = step.snapshot().checks;
        assert!(checks[0].fatal);
        assert_eq!(checks[0].message, "[never] not yet");
        Ok(())
    }

    #[tokio::test]
    async fn async_disabled_runs_once() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let exps = vec![equals("success")];
        let cfg = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-async-disabled").async_mode(),
            AsyncConfig {
                enabled: false,
                ..async_config()
            },
            counting(&calls, |_| Outcome::ok("pending".into())),
        )
        .expectations(&exps);
        let exec = execute_dsl(cfg).await?;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.summary.attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn async_retries_until_success() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let exps = vec![equals("success")];
        let cfg = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-async-retry").async_mode(),
            async_config(),
            counting(&calls, |n| {
                Outcome::ok(if n >= 3 { "success" } else { "pending" }.to_string())
            }),
        )
        .expectations(&exps);
        let exec = execute_dsl(cfg).await?;

        assert!(exec.summary.success);
        assert_eq!(exec.summary.attempts, 3);
        assert_eq!(exec.value.as_deref(), Some("success"));
        Ok(())
    }

    #[tokio::test]
    async fn async_timeout_keeps_failed_checks() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let exps = vec![equals("success")];
        let cfg = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-async-timeout").async_mode(),
            async_config(),
            // The second attempt outlives the deadline, so the loop sees it expired.
            Box::new(|_ctx: Context| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n > 1 {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                    }
                    Outcome::ok("pending".to_string())
                }
                .boxed()
            }),
        )
        .expectations(&exps);
        let exec = execute_dsl(cfg).await?;

        assert!(!exec.summary.success);
        assert_eq!(exec.summary.timeout_reason, "Timeout or context cancelled");
        assert_eq!(exec.summary.failed_checks, vec!["expected success".to_string()]);
        assert_eq!(exec.summary.attempts, 2);
        assert!(exec.error.is_some_and(|e| e.is_context_error()));
        Ok(())
    }

    #[tokio::test]
    async fn deadline_during_sleep_reports_cancelled() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let exps = vec![equals("success")];
        let cfg = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-async-sleep-deadline").async_mode(),
            AsyncConfig {
                timeout: Duration::from_millis(50),
                interval: Duration::from_secs(5),
                ..async_config()
            },
            counting(&calls, |_| Outcome::ok("pending".into())),
        )
        .expectations(&exps);
        let exec = execute_dsl(cfg).await?;

        assert_eq!(exec.summary.timeout_reason, "Context cancelled");
        assert_eq!(exec.summary.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[derive(Debug, PartialEq)]
    struct Envelope {
        value: String,
        error: Option<String>,
    }

    impl ErrorGetter for Envelope {
        fn get_error(&self) -> Option<String> {
            self.error.clone()
        }
    }

    #[tokio::test]
    async fn nil_result_uses_factory() -> eyre::Result<()> {
        let cfg: DslConfig<'_, Envelope> = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-nil-factory"),
            async_config(),
            Box::new(|_ctx| async { Outcome::nil() }.boxed()),
        )
        .nil_result_factory(|_err| Envelope {
            value: "default".into(),
            error: None,
        });
        let exec = execute_dsl(cfg).await?;

        assert_eq!(exec.value.map(|e| e.value).as_deref(), Some("default"));
        assert!(matches!(exec.error, Some(Error::UnexpectedNil)));
        assert_eq!(exec.summary.last_error, "unexpected nil result");
        Ok(())
    }

    #[tokio::test]
    async fn nil_result_keeps_executor_error() -> eyre::Result<()> {
        let cfg: DslConfig<'_, Envelope> = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-nil-error"),
            async_config(),
            Box::new(|_ctx| async { Outcome::err(Error::Http("refused".into())) }.boxed()),
        )
        .nil_result_factory(|err| Envelope {
            value: String::new(),
            error: err.map(|e| e.to_string()),
        });
        let exec = execute_dsl(cfg).await?;

        assert!(matches!(exec.error, Some(Error::Http(_))));
        assert_eq!(
            exec.value.and_then(|e| e.error).as_deref(),
            Some("http error: refused")
        );
        Ok(())
    }

    #[tokio::test]
    async fn post_process_demotes_success() -> eyre::Result<()> {
        let cfg: DslConfig<'_, Envelope> = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-post-process"),
            async_config(),
            Box::new(|_ctx| {
                async {
                    Outcome::ok(Envelope {
                        value: "x".into(),
                        error: Some("PERMISSION_DENIED".into()),
                    })
                }
                .boxed()
            }),
        )
        .post_process(post_process_summary::<Envelope>);
        let exec = execute_dsl(cfg).await?;

        assert!(!exec.summary.success);
        assert_eq!(exec.summary.last_error, "PERMISSION_DENIED");
        Ok(())
    }

    #[tokio::test]
    async fn custom_checker_drives_polling() -> eyre::Result<()> {
        let calls = AtomicU32::new(0);
        let cfg: DslConfig<'_, String> = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-custom-checker").async_mode(),
            async_config(),
            counting(&calls, |n| Outcome::ok(n.to_string())),
        )
        .checker(|v, _err| {
            vec![match v.map(String::as_str) {
                Some("2") => CheckResult::ok(),
                _ => CheckResult::retry("waiting for 2"),
            }]
        });
        let exec = execute_dsl(cfg).await?;

        assert!(exec.summary.success);
        assert_eq!(exec.value.as_deref(), Some("2"));
        Ok(())
    }

    #[tokio::test]
    async fn convert_bridges_types() -> eyre::Result<()> {
        let exps = vec![Expectation::with_report(
            "len is 5",
            |_err, v: Option<&usize>| match v {
                Some(5) => CheckResult::ok(),
                _ => CheckResult::retry("short"),
            },
            standard_report("len is 5"),
        )];
        let calls = AtomicU32::new(0);
        let cfg = DslConfig::new(
            Context::background(),
            StepCtx::new("dsl-convert").async_mode(),
            async_config(),
            counting(&calls, |n| Outcome::ok("x".repeat(n as usize + 2))),
        )
        .expectations(&exps)
        .convert(|s: &String| s.len());
        let exec = execute_dsl(cfg).await?;

        assert!(exec.summary.success);
        assert_eq!(exec.summary.attempts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn type_mismatch_without_convert_breaks() {
        let step = StepCtx::new("dsl-mismatch").async_mode();
        let exps = vec![Expectation::with_report(
            "len",
            |_err, _v: Option<&usize>| CheckResult::ok(),
            standard_report("len"),
        )];
        let cfg = DslConfig::new(
            Context::background(),
            step.clone(),
            async_config(),
            Box::new(|_ctx| async { Outcome::ok("x".to_string()) }.boxed()),
        )
        .expectations(&exps);
        let res = execute_dsl(cfg).await;

        let Err(Error::Broken(msg)) = res else {
            panic!("expected a broken step");
        };
        assert!(msg.starts_with("DSL Configuration Error: TResult (alloc::string::String) != TExpect (usize)"));
        assert_eq!(step.status(), Status::Broken);
    }

    struct Http {
        network_error: Option<String>,
    }

    impl NetworkErrorGetter for Http {
        fn get_network_error(&self) -> Option<&str> {
            self.network_error.as_deref()
        }
    }

    #[test]
    fn network_error_post_process() {
        let mut summary = PollingSummary {
            success: true,
            ..Default::default()
        };
        let failed = Http {
            network_error: Some("connection refused".into()),
        };
        post_process_network_error(Some(&failed), None, &mut summary);
        assert!(!summary.success);
        assert_eq!(summary.last_error, "connection refused");

        let mut untouched = PollingSummary {
            success: true,
            ..Default::default()
        };
        post_process_network_error(Some(&failed), Some(&Error::Cancelled), &mut untouched);
        post_process_network_error(Some(&Http { network_error: None }), None, &mut untouched);
        assert!(untouched.success);
    }

    #[test]
    fn assertion_mode_of_async_steps() {
        let step = StepCtx::new("dsl-mode").async_mode();
        assert_eq!(
            crate::mode::assertion_mode_for(get_step_mode(&step)),
            AssertionMode::Assert
        );
    }
}
