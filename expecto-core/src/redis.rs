//! # Redis DSL
//!
//! Reads one key through a [`RedisClient`] and checks its value and TTL.
//!
//! ```rust,ignore
//! redis::Query::new(&step, &client)
//!     .key("session:42")
//!     .expect_exists()
//!     .expect_json_field("user", "alice")
//!     .expect_ttl(Duration::from_secs(60), Duration::from_secs(3600))
//!     .send()
//!     .await?;
//! ```
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    check::CheckResult,
    config::AsyncConfig,
    context::Context,
    dsl::{execute_dsl, post_process_summary, DslConfig, ErrorGetter},
    dsl_errors,
    expect::{
        add_expectation, assert_expectations, build_json_field_expectation,
        build_key_exists_pre_check, build_pre_check, json_check_equals, json_check_not_empty,
        json_getter, standard_report, Expectation, JsonCheck, JsonFieldExpectationConfig,
        PreCheck, PreCheckConfig,
    },
    mode::pick_asserter,
    polling::attach_if_async,
    retry::{Executor, Outcome},
    step::StepCtx,
    Error, Result,
};

const DSL: &str = "Redis";

pub const QUERY_ATTACHMENT: &str = "Redis Query";

/// The subset of Redis a query needs.
#[async_trait]
pub trait RedisClient: Send + Sync {
    /// `GET key`. `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// `TTL key` in seconds, with the Redis sentinels `-1` (no expiry) and
    /// `-2` (no such key).
    async fn ttl(&self, key: &str) -> Result<i64>;

    /// Server address shown in reports.
    fn addr(&self) -> String {
        String::new()
    }

    fn async_config(&self) -> AsyncConfig {
        AsyncConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    Persistent,
    #[default]
    Missing,
    Expires(Duration),
}

impl Ttl {
    pub fn from_seconds(secs: i64) -> Ttl {
        match secs {
            -1 => Ttl::Persistent,
            s if s < 0 => Ttl::Missing,
            s => Ttl::Expires(Duration::from_secs(s as u64)),
        }
    }
}

impl std::fmt::Display for Ttl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ttl::Persistent => f.write_str("no expiration"),
            Ttl::Missing => f.write_str("missing"),
            Ttl::Expires(d) => write!(f, "{}", humantime::format_duration(*d)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedisResult {
    pub key: String,
    /// `None` when the key does not exist.
    pub value: Option<String>,
    pub ttl: Ttl,
    pub duration: Duration,
    pub error: Option<String>,
}

impl RedisResult {
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }

    /// Deserialize the value as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.value())?)
    }
}

impl ErrorGetter for RedisResult {
    fn get_error(&self) -> Option<String> {
        self.error.clone()
    }
}

fn base_pre_check() -> PreCheck<RedisResult> {
    build_pre_check(PreCheckConfig::new().has_error(|r: &RedisResult| r.error.is_some()))
}

fn key_pre_check() -> PreCheck<RedisResult> {
    build_key_exists_pre_check(
        Some(base_pre_check()),
        RedisResult::exists,
        |r: &RedisResult| r.key.clone(),
    )
}

/// An expectation on an existing key.
fn on_existing_key<F>(name: String, check: F) -> Expectation<RedisResult>
where
    F: Fn(&RedisResult) -> CheckResult + Send + Sync + 'static,
{
    let pre_check = key_pre_check();
    Expectation::with_report(
        name.clone(),
        move |err, result: Option<&RedisResult>| {
            if let Err(res) = pre_check(err, result) {
                return res;
            }
            match result {
                Some(r) => check(r),
                None => CheckResult::retry("Response is nil"),
            }
        },
        standard_report(name),
    )
}

fn json_field(path: &str, name: String, check: JsonCheck) -> Expectation<RedisResult> {
    build_json_field_expectation(JsonFieldExpectationConfig {
        path: path.to_string(),
        name,
        get_json: json_getter(|r: &RedisResult| Ok(r.value().as_bytes())),
        pre_check: Some(key_pre_check()),
        check,
        report: None,
    })
}

#[derive(Serialize)]
struct QueryLog<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    server: &'a str,
    key: &'a str,
}

#[derive(Serialize)]
struct ResultLog<'a> {
    key: &'a str,
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
    duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> From<&'a RedisResult> for ResultLog<'a> {
    fn from(r: &'a RedisResult) -> Self {
        ResultLog {
            key: &r.key,
            exists: r.exists(),
            value: r.value.as_deref(),
            ttl: r.exists().then(|| r.ttl.to_string()),
            duration: format!("{:?}", r.duration),
            error: r.error.as_deref(),
        }
    }
}

pub struct Query<'c> {
    step: StepCtx,
    ctx: Context,
    client: &'c dyn RedisClient,
    async_config: AsyncConfig,
    step_name: Option<String>,
    key: String,
    pending: Option<Error>,
    sent: bool,
    expectations: Vec<Expectation<RedisResult>>,
}

impl<'c> Query<'c> {
    pub fn new(step: &StepCtx, client: &'c dyn RedisClient) -> Query<'c> {
        Query {
            step: step.clone(),
            ctx: Context::background(),
            client,
            async_config: client.async_config(),
            step_name: None,
            key: String::new(),
            pending: None,
            sent: false,
            expectations: Vec::new(),
        }
    }

    pub fn context(&mut self, ctx: Context) -> &mut Self {
        self.ctx = ctx;
        self
    }

    pub fn async_config(&mut self, cfg: AsyncConfig) -> &mut Self {
        self.async_config = cfg;
        self
    }

    pub fn step_name(&mut self, name: &str) -> &mut Self {
        let name = name.trim();
        self.step_name = (!name.is_empty()).then(|| name.to_string());
        self
    }

    pub fn key(&mut self, key: &str) -> &mut Self {
        self.key = key.to_string();
        self
    }

    fn push(&mut self, exp: Expectation<RedisResult>) -> &mut Self {
        if let Err(e) = add_expectation(&self.step, self.sent, &mut self.expectations, exp, DSL) {
            self.pending.get_or_insert(e);
        }
        self
    }

    pub fn expect_exists(&mut self) -> &mut Self {
        self.push(on_existing_key("Expect: Key exists".into(), |_| CheckResult::ok()))
    }

    pub fn expect_not_exists(&mut self) -> &mut Self {
        let name = "Expect: Key not exists";
        let pre_check = base_pre_check();
        self.push(Expectation::with_report(
            name,
            move |err, result: Option<&RedisResult>| {
                if let Err(res) = pre_check(err, result) {
                    return res;
                }
                match result {
                    Some(r) if r.exists() => {
                        CheckResult::retry(format!("Key '{}' exists but expected not to", r.key))
                    }
                    _ => CheckResult::ok(),
                }
            },
            standard_report(name),
        ))
    }

    pub fn expect_value(&mut self, expected: &str) -> &mut Self {
        let expected = expected.to_string();
        self.push(on_existing_key(
            format!("Expect: Value = {expected:?}"),
            move |r| {
                if r.value() == expected {
                    return CheckResult::ok();
                }
                CheckResult::retry(format!("Expected value {expected:?}, got {:?}", r.value()))
            },
        ))
    }

    pub fn expect_value_not_empty(&mut self) -> &mut Self {
        self.push(on_existing_key("Expect: Value not empty".into(), |r| {
            if r.value().trim().is_empty() {
                return CheckResult::retry("Value is empty");
            }
            CheckResult::ok()
        }))
    }

    /// Compare a field of the JSON value stored under the key.
    pub fn expect_json_field<V: Serialize>(&mut self, path: &str, expected: V) -> &mut Self {
        let exp = match serde_json::to_value(&expected) {
            Ok(v) => {
                let shown = match &v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json_field(
                    path,
                    format!("Expect: JSON field '{path}' = {shown}"),
                    json_check_equals(v),
                )
            }
            Err(e) => {
                let reason = format!("Cannot encode expected value: {e}");
                on_existing_key(
                    format!("Expect: JSON field '{path}' = <unencodable>"),
                    move |_| CheckResult::fatal(reason.clone()),
                )
            }
        };
        self.push(exp)
    }

    pub fn expect_json_field_not_empty(&mut self, path: &str) -> &mut Self {
        let exp = json_field(
            path,
            format!("Expect: JSON field '{path}' not empty"),
            json_check_not_empty(),
        );
        self.push(exp)
    }

    /// The key expires, with a remaining lifetime within `[min, max]`.
    pub fn expect_ttl(&mut self, min: Duration, max: Duration) -> &mut Self {
        let name = format!(
            "Expect: TTL between {} and {}",
            humantime::format_duration(min),
            humantime::format_duration(max)
        );
        self.push(on_existing_key(name, move |r| match r.ttl {
            Ttl::Expires(d) if d >= min && d <= max => CheckResult::ok(),
            ttl => CheckResult::retry(format!(
                "TTL is {ttl}, expected between {} and {}",
                humantime::format_duration(min),
                humantime::format_duration(max)
            )),
        }))
    }

    pub fn expect_no_ttl(&mut self) -> &mut Self {
        self.push(on_existing_key("Expect: No TTL (persistent)".into(), |r| {
            match r.ttl {
                Ttl::Persistent => CheckResult::ok(),
                ttl => CheckResult::retry(format!("Key has TTL {ttl}, expected no expiration")),
            }
        }))
    }

    fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(self.step.break_now(dsl_errors::not_set_with_hint(
                DSL,
                "Redis key",
                "Use .key(\"key_name\").",
            )));
        }
        Ok(())
    }

    /// Read the key, polling in async steps, and report the expectations on
    /// a nested step.
    pub async fn send(&mut self) -> Result<RedisResult> {
        if let Some(e) = self.pending.take() {
            return Err(e);
        }
        self.validate()?;
        self.sent = true;

        let name = self
            .step_name
            .clone()
            .unwrap_or_else(|| format!("Redis GET {}", self.key));
        let this = &*self;
        self.step
            .with_new_step(name, |step| async move { this.exchange(step).await })
            .await
    }

    async fn exchange(&self, step: StepCtx) -> Result<RedisResult> {
        step.attach_json(
            QUERY_ATTACHMENT,
            &QueryLog {
                server: &self.client.addr(),
                key: &self.key,
            },
        )?;

        let client = self.client;
        let key = self.key.as_str();
        let executor: Executor<'_, RedisResult> = Box::new(move |ctx: Context| {
            async move {
                tokio::select! {
                    outcome = read_key(client, key) => outcome,
                    _ = ctx.done() => Outcome::err(ctx.err().unwrap_or(Error::Cancelled)),
                }
            }
            .boxed()
        });

        let cfg = DslConfig::new(self.ctx.clone(), step.clone(), self.async_config, executor)
            .expectations(&self.expectations)
            .post_process(post_process_summary::<RedisResult>)
            .nil_result_factory(move |err: Option<&Error>| RedisResult {
                key: key.to_string(),
                error: Some(match err {
                    Some(e) => format!("{}: {e}", Error::UnexpectedNil),
                    None => Error::UnexpectedNil.to_string(),
                }),
                ..Default::default()
            });
        let exec = execute_dsl(cfg).await?;

        let result = exec.value.unwrap_or_else(|| RedisResult {
            key: self.key.clone(),
            ..Default::default()
        });
        attach_if_async(&step, &exec.summary)?;
        let found = if result.exists() { "Found" } else { "Not Found" };
        step.attach_json(format!("Redis Result [{found}]"), &ResultLog::from(&result))?;

        assert_expectations(
            &step,
            &self.expectations,
            exec.error.as_ref(),
            Some(&result),
            |step, mode, err| match err {
                Some(_) => pick_asserter(step, mode).no_error(err, "Redis query failed"),
                None => Ok(()),
            },
        )?;

        Ok(result)
    }
}

async fn read_key(client: &dyn RedisClient, key: &str) -> Outcome<RedisResult> {
    let started = Instant::now();
    let mut result = RedisResult {
        key: key.to_string(),
        ..Default::default()
    };
    let read = async {
        result.value = client.get(key).await?;
        if result.exists() {
            result.ttl = Ttl::from_seconds(client.ttl(key).await?);
        }
        Ok::<_, Error>(())
    }
    .await;
    result.duration = started.elapsed();
    match read {
        Ok(()) => Outcome::ok(result),
        Err(e) => {
            result.error = Some(e.to_string());
            Outcome::new(Some(result), Some(e))
        }
    }
}
