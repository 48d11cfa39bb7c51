//! # gRPC DSL
//!
//! [`Call`] drives one unary RPC through the polling engine. The transport is
//! whatever tonic-generated client the test already has: the call is handed a
//! closure that invokes the generated method.
//!
//! ```rust,ignore
//! let client = UsersClient::new(channel);
//! let user = grpc::Call::new(&step, move |req| {
//!     let mut client = client.clone();
//!     async move { client.get_user(req).await }
//! })
//! .method("/users.v1.Users/GetUser")
//! .request(GetUserRequest { id: 7 })
//! .expect_no_error()
//! .expect_field_value("name", "alice")
//! .send()
//! .await?;
//! ```
//!
//! A non-OK status is kept twice: inside the [`Response`] envelope and as
//! the call error. Expectations see a JSON view of the envelope, the
//! [`Envelope`].
use eyre::eyre;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, marker::PhantomData, time::Duration};
use tokio::time::Instant;
use tonic::{
    metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue},
    Code, Status,
};

use crate::{
    check::CheckResult,
    config::AsyncConfig,
    context::Context,
    dsl::{execute_dsl, post_process_summary, DslConfig, ErrorGetter},
    dsl_errors,
    expect::{
        add_expectation, assert_expectations, build_json_field_expectation,
        build_pre_check_with_body, json_check_equals, json_check_not_empty, json_getter,
        standard_report, Expectation, JsonCheck, JsonFieldExpectationConfig, PreCheck,
        PreCheckConfig,
    },
    mode::pick_asserter,
    polling::attach_if_async,
    retry::{Executor, Outcome},
    step::StepCtx,
    Error, Result,
};

const DSL: &str = "gRPC";

pub const REQUEST_ATTACHMENT: &str = "gRPC Request";

/// Status of a failed call, detached from the [`Status`] it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub code: Code,
    pub message: String,
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gRPC status {:?}: {}", self.code, self.message)
    }
}

impl From<&Status> for StatusError {
    fn from(status: &Status) -> Self {
        StatusError {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// Code of a call error. Anything but a status counts as `Unknown`.
fn error_code(err: &Error) -> Code {
    match err {
        Error::Status(s) => s.code(),
        _ => Code::Unknown,
    }
}

#[derive(Debug)]
pub struct Response<T> {
    pub body: Option<T>,
    /// Response headers, or the status metadata of a failed call.
    pub metadata: MetadataMap,
    pub duration: Duration,
    pub error: Option<StatusError>,
}

impl<T> Response<T> {
    fn from_result(
        res: std::result::Result<tonic::Response<T>, Status>,
        duration: Duration,
    ) -> Outcome<Response<T>> {
        match res {
            Ok(resp) => {
                let (metadata, body, _) = resp.into_parts();
                Outcome::ok(Response {
                    body: Some(body),
                    metadata,
                    duration,
                    error: None,
                })
            }
            Err(status) => Outcome::new(
                Some(Response {
                    body: None,
                    metadata: status.metadata().clone(),
                    duration,
                    error: Some(StatusError::from(&status)),
                }),
                Some(Error::Status(status)),
            ),
        }
    }

    /// Surrogate for a call that produced nothing, e.g. after cancellation.
    fn failed(err: Option<&Error>) -> Response<T> {
        let (code, message) = match err {
            Some(Error::Status(s)) => (s.code(), s.message().to_string()),
            Some(e) => (error_code(e), e.to_string()),
            None => (Code::Unknown, "nil response".to_string()),
        };
        Response {
            body: None,
            metadata: MetadataMap::new(),
            duration: Duration::ZERO,
            error: Some(StatusError { code, message }),
        }
    }
}

impl<T> ErrorGetter for Response<T> {
    fn get_error(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// JSON view of a [`Response`] inspected by the expectations.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// `serde_json` rendering of the body. Empty when there is no body.
    pub raw_body: Vec<u8>,
    pub body_error: Option<String>,
    pub metadata: MetadataMap,
    pub error: Option<StatusError>,
}

impl Envelope {
    pub fn of<T: Serialize>(resp: &Response<T>) -> Envelope {
        let (raw_body, body_error) = match resp.body.as_ref().map(serde_json::to_vec) {
            Some(Ok(raw)) => (raw, None),
            Some(Err(e)) => (Vec::new(), Some(format!("failed to marshal response: {e}"))),
            None => (Vec::new(), None),
        };
        Envelope {
            raw_body,
            body_error,
            metadata: resp.metadata.clone(),
            error: resp.error.clone(),
        }
    }

    /// Every value of a metadata key that is valid ASCII.
    pub fn metadata_values(&self, key: &str) -> Vec<&str> {
        self.metadata
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }
}

pub fn build_envelope_pre_check() -> PreCheck<Envelope> {
    build_pre_check_with_body(
        PreCheckConfig::new()
            .has_error(|e: &Envelope| e.error.is_some())
            .empty_body(|e: &Envelope| e.raw_body.is_empty() && e.body_error.is_none()),
    )
}

fn field_expectation(path: &str, name: String, check: JsonCheck) -> Expectation<Envelope> {
    build_json_field_expectation(JsonFieldExpectationConfig {
        path: path.to_string(),
        name,
        get_json: json_getter(|e: &Envelope| match &e.body_error {
            Some(msg) => Err(Error::Unexpected(eyre!("{msg}"))),
            None => Ok(e.raw_body.as_slice()),
        }),
        pre_check: Some(build_envelope_pre_check()),
        check,
        report: None,
    })
}

fn metadata_log(metadata: &MetadataMap) -> IndexMap<String, String> {
    metadata
        .clone()
        .into_headers()
        .iter()
        .map(|(k, v)| {
            let value = v.to_str().unwrap_or("<binary>").to_string();
            (k.to_string(), value)
        })
        .collect()
}

#[derive(Serialize)]
struct RequestLog<'a, Req> {
    method: &'a str,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    metadata: IndexMap<String, String>,
    body: &'a Req,
}

#[derive(Serialize)]
struct ResponseLog<'a, Resp> {
    status: String,
    status_code: i32,
    duration: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    metadata: IndexMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a Resp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// One unary RPC with its expectations.
pub struct Call<Req, Resp, F> {
    step: StepCtx,
    ctx: Context,
    invoke: F,
    async_config: AsyncConfig,
    step_name: Option<String>,
    service: String,
    method: String,
    full_method: String,
    body: Option<Req>,
    metadata: MetadataMap,
    pending: Option<Error>,
    sent: bool,
    expectations: Vec<Expectation<Envelope>>,
    _resp: PhantomData<fn() -> Resp>,
}

impl<Req, Resp, F> Call<Req, Resp, F> {
    /// `invoke` performs the RPC, typically by calling a generated client method.
    pub fn new<Fut>(step: &StepCtx, invoke: F) -> Call<Req, Resp, F>
    where
        F: Fn(tonic::Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<tonic::Response<Resp>, Status>>,
    {
        Call {
            step: step.clone(),
            ctx: Context::background(),
            invoke,
            async_config: AsyncConfig::default(),
            step_name: None,
            service: String::new(),
            method: String::new(),
            full_method: String::new(),
            body: None,
            metadata: MetadataMap::new(),
            pending: None,
            sent: false,
            expectations: Vec::new(),
            _resp: PhantomData,
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

    /// Full method path, `/package.Service/Method`.
    pub fn method(&mut self, full_method: &str) -> &mut Self {
        self.full_method = full_method.to_string();
        let parts: Vec<&str> = full_method.split('/').collect();
        if parts.len() >= 3 {
            self.service = parts[1].to_string();
            self.method = parts[2].to_string();
        }
        self
    }

    pub fn service(&mut self, service: &str) -> &mut Self {
        self.service = service.to_string();
        self.update_full_method();
        self
    }

    pub fn method_name(&mut self, method: &str) -> &mut Self {
        self.method = method.to_string();
        self.update_full_method();
        self
    }

    fn update_full_method(&mut self) {
        if !self.service.is_empty() && !self.method.is_empty() {
            self.full_method = format!("/{}/{}", self.service, self.method);
        }
    }

    pub fn request(&mut self, body: Req) -> &mut Self {
        self.body = Some(body);
        self
    }

    pub fn metadata(&mut self, key: &str, value: &str) -> &mut Self {
        if self.sent {
            let e = self
                .step
                .break_now(dsl_errors::method_after_send(DSL, "metadata"));
            self.pending.get_or_insert(e);
            return self;
        }
        match (
            MetadataKey::<Ascii>::from_bytes(key.as_bytes()),
            MetadataValue::<Ascii>::try_from(value),
        ) {
            (Ok(k), Ok(v)) => {
                self.metadata.append(k, v);
            }
            _ => {
                let e = self.step.break_now(dsl_errors::custom(
                    DSL,
                    &format!("invalid metadata '{key}: {value}'"),
                ));
                self.pending.get_or_insert(e);
            }
        }
        self
    }

    fn push(&mut self, exp: Expectation<Envelope>) -> &mut Self {
        if let Err(e) = add_expectation(&self.step, self.sent, &mut self.expectations, exp, DSL) {
            self.pending.get_or_insert(e);
        }
        self
    }

    pub fn expect_no_error(&mut self) -> &mut Self {
        let name = "Expect: No error";
        self.push(Expectation::with_report(
            name,
            |err, env: Option<&Envelope>| {
                if let Some(e) = err {
                    return CheckResult::retry(format!("Expected no error, got: {e}"));
                }
                match env.and_then(|e| e.error.as_ref()) {
                    Some(e) => CheckResult::retry(format!("Expected no error, got: {e}")),
                    None => CheckResult::ok(),
                }
            },
            standard_report(name),
        ))
    }

    pub fn expect_error(&mut self) -> &mut Self {
        let name = "Expect: Error";
        self.push(Expectation::with_report(
            name,
            |err, env: Option<&Envelope>| {
                if err.is_some() || env.is_some_and(|e| e.error.is_some()) {
                    return CheckResult::ok();
                }
                CheckResult::retry("Expected an error, but call succeeded")
            },
            standard_report(name),
        ))
    }

    pub fn expect_status_code(&mut self, code: Code) -> &mut Self {
        let name = format!("Expect: Status code {code:?} ({})", code as i32);
        self.push(Expectation::with_report(
            name.clone(),
            move |err, env: Option<&Envelope>| {
                let actual = match (err, env.and_then(|e| e.error.as_ref())) {
                    (Some(e), _) => error_code(e),
                    (None, Some(e)) => e.code,
                    (None, None) => Code::Ok,
                };
                if actual == code {
                    return CheckResult::ok();
                }
                CheckResult::retry(format!(
                    "Expected status {code:?} ({}), got {actual:?} ({})",
                    code as i32, actual as i32
                ))
            },
            standard_report(name),
        ))
    }

    pub fn expect_field_value<V: Serialize>(&mut self, path: &str, expected: V) -> &mut Self {
        let exp = match serde_json::to_value(&expected) {
            Ok(v) => {
                let shown = match &v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                field_expectation(
                    path,
                    format!("Expect: Field '{path}' = {shown}"),
                    json_check_equals(v),
                )
            }
            Err(e) => {
                let name = format!("Expect: Field '{path}' = <unencodable>");
                let reason = format!("Cannot encode expected value: {e}");
                Expectation::with_report(
                    name.clone(),
                    move |_err, _env: Option<&Envelope>| CheckResult::fatal(reason.clone()),
                    standard_report(name),
                )
            }
        };
        self.push(exp)
    }

    pub fn expect_field_not_empty(&mut self, path: &str) -> &mut Self {
        let exp = field_expectation(
            path,
            format!("Expect: Field '{path}' not empty"),
            json_check_not_empty(),
        );
        self.push(exp)
    }

    pub fn expect_field_exists(&mut self, path: &str) -> &mut Self {
        let exp = field_expectation(
            path,
            format!("Expect: Field '{path}' exists"),
            Box::new(|_: &Value, _: &str| CheckResult::ok()),
        );
        self.push(exp)
    }

    pub fn expect_metadata(&mut self, key: &str, value: &str) -> &mut Self {
        let name = format!("Expect: Metadata '{key}' = '{value}'");
        let (key, value) = (key.to_string(), value.to_string());
        self.push(Expectation::with_report(
            name.clone(),
            move |err, env: Option<&Envelope>| {
                if err.is_some() {
                    return CheckResult::retry("Call failed with error");
                }
                let Some(env) = env else {
                    return CheckResult::retry("Response is nil");
                };
                let values = env.metadata_values(&key);
                if values.is_empty() {
                    return CheckResult::retry(format!("Metadata key '{key}' not found"));
                }
                if values.contains(&value.as_str()) {
                    return CheckResult::ok();
                }
                CheckResult::retry(format!(
                    "Metadata '{key}' = {values:?}, expected '{value}'"
                ))
            },
            standard_report(name),
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.full_method.trim().is_empty() {
            return Err(self.step.break_now(dsl_errors::not_set_with_hint(
                DSL,
                "gRPC method",
                "Use .method(\"/package.Service/Method\") or .service().method_name().",
            )));
        }
        if self.body.is_none() {
            return Err(self.step.break_now(dsl_errors::not_set_with_hint(
                DSL,
                "request body",
                "Use .request(...).",
            )));
        }
        Ok(())
    }
}

impl<Req, Resp, F, Fut> Call<Req, Resp, F>
where
    Req: Clone + Serialize + Send + Sync,
    Resp: Serialize + Send + 'static,
    F: Fn(tonic::Request<Req>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<tonic::Response<Resp>, Status>> + Send,
{
    /// Invoke the RPC, polling in async steps, and report the expectations
    /// on a nested step named after the method.
    pub async fn send(&mut self) -> Result<Response<Resp>> {
        if let Some(e) = self.pending.take() {
            return Err(e);
        }
        self.validate()?;
        self.sent = true;

        let name = self
            .step_name
            .clone()
            .unwrap_or_else(|| format!("gRPC {}", self.full_method));
        let this = &*self;
        self.step
            .with_new_step(name, |step| async move { this.exchange(step).await })
            .await
    }

    async fn exchange(&self, step: StepCtx) -> Result<Response<Resp>> {
        let Some(body) = &self.body else {
            return Err(step.break_now(dsl_errors::not_set(DSL, "request body")));
        };
        step.attach_json(
            REQUEST_ATTACHMENT,
            &RequestLog {
                method: &self.full_method,
                metadata: metadata_log(&self.metadata),
                body,
            },
        )?;

        let invoke = &self.invoke;
        let metadata = &self.metadata;
        let executor: Executor<'_, Response<Resp>> = Box::new(move |ctx: Context| {
            let mut request = tonic::Request::new(body.clone());
            *request.metadata_mut() = metadata.clone();
            let call = invoke(request);
            async move {
                let started = Instant::now();
                tokio::select! {
                    res = call => Response::from_result(res, started.elapsed()),
                    _ = ctx.done() => Outcome::err(ctx.err().unwrap_or(Error::Cancelled)),
                }
            }
            .boxed()
        });

        let cfg = DslConfig::new(self.ctx.clone(), step.clone(), self.async_config, executor)
            .expectations(&self.expectations)
            .convert(Envelope::of::<Resp>)
            .post_process(post_process_summary::<Response<Resp>>)
            .nil_result_factory(Response::failed);
        let exec = execute_dsl(cfg).await?;

        let resp = exec
            .value
            .unwrap_or_else(|| Response::failed(exec.error.as_ref()));
        attach_if_async(&step, &exec.summary)?;

        let code = resp.error.as_ref().map(|e| e.code).unwrap_or(Code::Ok);
        step.attach_json(
            format!("gRPC Response [{code:?}]"),
            &ResponseLog {
                status: format!("{code:?}"),
                status_code: code as i32,
                duration: format!("{:?}", resp.duration),
                metadata: metadata_log(&resp.metadata),
                body: resp.body.as_ref(),
                error: resp.error.as_ref().map(|e| e.message.as_str()),
            },
        )?;

        let envelope = Envelope::of(&resp);
        assert_expectations(
            &step,
            &self.expectations,
            exec.error.as_ref(),
            Some(&envelope),
            |step, mode, err| match err {
                Some(_) => pick_asserter(step, mode).no_error(err, "gRPC call failed"),
                None => Ok(()),
            },
        )?;

        Ok(resp)
    }
}
