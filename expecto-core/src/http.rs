//! # HTTP DSL
//!
//! A thin client on top of `hyper-util`'s pooled client and the [`Call`]
//! builder that drives it through the polling engine.
//!
//! ```rust,ignore
//! let client = http::Client::from_config(&get_config().client("orders_api")?);
//! let order: http::Response<Order> = client
//!     .call(&step)
//!     .post("/orders")
//!     .body(&NewOrder { sku: "A-1" })
//!     .expect_status(201)
//!     .expect_field_not_empty("id")
//!     .send()
//!     .await?;
//! ```
//!
//! Transport failures never surface as executor errors. They are recorded in
//! [`RawResponse::network_error`] so the pre-checks can retry them.
use bytes::Bytes;
use futures::FutureExt;
use http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client as HyperClient},
    rt::TokioExecutor,
};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{borrow::Cow, marker::PhantomData, str::FromStr, time::Duration};
use tokio::time::Instant;
use tracing::*;
use url::Url;

use crate::{
    check::CheckResult,
    config::{AsyncConfig, ClientConfig},
    context::Context,
    dsl::{execute_dsl, post_process_network_error, DslConfig, NetworkErrorGetter},
    dsl_errors,
    expect::{
        add_expectation, assert_expectations, build_pre_check, build_pre_check_with_body,
        json_getter, standard_report, Expectation, JsonSource, PreCheck, PreCheckConfig,
    },
    mode::pick_asserter,
    polling::attach_if_async,
    retry::{Executor, Outcome},
    step::StepCtx,
    Error, Result,
};

const DSL: &str = "HTTP";

pub const REQUEST_ATTACHMENT: &str = "HTTP Request";
pub const RESPONSE_ATTACHMENT: &str = "HTTP Response";

type Transport = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP client bound to one base URL.
#[derive(Clone)]
pub struct Client {
    inner: Transport,
    base_url: String,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    async_config: AsyncConfig,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("async_config", &self.async_config)
            .finish()
    }
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Client {
        Client {
            inner: HyperClient::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            base_url: base_url.into(),
            headers: Vec::new(),
            timeout: None,
            async_config: AsyncConfig::default(),
        }
    }

    /// Client for a `[clients.<name>]` table resolved by [`crate::Config::client`].
    pub fn from_config(cfg: &ClientConfig) -> Client {
        let mut client = Client::new(cfg.address.clone()).with_async_config(cfg.async_config);
        client.timeout = cfg.timeout;
        client
    }

    pub fn with_async_config(mut self, cfg: AsyncConfig) -> Client {
        self.async_config = cfg;
        self
    }

    /// Header sent with every call of this client.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Client {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Per-request timeout of the transport.
    pub fn with_timeout(mut self, timeout: Duration) -> Client {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn async_config(&self) -> AsyncConfig {
        self.async_config
    }

    pub fn call<TResp>(&self, step: &StepCtx) -> Call<'_, TResp> {
        Call::new(step, self)
    }

    async fn execute(&self, req: &PreparedRequest) -> RawResponse {
        let started = Instant::now();
        let exchange = async {
            let mut builder = hyper::Request::builder()
                .method(req.method.clone())
                .uri(req.url.as_str());
            if let Some(headers) = builder.headers_mut() {
                headers.extend(req.headers.clone());
            }
            let request = builder
                .body(Full::new(req.body.clone()))
                .map_err(|e| e.to_string())?;
            let res = self
                .inner
                .request(request)
                .await
                .map_err(|e| format!("{:#}", eyre::Report::new(e)))?;
            let (parts, body) = res.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| format!("failed to read response body: {e}"))?
                .to_bytes();
            Ok::<_, String>((parts, body))
        };

        let res = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| {
                    Err(format!(
                        "request timed out after {}",
                        humantime::format_duration(timeout)
                    ))
                }),
            None => exchange.await,
        };

        let duration = started.elapsed();
        match res {
            Ok((parts, body)) => RawResponse {
                status: parts.status.as_u16(),
                headers: parts.headers,
                raw_body: body.to_vec(),
                duration,
                network_error: None,
            },
            Err(e) => {
                debug!("{} {} failed: {e}", req.method, req.url);
                RawResponse::failed(e, duration)
            }
        }
    }
}

/// Untyped response inspected by the expectations.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub raw_body: Vec<u8>,
    pub duration: Duration,
    /// Set when no response was received at all.
    pub network_error: Option<String>,
}

impl RawResponse {
    fn failed(error: String, duration: Duration) -> RawResponse {
        RawResponse {
            duration,
            network_error: Some(error),
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw_body)
    }
}

impl NetworkErrorGetter for RawResponse {
    fn get_network_error(&self) -> Option<&str> {
        self.network_error.as_deref()
    }
}

/// Response handed back by [`Call::send`].
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub status: u16,
    pub headers: HeaderMap,
    /// `None` when the body is empty or does not decode into `T`.
    pub body: Option<T>,
    pub raw_body: Vec<u8>,
    pub duration: Duration,
    pub network_error: Option<String>,
}

impl<T: DeserializeOwned> Response<T> {
    fn decode(raw: RawResponse) -> Response<T> {
        let body = if raw.raw_body.is_empty() {
            None
        } else {
            match serde_json::from_slice(&raw.raw_body) {
                Ok(body) => Some(body),
                Err(e) => {
                    debug!("response body does not decode: {e}");
                    None
                }
            }
        };
        Response {
            status: raw.status,
            headers: raw.headers,
            body,
            raw_body: raw.raw_body,
            duration: raw.duration,
            network_error: raw.network_error,
        }
    }
}

pub fn response_pre_check_config() -> PreCheckConfig<RawResponse> {
    PreCheckConfig::new()
        .network_error(|r: &RawResponse| r.network_error.clone())
        .empty_body(|r: &RawResponse| r.raw_body.is_empty())
}

pub fn build_response_pre_check() -> PreCheck<RawResponse> {
    build_pre_check(response_pre_check_config())
}

pub fn build_response_pre_check_with_body() -> PreCheck<RawResponse> {
    build_pre_check_with_body(response_pre_check_config())
}

fn json_source() -> JsonSource<RawResponse> {
    JsonSource::new(
        json_getter(|r: &RawResponse| Ok(r.raw_body.as_slice())),
        build_response_pre_check_with_body(),
    )
}

#[derive(Debug)]
struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Serialize)]
struct RequestLog<'a> {
    method: &'a str,
    url: &'a str,
    headers: IndexMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Serialize)]
struct ResponseLog<'a> {
    status: u16,
    headers: IndexMap<&'a str, &'a str>,
    body: Value,
    duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_error: Option<&'a str>,
}

fn header_log(headers: &HeaderMap) -> IndexMap<&str, &str> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.to_str().unwrap_or("<binary>")))
        .collect()
}

/// JSON when the bytes parse, text otherwise.
fn body_log(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// One HTTP request with its expectations.
pub struct Call<'c, TResp = Value> {
    step: StepCtx,
    client: &'c Client,
    ctx: Context,
    method: Option<Method>,
    path: String,
    headers: Vec<(String, String)>,
    path_params: IndexMap<String, String>,
    query_params: Vec<(String, String)>,
    body: Option<Bytes>,
    /// First builder error, surfaced by `send`.
    pending: Option<Error>,
    sent: bool,
    expectations: Vec<Expectation<RawResponse>>,
    _resp: PhantomData<fn() -> TResp>,
}

impl<'c, TResp> Call<'c, TResp> {
    pub fn new(step: &StepCtx, client: &'c Client) -> Call<'c, TResp> {
        Call {
            step: step.clone(),
            client,
            ctx: Context::background(),
            method: None,
            path: String::new(),
            headers: Vec::new(),
            path_params: IndexMap::new(),
            query_params: Vec::new(),
            body: None,
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

    fn route(&mut self, method: Method, path: &str) -> &mut Self {
        self.method = Some(method);
        self.path = path.to_string();
        self
    }

    pub fn get(&mut self, path: &str) -> &mut Self {
        self.route(Method::GET, path)
    }

    pub fn post(&mut self, path: &str) -> &mut Self {
        self.route(Method::POST, path)
    }

    pub fn put(&mut self, path: &str) -> &mut Self {
        self.route(Method::PUT, path)
    }

    pub fn patch(&mut self, path: &str) -> &mut Self {
        self.route(Method::PATCH, path)
    }

    pub fn delete(&mut self, path: &str) -> &mut Self {
        self.route(Method::DELETE, path)
    }

    pub fn header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Replaces `{key}` and `:key` in the path.
    pub fn path_param(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.path_params.insert(key.into(), value.to_string());
        self
    }

    pub fn query_param(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.query_params.push((key.into(), value.to_string()));
        self
    }

    /// JSON request body.
    pub fn body<B: Serialize + ?Sized>(&mut self, body: &B) -> &mut Self {
        match serde_json::to_vec(body) {
            Ok(bytes) => self.body = Some(Bytes::from(bytes)),
            Err(e) => {
                self.pending.get_or_insert(Error::Json(e));
            }
        }
        self
    }

    /// Untyped JSON body, handy for payloads with missing or extra fields.
    pub fn body_json(&mut self, body: Value) -> &mut Self {
        self.body = Some(Bytes::from(body.to_string()));
        self
    }

    fn push(&mut self, exp: Expectation<RawResponse>) -> &mut Self {
        if let Err(e) = add_expectation(&self.step, self.sent, &mut self.expectations, exp, DSL) {
            self.pending.get_or_insert(e);
        }
        self
    }

    pub fn expect_status(&mut self, code: u16) -> &mut Self {
        let reason = StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");
        let name = format!("Expect response status {code} {reason}")
            .trim_end()
            .to_string();
        let pre_check = build_response_pre_check();
        let exp = Expectation::with_report(
            name.clone(),
            move |err, resp: Option<&RawResponse>| {
                if let Err(res) = pre_check(err, resp) {
                    return res;
                }
                match resp {
                    Some(r) if r.status == code => CheckResult::ok(),
                    Some(r) => CheckResult::retry(format!("Expected status {code}, got {}", r.status)),
                    None => CheckResult::retry("Response is nil"),
                }
            },
            standard_report(name),
        );
        self.push(exp)
    }

    pub fn expect_header(&mut self, key: &str, value: &str) -> &mut Self {
        let name = format!("Expect header '{key}' == {value}");
        let (key, value) = (key.to_string(), value.to_string());
        let pre_check = build_response_pre_check();
        let exp = Expectation::with_report(
            name.clone(),
            move |err, resp: Option<&RawResponse>| {
                if let Err(res) = pre_check(err, resp) {
                    return res;
                }
                match resp.and_then(|r| r.header(&key)) {
                    Some(actual) if actual == value => CheckResult::ok(),
                    Some(actual) => CheckResult::retry(format!(
                        "Header '{key}': expected {value:?}, got {actual:?}"
                    )),
                    None => CheckResult::retry(format!("Header '{key}' is missing")),
                }
            },
            standard_report(name),
        );
        self.push(exp)
    }

    pub fn expect_body_not_empty(&mut self) -> &mut Self {
        let name = "Expect response body not empty";
        let pre_check = build_response_pre_check_with_body();
        let exp = Expectation::with_report(
            name,
            move |err, resp: Option<&RawResponse>| match pre_check(err, resp) {
                Ok(()) => CheckResult::ok(),
                Err(res) => res,
            },
            standard_report(name),
        );
        self.push(exp)
    }

    pub fn expect_field_equals<V: Serialize>(&mut self, path: &str, expected: V) -> &mut Self {
        self.push(json_source().field_equals(path, expected))
    }

    pub fn expect_field_not_empty(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_not_empty(path))
    }

    pub fn expect_field_empty(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_empty(path))
    }

    pub fn expect_field_is_null(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_is_null(path))
    }

    pub fn expect_field_is_not_null(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_is_not_null(path))
    }

    pub fn expect_field_is_null_or_missing(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_is_null_or_missing(path))
    }

    pub fn expect_field_true(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_true(path))
    }

    pub fn expect_field_false(&mut self, path: &str) -> &mut Self {
        self.push(json_source().field_false(path))
    }

    pub fn expect_array_contains<V: Serialize>(&mut self, path: &str, expected: V) -> &mut Self {
        self.push(json_source().array_contains(path, expected))
    }

    pub fn expect_array_contains_exact<V: Serialize>(&mut self, path: &str, expected: V) -> &mut Self {
        self.push(json_source().array_contains_exact(path, expected))
    }

    pub fn expect_body_equals<V: Serialize>(&mut self, expected: V) -> &mut Self {
        self.push(json_source().body_equals(expected))
    }

    pub fn expect_body_partial<V: Serialize>(&mut self, expected: V) -> &mut Self {
        self.push(json_source().body_partial(expected))
    }

    fn step_name(&self) -> String {
        let method = self.method.as_ref().map(Method::as_str).unwrap_or_default();
        format!("{method} {}", self.path)
    }

    fn validate(&self) -> Result<Method> {
        let Some(method) = self.method.clone() else {
            return Err(self.step.break_now(dsl_errors::not_set_with_hint(
                DSL,
                "HTTP method",
                "Use .get(), .post(), .put(), .patch(), or .delete().",
            )));
        };
        if self.path.trim().is_empty() {
            return Err(self.step.break_now(dsl_errors::not_set(DSL, "HTTP path")));
        }
        Ok(method)
    }

    fn resolved_path(&self) -> String {
        let mut path = self.path.clone();
        for (key, value) in &self.path_params {
            path = path
                .replace(&format!("{{{key}}}"), value)
                .replace(&format!(":{key}"), value);
        }
        path
    }

    fn prepare(&self, method: Method) -> Result<PreparedRequest> {
        let raw = format!(
            "{}{}",
            self.client.base_url.trim_end_matches('/'),
            self.resolved_path()
        );
        let mut url = Url::parse(&raw).map_err(|e| {
            self.step
                .break_now(dsl_errors::custom(DSL, &format!("invalid URL '{raw}': {e}")))
        })?;
        if !self.query_params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query_params);
        }

        let mut headers = HeaderMap::new();
        for (k, v) in self.client.headers.iter().chain(&self.headers) {
            let (Ok(name), Ok(value)) = (HeaderName::from_str(k), HeaderValue::from_str(v)) else {
                return Err(self
                    .step
                    .break_now(dsl_errors::custom(DSL, &format!("invalid header '{k}: {v}'"))));
            };
            headers.insert(name, value);
        }
        if self.body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body: self.body.clone().unwrap_or_default(),
        })
    }
}

impl<TResp: DeserializeOwned> Call<'_, TResp> {
    /// Execute the request, polling in async steps, and report every
    /// expectation on a nested step named after the call.
    pub async fn send(&mut self) -> Result<Response<TResp>> {
        if let Some(e) = self.pending.take() {
            return Err(e);
        }
        let method = self.validate()?;
        let req = self.prepare(method)?;
        self.sent = true;

        let this = &*self;
        let req = &req;
        self.step
            .with_new_step(self.step_name(), |step| async move {
                this.exchange(step, req).await
            })
            .await
    }

    async fn exchange(&self, step: StepCtx, req: &PreparedRequest) -> Result<Response<TResp>> {
        step.attach_json(
            REQUEST_ATTACHMENT,
            &RequestLog {
                method: req.method.as_str(),
                url: req.url.as_str(),
                headers: header_log(&req.headers),
                body: (!req.body.is_empty()).then(|| body_log(&req.body)),
            },
        )?;

        let client = self.client;
        let executor: Executor<'_, RawResponse> = Box::new(move |ctx: Context| {
            async move {
                tokio::select! {
                    raw = client.execute(req) => Outcome::ok(raw),
                    _ = ctx.done() => {
                        let err = ctx.err().unwrap_or(Error::Cancelled);
                        Outcome::new(Some(RawResponse::failed(err.to_string(), Duration::ZERO)), Some(err))
                    }
                }
            }
            .boxed()
        });

        let cfg = DslConfig::new(
            self.ctx.clone(),
            step.clone(),
            client.async_config,
            executor,
        )
        .expectations(&self.expectations)
        .post_process(post_process_network_error::<RawResponse>);
        let exec = execute_dsl(cfg).await?;

        let raw = exec.value.unwrap_or_default();
        attach_if_async(&step, &exec.summary)?;
        step.attach_json(
            RESPONSE_ATTACHMENT,
            &ResponseLog {
                status: raw.status,
                headers: header_log(&raw.headers),
                body: body_log(&raw.raw_body),
                duration: format!("{:?}", raw.duration),
                network_error: raw.network_error.as_deref(),
            },
        )?;

        assert_expectations(
            &step,
            &self.expectations,
            exec.error.as_ref(),
            Some(&raw),
            |step, mode, err| {
                let a = pick_asserter(step, mode);
                if err.is_some() {
                    return a.no_error(err, "HTTP request failed");
                }
                if let Some(network_error) = &raw.network_error {
                    return a.equal("", network_error.as_str(), "HTTP network error");
                }
                Ok(())
            },
        )?;

        Ok(Response::decode(raw))
    }
}
