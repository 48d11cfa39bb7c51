//! # Kafka DSL
//!
//! Kafka checks read from a [`MessageBuffer`] that a background consumer
//! keeps filled. A [`Query`] searches one topic for the newest message
//! matching its filters and checks its JSON payload.
//!
//! ```rust,ignore
//! let order: Order = kafka::Query::new(&step, &buffer, "orders.events")
//!     .filter("orderId", 42)
//!     .filter("type", "ORDER_PAID")
//!     .expect_field_equals("amount", 100)
//!     .send()
//!     .await?
//!     .message()?;
//! ```
use futures::FutureExt;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tracing::warn;

use crate::{
    check::CheckResult,
    config::AsyncConfig,
    context::Context,
    dsl::{execute_dsl, DslConfig},
    dsl_errors,
    expect::{add_expectation, assert_expectations, BytesJsonSource, Expectation},
    jsonutil,
    mode::{assertion_mode_for, get_step_mode, pick_asserter, StepMode},
    polling::{attach_if_async, final_failure_message},
    retry::{Executor, Outcome},
    step::StepCtx,
    Error, Result,
};

const DSL: &str = "Kafka";

pub const DEFAULT_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KafkaMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip)]
    pub value: Vec<u8>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
}

impl KafkaMessage {
    pub fn new(topic: &str, value: impl Into<Vec<u8>>) -> KafkaMessage {
        KafkaMessage {
            topic: topic.to_string(),
            value: value.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.value).ok()
    }
}

/// Bounded per-topic buffer of consumed messages. Only configured topics are
/// kept, the oldest message is evicted once a topic is full.
#[derive(Debug)]
pub struct MessageBuffer {
    topics: IndexMap<String, Mutex<VecDeque<KafkaMessage>>>,
    capacity: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MessageBuffer {
    pub fn new<I, S>(topics: I) -> MessageBuffer
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MessageBuffer::with_capacity(topics, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity<I, S>(topics: I, capacity: usize) -> MessageBuffer
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capacity = if capacity == 0 { DEFAULT_BUFFER_SIZE } else { capacity };
        MessageBuffer {
            topics: topics
                .into_iter()
                .map(|t| (t.into(), Mutex::new(VecDeque::new())))
                .collect(),
            capacity,
        }
    }

    pub fn is_topic_configured(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn configured_topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Store a message. Returns `false` when its topic is not configured.
    pub fn push(&self, msg: KafkaMessage) -> bool {
        let Some(queue) = self.topics.get(&msg.topic) else {
            warn!(topic = %msg.topic, "dropping message for unconfigured topic");
            return false;
        };
        let mut queue = lock(queue);
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(msg);
        true
    }

    /// Messages of a topic, oldest first.
    pub fn messages(&self, topic: &str) -> Vec<KafkaMessage> {
        self.topics
            .get(topic)
            .map(|q| lock(q).iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, topic: &str) {
        if let Some(q) = self.topics.get(topic) {
            lock(q).clear();
        }
    }

    pub fn clear_all(&self) {
        for q in self.topics.values() {
            lock(q).clear();
        }
    }
}

/// String form of a filter value. Strings are used verbatim.
fn filter_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
struct Filters {
    equals: IndexMap<String, String>,
    contains: IndexMap<String, String>,
}

impl Filters {
    fn is_empty(&self) -> bool {
        self.equals.is_empty() && self.contains.is_empty()
    }

    fn matches(&self, payload: &[u8]) -> bool {
        if self.is_empty() {
            return true;
        }
        let Ok(json) = serde_json::from_slice::<Value>(payload) else {
            return false;
        };
        let equals = self.equals.iter().all(|(path, expected)| {
            match jsonutil::get_field(&json, path) {
                Some(Value::Array(items)) => same_set(&items, expected),
                Some(actual) => filter_string(&actual) == *expected,
                None => false,
            }
        });
        let contains = self.contains.iter().all(|(path, expected)| {
            match jsonutil::get_field(&json, path) {
                Some(Value::Array(items)) => items.iter().any(|i| filter_string(i) == *expected),
                _ => false,
            }
        });
        equals && contains
    }
}

impl std::fmt::Display for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let equals = self.equals.iter().map(|(k, v)| format!("{k}={v}"));
        let contains = self.contains.iter().map(|(k, v)| format!("{k}~{v}"));
        write!(f, "[{}]", equals.chain(contains).join(", "))
    }
}

/// An array filter matches when both sides hold the same elements.
fn same_set(items: &[Value], expected: &str) -> bool {
    let Ok(Value::Array(wanted)) = serde_json::from_str::<Value>(expected) else {
        return false;
    };
    let mut actual: Vec<String> = items.iter().map(filter_string).collect();
    let mut wanted: Vec<String> = wanted.iter().map(filter_string).collect();
    actual.sort();
    wanted.sort();
    actual == wanted
}

/// Outcome of one pass over the buffer.
#[derive(Debug, Clone, Default)]
struct Search {
    /// Newest match.
    message: Option<KafkaMessage>,
    /// Every match, newest first.
    matches: Vec<KafkaMessage>,
}

impl Search {
    fn run(buffer: &MessageBuffer, topic: &str, filters: &Filters) -> Result<Search> {
        if !buffer.is_topic_configured(topic) {
            return Err(Error::NotFound(format!(
                "Topic '{topic}' is not configured to be listened to. Configured topics: {:?}",
                buffer.configured_topics()
            )));
        }
        let matches: Vec<KafkaMessage> = buffer
            .messages(topic)
            .into_iter()
            .rev()
            .filter(|m| filters.matches(&m.value))
            .collect();
        Ok(Search {
            message: matches.first().cloned(),
            matches,
        })
    }

    /// Matches within `window` of the newest one, the newest included.
    fn duplicates_within(&self, window: Duration) -> usize {
        let Some(first) = &self.message else {
            return 0;
        };
        let window = window.as_millis() as i64;
        self.matches
            .iter()
            .filter(|m| (m.timestamp - first.timestamp).abs() <= window)
            .count()
    }
}

/// What [`Query::send`] found.
#[derive(Debug, Clone, Default)]
pub struct ConsumeResult {
    pub found: bool,
    pub raw: Vec<u8>,
    pub record: Option<KafkaMessage>,
    /// Every matching payload, newest first.
    pub all: Vec<Vec<u8>>,
}

impl ConsumeResult {
    pub fn match_count(&self) -> usize {
        self.all.len()
    }

    /// Deserialize the found payload.
    pub fn message<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.found {
            return Err(Error::NotFound("Kafka message not found".to_string()));
        }
        serde_json::from_slice(&self.raw).map_err(|e| {
            Error::Unexpected(eyre::eyre!(
                "failed to parse message to {}: {e}",
                std::any::type_name::<T>()
            ))
        })
    }
}

#[derive(Serialize)]
struct SearchLog<'a> {
    topic: &'a str,
    filters: &'a IndexMap<String, String>,
    contains: &'a IndexMap<String, String>,
    timeout: String,
    unique: bool,
}

pub struct Query<'b> {
    step: StepCtx,
    ctx: Context,
    buffer: &'b MessageBuffer,
    topic: String,
    async_config: AsyncConfig,
    filters: Filters,
    expected_count: usize,
    unique_window: Option<Duration>,
    json: BytesJsonSource,
    pending: Option<Error>,
    sent: bool,
    expectations: Vec<Expectation<Vec<u8>>>,
}

impl<'b> Query<'b> {
    pub fn new(step: &StepCtx, buffer: &'b MessageBuffer, topic: &str) -> Query<'b> {
        Query {
            step: step.clone(),
            ctx: Context::background(),
            buffer,
            topic: topic.to_string(),
            async_config: AsyncConfig::default(),
            filters: Filters::default(),
            expected_count: 0,
            unique_window: None,
            json: BytesJsonSource::new(),
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

    fn encode_filter<V: Serialize>(&mut self, path: &str, value: V) -> Option<String> {
        match serde_json::to_value(value) {
            Ok(Value::Null) => None,
            Ok(v) => Some(filter_string(&v)),
            Err(e) => {
                let e = self.step.break_now(dsl_errors::custom(
                    DSL,
                    &format!("cannot encode filter '{path}': {e}"),
                ));
                self.pending.get_or_insert(e);
                None
            }
        }
    }

    /// Keep messages whose field at `path` renders as `value`. Arrays compare
    /// as sets. A null value adds no filter.
    pub fn filter<V: Serialize>(&mut self, path: &str, value: V) -> &mut Self {
        if let Some(v) = self.encode_filter(path, value) {
            self.filters.equals.insert(path.to_string(), v);
        }
        self
    }

    /// Keep messages whose array at `path` holds `value`.
    pub fn filter_contains<V: Serialize>(&mut self, path: &str, value: V) -> &mut Self {
        if let Some(v) = self.encode_filter(path, value) {
            self.filters.contains.insert(path.to_string(), v);
        }
        self
    }

    /// Exactly `count` messages must match.
    pub fn expect_count(&mut self, count: usize) -> &mut Self {
        self.expected_count = count;
        self
    }

    /// No other match may arrive within `window` of the found message.
    pub fn unique_within(&mut self, window: Duration) -> &mut Self {
        self.unique_window = Some(window);
        self
    }

    fn push(&mut self, exp: Expectation<Vec<u8>>) -> &mut Self {
        if let Err(e) = add_expectation(&self.step, self.sent, &mut self.expectations, exp, DSL) {
            self.pending.get_or_insert(e);
        }
        self
    }

    pub fn expect_field_equals<V: Serialize>(&mut self, path: &str, expected: V) -> &mut Self {
        let exp = self.json.field_equals(path, expected);
        self.push(exp)
    }

    pub fn expect_field_not_empty(&mut self, path: &str) -> &mut Self {
        let exp = self.json.field_not_empty(path);
        self.push(exp)
    }

    pub fn expect_field_empty(&mut self, path: &str) -> &mut Self {
        let exp = self.json.field_empty(path);
        self.push(exp)
    }

    pub fn expect_field_is_null(&mut self, path: &str) -> &mut Self {
        let exp = self.json.field_is_null(path);
        self.push(exp)
    }

    pub fn expect_field_is_not_null(&mut self, path: &str) -> &mut Self {
        let exp = self.json.field_is_not_null(path);
        self.push(exp)
    }

    pub fn expect_field_true(&mut self, path: &str) -> &mut Self {
        let exp = self.json.field_true(path);
        self.push(exp)
    }

    pub fn expect_field_false(&mut self, path: &str) -> &mut Self {
        let exp = self.json.field_false(path);
        self.push(exp)
    }

    /// One equality expectation per key of `expected`, under `path`.
    pub fn expect_field_json(&mut self, path: &str, expected: IndexMap<String, Value>) -> &mut Self {
        for exp in self.json.field_json(path, expected) {
            self.push(exp);
        }
        self
    }

    pub fn expect_message<V: Serialize>(&mut self, expected: V) -> &mut Self {
        let exp = self.json.body_equals(expected);
        self.push(exp)
    }

    pub fn expect_message_partial<V: Serialize>(&mut self, expected: V) -> &mut Self {
        let exp = self.json.body_partial(expected);
        self.push(exp)
    }

    fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(self.step.break_now(dsl_errors::not_set_with_hint(
                DSL,
                "Topic name",
                "Use Query::new(step, buffer, \"topic\").",
            )));
        }
        Ok(())
    }

    fn not_found_message(&self) -> String {
        format!(
            "Kafka message in topic '{}' not found within {}. Filters: {}",
            self.topic,
            humantime::format_duration(self.async_config.timeout),
            self.filters
        )
    }

    /// Search the buffer, polling in async steps until a matching message
    /// satisfies the expectations.
    pub async fn send(&mut self) -> Result<ConsumeResult> {
        if let Some(e) = self.pending.take() {
            return Err(e);
        }
        self.validate()?;
        self.sent = true;

        let name = format!("Kafka: Consume from '{}'", self.topic);
        let this = &*self;
        self.step
            .with_new_step(name, |step| async move { this.consume(step).await })
            .await
    }

    /// Retry until a message is found and, with `expect_count`, until the
    /// number of matches is exact. Then defer to the expectations.
    fn check(&self, search: Option<&Search>, err: Option<&Error>) -> Vec<CheckResult> {
        if let Some(e) = err {
            return vec![CheckResult::fatal(e.to_string())];
        }
        let Some(msg) = search.and_then(|s| s.message.as_ref()) else {
            return vec![CheckResult::retry(format!(
                "Message not found in topic '{}'. Filters: {}",
                self.topic, self.filters
            ))];
        };
        let mut results = Vec::with_capacity(self.expectations.len() + 1);
        let found = search.map(|s| s.matches.len()).unwrap_or_default();
        if self.expected_count > 0 && found != self.expected_count {
            results.push(CheckResult::retry(format!(
                "Expected {} messages, found {found}",
                self.expected_count
            )));
        }
        results.extend(self.expectations.iter().map(|e| (e.check)(None, Some(&msg.value))));
        results
    }

    async fn consume(&self, step: StepCtx) -> Result<ConsumeResult> {
        step.attach_json(
            "Kafka Search Info",
            &SearchLog {
                topic: &self.topic,
                filters: &self.filters.equals,
                contains: &self.filters.contains,
                timeout: humantime::format_duration(self.async_config.timeout).to_string(),
                unique: self.unique_window.is_some(),
            },
        )?;

        let (buffer, topic, filters) = (self.buffer, self.topic.as_str(), &self.filters);
        let executor: Executor<'_, Search> = Box::new(move |_ctx: Context| {
            async move { Outcome::from(Search::run(buffer, topic, filters)) }.boxed()
        });
        let cfg: DslConfig<'_, Search> =
            DslConfig::new(self.ctx.clone(), step.clone(), self.async_config, executor)
                .checker(|search, err| self.check(search, err))
                .nil_result_factory(|_| Search::default());
        let exec = execute_dsl(cfg).await?;
        attach_if_async(&step, &exec.summary)?;

        let mode = get_step_mode(&step);
        let a = pick_asserter(&step, assertion_mode_for(mode));
        if let Some(e) = &exec.error {
            if !e.is_context_error() {
                a.no_error(Some(e), "Kafka search failed")?;
                return Ok(ConsumeResult::default());
            }
        }

        let search = exec.value.unwrap_or_default();
        let Some(found) = search.message.clone() else {
            step.attach_json(
                "Kafka Message Not Found",
                &serde_json::json!({
                    "topic": self.topic,
                    "filters": self.filters.equals,
                    "status": "NOT_FOUND",
                }),
            )?;
            let msg = match mode {
                StepMode::Async => final_failure_message(&exec.summary),
                _ => self.not_found_message(),
            };
            a.fail(msg)?;
            return Ok(ConsumeResult::default());
        };

        match found.json() {
            Some(json) => step.attach_json("Kafka Message Found", &json)?,
            None => step.attach_text(
                "Kafka Message Found",
                String::from_utf8_lossy(&found.value).into_owned(),
            ),
        }
        if self.expected_count > 0 {
            let all: Vec<Value> = search.matches.iter().filter_map(KafkaMessage::json).collect();
            step.attach_json(format!("Kafka Messages Found ({})", search.matches.len()), &all)?;
            if search.matches.len() != self.expected_count {
                a.fail(format!(
                    "Expected {} Kafka messages, but found {}. Topic: {}, Filters: {}",
                    self.expected_count,
                    search.matches.len(),
                    self.topic,
                    self.filters
                ))?;
            }
        }
        if let Some(window) = self.unique_window {
            let count = search.duplicates_within(window);
            if count > 1 {
                a.fail(format!(
                    "Kafka message expected once but found {count} within {}ms window. Filters: {}",
                    window.as_millis(),
                    self.filters
                ))?;
            }
        }

        assert_expectations(
            &step,
            &self.expectations,
            None,
            Some(&found.value),
            |_, _, _| Ok(()),
        )?;

        Ok(ConsumeResult {
            found: true,
            raw: found.value.clone(),
            all: search.matches.iter().map(|m| m.value.clone()).collect(),
            record: Some(found),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::BackoffConfig, step::Status};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;
    use test_case::test_case;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct OrderEvent {
        order_id: u64,
        status: String,
    }

    fn event(topic: &str, payload: Value) -> KafkaMessage {
        KafkaMessage::new(topic, payload.to_string())
    }

    fn fast_async() -> AsyncConfig {
        AsyncConfig {
            enabled: true,
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(10),
            backoff: BackoffConfig {
                enabled: false,
                ..Default::default()
            },
            jitter: 0.0,
        }
    }

    #[test]
    fn buffer_keeps_configured_topics_only() {
        let buffer = MessageBuffer::with_capacity(["orders"], 2);
        assert!(!buffer.push(event("payments", json!({}))));
        for id in 1..=3 {
            assert!(buffer.push(event("orders", json!({ "id": id }))));
        }

        let ids: Vec<Value> = buffer
            .messages("orders")
            .iter()
            .filter_map(|m| m.json().map(|j| j["id"].clone()))
            .collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
        assert_eq!(buffer.configured_topics(), vec!["orders".to_string()]);

        buffer.clear("orders");
        assert!(buffer.messages("orders").is_empty());
    }

    #[test_case(json!({"orderId": 42}), "orderId", "42", true; "number renders as string")]
    #[test_case(json!({"status": "PAID"}), "status", "PAID", true; "string verbatim")]
    #[test_case(json!({"status": "NEW"}), "status", "PAID", false; "mismatch")]
    #[test_case(json!({"tags": ["b", "a"]}), "tags", r#"["a","b"]"#, true; "array as set")]
    #[test_case(json!({"order": {"id": 7}}), "order.id", "7", true; "nested path")]
    #[test_case(json!({"other": 1}), "orderId", "42", false; "missing path")]
    fn filter_matching(payload: Value, path: &str, expected: &str, matches: bool) {
        let filters = Filters {
            equals: IndexMap::from([(path.to_string(), expected.to_string())]),
            contains: IndexMap::new(),
        };
        assert_eq!(filters.matches(payload.to_string().as_bytes()), matches);
    }

    #[tokio::test]
    async fn newest_matching_message_wins() -> eyre::Result<()> {
        let buffer = MessageBuffer::new(["orders"]);
        buffer.push(event("orders", json!({"orderId": 1, "status": "NEW"})));
        buffer.push(event("orders", json!({"orderId": 2, "status": "NEW"})));
        buffer.push(event("orders", json!({"orderId": 1, "status": "PAID"})));

        let step = StepCtx::new("kafka-sync");
        let result = Query::new(&step, &buffer, "orders")
            .filter("orderId", 1)
            .expect_field_equals("status", "PAID")
            .expect_field_not_empty("status")
            .send()
            .await?;

        assert!(result.found);
        assert_eq!(result.match_count(), 2);
        let order: OrderEvent = result.message()?;
        assert_eq!(
            order,
            OrderEvent {
                order_id: 1,
                status: "PAID".into()
            }
        );
        let consume = &step.snapshot().children[0];
        assert_eq!(consume.name, "Kafka: Consume from 'orders'");
        assert_eq!(consume.status, Status::Passed);
        assert!(consume.attachment("Kafka Message Found").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn not_found_in_sync_mode() {
        let buffer = MessageBuffer::new(["orders"]);
        buffer.push(event("orders", json!({"orderId": 1})));

        let step = StepCtx::new("kafka-not-found");
        let res = Query::new(&step, &buffer, "orders")
            .filter("orderId", 99)
            .send()
            .await;

        assert!(matches!(res, Err(Error::AssertionFailed(_))));
        let consume = &step.snapshot().children[0];
        assert!(consume.attachment("Kafka Message Not Found").is_some());
        assert_eq!(
            consume.checks[0].message,
            "Kafka message in topic 'orders' not found within 10s. Filters: [orderId=99]"
        );
    }

    #[tokio::test]
    async fn async_query_waits_for_message() -> eyre::Result<()> {
        let buffer = Arc::new(MessageBuffer::new(["orders"]));
        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                buffer.push(event("orders", json!({"orderId": 5, "status": "PAID"})));
            })
        };

        let step = StepCtx::new("kafka-async").async_mode();
        let result = Query::new(&step, &buffer, "orders")
            .async_config(fast_async())
            .filter("orderId", 5)
            .expect_field_equals("status", "PAID")
            .send()
            .await?;
        producer.await?;

        assert!(result.found);
        let consume = &step.snapshot().children[0];
        assert_eq!(consume.status, Status::Passed);
        assert!(consume
            .attachment(crate::polling::POLLING_SUMMARY_ATTACHMENT)
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unconfigured_topic_fails_search() {
        let buffer = MessageBuffer::new(["orders"]);
        let step = StepCtx::new("kafka-unconfigured");
        let res = Query::new(&step, &buffer, "payments").send().await;

        assert!(res.is_err());
        assert_eq!(
            step.snapshot().children[0].checks[0].message,
            "Kafka search failed: Topic 'payments' is not configured to be listened to. Configured topics: [\"orders\"]"
        );
    }

    #[tokio::test]
    async fn surplus_matches_keep_polling_then_fail() -> eyre::Result<()> {
        let buffer = MessageBuffer::new(["orders"]);
        for _ in 0..3 {
            buffer.push(event("orders", json!({"orderId": 8, "status": "PAID"})));
        }

        let step = StepCtx::new("kafka-surplus").async_mode();
        let result = Query::new(&step, &buffer, "orders")
            .async_config(AsyncConfig {
                timeout: Duration::from_millis(100),
                ..fast_async()
            })
            .filter("orderId", 8)
            .expect_count(2)
            .send()
            .await?;

        assert!(result.found);
        assert_eq!(result.all.len(), 3);
        let consume = &step.snapshot().children[0];
        assert_eq!(consume.status, Status::Failed);
        let failed: Vec<&str> = consume.failed_checks().map(|c| c.message.as_str()).collect();
        assert_eq!(
            failed,
            vec!["Expected 2 Kafka messages, but found 3. Topic: orders, Filters: [orderId=8]"]
        );

        let summary: crate::polling::PollingSummary = serde_json::from_str(
            &consume
                .attachment(crate::polling::POLLING_SUMMARY_ATTACHMENT)
                .ok_or_else(|| eyre::eyre!("missing polling summary"))?
                .body,
        )?;
        assert!(!summary.success);
        assert!(summary.attempts > 1, "{summary:?}");
        assert_eq!(summary.failed_checks, vec!["Expected 2 messages, found 3".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn count_and_uniqueness() {
        let buffer = MessageBuffer::new(["orders"]);
        buffer.push(event("orders", json!({"orderId": 3, "status": "PAID"})));
        buffer.push(event("orders", json!({"orderId": 3, "status": "PAID"})));

        let step = StepCtx::new("kafka-unique").cleanup_mode();
        let result = Query::new(&step, &buffer, "orders")
            .filter("orderId", 3)
            .expect_count(2)
            .unique_within(Duration::from_secs(60))
            .send()
            .await;

        assert!(result.is_ok());
        let consume = &step.snapshot().children[0];
        let failed: Vec<&str> = consume.failed_checks().map(|c| c.message.as_str()).collect();
        assert_eq!(
            failed,
            vec!["Kafka message expected once but found 2 within 60000ms window. Filters: [orderId=3]"]
        );
    }
}
