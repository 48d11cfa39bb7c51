//! # Step report context
//!
//! A [`StepCtx`] is a handle on one node of the hierarchical step tree that
//! ends up in the test report. Every DSL call opens a child step, records its
//! assertions, logs and attachments on it, and closes it when done.
//!
//! ```text
//! root (Sync)
//! ├── GET /orders/42        ✓ [Expect HTTP status 200] actual: 200
//! └── wait for projection (Async)
//!     └── SELECT orders     ✘ Expectations not met after 12 attempts (2.4s)
//! ```
//!
//! Nodes publish [`Event`]s as they change so reporters can render them live,
//! and [`StepCtx::snapshot`] gives the immutable [`StepRecord`] tree.

use pretty_assertions::Comparison;
use serde::Serialize;
use std::{
    fmt::Debug,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tracing::*;

use crate::{
    event::{self, Event},
    mode::{AssertionMode, StepMode},
    Error, Result,
};

pub type StepId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display)]
pub enum Status {
    #[default]
    Passed,
    Failed,
    Broken,
}

/// One recorded assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub passed: bool,
    /// Recorded through a Require asserter.
    pub fatal: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub body: String,
}

/// Immutable view of a step and its children.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub id: StepId,
    pub name: String,
    pub mode: Option<StepMode>,
    pub status: Status,
    pub checks: Vec<Check>,
    pub logs: Vec<String>,
    pub attachments: Vec<Attachment>,
    pub children: Vec<StepRecord>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Option<Duration>,
}

impl StepRecord {
    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

#[derive(Debug)]
struct StepNode {
    id: StepId,
    parent: Option<StepId>,
    name: String,
    mode: Option<StepMode>,
    status: Status,
    checks: Vec<Check>,
    logs: Vec<String>,
    attachments: Vec<Attachment>,
    children: Vec<Arc<Mutex<StepNode>>>,
    started: Instant,
    elapsed: Option<Duration>,
}

impl StepNode {
    fn record(&self) -> StepRecord {
        StepRecord {
            id: self.id,
            name: self.name.clone(),
            mode: self.mode,
            status: self.status,
            checks: self.checks.clone(),
            logs: self.logs.clone(),
            attachments: self.attachments.clone(),
            children: self.children.iter().map(|c| lock(c).record()).collect(),
            elapsed: self.elapsed,
        }
    }
}

fn lock(node: &Arc<Mutex<StepNode>>) -> MutexGuard<'_, StepNode> {
    node.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit(msg: Event) {
    if let Err(e) = event::publish(msg) {
        warn!("dropped report event: {e:#}");
    }
}

/// Cloneable handle on one step of the report tree.
#[derive(Debug, Clone)]
pub struct StepCtx {
    node: Arc<Mutex<StepNode>>,
    parent: Option<Arc<Mutex<StepNode>>>,
    mode: Option<StepMode>,
}

impl StepCtx {
    /// Open a root step.
    pub fn new(name: impl Into<String>) -> StepCtx {
        StepCtx::open(name.into(), None, None)
    }

    fn open(name: String, parent: Option<Arc<Mutex<StepNode>>>, mode: Option<StepMode>) -> StepCtx {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let parent_id = parent.as_ref().map(|p| lock(p).id);
        let node = Arc::new(Mutex::new(StepNode {
            id,
            parent: parent_id,
            name: name.clone(),
            mode,
            status: Status::Passed,
            checks: Vec::new(),
            logs: Vec::new(),
            attachments: Vec::new(),
            children: Vec::new(),
            started: Instant::now(),
            elapsed: None,
        }));
        if let Some(p) = &parent {
            lock(p).children.push(node.clone());
        }
        emit(Event::StepStart {
            id,
            parent: parent_id,
            name,
            mode,
        });
        StepCtx { node, parent, mode }
    }

    pub fn id(&self) -> StepId {
        lock(&self.node).id
    }

    pub fn name(&self) -> String {
        lock(&self.node).name.clone()
    }

    pub fn mode(&self) -> Option<StepMode> {
        self.mode
    }

    pub fn status(&self) -> Status {
        lock(&self.node).status
    }

    /// Same step, advertising `mode` to this handle and every step nested under it.
    pub fn with_mode(&self, mode: StepMode) -> StepCtx {
        lock(&self.node).mode = Some(mode);
        StepCtx {
            mode: Some(mode),
            ..self.clone()
        }
    }

    pub fn async_mode(&self) -> StepCtx {
        self.with_mode(StepMode::Async)
    }

    pub fn cleanup_mode(&self) -> StepCtx {
        self.with_mode(StepMode::Cleanup)
    }

    /// Run `f` inside a nested step that inherits this step's mode.
    pub async fn with_new_step<F, Fut, R>(&self, name: impl Into<String>, f: F) -> Result<R>
    where
        F: FnOnce(StepCtx) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.nested(name.into(), self.mode, f).await
    }

    pub async fn with_async_step<F, Fut, R>(&self, name: impl Into<String>, f: F) -> Result<R>
    where
        F: FnOnce(StepCtx) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.nested(name.into(), Some(StepMode::Async), f).await
    }

    pub async fn with_cleanup_step<F, Fut, R>(&self, name: impl Into<String>, f: F) -> Result<R>
    where
        F: FnOnce(StepCtx) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.nested(name.into(), Some(StepMode::Cleanup), f).await
    }

    async fn nested<F, Fut, R>(&self, name: String, mode: Option<StepMode>, f: F) -> Result<R>
    where
        F: FnOnce(StepCtx) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let child = StepCtx::open(name, Some(self.node.clone()), mode);
        let res = f(child.clone()).await;
        child.end(res.as_ref().err());
        res
    }

    /// Close the step. An error other than [`Error::Broken`] fails it.
    pub fn end(&self, err: Option<&Error>) {
        let (id, parent, status, record) = {
            let mut node = lock(&self.node);
            match err {
                Some(Error::Broken(_)) => node.status = Status::Broken,
                Some(_) => node.status = node.status.max(Status::Failed),
                None => {}
            }
            node.elapsed = Some(node.started.elapsed());
            (node.id, node.parent, node.status, node.record())
        };

        if status != Status::Passed {
            if let Some(p) = &self.parent {
                let mut parent = lock(p);
                parent.status = parent.status.max(Status::Failed);
            }
        }

        emit(Event::StepEnd {
            id,
            parent,
            record: Box::new(record),
        });
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        let id = {
            let mut node = lock(&self.node);
            node.logs.push(message.clone());
            node.id
        };
        emit(Event::Log { id, message });
    }

    pub fn attach(&self, attachment: Attachment) {
        let id = {
            let mut node = lock(&self.node);
            node.attachments.push(attachment.clone());
            node.id
        };
        emit(Event::Attachment { id, attachment });
    }

    /// Attach `value` rendered as pretty JSON.
    pub fn attach_json<T: Serialize + ?Sized>(&self, name: impl Into<String>, value: &T) -> Result<()> {
        let body = serde_json::to_string_pretty(value)?;
        self.attach(Attachment {
            name: name.into(),
            content_type: "application/json".to_string(),
            body,
        });
        Ok(())
    }

    pub fn attach_text(&self, name: impl Into<String>, body: impl Into<String>) {
        self.attach(Attachment {
            name: name.into(),
            content_type: "text/plain".to_string(),
            body: body.into(),
        });
    }

    /// Assertions that abort the step on failure.
    pub fn require(&self) -> Asserts {
        Asserts {
            step: self.clone(),
            mode: AssertionMode::Require,
        }
    }

    /// Assertions that record the failure and let the step continue.
    pub fn assert(&self) -> Asserts {
        Asserts {
            step: self.clone(),
            mode: AssertionMode::Assert,
        }
    }

    /// Mark the step broken. Return the error to stop the step.
    pub fn break_now(&self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        error!("step broken: {reason}");
        self.record_check(Check {
            passed: false,
            fatal: true,
            message: reason.clone(),
        });
        lock(&self.node).status = Status::Broken;
        Error::Broken(reason)
    }

    pub fn snapshot(&self) -> StepRecord {
        lock(&self.node).record()
    }

    fn record_check(&self, check: Check) {
        let id = {
            let mut node = lock(&self.node);
            if !check.passed {
                node.status = node.status.max(Status::Failed);
            }
            node.checks.push(check.clone());
            node.id
        };
        emit(Event::Check { id, check });
    }
}

/// Assertion handle bound to one step and one severity.
#[derive(Debug, Clone)]
pub struct Asserts {
    step: StepCtx,
    mode: AssertionMode,
}

impl Asserts {
    pub fn mode(&self) -> AssertionMode {
        self.mode
    }

    fn record(&self, passed: bool, message: String) -> Result<()> {
        let fatal = self.mode == AssertionMode::Require;
        self.step.record_check(Check {
            passed,
            fatal,
            message: message.clone(),
        });
        if !passed && fatal {
            return Err(Error::AssertionFailed(message));
        }
        Ok(())
    }

    pub fn is_true(&self, cond: bool, message: impl Into<String>) -> Result<()> {
        self.record(cond, message.into())
    }

    pub fn no_error(&self, err: Option<&Error>, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        match err {
            None => self.record(true, message),
            Some(e) => self.record(false, format!("{message}: {e}")),
        }
    }

    pub fn equal<T: PartialEq + Debug>(&self, expected: T, actual: T, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        if expected == actual {
            self.record(true, message)
        } else {
            let diff = Comparison::new(&expected, &actual);
            self.record(false, format!("{message}\n{diff}"))
        }
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.record(false, message.into())
    }
}
