//! # Expecto Core
//!
//! Core functionality for the expecto integration-test DSL.
//!
//! A test is a tree of steps. Each transport call (HTTP, gRPC, SQL, Redis,
//! Kafka) opens a nested step, runs once or polls until its expectations
//! hold, and reports one check per expectation.
//!
//! ## Architecture (block diagram)
//!
//! ```text
//! +---------------------+      +---------------------+      +---------------------+
//! | DSL builders        | ---> | dsl shell           | ---> | retry engine        |
//! | http/grpc/sql/...   |      | mode + nil guard    |      | backoff + jitter    |
//! +---------------------+      +---------------------+      +---------------------+
//!            |                         |                             |
//!            v                         v                             v
//! +---------------------+      +---------------------+      +---------------------+
//! | expectation library | ---> | step tree (StepCtx) | ---> | reporter (output)   |
//! | pre-checks/builders |      | checks, attachments |      | event channel       |
//! +---------------------+      +---------------------+      +---------------------+
//!            ^                         ^
//!            |                         |
//! +---------------------+      +---------------------+
//! | config              |      | context             |
//! | expecto.toml + env  |      | deadline + cancel   |
//! +---------------------+      +---------------------+
//! ```
//!
//! Most users should use the main `expecto` crate rather than importing
//! `expecto-core` directly.

pub mod check;
pub mod config;
pub mod context;
pub mod dsl;
pub mod dsl_errors;
pub mod error;
pub mod event;
pub mod expect;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod http;
pub mod jsonutil;
pub mod kafka;
pub mod mode;
pub mod polling;
pub mod redis;
pub mod reporter;
pub mod retry;
pub mod sql;
pub mod step;
pub mod typeconv;

// Re-export error handling crates
pub use anyhow;
pub use eyre;

pub use check::CheckResult;
pub use config::{get_config, AsyncConfig, BackoffConfig, ClientConfig, Config};
pub use context::Context;
pub use error::{Error, Result};
pub use expect::Expectation;
pub use mode::{AssertionMode, StepMode};
pub use polling::PollingSummary;
pub use reporter::{ListReporter, NullReporter, Reporter};
pub use step::{Status, StepCtx, StepRecord};
pub use typeconv::SqlValue;
