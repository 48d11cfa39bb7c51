//! # expecto
//!
//! Expectation-polling DSL for integration tests.
//!
//! Every transport call is a builder: describe the call, attach
//! expectations, then `send()`. In a sync step the first failed expectation
//! aborts the step; in an async step the call is repeated with backoff until
//! all expectations hold or the timeout expires.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use expecto::{http, StepCtx};
//!
//! #[tokio::test]
//! async fn order_gets_paid() -> eyre::Result<()> {
//!     expecto::init()?;
//!     let client = http::Client::new("http://localhost:8080");
//!     let step = StepCtx::new("order gets paid").async_mode();
//!
//!     client
//!         .call::<serde_json::Value>(&step)
//!         .get("/orders/{id}")
//!         .path_param("id", 42)
//!         .expect_status(200)
//!         .expect_field_equals("status", "PAID")
//!         .send()
//!         .await?;
//!     Ok(())
//! }
//! ```
use eyre::WrapErr;
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Re-export error handling crates for user convenience
pub use anyhow;
pub use eyre;
pub use pretty_assertions;

// Re-export core functionality
#[cfg(feature = "grpc")]
pub use expecto_core::grpc;
pub use expecto_core::{
    check::CheckResult,
    config::{get_config, AsyncConfig, BackoffConfig, ClientConfig, Config},
    context::Context,
    dsl, dsl_errors, event, expect, http, jsonutil, kafka, mode, polling, redis,
    reporter::{ListReporter, NullReporter, Reporter},
    retry, sql,
    step::{Status, StepCtx, StepRecord},
    typeconv::SqlValue,
    Error, Result,
};

/// Environment variable holding the log filter, e.g. `expecto=debug`.
pub const LOG_ENV: &str = "EXPECTO_LOG";

const DEFAULT_LOG_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global tracing subscriber, filtered by [`LOG_ENV`].
pub fn init_tracing() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true))
        .try_init()
        .wrap_err("failed to set global default subscriber")
}

/// Install colored error reports and tracing. Safe to call from every test:
/// only the first call installs anything, and its outcome is returned to
/// every later caller.
pub fn init() -> eyre::Result<()> {
    static INIT: OnceCell<std::result::Result<(), String>> = OnceCell::new();
    init_once(&INIT, || color_eyre::install().and_then(|_| init_tracing()))
}

fn init_once(
    cell: &OnceCell<std::result::Result<(), String>>,
    install: impl FnOnce() -> eyre::Result<()>,
) -> eyre::Result<()> {
    cell.get_or_init(|| install().map_err(|e| format!("{e:#}")))
        .clone()
        .map_err(|msg| eyre::eyre!(msg))
}

/// Run `reporter` on the step event stream until [`event::close`] is called.
pub fn spawn_reporter<R>(mut reporter: R) -> tokio::task::JoinHandle<eyre::Result<()>>
where
    R: Reporter + Send + 'static,
{
    tokio::spawn(async move { reporter.run().await })
}
