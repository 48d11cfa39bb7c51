pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Occurs when `expecto.toml` fails to load.
    #[error("failed to load expecto.toml: {0}")]
    LoadError(String),
    /// Occurs when the specified key is not found in `expecto.toml`.
    #[error("the specified key \"{0}\" not found in expecto.toml")]
    ValueNotFound(String),
    /// Occurs when a configuration value can't be parsed into the requested type.
    #[error("failed to parse configuration value: {0:#}")]
    ValueError(eyre::Error),

    /// The step was marked broken. Used for DSL misuse and framework bugs,
    /// never for an ordinary failed expectation.
    #[error("step broken: {0}")]
    Broken(String),
    /// A fatal (require) assertion failed and the step was aborted.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    #[error("unexpected nil result")]
    UnexpectedNil,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Cancelled,

    /// Sentinel returned by SQL clients when a query matched no row.
    #[error("no rows in result set")]
    NoRows,
    #[error("{0}")]
    NotFound(String),
    #[cfg(feature = "grpc")]
    #[error("gRPC status {:?}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),
    #[error("http error: {0}")]
    Http(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("redis error: {0}")]
    Redis(String),
    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:#}")]
    Unexpected(#[from] eyre::Error),
}

impl Error {
    /// Whether this error marks the step as broken rather than failed.
    pub fn is_broken(&self) -> bool {
        matches!(self, Error::Broken(_))
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, Error::NoRows)
    }

    /// Whether this error was produced by the cancellation context.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Error::DeadlineExceeded | Error::Cancelled)
    }
}
