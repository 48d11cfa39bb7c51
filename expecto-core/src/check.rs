//! The verdict every predicate returns.

/// Outcome of one predicate evaluated against one `(value, error)` pair.
///
/// Only three states are legal: passed, failed-but-retryable and failed-fatally.
/// Construct them with [`CheckResult::ok`], [`CheckResult::retry`] and
/// [`CheckResult::fatal`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckResult {
    pub ok: bool,
    pub retryable: bool,
    pub reason: String,
}

impl CheckResult {
    pub fn ok() -> CheckResult {
        CheckResult {
            ok: true,
            retryable: false,
            reason: String::new(),
        }
    }

    /// A failure whose cause may disappear on a later attempt.
    pub fn retry(reason: impl Into<String>) -> CheckResult {
        CheckResult {
            ok: false,
            retryable: true,
            reason: reason.into(),
        }
    }

    /// A contract violation. Polling stops immediately.
    pub fn fatal(reason: impl Into<String>) -> CheckResult {
        CheckResult {
            ok: false,
            retryable: false,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        !self.ok && !self.retryable
    }
}
