//! Envelope gates evaluated before any content predicate.
//!
//! A pre-check returns `Err(result)` to short-circuit the expectation with
//! `result`. Every pre-check failure is retryable: the response may still
//! show up on a later attempt.
use std::sync::Arc;

use crate::{check::CheckResult, Error};

pub type PreCheck<T> =
    Arc<dyn Fn(Option<&Error>, Option<&T>) -> Result<(), CheckResult> + Send + Sync>;

type Predicate<T, R> = Box<dyn Fn(&T) -> R + Send + Sync>;

pub struct PreCheckConfig<T> {
    is_nil: Option<Predicate<T, bool>>,
    has_error: Option<Predicate<T, bool>>,
    network_error: Option<Box<dyn Fn(&T) -> Option<String> + Send + Sync>>,
    empty_body: Option<Predicate<T, bool>>,
}

impl<T> Default for PreCheckConfig<T> {
    fn default() -> Self {
        PreCheckConfig {
            is_nil: None,
            has_error: None,
            network_error: None,
            empty_body: None,
        }
    }
}

impl<T> PreCheckConfig<T> {
    pub fn new() -> PreCheckConfig<T> {
        PreCheckConfig::default()
    }

    /// The value is present but carries no payload. A missing value is
    /// always nil.
    pub fn is_nil(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.is_nil = Some(Box::new(f));
        self
    }

    /// The envelope holds an application-level error.
    pub fn has_error(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.has_error = Some(Box::new(f));
        self
    }

    pub fn network_error(mut self, f: impl Fn(&T) -> Option<String> + Send + Sync + 'static) -> Self {
        self.network_error = Some(Box::new(f));
        self
    }

    /// Only consulted by [`build_pre_check_with_body`].
    pub fn empty_body(mut self, f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.empty_body = Some(Box::new(f));
        self
    }

    fn gate(&self, err: Option<&Error>, value: Option<&T>) -> Result<(), CheckResult> {
        if err.is_some() {
            return Err(CheckResult::retry("Request failed"));
        }
        let Some(value) = value else {
            return Err(CheckResult::retry("Response is nil"));
        };
        if self.is_nil.as_ref().is_some_and(|f| f(value)) {
            return Err(CheckResult::retry("Response is nil"));
        }
        if self.has_error.as_ref().is_some_and(|f| f(value)) {
            return Err(CheckResult::retry("Response contains error"));
        }
        if let Some(f) = &self.network_error {
            if f(value).is_some_and(|e| !e.is_empty()) {
                return Err(CheckResult::retry("Network error occurred"));
            }
        }
        Ok(())
    }
}

pub fn build_pre_check<T: 'static>(cfg: PreCheckConfig<T>) -> PreCheck<T> {
    Arc::new(move |err, value| cfg.gate(err, value))
}

/// [`build_pre_check`] followed by the empty body gate.
pub fn build_pre_check_with_body<T: 'static>(cfg: PreCheckConfig<T>) -> PreCheck<T> {
    Arc::new(move |err, value| {
        cfg.gate(err, value)?;
        if let (Some(f), Some(v)) = (&cfg.empty_body, value) {
            if f(v) {
                return Err(CheckResult::retry("Response body is empty"));
            }
        }
        Ok(())
    })
}

/// Only the nil and envelope error gates.
pub fn build_simple_pre_check<T: 'static>(
    is_nil: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
    has_error: Option<Box<dyn Fn(&T) -> bool + Send + Sync>>,
) -> PreCheck<T> {
    build_pre_check(PreCheckConfig {
        is_nil,
        has_error,
        ..PreCheckConfig::default()
    })
}

/// Layer a key existence gate over `base`, for keyed stores.
pub fn build_key_exists_pre_check<T, E, K>(
    base: Option<PreCheck<T>>,
    key_exists: E,
    get_key: K,
) -> PreCheck<T>
where
    T: 'static,
    E: Fn(&T) -> bool + Send + Sync + 'static,
    K: Fn(&T) -> String + Send + Sync + 'static,
{
    Arc::new(move |err, value| {
        if let Some(base) = &base {
            base(err, value)?;
        }
        if let Some(v) = value {
            if !key_exists(v) {
                return Err(CheckResult::retry(key_not_exists_reason(&get_key(v))));
            }
        }
        Ok(())
    })
}

fn key_not_exists_reason(key: &str) -> String {
    if key.is_empty() {
        "Key does not exist".to_string()
    } else {
        format!("Key '{key}' does not exist")
    }
}
