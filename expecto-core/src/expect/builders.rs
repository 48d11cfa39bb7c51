//! Expectation factories shared by the transport builders.
use serde_json::Value;
use std::sync::Arc;

use super::{
    checks::{json_check_is_not_null, json_check_is_null, JsonCheck, ValueCheck},
    precheck::PreCheck,
    standard_report, Expectation, ReportFn,
};
use crate::{
    check::CheckResult,
    jsonutil,
    mode::pick_asserter,
    typeconv::SqlValue,
    Error, Result,
};

/// Reads one column out of a result row.
pub type ValueGetter<T> = Arc<dyn Fn(&T, &str) -> Result<SqlValue> + Send + Sync>;

/// Borrows the raw JSON document out of a result.
pub type JsonGetter<T> = Arc<dyn Fn(&T) -> Result<&[u8]> + Send + Sync>;

/// Compares a whole JSON document with an expected object.
pub type ObjectCompare = fn(&Value, &Value) -> (bool, String);

pub fn value_getter<T, F>(f: F) -> ValueGetter<T>
where
    F: Fn(&T, &str) -> Result<SqlValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn json_getter<T, F>(f: F) -> JsonGetter<T>
where
    F: Fn(&T) -> Result<&[u8]> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Classify a query error. The no-rows sentinel is retryable when `is_no_rows`
/// recognises it, every other error is fatal.
pub fn column_error(
    err: Option<&Error>,
    is_no_rows: Option<fn(&Error) -> bool>,
    column: &str,
) -> std::result::Result<(), CheckResult> {
    let Some(err) = err else {
        return Ok(());
    };
    if is_no_rows.is_some_and(|f| f(err)) {
        return Err(CheckResult::retry(format!(
            "Cannot check column '{column}': query returned no rows"
        )));
    }
    Err(CheckResult::fatal(format!(
        "Cannot check column '{column}': query failed"
    )))
}

pub fn column_value<T>(
    row: Option<&T>,
    column: &str,
    get_value: &ValueGetter<T>,
) -> std::result::Result<SqlValue, CheckResult> {
    let res = match row {
        Some(row) => get_value(row, column),
        None => Err(Error::UnexpectedNil),
    };
    res.map_err(|e| CheckResult::fatal(format!("Failed to get field value: {e}")))
}

pub struct ColumnExpectationConfig<T> {
    pub column: String,
    pub name: String,
    pub get_value: ValueGetter<T>,
    pub is_no_rows: Option<fn(&Error) -> bool>,
    pub check: ValueCheck,
}

impl<T> ColumnExpectationConfig<T> {
    fn evaluate(&self, err: Option<&Error>, row: Option<&T>) -> CheckResult {
        if let Err(res) = column_error(err, self.is_no_rows, &self.column) {
            return res;
        }
        match column_value(row, &self.column, &self.get_value) {
            Ok(value) => (self.check)(&value, &self.column),
            Err(res) => res,
        }
    }
}

pub fn build_column_expectation<T: 'static>(cfg: ColumnExpectationConfig<T>) -> Expectation<T> {
    let report = standard_report(cfg.name.clone());
    let name = cfg.name.clone();
    Expectation::with_report(name, move |err, row| cfg.evaluate(err, row), report)
}

/// Column expectation whose success report compares a derived flag with
/// `expected` through `equal`.
fn build_column_flag_expectation<T: 'static>(
    cfg: ColumnExpectationConfig<T>,
    expected: bool,
    flag: fn(&SqlValue) -> bool,
) -> Expectation<T> {
    let cfg = Arc::new(cfg);
    let reporter = cfg.clone();
    Expectation::new(
        cfg.name.clone(),
        move |err, row| cfg.evaluate(err, row),
        move |step, mode, _err, row, res| {
            let a = pick_asserter(step, mode);
            let name = &reporter.name;
            if !res.ok {
                return a.is_true(false, format!("[{name}] {}", res.reason));
            }
            let actual = column_value(row, &reporter.column, &reporter.get_value)
                .map(|v| flag(&v))
                .unwrap_or(!expected);
            a.equal(expected, actual, format!("[{name}]"))
        },
    )
}

pub fn build_column_bool_expectation<T: 'static>(
    cfg: ColumnExpectationConfig<T>,
    expected: bool,
) -> Expectation<T> {
    build_column_flag_expectation(cfg, expected, |v| v.to_bool().unwrap_or(false))
}

pub fn build_column_null_expectation<T: 'static>(
    cfg: ColumnExpectationConfig<T>,
    expected: bool,
) -> Expectation<T> {
    build_column_flag_expectation(cfg, expected, SqlValue::is_null)
}

pub fn build_column_empty_expectation<T: 'static>(
    cfg: ColumnExpectationConfig<T>,
    expected: bool,
) -> Expectation<T> {
    build_column_flag_expectation(cfg, expected, SqlValue::is_empty)
}

pub struct JsonFieldExpectationConfig<T> {
    pub path: String,
    pub name: String,
    pub get_json: JsonGetter<T>,
    pub pre_check: Option<PreCheck<T>>,
    pub check: JsonCheck,
    pub report: Option<ReportFn<T>>,
}

/// Run the pre-check, then parse the document and look up `path`.
/// Every failure here is retryable.
pub fn check_json_field<T>(
    path: &str,
    get_json: &JsonGetter<T>,
    pre_check: Option<&PreCheck<T>>,
    err: Option<&Error>,
    value: Option<&T>,
) -> std::result::Result<Value, CheckResult> {
    let doc = json_document(get_json, pre_check, err, value, true)?;
    jsonutil::get_field(&doc, path)
        .ok_or_else(|| CheckResult::retry(format!("JSON field '{path}' does not exist")))
}

/// Pre-check, fetch and parse the whole document. Failures carry `retryable`.
pub(crate) fn json_document<T>(
    get_json: &JsonGetter<T>,
    pre_check: Option<&PreCheck<T>>,
    err: Option<&Error>,
    value: Option<&T>,
    retryable: bool,
) -> std::result::Result<Value, CheckResult> {
    if let Some(pre) = pre_check {
        pre(err, value)?;
    }
    let fail = |reason: String| CheckResult {
        ok: false,
        retryable,
        reason,
    };
    let value = value.ok_or_else(|| fail("Response is nil".to_string()))?;
    let bytes = get_json(value).map_err(|e| fail(format!("Cannot get JSON: {e}")))?;
    serde_json::from_slice(bytes).map_err(|_| fail("Invalid JSON".to_string()))
}

pub fn build_json_field_expectation<T: 'static>(cfg: JsonFieldExpectationConfig<T>) -> Expectation<T> {
    let report = cfg
        .report
        .clone()
        .unwrap_or_else(|| standard_report(cfg.name.clone()));
    let name = cfg.name.clone();
    Expectation::with_report(
        name,
        move |err, value| {
            match check_json_field(&cfg.path, &cfg.get_json, cfg.pre_check.as_ref(), err, value) {
                Ok(field) => (cfg.check)(&field, &cfg.path),
                Err(res) => res,
            }
        },
        report,
    )
}

pub struct JsonFieldNullExpectationConfig<T> {
    pub path: String,
    pub name: String,
    pub get_json: JsonGetter<T>,
    pub pre_check: Option<PreCheck<T>>,
    pub expected_null: bool,
}

pub fn build_json_field_null_expectation<T: 'static>(
    cfg: JsonFieldNullExpectationConfig<T>,
) -> Expectation<T> {
    let check = if cfg.expected_null {
        json_check_is_null()
    } else {
        json_check_is_not_null()
    };
    build_json_field_expectation(JsonFieldExpectationConfig {
        path: cfg.path,
        name: cfg.name,
        get_json: cfg.get_json,
        pre_check: cfg.pre_check,
        check,
        report: None,
    })
}

fn message_bytes(bytes: Option<&Vec<u8>>) -> std::result::Result<&[u8], CheckResult> {
    match bytes {
        Some(b) if !b.is_empty() => Ok(b.as_slice()),
        _ => Err(CheckResult::fatal("Message bytes are empty")),
    }
}

fn bytes_field(bytes: &[u8], path: &str) -> Option<Value> {
    let doc: Value = serde_json::from_slice(bytes).ok()?;
    jsonutil::get_field(&doc, path)
}

/// JSON field expectation over raw message bytes. A missing field is fatal.
pub fn build_bytes_json_field_expectation(
    path: impl Into<String>,
    name: impl Into<String>,
    check: JsonCheck,
) -> Expectation<Vec<u8>> {
    build_bytes_json_field_with_exists_check(path, name, true, check)
}

/// Like [`build_bytes_json_field_expectation`]. A missing field passes
/// unless `require_exists` is set.
pub fn build_bytes_json_field_with_exists_check(
    path: impl Into<String>,
    name: impl Into<String>,
    require_exists: bool,
    check: JsonCheck,
) -> Expectation<Vec<u8>> {
    let path = path.into();
    let name = name.into();
    let report = standard_report(name.clone());
    Expectation::with_report(
        name,
        move |_err, bytes| {
            let bytes = match message_bytes(bytes) {
                Ok(b) => b,
                Err(res) => return res,
            };
            match bytes_field(bytes, &path) {
                Some(field) => check(&field, &path),
                None if require_exists => CheckResult::fatal(format!("Field '{path}' not found")),
                None => CheckResult::ok(),
            }
        },
        report,
    )
}

/// Null check over message bytes. A missing field counts as null.
pub fn build_bytes_json_field_null_check(
    path: impl Into<String>,
    name: impl Into<String>,
    expected_null: bool,
) -> Expectation<Vec<u8>> {
    let path = path.into();
    let name = name.into();
    let report = standard_report(name.clone());
    Expectation::with_report(
        name,
        move |_err, bytes| {
            let bytes = match message_bytes(bytes) {
                Ok(b) => b,
                Err(res) => return res,
            };
            let field = bytes_field(bytes, &path);
            let is_null = field.as_ref().is_none_or(Value::is_null);
            match (expected_null, is_null, field) {
                (true, false, Some(v)) => CheckResult::fatal(format!(
                    "Expected null, got {}",
                    jsonutil::type_to_string(&v)
                )),
                (false, true, _) => {
                    CheckResult::fatal(format!("Field '{path}' is null or does not exist"))
                }
                _ => CheckResult::ok(),
            }
        },
        report,
    )
}

pub struct FullObjectExpectationConfig<T> {
    pub name: String,
    pub get_json: JsonGetter<T>,
    pub pre_check: Option<PreCheck<T>>,
    pub expected: Value,
    pub compare: ObjectCompare,
    /// Classification of every failure past the pre-check.
    pub retryable: bool,
}

pub fn build_full_object_expectation<T: 'static>(cfg: FullObjectExpectationConfig<T>) -> Expectation<T> {
    let report = standard_report(cfg.name.clone());
    let name = cfg.name.clone();
    Expectation::with_report(
        name,
        move |err, value| {
            let doc = match json_document(&cfg.get_json, cfg.pre_check.as_ref(), err, value, cfg.retryable)
            {
                Ok(doc) => doc,
                Err(res) => return res,
            };
            match (cfg.compare)(&doc, &cfg.expected) {
                (true, _) => CheckResult::ok(),
                (false, reason) => CheckResult {
                    ok: false,
                    retryable: cfg.retryable,
                    reason,
                },
            }
        },
        report,
    )
}

/// Whole-message comparison over raw bytes. Every failure is fatal.
pub fn build_bytes_object_expectation(
    name: impl Into<String>,
    expected: Value,
    compare: ObjectCompare,
) -> Expectation<Vec<u8>> {
    let name = name.into();
    let report = standard_report(name.clone());
    Expectation::with_report(
        name,
        move |_err, bytes| {
            let bytes = match message_bytes(bytes) {
                Ok(b) => b,
                Err(res) => return res,
            };
            let Ok(doc) = serde_json::from_slice::<Value>(bytes) else {
                return CheckResult::fatal("Invalid JSON message");
            };
            match compare(&doc, &expected) {
                (true, _) => CheckResult::ok(),
                (false, reason) => CheckResult::fatal(reason),
            }
        },
        report,
    )
}
