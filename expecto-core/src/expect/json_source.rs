//! Expectation vocabularies over JSON documents.
//!
//! [`JsonSource`] reaches the document through a getter on the call result
//! and gates it with a pre-check. [`BytesJsonSource`] works directly on raw
//! message bytes, where a missing field is a contract violation rather than
//! something to wait for.
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use super::{
    builders::*,
    checks::{self, raw_string, JsonCheck},
    precheck::PreCheck,
    validate_json_path, Expectation,
};
use crate::{
    check::CheckResult,
    jsonutil::{self, debug_value, type_to_string},
    mode::pick_asserter,
    Error,
};

fn to_expected<V: Serialize>(expected: &V) -> std::result::Result<Value, String> {
    serde_json::to_value(expected).map_err(|e| format!("Cannot encode expected value: {e}"))
}

/// `%v`-like rendering of an expected value for expectation names.
fn display_expected(expected: &std::result::Result<Value, String>) -> String {
    match expected {
        Ok(v) => raw_string(v),
        Err(_) => "<unencodable>".to_string(),
    }
}

pub struct JsonSource<T> {
    get_json: JsonGetter<T>,
    pre_check: PreCheck<T>,
}

impl<T> Clone for JsonSource<T> {
    fn clone(&self) -> Self {
        JsonSource {
            get_json: self.get_json.clone(),
            pre_check: self.pre_check.clone(),
        }
    }
}

impl<T: 'static> JsonSource<T> {
    /// `pre_check` should be a with-body pre-check.
    pub fn new(get_json: JsonGetter<T>, pre_check: PreCheck<T>) -> JsonSource<T> {
        JsonSource {
            get_json,
            pre_check,
        }
    }

    /// Path validation, pre-check, parse. `None` when the path is absent.
    fn lookup(
        &self,
        path: &str,
        err: Option<&Error>,
        value: Option<&T>,
    ) -> std::result::Result<Option<Value>, CheckResult> {
        if let Err(e) = validate_json_path(path) {
            return Err(CheckResult::fatal(format!("Invalid JSON path: {e}")));
        }
        (self.pre_check)(err, value)?;
        let Some(value) = value else {
            return Err(CheckResult::retry("Response is nil"));
        };
        let bytes = (self.get_json)(value)
            .map_err(|e| CheckResult::retry(format!("Cannot get JSON: {e}")))?;
        let doc: Value = serde_json::from_slice(bytes)
            .map_err(|_| CheckResult::retry("Invalid JSON response body"))?;
        Ok(jsonutil::get_field(&doc, path))
    }

    /// Like `lookup`, an absent path is retryable with the `missing` reason.
    fn require(
        &self,
        path: &str,
        err: Option<&Error>,
        value: Option<&T>,
        missing: impl FnOnce() -> String,
    ) -> std::result::Result<Value, CheckResult> {
        self.lookup(path, err, value)?
            .ok_or_else(|| CheckResult::retry(missing()))
    }

    /// Best-effort field value for success reports.
    fn actual(&self, path: &str, value: Option<&T>) -> Option<Value> {
        let bytes = (self.get_json)(value?).ok()?;
        let doc: Value = serde_json::from_slice(bytes).ok()?;
        jsonutil::get_field(&doc, path)
    }

    fn with_actual<C>(&self, name: String, path: String, check: C) -> Expectation<T>
    where
        C: Fn(Option<&Error>, Option<&T>) -> CheckResult + Send + Sync + 'static,
    {
        let source = self.clone();
        Expectation::new(name.clone(), check, move |step, mode, _err, value, res| {
            let a = pick_asserter(step, mode);
            if !res.ok {
                return a.is_true(false, format!("[{name}] {}", res.reason));
            }
            match source.actual(&path, value) {
                Some(actual) => a.is_true(true, format!("[{name}] actual: {}", debug_value(&actual))),
                None => a.is_true(true, format!("[{name}]")),
            }
        })
    }

    fn field_check(&self, path: &str, name: String, check: JsonCheck) -> Expectation<T> {
        let source = self.clone();
        let path = path.to_string();
        let reported = path.clone();
        self.with_actual(
            name,
            reported,
            move |err, value| {
                match source.require(&path, err, value, || {
                    format!("JSON field '{path}' does not exist")
                }) {
                    Ok(field) => check(&field, &path),
                    Err(res) => res,
                }
            },
        )
    }

    pub fn field_equals<V: Serialize>(&self, path: &str, expected: V) -> Expectation<T> {
        let expected = to_expected(&expected);
        let name = format!(
            "Expect JSON field '{path}' == {}",
            display_expected(&expected)
        );
        let source = self.clone();
        let path_owned = path.to_string();
        self.with_actual(
            name,
            path.to_string(),
            move |err, value| {
                let path = &path_owned;
                let expected = match &expected {
                    Ok(v) => v,
                    Err(reason) => return CheckResult::fatal(reason.clone()),
                };
                let field = match source.require(path, err, value, || {
                    format!("Path '{path}' does not exist in response yet")
                }) {
                    Ok(field) => field,
                    Err(res) => return res,
                };
                if !jsonutil::is_supported_scalar(expected) {
                    return CheckResult::fatal(jsonutil::compare(Some(&field), expected).1);
                }
                match jsonutil::compare(Some(&field), expected) {
                    (true, _) => CheckResult::ok(),
                    (false, msg) => CheckResult::retry(msg),
                }
            },
        )
    }

    pub fn field_not_empty(&self, path: &str) -> Expectation<T> {
        self.field_check(
            path,
            format!("Expect JSON field '{path}' not empty"),
            checks::json_check_not_empty(),
        )
    }

    pub fn field_is_null(&self, path: &str) -> Expectation<T> {
        self.field_check(
            path,
            format!("Expect JSON field '{path}' is null"),
            checks::json_check_is_null(),
        )
    }

    pub fn field_is_not_null(&self, path: &str) -> Expectation<T> {
        self.field_check(
            path,
            format!("Expect JSON field '{path}' is not null"),
            checks::json_check_is_not_null(),
        )
    }

    pub fn field_true(&self, path: &str) -> Expectation<T> {
        self.field_check(
            path,
            format!("Expect JSON field '{path}' is true"),
            checks::json_check_true(),
        )
    }

    pub fn field_false(&self, path: &str) -> Expectation<T> {
        self.field_check(
            path,
            format!("Expect JSON field '{path}' is false"),
            checks::json_check_false(),
        )
    }

    /// Passes when the path is absent or null.
    pub fn field_is_null_or_missing(&self, path: &str) -> Expectation<T> {
        self.optional_field(
            path,
            format!("Expect JSON field '{path}' is null or missing"),
            checks::json_check_is_null(),
        )
    }

    /// Passes when the path is absent or holds an empty value.
    pub fn field_empty(&self, path: &str) -> Expectation<T> {
        self.optional_field(
            path,
            format!("Expect JSON field '{path}' is empty"),
            checks::json_check_empty(),
        )
    }

    fn optional_field(&self, path: &str, name: String, check: JsonCheck) -> Expectation<T> {
        let source = self.clone();
        let path = path.to_string();
        let reported = path.clone();
        self.with_actual(
            name,
            reported,
            move |err, value| match source.lookup(&path, err, value) {
                Ok(Some(field)) => check(&field, &path),
                Ok(None) => CheckResult::ok(),
                Err(res) => res,
            },
        )
    }

    pub fn array_contains<V: Serialize>(&self, path: &str, expected: V) -> Expectation<T> {
        self.array_match(
            path,
            format!("Expect array '{path}' contains matching object"),
            to_expected(&expected),
            false,
        )
    }

    /// Zero values in `expected` must match too. A partial match on some
    /// element reports that element's diff.
    pub fn array_contains_exact<V: Serialize>(&self, path: &str, expected: V) -> Expectation<T> {
        self.array_match(
            path,
            format!("Expect array '{path}' contains exact matching object"),
            to_expected(&expected),
            true,
        )
    }

    fn array_match(
        &self,
        path: &str,
        name: String,
        expected: std::result::Result<Value, String>,
        exact: bool,
    ) -> Expectation<T> {
        let expected = std::sync::Arc::new(expected);
        let source = self.clone();
        let reporter = self.clone();
        let path = path.to_string();
        let reported_path = path.clone();
        let reported_expected = expected.clone();
        let reported_name = name.clone();
        let find: for<'a> fn(&'a Value, &Value) -> Option<(usize, &'a Value)> = if exact {
            jsonutil::find_in_array_exact
        } else {
            jsonutil::find_in_array
        };

        Expectation::new(
            name,
            move |err, value| {
                let expected = match expected.as_ref() {
                    Ok(v) => v,
                    Err(reason) => return CheckResult::fatal(reason.clone()),
                };
                let array = match source.require(&path, err, value, || {
                    format!("Path '{path}' does not exist in response")
                }) {
                    Ok(array) => array,
                    Err(res) => return res,
                };
                if !array.is_array() {
                    return CheckResult::fatal(format!(
                        "Expected array at '{path}', got {}",
                        type_to_string(&array)
                    ));
                }
                if find(&array, expected).is_some() {
                    return CheckResult::ok();
                }
                if exact {
                    if let Some((idx, item)) = jsonutil::find_in_array(&array, expected) {
                        let (_, diff) = jsonutil::compare_object_exact(item, expected);
                        return CheckResult::retry(format!(
                            "Found similar object at index {idx} but exact match failed: {diff}"
                        ));
                    }
                }
                CheckResult::retry(format!("No matching object found in array '{path}'"))
            },
            move |step, mode, _err, value, res| {
                let a = pick_asserter(step, mode);
                let name = &reported_name;
                if !res.ok {
                    return a.is_true(false, format!("[{name}] {}", res.reason));
                }
                let found = match (reported_expected.as_ref(), reporter.actual(&reported_path, value)) {
                    (Ok(expected), Some(array)) => find(&array, expected)
                        .map(|(idx, item)| format!("Found at index {idx}: {}", debug_value(item))),
                    _ => None,
                };
                match found {
                    Some(found) => a.is_true(true, format!("[{name}] {found}")),
                    None => a.is_true(true, format!("[{name}]")),
                }
            },
        )
    }

    /// Every field of `expected` must match, zero values included.
    pub fn body_equals<V: Serialize>(&self, expected: V) -> Expectation<T> {
        self.body_match("Expect body matches (exact)", expected, jsonutil::compare_object_exact)
    }

    /// Every non-zero field of `expected` must match.
    pub fn body_partial<V: Serialize>(&self, expected: V) -> Expectation<T> {
        self.body_match("Expect body matches (partial)", expected, jsonutil::compare_object_partial)
    }

    fn body_match<V: Serialize>(&self, name: &str, expected: V, compare: ObjectCompare) -> Expectation<T> {
        match to_expected(&expected) {
            Ok(expected) => build_full_object_expectation(FullObjectExpectationConfig {
                name: name.to_string(),
                get_json: self.get_json.clone(),
                pre_check: Some(self.pre_check.clone()),
                expected,
                compare,
                retryable: true,
            }),
            Err(reason) => unencodable(name, reason),
        }
    }
}

fn unencodable<T>(name: &str, reason: String) -> Expectation<T> {
    let name = name.to_string();
    Expectation::with_report(
        name.clone(),
        move |_err, _value| CheckResult::fatal(reason.clone()),
        super::standard_report(name),
    )
}

/// JSON expectations over raw message bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesJsonSource;

impl BytesJsonSource {
    pub fn new() -> BytesJsonSource {
        BytesJsonSource
    }

    pub fn field_equals<V: Serialize>(&self, path: &str, expected: V) -> Expectation<Vec<u8>> {
        let expected = to_expected(&expected);
        let name = format!("Expect: Field '{path}' = {}", display_expected(&expected));
        match expected {
            Ok(expected) => {
                build_bytes_json_field_expectation(path, name, checks::json_check_equals(expected))
            }
            Err(reason) => unencodable(&name, reason),
        }
    }

    pub fn field_not_empty(&self, path: &str) -> Expectation<Vec<u8>> {
        build_bytes_json_field_expectation(
            path,
            format!("Expect: Field '{path}' not empty"),
            checks::json_check_not_empty(),
        )
    }

    /// A missing field counts as empty.
    pub fn field_empty(&self, path: &str) -> Expectation<Vec<u8>> {
        build_bytes_json_field_with_exists_check(
            path,
            format!("Expect: Field '{path}' is empty"),
            false,
            checks::json_check_empty(),
        )
    }

    pub fn field_is_null(&self, path: &str) -> Expectation<Vec<u8>> {
        build_bytes_json_field_null_check(path, format!("Expect: Field '{path}' is null"), true)
    }

    pub fn field_is_not_null(&self, path: &str) -> Expectation<Vec<u8>> {
        build_bytes_json_field_null_check(path, format!("Expect: Field '{path}' is not null"), false)
    }

    pub fn field_true(&self, path: &str) -> Expectation<Vec<u8>> {
        build_bytes_json_field_expectation(
            path,
            format!("Expect: Field '{path}' is true"),
            checks::json_check_true(),
        )
    }

    pub fn field_false(&self, path: &str) -> Expectation<Vec<u8>> {
        build_bytes_json_field_expectation(
            path,
            format!("Expect: Field '{path}' is false"),
            checks::json_check_false(),
        )
    }

    pub fn body_equals<V: Serialize>(&self, expected: V) -> Expectation<Vec<u8>> {
        self.body_match("Expect: Message matches (exact)", expected, jsonutil::compare_object_exact)
    }

    pub fn body_partial<V: Serialize>(&self, expected: V) -> Expectation<Vec<u8>> {
        self.body_match("Expect: Message matches (partial)", expected, jsonutil::compare_object_partial)
    }

    fn body_match<V: Serialize>(&self, name: &str, expected: V, compare: ObjectCompare) -> Expectation<Vec<u8>> {
        match to_expected(&expected) {
            Ok(expected) => build_bytes_object_expectation(name, expected, compare),
            Err(reason) => unencodable(name, reason),
        }
    }

    /// One `field_equals` per key of `expected`, nested under `path`.
    pub fn field_json(&self, path: &str, expected: IndexMap<String, Value>) -> Vec<Expectation<Vec<u8>>> {
        expected
            .into_iter()
            .map(|(key, value)| self.field_equals(&format!("{path}.{key}"), value))
            .collect()
    }
}
