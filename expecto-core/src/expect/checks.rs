//! Value predicates over SQL columns and JSON fields.
use serde_json::Value;

use crate::{
    check::CheckResult,
    jsonutil::{self, debug_value, type_to_string},
    typeconv::{equals_loose, SqlValue},
};

/// Predicate over one column value. The second argument is the column name.
pub type ValueCheck = Box<dyn Fn(&SqlValue, &str) -> CheckResult + Send + Sync>;

/// Predicate over one JSON field that exists. The second argument is the path.
pub type JsonCheck = Box<dyn Fn(&Value, &str) -> CheckResult + Send + Sync>;

pub fn check_equals(expected: SqlValue) -> ValueCheck {
    Box::new(move |value, column| {
        let (equal, retryable, reason) = equals_loose(&expected, value);
        match (equal, retryable) {
            (true, _) => CheckResult::ok(),
            (false, true) => CheckResult::retry(format!("Column '{column}': {reason}")),
            (false, false) => CheckResult::fatal(format!("Column '{column}': {reason}")),
        }
    })
}

pub fn check_not_equals(not_expected: SqlValue) -> ValueCheck {
    Box::new(move |value, column| {
        let (equal, _, _) = equals_loose(&not_expected, value);
        if equal {
            return CheckResult::retry(format!(
                "Column '{column}' equals {value}, but expected NOT to equal"
            ));
        }
        CheckResult::ok()
    })
}

pub fn check_not_empty() -> ValueCheck {
    Box::new(|value, column| {
        if value.is_empty() {
            return CheckResult::retry(format!(
                "Expected column '{column}' to not be empty, but it is"
            ));
        }
        CheckResult::ok()
    })
}

pub fn check_empty() -> ValueCheck {
    Box::new(|value, column| {
        if !value.is_empty() {
            return CheckResult::retry(format!(
                "Expected column '{column}' to be empty, but got: {value}"
            ));
        }
        CheckResult::ok()
    })
}

pub fn check_is_null() -> ValueCheck {
    Box::new(|value, column| {
        if !value.is_null() {
            return CheckResult::retry(format!(
                "Expected column '{column}' to be NULL, but it has a value"
            ));
        }
        CheckResult::ok()
    })
}

pub fn check_is_not_null() -> ValueCheck {
    Box::new(|value, column| {
        if value.is_null() {
            return CheckResult::retry(format!(
                "Expected column '{column}' to be NOT NULL, but it is NULL"
            ));
        }
        CheckResult::ok()
    })
}

pub fn check_true() -> ValueCheck {
    check_bool(true)
}

pub fn check_false() -> ValueCheck {
    check_bool(false)
}

fn check_bool(expected: bool) -> ValueCheck {
    Box::new(move |value, column| {
        if value.is_null() {
            return CheckResult::retry(format!("Column '{column}' is NULL yet"));
        }
        match value.to_bool() {
            None => CheckResult::fatal(format!(
                "Column '{column}' is not a boolean/numeric(0/1) type"
            )),
            Some(b) if b == expected => CheckResult::ok(),
            Some(b) => CheckResult::retry(format!(
                "Expected column '{column}' to be {expected}, but got {b}"
            )),
        }
    })
}

/// An unsupported expected type is fatal, a value mismatch is retryable.
pub fn json_check_equals(expected: Value) -> JsonCheck {
    Box::new(move |actual, _path| {
        if !jsonutil::is_supported_scalar(&expected) {
            let (_, msg) = jsonutil::compare(Some(actual), &expected);
            return CheckResult::fatal(msg);
        }
        match jsonutil::compare(Some(actual), &expected) {
            (true, _) => CheckResult::ok(),
            (false, msg) => CheckResult::retry(msg),
        }
    })
}

pub fn json_check_not_empty() -> JsonCheck {
    Box::new(|actual, path| {
        if jsonutil::is_empty(Some(actual)) {
            return CheckResult::retry(format!("JSON field '{path}' is empty"));
        }
        CheckResult::ok()
    })
}

pub fn json_check_empty() -> JsonCheck {
    Box::new(|actual, path| {
        if !jsonutil::is_empty(Some(actual)) {
            return CheckResult::retry(format!(
                "Field '{path}' is not empty, got: {}",
                raw_string(actual)
            ));
        }
        CheckResult::ok()
    })
}

pub fn json_check_is_null() -> JsonCheck {
    Box::new(|actual, _path| {
        if !actual.is_null() {
            return CheckResult::retry(format!(
                "Expected null, got {}: {}",
                type_to_string(actual),
                debug_value(actual)
            ));
        }
        CheckResult::ok()
    })
}

pub fn json_check_is_not_null() -> JsonCheck {
    Box::new(|actual, _path| {
        if actual.is_null() {
            return CheckResult::retry("Expected non-null value, got null");
        }
        CheckResult::ok()
    })
}

pub fn json_check_true() -> JsonCheck {
    json_check_bool(true)
}

pub fn json_check_false() -> JsonCheck {
    json_check_bool(false)
}

fn json_check_bool(expected: bool) -> JsonCheck {
    Box::new(move |actual, _path| match actual {
        Value::Bool(b) if *b == expected => CheckResult::ok(),
        Value::Bool(b) => CheckResult::retry(format!("Expected {expected}, got {b}")),
        other => CheckResult::fatal(format!(
            "Expected boolean, got {}: {}",
            type_to_string(other),
            debug_value(other)
        )),
    })
}

/// Strings unquoted, everything else as raw JSON.
pub(crate) fn raw_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn verdict(res: CheckResult) -> (bool, bool) {
        (res.ok, res.retryable)
    }

    #[test_case(SqlValue::from(5_i64), SqlValue::from(5_i32), (true, false); "equal")]
    #[test_case(SqlValue::from(5_i64), SqlValue::from(6_i64), (false, true); "value mismatch")]
    #[test_case(SqlValue::from("5"), SqlValue::from(5_i64), (false, false); "type mismatch")]
    #[test_case(SqlValue::from(5_i64), SqlValue::Null, (false, true); "null yet")]
    fn equals(expected: SqlValue, actual: SqlValue, want: (bool, bool)) {
        assert_eq!(verdict(check_equals(expected)(&actual, "amount")), want);
    }

    #[test]
    fn column_messages() {
        assert_eq!(
            check_equals(SqlValue::from(1_i64))(&SqlValue::from(2_i64), "qty").reason,
            "Column 'qty': expected 1, got 2"
        );
        assert_eq!(
            check_not_equals(SqlValue::from("x"))(&SqlValue::from("x"), "s").reason,
            "Column 's' equals x, but expected NOT to equal"
        );
        assert!(check_not_equals(SqlValue::from("x"))(&SqlValue::from("y"), "s").ok);
        assert_eq!(
            check_not_empty()(&SqlValue::from(" "), "name").reason,
            "Expected column 'name' to not be empty, but it is"
        );
        assert_eq!(
            check_empty()(&SqlValue::from("bob"), "name").reason,
            "Expected column 'name' to be empty, but got: bob"
        );
        assert_eq!(
            check_is_null()(&SqlValue::from(1_i64), "deleted_at").reason,
            "Expected column 'deleted_at' to be NULL, but it has a value"
        );
        assert_eq!(
            check_is_not_null()(&SqlValue::Null, "created_at").reason,
            "Expected column 'created_at' to be NOT NULL, but it is NULL"
        );
    }

    #[test_case(SqlValue::from(true), (true, false); "bool true")]
    #[test_case(SqlValue::from(1_i64), (true, false); "one")]
    #[test_case(SqlValue::from(0_i64), (false, true); "zero")]
    #[test_case(SqlValue::Null, (false, true); "null")]
    #[test_case(SqlValue::from("yes"), (false, false); "text")]
    #[test_case(SqlValue::from(2_i64), (false, false); "two")]
    fn column_true(value: SqlValue, want: (bool, bool)) {
        assert_eq!(verdict(check_true()(&value, "active")), want);
    }

    #[test]
    fn column_false_messages() {
        assert_eq!(
            check_false()(&SqlValue::from(true), "flag").reason,
            "Expected column 'flag' to be false, but got true"
        );
        assert_eq!(check_false()(&SqlValue::Null, "flag").reason, "Column 'flag' is NULL yet");
        assert_eq!(
            check_false()(&SqlValue::Float(0.5), "flag").reason,
            "Column 'flag' is not a boolean/numeric(0/1) type"
        );
    }

    #[test_case(json!("a"), json!("a"), (true, false); "string equal")]
    #[test_case(json!("a"), json!("b"), (false, true); "string mismatch")]
    #[test_case(json!(42), json!(42.0), (true, false); "integer vs whole float")]
    #[test_case(json!(42), json!(42.5), (false, true); "integer vs fraction")]
    #[test_case(json!({"a": 1}), json!({"a": 1}), (false, false); "unsupported expected")]
    fn json_equals(expected: Value, actual: Value, want: (bool, bool)) {
        assert_eq!(verdict(json_check_equals(expected)(&actual, "p")), want);
    }

    #[test]
    fn json_messages() {
        assert_eq!(json_check_not_empty()(&json!(""), "name").reason, "JSON field 'name' is empty");
        assert_eq!(
            json_check_empty()(&json!("x"), "name").reason,
            "Field 'name' is not empty, got: x"
        );
        assert_eq!(
            json_check_is_null()(&json!(1), "p").reason,
            "Expected null, got number: 1"
        );
        assert_eq!(
            json_check_is_not_null()(&Value::Null, "p").reason,
            "Expected non-null value, got null"
        );
        assert_eq!(json_check_true()(&json!(false), "p").reason, "Expected true, got false");
        assert_eq!(json_check_false()(&json!(true), "p").reason, "Expected false, got true");

        let res = json_check_true()(&json!("true"), "p");
        assert!(res.is_fatal());
        assert_eq!(res.reason, "Expected boolean, got string: \"true\"");
    }
}
