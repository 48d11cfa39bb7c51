//! Path lookup and type-aware comparison over [`serde_json::Value`].
//!
//! Paths are dot separated. A numeric segment indexes an array, `#` yields
//! the length of an array (or, followed by more segments, maps the rest of
//! the path over every element), and `\.` escapes a literal dot.
//!
//! ```text
//! {"user": {"roles": [{"name": "admin"}, {"name": "dev"}], "a.b": 1}}
//!
//! user.roles.0.name   -> "admin"
//! user.roles.#        -> 2
//! user.roles.#.name   -> ["admin", "dev"]
//! user.a\.b           -> 1
//! ```

use serde_json::Value;

/// Split a path on unescaped dots.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => segments.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Value at `path`, or `None` when any segment is missing.
pub fn get_field(json: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let segments = split_path(path);
    lookup(json, &segments)
}

fn lookup(json: &Value, segments: &[String]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(json.clone());
    };

    match json {
        Value::Array(items) if head == "#" => {
            if rest.is_empty() {
                Some(Value::from(items.len()))
            } else {
                Some(Value::Array(
                    items.iter().filter_map(|item| lookup(item, rest)).collect(),
                ))
            }
        }
        Value::Array(items) => {
            let idx: usize = head.parse().ok()?;
            lookup(items.get(idx)?, rest)
        }
        Value::Object(map) => lookup(map.get(head.as_str())?, rest),
        _ => None,
    }
}

/// Missing, null, blank strings and empty containers are empty.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Zero values are skipped by partial comparison.
pub fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

pub fn type_to_string(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Raw JSON rendering used in failure messages.
pub fn debug_value(value: &Value) -> String {
    value.to_string()
}

/// Whether `compare` knows how to match this expected value.
pub fn is_supported_scalar(expected: &Value) -> bool {
    !matches!(expected, Value::Array(_) | Value::Object(_))
}

/// Compare one JSON value against a scalar expectation. Integers match a
/// JSON number only when it has no fractional part.
pub fn compare(actual: Option<&Value>, expected: &Value) -> (bool, String) {
    let Some(actual) = actual else {
        return match expected {
            Value::Null => (false, "field does not exist (expected null)".to_string()),
            _ => (false, "field does not exist".to_string()),
        };
    };

    let mismatch = |what: String| {
        (
            false,
            format!("expected {what}, got {}: {}", type_to_string(actual), debug_value(actual)),
        )
    };

    match expected {
        Value::Null => match actual {
            Value::Null => (true, String::new()),
            _ => mismatch("null".to_string()),
        },
        Value::String(exp) => match actual {
            Value::String(act) if act == exp => (true, String::new()),
            Value::String(act) => (false, format!("expected {exp:?}, got {act:?}")),
            _ => mismatch(format!("string {exp:?}")),
        },
        Value::Bool(exp) => match actual {
            Value::Bool(act) if act == exp => (true, String::new()),
            Value::Bool(act) => (false, format!("expected {exp}, got {act}")),
            _ => mismatch(format!("boolean {exp}")),
        },
        Value::Number(exp) => {
            let Value::Number(act) = actual else {
                return mismatch(format!("number {exp}"));
            };
            let act_f = act.as_f64().unwrap_or(f64::NAN);
            if exp.is_i64() || exp.is_u64() {
                if act_f.trunc() != act_f {
                    return (false, format!("expected integer {exp}, got float {act_f}"));
                }
                let equal = match (exp.as_i64(), exp.as_u64()) {
                    (Some(e), _) => act.as_i64().map_or(act_f == e as f64, |a| a == e),
                    (None, Some(e)) => act.as_u64().map_or(act_f == e as f64, |a| a == e),
                    _ => false,
                };
                if equal {
                    (true, String::new())
                } else {
                    (false, format!("expected {exp}, got {act}"))
                }
            } else {
                let exp_f = exp.as_f64().unwrap_or(f64::NAN);
                if exp_f == act_f {
                    (true, String::new())
                } else {
                    (false, format!("expected {exp_f}, got {act_f}"))
                }
            }
        }
        other => (
            false,
            format!(
                "unsupported expected type {}; supported: string/bool/number/null",
                type_to_string(other)
            ),
        ),
    }
}

/// Every non-zero field of `expected` must be present and equal in `json`.
/// Extra JSON fields are allowed.
pub fn compare_object_partial(json: &Value, expected: &Value) -> (bool, String) {
    compare_object(json, expected, false)
}

/// Every field of `expected` that is present in `json` must match, zero
/// values included. Fields absent from `json` are skipped.
pub fn compare_object_exact(json: &Value, expected: &Value) -> (bool, String) {
    compare_object(json, expected, true)
}

fn compare_object(json: &Value, expected: &Value, exact: bool) -> (bool, String) {
    let expected = match expected {
        Value::Null => return (true, String::new()),
        Value::Object(map) => map,
        other => return (false, format!("expected object, got {}", type_to_string(other))),
    };
    let Value::Object(actual) = json else {
        return (
            false,
            format!("expected JSON object, got {}", type_to_string(json)),
        );
    };

    for (key, exp) in expected {
        let field = actual.get(key);
        if exact {
            if field.is_none() {
                continue;
            }
        } else {
            if is_zero(exp) {
                continue;
            }
            if field.is_none() {
                return (false, format!("field '{key}' not found in JSON"));
            }
        }
        let Some(field) = field else { continue };

        let (ok, msg) = match exp {
            Value::Object(_) => compare_object(field, exp, exact),
            Value::Array(items) => compare_slice(field, items, exact),
            _ => compare(Some(field), exp),
        };
        if !ok {
            return (false, format!("field '{key}': {msg}"));
        }
    }

    (true, String::new())
}

fn compare_slice(json: &Value, expected: &[Value], exact: bool) -> (bool, String) {
    let Value::Array(items) = json else {
        return (false, format!("expected JSON array, got {}", type_to_string(json)));
    };
    if items.len() != expected.len() {
        return (
            false,
            format!(
                "array length mismatch: expected {}, got {}",
                expected.len(),
                items.len()
            ),
        );
    }
    for (i, (item, exp)) in items.iter().zip(expected).enumerate() {
        let (ok, msg) = match exp {
            Value::Object(_) => compare_object(item, exp, exact),
            _ => compare(Some(item), exp),
        };
        if !ok {
            return (false, format!("index {i}: {msg}"));
        }
    }
    (true, String::new())
}

/// First element of `json` matching `expected` by partial comparison.
pub fn find_in_array<'a>(json: &'a Value, expected: &Value) -> Option<(usize, &'a Value)> {
    find_by(json, |item| compare_object_partial(item, expected).0)
}

/// First element of `json` matching `expected` by exact comparison.
pub fn find_in_array_exact<'a>(json: &'a Value, expected: &Value) -> Option<(usize, &'a Value)> {
    find_by(json, |item| compare_object_exact(item, expected).0)
}

fn find_by(json: &Value, matches: impl Fn(&Value) -> bool) -> Option<(usize, &Value)> {
    json.as_array()?
        .iter()
        .enumerate()
        .find(|(_, item)| matches(item))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn doc() -> Value {
        json!({
            "user": {
                "name": "alice",
                "age": 30,
                "score": 4.5,
                "active": true,
                "nick": null,
                "roles": [{"name": "admin", "level": 2}, {"name": "dev", "level": 1}],
                "a.b": "dotted"
            },
            "tags": []
        })
    }

    #[test_case("user.name", Some(json!("alice")); "nested")]
    #[test_case("user.roles.1.name", Some(json!("dev")); "array index")]
    #[test_case("user.roles.#", Some(json!(2)); "array length")]
    #[test_case("user.roles.#.name", Some(json!(["admin", "dev"])); "array projection")]
    #[test_case("user.a\\.b", Some(json!("dotted")); "escaped dot")]
    #[test_case("user.nick", Some(Value::Null); "explicit null")]
    #[test_case("user.missing", None; "missing")]
    #[test_case("user.roles.7", None; "index out of range")]
    #[test_case("", None; "empty path")]
    fn get_field_paths(path: &str, expected: Option<Value>) {
        assert_eq!(get_field(&doc(), path), expected);
    }

    #[test_case(json!("alice"), json!("alice"), true; "string equal")]
    #[test_case(json!("alice"), json!("bob"), false; "string differs")]
    #[test_case(json!(30), json!(30), true; "int equal")]
    #[test_case(json!(30.0), json!(30), true; "integral float matches int")]
    #[test_case(json!(42.5), json!(42), false; "fraction does not match int")]
    #[test_case(json!(4.5), json!(4.5), true; "float equal")]
    #[test_case(json!(true), json!(true), true; "bool equal")]
    #[test_case(json!(null), json!(null), true; "null equal")]
    #[test_case(json!("30"), json!(30), false; "string is not number")]
    fn compare_scalars(actual: Value, expected: Value, ok: bool) {
        assert_eq!(compare(Some(&actual), &expected).0, ok);
    }

    #[test]
    fn compare_messages() {
        assert_eq!(
            compare(Some(&json!(42.5)), &json!(42)).1,
            "expected integer 42, got float 42.5"
        );
        assert_eq!(
            compare(Some(&json!(1)), &json!("1")).1,
            "expected string \"1\", got number: 1"
        );
        assert_eq!(
            compare(None, &Value::Null).1,
            "field does not exist (expected null)"
        );
        assert!(compare(Some(&json!({})), &json!({"a": 1}))
            .1
            .starts_with("unsupported expected type object"));
    }

    #[test]
    fn partial_skips_zero_values() {
        let user = &doc()["user"];
        let (ok, _) = compare_object_partial(user, &json!({"name": "alice", "age": 0, "nick": ""}));
        assert!(ok);

        let (ok, msg) = compare_object_partial(user, &json!({"name": "bob"}));
        assert!(!ok);
        assert_eq!(msg, "field 'name': expected \"bob\", got \"alice\"");

        let (ok, msg) = compare_object_partial(user, &json!({"email": "a@b.c"}));
        assert!(!ok);
        assert_eq!(msg, "field 'email' not found in JSON");
    }

    #[test]
    fn exact_compares_zero_values() {
        let user = &doc()["user"];
        let (ok, msg) = compare_object_exact(user, &json!({"name": "alice", "active": false}));
        assert!(!ok);
        assert_eq!(msg, "field 'active': expected false, got true");

        let (ok, _) = compare_object_exact(user, &json!({"name": "alice", "unknown": 0}));
        assert!(ok);
    }

    #[test]
    fn nested_arrays() {
        let user = &doc()["user"];
        let (ok, msg) = compare_object_partial(user, &json!({"roles": [{"name": "admin"}]}));
        assert!(!ok);
        assert_eq!(msg, "field 'roles': array length mismatch: expected 1, got 2");
    }

    #[test]
    fn find_elements() {
        let roles = &doc()["user"]["roles"];
        assert_eq!(find_in_array(roles, &json!({"name": "dev"})).map(|(i, _)| i), Some(1));
        assert!(find_in_array(roles, &json!({"name": "ops"})).is_none());
        assert!(find_in_array_exact(roles, &json!({"name": "dev", "level": 2})).is_none());
        assert!(find_in_array(&json!({"not": "array"}), &json!({})).is_none());
    }

    #[test]
    fn emptiness() {
        assert!(is_empty(None));
        assert!(is_empty(Some(&json!("  "))));
        assert!(is_empty(Some(&json!([]))));
        assert!(is_empty(Some(&json!({}))));
        assert!(!is_empty(Some(&json!(0))));
        assert!(!is_empty(Some(&json!(false))));
    }
}
