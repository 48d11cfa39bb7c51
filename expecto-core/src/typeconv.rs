//! Column values read from SQL rows, with the loose equality used by column
//! expectations.
use serde::Serialize;
use std::{borrow::Cow, fmt};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null => "Null",
            SqlValue::Bool(_) => "Bool",
            SqlValue::Int(_) => "Int",
            SqlValue::UInt(_) => "UInt",
            SqlValue::Float(_) => "Float",
            SqlValue::Text(_) => "Text",
            SqlValue::Bytes(_) => "Bytes",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// NULL, blank text and empty byte strings are empty.
    pub fn is_empty(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Text(s) => s.trim().is_empty(),
            SqlValue::Bytes(b) => b.is_empty(),
            _ => false,
        }
    }

    /// Booleans and the integers 0 and 1.
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(0) | SqlValue::UInt(0) => Some(false),
            SqlValue::Int(1) | SqlValue::UInt(1) => Some(true),
            _ => None,
        }
    }

    pub fn to_number(&self) -> Option<f64> {
        match self {
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::UInt(u) => Some(*u as f64),
            SqlValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        match self {
            SqlValue::Text(s) => Some(Cow::Borrowed(s)),
            SqlValue::Bytes(b) => Some(String::from_utf8_lossy(b)),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Bool(b) => write!(f, "{b}"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::UInt(u) => write!(f, "{u}"),
            SqlValue::Float(x) => write!(f, "{x}"),
            SqlValue::Text(s) => write!(f, "{s}"),
            SqlValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

macro_rules! impl_from {
    ($variant:ident, $target:ty, $($t:ty),+) => {
        $(
            impl From<$t> for SqlValue {
                fn from(v: $t) -> Self {
                    SqlValue::$variant(<$target>::from(v))
                }
            }
        )+
    };
}

impl_from!(Int, i64, i8, i16, i32, i64);
impl_from!(UInt, u64, u8, u16, u32, u64);
impl_from!(Float, f64, f32, f64);
impl_from!(Bool, bool, bool);
impl_from!(Text, String, String, &str);
impl_from!(Bytes, Vec<u8>, Vec<u8>, &[u8]);

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

fn type_mismatch(expected: &SqlValue, actual: &SqlValue) -> (bool, bool, String) {
    (
        false,
        false,
        format!(
            "type mismatch: expected {}({expected}), got {}({actual}) - incompatible types",
            expected.kind(),
            actual.kind()
        ),
    )
}

/// Compare an expected value with a column value.
///
/// Returns `(equal, retryable, reason)`. Numbers compare across integer and
/// float kinds, text compares across text and bytes. Any other cross-kind
/// comparison is a non-retryable type mismatch.
pub fn equals_loose(expected: &SqlValue, actual: &SqlValue) -> (bool, bool, String) {
    match (expected, actual) {
        (SqlValue::Null, SqlValue::Null) => return (true, true, String::new()),
        (SqlValue::Null, _) => return (false, true, format!("expected NULL, got {actual}")),
        (_, SqlValue::Null) => return (false, true, "column is NULL yet".to_string()),
        _ => {}
    }

    let reason = || format!("expected {expected}, got {actual}");

    match (expected.to_number(), actual.to_number()) {
        (Some(e), Some(a)) => return (e == a, true, reason()),
        (Some(_), None) | (None, Some(_)) => return type_mismatch(expected, actual),
        (None, None) => {}
    }

    match (expected.to_text(), actual.to_text()) {
        (Some(e), Some(a)) => return (e == a, true, reason()),
        (Some(_), None) | (None, Some(_)) => return type_mismatch(expected, actual),
        (None, None) => {}
    }

    match (expected, actual) {
        (SqlValue::Bool(e), SqlValue::Bool(a)) => (e == a, true, reason()),
        _ => type_mismatch(expected, actual),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(SqlValue::from(5_i32), SqlValue::from(5_i64), true, true; "int widths")]
    #[test_case(SqlValue::from(5_u8), SqlValue::Float(5.0), true, true; "uint and float")]
    #[test_case(SqlValue::from(5_i64), SqlValue::from(6_i64), false, true; "different numbers")]
    #[test_case(SqlValue::from("a"), SqlValue::Bytes(b"a".to_vec()), true, true; "text and bytes")]
    #[test_case(SqlValue::from("a"), SqlValue::from("b"), false, true; "different text")]
    #[test_case(SqlValue::from(true), SqlValue::from(true), true, true; "bools")]
    #[test_case(SqlValue::from("5"), SqlValue::from(5_i64), false, false; "text vs number")]
    #[test_case(SqlValue::from(true), SqlValue::from(1_i64), false, false; "bool vs number")]
    #[test_case(SqlValue::Null, SqlValue::Null, true, true; "both null")]
    #[test_case(SqlValue::from(1_i64), SqlValue::Null, false, true; "null yet")]
    fn loose_equality(expected: SqlValue, actual: SqlValue, equal: bool, retryable: bool) {
        let (eq, retry, _) = equals_loose(&expected, &actual);
        assert_eq!((eq, retry), (equal, retryable));
    }

    #[test]
    fn mismatch_reason() {
        let (_, _, reason) = equals_loose(&SqlValue::from("5"), &SqlValue::from(5_i64));
        assert_eq!(
            reason,
            "type mismatch: expected Text(5), got Int(5) - incompatible types"
        );
        let (_, _, reason) = equals_loose(&SqlValue::from(1_i64), &SqlValue::Null);
        assert_eq!(reason, "column is NULL yet");
    }

    #[test]
    fn conversions() {
        assert_eq!(SqlValue::from(None::<i32>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".into()));
        assert_eq!(SqlValue::Int(1).to_bool(), Some(true));
        assert_eq!(SqlValue::UInt(0).to_bool(), Some(false));
        assert_eq!(SqlValue::Int(2).to_bool(), None);
        assert!(SqlValue::Text(" ".into()).is_empty());
        assert!(!SqlValue::Int(0).is_empty());
    }
}
