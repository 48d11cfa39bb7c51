//! Diagnostics for DSL misuse. Every message is prefixed with the DSL name,
//! e.g. `"HTTP DSL Error: ..."`.

pub fn nil_client(dsl: &str, client: &str) -> String {
    format!("{dsl} DSL Error: {client} is nil. Check test configuration.")
}

pub fn not_set(dsl: &str, field: &str) -> String {
    format!("{dsl} DSL Error: {field} is not set.")
}

pub fn not_set_with_hint(dsl: &str, field: &str, hint: &str) -> String {
    format!("{} {hint}", not_set(dsl, field))
}

pub fn custom(dsl: &str, message: &str) -> String {
    format!("{dsl} DSL Error: {message}")
}

pub fn expectations_after_send(dsl: &str) -> String {
    format!("{dsl} DSL Error: Expectations must be added before Send().")
}

pub fn method_after_send(dsl: &str, method: &str) -> String {
    format!("{dsl} DSL Error: {method} must be called before Send()")
}

pub fn conflicting_expectations(dsl: &str, method: &str, conflicts_with: &str) -> String {
    format!("{dsl} DSL Error: {method} cannot be used with {conflicts_with}")
}
