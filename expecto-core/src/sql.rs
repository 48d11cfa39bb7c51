//! # SQL DSL
//!
//! Runs a single-row query through a [`SqlClient`] and checks its columns.
//!
//! ```rust,ignore
//! sql::Query::new(&step, &db)
//!     .sql("SELECT id, status, deleted_at FROM orders WHERE id = $1", [42])
//!     .expect_column_equals("status", "PAID")
//!     .expect_column_is_null("deleted_at")
//!     .send()
//!     .await?;
//! ```
use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    check::CheckResult,
    config::AsyncConfig,
    context::Context,
    dsl::{execute_dsl, DslConfig},
    dsl_errors,
    expect::{
        add_expectation, assert_expectations, build_column_bool_expectation,
        build_column_empty_expectation, build_column_expectation, build_column_null_expectation,
        check_empty, check_equals, check_false, check_is_not_null, check_is_null, check_not_empty,
        check_not_equals, check_true, standard_report, value_getter, ColumnExpectationConfig,
        Expectation, ValueCheck,
    },
    mode::{get_step_mode, pick_asserter, StepMode},
    polling::{attach_if_async, final_failure_message},
    retry::{Executor, Outcome},
    step::StepCtx,
    typeconv::SqlValue,
    Error, Result,
};

const DSL: &str = "SQL";

pub const QUERY_ATTACHMENT: &str = "SQL Query";
pub const RESULT_ATTACHMENT: &str = "SQL Result";
pub const ERROR_ATTACHMENT: &str = "SQL Error";

/// One result row, columns in select order.
pub type Row = IndexMap<String, SqlValue>;

#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Run `sql` and return its first row, or [`Error::NoRows`].
    async fn query_row(&self, sql: &str, args: &[SqlValue]) -> Result<Row>;

    fn async_config(&self) -> AsyncConfig {
        AsyncConfig::default()
    }
}

/// Deserialize a row into a struct whose fields are named after the columns.
pub fn decode_row<T: DeserializeOwned>(row: &Row) -> Result<T> {
    Ok(serde_json::from_value(serde_json::to_value(row)?)?)
}

/// Table a query reads from, for step titles. Falls back to `"query"`.
pub fn extract_table_name(query: &str) -> String {
    let query = query.trim();
    if query
        .split_whitespace()
        .next()
        .is_some_and(|head| head.eq_ignore_ascii_case("WITH"))
    {
        if let Some(main) = main_statement_after_cte(query) {
            return extract_table_name(main);
        }
    }

    let tokens: Vec<&str> = query.split_whitespace().collect();
    let table = tokens.iter().enumerate().find_map(|(i, token)| {
        let keyword = token.to_ascii_uppercase();
        let next = tokens.get(i + 1)?;
        match keyword.as_str() {
            "FROM" | "INTO" => Some(*next),
            "UPDATE" if i == 0 => Some(*next),
            _ => None,
        }
    });
    table
        .map(clean_table_name)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "query".to_string())
}

/// The first top-level `SELECT` after a `WITH` clause.
fn main_statement_after_cte(query: &str) -> Option<&str> {
    let mut depth = 0i32;
    for (i, c) in query.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if depth == 0 && i > 0 => {
                let rest = &query[i..];
                if rest
                    .get(..6)
                    .is_some_and(|head| head.eq_ignore_ascii_case("SELECT"))
                {
                    return Some(rest);
                }
            }
            _ => {}
        }
    }
    None
}

fn clean_table_name(raw: &str) -> String {
    const QUOTES: &[char] = &['`', '\'', '"'];
    let mut name = raw.trim_matches(QUOTES);
    if let Some((_, table)) = name.rsplit_once('.') {
        name = table.trim_matches(QUOTES);
    }
    name.trim_end_matches([',', ';', '(', ')']).to_string()
}

fn render_query(sql: &str, args: &[SqlValue]) -> String {
    let mut out = format!("SQL Query:\n{sql}\n\nArguments:\n");
    if args.is_empty() {
        out.push_str("  (none)");
    }
    for (i, arg) in args.iter().enumerate() {
        out.push_str(&format!("  [{}] {arg}\n", i + 1));
    }
    out
}

fn column_getter() -> crate::expect::ValueGetter<Row> {
    value_getter(|row: &Row, column: &str| {
        row.get(column).cloned().ok_or_else(|| {
            Error::NotFound(format!("column '{column}' not found in result row"))
        })
    })
}

fn column_config(column: &str, name: String, check: ValueCheck) -> ColumnExpectationConfig<Row> {
    ColumnExpectationConfig {
        column: column.to_string(),
        name,
        get_value: column_getter(),
        is_no_rows: Some(Error::is_no_rows),
        check,
    }
}

pub struct Query<'c> {
    step: StepCtx,
    ctx: Context,
    client: &'c dyn SqlClient,
    async_config: AsyncConfig,
    sql: String,
    args: Vec<SqlValue>,
    expects_not_found: bool,
    pending: Option<Error>,
    sent: bool,
    expectations: Vec<Expectation<Row>>,
}

impl<'c> Query<'c> {
    pub fn new(step: &StepCtx, client: &'c dyn SqlClient) -> Query<'c> {
        Query {
            step: step.clone(),
            ctx: Context::background(),
            client,
            async_config: client.async_config(),
            sql: String::new(),
            args: Vec::new(),
            expects_not_found: false,
            pending: None,
            sent: false,
            expectations: Vec::new(),
        }
    }

    pub fn context(&mut self, ctx: Context) -> &mut Self {
        self.ctx = ctx;
        self
    }

    pub fn async_config(&mut self, cfg: AsyncConfig) -> &mut Self {
        self.async_config = cfg;
        self
    }

    pub fn sql<I, V>(&mut self, query: &str, args: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<SqlValue>,
    {
        self.sql = query.to_string();
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append one positional argument.
    pub fn arg(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.args.push(value.into());
        self
    }

    fn fail(&mut self, message: String) -> &mut Self {
        let e = self.step.break_now(message);
        self.pending.get_or_insert(e);
        self
    }

    fn push(&mut self, method: &str, exp: Expectation<Row>) -> &mut Self {
        if self.expects_not_found {
            return self.fail(dsl_errors::conflicting_expectations(
                DSL,
                method,
                "expect_not_found",
            ));
        }
        if let Err(e) = add_expectation(&self.step, self.sent, &mut self.expectations, exp, DSL) {
            self.pending.get_or_insert(e);
        }
        self
    }

    pub fn expect_found(&mut self) -> &mut Self {
        let name = "Expect: Found";
        self.push(
            "expect_found",
            Expectation::with_report(
                name,
                |err, _row: Option<&Row>| match err {
                    None => CheckResult::ok(),
                    Some(e) if e.is_no_rows() => CheckResult::retry(
                        "Expected query to return at least one row, but got no rows",
                    ),
                    Some(e) => CheckResult::fatal(format!("Query failed: {e}")),
                },
                standard_report(name),
            ),
        )
    }

    /// The query must return no rows. Excludes every other expectation.
    pub fn expect_not_found(&mut self) -> &mut Self {
        if !self.expectations.is_empty() {
            return self.fail(dsl_errors::conflicting_expectations(
                DSL,
                "expect_not_found",
                "other expectations",
            ));
        }
        let name = "Expect: Not Found";
        let exp = Expectation::with_report(
            name,
            |err: Option<&Error>, _row: Option<&Row>| match err {
                Some(e) if e.is_no_rows() => CheckResult::ok(),
                Some(e) => CheckResult::fatal(format!(
                    "Expected no rows, but got a different error: {e}"
                )),
                None => CheckResult::retry("Expected no rows, but query returned a row"),
            },
            standard_report(name),
        );
        if let Err(e) = add_expectation(&self.step, self.sent, &mut self.expectations, exp, DSL) {
            self.pending.get_or_insert(e);
        }
        self.expects_not_found = true;
        self
    }

    pub fn expect_column_equals(&mut self, column: &str, expected: impl Into<SqlValue>) -> &mut Self {
        let expected = expected.into();
        let cfg = column_config(
            column,
            format!("Expect: Column '{column}' = {expected}"),
            check_equals(expected),
        );
        self.push("expect_column_equals", build_column_expectation(cfg))
    }

    pub fn expect_column_not_equals(
        &mut self,
        column: &str,
        not_expected: impl Into<SqlValue>,
    ) -> &mut Self {
        let not_expected = not_expected.into();
        let cfg = column_config(
            column,
            format!("Expect: Column '{column}' != {not_expected}"),
            check_not_equals(not_expected),
        );
        self.push("expect_column_not_equals", build_column_expectation(cfg))
    }

    pub fn expect_column_not_empty(&mut self, column: &str) -> &mut Self {
        let cfg = column_config(
            column,
            format!("Expect: Column '{column}' not empty"),
            check_not_empty(),
        );
        self.push(
            "expect_column_not_empty",
            build_column_empty_expectation(cfg, false),
        )
    }

    pub fn expect_column_empty(&mut self, column: &str) -> &mut Self {
        let cfg = column_config(column, format!("Expect: Column '{column}' IS EMPTY"), check_empty());
        self.push("expect_column_empty", build_column_empty_expectation(cfg, true))
    }

    pub fn expect_column_is_null(&mut self, column: &str) -> &mut Self {
        let cfg = column_config(column, format!("Expect: Column '{column}' IS NULL"), check_is_null());
        self.push("expect_column_is_null", build_column_null_expectation(cfg, true))
    }

    pub fn expect_column_is_not_null(&mut self, column: &str) -> &mut Self {
        let cfg = column_config(
            column,
            format!("Expect: Column '{column}' IS NOT NULL"),
            check_is_not_null(),
        );
        self.push(
            "expect_column_is_not_null",
            build_column_null_expectation(cfg, false),
        )
    }

    pub fn expect_column_true(&mut self, column: &str) -> &mut Self {
        let cfg = column_config(column, format!("Expect: Column '{column}' = true"), check_true());
        self.push("expect_column_true", build_column_bool_expectation(cfg, true))
    }

    pub fn expect_column_false(&mut self, column: &str) -> &mut Self {
        let cfg = column_config(column, format!("Expect: Column '{column}' = false"), check_false());
        self.push("expect_column_false", build_column_bool_expectation(cfg, false))
    }

    fn validate(&self) -> Result<()> {
        if self.sql.trim().is_empty() {
            return Err(self.step.break_now(dsl_errors::not_set_with_hint(
                DSL,
                "SQL query",
                "Use .sql(\"SELECT ...\", args).",
            )));
        }
        Ok(())
    }

    /// Run the query, polling in async steps. `None` when it returned no rows.
    pub async fn send(&mut self) -> Result<Option<Row>> {
        if let Some(e) = self.pending.take() {
            return Err(e);
        }
        self.validate()?;
        self.sent = true;

        let name = format!("SELECT {}", extract_table_name(&self.sql));
        let this = &*self;
        self.step
            .with_new_step(name, |step| async move { this.exchange(step).await })
            .await
    }

    /// [`Query::send`] followed by [`decode_row`].
    pub async fn fetch<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.send().await? {
            Some(row) => Ok(Some(decode_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn exchange(&self, step: StepCtx) -> Result<Option<Row>> {
        step.attach_text(QUERY_ATTACHMENT, render_query(&self.sql, &self.args));

        let client = self.client;
        let (sql, args) = (self.sql.as_str(), self.args.as_slice());
        let executor: Executor<'_, Row> = Box::new(move |ctx: Context| {
            async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    res = client.query_row(sql, args) => Outcome::from(res),
                    _ = ctx.done() => Outcome::err(ctx.err().unwrap_or(Error::Cancelled)),
                };
                debug!(elapsed = ?started.elapsed(), "sql query finished");
                outcome
            }
            .boxed()
        });

        let cfg = DslConfig::new(self.ctx.clone(), step.clone(), self.async_config, executor)
            .expectations(&self.expectations)
            .nil_result_factory(|_| Row::new());
        let exec = execute_dsl(cfg).await?;
        attach_if_async(&step, &exec.summary)?;

        let row = match &exec.error {
            None => exec.value,
            Some(e) if e.is_no_rows() => {
                step.log("Query returned no rows");
                step.attach_json(RESULT_ATTACHMENT, &serde_json::json!({"status": "no rows found"}))?;
                None
            }
            Some(e) => {
                step.attach_json(ERROR_ATTACHMENT, &serde_json::json!({"error": e.to_string()}))?;
                None
            }
        };
        if let Some(row) = &row {
            step.attach_json(RESULT_ATTACHMENT, row)?;
        }

        let mode = get_step_mode(&step);
        assert_expectations(
            &step,
            &self.expectations,
            exec.error.as_ref(),
            row.as_ref(),
            |step, assertion, err| {
                let Some(e) = err else {
                    return Ok(());
                };
                let a = pick_asserter(step, assertion);
                if e.is_no_rows() {
                    if self.expects_not_found {
                        return Ok(());
                    }
                    let suffix = if mode == StepMode::Async && self.async_config.enabled {
                        " after retry"
                    } else {
                        ""
                    };
                    return a.no_error(
                        err,
                        format!(
                            "Expected row to exist, but got no rows{suffix}. Use expect_not_found() if 'not found' is expected"
                        ),
                    );
                }
                let msg = match mode {
                    StepMode::Async => final_failure_message(&exec.summary),
                    _ => "DB query failed".to_string(),
                };
                a.no_error(err, msg)
            },
        )?;

        Ok(row)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::BackoffConfig, step::Status};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };
    use test_case::test_case;

    /// Returns `row` from the `visible_after`-th query on, no rows before.
    struct FakeDb {
        row: Option<Row>,
        visible_after: u32,
        queries: AtomicU32,
        fail: Option<&'static str>,
    }

    impl FakeDb {
        fn with_row(row: Row) -> FakeDb {
            FakeDb {
                row: Some(row),
                visible_after: 1,
                queries: AtomicU32::new(0),
                fail: None,
            }
        }

        fn empty() -> FakeDb {
            FakeDb {
                row: None,
                ..FakeDb::with_row(Row::new())
            }
        }
    }

    #[async_trait]
    impl SqlClient for FakeDb {
        async fn query_row(&self, _sql: &str, _args: &[SqlValue]) -> Result<Row> {
            let n = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(msg) = self.fail {
                return Err(Error::Query(msg.to_string()));
            }
            match &self.row {
                Some(row) if n >= self.visible_after => Ok(row.clone()),
                _ => Err(Error::NoRows),
            }
        }
    }

    fn order_row() -> Row {
        IndexMap::from([
            ("id".to_string(), SqlValue::Int(42)),
            ("status".to_string(), SqlValue::Text("PAID".into())),
            ("paid".to_string(), SqlValue::Int(1)),
            ("note".to_string(), SqlValue::Text(String::new())),
            ("deleted_at".to_string(), SqlValue::Null),
        ])
    }

    fn fast_async() -> AsyncConfig {
        AsyncConfig {
            enabled: true,
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(10),
            backoff: BackoffConfig {
                enabled: false,
                ..Default::default()
            },
            jitter: 0.0,
        }
    }

    #[test_case("SELECT * FROM users WHERE id = 1", "users"; "simple select")]
    #[test_case("select id from `app`.`orders` o", "orders"; "quoted schema")]
    #[test_case("SELECT * FROM `beta-09_core`.game_category", "game_category"; "backticked schema")]
    #[test_case("SELECT * FROM users JOIN orders ON users.id = orders.user_id", "users"; "join")]
    #[test_case("WITH recent AS (SELECT * FROM orders) SELECT * FROM recent", "recent"; "cte")]
    #[test_case("INSERT INTO \"users\" (name) VALUES ('x')", "users"; "insert")]
    #[test_case("UPDATE database.users SET name = 'x'", "users"; "update")]
    #[test_case("SELECT * FROM users;", "users"; "trailing semicolon")]
    #[test_case("with recent as (select * from orders)\nselect * from recent", "recent"; "cte on new line")]
    #[test_case("WITHDRAWALS_SYNC INTO ledger SELECT * FROM accounts", "ledger"; "identifier starting with with")]
    #[test_case("SHOW TABLES", "query"; "fallback")]
    fn table_names(query: &str, expected: &str) {
        assert_eq!(extract_table_name(query), expected);
    }

    #[tokio::test]
    async fn sync_query_with_column_expectations() -> eyre::Result<()> {
        let db = FakeDb::with_row(order_row());
        let step = StepCtx::new("sql-sync");
        let row = Query::new(&step, &db)
            .sql("SELECT * FROM orders WHERE id = $1", [42])
            .expect_found()
            .expect_column_equals("id", 42)
            .expect_column_not_equals("status", "NEW")
            .expect_column_not_empty("status")
            .expect_column_empty("note")
            .expect_column_is_null("deleted_at")
            .expect_column_is_not_null("id")
            .expect_column_true("paid")
            .send()
            .await?;

        assert_eq!(row, Some(order_row()));
        let query = &step.snapshot().children[0];
        assert_eq!(query.name, "SELECT orders");
        assert_eq!(query.status, Status::Passed);
        assert_eq!(query.checks.len(), 8);
        let rendered = query
            .attachment(QUERY_ATTACHMENT)
            .map(|a| a.body.clone())
            .unwrap_or_default();
        assert_eq!(
            rendered,
            "SQL Query:\nSELECT * FROM orders WHERE id = $1\n\nArguments:\n  [1] 42\n"
        );
        assert!(query.attachment(RESULT_ATTACHMENT).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn no_rows_without_expectations_fails() {
        let db = FakeDb::empty();
        let step = StepCtx::new("sql-no-rows");
        let res = Query::new(&step, &db)
            .sql("SELECT * FROM users WHERE id = $1", [7])
            .send()
            .await;

        assert!(matches!(res, Err(Error::AssertionFailed(_))));
        let query = &step.snapshot().children[0];
        assert!(query.logs.iter().any(|l| l.contains("Query returned no rows")));
        assert_eq!(
            query.checks[0].message,
            "Expected row to exist, but got no rows. Use expect_not_found() if 'not found' is expected: no rows in result set"
        );
    }

    #[tokio::test]
    async fn expect_not_found_passes_on_no_rows() -> eyre::Result<()> {
        let db = FakeDb::empty();
        let step = StepCtx::new("sql-not-found");
        let row = Query::new(&step, &db)
            .sql("SELECT * FROM users WHERE id = $1", [7])
            .expect_not_found()
            .send()
            .await?;

        assert_eq!(row, None);
        assert_eq!(step.snapshot().children[0].status, Status::Passed);
        Ok(())
    }

    #[test]
    fn not_found_conflicts_with_column_expectations() {
        let db = FakeDb::empty();
        let step = StepCtx::new("sql-conflict");
        Query::new(&step, &db)
            .sql("SELECT 1", Vec::<SqlValue>::new())
            .expect_not_found()
            .expect_column_equals("id", 1);

        assert_eq!(step.status(), Status::Broken);
        assert_eq!(
            step.snapshot().checks[0].message,
            "SQL DSL Error: expect_column_equals cannot be used with expect_not_found"
        );
    }

    #[tokio::test]
    async fn async_query_waits_for_row() -> eyre::Result<()> {
        let db = FakeDb {
            visible_after: 3,
            ..FakeDb::with_row(order_row())
        };
        let step = StepCtx::new("sql-async").async_mode();
        let row = Query::new(&step, &db)
            .sql("SELECT * FROM orders WHERE id = $1", [42])
            .async_config(fast_async())
            .expect_column_equals("status", "PAID")
            .send()
            .await?;

        assert!(row.is_some());
        assert_eq!(db.queries.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn query_error_is_reported() {
        let db = FakeDb {
            fail: Some("relation \"orders\" does not exist"),
            ..FakeDb::with_row(order_row())
        };
        let step = StepCtx::new("sql-error");
        let res = Query::new(&step, &db)
            .sql("SELECT * FROM orders", Vec::<SqlValue>::new())
            .send()
            .await;

        assert!(res.is_err());
        let query = &step.snapshot().children[0];
        assert!(query.attachment(ERROR_ATTACHMENT).is_some());
        assert_eq!(
            query.checks[0].message,
            "DB query failed: query failed: relation \"orders\" does not exist"
        );
    }

    #[tokio::test]
    async fn column_mismatch_after_row_found() {
        let db = FakeDb::with_row(order_row());
        let step = StepCtx::new("sql-mismatch");
        let res = Query::new(&step, &db)
            .sql("SELECT * FROM orders", Vec::<SqlValue>::new())
            .expect_column_false("paid")
            .send()
            .await;

        assert!(res.is_err());
        assert_eq!(
            step.snapshot().children[0].checks[0].message,
            "[Expect: Column 'paid' = false] Expected column 'paid' to be false, but got true"
        );
    }

    #[tokio::test]
    async fn fetch_decodes_row() -> eyre::Result<()> {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Order {
            id: i64,
            status: String,
            deleted_at: Option<String>,
        }

        let db = FakeDb::with_row(order_row());
        let step = StepCtx::new("sql-fetch");
        let order: Option<Order> = Query::new(&step, &db)
            .sql("SELECT * FROM orders", Vec::<SqlValue>::new())
            .fetch()
            .await?;

        assert_eq!(
            order,
            Some(Order {
                id: 42,
                status: "PAID".into(),
                deleted_at: None
            })
        );
        Ok(())
    }
}
