//! Two-layer safety check for generated SQL.
//!
//! Layer one is a case-insensitive lexical denylist. Layer two asks the query
//! engine to plan the statement without running it. Only text that clears both
//! layers is wrapped in [`GuardedSql`], which is the only form widget storage and
//! query execution accept.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::core::dataset::QueryPlanner;

/// Plain substring matches. These fire anywhere in the statement, even inside
/// identifiers, so a column named `updated_at` is rejected along with `UPDATE`.
const DENYLIST: &[&str] = &[";", "--", "/*", "DROP", "DELETE", "INSERT", "UPDATE", "ALTER"];

/// Whole-word matches for engine-specific statements that are unsafe on SQLite.
static KEYWORD_DENYLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(ATTACH|DETACH|PRAGMA|VACUUM|CREATE|TRUNCATE|GRANT|REINDEX)\b")
        .expect("denylist regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("SQL guard rejected query: contains forbidden token '{0}'")]
    ForbiddenToken(String),
    #[error("SQL guard rejected query: only SELECT statements are allowed")]
    NotReadOnly,
    #[error("SQL guard rejected query: invalid query ({0})")]
    Invalid(String),
}

/// A statement that passed both guard layers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct GuardedSql(String);

impl GuardedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Re-wrap a query read back from widget storage. Storage only ever
    /// receives `GuardedSql`, so the text already passed the guard.
    pub(crate) fn from_stored(sql: String) -> Self {
        Self(sql)
    }
}

/// Lexical layer only.
pub fn check_lexical(sql: &str) -> Result<(), GuardRejection> {
    let upper = sql.to_ascii_uppercase();
    if let Some(token) = DENYLIST.iter().find(|t| upper.contains(*t)) {
        return Err(GuardRejection::ForbiddenToken(token.to_string()));
    }
    if let Some(m) = KEYWORD_DENYLIST.find(sql) {
        return Err(GuardRejection::ForbiddenToken(m.as_str().to_ascii_uppercase()));
    }
    let head = upper.trim_start();
    if !(head.starts_with("SELECT") || head.starts_with("WITH")) {
        return Err(GuardRejection::NotReadOnly);
    }
    Ok(())
}

/// Run both layers. Never cached: every new query text is checked afresh.
pub async fn guard(
    sql: &str,
    planner: &dyn QueryPlanner,
    timeout: Duration,
) -> Result<GuardedSql, GuardRejection> {
    check_lexical(sql)?;
    match tokio::time::timeout(timeout, planner.explain(sql)).await {
        Ok(Ok(())) => Ok(GuardedSql(sql.to_string())),
        Ok(Err(e)) => Err(GuardRejection::Invalid(e.to_string())),
        Err(_) => Err(GuardRejection::Invalid("planning timed out".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlanner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl QueryPlanner for CountingPlanner {
        async fn explain(&self, _sql: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("no such column: nope"))
            } else {
                Ok(())
            }
        }
    }

    fn planner(fail: bool) -> CountingPlanner {
        CountingPlanner {
            calls: AtomicUsize::new(0),
            fail,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn every_denylisted_token_is_rejected_before_planning() {
        let p = planner(false);
        let cases = [
            "SELECT * FROM csv_data; DROP TABLE x",
            "select 1 from csv_data where 1=1 -- comment",
            "SELECT /* hi */ 1 FROM csv_data",
            "SELECT * FROM csv_data WHERE x IN (SELECT 1) drop table y",
            "delete from csv_data",
            "SELECT 1 FROM csv_data UNION INSERT INTO t VALUES (1)",
            "SELECT updated_at FROM csv_data",
            "SELECT * FROM csv_data ALTER",
        ];
        for sql in cases {
            let err = guard(sql, &p, TIMEOUT).await.expect_err(sql);
            assert!(
                matches!(err, GuardRejection::ForbiddenToken(_)),
                "{sql}: {err:?}"
            );
        }
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejection_names_the_offending_token() {
        let err = check_lexical("SELECT * FROM csv_data; drop table x").unwrap_err();
        assert_eq!(err, GuardRejection::ForbiddenToken(";".to_string()));
        let err = check_lexical("SELECT * FROM csv_data WHERE a IN (DELETE)").unwrap_err();
        assert!(err.to_string().contains("DELETE"));
    }

    #[test]
    fn engine_specific_keywords_match_whole_words_only() {
        assert!(check_lexical("PRAGMA table_info(csv_data)").is_err());
        assert!(check_lexical("SELECT 1 FROM csv_data; ATTACH 'x' AS y").is_err());
        assert!(check_lexical("SELECT created_at FROM csv_data").is_ok());
        // String literals are not exempt.
        assert_eq!(
            check_lexical("SELECT * FROM csv_data WHERE note = 'create'"),
            Err(GuardRejection::ForbiddenToken("CREATE".to_string()))
        );
    }

    #[test]
    fn non_select_statements_are_rejected() {
        assert_eq!(
            check_lexical("REPLACE INTO csv_data VALUES (1)"),
            Err(GuardRejection::NotReadOnly)
        );
        assert!(check_lexical("  with t as (select 1 as a) select a from t").is_ok());
    }

    #[tokio::test]
    async fn valid_select_is_returned_unchanged() {
        let p = planner(false);
        let sql = "SELECT region, SUM(sales) AS total FROM csv_data GROUP BY region";
        let guarded = guard(sql, &p, TIMEOUT).await.expect("accepted");
        assert_eq!(guarded.as_str(), sql);
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn planning_failure_is_an_invalid_query() {
        let p = planner(true);
        let err = guard("SELECT nope FROM csv_data", &p, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardRejection::Invalid(ref m) if m.contains("no such column")));
    }

    #[tokio::test]
    async fn guard_plans_against_a_real_dataset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("d.db");
        crate::core::dataset::write_test_dataset(&path);
        let engine = crate::core::dataset::DatasetEngine::open(&path).expect("engine");
        assert!(guard("SELECT SUM(sales) FROM csv_data", &engine, TIMEOUT).await.is_ok());
        assert!(matches!(
            guard("SELECT SUM(revenue) FROM csv_data", &engine, TIMEOUT).await,
            Err(GuardRejection::Invalid(_))
        ));
    }
}
