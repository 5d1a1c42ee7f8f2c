use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::sql_guard::GuardedSql;

/// Table every uploaded dataset is materialised into.
pub const DATASET_TABLE: &str = "csv_data";

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub type Row = Map<String, Value>;

/// Ordered `(column, declared type)` pairs.
pub type Schema = Vec<(String, String)>;

/// Planning-only access to a query engine, used by the SQL guard.
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn explain(&self, sql: &str) -> Result<()>;
}

/// A dataset opened read-only for analysis.
///
/// Every statement runs on the blocking pool and is interrupted inside SQLite
/// once it outlives `query_timeout`, so a runaway query never pins an async
/// worker or the connection.
#[derive(Clone)]
pub struct DatasetEngine {
    conn: Arc<Mutex<Connection>>,
    query_timeout: Duration,
}

impl DatasetEngine {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Dataset file not found: {}", path.display()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub async fn schema(&self) -> Result<Schema> {
        let out = self
            .run_bounded(|db| {
                let mut stmt = db.prepare(&format!("PRAGMA table_info({})", DATASET_TABLE))?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        if out.is_empty() {
            return Err(anyhow!("Dataset has no '{}' table", DATASET_TABLE));
        }
        Ok(out)
    }

    pub async fn sample(&self, n: usize) -> Result<Vec<Row>> {
        self.query_rows(&format!("SELECT * FROM {}", DATASET_TABLE), n)
            .await
    }

    /// Run a guarded query, returning at most `limit` rows.
    pub async fn execute(&self, sql: &GuardedSql, limit: usize) -> Result<Vec<Row>> {
        self.query_rows(sql.as_str(), limit).await
    }

    async fn query_rows(&self, sql: &str, limit: usize) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        self.run_bounded(move |db| fetch_rows(db, &sql, limit))
            .await
    }

    /// Run `work` against the connection on the blocking pool. The budget
    /// starts once the connection is held. Dropping the returned future early
    /// interrupts the statement too.
    async fn run_bounded<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = self.conn.clone().lock_owned().await;
        let mut interrupt = InterruptOnDrop(Some(db.get_interrupt_handle()));
        let mut task = tokio::task::spawn_blocking(move || work(&db));

        match tokio::time::timeout(self.query_timeout, &mut task).await {
            Ok(joined) => {
                interrupt.disarm();
                joined.map_err(|e| anyhow!("Dataset worker failed: {}", e))?
            }
            Err(_) => {
                drop(interrupt);
                if let Err(e) = task.await {
                    warn!("Interrupted dataset worker failed: {}", e);
                }
                Err(anyhow!(
                    "Dataset query timed out after {} ms",
                    self.query_timeout.as_millis()
                ))
            }
        }
    }
}

/// Interrupts whatever the connection is running when dropped, unless disarmed.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

fn fetch_rows(db: &Connection, sql: &str, limit: usize) -> Result<Vec<Row>> {
    let mut stmt = db.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if out.len() >= limit {
            break;
        }
        let mut obj = Map::new();
        for (i, name) in columns.iter().enumerate() {
            obj.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        out.push(obj);
    }
    Ok(out)
}

#[async_trait]
impl QueryPlanner for DatasetEngine {
    async fn explain(&self, sql: &str) -> Result<()> {
        let sql = format!("EXPLAIN QUERY PLAN {}", sql);
        self.run_bounded(move |db| {
            let mut stmt = db.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while rows.next()?.is_some() {}
            Ok(())
        })
        .await
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// Write a small `csv_data` table to `path`. Test fixtures only.
#[cfg(test)]
pub(crate) fn write_test_dataset(path: &Path) {
    let conn = Connection::open(path).expect("open dataset");
    conn.execute_batch(
        "CREATE TABLE csv_data (region TEXT, product TEXT, sales REAL, order_date TEXT);
         INSERT INTO csv_data VALUES ('north', 'widget', 120.5, '2024-01-03');
         INSERT INTO csv_data VALUES ('south', 'widget', 80.0, '2024-02-11');
         INSERT INTO csv_data VALUES ('north', 'gadget', 42.25, '2024-02-19');
         INSERT INTO csv_data VALUES ('east', 'gizmo', 310.0, '2024-03-07');",
    )
    .expect("seed dataset");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (tempfile::TempDir, DatasetEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sales.db");
        write_test_dataset(&path);
        let engine = DatasetEngine::open(&path).expect("open engine");
        (dir, engine)
    }

    #[tokio::test]
    async fn schema_lists_columns_in_order() {
        let (_dir, engine) = engine();
        let schema = engine.schema().await.expect("schema");
        let names: Vec<&str> = schema.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["region", "product", "sales", "order_date"]);
        assert_eq!(schema[2].1, "REAL");
    }

    #[tokio::test]
    async fn execute_maps_rows_to_json_and_honours_limit() {
        let (_dir, engine) = engine();
        let sql = GuardedSql::from_stored(
            "SELECT region, SUM(sales) AS total FROM csv_data GROUP BY region ORDER BY region"
                .to_string(),
        );
        let rows = engine
            .execute(&sql, 2)
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["region"], "east");
        assert_eq!(rows[0]["total"], 310.0);
    }

    #[tokio::test]
    async fn explain_rejects_unknown_columns_without_running() {
        let (_dir, engine) = engine();
        assert!(engine.explain("SELECT region FROM csv_data").await.is_ok());
        assert!(engine.explain("SELECT nope FROM csv_data").await.is_err());
        assert!(engine.explain("SELEC region FROM csv_data").await.is_err());
    }

    #[tokio::test]
    async fn connection_is_read_only() {
        let (_dir, engine) = engine();
        let err = engine
            .query_rows("INSERT INTO csv_data VALUES ('x','y',1,'2024-01-01')", 1)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sample_returns_whole_rows() {
        let (_dir, engine) = engine();
        let rows = engine.sample(3).await.expect("sample");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 4);
    }

    const RUNAWAY_SQL: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
         SELECT COUNT(*) FROM c, csv_data";

    #[tokio::test]
    async fn runaway_query_is_interrupted_at_the_deadline() {
        let (_dir, engine) = engine();
        let engine = engine.with_query_timeout(Duration::from_millis(200));
        let sql = crate::core::sql_guard::guard(RUNAWAY_SQL, &engine, Duration::from_secs(2))
            .await
            .expect("lexically clean and plannable");

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), engine.execute(&sql, 500))
            .await
            .expect("execute must return once the budget is spent");
        let err = result.expect_err("runaway query must fail");
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));

        // The connection is released and usable again.
        let rows = engine.sample(1).await.expect("sample after interrupt");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_queries_do_not_block_the_runtime() {
        let (_dir, engine) = engine();
        let engine = engine.with_query_timeout(Duration::from_millis(300));
        let sql = GuardedSql::from_stored(RUNAWAY_SQL.to_string());
        let slow = tokio::spawn(async move { engine.execute(&sql, 10).await });

        // Timers keep firing while the query spins on the blocking pool.
        let ticked = tokio::time::timeout(
            Duration::from_millis(150),
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await;
        assert!(ticked.is_ok());
        assert!(slow.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn cancelled_caller_does_not_leave_the_query_running() {
        let (_dir, engine) = engine();
        let engine = engine.with_query_timeout(Duration::from_secs(30));
        let sql = GuardedSql::from_stored(RUNAWAY_SQL.to_string());

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), engine.execute(&sql, 10)).await;
        assert!(cancelled.is_err());

        // The interrupted statement releases the connection long before its own budget.
        let rows = tokio::time::timeout(Duration::from_secs(5), engine.sample(1))
            .await
            .expect("connection released after cancellation")
            .expect("sample");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = DatasetEngine::open(Path::new("/definitely/not/here.db"))
            .err()
            .expect("should fail");
        assert!(err.to_string().contains("not found"));
    }
}
