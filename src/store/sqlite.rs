use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};

use super::{columns_for, table_for, BrowserRow, PageRow};
use crate::queue::dimension::{BrowserDimension, DimensionRecord, EventKind, PageDimension};

const IN_MEMORY: &str = ":memory:";

/// Aggregate store on a local SQLite database.
///
/// rusqlite is blocking, so every call runs on the blocking pool with the
/// connection behind a mutex. Merges use an IMMEDIATE transaction so a
/// batch is applied entirely or not at all.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    create_tables: bool,
}

impl SqliteStore {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: &Path, create_tables: bool) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite database {}", path.display()))?;

        if path.as_os_str() != IN_MEMORY {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )
            .context("configuring sqlite journal")?;
        }
        conn.busy_timeout(Duration::from_secs(5))
            .context("setting sqlite busy timeout")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            create_tables,
        })
    }

    /// Private in-memory database with table creation enabled.
    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(IN_MEMORY), true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
        .with_context(|| format!("sqlite {what} task failed"))?
        .with_context(|| format!("sqlite {what}"))
    }

    pub async fn start(&self) -> Result<()> {
        if !self.create_tables {
            return self
                .run("ping", |conn| {
                    conn.query_row("SELECT 1", [], |_| Ok(()))?;
                    Ok(())
                })
                .await;
        }

        self.run("schema", |conn| {
            for kind in [EventKind::Page, EventKind::Browser] {
                conn.execute_batch(&schema_sql(kind))
                    .with_context(|| format!("creating table {}", table_for(kind)))?;
            }
            Ok(())
        })
        .await?;

        tracing::info!(path = %self.path.display(), "sqlite aggregate store ready");

        Ok(())
    }

    pub async fn merge(&self, date: NaiveDate, entries: Vec<(DimensionRecord, i64)>) -> Result<()> {
        self.run("merge", move |conn| merge_batch(conn, date, &entries))
            .await
    }

    pub async fn page_rows(&self, date: NaiveDate) -> Result<Vec<PageRow>> {
        let rows = self
            .run("page rows", move |conn| read_rows(conn, EventKind::Page, date))
            .await?;

        Ok(rows
            .into_iter()
            .map(|(fields, total)| PageRow {
                date,
                dimension: PageDimension::from_fields(fields),
                total,
            })
            .collect())
    }

    pub async fn browser_rows(&self, date: NaiveDate) -> Result<Vec<BrowserRow>> {
        let rows = self
            .run("browser rows", move |conn| {
                read_rows(conn, EventKind::Browser, date)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(fields, total)| BrowserRow {
                date,
                dimension: BrowserDimension::from_fields(fields),
                total,
            })
            .collect())
    }

    /// Runs raw SQL against the database.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
        self.run("execute", move |conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
        .await
    }
}

/// Table plus a unique index that treats null and empty as the same value,
/// so at most one row exists per (date, tuple).
fn schema_sql(kind: EventKind) -> String {
    let table = table_for(kind);
    let columns = columns_for(kind);

    let column_defs = columns
        .iter()
        .map(|c| format!("{c} TEXT"))
        .collect::<Vec<_>>()
        .join(",\n    ");
    let index_exprs = columns
        .iter()
        .map(|c| format!("IFNULL({c}, '')"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY,
    date TEXT NOT NULL,
    {column_defs},
    total INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE UNIQUE INDEX IF NOT EXISTS {table}_tuple ON {table} (date, {index_exprs});"
    )
}

/// Parameters: ?1 count, ?2 date, ?3.. tuple fields.
fn update_sql(kind: EventKind) -> String {
    let predicates = columns_for(kind)
        .iter()
        .enumerate()
        .map(|(idx, c)| format!("{c} IS ?{}", idx + 3))
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "UPDATE {} SET total = total + ?1, updated_at = CURRENT_TIMESTAMP \
         WHERE date = ?2 AND {predicates}",
        table_for(kind)
    )
}

/// Same parameters as [`update_sql`].
fn insert_sql(kind: EventKind) -> String {
    let columns = columns_for(kind);
    let placeholders = (0..columns.len())
        .map(|idx| format!("?{}", idx + 3))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} (date, {}, total) VALUES (?2, {placeholders}, ?1)",
        table_for(kind),
        columns.join(", ")
    )
}

fn bind(date: &str, record: &DimensionRecord, count: i64) -> Vec<Value> {
    let mut params = Vec::with_capacity(record.kind().arity() + 2);
    params.push(Value::Integer(count));
    params.push(Value::Text(date.to_string()));
    params.extend(record.fields().into_iter().map(|field| match field {
        Some(v) => Value::Text(v.to_string()),
        None => Value::Null,
    }));
    params
}

fn merge_batch(
    conn: &mut Connection,
    date: NaiveDate,
    entries: &[(DimensionRecord, i64)],
) -> Result<()> {
    let date = date.to_string();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("beginning merge transaction")?;

    for kind in [EventKind::Page, EventKind::Browser] {
        let mut batch = entries.iter().filter(|(r, _)| r.kind() == kind).peekable();
        if batch.peek().is_none() {
            continue;
        }

        let mut update = tx
            .prepare_cached(&update_sql(kind))
            .with_context(|| format!("preparing update on {}", table_for(kind)))?;
        let mut insert = tx
            .prepare_cached(&insert_sql(kind))
            .with_context(|| format!("preparing insert on {}", table_for(kind)))?;

        for (record, count) in batch {
            let params = bind(&date, record, *count);
            if update.execute(params_from_iter(params.iter()))? == 0 {
                insert.execute(params_from_iter(params.iter()))?;
            }
        }
    }

    tx.commit().context("committing merge")?;

    Ok(())
}

fn read_rows(
    conn: &mut Connection,
    kind: EventKind,
    date: NaiveDate,
) -> Result<Vec<(Vec<Option<String>>, i64)>> {
    let columns = columns_for(kind);
    let sql = format!(
        "SELECT {}, total FROM {} WHERE date = ?1 ORDER BY total DESC, id",
        columns.join(", "),
        table_for(kind)
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([date.to_string()], |row| {
            let mut fields = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                fields.push(row.get::<_, Option<String>>(idx)?);
            }
            Ok((fields, row.get::<_, i64>(columns.len())?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}
