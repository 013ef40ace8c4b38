use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clickhouse_rs::Pool;

use super::{columns_for, table_for, BrowserRow, PageRow};
use crate::config::ClickHouseConfig;
use crate::queue::dimension::{BrowserDimension, DimensionRecord, EventKind, PageDimension};

/// Aggregate store on ClickHouse.
///
/// Tables use SummingMergeTree ordered by the full tuple, so a merge is a
/// plain INSERT and the engine folds rows with equal tuples. Reads group
/// and sum explicitly since folding happens in the background. Absent
/// values are stored as `''` and read back as null.
pub struct ClickHouseStore {
    cfg: ClickHouseConfig,
    pool: Pool,
    create_tables: bool,
}

impl ClickHouseStore {
    /// Creates the store. The pool connects lazily.
    pub fn new(cfg: ClickHouseConfig, create_tables: bool) -> Self {
        let pool = Pool::new(build_dsn(&cfg));
        Self {
            cfg,
            pool,
            create_tables,
        }
    }

    /// Verifies connectivity with a ping and creates tables if configured.
    pub async fn start(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        if self.create_tables {
            for kind in [EventKind::Page, EventKind::Browser] {
                handle
                    .execute(schema_sql(&self.cfg.database, kind).as_str())
                    .await
                    .with_context(|| format!("creating table {}", table_for(kind)))?;
            }
        }

        tracing::info!(endpoint = %self.cfg.endpoint, "ClickHouse aggregate store connected");

        Ok(())
    }

    /// One INSERT per kind. A failure on the browser insert leaves the
    /// page rows of the same batch in place.
    pub async fn merge(&self, date: NaiveDate, entries: &[(DimensionRecord, i64)]) -> Result<()> {
        for kind in [EventKind::Page, EventKind::Browser] {
            let Some(sql) = insert_sql(&self.cfg.database, kind, date, entries) else {
                continue;
            };

            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting handle for aggregate insert")?;

            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("inserting into {}", table_for(kind)))?;
        }

        Ok(())
    }

    pub async fn page_rows(&self, date: NaiveDate) -> Result<Vec<PageRow>> {
        let rows = self.read_rows(EventKind::Page, date).await?;

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
        let rows = self.read_rows(EventKind::Browser, date).await?;

        Ok(rows
            .into_iter()
            .map(|(fields, total)| BrowserRow {
                date,
                dimension: BrowserDimension::from_fields(fields),
                total,
            })
            .collect())
    }

    async fn read_rows(
        &self,
        kind: EventKind,
        date: NaiveDate,
    ) -> Result<Vec<(Vec<Option<String>>, i64)>> {
        let columns = columns_for(kind);
        let sql = select_sql(&self.cfg.database, kind, date);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for aggregate query")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {}", table_for(kind)))?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let mut fields = Vec::with_capacity(columns.len());
            for column in columns {
                let value: String = row
                    .get(*column)
                    .with_context(|| format!("reading column {column}"))?;
                fields.push((!value.is_empty()).then_some(value));
            }
            let total: i64 = row.get("views").context("reading views")?;
            out.push((fields, total));
        }

        Ok(out)
    }
}

/// Builds a clickhouse-rs compatible TCP DSN from configuration.
///
/// Format: `tcp://[user[:pass]@]host:port/database?options`
fn build_dsn(cfg: &ClickHouseConfig) -> String {
    let mut dsn = "tcp://".to_string();

    if !cfg.username.is_empty() {
        dsn.push_str(&cfg.username);
        if !cfg.password.is_empty() {
            dsn.push(':');
            dsn.push_str(&cfg.password);
        }
        dsn.push('@');
    }

    dsn.push_str(&cfg.endpoint);
    dsn.push('/');
    dsn.push_str(&cfg.database);
    dsn.push_str("?compression=lz4&pool_min=1&pool_max=4");

    dsn
}

fn schema_sql(database: &str, kind: EventKind) -> String {
    let columns = columns_for(kind);
    let mut sql = String::with_capacity(256);

    let _ = write!(
        sql,
        "CREATE TABLE IF NOT EXISTS {database}.{} (date Date",
        table_for(kind)
    );
    for column in columns {
        let _ = write!(sql, ", {column} String");
    }
    let _ = write!(
        sql,
        ", total Int64) ENGINE = SummingMergeTree(total) \
         PARTITION BY toYYYYMM(date) ORDER BY (date, {})",
        columns.join(", ")
    );

    sql
}

/// One multi-row INSERT for the entries of `kind`, or `None` if there are
/// none.
fn insert_sql(
    database: &str,
    kind: EventKind,
    date: NaiveDate,
    entries: &[(DimensionRecord, i64)],
) -> Option<String> {
    let mut batch = entries.iter().filter(|(r, _)| r.kind() == kind).peekable();
    batch.peek()?;

    let columns = columns_for(kind);
    let mut sql = String::with_capacity(128 + entries.len() * 96);
    let _ = write!(
        sql,
        "INSERT INTO {database}.{} (date, {}, total) VALUES ",
        table_for(kind),
        columns.join(", ")
    );

    for (idx, (record, count)) in batch.enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(sql, "('{date}'");
        for field in record.fields() {
            let _ = write!(sql, ", '{}'", escape_sql(field.unwrap_or_default()));
        }
        let _ = write!(sql, ", {count})");
    }

    Some(sql)
}

fn select_sql(database: &str, kind: EventKind, date: NaiveDate) -> String {
    let columns = columns_for(kind).join(", ");
    format!(
        "SELECT {columns}, toInt64(sum(total)) AS views FROM {database}.{} \
         WHERE date = toDate('{date}') GROUP BY {columns} ORDER BY views DESC",
        table_for(kind)
    )
}

fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
