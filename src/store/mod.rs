//! Durable per-day aggregate rows.
//!
//! One row exists per (date, full dimension tuple). Merging a count into
//! a tuple either increments the existing row or creates it.

pub mod clickhouse;
pub mod sqlite;

use anyhow::Result;
use chrono::NaiveDate;

use self::clickhouse::ClickHouseStore;
use self::sqlite::SqliteStore;
use crate::config::{StoreBackendKind, StoreConfig};
use crate::queue::dimension::{BrowserDimension, DimensionRecord, EventKind, PageDimension};

/// Page view table.
pub const PAGE_TABLE: &str = "views_per_day";

/// Browser identity table.
pub const BROWSER_TABLE: &str = "browsers_per_day";

/// Dimension columns of [`PAGE_TABLE`], in tuple order.
pub const PAGE_COLUMNS: [&str; PageDimension::ARITY] = [
    "site",
    "page",
    "referrer_host",
    "referrer_path",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// Dimension columns of [`BROWSER_TABLE`], in tuple order.
pub const BROWSER_COLUMNS: [&str; BrowserDimension::ARITY] = ["site", "name", "version"];

/// Table name for an event kind.
pub fn table_for(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Page => PAGE_TABLE,
        EventKind::Browser => BROWSER_TABLE,
    }
}

/// Dimension columns for an event kind.
pub fn columns_for(kind: EventKind) -> &'static [&'static str] {
    match kind {
        EventKind::Page => &PAGE_COLUMNS,
        EventKind::Browser => &BROWSER_COLUMNS,
    }
}

/// Persisted page view row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub date: NaiveDate,
    pub dimension: PageDimension,
    pub total: i64,
}

/// Persisted browser identity row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserRow {
    pub date: NaiveDate,
    pub dimension: BrowserDimension,
    pub total: i64,
}

/// Persistent aggregate store, dispatched by backend.
pub enum AggregateStore {
    Sqlite(SqliteStore),
    ClickHouse(ClickHouseStore),
}

impl AggregateStore {
    /// Builds the configured backend. Call [`Self::start`] before use.
    pub fn from_config(cfg: &StoreConfig) -> Result<Self> {
        match cfg.backend {
            StoreBackendKind::Sqlite => Ok(Self::Sqlite(SqliteStore::open(
                &cfg.sqlite.path,
                cfg.create_tables,
            )?)),
            StoreBackendKind::ClickHouse => Ok(Self::ClickHouse(ClickHouseStore::new(
                cfg.clickhouse.clone(),
                cfg.create_tables,
            ))),
        }
    }

    /// Label used in logs and metrics.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::ClickHouse(_) => "clickhouse",
        }
    }

    /// Verifies connectivity and creates tables when configured to.
    pub async fn start(&self) -> Result<()> {
        match self {
            Self::Sqlite(store) => store.start().await,
            Self::ClickHouse(store) => store.start().await,
        }
    }

    /// Adds every count to the row for (`date`, tuple), creating rows as
    /// needed.
    ///
    /// SQLite applies the whole batch in one transaction. ClickHouse sends
    /// one INSERT per event kind, so a mixed batch is atomic per kind only.
    pub async fn merge(&self, date: NaiveDate, entries: &[(DimensionRecord, i64)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let entries: Vec<(DimensionRecord, i64)> = entries
            .iter()
            .map(|(record, count)| (record.normalized(), *count))
            .collect();

        match self {
            Self::Sqlite(store) => store.merge(date, entries).await,
            Self::ClickHouse(store) => store.merge(date, &entries).await,
        }
    }

    /// Page rows for `date`, highest total first.
    pub async fn page_rows(&self, date: NaiveDate) -> Result<Vec<PageRow>> {
        match self {
            Self::Sqlite(store) => store.page_rows(date).await,
            Self::ClickHouse(store) => store.page_rows(date).await,
        }
    }

    /// Browser rows for `date`, highest total first.
    pub async fn browser_rows(&self, date: NaiveDate) -> Result<Vec<BrowserRow>> {
        match self {
            Self::Sqlite(store) => store.browser_rows(date).await,
            Self::ClickHouse(store) => store.browser_rows(date).await,
        }
    }
}
