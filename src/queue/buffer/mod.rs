pub mod memory;
pub mod redis;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;

use self::memory::MemoryCounterStore;
use self::redis::RedisCounterStore;
use crate::config::{BufferBackendKind, BufferConfig};

/// Redis address used when neither config nor environment names one.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost";

/// Environment variables consulted, in order, for the Redis address.
pub const REDIS_URL_ENV: [&str; 2] = ["VIEWTALLY_REDIS_URL", "REDIS_URL"];

/// Suffix of the table an unfinished drain is handed back to. Claimed
/// drains live under `{queue}:draining:{token}`.
pub const DRAINING_SUFFIX: &str = ":draining";

/// Storage backend behind a [`CounterBuffer`].
///
/// Uses enum dispatch rather than trait objects, matching the async
/// inherent methods on each backend.
pub enum BufferBackend {
    Memory(MemoryCounterStore),
    Redis(RedisCounterStore),
}

impl BufferBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }
}

/// Reference to a buffer that has been renamed away from its live name.
///
/// Every handle owns a private claim name, `{queue}:draining:{token}`, so
/// only the flush holding the handle reads or discards the table.
#[derive(Debug, PartialEq, Eq)]
pub struct DrainHandle {
    queue: String,
    name: String,
}

impl DrainHandle {
    fn claim(queue: &str) -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);

        let token = format!(
            "{}-{:x}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            queue: queue.to_string(),
            name: format!("{}:{token}", draining_name(queue)),
        }
    }

    /// Live queue name this table was drained from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current name of the drained table.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One page of drained entries.
#[derive(Debug, Default)]
pub struct ScanPage {
    /// Cursor for the next page, 0 when iteration is complete.
    pub cursor: u64,
    pub entries: Vec<(String, i64)>,
}

/// Shared counter buffer keyed by encoded dimension tuples.
///
/// Every backend call is bounded by `timeout`; an elapsed timeout is
/// reported as an error like any other transient store failure.
pub struct CounterBuffer {
    backend: BufferBackend,
    timeout: Duration,
}

impl CounterBuffer {
    pub fn new(backend: BufferBackend, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// In-process buffer, for single-process deployments and tests.
    pub fn memory() -> Self {
        Self::new(
            BufferBackend::Memory(MemoryCounterStore::new()),
            Duration::from_secs(2),
        )
    }

    /// Builds the configured backend. Redis connects lazily on first use.
    pub fn from_config(cfg: &BufferConfig) -> Result<Self> {
        let backend = match cfg.backend {
            BufferBackendKind::Memory => BufferBackend::Memory(MemoryCounterStore::new()),
            BufferBackendKind::Redis => {
                let url = resolve_redis_url(cfg.redis_url.as_deref(), |var| {
                    std::env::var(var).ok()
                });
                tracing::info!(url = %url, "using redis counter buffer");
                BufferBackend::Redis(RedisCounterStore::new(&url)?)
            }
        };

        Ok(Self::new(backend, cfg.timeout))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "{} buffer {op} timed out after {:?}",
                self.backend.name(),
                self.timeout
            )),
        }
    }

    /// Atomically adds `amount` to `key` in `queue`, creating it at
    /// `amount` when absent.
    pub async fn increment(&self, queue: &str, key: &str, amount: i64) -> Result<()> {
        match &self.backend {
            BufferBackend::Memory(store) => {
                store.increment(queue, key, amount);
                Ok(())
            }
            BufferBackend::Redis(store) => self
                .bounded("increment", store.increment(queue, key, amount))
                .await
                .map(|_| ()),
        }
    }

    /// Number of entries buffered under `name`.
    pub async fn len(&self, name: &str) -> Result<u64> {
        match &self.backend {
            BufferBackend::Memory(store) => Ok(store.len(name)),
            BufferBackend::Redis(store) => self.bounded("len", store.len(name)).await,
        }
    }

    async fn rename_nx(&self, op: &'static str, from: &str, to: &str) -> Result<bool> {
        match &self.backend {
            BufferBackend::Memory(store) => Ok(store.rename_nx(from, to)),
            BufferBackend::Redis(store) => self.bounded(op, store.rename_nx(from, to)).await,
        }
    }

    /// Hands the live buffer off to a freshly claimed name.
    ///
    /// Returns `None` when the queue is empty, or when a concurrent drain
    /// renamed it first. Writers arriving after the rename start a fresh
    /// live buffer.
    pub async fn drain(&self, queue: &str) -> Result<Option<DrainHandle>> {
        if self.len(queue).await? == 0 {
            return Ok(None);
        }

        let handle = DrainHandle::claim(queue);
        let claimed = self.rename_nx("drain", queue, handle.name()).await?;

        Ok(claimed.then_some(handle))
    }

    /// Claims the drain an unfinished flush handed back with
    /// [`Self::release`].
    ///
    /// The claim is a rename, so of several flushes racing for the same
    /// leftover exactly one gets it.
    pub async fn reclaim(&self, queue: &str) -> Result<Option<DrainHandle>> {
        let handle = DrainHandle::claim(queue);
        let claimed = self
            .rename_nx("reclaim", &draining_name(queue), handle.name())
            .await?;

        Ok(claimed.then_some(handle))
    }

    /// Hands a claimed drain back for a later [`Self::reclaim`].
    ///
    /// Returns false when an earlier handed-back drain is still waiting;
    /// the caller keeps its claim then.
    pub async fn release(&self, handle: &DrainHandle) -> Result<bool> {
        self.rename_nx("release", handle.name(), &draining_name(handle.queue()))
            .await
    }

    /// Whether a handed-back drain is waiting for `queue`.
    pub async fn has_leftover(&self, queue: &str) -> Result<bool> {
        let name = draining_name(queue);
        match &self.backend {
            BufferBackend::Memory(store) => Ok(store.exists(&name)),
            BufferBackend::Redis(store) => self.bounded("exists", store.exists(&name)).await,
        }
    }

    /// Reads one page of a drained table.
    pub async fn scan(&self, handle: &DrainHandle, cursor: u64, count: usize) -> Result<ScanPage> {
        let (cursor, entries) = match &self.backend {
            BufferBackend::Memory(store) => store.scan(handle.name(), cursor, count),
            BufferBackend::Redis(store) => {
                self.bounded("scan", store.scan(handle.name(), cursor, count))
                    .await?
            }
        };

        Ok(ScanPage { cursor, entries })
    }

    /// Deletes a drained table. Call only once every entry is persisted.
    pub async fn discard(&self, handle: &DrainHandle) -> Result<()> {
        match &self.backend {
            BufferBackend::Memory(store) => {
                store.delete(handle.name());
            }
            BufferBackend::Redis(store) => {
                self.bounded("discard", store.delete(handle.name())).await?;
            }
        }
        Ok(())
    }
}

/// Name an unfinished drain of `queue` is handed back to.
pub fn draining_name(queue: &str) -> String {
    format!("{queue}{DRAINING_SUFFIX}")
}

/// Picks the Redis address: configured value first, then the
/// environment chain, then [`DEFAULT_REDIS_URL`]. Blank values are skipped.
pub fn resolve_redis_url(
    configured: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    configured
        .map(str::to_string)
        .into_iter()
        .chain(REDIS_URL_ENV.iter().filter_map(|var| lookup(*var)))
        .find(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string())
}
