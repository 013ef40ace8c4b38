use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

/// Counter buffer backed by Redis hashes.
///
/// The connection is established lazily on first use and dropped after
/// any command error, so a restarted server is picked up on the next
/// call without restarting the process.
pub struct RedisCounterStore {
    client: redis::Client,
    url: String,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl RedisCounterStore {
    /// Creates a store for `url`. No connection is made yet.
    pub fn new(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).with_context(|| format!("parsing redis url {url}"))?;

        Ok(Self {
            client,
            url: url.to_string(),
            conn: tokio::sync::Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| format!("connecting to redis at {}", self.url))?;
        tracing::debug!(url = %self.url, "redis connection established");
        *guard = Some(conn.clone());

        Ok(conn)
    }

    /// Forgets the cached connection after a failed command.
    async fn reset(&self) {
        self.conn.lock().await.take();
    }

    async fn checked<T>(&self, result: redis::RedisResult<T>, what: &'static str) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.reset().await;
                }
                Err(e).context(what)
            }
        }
    }

    /// HINCRBY.
    pub async fn increment(&self, name: &str, key: &str, amount: i64) -> Result<i64> {
        let mut conn = self.connection().await?;
        let result = conn.hincr(name, key, amount).await;
        self.checked(result, "redis HINCRBY").await
    }

    /// HLEN. Zero for a missing hash.
    pub async fn len(&self, name: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let result = conn.hlen(name).await;
        self.checked(result, "redis HLEN").await
    }

    /// EXISTS.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let result = conn.exists(name).await;
        self.checked(result, "redis EXISTS").await
    }

    /// RENAMENX. Returns false when `from` is missing or `to` is taken.
    pub async fn rename_nx(&self, from: &str, to: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<bool> = conn.rename_nx(from, to).await;
        match result {
            Ok(renamed) => Ok(renamed),
            // Source vanished between the length check and the rename,
            // another drain got there first.
            Err(e) if e.to_string().contains("no such key") => Ok(false),
            Err(e) => self.checked(Err(e), "redis RENAMENX").await,
        }
    }

    /// HSCAN one page.
    pub async fn scan(
        &self,
        name: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<(String, i64)>)> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<(u64, Vec<(String, i64)>)> = redis::cmd("HSCAN")
            .arg(name)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await;
        self.checked(result, "redis HSCAN").await
    }

    /// DEL. Returns whether the key existed.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<u64> = conn.del(name).await;
        self.checked(result, "redis DEL").await.map(|n| n > 0)
    }
}
