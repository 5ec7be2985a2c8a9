//! Redis-backed L2 tier. All methods return `Result`; the tiered cache
//! converts failures into misses and counter bumps.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

#[derive(Clone)]
pub(crate) struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub(crate) async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub(crate) async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    pub(crate) async fn set_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl_secs: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl_secs).await
    }

    pub(crate) async fn del(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        conn.del(key).await
    }

    /// `KEYS`-based pattern delete. The discovery keyspace is small enough
    /// for KEYS; a SCAN loop is the upgrade path if that changes.
    pub(crate) async fn del_matching(&self, pattern: &str) -> Result<usize, redis::RedisError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len();
        let _: () = conn.del(keys).await?;
        Ok(count)
    }

    pub(crate) async fn count_matching(&self, pattern: &str) -> Result<usize, redis::RedisError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys.len())
    }
}
