use anyhow::Error;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;

/// Redis-backed cache of resolved redirect links. Entirely optional: a
/// missing or unreachable cache degrades every call to a miss, and the
/// lookup endpoint keeps working without it.
#[derive(Clone)]
pub struct LinkCache {
    conn: redis::aio::ConnectionManager,
}

impl LinkCache {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;

        Ok(LinkCache { conn })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(err) => {
                warn!(message = "Cache read failed", key = %key, error = ?err);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        if let Err(err) = conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await {
            warn!(message = "Cache write failed", key = %key, error = ?err);
        }
    }
}
