use crate::PendingImage;
use anyhow::Error;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::debug;

/// External store of pending-image records.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Atomically select up to `max` pending records, mark them caching
    /// and return them. Fails as a unit: on error nothing is claimed.
    async fn claim(&self, max: i64) -> Result<Vec<PendingImage>, Error>;

    /// Remove all records with the given ids in one statement.
    async fn bulk_delete(&self, ids: &[i64]) -> Result<(), Error>;

    /// Look up a record by its packed name.
    async fn find_by_name(&self, name: &str) -> Result<Option<PendingImage>, Error>;
}

#[derive(Clone)]
pub struct PgWorkQueue {
    pool: Arc<PgPool>,
}

impl PgWorkQueue {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgWorkQueue {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn claim(&self, max: i64) -> Result<Vec<PendingImage>, Error> {
        debug!("Claiming up to {} pending images", max);
        Ok(sqlx::query_as::<_, PendingImage>(
            "UPDATE cache_pending_images \
                SET status = 'caching' \
            WHERE id IN ( \
                SELECT id FROM cache_pending_images \
                WHERE status = 'pending' \
                ORDER BY created_at ASC \
                LIMIT $1 \
                FOR UPDATE SKIP LOCKED \
            ) \
            RETURNING id, name, url, status, created_at",
        )
        .bind(max)
        .fetch_all(&*self.pool)
        .await?)
    }

    async fn bulk_delete(&self, ids: &[i64]) -> Result<(), Error> {
        debug!("Deleting {} completed records", ids.len());
        sqlx::query("DELETE FROM cache_pending_images WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<PendingImage>, Error> {
        Ok(sqlx::query_as::<_, PendingImage>(
            "SELECT id, name, url, status, created_at \
            FROM cache_pending_images \
            WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?)
    }
}
