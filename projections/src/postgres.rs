//! `PostgreSQL` storage for projection rows and cursors.
//!
//! # Overview
//!
//! One [`PostgresProjectionStore`] serves both halves of a projection's
//! persistent state:
//!
//! - rows, keyed `"{projection}:{view_id}"`, in a key-value table
//!   (`projection_data` unless configured otherwise)
//! - the cursor, one row per projection in `projection_checkpoints`
//!
//! [`ProjectionStore::commit`] writes both in one transaction, so a daemon
//! restarted after a crash never re-folds an event it already committed.
//!
//! ```text
//!        events (write side)            projection_data   projection_checkpoints
//!  ┌──────────────────────────┐        ┌──────────────┐   ┌───────────────────┐
//!  │ global_position │ ...    │  fold  │ key  │ data  │   │ name │ offset     │
//!  │  1 ..= head              │ ─────▶ │      │       │ + │      │            │
//!  └──────────────────────────┘        └──────────────┘   └───────────────────┘
//!                                        └──────── one transaction ────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eventline_projections::PostgresProjectionStore;
//!
//! let store = PostgresProjectionStore::from_pool(event_store.pool().clone());
//! store.migrate().await?;
//! let lease = store.acquire_lease("GlobalVideoCounter").await?;
//! ```

use chrono::{DateTime, Utc};
use eventline_core::projection::{
    EventPosition, ProjectionCheckpoint, ProjectionError, ProjectionStore, Result, ViewRow,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;

/// Default table for projection rows.
pub const DEFAULT_TABLE: &str = "projection_data";

/// `PostgreSQL`-backed projection rows and cursors.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE projection_data (
///     key TEXT PRIMARY KEY,
///     data BYTEA NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
///
/// CREATE TABLE projection_checkpoints (
///     projection_name TEXT PRIMARY KEY,
///     event_offset BIGINT NOT NULL,
///     event_timestamp TIMESTAMPTZ NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
/// ```
///
/// A custom row table must have the same columns as `projection_data`.
#[derive(Clone)]
pub struct PostgresProjectionStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresProjectionStore {
    /// Create a store over an existing pool, writing rows to `table_name`.
    #[must_use]
    pub const fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    /// Create a store over an existing pool using [`DEFAULT_TABLE`].
    ///
    /// Sharing the event store's pool keeps the read side in the same
    /// database, which is what the migrations assume.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(pool, DEFAULT_TABLE.to_string())
    }

    /// Create `projection_data` and `projection_checkpoints` if missing.
    ///
    /// Shares `_sqlx_migrations` with the event store migrations.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The row table name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Claim the right to run `projection_name`'s daemon.
    ///
    /// Backed by a session-level advisory lock held on a dedicated pooled
    /// connection. The lock is released when the lease is released or
    /// dropped, or when the process dies.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::LeaseHeld`]: another session holds the lease
    /// - [`ProjectionError::Storage`]: no connection or the query failed
    pub async fn acquire_lease(&self, projection_name: &str) -> Result<DaemonLease> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to acquire connection: {e}")))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(projection_name)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to take lease: {e}")))?;

        if !acquired {
            tracing::warn!(
                projection = projection_name,
                "Projection lease held by another session"
            );
            return Err(ProjectionError::LeaseHeld(projection_name.to_string()));
        }

        tracing::info!(projection = projection_name, "Projection lease acquired");
        Ok(DaemonLease {
            projection_name: projection_name.to_string(),
            conn: Some(conn),
        })
    }

    async fn upsert(&self, tx: &mut Transaction<'_, Postgres>, row: &ViewRow) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (key, data, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE
             SET data = EXCLUDED.data, updated_at = now()",
            self.table_name
        );

        sqlx::query(&query)
            .bind(&row.key)
            .bind(&row.data)
            .execute(&mut **tx)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to save {}: {e}", row.key)))?;
        Ok(())
    }
}

async fn write_checkpoint<'e, X>(
    executor: X,
    projection_name: &str,
    position: EventPosition,
) -> Result<()>
where
    X: sqlx::Executor<'e, Database = Postgres>,
{
    let offset = i64::try_from(position.offset).map_err(|_| {
        ProjectionError::Checkpoint(format!("Offset {} out of range", position.offset))
    })?;

    sqlx::query(
        "INSERT INTO projection_checkpoints
             (projection_name, event_offset, event_timestamp, updated_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (projection_name) DO UPDATE
         SET event_offset = EXCLUDED.event_offset,
             event_timestamp = EXCLUDED.event_timestamp,
             updated_at = now()",
    )
    .bind(projection_name)
    .bind(offset)
    .bind(position.timestamp)
    .execute(executor)
    .await
    .map_err(|e| ProjectionError::Checkpoint(format!("Failed to save checkpoint: {e}")))?;

    Ok(())
}

fn storage(e: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(e.to_string())
}

impl ProjectionStore for PostgresProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (key, data, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE
             SET data = EXCLUDED.data, updated_at = now()",
            self.table_name
        );

        sqlx::query(&query)
            .bind(key)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to save: {e}")))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let query = format!("SELECT data FROM {} WHERE key = $1", self.table_name);

        let result: Option<(Vec<u8>,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to get: {e}")))?;

        Ok(result.map(|(data,)| data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE key = $1", self.table_name);

        sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to delete: {e}")))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let query = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE key = $1)", self.table_name);

        let (exists,): (bool,) = sqlx::query_as(&query)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to check exists: {e}")))?;

        Ok(exists)
    }

    #[tracing::instrument(skip(self, rows), fields(rows = rows.len(), offset = position.offset))]
    async fn commit(
        &self,
        projection_name: &str,
        rows: Vec<ViewRow>,
        position: EventPosition,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for row in &rows {
            self.upsert(&mut tx, row).await?;
        }
        write_checkpoint(&mut *tx, projection_name, position).await?;
        // Dropping an uncommitted transaction rolls it back.
        tx.commit().await.map_err(storage)
    }

    async fn reset(&self, projection_name: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE starts_with(key, $1)", self.table_name);

        let mut tx = self.pool.begin().await.map_err(storage)?;
        let deleted = sqlx::query(&query)
            .bind(format!("{projection_name}:"))
            .execute(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to clear rows: {e}")))?
            .rows_affected();
        sqlx::query("DELETE FROM projection_checkpoints WHERE projection_name = $1")
            .bind(projection_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to clear checkpoint: {e}")))?;
        tx.commit().await.map_err(storage)?;

        tracing::info!(projection = projection_name, deleted, "Projection reset");
        Ok(())
    }
}

impl ProjectionCheckpoint for PostgresProjectionStore {
    fn save_position(
        &self,
        projection_name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let projection_name = projection_name.to_string();
        Box::pin(async move { write_checkpoint(&self.pool, &projection_name, position).await })
    }

    fn load_position(
        &self,
        projection_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventPosition>>> + Send + '_>> {
        let projection_name = projection_name.to_string();
        Box::pin(async move {
            let result: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
                "SELECT event_offset, event_timestamp
                 FROM projection_checkpoints
                 WHERE projection_name = $1",
            )
            .bind(projection_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to load checkpoint: {e}")))?;

            result
                .map(|(offset, timestamp)| {
                    u64::try_from(offset)
                        .map(|offset| EventPosition::new(offset, timestamp))
                        .map_err(|_| {
                            ProjectionError::Checkpoint(format!("Negative offset {offset}"))
                        })
                })
                .transpose()
        })
    }
}

/// Exclusive right to run one projection's daemon.
///
/// Hold it for as long as the daemon runs. Dropping the lease closes its
/// connection, which ends the session and frees the lock.
pub struct DaemonLease {
    projection_name: String,
    conn: Option<PoolConnection<Postgres>>,
}

impl DaemonLease {
    /// The projection this lease covers.
    #[must_use]
    pub fn projection_name(&self) -> &str {
        &self.projection_name
    }

    /// Unlock and return the connection to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the unlock query fails; the
    /// connection is closed in that case so the lock still goes away.
    pub async fn release(mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&self.projection_name)
            .fetch_one(&mut *conn)
            .await;

        match unlocked {
            Ok(_) => {
                tracing::info!(projection = %self.projection_name, "Projection lease released");
                Ok(())
            }
            Err(e) => {
                drop(conn.detach());
                Err(ProjectionError::Storage(format!("Failed to release lease: {e}")))
            }
        }
    }
}

impl Drop for DaemonLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Closing the session frees every advisory lock it holds.
            drop(conn.detach());
        }
    }
}

impl std::fmt::Debug for DaemonLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonLease")
            .field("projection_name", &self.projection_name)
            .field("held", &self.conn.is_some())
            .finish()
    }
}
