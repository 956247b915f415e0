//! `PostgresEventStore`: the production [`EventStore`].

use chrono::{DateTime, Utc};
use eventline_core::event::RecordedEvent;
use eventline_core::event_store::{
    EventStore, EventStoreError, Snapshot, StoreFuture, StreamCommit, StreamInfo,
    check_distinct_streams, check_expectation,
};
use eventline_core::stream::{ExpectedVersion, GlobalPosition, StreamId, Version};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;

const UNIQUE_VIOLATION: &str = "23505";

/// Default pool size for [`PostgresEventStore::new`].
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(sqlx::FromRow)]
struct EventRow {
    stream_id: String,
    entity_type: String,
    version: i64,
    global_position: i64,
    event_type: String,
    event_data: Vec<u8>,
    metadata: Option<serde_json::Value>,
    recorded_at: DateTime<Utc>,
}

impl EventRow {
    fn into_recorded(self) -> RecordedEvent {
        RecordedEvent {
            stream_id: StreamId::new(self.stream_id),
            entity_type: self.entity_type,
            version: Version::new(from_db(self.version)),
            global_position: GlobalPosition::new(from_db(self.global_position)),
            event_type: self.event_type,
            data: self.event_data,
            metadata: self.metadata,
            recorded_at: self.recorded_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StreamRow {
    stream_id: String,
    entity_type: String,
    version: i64,
}

impl StreamRow {
    fn into_info(self) -> StreamInfo {
        StreamInfo {
            stream_id: StreamId::new(self.stream_id),
            entity_type: self.entity_type,
            version: Version::new(from_db(self.version)),
        }
    }
}

/// `PostgreSQL`-backed event store.
///
/// # Write path
///
/// Each [`EventStore::commit`] runs in one transaction:
///
/// 1. Lock the target stream rows (`SELECT ... FOR UPDATE`, in id order)
/// 2. Check every expected version
/// 3. Reserve global positions from the `event_log_head` counter row
/// 4. Insert/advance stream rows, insert events, upsert snapshots
///
/// Holding the counter row until commit means positions become visible in
/// order, so a projection reading past position `p` never finds `p - 1`
/// appearing later.
///
/// # Example
///
/// ```no_run
/// use eventline_postgres::PostgresEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEventStore::new("postgres://localhost/eventline").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect with [`DEFAULT_MAX_CONNECTIONS`] pooled connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        Self::connect(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `streams`, `events`, `snapshots` and `event_log_head` tables.
    ///
    /// Idempotent; safe to run on every startup.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        let mut migrator = sqlx::migrate!("./migrations");
        // Projection migrations share the `_sqlx_migrations` table.
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))
    }

    #[tracing::instrument(
        skip(self, commits),
        fields(streams = commits.len()),
        name = "event_store_commit"
    )]
    async fn commit_batch(
        &self,
        commits: Vec<StreamCommit>,
    ) -> Result<Vec<Version>, EventStoreError> {
        check_distinct_streams(&commits)?;

        let mut tx = self.pool.begin().await.map_err(database_error)?;
        let current = lock_streams(&mut tx, &commits).await?;

        for commit in &commits {
            if let Err(error) = check_expectation(commit, current.get(&commit.stream_id)) {
                record_rejection(&error);
                return Err(error);
            }
        }

        let total: usize = commits.iter().map(|commit| commit.events.len()).sum();
        let mut position = reserve_positions(&mut tx, total).await?;

        let mut versions = Vec::with_capacity(commits.len());
        for commit in &commits {
            let exists = current.contains_key(&commit.stream_id);
            let version = match write_stream(&mut tx, commit, exists, &mut position).await {
                Ok(version) => version,
                Err(WriteError::Database(e)) if is_unique_violation(&e) => {
                    drop(tx);
                    let error = self.collision(commit).await;
                    record_rejection(&error);
                    return Err(error);
                }
                Err(WriteError::Database(e)) => return Err(database_error(e)),
                Err(WriteError::Store(error)) => return Err(error),
            };
            versions.push(version);
        }

        tx.commit().await.map_err(database_error)?;

        metrics::counter!("eventline_events_appended_total").increment(total as u64);
        tracing::debug!(events = total, head = %position, "Commit persisted");

        Ok(versions)
    }

    /// Explain a unique violation: another writer created the stream or took
    /// the version between our check and our insert.
    async fn collision(&self, commit: &StreamCommit) -> EventStoreError {
        match commit.expected {
            ExpectedVersion::NoStream => {
                EventStoreError::StreamAlreadyExists(commit.stream_id.clone())
            }
            ExpectedVersion::Exact(expected) => {
                let actual = match self.fetch_stream_info(&commit.stream_id).await {
                    Ok(Some(info)) => info.version,
                    _ => expected.next(),
                };
                EventStoreError::ConcurrencyConflict {
                    stream_id: commit.stream_id.clone(),
                    expected,
                    actual,
                }
            }
        }
    }

    async fn fetch_stream_info(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<StreamInfo>, EventStoreError> {
        let row: Option<StreamRow> = sqlx::query_as(
            "SELECT stream_id, entity_type, version FROM streams WHERE stream_id = $1",
        )
        .bind(stream_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;
        Ok(row.map(StreamRow::into_info))
    }
}

enum WriteError {
    Database(sqlx::Error),
    Store(EventStoreError),
}

impl From<sqlx::Error> for WriteError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error)
    }
}

async fn lock_streams(
    tx: &mut Transaction<'_, Postgres>,
    commits: &[StreamCommit],
) -> Result<HashMap<StreamId, StreamInfo>, EventStoreError> {
    // Sorted locking keeps two multi-stream commits from deadlocking.
    let mut ids: Vec<String> = commits
        .iter()
        .map(|commit| commit.stream_id.as_str().to_string())
        .collect();
    ids.sort();

    let rows: Vec<StreamRow> = sqlx::query_as(
        r"
        SELECT stream_id, entity_type, version
        FROM streams
        WHERE stream_id = ANY($1)
        ORDER BY stream_id
        FOR UPDATE
        ",
    )
    .bind(&ids)
    .fetch_all(&mut **tx)
    .await
    .map_err(database_error)?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let info = row.into_info();
            (info.stream_id.clone(), info)
        })
        .collect())
}

/// Advance the log head by `count` and return the position before it.
async fn reserve_positions(
    tx: &mut Transaction<'_, Postgres>,
    count: usize,
) -> Result<GlobalPosition, EventStoreError> {
    let count = to_db(count as u64)?;
    let (before,): (i64,) = sqlx::query_as(
        "UPDATE event_log_head SET position = position + $1 WHERE id RETURNING position - $1",
    )
    .bind(count)
    .fetch_one(&mut **tx)
    .await
    .map_err(database_error)?;
    Ok(GlobalPosition::new(from_db(before)))
}

async fn write_stream(
    tx: &mut Transaction<'_, Postgres>,
    commit: &StreamCommit,
    exists: bool,
    position: &mut GlobalPosition,
) -> Result<Version, WriteError> {
    let resulting = commit.resulting_version();
    let resulting_db = to_db(resulting.value()).map_err(WriteError::Store)?;

    if exists {
        sqlx::query("UPDATE streams SET version = $2, updated_at = now() WHERE stream_id = $1")
            .bind(commit.stream_id.as_str())
            .bind(resulting_db)
            .execute(&mut **tx)
            .await?;
    } else if !commit.events.is_empty() {
        sqlx::query("INSERT INTO streams (stream_id, entity_type, version) VALUES ($1, $2, $3)")
            .bind(commit.stream_id.as_str())
            .bind(&commit.entity_type)
            .bind(resulting_db)
            .execute(&mut **tx)
            .await?;
    }

    let mut version = commit.expected.version();
    for event in &commit.events {
        version = version.next();
        *position = position.next();
        sqlx::query(
            r"
            INSERT INTO events (
                global_position, stream_id, entity_type, version,
                event_type, event_data, metadata, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(to_db(position.value()).map_err(WriteError::Store)?)
        .bind(commit.stream_id.as_str())
        .bind(&commit.entity_type)
        .bind(to_db(version.value()).map_err(WriteError::Store)?)
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(&event.metadata)
        .bind(commit.recorded_at)
        .execute(&mut **tx)
        .await?;
    }

    if let Some(state) = &commit.snapshot {
        sqlx::query(
            r"
            INSERT INTO snapshots (stream_id, version, state_data, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (stream_id) DO UPDATE
            SET version = EXCLUDED.version,
                state_data = EXCLUDED.state_data,
                updated_at = now()
            ",
        )
        .bind(commit.stream_id.as_str())
        .bind(resulting_db)
        .bind(state)
        .execute(&mut **tx)
        .await?;
    }

    Ok(resulting)
}

fn record_rejection(error: &EventStoreError) {
    if error.is_conflict() {
        metrics::counter!("eventline_concurrency_conflicts_total").increment(1);
        tracing::debug!(error = %error, "Commit rejected");
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn database_error(error: sqlx::Error) -> EventStoreError {
    EventStoreError::DatabaseError(error.to_string())
}

fn to_db(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value)
        .map_err(|_| EventStoreError::DatabaseError(format!("{value} exceeds BIGINT range")))
}

#[allow(clippy::cast_sign_loss)] // Columns carry CHECK (>= 0) constraints
const fn from_db(value: i64) -> u64 {
    value as u64
}

impl EventStore for PostgresEventStore {
    fn commit(
        &self,
        commits: Vec<StreamCommit>,
    ) -> StoreFuture<'_, Result<Vec<Version>, EventStoreError>> {
        Box::pin(self.commit_batch(commits))
    }

    fn load_events(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> StoreFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let from = to_db(from_version.unwrap_or(Version::INITIAL).value())?;
            let rows: Vec<EventRow> = sqlx::query_as(
                r"
                SELECT stream_id, entity_type, version, global_position,
                       event_type, event_data, metadata, recorded_at
                FROM events
                WHERE stream_id = $1 AND version >= $2
                ORDER BY version ASC
                ",
            )
            .bind(stream_id.as_str())
            .bind(from)
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

            Ok(rows.into_iter().map(EventRow::into_recorded).collect())
        })
    }

    fn read_all_since(
        &self,
        after: GlobalPosition,
        limit: usize,
    ) -> StoreFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let after = to_db(after.value())?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows: Vec<EventRow> = sqlx::query_as(
                r"
                SELECT stream_id, entity_type, version, global_position,
                       event_type, event_data, metadata, recorded_at
                FROM events
                WHERE global_position > $1
                ORDER BY global_position ASC
                LIMIT $2
                ",
            )
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

            Ok(rows.into_iter().map(EventRow::into_recorded).collect())
        })
    }

    fn head_position(&self) -> StoreFuture<'_, Result<GlobalPosition, EventStoreError>> {
        Box::pin(async move {
            let (position,): (i64,) = sqlx::query_as("SELECT position FROM event_log_head WHERE id")
                .fetch_one(&self.pool)
                .await
                .map_err(database_error)?;
            Ok(GlobalPosition::new(from_db(position)))
        })
    }

    fn stream_info(
        &self,
        stream_id: StreamId,
    ) -> StoreFuture<'_, Result<Option<StreamInfo>, EventStoreError>> {
        Box::pin(async move { self.fetch_stream_info(&stream_id).await })
    }

    fn load_snapshot(
        &self,
        stream_id: StreamId,
    ) -> StoreFuture<'_, Result<Option<Snapshot>, EventStoreError>> {
        Box::pin(async move {
            let row: Option<(i64, Vec<u8>)> =
                sqlx::query_as("SELECT version, state_data FROM snapshots WHERE stream_id = $1")
                    .bind(stream_id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(database_error)?;

            Ok(row.map(|(version, state)| Snapshot {
                version: Version::new(from_db(version)),
                state,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_beyond_bigint_are_rejected() {
        assert!(to_db(u64::MAX).is_err());
        assert_eq!(to_db(42).ok(), Some(42));
    }

    #[test]
    fn database_values_convert_back() {
        assert_eq!(from_db(0), 0);
        assert_eq!(from_db(9_000), 9_000);
    }
}
