use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::{SessionStore, StoreError};
use crate::health::HealthMetrics;
use crate::model::{PendingHeartbeat, Session, SessionId};

/// Table created by the embedded migrations.
pub const SESSIONS_TABLE: &str = "sessions";

/// Session store backed by a Postgres `sessions` table.
///
/// Each merge chunk is a single `UPDATE ... FROM UNNEST(...)` statement.
/// `GREATEST` ignores NULL arguments in Postgres, which gives the
/// "unset is negative infinity" rule for free; `COALESCE` keeps the first
/// country that was ever recorded.
pub struct PostgresSessionStore {
    pool: PgPool,
    merge_sql: String,
    stale_sql: String,
    close_sql: String,
    health: Option<Arc<HealthMetrics>>,
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    duration: Option<i64>,
    country_code: Option<String>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            id: SessionId::from(row.id),
            start_time: row.start_time,
            end_time: row.end_time,
            last_heartbeat: row.last_heartbeat,
            duration: row.duration,
            country_code: row.country_code,
        }
    }
}

impl PostgresSessionStore {
    /// Creates a store over the migrated `sessions` table.
    pub fn new(pool: PgPool, health: Option<Arc<HealthMetrics>>) -> Self {
        Self::with_table(pool, SESSIONS_TABLE, health)
    }

    /// Creates a store over `table`, which must be a trusted plain identifier.
    pub fn with_table(pool: PgPool, table: &str, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            pool,
            merge_sql: merge_statement(table),
            stale_sql: stale_statement(table),
            close_sql: close_statement(table),
            health,
        }
    }

    fn observe<T>(&self, operation: &str, started: Instant, result: &Result<T, StoreError>) {
        let Some(health) = &self.health else {
            return;
        };

        health
            .store_query_duration
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());

        if result.is_err() {
            health.store_errors.with_label_values(&[operation]).inc();
        }
    }
}

impl SessionStore for PostgresSessionStore {
    async fn merge_heartbeats(&self, chunk: &[PendingHeartbeat]) -> Result<u64, StoreError> {
        if chunk.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(chunk.len());
        let mut observed = Vec::with_capacity(chunk.len());
        let mut durations = Vec::with_capacity(chunk.len());
        let mut countries = Vec::with_capacity(chunk.len());
        for hb in chunk {
            ids.push(hb.session_id.as_str().to_string());
            observed.push(hb.observed_at);
            durations.push(hb.duration_candidate);
            countries.push(hb.country_candidate.clone());
        }

        let started = Instant::now();
        let result = sqlx::query(&self.merge_sql)
            .bind(ids)
            .bind(observed)
            .bind(durations)
            .bind(countries)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(StoreError::from);
        self.observe("merge", started, &result);

        result
    }

    async fn find_stale_open_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let started = Instant::now();
        let result = sqlx::query_as::<_, SessionRow>(&self.stale_sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.into_iter().map(Session::from).collect())
            .map_err(StoreError::from);
        self.observe("find_stale", started, &result);

        result
    }

    async fn close_session(
        &self,
        id: &SessionId,
        end_time: DateTime<Utc>,
        duration: i64,
    ) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = sqlx::query(&self.close_sql)
            .bind(id.as_str())
            .bind(end_time)
            .bind(duration)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(StoreError::from);
        self.observe("close", started, &result);

        result
    }
}

fn merge_statement(table: &str) -> String {
    format!(
        "UPDATE {table} AS s SET \
            last_heartbeat = GREATEST(s.last_heartbeat, c.observed_at), \
            duration = GREATEST(s.duration, c.duration), \
            country_code = COALESCE(s.country_code, c.country_code) \
         FROM UNNEST($1::text[], $2::timestamptz[], $3::bigint[], $4::text[]) \
            AS c(id, observed_at, duration, country_code) \
         WHERE s.id = c.id AND s.end_time IS NULL"
    )
}

fn stale_statement(table: &str) -> String {
    format!(
        "SELECT id, start_time, end_time, last_heartbeat, duration, country_code \
         FROM {table} \
         WHERE end_time IS NULL AND (last_heartbeat IS NULL OR last_heartbeat < $1) \
         ORDER BY id"
    )
}

fn close_statement(table: &str) -> String {
    format!("UPDATE {table} SET end_time = $2, duration = $3 WHERE id = $1 AND end_time IS NULL")
}
