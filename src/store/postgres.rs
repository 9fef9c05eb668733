//! PostgreSQL implementation of [`JobStore`].
//!
//! Singleton slots are enforced by three partial unique indexes over
//! non-terminal rows, and inserts use `ON CONFLICT DO NOTHING` so a slot
//! conflict surfaces as zero affected rows. Claims lock candidate rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent pollers never receive the same job.

use crate::{
    JobwardenError, Result,
    job::{Job, JobId, NewJob},
    singleton,
    store::JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TABLE: &str = "jobwarden_jobs";

const COLUMNS: &str = "id, name, data, priority, state, retry_limit, retry_count, retry_delay_ms, \
     retry_backoff, retry_of, start_after, expire_in_ms, singleton_key, singleton_seconds, \
     singleton_on, output, created_on, started_on, completed_on, outcome_fetched_on";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub priority: i32,
    pub state: String,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub retry_delay_ms: i64,
    pub retry_backoff: bool,
    pub retry_of: Option<String>,
    pub start_after: DateTime<Utc>,
    pub expire_in_ms: i64,
    pub singleton_key: Option<String>,
    pub singleton_seconds: Option<i64>,
    pub singleton_on: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub outcome_fetched_on: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            name: self.name,
            data: self.data,
            priority: self.priority,
            state: self.state.parse()?,
            retry_limit: self.retry_limit.max(0) as u32,
            retry_count: self.retry_count.max(0) as u32,
            retry_delay: Duration::from_millis(self.retry_delay_ms.max(0) as u64),
            retry_backoff: self.retry_backoff,
            retry_of: self.retry_of,
            start_after: self.start_after,
            expire_in: Duration::from_millis(self.expire_in_ms.max(0) as u64),
            singleton_key: self.singleton_key,
            singleton_seconds: self.singleton_seconds.map(|s| s.max(0) as u64),
            singleton_on: self.singleton_on,
            output: self.output,
            created_on: self.created_on,
            started_on: self.started_on,
            completed_on: self.completed_on,
            outcome_fetched_on: self.outcome_fetched_on,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(JobRow::into_job).collect()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted.
fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_start || !valid_rest || table.len() > 63 {
        return Err(JobwardenError::Config(format!(
            "invalid table name: {}",
            table
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    pub fn with_table(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the job table and its indexes if they do not exist.
    pub async fn create_schema(&self) -> Result<()> {
        let t = &self.table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    data JSONB NOT NULL DEFAULT 'null'::jsonb,
                    priority INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL DEFAULT 'created',
                    retry_limit INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    retry_delay_ms BIGINT NOT NULL DEFAULT 0,
                    retry_backoff BOOLEAN NOT NULL DEFAULT FALSE,
                    retry_of TEXT,
                    start_after TIMESTAMPTZ NOT NULL,
                    expire_in_ms BIGINT NOT NULL,
                    singleton_key TEXT,
                    singleton_seconds BIGINT,
                    singleton_on TIMESTAMPTZ,
                    output JSONB,
                    created_on TIMESTAMPTZ NOT NULL,
                    started_on TIMESTAMPTZ,
                    completed_on TIMESTAMPTZ,
                    outcome_fetched_on TIMESTAMPTZ
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {t}_claim_idx \
                 ON {t} (name, priority DESC, created_on) WHERE state = 'created'"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {t}_singleton_key_idx \
                 ON {t} (name, singleton_key) \
                 WHERE state IN ('created', 'active') \
                 AND singleton_key IS NOT NULL AND singleton_on IS NULL"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {t}_singleton_on_idx \
                 ON {t} (name, singleton_on) \
                 WHERE state IN ('created', 'active') \
                 AND singleton_key IS NULL AND singleton_on IS NOT NULL"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {t}_singleton_key_on_idx \
                 ON {t} (name, singleton_on, singleton_key) \
                 WHERE state IN ('created', 'active') \
                 AND singleton_key IS NOT NULL AND singleton_on IS NOT NULL"
            ),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        debug!("Ensured job table {}", t);
        Ok(())
    }

    async fn transition(
        &self,
        ids: &[JobId],
        from: &[&str],
        next: &str,
        output: Option<Value>,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "UPDATE {t} SET state = $1, completed_on = $2, output = COALESCE($3, output) \
             WHERE id = ANY($4) AND state = ANY($5) RETURNING {COLUMNS}",
            t = self.table
        );
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(next)
            .bind(self.now())
            .bind(output)
            .bind(ids)
            .bind(&from)
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert(&self, job: &NewJob, singleton_offset: i64) -> Result<u64> {
        let now = self.now();
        let singleton_on = job
            .singleton_seconds
            .map(|seconds| singleton::slot_start(now, seconds, singleton_offset))
            .transpose()?;
        let row = job.clone().into_job(now, singleton_on);

        let sql = format!(
            "INSERT INTO {t} ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
              $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
             ON CONFLICT DO NOTHING",
            t = self.table
        );
        let result = sqlx::query(&sql)
            .bind(&row.id)
            .bind(&row.name)
            .bind(&row.data)
            .bind(row.priority)
            .bind(row.state.as_str())
            .bind(i32::try_from(row.retry_limit).unwrap_or(i32::MAX))
            .bind(i32::try_from(row.retry_count).unwrap_or(i32::MAX))
            .bind(millis(row.retry_delay))
            .bind(row.retry_backoff)
            .bind(&row.retry_of)
            .bind(row.start_after)
            .bind(millis(row.expire_in))
            .bind(&row.singleton_key)
            .bind(row.singleton_seconds.map(|s| i64::try_from(s).unwrap_or(i64::MAX)))
            .bind(row.singleton_on)
            .bind(&row.output)
            .bind(row.created_on)
            .bind(row.started_on)
            .bind(row.completed_on)
            .bind(row.outcome_fetched_on)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn claim_next(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id FROM {t}
                WHERE name = ANY($1) AND state = 'created' AND start_after <= $2
                ORDER BY priority DESC, created_on ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {t} AS j SET state = 'active', started_on = $2
            FROM next WHERE j.id = next.id
            RETURNING {columns}
            "#,
            t = self.table,
            columns = prefixed_columns("j"),
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(names)
            .bind(self.now())
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = into_jobs(rows)?;
        // RETURNING does not preserve the CTE ordering
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_on.cmp(&b.created_on)));
        Ok(jobs)
    }

    async fn claim_outcomes(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            WITH ready AS (
                SELECT id FROM {t}
                WHERE name = ANY($1) AND state IN ('completed', 'failed')
                  AND outcome_fetched_on IS NULL
                ORDER BY completed_on ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {t} AS j SET outcome_fetched_on = $2
            FROM ready WHERE j.id = ready.id
            RETURNING {columns}
            "#,
            t = self.table,
            columns = prefixed_columns("j"),
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(names)
            .bind(self.now())
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = into_jobs(rows)?;
        jobs.sort_by_key(|job| job.completed_on);
        Ok(jobs)
    }

    async fn complete(&self, ids: &[JobId], output: Option<Value>) -> Result<Vec<Job>> {
        self.transition(ids, &["active"], "completed", output)
            .await
    }

    async fn fail(&self, ids: &[JobId], output: Option<Value>) -> Result<Vec<Job>> {
        self.transition(ids, &["active"], "failed", output)
            .await
    }

    async fn cancel(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        self.transition(ids, &["created", "active"], "cancelled", None)
            .await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {COLUMNS} FROM {t} WHERE id = $1", t = self.table);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn expire_active(&self) -> Result<Vec<Job>> {
        let sql = format!(
            "UPDATE {t} SET state = 'expired', completed_on = $1 \
             WHERE state = 'active' \
             AND started_on + expire_in_ms * INTERVAL '1 millisecond' <= $1 \
             RETURNING {COLUMNS}",
            t = self.table
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(self.now())
            .fetch_all(&self.pool)
            .await?;
        into_jobs(rows)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {t} \
             WHERE state IN ('completed', 'failed', 'cancelled', 'expired') \
             AND completed_on < $1",
            t = self.table
        );
        let result = sqlx::query(&sql)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|column| format!("{}.{}", alias, column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
