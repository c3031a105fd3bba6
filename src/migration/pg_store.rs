//! Postgres implementation of the Store port.
//!
//! All queries are runtime-built `sqlx::query` calls; rows are mapped by
//! hand so a bad enum value surfaces as a fatal `Corrupt` error instead of a
//! silent default. Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers
//! never block on or double-claim the same row.

use super::error::{StoreError, StoreResult};
use super::models::{
    AttemptOutcome, Batch, BatchState, MigrationAttempt, MigrationKind, NewAttempt, NewRepository,
    RepoState, Repository, Settings,
};
use super::state;
use super::store::{ClaimContext, Store, TransitionPatch};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration as StdDuration;
use tracing::info;
use uuid::Uuid;

/// Create a connection pool with the operational tuning we want for many
/// short conditional updates.
pub async fn create_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(StdDuration::from_secs(10))
        .idle_timeout(Some(StdDuration::from_secs(300)))
        .max_lifetime(Some(StdDuration::from_secs(3600)))
        .connect(database_url)
        .await?;

    sqlx::query("SELECT 1").fetch_one(&pool).await?;
    info!(
        "Connected to PostgreSQL with {} max connections",
        max_connections
    );
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist yet. Idempotent.
    pub async fn init_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id UUID PRIMARY KEY,
                full_name TEXT NOT NULL,
                source_url TEXT NOT NULL UNIQUE,
                visibility TEXT NOT NULL DEFAULT 'private',
                size_bytes BIGINT NOT NULL DEFAULT 0,
                complexity_score REAL NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'pending',
                priority INT NOT NULL DEFAULT 0,
                assigned_worker TEXT,
                claimed_at TIMESTAMPTZ,
                last_transition_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                failure_reason TEXT,
                batch_id UUID,
                destination_full_name TEXT,
                dry_run_migration_id TEXT,
                live_migration_id TEXT,
                dry_run_attempt_count INT NOT NULL DEFAULT 0,
                live_attempt_count INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_repositories_dispatch
                ON repositories (state, priority, last_transition_at)
                WHERE assigned_worker IS NULL
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'draft',
                scheduled_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INT PRIMARY KEY,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS migration_attempts (
                id UUID PRIMARY KEY,
                repository_id UUID NOT NULL,
                kind TEXT NOT NULL,
                external_migration_id TEXT NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                finished_at TIMESTAMPTZ,
                outcome TEXT NOT NULL DEFAULT 'in_flight',
                stderr_excerpt TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_migration_attempts_repo
                ON migration_attempts (repository_id, kind, outcome)
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Migration schema is in place");
        Ok(())
    }

    fn row_to_repository(row: &PgRow) -> StoreResult<Repository> {
        let id: Uuid = row.try_get("id")?;
        let state_raw: String = row.try_get("state")?;
        let state = state_raw.parse::<RepoState>().map_err(|message| {
            StoreError::Corrupt {
                id: id.to_string(),
                message,
            }
        })?;
        let visibility_raw: String = row.try_get("visibility")?;
        let visibility = visibility_raw.parse().map_err(|message| StoreError::Corrupt {
            id: id.to_string(),
            message,
        })?;
        Ok(Repository {
            id,
            full_name: row.try_get("full_name")?,
            source_url: row.try_get("source_url")?,
            visibility,
            size_bytes: row.try_get("size_bytes")?,
            complexity_score: row.try_get("complexity_score")?,
            state,
            priority: row.try_get("priority")?,
            assigned_worker: row.try_get("assigned_worker")?,
            claimed_at: row.try_get("claimed_at")?,
            last_transition_at: row.try_get("last_transition_at")?,
            failure_reason: row.try_get("failure_reason")?,
            batch_id: row.try_get("batch_id")?,
            destination_full_name: row.try_get("destination_full_name")?,
            dry_run_migration_id: row.try_get("dry_run_migration_id")?,
            live_migration_id: row.try_get("live_migration_id")?,
            dry_run_attempt_count: row.try_get("dry_run_attempt_count")?,
            live_attempt_count: row.try_get("live_attempt_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_batch(row: &PgRow) -> StoreResult<Batch> {
        let id: Uuid = row.try_get("id")?;
        let state_raw: String = row.try_get("state")?;
        let state = state_raw.parse::<BatchState>().map_err(|message| {
            StoreError::Corrupt {
                id: id.to_string(),
                message,
            }
        })?;
        Ok(Batch {
            id,
            name: row.try_get("name")?,
            state,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_attempt(row: &PgRow) -> StoreResult<MigrationAttempt> {
        let id: Uuid = row.try_get("id")?;
        let kind_raw: String = row.try_get("kind")?;
        let kind = kind_raw.parse::<MigrationKind>().map_err(|message| {
            StoreError::Corrupt {
                id: id.to_string(),
                message,
            }
        })?;
        let outcome_raw: String = row.try_get("outcome")?;
        let outcome = outcome_raw.parse::<AttemptOutcome>().map_err(|message| {
            StoreError::Corrupt {
                id: id.to_string(),
                message,
            }
        })?;
        Ok(MigrationAttempt {
            id,
            repository_id: row.try_get("repository_id")?,
            kind,
            external_migration_id: row.try_get("external_migration_id")?,
            submitted_at: row.try_get("submitted_at")?,
            finished_at: row.try_get("finished_at")?,
            outcome,
            stderr_excerpt: row.try_get("stderr_excerpt")?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_repository(&self, new: NewRepository) -> StoreResult<Repository> {
        let row = sqlx::query(
            r#"
            INSERT INTO repositories
                (id, full_name, source_url, visibility, size_bytes, complexity_score,
                 state, priority, batch_id)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.full_name)
        .bind(&new.source_url)
        .bind(new.visibility.to_string())
        .bind(new.size_bytes)
        .bind(new.complexity_score)
        .bind(new.priority)
        .bind(new.batch_id)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_repository(&row)
    }

    async fn snapshot(&self, id: Uuid) -> StoreResult<Repository> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("repository", id))?;
        Self::row_to_repository(&row)
    }

    async fn list_repositories(
        &self,
        states: &[RepoState],
        limit: i64,
    ) -> StoreResult<Vec<Repository>> {
        let state_names: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT * FROM repositories
            WHERE cardinality($1::text[]) = 0 OR state = ANY($1)
            ORDER BY priority ASC, last_transition_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(&state_names)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_repository).collect()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        ctx: &ClaimContext,
    ) -> StoreResult<Option<Repository>> {
        // Eligibility mirrors state::claim_requirement; keep the two in sync.
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT r.id FROM repositories r
                LEFT JOIN batches b ON r.batch_id = b.id
                WHERE r.assigned_worker IS NULL
                  AND (
                        r.state IN ('pending','dry_run_queued','dry_run_complete',
                                    'pre_migration','post_migration','migration_complete')
                     OR (r.state = 'dry_run_failed' AND r.dry_run_attempt_count < $2)
                     OR (r.state = 'migration_failed' AND r.live_attempt_count < $3)
                     OR (r.state = 'dry_run_in_progress' AND r.dry_run_migration_id IS NULL)
                     OR (r.state IN ('archive_generating','queued_for_migration')
                         AND r.live_migration_id IS NULL)
                  )
                  AND (r.batch_id IS NULL
                       OR (b.state <> 'draft'
                           AND (b.scheduled_at IS NULL OR b.scheduled_at <= $4)))
                  AND ($5::uuid IS NULL OR r.batch_id = $5)
                ORDER BY r.priority ASC, r.last_transition_at ASC, r.id ASC
                FOR UPDATE OF r SKIP LOCKED
                LIMIT 1
            )
            UPDATE repositories
            SET assigned_worker = $1, claimed_at = NOW(), updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(ctx.max_dry_run_attempts)
        .bind(ctx.max_live_attempts)
        .bind(ctx.now)
        .bind(ctx.batch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_repository).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: RepoState,
        new: RepoState,
        patch: TransitionPatch,
    ) -> StoreResult<bool> {
        if expected != new && !state::edge_allowed(expected, new) {
            return Err(StoreError::InvalidTransition { from: expected, to: new });
        }
        let set_worker = patch.assigned_worker.is_some();
        let worker: Option<String> = patch.assigned_worker.clone().flatten();
        let set_failure = patch.failure_reason.is_some();
        let failure: Option<String> = patch.failure_reason.clone().flatten();
        let set_dry_id = patch.dry_run_migration_id.is_some();
        let dry_id: Option<String> = patch.dry_run_migration_id.clone().flatten();
        let set_live_id = patch.live_migration_id.is_some();
        let live_id: Option<String> = patch.live_migration_id.clone().flatten();

        let result = sqlx::query(
            r#"
            UPDATE repositories SET
                state = $3,
                last_transition_at = CASE WHEN $3 <> $2 THEN NOW() ELSE last_transition_at END,
                assigned_worker = CASE WHEN $4 THEN $5 ELSE assigned_worker END,
                claimed_at = CASE WHEN $4 AND $5 IS NOT NULL THEN NOW()
                                  WHEN $4 THEN NULL
                                  ELSE claimed_at END,
                failure_reason = CASE WHEN $6 THEN $7 ELSE failure_reason END,
                destination_full_name = COALESCE($8, destination_full_name),
                dry_run_migration_id = CASE WHEN $9 THEN $10 ELSE dry_run_migration_id END,
                live_migration_id = CASE WHEN $11 THEN $12 ELSE live_migration_id END,
                dry_run_attempt_count = CASE WHEN $15 THEN 0
                                             WHEN $13 THEN dry_run_attempt_count + 1
                                             ELSE dry_run_attempt_count END,
                live_attempt_count = CASE WHEN $15 THEN 0
                                          WHEN $14 THEN live_attempt_count + 1
                                          ELSE live_attempt_count END,
                visibility = COALESCE($16, visibility),
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(new.to_string())
        .bind(set_worker)
        .bind(worker)
        .bind(set_failure)
        .bind(failure)
        .bind(patch.destination_full_name.clone())
        .bind(set_dry_id)
        .bind(dry_id)
        .bind(set_live_id)
        .bind(live_id)
        .bind(patch.increment_dry_attempts)
        .bind(patch.increment_live_attempts)
        .bind(patch.reset_attempts)
        .bind(patch.visibility.map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE repositories
            SET assigned_worker = NULL, claimed_at = NULL, updated_at = NOW()
            WHERE id = $1 AND assigned_worker = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_stale_claims(&self, older_than: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE repositories
            SET assigned_worker = NULL, claimed_at = NULL, updated_at = NOW()
            WHERE assigned_worker IS NOT NULL
              AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(older_than.num_seconds() as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn enumerate_for_status_poll(&self, limit: i64) -> StoreResult<Vec<Repository>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM repositories
            WHERE assigned_worker IS NULL
              AND (
                    (state = 'dry_run_in_progress' AND dry_run_migration_id IS NOT NULL)
                 OR (state IN ('archive_generating','queued_for_migration','migrating_content')
                     AND live_migration_id IS NOT NULL)
              )
            ORDER BY last_transition_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_repository).collect()
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> StoreResult<MigrationAttempt> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE migration_attempts
            SET outcome = 'superseded', finished_at = NOW()
            WHERE repository_id = $1 AND kind = $2 AND outcome = 'in_flight'
            "#,
        )
        .bind(attempt.repository_id)
        .bind(attempt.kind.to_string())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            INSERT INTO migration_attempts (id, repository_id, kind, external_migration_id)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(attempt.repository_id)
        .bind(attempt.kind.to_string())
        .bind(&attempt.external_migration_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Self::row_to_attempt(&row)
    }

    async fn finish_attempt(
        &self,
        repository_id: Uuid,
        kind: MigrationKind,
        external_migration_id: &str,
        outcome: AttemptOutcome,
        stderr_excerpt: Option<String>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE migration_attempts
            SET outcome = $4, finished_at = NOW(), stderr_excerpt = $5
            WHERE repository_id = $1 AND kind = $2 AND external_migration_id = $3
              AND outcome = 'in_flight'
            "#,
        )
        .bind(repository_id)
        .bind(kind.to_string())
        .bind(external_migration_id)
        .bind(outcome.to_string())
        .bind(stderr_excerpt)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() >= 1)
    }

    async fn attempts_for(&self, repository_id: Uuid) -> StoreResult<Vec<MigrationAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM migration_attempts WHERE repository_id = $1 ORDER BY submitted_at ASC",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_attempt).collect()
    }

    async fn get_settings(&self) -> StoreResult<Settings> {
        let row = sqlx::query("SELECT data FROM settings WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: serde_json::Value = row.try_get("data")?;
                Ok(serde_json::from_value(data)?)
            }
            None => Ok(Settings::default()),
        }
    }

    async fn update_settings(&self, settings: &Settings) -> StoreResult<()> {
        let data = serde_json::to_value(settings)?;
        sqlx::query(
            r#"
            INSERT INTO settings (id, data, updated_at)
            VALUES (1, $1, NOW())
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_batch(
        &self,
        name: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Batch> {
        let row = sqlx::query(
            r#"
            INSERT INTO batches (id, name, state, scheduled_at)
            VALUES ($1, $2, 'draft', $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await?;
        Self::row_to_batch(&row)
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Batch> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("batch", id))?;
        Self::row_to_batch(&row)
    }

    async fn set_batch_state(&self, id: Uuid, new: BatchState) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE batches SET state = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(new.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn assign_to_batch(&self, repository_id: Uuid, batch_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE repositories SET batch_id = $2, updated_at = NOW()
            WHERE id = $1 AND EXISTS (SELECT 1 FROM batches WHERE id = $2)
            "#,
        )
        .bind(repository_id)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh_batches(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE batches b SET state = 'running', updated_at = NOW()
            WHERE b.state = 'ready'
              AND EXISTS (
                  SELECT 1 FROM repositories r
                  WHERE r.batch_id = b.id AND r.state <> 'pending'
              )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE batches b SET state = 'finished', updated_at = NOW()
            WHERE b.state IN ('ready','running')
              AND EXISTS (SELECT 1 FROM repositories r WHERE r.batch_id = b.id)
              AND NOT EXISTS (
                  SELECT 1 FROM repositories r
                  WHERE r.batch_id = b.id
                    AND r.state NOT IN ('complete','wont_migrate','rolled_back')
              )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
