//! Postgres-backed trigger store.
//!
//! Table names carry a configurable prefix so the scheduler tables can
//! share a database with application tables. All queries are built at
//! runtime against that prefix; the bundled migrations create the tables
//! with the default `cm_` prefix.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use copper_metronome_core::{FireInstanceId, JobKey, TriggerKey};
use copper_metronome_store::{
    JobDetail, JobExecution, MisfirePolicy, StoreError, Trigger, TriggerState, TriggerStore,
};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

/// Name of the row in the locks table guarding batch acquisition.
const TRIGGER_ACCESS_LOCK: &str = "trigger_access";

/// Row type for trigger queries.
#[derive(FromRow)]
struct TriggerRow {
    trigger_name: String,
    trigger_group: String,
    job_name: String,
    job_group: String,
    cron_expression: Option<String>,
    state: String,
    next_fire_time: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    misfire_policy: String,
    payload: Option<serde_json::Value>,
    recovering: bool,
    owner: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TriggerRow {
    fn into_trigger(self) -> Trigger {
        Trigger {
            key: TriggerKey::with_group(self.trigger_name, self.trigger_group),
            job_key: JobKey::with_group(self.job_name, self.job_group),
            cron_expression: self.cron_expression,
            state: TriggerState::from_str_value(&self.state),
            next_fire_time: self.next_fire_time,
            previous_fire_time: self.previous_fire_time,
            misfire_policy: MisfirePolicy::from_str_value(&self.misfire_policy),
            payload: self.payload,
            recovering: self.recovering,
            owner: self.owner,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Row type for job queries.
#[derive(FromRow)]
struct JobRow {
    job_name: String,
    job_group: String,
    description: Option<String>,
    disallow_concurrent: bool,
}

impl JobRow {
    fn into_detail(self) -> JobDetail {
        JobDetail {
            key: JobKey::with_group(self.job_name, self.job_group),
            description: self.description,
            disallow_concurrent: self.disallow_concurrent,
        }
    }
}

/// Row type for firing-instance queries.
#[derive(FromRow)]
struct ExecutionRow {
    fire_instance_id: String,
    job_name: String,
    job_group: String,
    trigger_name: String,
    trigger_group: String,
    scheduled_time: DateTime<Utc>,
    fired_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    recovering: bool,
    vetoed: bool,
}

impl ExecutionRow {
    fn try_into_execution(self) -> Result<JobExecution, StoreError> {
        let fire_instance_id =
            FireInstanceId::from_str(&self.fire_instance_id).map_err(|e| StoreError::Backend {
                reason: format!("invalid fire instance id '{}': {e}", self.fire_instance_id),
            })?;
        Ok(JobExecution {
            fire_instance_id,
            job_key: JobKey::with_group(self.job_name, self.job_group),
            trigger_key: TriggerKey::with_group(self.trigger_name, self.trigger_group),
            scheduled_time: self.scheduled_time,
            fired_at: self.fired_at,
            finished_at: self.finished_at,
            error_message: self.error_message,
            recovering: self.recovering,
            vetoed: self.vetoed,
        })
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend {
        reason: e.to_string(),
    }
}

/// Trigger store over a PostgreSQL connection pool.
pub struct PgTriggerStore {
    pool: PgPool,
    prefix: String,
}

impl PgTriggerStore {
    /// Creates a store using `prefix` for all table names.
    #[must_use]
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }
}

#[async_trait]
impl TriggerStore for PgTriggerStore {
    async fn insert_job(&self, job: JobDetail) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {jobs} (job_name, job_group, description, disallow_concurrent, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (job_name, job_group)
            DO UPDATE SET description = $3, disallow_concurrent = $4
            "#,
            jobs = self.table("jobs"),
        );
        sqlx::query(&sql)
            .bind(&job.key.name)
            .bind(&job.key.group)
            .bind(&job.description)
            .bind(job.disallow_concurrent)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>, StoreError> {
        let sql = format!(
            r#"
            SELECT job_name, job_group, description, disallow_concurrent
            FROM {jobs}
            WHERE job_name = $1 AND job_group = $2
            "#,
            jobs = self.table("jobs"),
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(JobRow::into_detail))
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {jobs} WHERE job_name = $1 AND job_group = $2",
            jobs = self.table("jobs"),
        );
        let result = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_trigger(&self, trigger: Trigger) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {triggers}
                (trigger_name, trigger_group, job_name, job_group, cron_expression,
                 state, next_fire_time, previous_fire_time, misfire_policy, payload,
                 recovering, owner, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            triggers = self.table("triggers"),
        );
        sqlx::query(&sql)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&trigger.job_key.name)
            .bind(&trigger.job_key.group)
            .bind(&trigger.cron_expression)
            .bind(trigger.state.as_str())
            .bind(trigger.next_fire_time)
            .bind(trigger.previous_fire_time)
            .bind(trigger.misfire_policy.as_str())
            .bind(&trigger.payload)
            .bind(trigger.recovering)
            .bind(&trigger.owner)
            .bind(trigger.created_at)
            .bind(trigger.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation())
                {
                    StoreError::AlreadyExists {
                        key: trigger.key.clone(),
                    }
                } else {
                    backend(e)
                }
            })?;
        Ok(())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>, StoreError> {
        let sql = format!(
            r#"
            SELECT trigger_name, trigger_group, job_name, job_group, cron_expression,
                   state, next_fire_time, previous_fire_time, misfire_policy, payload,
                   recovering, owner, created_at, updated_at
            FROM {triggers}
            WHERE trigger_name = $1 AND trigger_group = $2
            "#,
            triggers = self.table("triggers"),
        );
        let row: Option<TriggerRow> = sqlx::query_as(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(TriggerRow::into_trigger))
    }

    async fn update_trigger(&self, trigger: Trigger) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {triggers}
            SET cron_expression = $3, state = $4, next_fire_time = $5,
                previous_fire_time = $6, misfire_policy = $7, payload = $8,
                recovering = $9, owner = $10, updated_at = $11
            WHERE trigger_name = $1 AND trigger_group = $2
            "#,
            triggers = self.table("triggers"),
        );
        let result = sqlx::query(&sql)
            .bind(&trigger.key.name)
            .bind(&trigger.key.group)
            .bind(&trigger.cron_expression)
            .bind(trigger.state.as_str())
            .bind(trigger.next_fire_time)
            .bind(trigger.previous_fire_time)
            .bind(trigger.misfire_policy.as_str())
            .bind(&trigger.payload)
            .bind(trigger.recovering)
            .bind(&trigger.owner)
            .bind(trigger.updated_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                key: trigger.key.clone(),
            });
        }
        Ok(())
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {triggers} WHERE trigger_name = $1 AND trigger_group = $2",
            triggers = self.table("triggers"),
        );
        let result = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set_state(
        &self,
        key: &TriggerKey,
        expected: TriggerState,
        new: TriggerState,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {triggers}
            SET state = $4, updated_at = NOW()
            WHERE trigger_name = $1 AND trigger_group = $2 AND state = $3
            "#,
            triggers = self.table("triggers"),
        );
        let result = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .bind(expected.as_str())
            .bind(new.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        batch: usize,
        owner: &str,
        locked: bool,
    ) -> Result<Vec<Trigger>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        if locked {
            let sql = format!(
                "SELECT lock_name FROM {locks} WHERE lock_name = $1 FOR UPDATE",
                locks = self.table("locks"),
            );
            sqlx::query(&sql)
                .bind(TRIGGER_ACCESS_LOCK)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
        }

        // SKIP LOCKED keeps unlocked single-trigger acquisition from
        // stalling behind a concurrent pass holding row locks.
        let sql = format!(
            r#"
            UPDATE {triggers}
            SET state = 'acquired', owner = $2, updated_at = NOW()
            WHERE (trigger_name, trigger_group) IN (
                SELECT trigger_name, trigger_group
                FROM {triggers}
                WHERE state = 'waiting'
                  AND next_fire_time IS NOT NULL
                  AND next_fire_time <= $1
                ORDER BY next_fire_time
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING trigger_name, trigger_group, job_name, job_group, cron_expression,
                      state, next_fire_time, previous_fire_time, misfire_policy, payload,
                      recovering, owner, created_at, updated_at
            "#,
            triggers = self.table("triggers"),
        );
        let rows: Vec<TriggerRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(owner)
            .bind(batch as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(rows.into_iter().map(TriggerRow::into_trigger).collect())
    }

    async fn list_jobs(&self) -> Result<Vec<(JobKey, Vec<Trigger>)>, StoreError> {
        let sql = format!(
            r#"
            SELECT job_name, job_group, description, disallow_concurrent
            FROM {jobs}
            ORDER BY job_group, job_name
            "#,
            jobs = self.table("jobs"),
        );
        let jobs: Vec<JobRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let sql = format!(
            r#"
            SELECT trigger_name, trigger_group, job_name, job_group, cron_expression,
                   state, next_fire_time, previous_fire_time, misfire_policy, payload,
                   recovering, owner, created_at, updated_at
            FROM {triggers}
            "#,
            triggers = self.table("triggers"),
        );
        let triggers: Vec<TriggerRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let mut triggers: Vec<Trigger> =
            triggers.into_iter().map(TriggerRow::into_trigger).collect();

        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let detail = job.into_detail();
            let (matching, rest): (Vec<Trigger>, Vec<Trigger>) = triggers
                .into_iter()
                .partition(|t| t.job_key == detail.key);
            triggers = rest;
            out.push((detail.key, matching));
        }
        Ok(out)
    }

    async fn triggers_in_state(
        &self,
        state: TriggerState,
        owner: &str,
    ) -> Result<Vec<Trigger>, StoreError> {
        let sql = format!(
            r#"
            SELECT trigger_name, trigger_group, job_name, job_group, cron_expression,
                   state, next_fire_time, previous_fire_time, misfire_policy, payload,
                   recovering, owner, created_at, updated_at
            FROM {triggers}
            WHERE state = $1 AND owner = $2
            "#,
            triggers = self.table("triggers"),
        );
        let rows: Vec<TriggerRow> = sqlx::query_as(&sql)
            .bind(state.as_str())
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().map(TriggerRow::into_trigger).collect())
    }

    async fn record_execution(&self, execution: JobExecution) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {fired}
                (fire_instance_id, job_name, job_group, trigger_name, trigger_group,
                 scheduled_time, fired_at, finished_at, error_message, recovering, vetoed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            fired = self.table("fired_triggers"),
        );
        sqlx::query(&sql)
            .bind(execution.fire_instance_id.to_string())
            .bind(&execution.job_key.name)
            .bind(&execution.job_key.group)
            .bind(&execution.trigger_key.name)
            .bind(&execution.trigger_key.group)
            .bind(execution.scheduled_time)
            .bind(execution.fired_at)
            .bind(execution.finished_at)
            .bind(&execution.error_message)
            .bind(execution.recovering)
            .bind(execution.vetoed)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_execution(&self, execution: JobExecution) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {fired}
            SET finished_at = $2, error_message = $3, vetoed = $4
            WHERE fire_instance_id = $1
            "#,
            fired = self.table("fired_triggers"),
        );
        let result = sqlx::query(&sql)
            .bind(execution.fire_instance_id.to_string())
            .bind(execution.finished_at)
            .bind(&execution.error_message)
            .bind(execution.vetoed)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend {
                reason: format!("unknown fire instance {}", execution.fire_instance_id),
            });
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        id: FireInstanceId,
    ) -> Result<Option<JobExecution>, StoreError> {
        let sql = format!(
            r#"
            SELECT fire_instance_id, job_name, job_group, trigger_name, trigger_group,
                   scheduled_time, fired_at, finished_at, error_message, recovering, vetoed
            FROM {fired}
            WHERE fire_instance_id = $1
            "#,
            fired = self.table("fired_triggers"),
        );
        let row: Option<ExecutionRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(ExecutionRow::try_into_execution).transpose()
    }

    async fn executions_for_job(&self, key: &JobKey) -> Result<Vec<JobExecution>, StoreError> {
        let sql = format!(
            r#"
            SELECT fire_instance_id, job_name, job_group, trigger_name, trigger_group,
                   scheduled_time, fired_at, finished_at, error_message, recovering, vetoed
            FROM {fired}
            WHERE job_name = $1 AND job_group = $2
            ORDER BY fired_at DESC
            "#,
            fired = self.table("fired_triggers"),
        );
        let rows: Vec<ExecutionRow> = sqlx::query_as(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter()
            .map(ExecutionRow::try_into_execution)
            .collect()
    }

    async fn has_executing(&self, key: &JobKey) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM {fired}
                WHERE job_name = $1 AND job_group = $2
                  AND finished_at IS NULL AND vetoed = false
            )
            "#,
            fired = self.table("fired_triggers"),
        );
        let (executing,): (bool,) = sqlx::query_as(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(executing)
    }

    async fn purge_executions(&self, key: &JobKey) -> Result<u32, StoreError> {
        let sql = format!(
            "DELETE FROM {fired} WHERE job_name = $1 AND job_group = $2",
            fired = self.table("fired_triggers"),
        );
        let result = sqlx::query(&sql)
            .bind(&key.name)
            .bind(&key.group)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() as u32)
    }

    async fn record_heartbeat(&self, instance: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {state} (instance_name, last_heartbeat)
            VALUES ($1, $2)
            ON CONFLICT (instance_name)
            DO UPDATE SET last_heartbeat = $2
            "#,
            state = self.table("scheduler_state"),
        );
        sqlx::query(&sql)
            .bind(instance)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
