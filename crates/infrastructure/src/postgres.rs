//! PostgreSQL作业存储实现
//!
//! 状态迁移在事务内执行：SELECT ... FOR UPDATE 锁定行，
//! 在进程内校验状态机后再写回，并发的迁移请求串行化。
//! 去重表依赖哈希列的唯一约束做原子的insert-once。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;

use conveyor_core::{
    errors::{ConveyorError, ConveyorResult},
    idempotency::IdempotencyRecord,
    models::{Job, JobStatus},
    traits::{JobStore, TransitionFields},
};

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::postgres::PgRow) -> ConveyorResult<Job> {
        Ok(Job {
            id: row.try_get("id")?,
            resource_id: row.try_get("resource_id")?,
            command_type: row.try_get("command_type")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: &Job) -> ConveyorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, resource_id, command_type, status, attempts, max_attempts,
                last_error, payload, result, created_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&job.id)
        .bind(&job.resource_id)
        .bind(&job.command_type)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.last_error)
        .bind(&job.payload)
        .bind(&job.result)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        debug!("Created job {} ({})", job.id, job.command_type);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> ConveyorResult<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ConveyorError::job_not_found(job_id))?;

        Self::row_to_job(&row)
    }

    async fn transition(
        &self,
        job_id: &str,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> ConveyorResult<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| ConveyorError::job_not_found(job_id))?;

        let mut job = Self::row_to_job(&row)?;
        job.transition_to(new_status)?;
        if let Some(attempt) = fields.attempt {
            job.attempts = attempt;
        }
        if let Some(last_error) = fields.last_error {
            job.last_error = Some(last_error);
        }
        if let Some(result) = fields.result {
            job.result = Some(result);
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, attempts = $3, last_error = $4, result = $5,
                started_at = $6, completed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&job.id)
        .bind(job.status)
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(&job.result)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn check_and_insert_idempotency(
        &self,
        record: &IdempotencyRecord,
        window: chrono::Duration,
    ) -> ConveyorResult<()> {
        // 唯一约束 + ON CONFLICT DO NOTHING：并发的相同哈希只有一个能插入
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (hash, job_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(&record.hash)
        .bind(&record.job_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(());
        }

        // 哈希已存在：窗口外的陈旧记录可以被当前触发接管
        let cutoff = Utc::now() - window;
        let claimed = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET job_id = $2, created_at = $3
            WHERE hash = $1 AND created_at < $4
            "#,
        )
        .bind(&record.hash)
        .bind(&record.job_id)
        .bind(record.created_at)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return Ok(());
        }

        let row = sqlx::query("SELECT job_id FROM idempotency_records WHERE hash = $1")
            .bind(&record.hash)
            .fetch_optional(&self.pool)
            .await?;

        let job_id = row
            .map(|r| r.try_get::<String, _>("job_id"))
            .transpose()?
            .unwrap_or_else(|| "<unknown>".to_string());

        Err(ConveyorError::Duplicate {
            hash: record.hash.clone(),
            job_id,
        })
    }

    async fn purge_idempotency_older_than(&self, cutoff: DateTime<Utc>) -> ConveyorResult<u64> {
        let deleted = sqlx::query("DELETE FROM idempotency_records WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        debug!("Purged {} idempotency records", deleted.rows_affected());
        Ok(deleted.rows_affected())
    }
}
