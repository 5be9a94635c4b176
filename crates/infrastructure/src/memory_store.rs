//! 内存作业存储实现
//!
//! 嵌入式部署和测试使用。作业表与去重表共用一把锁，
//! 查重插入因此天然是原子操作。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use conveyor_core::{
    errors::{ConveyorError, ConveyorResult},
    idempotency::IdempotencyRecord,
    models::{Job, JobStatus},
    traits::{JobStore, TransitionFields},
};

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<String, Job>,
    /// hash -> 去重记录
    idempotency: HashMap<String, IdempotencyRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：当前存储的作业数量
    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job) -> ConveyorResult<()> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(ConveyorError::Internal(format!(
                "作业 {} 已存在",
                job.id
            )));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        debug!("Created job {} ({})", job.id, job.command_type);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> ConveyorResult<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ConveyorError::job_not_found(job_id))
    }

    async fn transition(
        &self,
        job_id: &str,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> ConveyorResult<Job> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| ConveyorError::job_not_found(job_id))?;

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
        Ok(job.clone())
    }

    async fn check_and_insert_idempotency(
        &self,
        record: &IdempotencyRecord,
        window: chrono::Duration,
    ) -> ConveyorResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(existing) = state.idempotency.get(&record.hash) {
            if existing.is_within_window(window, now) {
                return Err(ConveyorError::Duplicate {
                    hash: existing.hash.clone(),
                    job_id: existing.job_id.clone(),
                });
            }
            // 窗口外的陈旧记录：被新的触发覆盖
        }
        state
            .idempotency
            .insert(record.hash.clone(), record.clone());
        Ok(())
    }

    async fn purge_idempotency_older_than(&self, cutoff: DateTime<Utc>) -> ConveyorResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| r.created_at >= cutoff);
        Ok((before - state.idempotency.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::new("Noop".to_string(), json!({}), None, 3)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        store.create_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let store = InMemoryJobStore::new();
        let err = store.get_job("nope").await.unwrap_err();
        assert!(matches!(err, ConveyorError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_transition_updates_fields() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        store.create_job(&job).await.unwrap();

        let updated = store
            .transition(
                &job.id,
                JobStatus::Running,
                TransitionFields {
                    attempt: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(updated.attempts, 1);
        assert!(updated.started_at.is_some());

        let completed = store
            .transition(
                &job.id,
                JobStatus::Completed,
                TransitionFields {
                    result: Some(json!({"ok": true})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.result, Some(json!({"ok": true})));
        assert!(completed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        store.create_job(&job).await.unwrap();

        let err = store
            .transition(&job.id, JobStatus::Completed, TransitionFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_job_rejects_writes() {
        let store = InMemoryJobStore::new();
        let job = sample_job();
        store.create_job(&job).await.unwrap();
        store
            .transition(&job.id, JobStatus::Running, TransitionFields::default())
            .await
            .unwrap();
        store
            .transition(&job.id, JobStatus::Failed, TransitionFields::default())
            .await
            .unwrap();

        let err = store
            .transition(&job.id, JobStatus::Pending, TransitionFields::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_idempotency_duplicate_within_window() {
        let store = InMemoryJobStore::new();
        let window = chrono::Duration::hours(24);
        let record = IdempotencyRecord::new("h1".to_string(), "j1".to_string());
        store
            .check_and_insert_idempotency(&record, window)
            .await
            .unwrap();

        let dup = IdempotencyRecord::new("h1".to_string(), "j2".to_string());
        let err = store
            .check_and_insert_idempotency(&dup, window)
            .await
            .unwrap_err();
        match err {
            ConveyorError::Duplicate { job_id, .. } => assert_eq!(job_id, "j1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expired_record_is_replaced() {
        let store = InMemoryJobStore::new();
        let window = chrono::Duration::hours(24);
        let mut stale = IdempotencyRecord::new("h1".to_string(), "j1".to_string());
        stale.created_at = Utc::now() - chrono::Duration::hours(48);
        store
            .check_and_insert_idempotency(&stale, window)
            .await
            .unwrap();

        let fresh = IdempotencyRecord::new("h1".to_string(), "j2".to_string());
        store
            .check_and_insert_idempotency(&fresh, window)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_old_records() {
        let store = InMemoryJobStore::new();
        let window = chrono::Duration::hours(24);
        let mut old = IdempotencyRecord::new("old".to_string(), "j1".to_string());
        old.created_at = Utc::now() - chrono::Duration::hours(48);
        store
            .check_and_insert_idempotency(&old, window)
            .await
            .unwrap();
        let fresh = IdempotencyRecord::new("fresh".to_string(), "j2".to_string());
        store
            .check_and_insert_idempotency(&fresh, window)
            .await
            .unwrap();

        let purged = store
            .purge_idempotency_older_than(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }
}
