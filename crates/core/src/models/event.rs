use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 领域事件信封
///
/// 发布到事件流供下游消费，尽力而为；作业自身的持久状态才是权威来源。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: String,
    pub event_type: JobEventType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobRetryScheduled,
    JobDeadLettered,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::JobCreated => "job_created",
            JobEventType::JobStarted => "job_started",
            JobEventType::JobCompleted => "job_completed",
            JobEventType::JobFailed => "job_failed",
            JobEventType::JobRetryScheduled => "job_retry_scheduled",
            JobEventType::JobDeadLettered => "job_dead_lettered",
        }
    }
}

impl JobEvent {
    pub fn new(event_type: JobEventType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn created(job_id: &str, command_type: &str) -> Self {
        Self::new(
            JobEventType::JobCreated,
            serde_json::json!({
                "job_id": job_id,
                "command_type": command_type,
            }),
        )
    }

    pub fn started(job_id: &str, attempt: i32) -> Self {
        Self::new(
            JobEventType::JobStarted,
            serde_json::json!({
                "job_id": job_id,
                "attempt": attempt,
            }),
        )
    }

    pub fn completed(job_id: &str, result: Option<&serde_json::Value>) -> Self {
        Self::new(
            JobEventType::JobCompleted,
            serde_json::json!({
                "job_id": job_id,
                "result": result,
            }),
        )
    }

    pub fn failed(job_id: &str, error: &str, attempt: i32) -> Self {
        Self::new(
            JobEventType::JobFailed,
            serde_json::json!({
                "job_id": job_id,
                "error": error,
                "attempt": attempt,
            }),
        )
    }

    pub fn dead_lettered(job_id: &str, error: &str) -> Self {
        Self::new(
            JobEventType::JobDeadLettered,
            serde_json::json!({
                "job_id": job_id,
                "error": error,
            }),
        )
    }

    pub fn retry_scheduled(job_id: &str, next_attempt: i32, delay_ms: u64) -> Self {
        Self::new(
            JobEventType::JobRetryScheduled,
            serde_json::json!({
                "job_id": job_id,
                "next_attempt": next_attempt,
                "delay_ms": delay_ms,
            }),
        )
    }
}
