use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ConveyorError, ConveyorResult};

/// 作业记录
///
/// 一个作业对应一个逻辑工作单元，包含有界的重试历史。
/// 创建后由Dispatcher独占修改；进入终态后视为不可变历史。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// 关联的业务资源（可选），例如商品或帖子的标识
    pub resource_id: Option<String>,
    pub command_type: String,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> ConveyorResult<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(ConveyorError::Internal(format!("未知的作业状态: {other}"))),
        }
    }

    /// 状态只允许向前推进: PENDING -> RUNNING -> {COMPLETED | FAILED}
    ///
    /// RUNNING -> PENDING 用于重试：失败后作业回到等待队列，
    /// 下一次投递会再次进入 RUNNING。RUNNING -> RUNNING 是幂等的
    /// 重新认领：至少一次投递下，上一次尝试的结果没有落盘时消息
    /// 会被重投递，必须能再次执行而不是卡死。终态不允许任何迁移。
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        JobStatus::parse(s).map_err(|e| e.to_string().into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl Job {
    pub fn new(
        command_type: String,
        payload: serde_json::Value,
        resource_id: Option<String>,
        max_attempts: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource_id,
            command_type,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            payload,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.status, JobStatus::Completed)
    }

    /// 推进作业状态，校验状态机不变量并维护时间戳
    pub fn transition_to(&mut self, next: JobStatus) -> ConveyorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ConveyorError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        match next {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobStatus::Completed | JobStatus::Failed => {
                if self.completed_at.is_none() {
                    self.completed_at = Some(Utc::now());
                }
            }
            JobStatus::Pending => {}
        }
        Ok(())
    }

    pub fn execution_duration_ms(&self) -> Option<i64> {
        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            Some((completed - started).num_milliseconds())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::new("PublishListing".to_string(), json!({"sku": "A-1"}), None, 3)
    }

    #[test]
    fn test_new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.last_error.is_none());
        assert!(job.started_at.is_none());
        assert!(!job.id.is_empty());
    }

    #[test]
    fn test_valid_transitions() {
        let mut job = sample_job();
        job.transition_to(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        job.transition_to(JobStatus::Completed).unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.is_successful());
    }

    #[test]
    fn test_retry_transition_back_to_pending() {
        let mut job = sample_job();
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Pending).unwrap();
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Failed).unwrap();
        assert!(job.is_finished());
    }

    #[test]
    fn test_running_reclaim_is_idempotent() {
        let mut job = sample_job();
        job.transition_to(JobStatus::Running).unwrap();
        let started = job.started_at;
        // 结果丢失后的重投递重新认领作业，首次启动时间保留
        job.transition_to(JobStatus::Running).unwrap();
        assert_eq!(job.started_at, started);
        job.transition_to(JobStatus::Completed).unwrap();
    }

    #[test]
    fn test_no_transition_skips_running() {
        let mut job = sample_job();
        assert!(job.transition_to(JobStatus::Completed).is_err());
        assert!(job.transition_to(JobStatus::Failed).is_err());
    }

    #[test]
    fn test_terminal_states_are_immutable() {
        let mut job = sample_job();
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();
        assert!(job.transition_to(JobStatus::Running).is_err());
        assert!(job.transition_to(JobStatus::Pending).is_err());
        assert!(job.transition_to(JobStatus::Failed).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("BOGUS").is_err());
    }
}
