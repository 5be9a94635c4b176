use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    errors::ConveyorResult,
    idempotency::IdempotencyRecord,
    models::{Job, JobStatus},
};

/// 状态迁移附带写入的字段
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub attempt: Option<i32>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// 作业存储契约
///
/// 所有变更以单个作业为粒度保持事务性。迁移必须校验状态机：
/// 当前状态不允许迁移到目标状态时返回 `InvalidTransition`，
/// 已处于终态的作业不再接受任何写入。
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 持久化新建的作业（PENDING）
    async fn create_job(&self, job: &Job) -> ConveyorResult<()>;

    /// 读取作业，不存在时返回 `JobNotFound`
    async fn get_job(&self, job_id: &str) -> ConveyorResult<Job>;

    /// 推进作业状态并写入附带字段，返回更新后的作业
    async fn transition(
        &self,
        job_id: &str,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> ConveyorResult<Job>;

    /// 原子的查重插入：哈希已存在且在窗口内时返回 `Duplicate`
    ///
    /// 必须是单个原子操作（唯一约束插入），不允许先读后写，
    /// 否则并发的相同触发会双双通过检查。
    async fn check_and_insert_idempotency(
        &self,
        record: &IdempotencyRecord,
        window: chrono::Duration,
    ) -> ConveyorResult<()>;

    /// 清理窗口外的去重记录，返回删除条数
    async fn purge_idempotency_older_than(&self, cutoff: DateTime<Utc>) -> ConveyorResult<u64>;
}
