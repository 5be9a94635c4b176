//! conveyor-ingress
//!
//! 作业受理入口：校验触发请求、幂等去重、持久化作业并发布
//! 初始投递消息。去重在作业创建之前完成，保留窗口内相同的
//! 命令类型加载荷只会产生一个作业。

use std::sync::Arc;

use tracing::{debug, info};

use conveyor_core::{
    command::CommandRegistry,
    errors::{ConveyorError, ConveyorResult},
    idempotency::{trigger_hash, IdempotencyRecord},
    models::{Job, JobEvent, TaskMessage},
    traits::{EventPublisher, JobStore, MessageQueue},
};

/// 一次触发请求
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub command_type: String,
    pub payload: serde_json::Value,
    /// 关联的业务资源标识（可选）
    pub resource_id: Option<String>,
    /// 不指定时使用配置的默认值
    pub max_attempts: Option<i32>,
}

impl EnqueueRequest {
    pub fn new(command_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
            resource_id: None,
            max_attempts: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

pub struct IngressService {
    job_store: Arc<dyn JobStore>,
    message_queue: Arc<dyn MessageQueue>,
    event_publisher: Arc<dyn EventPublisher>,
    registry: Arc<CommandRegistry>,
    job_queue: String,
    default_max_attempts: i32,
    dedup_window: chrono::Duration,
}

impl IngressService {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        message_queue: Arc<dyn MessageQueue>,
        event_publisher: Arc<dyn EventPublisher>,
        registry: Arc<CommandRegistry>,
        job_queue: String,
        default_max_attempts: i32,
        dedup_window_hours: i64,
    ) -> Self {
        Self {
            job_store,
            message_queue,
            event_publisher,
            registry,
            job_queue,
            default_max_attempts,
            dedup_window: chrono::Duration::hours(dedup_window_hours),
        }
    }

    /// 受理触发请求，返回新建的作业
    ///
    /// 保留窗口内相同的命令类型加规范化载荷返回 `Duplicate`，
    /// 其中携带已有作业的标识。未注册的命令类型在受理时即被拒绝，
    /// 不会产生作业。
    pub async fn enqueue(&self, request: EnqueueRequest) -> ConveyorResult<Job> {
        if !self.registry.contains(&request.command_type) {
            return Err(ConveyorError::unknown_command(&request.command_type));
        }

        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts < 1 {
            return Err(ConveyorError::validation(format!(
                "max_attempts 必须 >= 1，当前为 {max_attempts}"
            )));
        }

        let hash = trigger_hash(&request.command_type, &request.payload);
        let job = Job::new(
            request.command_type.clone(),
            request.payload.clone(),
            request.resource_id.clone(),
            max_attempts,
        );

        // 原子查重插入：并发的相同触发只有一个会走到这之后
        let record = IdempotencyRecord::new(hash.clone(), job.id.clone());
        self.job_store
            .check_and_insert_idempotency(&record, self.dedup_window)
            .await?;
        debug!("触发哈希 {} 通过去重检查", hash);

        self.job_store.create_job(&job).await?;

        let task = TaskMessage::new(
            job.id.clone(),
            job.command_type.clone(),
            job.payload.clone(),
            max_attempts,
        );
        self.message_queue.publish(&self.job_queue, &task).await?;

        if let Err(e) = self
            .event_publisher
            .publish_event(&JobEvent::created(&job.id, &job.command_type))
            .await
        {
            tracing::warn!("发布作业创建事件失败: {}", e);
        }

        info!(
            "受理作业 {} ({})，最多 {} 次尝试",
            job.id, job.command_type, max_attempts
        );
        Ok(job)
    }

    /// 查询作业当前状态
    pub async fn get_job(&self, job_id: &str) -> ConveyorResult<Job> {
        self.job_store.get_job(job_id).await
    }

    /// 工作队列当前积压
    pub async fn queue_depth(&self) -> ConveyorResult<u32> {
        self.message_queue.queue_size(&self.job_queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::command::{Command, CommandContext};
    use conveyor_core::models::{JobEventType, JobStatus};
    use conveyor_infrastructure::{InMemoryBroker, InMemoryEventPublisher, InMemoryJobStore};
    use serde_json::json;

    struct NoopCommand;

    #[async_trait]
    impl Command for NoopCommand {
        async fn execute(&self, _ctx: &CommandContext) -> ConveyorResult<serde_json::Value> {
            Ok(json!({}))
        }
    }

    async fn service() -> (IngressService, Arc<InMemoryBroker>, Arc<InMemoryEventPublisher>) {
        let mut registry = CommandRegistry::new();
        registry.register("Noop", || Arc::new(NoopCommand)).unwrap();

        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("jobs").await.unwrap();
        let events = Arc::new(InMemoryEventPublisher::new());
        let service = IngressService::new(
            Arc::new(InMemoryJobStore::new()),
            broker.clone(),
            events.clone(),
            Arc::new(registry),
            "jobs".to_string(),
            3,
            24,
        );
        (service, broker, events)
    }

    #[tokio::test]
    async fn test_enqueue_creates_job_and_publishes() {
        let (service, broker, events) = service().await;

        let job = service
            .enqueue(EnqueueRequest::new("Noop", json!({"sku": "A-1"})))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 3);

        let loaded = service.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.id, job.id);

        let delivery = broker.consume_one("jobs").await.unwrap().unwrap();
        assert_eq!(delivery.task.job_id, job.id);
        assert_eq!(delivery.task.attempt, 1);
        assert_eq!(delivery.task.payload, json!({"sku": "A-1"}));

        let published = events.events().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, JobEventType::JobCreated);
    }

    #[tokio::test]
    async fn test_duplicate_trigger_rejected() {
        let (service, broker, _) = service().await;

        let first = service
            .enqueue(EnqueueRequest::new(
                "Noop",
                json!({"sku": "A-1", "qty": 2}),
            ))
            .await
            .unwrap();

        // 键顺序不同的等价载荷仍然算重复
        let err = service
            .enqueue(EnqueueRequest::new(
                "Noop",
                json!({"qty": 2, "sku": "A-1"}),
            ))
            .await
            .unwrap_err();
        match err {
            ConveyorError::Duplicate { job_id, .. } => assert_eq!(job_id, first.id),
            other => panic!("unexpected error: {other}"),
        }

        // 重复触发不产生第二条消息
        assert_eq!(broker.queue_size("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_different_payload_is_not_duplicate() {
        let (service, _, _) = service().await;

        service
            .enqueue(EnqueueRequest::new("Noop", json!({"sku": "A-1"})))
            .await
            .unwrap();
        service
            .enqueue(EnqueueRequest::new("Noop", json!({"sku": "A-2"})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_command_rejected_at_ingress() {
        let (service, broker, _) = service().await;

        let err = service
            .enqueue(EnqueueRequest::new("Missing", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownCommand { .. }));
        assert_eq!(broker.queue_size("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_max_attempts_rejected() {
        let (service, _, _) = service().await;
        let err = service
            .enqueue(EnqueueRequest::new("Noop", json!({})).with_max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_request_options() {
        let (service, _, _) = service().await;
        let job = service
            .enqueue(
                EnqueueRequest::new("Noop", json!({}))
                    .with_resource_id("listing-42")
                    .with_max_attempts(5),
            )
            .await
            .unwrap();
        assert_eq!(job.resource_id.as_deref(), Some("listing-42"));
        assert_eq!(job.max_attempts, 5);
    }
}
