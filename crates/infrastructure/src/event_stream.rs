//! 事件发布实现
//!
//! 事件流是尽力而为的：发布失败只记录告警，不影响作业处理流程。
//! 下游需要权威状态时应查询作业存储。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use conveyor_core::{
    errors::{ConveyorError, ConveyorResult},
    models::JobEvent,
    traits::EventPublisher,
};

use crate::rabbitmq::RabbitMqBroker;

/// 发布事件到RabbitMQ事件队列
pub struct RabbitMqEventPublisher {
    broker: Arc<RabbitMqBroker>,
    event_queue: String,
}

impl RabbitMqEventPublisher {
    pub fn new(broker: Arc<RabbitMqBroker>, event_queue: String) -> Self {
        Self {
            broker,
            event_queue,
        }
    }
}

#[async_trait]
impl EventPublisher for RabbitMqEventPublisher {
    async fn publish_event(&self, event: &JobEvent) -> ConveyorResult<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ConveyorError::Serialization(format!("序列化事件失败: {e}")))?;

        if let Err(e) = self.broker.publish_raw(&self.event_queue, &payload).await {
            warn!(
                "发布事件 {} ({:?}) 失败: {}",
                event.id, event.event_type, e
            );
        }
        Ok(())
    }
}

/// 进程内事件发布器，嵌入式模式和测试使用
#[derive(Debug, Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<JobEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已发布事件的快照
    pub async fn events(&self) -> Vec<JobEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish_event(&self, event: &JobEvent) -> ConveyorResult<()> {
        debug!("Event {:?} for {}", event.event_type, event.data["job_id"]);
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::models::JobEventType;

    #[tokio::test]
    async fn test_in_memory_publisher_records_events() {
        let publisher = InMemoryEventPublisher::new();
        publisher
            .publish_event(&JobEvent::completed("j1", None))
            .await
            .unwrap();
        publisher
            .publish_event(&JobEvent::dead_lettered("j2", "boom"))
            .await
            .unwrap();

        let events = publisher.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, JobEventType::JobCompleted);
        assert_eq!(events[1].event_type, JobEventType::JobDeadLettered);
    }
}
