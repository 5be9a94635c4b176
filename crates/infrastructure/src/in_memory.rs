//! 内存消息队列实现
//!
//! 用于嵌入式部署和测试的进程内队列。支持未确认消息跟踪：
//! 消费后消息进入在途集合，nack(requeue) 会把消息放回队首重新投递，
//! 与Broker的至少一次语义保持一致。延迟投递通过定时任务原生支持。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use conveyor_core::{
    errors::{ConveyorError, ConveyorResult},
    models::TaskMessage,
    traits::{dead_letter_queue_name, Delivery, MessageQueue},
};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<TaskMessage>,
    /// 在途消息：delivery_tag -> 消息
    unacked: HashMap<u64, TaskMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    next_tag: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            next_tag: AtomicU64::new(1),
        }
    }

    async fn get_or_create(&self, queue: &str) {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default();
    }
}

#[async_trait]
impl MessageQueue for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> ConveyorResult<()> {
        self.get_or_create(queue).await;
        self.get_or_create(&dead_letter_queue_name(queue)).await;
        debug!("Declared in-memory queue '{}' with paired DLQ", queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, task: &TaskMessage) -> ConveyorResult<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(task.clone());
        debug!("Published task for job {} to '{}'", task.job_id, queue);
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        task: &TaskMessage,
        delay: Duration,
    ) -> ConveyorResult<()> {
        let queues = Arc::clone(&self.queues);
        let queue = queue.to_string();
        let task = task.clone();
        debug!(
            "Scheduling delayed delivery for job {} to '{}' in {:?}",
            task.job_id, queue, delay
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut queues = queues.lock().await;
            queues.entry(queue).or_default().ready.push_back(task);
        });
        Ok(())
    }

    fn supports_delayed_delivery(&self) -> bool {
        true
    }

    async fn consume_one(&self, queue: &str) -> ConveyorResult<Option<Delivery>> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        match state.ready.pop_front() {
            Some(task) => {
                let delivery_tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
                state.unacked.insert(delivery_tag, task.clone());
                Ok(Some(Delivery {
                    queue: queue.to_string(),
                    delivery_tag,
                    task,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> ConveyorResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(&delivery.queue).ok_or_else(|| {
            ConveyorError::MessageQueue(format!("Queue '{}' not found", delivery.queue))
        })?;
        if state.unacked.remove(&delivery.delivery_tag).is_none() {
            warn!(
                "Ack for unknown delivery tag {} on '{}'",
                delivery.delivery_tag, delivery.queue
            );
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> ConveyorResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(&delivery.queue).ok_or_else(|| {
            ConveyorError::MessageQueue(format!("Queue '{}' not found", delivery.queue))
        })?;
        match state.unacked.remove(&delivery.delivery_tag) {
            Some(task) if requeue => {
                // 回到队首，尽快被下一个空闲worker重新拿到
                state.ready.push_front(task);
            }
            Some(_) => {
                debug!(
                    "Dropped nacked delivery {} on '{}'",
                    delivery.delivery_tag, delivery.queue
                );
            }
            None => {
                warn!(
                    "Nack for unknown delivery tag {} on '{}'",
                    delivery.delivery_tag, delivery.queue
                );
            }
        }
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> ConveyorResult<u32> {
        let queues = self.queues.lock().await;
        let size = queues
            .get(queue)
            .map(|state| state.ready.len() as u32)
            .ok_or_else(|| ConveyorError::MessageQueue(format!("Queue '{queue}' not found")))?;
        Ok(size)
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            let purged = state.ready.len();
            state.ready.clear();
            debug!("Purged {} messages from '{}'", purged, queue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_task(job_id: &str) -> TaskMessage {
        TaskMessage::new(job_id.to_string(), "Noop".to_string(), json!({}), 3)
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        broker.publish("jobs", &sample_task("j1")).await.unwrap();

        assert_eq!(broker.queue_size("jobs").await.unwrap(), 1);

        let delivery = broker.consume_one("jobs").await.unwrap().unwrap();
        assert_eq!(delivery.task.job_id, "j1");
        // 在途消息不再计入队列大小
        assert_eq!(broker.queue_size("jobs").await.unwrap(), 0);

        broker.ack(&delivery).await.unwrap();
        assert!(broker.consume_one("jobs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        broker.publish("jobs", &sample_task("j1")).await.unwrap();

        let delivery = broker.consume_one("jobs").await.unwrap().unwrap();
        broker.nack(&delivery, true).await.unwrap();

        let redelivered = broker.consume_one("jobs").await.unwrap().unwrap();
        assert_eq!(redelivered.task.job_id, "j1");
        assert_ne!(redelivered.delivery_tag, delivery.delivery_tag);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        broker.publish("jobs", &sample_task("j1")).await.unwrap();

        let delivery = broker.consume_one("jobs").await.unwrap().unwrap();
        broker.nack(&delivery, false).await.unwrap();
        assert!(broker.consume_one("jobs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_delivery_is_invisible_until_due() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        broker
            .publish_delayed("jobs", &sample_task("j1"), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(broker.consume_one("jobs").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let delivery = broker.consume_one("jobs").await.unwrap().unwrap();
        assert_eq!(delivery.task.job_id, "j1");
    }

    #[tokio::test]
    async fn test_declare_creates_paired_dlq() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        assert_eq!(broker.queue_size("jobs.dlq").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fifo_ordering() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        for i in 0..3 {
            broker
                .publish("jobs", &sample_task(&format!("j{i}")))
                .await
                .unwrap();
        }
        for i in 0..3 {
            let delivery = broker.consume_one("jobs").await.unwrap().unwrap();
            assert_eq!(delivery.task.job_id, format!("j{i}"));
            broker.ack(&delivery).await.unwrap();
        }
    }
}
