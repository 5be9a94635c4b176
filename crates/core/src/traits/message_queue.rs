use std::time::Duration;

use async_trait::async_trait;

use crate::{errors::ConveyorResult, models::TaskMessage};

/// 每个工作队列配对的死信队列名
pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// 一次投递：任务消息加上Broker侧的投递标签
///
/// 确认/拒绝必须使用投递标签，消息在确认前一直处于在途状态。
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub task: TaskMessage,
}

/// 消息队列抽象接口
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 声明持久化工作队列及其配对的死信队列
    async fn declare_queue(&self, queue: &str) -> ConveyorResult<()>;

    /// 发布消息到指定队列（持久化，等待Broker确认）
    async fn publish(&self, queue: &str, task: &TaskMessage) -> ConveyorResult<()>;

    /// 延迟投递：消息在 delay 之后才对消费者可见
    ///
    /// 仅当 `supports_delayed_delivery` 为 true 时可用；否则调用方
    /// 需要退化为阻塞等待后重新发布。
    async fn publish_delayed(
        &self,
        queue: &str,
        task: &TaskMessage,
        delay: Duration,
    ) -> ConveyorResult<()>;

    /// Broker是否原生支持延迟投递
    fn supports_delayed_delivery(&self) -> bool;

    /// 拉取一条消息，队列为空时返回 None
    ///
    /// 每个消费者同一时刻最多持有一条未确认消息（prefetch = 1），
    /// 由Broker侧的QoS或实现自身保证。
    async fn consume_one(&self, queue: &str) -> ConveyorResult<Option<Delivery>>;

    /// 确认消息处理完成
    async fn ack(&self, delivery: &Delivery) -> ConveyorResult<()>;

    /// 拒绝消息；requeue 为 true 时由Broker重新投递
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> ConveyorResult<()>;

    /// 获取队列中的消息数量
    async fn queue_size(&self, queue: &str) -> ConveyorResult<u32>;

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> ConveyorResult<()>;
}
