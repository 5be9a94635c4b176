//! RabbitMQ消息队列实现
//!
//! 队列拓扑：每个工作队列 `<q>` 配对两个辅助队列：
//!   - `<q>.dlq`  死信队列，承接耗尽重试或无法处理的消息
//!   - `<q>.retry` 等待队列，消息带per-message TTL，过期后经
//!     死信交换路由回 `<q>`，以此实现延迟投递
//!
//! 发布使用持久化投递模式并等待Broker确认；消费端 prefetch = 1，
//! 保证每个消费者同一时刻最多持有一条未确认消息。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use conveyor_core::{
    config::MessageQueueConfig,
    errors::{ConveyorError, ConveyorResult},
    models::TaskMessage,
    traits::{dead_letter_queue_name, Delivery, MessageQueue},
};

/// 延迟投递用的等待队列名
fn retry_queue_name(queue: &str) -> String {
    format!("{queue}.retry")
}

pub struct RabbitMqBroker {
    connection: Connection,
    channel: Arc<Mutex<Channel>>,
}

impl RabbitMqBroker {
    /// 建立连接并开启发布确认、设置 prefetch = 1
    pub async fn new(config: &MessageQueueConfig) -> ConveyorResult<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("创建通道失败: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("开启发布确认失败: {e}")))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("设置QoS失败: {e}")))?;

        info!("成功连接到RabbitMQ");

        Ok(Self {
            connection,
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn declare_durable(
        &self,
        channel: &Channel,
        queue: &str,
        arguments: FieldTable,
    ) -> ConveyorResult<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("声明队列 {queue} 失败: {e}")))?;
        debug!("队列 {} 声明成功", queue);
        Ok(())
    }

    async fn publish_with_properties(
        &self,
        queue: &str,
        task: &TaskMessage,
        properties: BasicProperties,
    ) -> ConveyorResult<()> {
        let payload = task.serialize_bytes()?;
        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| {
                ConveyorError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;

        confirm
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("消息发布确认失败: {e}")))?;

        debug!("作业 {} 的消息已发布到队列 {}", task.job_id, queue);
        Ok(())
    }

    /// 发布任意字节消息（事件流使用），持久化并等待确认
    pub async fn publish_raw(&self, queue: &str, payload: &[u8]) -> ConveyorResult<()> {
        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| {
                ConveyorError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;
        confirm
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("消息发布确认失败: {e}")))?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> ConveyorResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("关闭连接失败: {e}")))?;
        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RabbitMqBroker {
    /// 声明工作队列及配套的死信/等待队列
    async fn declare_queue(&self, queue: &str) -> ConveyorResult<()> {
        let channel = self.channel.lock().await;
        let dlq = dead_letter_queue_name(queue);
        let retry = retry_queue_name(queue);

        // 死信队列本身没有额外参数
        self.declare_durable(&channel, &dlq, FieldTable::default())
            .await?;

        // 工作队列：处理失败的消息（nack且不重入队）落入DLQ
        let mut work_args = FieldTable::default();
        work_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        work_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(dlq.as_str().into()),
        );
        self.declare_durable(&channel, queue, work_args).await?;

        // 等待队列：消息TTL过期后路由回工作队列
        let mut retry_args = FieldTable::default();
        retry_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        retry_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(queue.into()),
        );
        self.declare_durable(&channel, &retry, retry_args).await?;

        Ok(())
    }

    async fn publish(&self, queue: &str, task: &TaskMessage) -> ConveyorResult<()> {
        self.publish_with_properties(
            queue,
            task,
            BasicProperties::default().with_delivery_mode(2), // 2 = persistent
        )
        .await
    }

    /// 通过等待队列的per-message TTL实现延迟投递
    async fn publish_delayed(
        &self,
        queue: &str,
        task: &TaskMessage,
        delay: Duration,
    ) -> ConveyorResult<()> {
        let expiration = delay.as_millis().to_string();
        debug!(
            "作业 {} 延迟 {}ms 后重新投递到队列 {}",
            task.job_id, expiration, queue
        );
        self.publish_with_properties(
            &retry_queue_name(queue),
            task,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_expiration(expiration.into()),
        )
        .await
    }

    fn supports_delayed_delivery(&self) -> bool {
        true
    }

    async fn consume_one(&self, queue: &str) -> ConveyorResult<Option<Delivery>> {
        let channel = self.channel.lock().await;
        let get_result = channel
            .basic_get(queue, BasicGetOptions::default())
            .await
            .map_err(|e| {
                ConveyorError::MessageQueue(format!("从队列 {queue} 获取消息失败: {e}"))
            })?;

        match get_result {
            Some(message) => {
                let delivery_tag = message.delivery_tag;
                match TaskMessage::deserialize_bytes(&message.data) {
                    Ok(task) => Ok(Some(Delivery {
                        queue: queue.to_string(),
                        delivery_tag,
                        task,
                    })),
                    Err(e) => {
                        // 无法解析的消息体：拒绝且不重入队，
                        // 由工作队列的死信配置原样路由到DLQ供人工排查
                        channel
                            .basic_nack(
                                delivery_tag,
                                BasicNackOptions {
                                    requeue: false,
                                    ..Default::default()
                                },
                            )
                            .await
                            .map_err(|e| {
                                ConveyorError::MessageQueue(format!("拒绝畸形消息失败: {e}"))
                            })?;
                        Err(e)
                    }
                }
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> ConveyorResult<()> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("确认消息失败: {e}")))?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> ConveyorResult<()> {
        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("拒绝消息失败: {e}")))?;
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> ConveyorResult<u32> {
        let channel = self.channel.lock().await;
        let queue_info = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match queue_info {
            Ok(info) => Ok(info.message_count()),
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("NOT_FOUND") || error_msg.contains("404") {
                    debug!("队列 {} 不存在，返回大小为0", queue);
                    Ok(0)
                } else {
                    Err(ConveyorError::MessageQueue(format!(
                        "获取队列 {queue} 信息失败: {e}"
                    )))
                }
            }
        }
    }

    async fn purge_queue(&self, queue: &str) -> ConveyorResult<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| ConveyorError::MessageQueue(format!("清空队列 {queue} 失败: {e}")))?;
        debug!("队列 {} 已清空", queue);
        Ok(())
    }
}
