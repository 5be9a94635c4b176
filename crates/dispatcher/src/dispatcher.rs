//! 作业分发服务
//!
//! 固定数量的工作协程轮询工作队列，每条投递走同一条处理管线：
//! 校验 -> 终态短路 -> 解析命令 -> 迁移RUNNING -> 执行 -> 按结果收尾。
//!
//! 确认纪律：只有当本次投递的处理结果已经落定（完成已持久化、
//! 重试已重新发布、或消息已进入死信队列）之后才ack。存储不可用时
//! nack并重新入队，这一次投递不消耗重试机会。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_core::{
    command::{CommandContext, CommandRegistry},
    config::DispatcherConfig,
    errors::{ConveyorError, ConveyorResult},
    models::{JobEvent, JobStatus, TaskMessage},
    traits::{
        dead_letter_queue_name, Delivery, EventPublisher, JobStore, MessageQueue, TransitionFields,
    },
};

use crate::backoff::RetryPolicy;

/// 去重记录清理周期
const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct Dispatcher {
    job_store: Arc<dyn JobStore>,
    message_queue: Arc<dyn MessageQueue>,
    event_publisher: Arc<dyn EventPublisher>,
    registry: Arc<CommandRegistry>,
    config: DispatcherConfig,
    job_queue: String,
    retry_policy: RetryPolicy,
}

/// 单条投递的处理结局，测试和日志使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 作业完成，结果已持久化
    Completed,
    /// 已调度下一次尝试
    RetryScheduled { next_attempt: i32 },
    /// 消息进入死信队列，作业标记FAILED
    DeadLettered,
    /// 作业已处于终态，重复投递被丢弃
    Skipped,
    /// 存储不可用，消息重新入队且不消耗尝试
    Requeued,
}

impl Dispatcher {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        message_queue: Arc<dyn MessageQueue>,
        event_publisher: Arc<dyn EventPublisher>,
        registry: Arc<CommandRegistry>,
        config: DispatcherConfig,
        job_queue: String,
    ) -> Self {
        let retry_policy = RetryPolicy::new(config.base_retry_delay_ms, config.max_retry_delay_ms);
        Self {
            job_store,
            message_queue,
            event_publisher,
            registry,
            config,
            job_queue,
            retry_policy,
        }
    }

    /// 启动工作协程池，直到收到关闭信号
    ///
    /// 收到信号后工作协程处理完手头的投递即退出；超过
    /// `shutdown_timeout_seconds` 仍未退出的协程被放弃。
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Sender<()>) -> ConveyorResult<()> {
        self.registry.validate()?;
        self.message_queue.declare_queue(&self.job_queue).await?;

        info!(
            "Dispatcher启动: {} 个工作协程，队列 {}，已注册命令 {:?}",
            self.config.worker_count,
            self.job_queue,
            self.registry.command_types()
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.worker_count + 1);

        for worker_id in 0..self.config.worker_count {
            let dispatcher = Arc::clone(&self);
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, &mut shutdown_rx).await;
            }));
        }

        // 去重记录的后台清理
        {
            let dispatcher = Arc::clone(&self);
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                dispatcher.purge_loop(&mut shutdown_rx).await;
            }));
        }

        // 等待关闭信号，之后限时等待在途任务收尾
        let mut shutdown_rx = shutdown.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("Dispatcher收到关闭信号，等待在途任务完成");

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(
            Duration::from_secs(self.config.shutdown_timeout_seconds),
            drain,
        )
        .await
        .is_err()
        {
            warn!("关闭超时，放弃仍在运行的工作协程");
        }

        info!("Dispatcher已停止");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: &mut broadcast::Receiver<()>) {
        debug!("工作协程 {} 启动", worker_id);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("工作协程 {} 收到关闭信号", worker_id);
                    break;
                }
                result = self.poll_once() => {
                    match result {
                        Ok(true) => {}
                        Ok(false) => {
                            tokio::time::sleep(Duration::from_millis(
                                self.config.poll_interval_ms,
                            ))
                            .await;
                        }
                        Err(e) => {
                            error!("工作协程 {} 轮询失败: {}", worker_id, e);
                            tokio::time::sleep(Duration::from_millis(
                                self.config.poll_interval_ms,
                            ))
                            .await;
                        }
                    }
                }
            }
        }
    }

    /// 拉取并处理一条投递，返回是否拉到了消息
    async fn poll_once(&self) -> ConveyorResult<bool> {
        match self.message_queue.consume_one(&self.job_queue).await {
            Ok(Some(delivery)) => {
                self.process_delivery(&delivery).await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(ConveyorError::Serialization(e)) => {
                // 畸形消息已由队列实现路由到DLQ
                warn!("丢弃无法解析的消息: {}", e);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// 处理一条投递的完整管线
    pub async fn process_delivery(&self, delivery: &Delivery) -> ConveyorResult<Outcome> {
        let task = &delivery.task;

        if let Err(e) = task.validate() {
            warn!("作业 {} 的消息校验失败: {}", task.job_id, e);
            return self.dead_letter(delivery, &e).await;
        }

        // 读取作业做终态短路：至少一次投递下，已完成作业的重复投递
        // 直接确认丢弃，命令不会再次执行
        let job = match self.job_store.get_job(&task.job_id).await {
            Ok(job) => job,
            Err(ConveyorError::JobNotFound { .. }) => {
                warn!("作业 {} 不存在，消息进入死信队列", task.job_id);
                return self
                    .dead_letter(delivery, &ConveyorError::job_not_found(&task.job_id))
                    .await;
            }
            Err(e) => return self.requeue(delivery, &e).await,
        };

        if job.is_finished() {
            debug!(
                "作业 {} 已处于终态 {}，丢弃重复投递",
                job.id, job.status
            );
            self.message_queue.ack(delivery).await?;
            return Ok(Outcome::Skipped);
        }

        let command = match self.registry.resolve(&task.command_type) {
            Ok(command) => command,
            Err(e) => {
                // 未注册的命令类型重试不会改变结果，零重试直接死信
                warn!(
                    "作业 {} 引用未注册的命令类型 {}",
                    task.job_id, task.command_type
                );
                return self.dead_letter(delivery, &e).await;
            }
        };

        if let Err(e) = self
            .job_store
            .transition(
                &task.job_id,
                JobStatus::Running,
                TransitionFields {
                    attempt: Some(task.attempt),
                    ..Default::default()
                },
            )
            .await
        {
            return match e {
                ConveyorError::StoreUnavailable(_) => self.requeue(delivery, &e).await,
                // RUNNING的重新认领是合法迁移，走到这里只剩一种可能：
                // 并发的重复投递已把作业推进到终态
                ConveyorError::InvalidTransition { .. } => {
                    warn!("作业 {} 状态迁移冲突，丢弃本次投递: {}", task.job_id, e);
                    self.message_queue.ack(delivery).await?;
                    Ok(Outcome::Skipped)
                }
                other => Err(other),
            };
        }

        self.emit(JobEvent::started(&task.job_id, task.attempt)).await;

        let ctx = CommandContext {
            job_id: task.job_id.clone(),
            payload: task.payload.clone(),
            attempt: task.attempt,
            max_attempts: task.max_attempts,
        };

        info!(
            "执行作业 {} ({}) 第 {}/{} 次尝试",
            task.job_id, task.command_type, task.attempt, task.max_attempts
        );

        match command.execute(&ctx).await {
            Ok(result) => {
                if let Err(e) = self
                    .job_store
                    .transition(
                        &task.job_id,
                        JobStatus::Completed,
                        TransitionFields {
                            result: Some(result.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    // 完成状态没有落盘就不能ack，交给重投递；
                    // 重投递会重新认领RUNNING中的作业并再次执行
                    return self.requeue(delivery, &e).await;
                }
                self.message_queue.ack(delivery).await?;

                if let Err(e) = command.on_success(&ctx, &result).await {
                    warn!("作业 {} 的 on_success 钩子失败: {}", task.job_id, e);
                }
                self.emit(JobEvent::completed(&task.job_id, Some(&result)))
                    .await;

                info!("作业 {} 完成", task.job_id);
                Ok(Outcome::Completed)
            }
            Err(e) => {
                // 命令依赖的存储不可用和分发器自身遇到的一视同仁：
                // 重新入队且不消耗尝试，也不算作业的一次失败
                if matches!(e, ConveyorError::StoreUnavailable(_)) {
                    return self.requeue(delivery, &e).await;
                }

                if let Err(hook_err) = command.on_failure(&ctx, &e).await {
                    warn!("作业 {} 的 on_failure 钩子失败: {}", task.job_id, hook_err);
                }

                if e.is_retryable() && !task.is_last_attempt() {
                    self.schedule_retry(delivery, &e).await
                } else {
                    self.dead_letter(delivery, &e).await
                }
            }
        }
    }

    /// 调度下一次尝试：作业回到PENDING，延迟重新发布
    async fn schedule_retry(
        &self,
        delivery: &Delivery,
        error: &ConveyorError,
    ) -> ConveyorResult<Outcome> {
        let task = &delivery.task;
        let next = task.next_attempt();
        let delay = self.retry_policy.delay(task.attempt);

        if let Err(e) = self
            .job_store
            .transition(
                &task.job_id,
                JobStatus::Pending,
                TransitionFields {
                    last_error: Some(format_error(error)),
                    ..Default::default()
                },
            )
            .await
        {
            return self.requeue(delivery, &e).await;
        }

        if self.message_queue.supports_delayed_delivery() {
            self.message_queue
                .publish_delayed(&self.job_queue, &next, delay)
                .await?;
        } else {
            // 退化路径：阻塞等待后立即重新发布
            tokio::time::sleep(delay).await;
            self.message_queue.publish(&self.job_queue, &next).await?;
        }
        self.message_queue.ack(delivery).await?;

        self.emit(JobEvent::retry_scheduled(
            &task.job_id,
            next.attempt,
            delay.as_millis() as u64,
        ))
        .await;

        info!(
            "作业 {} 第 {} 次尝试失败（{}），{}ms 后第 {} 次尝试",
            task.job_id,
            task.attempt,
            error.taxonomy_tag(),
            delay.as_millis(),
            next.attempt
        );
        Ok(Outcome::RetryScheduled {
            next_attempt: next.attempt,
        })
    }

    /// 消息原样进入死信队列，作业标记FAILED
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        error: &ConveyorError,
    ) -> ConveyorResult<Outcome> {
        let task = &delivery.task;
        let dlq = dead_letter_queue_name(&self.job_queue);
        let last_error = format_error(error);

        // 先保证消息进入DLQ，再更新作业状态
        self.message_queue.publish(&dlq, task).await?;

        if let Err(e) = self.mark_failed(task, &last_error).await {
            // 作业状态更新失败不阻塞确认：消息已在DLQ里
            warn!("作业 {} 标记失败状态时出错: {}", task.job_id, e);
        }
        self.message_queue.ack(delivery).await?;

        self.emit(JobEvent::dead_lettered(&task.job_id, &last_error))
            .await;
        self.emit(JobEvent::failed(&task.job_id, &last_error, task.attempt))
            .await;

        error!(
            "作业 {} 进入死信队列 {}: {}",
            task.job_id, dlq, last_error
        );
        Ok(Outcome::DeadLettered)
    }

    async fn mark_failed(&self, task: &TaskMessage, last_error: &str) -> ConveyorResult<()> {
        let fields = TransitionFields {
            last_error: Some(last_error.to_string()),
            ..Default::default()
        };
        match self
            .job_store
            .transition(&task.job_id, JobStatus::Failed, fields.clone())
            .await
        {
            Ok(_) => Ok(()),
            // 作业还停在PENDING（命令解析失败时没有经过RUNNING）
            Err(ConveyorError::InvalidTransition { .. }) => {
                self.job_store
                    .transition(&task.job_id, JobStatus::Running, TransitionFields::default())
                    .await?;
                self.job_store
                    .transition(&task.job_id, JobStatus::Failed, fields)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 存储不可用：消息重新入队，不消耗重试机会
    async fn requeue(&self, delivery: &Delivery, error: &ConveyorError) -> ConveyorResult<Outcome> {
        warn!(
            "作业 {} 处理中存储不可用，消息重新入队: {}",
            delivery.task.job_id, error
        );
        self.message_queue.nack(delivery, true).await?;
        // 避免紧密循环反复打到故障存储
        tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        Ok(Outcome::Requeued)
    }

    async fn emit(&self, event: JobEvent) {
        if let Err(e) = self.event_publisher.publish_event(&event).await {
            warn!("发布事件 {:?} 失败: {}", event.event_type, e);
        }
    }

    /// 周期清理保留窗口外的去重记录
    async fn purge_loop(&self, shutdown: &mut broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(PURGE_INTERVAL) => {
                    let cutoff =
                        chrono::Utc::now() - chrono::Duration::hours(self.config.dedup_window_hours);
                    match self.job_store.purge_idempotency_older_than(cutoff).await {
                        Ok(0) => {}
                        Ok(n) => info!("清理了 {} 条过期去重记录", n),
                        Err(e) => warn!("清理去重记录失败: {}", e),
                    }
                }
            }
        }
    }
}

/// 带分类标签的错误描述，写入作业的 last_error
fn format_error(error: &ConveyorError) -> String {
    format!("[{}] {}", error.taxonomy_tag(), error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_includes_taxonomy_tag() {
        let error = ConveyorError::transient("connection reset");
        let formatted = format_error(&error);
        assert!(formatted.starts_with("[transient] "));
        assert!(formatted.contains("connection reset"));
    }
}
