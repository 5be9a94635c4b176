//! 内置命令
//!
//! Noop用于验证部署链路，Webhook把作业载荷投递到外部HTTP端点。
//! 两者都满足幂等约定：Noop没有副作用，Webhook的幂等性由
//! 接收端依据载荷中的稳定标识保证。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use conveyor_core::{
    command::{Command, CommandContext, CommandRegistry},
    errors::{ConveyorError, ConveyorResult},
};

/// 空操作命令：原样返回载荷
pub struct NoopCommand;

#[async_trait]
impl Command for NoopCommand {
    async fn execute(&self, ctx: &CommandContext) -> ConveyorResult<serde_json::Value> {
        debug!("Noop命令执行，作业 {}", ctx.job_id);
        Ok(json!({"echo": ctx.payload}))
    }
}

/// Webhook命令：把载荷里的 body POST 到指定URL
///
/// 载荷格式：
/// ```json
/// {"url": "https://...", "body": {...}, "timeout_seconds": 30}
/// ```
///
/// 网络错误和5xx视为瞬态失败并按重试策略重试，4xx视为
/// 永久失败直接进入死信队列。
pub struct WebhookCommand {
    client: reqwest::Client,
}

impl WebhookCommand {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for WebhookCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for WebhookCommand {
    async fn execute(&self, ctx: &CommandContext) -> ConveyorResult<serde_json::Value> {
        let url = ctx
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConveyorError::validation("webhook载荷缺少 url 字段"))?;
        let body = ctx
            .payload
            .get("body")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let timeout_seconds = ctx
            .payload
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(30);

        info!(
            "作业 {} 调用webhook {} (第 {} 次尝试)",
            ctx.job_id, url, ctx.attempt
        );

        let response = self
            .client
            .post(url)
            .json(&body)
            .timeout(Duration::from_secs(timeout_seconds))
            .send()
            .await
            .map_err(|e| ConveyorError::transient(format!("webhook请求失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let response_body = response.text().await.unwrap_or_default();
            Ok(json!({
                "status": status.as_u16(),
                "body": response_body,
            }))
        } else if status.is_server_error() {
            Err(ConveyorError::transient(format!(
                "webhook返回服务端错误: {status}"
            )))
        } else {
            Err(ConveyorError::validation(format!(
                "webhook返回客户端错误: {status}"
            )))
        }
    }
}

/// 注册全部内置命令
pub fn register_builtin_commands(registry: &mut CommandRegistry) -> ConveyorResult<()> {
    registry.register("Noop", || Arc::new(NoopCommand))?;
    registry.register("Webhook", || Arc::new(WebhookCommand::new()))?;
    Ok(())
}
