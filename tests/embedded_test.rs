//! 嵌入式模式端到端测试：进程内队列与存储，完整走一遍
//! 受理 -> 分发 -> 执行 -> 终态的链路。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use conveyor::app::Application;
use conveyor::commands::register_builtin_commands;
use conveyor::shutdown::ShutdownManager;
use conveyor_core::{
    command::{Command, CommandContext, CommandRegistry},
    errors::{ConveyorError, ConveyorResult},
    models::JobStatus,
};
use conveyor_ingress::EnqueueRequest;

struct UppercaseCommand;

#[async_trait]
impl Command for UppercaseCommand {
    async fn execute(&self, ctx: &CommandContext) -> ConveyorResult<serde_json::Value> {
        let text = ctx
            .payload
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConveyorError::validation("缺少 text 字段"))?;
        Ok(json!({"text": text.to_uppercase()}))
    }
}

fn test_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    register_builtin_commands(&mut registry).unwrap();
    registry
        .register("Uppercase", || Arc::new(UppercaseCommand))
        .unwrap();
    registry
}

async fn wait_for_terminal(
    ingress: &conveyor_ingress::IngressService,
    job_id: &str,
) -> conveyor_core::models::Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = ingress.get_job(job_id).await.unwrap();
        if job.is_finished() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not finish"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_embedded_round_trip() {
    let app = Application::embedded(test_registry()).await.unwrap();
    let ingress = app.ingress();

    let shutdown = ShutdownManager::new();
    let shutdown_tx = shutdown.sender();
    let handle = tokio::spawn(async move { app.run(shutdown_tx).await });

    let job = ingress
        .enqueue(EnqueueRequest::new("Uppercase", json!({"text": "hello"})))
        .await
        .unwrap();

    let finished = wait_for_terminal(&ingress, &job.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.result, Some(json!({"text": "HELLO"})));
    assert_eq!(finished.attempts, 1);

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_embedded_duplicate_trigger() {
    let app = Application::embedded(test_registry()).await.unwrap();
    let ingress = app.ingress();

    let first = ingress
        .enqueue(EnqueueRequest::new("Noop", json!({"sku": "A-1"})))
        .await
        .unwrap();

    let err = ingress
        .enqueue(EnqueueRequest::new("Noop", json!({"sku": "A-1"})))
        .await
        .unwrap_err();
    match err {
        ConveyorError::Duplicate { job_id, .. } => assert_eq!(job_id, first.id),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_embedded_unknown_command_failure_path() {
    let app = Application::embedded(test_registry()).await.unwrap();
    let ingress = app.ingress();

    let err = ingress
        .enqueue(EnqueueRequest::new("DoesNotExist", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ConveyorError::UnknownCommand { .. }));
}

#[tokio::test]
async fn test_embedded_permanent_failure_dead_letters() {
    let app = Application::embedded(test_registry()).await.unwrap();
    let ingress = app.ingress();

    let shutdown = ShutdownManager::new();
    let shutdown_tx = shutdown.sender();
    let handle = tokio::spawn(async move { app.run(shutdown_tx).await });

    // Uppercase命令对缺少 text 的载荷返回永久性校验错误
    let job = ingress
        .enqueue(EnqueueRequest::new("Uppercase", json!({"wrong": 1})))
        .await
        .unwrap();

    let finished = wait_for_terminal(&ingress, &job.id).await;
    assert_eq!(finished.status, JobStatus::Failed);
    assert!(finished
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("[validation] "));
    // 校验错误不消耗剩余重试
    assert_eq!(finished.attempts, 1);

    shutdown.shutdown().await;
    handle.await.unwrap().unwrap();
}
