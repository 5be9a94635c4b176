use async_trait::async_trait;

use crate::{errors::ConveyorResult, models::JobEvent};

/// 事件发布接口
///
/// 尽力而为：发布失败由调用方记录日志后继续，绝不反过来影响
/// 作业自身的状态推进。
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, event: &JobEvent) -> ConveyorResult<()>;
}
