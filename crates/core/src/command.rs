//! 命令抽象与注册表
//!
//! 命令是Dispatcher按命令类型标签多态调用的业务逻辑单元。
//! 投递语义为至少一次，`execute` 必须可安全重复调用：实现方需要
//! 先查后做，或用稳定标识对副作用去重，不能依赖Dispatcher提供
//! 精确一次保证。Dispatcher唯一承诺是每次调用携带正确的载荷和尝试序号。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{ConveyorError, ConveyorResult};

/// 单次尝试的执行上下文
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub job_id: String,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
}

impl CommandContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// 命令接口
///
/// `on_success` / `on_failure` 在单次尝试得出结果后由Dispatcher调用，
/// 默认实现为空。钩子中的错误只记录日志，不影响作业状态。
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行一次尝试，返回要持久化到作业上的结果
    async fn execute(&self, ctx: &CommandContext) -> ConveyorResult<serde_json::Value>;

    /// 尝试成功后的钩子
    async fn on_success(
        &self,
        _ctx: &CommandContext,
        _result: &serde_json::Value,
    ) -> ConveyorResult<()> {
        Ok(())
    }

    /// 尝试失败后的钩子
    async fn on_failure(&self, _ctx: &CommandContext, _error: &ConveyorError) -> ConveyorResult<()> {
        Ok(())
    }
}

/// 命令工厂：每次解析产出一个新的命令实例
pub type CommandFactory = Arc<dyn Fn() -> Arc<dyn Command> + Send + Sync>;

/// 命令注册表
///
/// 启动时注册全部命令类型并做一次校验，配置错误在启动时暴露
/// 而不是在首次分发时。注册完成后只读。
#[derive(Default)]
pub struct CommandRegistry {
    factories: HashMap<String, CommandFactory>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, command_type: &str, factory: F) -> ConveyorResult<()>
    where
        F: Fn() -> Arc<dyn Command> + Send + Sync + 'static,
    {
        if command_type.is_empty() {
            return Err(ConveyorError::config_error("命令类型标签不能为空"));
        }
        if self.factories.contains_key(command_type) {
            return Err(ConveyorError::config_error(format!(
                "命令类型 {command_type} 重复注册"
            )));
        }
        self.factories
            .insert(command_type.to_string(), Arc::new(factory));
        Ok(())
    }

    /// 解析命令类型，未注册的类型返回 `UnknownCommand`
    pub fn resolve(&self, command_type: &str) -> ConveyorResult<Arc<dyn Command>> {
        self.factories
            .get(command_type)
            .map(|factory| factory())
            .ok_or_else(|| ConveyorError::unknown_command(command_type))
    }

    pub fn contains(&self, command_type: &str) -> bool {
        self.factories.contains_key(command_type)
    }

    pub fn command_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// 启动校验：注册表非空，且每个工厂都能构造实例
    pub fn validate(&self) -> ConveyorResult<()> {
        if self.factories.is_empty() {
            return Err(ConveyorError::config_error("命令注册表为空"));
        }
        for (command_type, factory) in &self.factories {
            let _command = factory();
            tracing::debug!("命令类型 {} 校验通过", command_type);
        }
        Ok(())
    }
}
