use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("载荷校验失败: {0}")]
    Validation(String),
    #[error("未注册的命令类型: {command_type}")]
    UnknownCommand { command_type: String },
    #[error("命令执行失败（可重试）: {0}")]
    TransientExecution(String),
    #[error("重复的触发请求: hash={hash}, 已有作业 {job_id}")]
    Duplicate { hash: String, job_id: String },
    #[error("作业存储不可用: {0}")]
    StoreUnavailable(String),
    #[error("作业未找到: {id}")]
    JobNotFound { id: String },
    #[error("非法的状态迁移: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("消息队列错误: {0}")]
    MessageQueue(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type ConveyorResult<T> = Result<T, ConveyorError>;

impl ConveyorError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn unknown_command<S: Into<String>>(command_type: S) -> Self {
        Self::UnknownCommand {
            command_type: command_type.into(),
        }
    }
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::TransientExecution(msg.into())
    }
    pub fn job_not_found<S: Into<String>>(id: S) -> Self {
        Self::JobNotFound { id: id.into() }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 该错误是否应当消耗一次重试机会
    ///
    /// `Validation` 和 `UnknownCommand` 属于编程/配置错误，重试不会改变结果；
    /// `StoreUnavailable` 属于基础设施故障，依赖Broker自身的重投递而不计入重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConveyorError::TransientExecution(_)
                | ConveyorError::MessageQueue(_)
                | ConveyorError::Internal(_)
        )
    }

    /// 结构化的错误分类标签，写入作业的 last_error 供筛选
    pub fn taxonomy_tag(&self) -> &'static str {
        match self {
            ConveyorError::Validation(_) => "validation",
            ConveyorError::UnknownCommand { .. } => "unknown_command",
            ConveyorError::TransientExecution(_) => "transient",
            ConveyorError::Duplicate { .. } => "duplicate",
            ConveyorError::StoreUnavailable(_) => "store_unavailable",
            ConveyorError::JobNotFound { .. } => "not_found",
            ConveyorError::InvalidTransition { .. } => "invalid_transition",
            ConveyorError::MessageQueue(_) => "message_queue",
            ConveyorError::Serialization(_) => "serialization",
            ConveyorError::Configuration(_) => "configuration",
            ConveyorError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for ConveyorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ConveyorError::JobNotFound {
                id: "<unknown>".to_string(),
            },
            other => ConveyorError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(err: serde_json::Error) -> Self {
        ConveyorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ConveyorError {
    fn from(err: anyhow::Error) -> Self {
        ConveyorError::Internal(err.to_string())
    }
}
