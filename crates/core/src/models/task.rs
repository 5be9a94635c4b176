use serde::{Deserialize, Serialize};

use crate::errors::{ConveyorError, ConveyorResult};

/// 任务消息（线上格式）
///
/// 队列中流转的投递消息，是作业某一次尝试的瞬时镜像。
/// 所有字段必填，payload 允许为空对象。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub job_id: String,
    pub command_type: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub max_attempts: i32,
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}

impl TaskMessage {
    pub fn new(
        job_id: String,
        command_type: String,
        payload: serde_json::Value,
        max_attempts: i32,
    ) -> Self {
        Self {
            job_id,
            command_type,
            payload,
            attempt: 1,
            max_attempts,
        }
    }

    /// 派生下一次尝试的消息，attempt 不变量由 validate 保证
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn validate(&self) -> ConveyorResult<()> {
        if self.job_id.is_empty() {
            return Err(ConveyorError::validation("job_id 不能为空"));
        }
        if self.command_type.is_empty() {
            return Err(ConveyorError::validation("command_type 不能为空"));
        }
        if self.attempt < 1 {
            return Err(ConveyorError::validation(format!(
                "attempt 必须 >= 1，当前为 {}",
                self.attempt
            )));
        }
        if self.max_attempts < 1 {
            return Err(ConveyorError::validation(format!(
                "max_attempts 必须 >= 1，当前为 {}",
                self.max_attempts
            )));
        }
        if self.attempt > self.max_attempts {
            return Err(ConveyorError::validation(format!(
                "attempt {} 超过 max_attempts {}",
                self.attempt, self.max_attempts
            )));
        }
        Ok(())
    }

    pub fn serialize_bytes(&self) -> ConveyorResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConveyorError::Serialization(e.to_string()))
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> ConveyorResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConveyorError::Serialization(e.to_string()))
    }
}
