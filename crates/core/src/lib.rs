//! conveyor-core
//!
//! 作业编排引擎的核心抽象：数据模型、命令抽象与注册表、
//! 存储/队列/事件的trait契约、错误分类、配置与日志。

pub mod command;
pub mod config;
pub mod errors;
pub mod idempotency;
pub mod logging;
pub mod models;
pub mod traits;

pub use command::{Command, CommandContext, CommandFactory, CommandRegistry};
pub use config::{
    AppConfig, DispatcherConfig, JobStoreConfig, JobStoreType, LoggingConfig, MessageQueueConfig,
    MessageQueueType,
};
pub use errors::{ConveyorError, ConveyorResult};
pub use idempotency::{trigger_hash, IdempotencyRecord};
pub use models::{Job, JobEvent, JobEventType, JobStatus, TaskMessage};
pub use traits::{
    dead_letter_queue_name, Delivery, EventPublisher, JobStore, MessageQueue, TransitionFields,
};
