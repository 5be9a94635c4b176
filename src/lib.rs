//! conveyor
//!
//! 基于消息队列的异步作业编排引擎：至少一次投递、幂等去重、
//! 指数退避重试、死信路由与生命周期事件。本crate装配各组件
//! 并提供嵌入式运行模式。

pub mod app;
pub mod commands;
pub mod shutdown;

pub use app::Application;
pub use commands::{register_builtin_commands, NoopCommand, WebhookCommand};
pub use shutdown::ShutdownManager;
