//! conveyor-dispatcher
//!
//! 消费工作队列并驱动命令执行的分发服务：
//! 工作协程池、指数退避重试、死信路由、生命周期事件发布。

pub mod backoff;
pub mod dispatcher;

pub use backoff::RetryPolicy;
pub use dispatcher::{Dispatcher, Outcome};
