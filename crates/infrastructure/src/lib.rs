//! conveyor-infrastructure
//!
//! 队列、存储、事件流的具体实现：RabbitMQ/PostgreSQL 用于生产部署，
//! 进程内实现用于嵌入式模式与测试。

pub mod event_stream;
pub mod in_memory;
pub mod memory_store;
pub mod postgres;
pub mod rabbitmq;

pub use event_stream::{InMemoryEventPublisher, RabbitMqEventPublisher};
pub use in_memory::InMemoryBroker;
pub use memory_store::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use rabbitmq::RabbitMqBroker;
