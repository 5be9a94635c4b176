pub mod event_publisher;
pub mod job_store;
pub mod message_queue;

pub use event_publisher::EventPublisher;
pub use job_store::{JobStore, TransitionFields};
pub use message_queue::{dead_letter_queue_name, Delivery, MessageQueue};
