pub mod event;
pub mod job;
pub mod task;

pub use event::{JobEvent, JobEventType};
pub use job::{Job, JobStatus};
pub use task::TaskMessage;
