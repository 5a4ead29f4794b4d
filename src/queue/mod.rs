pub mod broker;
pub mod job;

pub use broker::{Broker, SqliteBroker, DEFAULT_LEASE};
pub use job::{
    Job, JobId, JobStatus, RetryPolicy, Task, ALL_QUEUES, QUEUE_EVENT_VIDEO, QUEUE_PREDICTION,
    QUEUE_WRITE_IMAGE,
};
