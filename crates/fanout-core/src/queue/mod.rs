//! Queue engine: bounded, retrying execution of work items grouped per provider.

mod config;
mod item;
mod manager;
mod stats;
mod task_queue;

pub use config::{MIN_RETRY_DELAY, QueueConfig};
pub use item::{QueueEvent, Work, WorkItem, WorkOutcome, work_fn};
pub use manager::{ManagerProbe, TaskManager};
pub use stats::{DURATION_EMA_ALPHA, QueueStats};
pub use task_queue::TaskQueue;
