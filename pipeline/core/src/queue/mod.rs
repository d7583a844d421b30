//! Task queue, stop flags and the queue manager
//!
//! One queue per generation task carries [`QueueMessage`]s from the worker
//! to the task pipeline in publish order.

mod events;
mod manager;
mod stop;
mod task_queue;

pub use events::{AgentLog, PublishFrom, QueueEvent, QueueMessage, RuntimeState, StopReason, Usage};
pub use manager::{ListenConfig, QueueListener, QueueManager};
pub use stop::{StopFlag, StopRegistry};
