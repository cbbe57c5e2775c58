//! Build scheduling for cachebuild.
//!
//! Admits runs into a FIFO queue, starts one build worker per run in a
//! container runtime, drives each worker's build session and writes the
//! outcome back to the job store. In remote mode the [`Coordinator`] hands
//! queued runs to build nodes over the message bus instead.

pub mod coordinator;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod watcher;
pub mod worker;

#[cfg(test)]
mod testing;

pub use coordinator::Coordinator;
pub use queue::{QueueEntry, QueueManager};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerSnapshot, Subscription, WorkerSummary};
pub use session::{RetryPolicy, SessionConnector, SessionTransport, WsConnector};
pub use watcher::LifecycleWatcher;
pub use worker::{WorkerHandle, WorkerState};
