//! Fair multi-context scheduling and the context manager facade.
//!
//! The [`scheduler::LaneScheduler`] serializes work per context (one
//! in-flight slice per lane) while letting independent contexts run
//! concurrently up to `maxConcurrency`. The [`manager::ContextManager`]
//! owns the lazy per-context store/runner singletons and exposes the single
//! `enqueue` surface platform adapters call.

pub mod error;
pub mod manager;
pub mod scheduler;

pub use error::{Result, SchedulerError};
pub use manager::{AfterUpdateFn, ContextManager, ManagerStats};
pub use scheduler::{
    DeliverFn, DeliveredResult, LaneScheduler, SchedulerConfig, SchedulerStats, SendActionFn,
};
