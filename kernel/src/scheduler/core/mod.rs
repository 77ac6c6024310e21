//! Scheduler core: queue state and the context-switch protocol

pub mod runqueue;
pub mod scheduler;
