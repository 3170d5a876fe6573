//! Bounded event queues and the worker threads that drain them.
//!
//! Used by the validation harness to hand frames from a producer to one or more consumers
//! without ever blocking the producer.
#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{Dispatcher, DispatcherConfig, EventHandler};
pub use queue::{EventQueue, OverflowPolicy, OverflowSeverity, QueueError};
