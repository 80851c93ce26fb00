//! Background threads that consume the lifecycle bus.

pub mod event_drain;
pub mod lifecycle_logger;

pub use event_drain::{DrainHandle, EventDrain};
pub use lifecycle_logger::{log_event, spawn_lifecycle_logger};
