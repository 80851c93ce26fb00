//! Worker process: job handlers, admin HTTP surface and process wiring.

pub mod app;
pub mod handlers;
pub mod runtime;
pub mod settings;
