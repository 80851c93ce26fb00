//! `lingoq-core`: shared building blocks for the job queue.
//!
//! This crate contains **pure** primitives (no IO, no runtime): identifiers,
//! topic names and the domain error model.

pub mod error;
pub mod id;
pub mod topic;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, LeaseId, WorkerId};
pub use topic::Topic;
