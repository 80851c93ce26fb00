//! `lingoq-translation`
//!
//! **Responsibility:** the translation workloads that ride on the queue.
//!
//! This crate knows nothing about queues, leases or retries:
//! - it defines the job payloads producers enqueue (and how to validate them),
//! - the collaborator seams a worker needs (translation engine, artifact store),
//! - and the multi-step pipelines a worker runs for each job type.
//!
//! The real AI engine and file storage are external systems; this crate ships
//! in-memory stand-ins for both.

pub mod artifacts;
pub mod engine;
pub mod error;
pub mod payload;
pub mod pipeline;

pub use artifacts::{ArtifactStore, InMemoryArtifactStore};
pub use engine::{EchoTranslationEngine, TranslationEngine};
pub use error::{TranslationError, TranslationResult};
pub use payload::{
    DOCUMENT_TRANSLATION_TOPIC, DocumentTranslationJob, IMPROVEMENT_TOPIC, ImprovementJob,
    LanguageCode, MAX_TEXT_CHARS, TEXT_TRANSLATION_TOPIC, TextTranslationJob,
};
pub use pipeline::{
    DocumentOutcome, ImprovementOutcome, NoProgress, ProgressSink, TextOutcome, improve_translation,
    merge_chunks, split_into_chunks, translate_document, translate_text,
};
