//! Job handlers for the three translation job types.
//!
//! Each handler decodes its payload, runs the matching pipeline with the
//! job's progress reporter and returns the pipeline outcome as the job
//! result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::instrument;

use lingoq_infra::{HandlerError, JobContext, JobHandler};
use lingoq_translation::{
    ArtifactStore, DocumentTranslationJob, ImprovementJob, TextTranslationJob, TranslationEngine,
    improve_translation, translate_document, translate_text,
};

/// Engine and artifact store shared by every handler of a process.
#[derive(Clone)]
pub struct TranslationServices {
    pub engine: Arc<dyn TranslationEngine>,
    pub store: Arc<dyn ArtifactStore>,
}

impl TranslationServices {
    pub fn new(engine: Arc<dyn TranslationEngine>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { engine, store }
    }
}

pub struct DocumentTranslationHandler {
    services: TranslationServices,
}

impl DocumentTranslationHandler {
    pub fn new(services: TranslationServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for DocumentTranslationHandler {
    #[instrument(name = "document_translation", skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt), err)]
    async fn handle(&self, payload: JsonValue, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        let job: DocumentTranslationJob = serde_json::from_value(payload)?;
        job.validate()?;
        let TranslationServices { engine, store } = &self.services;
        let outcome = translate_document(&**engine, &**store, &job, &ctx.progress).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

pub struct TextTranslationHandler {
    services: TranslationServices,
}

impl TextTranslationHandler {
    pub fn new(services: TranslationServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for TextTranslationHandler {
    #[instrument(name = "text_translation", skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt), err)]
    async fn handle(&self, payload: JsonValue, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        let job: TextTranslationJob = serde_json::from_value(payload)?;
        job.validate()?;
        let TranslationServices { engine, store } = &self.services;
        let outcome = translate_text(&**engine, &**store, &job, &ctx.progress).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

pub struct ImprovementHandler {
    services: TranslationServices,
}

impl ImprovementHandler {
    pub fn new(services: TranslationServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for ImprovementHandler {
    #[instrument(name = "improvement", skip_all, fields(job_id = %ctx.job_id, attempt = ctx.attempt), err)]
    async fn handle(&self, payload: JsonValue, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        let job: ImprovementJob = serde_json::from_value(payload)?;
        job.validate()?;
        let TranslationServices { engine, store } = &self.services;
        let outcome = improve_translation(&**engine, &**store, &job, &ctx.progress).await?;
        Ok(serde_json::to_value(outcome)?)
    }
}
