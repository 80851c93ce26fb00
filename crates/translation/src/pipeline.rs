//! Multi-step pipelines executed by workers, one per job type.
//!
//! Every step writes to deterministic artifact keys, so a job that is
//! delivered twice (at-least-once) overwrites its own output instead of
//! duplicating it.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::artifacts::ArtifactStore;
use crate::engine::TranslationEngine;
use crate::error::{TranslationError, TranslationResult};
use crate::payload::{DocumentTranslationJob, ImprovementJob, TextTranslationJob};

/// Maximum characters per translated chunk.
pub const MAX_CHUNK_CHARS: usize = 4_000;

const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Side channel for step-level progress.
pub trait ProgressSink: Send + Sync {
    fn report(&self, step: &str, percent: u8);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _step: &str, _percent: u8) {}
}

fn source_key(document_id: &str) -> String {
    format!("documents/{document_id}/source")
}

fn translation_key(document_id: &str, lang: &str) -> String {
    format!("documents/{document_id}/{lang}/translated")
}

/// Split `text` into chunks of at most `max_chars` characters.
///
/// Paragraphs (separated by a blank line) are packed greedily; a paragraph
/// that alone exceeds the limit is cut at character boundaries. Blank
/// paragraphs are dropped.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for paragraph in text.split(PARAGRAPH_SEPARATOR) {
        if paragraph.trim().is_empty() {
            continue;
        }
        let len = paragraph.chars().count();

        if len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = paragraph.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }

        let needed = if current.is_empty() { len } else { current_len + 2 + len };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str(PARAGRAPH_SEPARATOR);
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub fn merge_chunks(chunks: &[String]) -> String {
    chunks.join(PARAGRAPH_SEPARATOR)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub target_language: String,
    pub chunks: usize,
    pub characters: usize,
    pub translation_key: String,
    pub manifest_key: String,
}

/// split → translate → merge → finalize.
pub async fn translate_document(
    engine: &dyn TranslationEngine,
    store: &dyn ArtifactStore,
    job: &DocumentTranslationJob,
    progress: &dyn ProgressSink,
) -> TranslationResult<DocumentOutcome> {
    let doc = job.document_id.as_str();
    let lang = job.target_language.as_str();

    let key = source_key(doc);
    let source = store
        .get(&key)
        .await?
        .ok_or_else(|| TranslationError::ArtifactNotFound(key.clone()))?;

    let chunks = split_into_chunks(&source, MAX_CHUNK_CHARS);
    if chunks.is_empty() {
        return Err(TranslationError::InvalidInput(format!("document {doc} is empty")));
    }
    progress.report("split", 10);

    let total = chunks.len();
    let mut translated = Vec::with_capacity(total);
    for (i, chunk) in chunks.iter().enumerate() {
        let out = engine
            .translate(chunk, &job.source_language, &job.target_language, &job.translation_style)
            .await?;
        store
            .put(&format!("documents/{doc}/{lang}/chunks/{i:05}"), out.clone())
            .await?;
        translated.push(out);

        let percent = 10 + (80 * (i + 1) / total) as u8;
        progress.report(&format!("translate {}/{}", i + 1, total), percent);
        debug!(document_id = doc, chunk = i + 1, total, "chunk translated");
    }

    let merged = merge_chunks(&translated);
    let characters = merged.chars().count();
    let translation_key = translation_key(doc, lang);
    store.put(&translation_key, merged).await?;
    progress.report("merge", 95);

    let manifest_key = format!("documents/{doc}/{lang}/manifest");
    let manifest = json!({
        "document_id": doc,
        "source_language": job.source_language,
        "target_language": job.target_language,
        "translation_style": job.translation_style,
        "specialization": job.specialization,
        "chunks": total,
        "characters": characters,
        "translation_key": translation_key,
    });
    store
        .put(&manifest_key, serde_json::to_string_pretty(&manifest)?)
        .await?;
    progress.report("finalize", 100);

    Ok(DocumentOutcome {
        document_id: doc.to_string(),
        target_language: lang.to_string(),
        chunks: total,
        characters,
        translation_key,
        manifest_key,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOutcome {
    pub request_id: String,
    pub target_language: String,
    pub artifact_key: String,
    pub translated_content: String,
}

pub async fn translate_text(
    engine: &dyn TranslationEngine,
    store: &dyn ArtifactStore,
    job: &TextTranslationJob,
    progress: &dyn ProgressSink,
) -> TranslationResult<TextOutcome> {
    let translated = engine
        .translate(&job.content, &job.source_language, &job.target_language, &job.style)
        .await?;
    progress.report("translate", 80);

    let artifact_key = format!("texts/{}/{}", job.request_id, job.target_language);
    store.put(&artifact_key, translated.clone()).await?;
    progress.report("store", 100);

    Ok(TextOutcome {
        request_id: job.request_id.clone(),
        target_language: job.target_language.to_string(),
        artifact_key,
        translated_content: translated,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementOutcome {
    pub document_id: String,
    pub target_language: String,
    pub revision: usize,
    pub revision_key: String,
    pub translation_key: String,
}

/// Refine the current translation; the previous text is kept as a numbered
/// revision.
pub async fn improve_translation(
    engine: &dyn TranslationEngine,
    store: &dyn ArtifactStore,
    job: &ImprovementJob,
    progress: &dyn ProgressSink,
) -> TranslationResult<ImprovementOutcome> {
    let doc = job.document_id.as_str();
    let lang = job.target_language.as_str();

    let translation_key = translation_key(doc, lang);
    let current = store
        .get(&translation_key)
        .await?
        .ok_or_else(|| TranslationError::ArtifactNotFound(translation_key.clone()))?;
    progress.report("fetch", 20);

    let refined = engine
        .refine(&current, &job.target_language, job.instructions.as_deref())
        .await?;
    progress.report("refine", 70);

    let revisions_prefix = format!("documents/{doc}/{lang}/revisions/");
    let revision = store.list(&revisions_prefix).await?.len() + 1;
    let revision_key = format!("{revisions_prefix}{revision:05}");
    store.put(&revision_key, current).await?;
    store.put(&translation_key, refined).await?;
    progress.report("store", 100);

    Ok(ImprovementOutcome {
        document_id: doc.to_string(),
        target_language: lang.to_string(),
        revision,
        revision_key,
        translation_key,
    })
}
