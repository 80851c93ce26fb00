//! Translation engine seam.
//!
//! The production engine is an external AI service; workers only see this
//! trait. `EchoTranslationEngine` is the deterministic stand-in used by the
//! worker binary in dev and by tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{TranslationError, TranslationResult};
use crate::payload::LanguageCode;

#[async_trait]
pub trait TranslationEngine: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
        style: &str,
    ) -> TranslationResult<String>;

    /// Refine an existing translation, optionally following free-form
    /// instructions.
    async fn refine(
        &self,
        translation: &str,
        target: &LanguageCode,
        instructions: Option<&str>,
    ) -> TranslationResult<String>;
}

#[async_trait]
impl<E> TranslationEngine for Arc<E>
where
    E: TranslationEngine + ?Sized,
{
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
        style: &str,
    ) -> TranslationResult<String> {
        (**self).translate(text, source, target, style).await
    }

    async fn refine(
        &self,
        translation: &str,
        target: &LanguageCode,
        instructions: Option<&str>,
    ) -> TranslationResult<String> {
        (**self).refine(translation, target, instructions).await
    }
}

/// Tags text instead of translating it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTranslationEngine;

#[async_trait]
impl TranslationEngine for EchoTranslationEngine {
    async fn translate(
        &self,
        text: &str,
        source: &LanguageCode,
        target: &LanguageCode,
        _style: &str,
    ) -> TranslationResult<String> {
        if text.is_empty() {
            return Err(TranslationError::Engine("nothing to translate".to_string()));
        }
        Ok(format!("[Translated from {source} to {target}]: {text}"))
    }

    async fn refine(
        &self,
        translation: &str,
        target: &LanguageCode,
        instructions: Option<&str>,
    ) -> TranslationResult<String> {
        match instructions {
            Some(i) => Ok(format!("[Refined {target} ({i})]: {translation}")),
            None => Ok(format!("[Refined {target}]: {translation}")),
        }
    }
}
