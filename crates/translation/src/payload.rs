//! Job payloads for the three translation workloads.
//!
//! Payloads travel through the queue as JSON. `validate` enforces the shape a
//! producer must respect before anything is enqueued; workers deserialize the
//! same types back out of `Job::payload`.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use lingoq_core::{DomainError, DomainResult};

pub const DOCUMENT_TRANSLATION_TOPIC: &str = "document-translation";
pub const TEXT_TRANSLATION_TOPIC: &str = "text-translation";
pub const IMPROVEMENT_TOPIC: &str = "improvement";

/// Upper bound on inline text carried in a payload.
pub const MAX_TEXT_CHARS: usize = 50_000;

/// Language tag: `xx`, `xxx` or `xx-YY` (e.g. `en`, `fil`, `pt-BR`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageCode(String);

impl LanguageCode {
    pub fn new(code: impl Into<String>) -> DomainResult<Self> {
        let code = code.into();
        let (lang, region) = match code.split_once('-') {
            Some((lang, region)) => (lang, Some(region)),
            None => (code.as_str(), None),
        };

        let lang_ok = (2..=3).contains(&lang.len()) && lang.chars().all(|c| c.is_ascii_lowercase());
        let region_ok = match region {
            None => true,
            Some(r) => lang.len() == 2 && r.len() == 2 && r.chars().all(|c| c.is_ascii_uppercase()),
        };

        if !lang_ok || !region_ok {
            return Err(DomainError::validation(format!(
                "invalid language code '{code}' (expected xx, xxx or xx-YY)"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LanguageCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for LanguageCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LanguageCode> for String {
    fn from(value: LanguageCode) -> Self {
        value.0
    }
}

fn require_identifier(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    if value.contains('/') {
        return Err(DomainError::validation(format!("{field} must not contain '/'")));
    }
    Ok(())
}

fn require_distinct(source: &LanguageCode, target: &LanguageCode) -> DomainResult<()> {
    if source == target {
        return Err(DomainError::validation(format!(
            "source and target language are both '{source}'"
        )));
    }
    Ok(())
}

fn default_style() -> String {
    "general".to_string()
}

/// Translate a stored document into another language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTranslationJob {
    pub document_id: String,
    pub source_language: LanguageCode,
    pub target_language: LanguageCode,
    #[serde(default = "default_style")]
    pub translation_style: String,
    #[serde(default)]
    pub specialization: Option<String>,
}

impl DocumentTranslationJob {
    pub fn validate(&self) -> DomainResult<()> {
        require_identifier("document_id", &self.document_id)?;
        require_distinct(&self.source_language, &self.target_language)
    }

    /// One in-flight translation per (document, target language).
    pub fn dedupe_key(&self) -> String {
        format!("doc:{}:{}", self.document_id, self.target_language)
    }
}

/// Translate a short inline text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextTranslationJob {
    pub request_id: String,
    pub content: String,
    pub source_language: LanguageCode,
    pub target_language: LanguageCode,
    #[serde(default = "default_style")]
    pub style: String,
}

impl TextTranslationJob {
    pub fn validate(&self) -> DomainResult<()> {
        require_identifier("request_id", &self.request_id)?;
        if self.content.trim().is_empty() {
            return Err(DomainError::validation("content must not be empty"));
        }
        if self.content.chars().count() > MAX_TEXT_CHARS {
            return Err(DomainError::validation(format!(
                "content longer than {MAX_TEXT_CHARS} characters"
            )));
        }
        require_distinct(&self.source_language, &self.target_language)
    }
}

/// Refine an existing document translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImprovementJob {
    pub document_id: String,
    pub target_language: LanguageCode,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl ImprovementJob {
    pub fn validate(&self) -> DomainResult<()> {
        require_identifier("document_id", &self.document_id)?;
        if let Some(instructions) = &self.instructions {
            if instructions.chars().count() > MAX_TEXT_CHARS {
                return Err(DomainError::validation(format!(
                    "instructions longer than {MAX_TEXT_CHARS} characters"
                )));
            }
        }
        Ok(())
    }
}
