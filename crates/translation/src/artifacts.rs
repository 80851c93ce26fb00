//! Artifact storage seam (source documents, chunks, translations).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{TranslationError, TranslationResult};

/// Key/value artifact storage addressed by slash-separated keys
/// (`documents/<id>/source`, `texts/<request>/<lang>`, ...).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &str) -> TranslationResult<Option<String>>;

    /// Create or overwrite.
    async fn put(&self, key: &str, content: String) -> TranslationResult<()>;

    /// Keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> TranslationResult<Vec<String>>;
}

#[async_trait]
impl<S> ArtifactStore for Arc<S>
where
    S: ArtifactStore + ?Sized,
{
    async fn get(&self, key: &str) -> TranslationResult<Option<String>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, content: String) -> TranslationResult<()> {
        (**self).put(key, content).await
    }

    async fn list(&self, prefix: &str) -> TranslationResult<Vec<String>> {
        (**self).list(prefix).await
    }
}

/// In-memory artifact store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> TranslationError {
        TranslationError::Storage("artifact store lock poisoned".to_string())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn get(&self, key: &str) -> TranslationResult<Option<String>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, content: String) -> TranslationResult<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_string(), content);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> TranslationResult<Vec<String>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
