//! Embedding: content → chunks → vectors → stored chunks.
//!
//! - [`Embedder`]: the contract the orchestrator depends on
//! - [`ChunkingEmbedder`]: chunks content, calls an [`EmbeddingProvider`],
//!   and replaces the item's chunks in one transaction
//! - [`OpenAiEmbeddingProvider`]: OpenAI-compatible HTTP provider
//! - [`DisabledProvider`]: used when no API key is configured

mod chunk;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use webindex_shared::{EmbeddingConfig, IndexError, IndexId, OrgId, Result, api_key_from_env};
use webindex_storage::{NewChunk, Storage};

pub use chunk::chunk_text;
pub use openai::{DisabledProvider, OpenAiEmbeddingProvider};

/// Item metadata passed alongside content.
#[derive(Debug, Clone)]
pub struct EmbedRequest<'a> {
    pub id: &'a IndexId,
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub org: &'a OrgId,
}

/// Replace an item's vectors with fresh ones for `content`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the new chunk ids.
    async fn embed(&self, content: &str, request: &EmbedRequest<'_>) -> Result<Vec<String>>;
}

/// A text → vector backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// One vector per input text, in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build the configured provider, or a [`DisabledProvider`] without a key.
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match api_key_from_env(&config.api_key_env) {
        Ok(key) => Ok(Arc::new(OpenAiEmbeddingProvider::new(config, key)?)),
        Err(e) => {
            warn!(env = %config.api_key_env, "embedding API key not set, embeddings disabled");
            Ok(Arc::new(DisabledProvider::new(e.to_string())))
        }
    }
}

/// Chunks content and stores one embedded chunk per piece.
pub struct ChunkingEmbedder {
    storage: Arc<Storage>,
    provider: Arc<dyn EmbeddingProvider>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkingEmbedder {
    pub fn new(
        storage: Arc<Storage>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &EmbeddingConfig,
    ) -> Self {
        Self {
            storage,
            provider,
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        }
    }
}

#[async_trait]
impl Embedder for ChunkingEmbedder {
    #[instrument(skip_all, fields(index_id = %request.id, org = %request.org))]
    async fn embed(&self, content: &str, request: &EmbedRequest<'_>) -> Result<Vec<String>> {
        let mut texts = chunk_text(content, self.chunk_size, self.chunk_overlap);
        if let (Some(first), Some(title)) = (texts.first_mut(), request.title) {
            if !first.starts_with(title) {
                *first = format!("{title}\n\n{first}");
            }
        }
        debug!(chunks = texts.len(), url = %request.url, "content chunked");

        // Compute vectors before touching stored chunks.
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.provider.embed_texts(&texts).await?
        };
        if vectors.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "provider returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            )));
        }

        let chunks: Vec<NewChunk> = texts
            .into_iter()
            .zip(vectors)
            .map(|(text, embedding)| NewChunk { text, embedding })
            .collect();
        let ids = self
            .storage
            .replace_chunks(request.id, request.org, self.provider.model_name(), &chunks)
            .await?;

        info!(chunks = ids.len(), "embeddings stored");
        Ok(ids)
    }
}
