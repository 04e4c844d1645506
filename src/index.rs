//! The in-memory retrieval index.
//!
//! An [`Index`] holds every chunk of the corpus, with an embedding vector
//! per chunk when an embedding provider is enabled. It is either built
//! fresh from [`Document`]s or restored from a snapshot; it is never
//! updated incrementally.

use anyhow::{bail, Context, Result};

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::embedding::{EmbeddingProvider, DISABLED_MODEL};
use crate::models::{Chunk, Document};
use crate::progress::{BuildProgress, BuildProgressEvent};

/// Document metadata kept alongside the chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub source_id: String,
    pub title: String,
    pub content_type: String,
    pub modified_at: i64,
}

/// A chunk plus its embedding, if the index has vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct Index {
    embedding_model: String,
    dims: usize,
    documents: Vec<IndexedDocument>,
    chunks: Vec<IndexedChunk>,
}

impl Index {
    /// Assemble an index from parts, checking it is non-empty and that
    /// vectors are either absent everywhere or present with `dims` entries.
    pub fn from_parts(
        embedding_model: impl Into<String>,
        dims: usize,
        documents: Vec<IndexedDocument>,
        chunks: Vec<IndexedChunk>,
    ) -> Result<Self> {
        let embedding_model = embedding_model.into();
        if documents.is_empty() || chunks.is_empty() {
            bail!("An index needs at least one document and one chunk");
        }

        let with_vectors = embedding_model != DISABLED_MODEL;
        for c in &chunks {
            match (&c.vector, with_vectors) {
                (Some(v), true) if v.len() == dims => {}
                (None, false) => {}
                (Some(v), true) => bail!(
                    "Chunk {} has {} dims, expected {}",
                    c.chunk.id,
                    v.len(),
                    dims
                ),
                (None, true) => bail!("Chunk {} is missing its embedding", c.chunk.id),
                (Some(_), false) => bail!("Chunk {} has an embedding but the index has none", c.chunk.id),
            }
        }

        Ok(Self {
            embedding_model,
            dims,
            documents,
            chunks,
        })
    }

    /// Build a fresh index: chunk every document, then embed in batches.
    pub async fn build(
        documents: Vec<Document>,
        chunking: &ChunkingConfig,
        embedder: &dyn EmbeddingProvider,
        batch_size: usize,
        progress: &dyn BuildProgress,
    ) -> Result<Self> {
        let mut indexed_docs = Vec::with_capacity(documents.len());
        let mut chunks: Vec<Chunk> = Vec::new();

        for doc in documents {
            chunks.extend(chunk_text(
                &doc.source_id,
                &doc.body,
                chunking.max_tokens,
                chunking.overlap_tokens,
            ));
            indexed_docs.push(IndexedDocument {
                source_id: doc.source_id,
                title: doc.title,
                content_type: doc.content_type,
                modified_at: doc.modified_at.timestamp(),
            });
        }

        let vectors = if embedder.is_enabled() {
            Some(embed_all(&chunks, embedder, batch_size, progress).await?)
        } else {
            None
        };

        let chunks: Vec<IndexedChunk> = match vectors {
            Some(vecs) => chunks
                .into_iter()
                .zip(vecs)
                .map(|(chunk, v)| IndexedChunk {
                    chunk,
                    vector: Some(v),
                })
                .collect(),
            None => chunks
                .into_iter()
                .map(|chunk| IndexedChunk {
                    chunk,
                    vector: None,
                })
                .collect(),
        };

        Self::from_parts(embedder.model_name(), embedder.dims(), indexed_docs, chunks)
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn has_vectors(&self) -> bool {
        self.embedding_model != DISABLED_MODEL
    }

    pub fn documents(&self) -> &[IndexedDocument] {
        &self.documents
    }

    pub fn chunks(&self) -> &[IndexedChunk] {
        &self.chunks
    }

    pub fn document(&self, source_id: &str) -> Option<&IndexedDocument> {
        self.documents.iter().find(|d| d.source_id == source_id)
    }
}

async fn embed_all(
    chunks: &[Chunk],
    embedder: &dyn EmbeddingProvider,
    batch_size: usize,
    progress: &dyn BuildProgress,
) -> Result<Vec<Vec<f32>>> {
    let total = chunks.len() as u64;
    let mut vectors = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embedded = embedder
            .embed(&texts)
            .await
            .with_context(|| format!("Embedding failed with model '{}'", embedder.model_name()))?;
        if embedded.len() != batch.len() {
            bail!(
                "Embedding provider returned {} vectors for {} texts",
                embedded.len(),
                batch.len()
            );
        }
        vectors.extend(embedded);
        progress.report(BuildProgressEvent::Embedding {
            n: vectors.len() as u64,
            total,
        });
    }

    Ok(vectors)
}
