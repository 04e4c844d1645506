//! Index acquisition: load the snapshot or rebuild from the corpus.
//!
//! ```text
//! corpus missing ──▶ create it ──▶ CorpusCreated (caller exits 1)
//! snapshot ok    ──▶ Ready(index, Loaded)
//! otherwise      ──▶ load docs ──▶ build ──▶ save (best effort) ──▶ Ready(index, Built)
//! ```
//!
//! A snapshot that fails to load for any reason is logged and ignored. The
//! snapshot is a cache; it never aborts the run.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::index::Index;
use crate::loader::load_documents;
use crate::progress::{BuildProgress, BuildProgressEvent};
use crate::snapshot::{self, SnapshotError};

/// Where a ready index came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    Loaded,
    Built { documents: usize },
}

#[derive(Debug)]
pub enum Acquisition {
    Ready(Index, IndexOrigin),
    /// The corpus directory did not exist and has been created empty.
    CorpusCreated(PathBuf),
}

/// Produce an index for `config`, preferring the persisted snapshot.
pub async fn acquire_index(
    config: &Config,
    embedder: &dyn EmbeddingProvider,
    progress: &dyn BuildProgress,
) -> Result<Acquisition> {
    let corpus = &config.corpus.dir;
    if !corpus.exists() {
        std::fs::create_dir_all(corpus)
            .with_context(|| format!("Failed to create corpus directory: {}", corpus.display()))?;
        return Ok(Acquisition::CorpusCreated(corpus.clone()));
    }

    let store = &config.index.store_dir;
    match snapshot::load(store, embedder.model_name(), embedder.dims()).await {
        Ok(index) => return Ok(Acquisition::Ready(index, IndexOrigin::Loaded)),
        Err(SnapshotError::Missing(path)) => {
            info!(path = %path.display(), "No index snapshot, building");
        }
        Err(e) => {
            warn!(store = %store.display(), error = %e, "Ignoring index snapshot, rebuilding");
        }
    }

    println!("Indexing files in '{}' ...", corpus.display());
    progress.report(BuildProgressEvent::Loading {
        corpus: corpus.clone(),
    });
    let documents = load_documents(&config.corpus)?;
    if documents.is_empty() {
        bail!(
            "No readable documents in '{}'. Add text, markdown, PDF or Office files and re-run.",
            corpus.display()
        );
    }
    let document_count = documents.len();

    let index = Index::build(
        documents,
        &config.chunking,
        embedder,
        config.embedding.batch_size,
        progress,
    )
    .await?;
    println!("Indexed {} files.", document_count);
    info!(
        documents = document_count,
        chunks = index.chunks().len(),
        model = index.embedding_model(),
        "Built index"
    );

    progress.report(BuildProgressEvent::Persisting {
        store: store.clone(),
    });
    if let Err(e) = snapshot::save(&index, store).await {
        warn!(store = %store.display(), error = %format!("{:#}", e), "Failed to save index snapshot");
    }

    Ok(Acquisition::Ready(
        index,
        IndexOrigin::Built {
            documents: document_count,
        },
    ))
}
