//! Index snapshots on disk.
//!
//! A snapshot is a SQLite database at `<store_dir>/index.sqlite` holding
//! three tables:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `meta` | `format_version`, `embedding_model`, `embedding_dims`, `snapshot_id`, `created_at` |
//! | `documents` | one row per source document |
//! | `chunks` | chunk text, SHA-256, and the embedding BLOB (NULL without embeddings) |
//!
//! [`load`] checks the format version, the embedding model/dims, and every
//! chunk hash before handing back an [`Index`]; any problem is a
//! [`SnapshotError`]. [`save`] writes to a temporary file beside the final
//! path and renames it into place when complete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::index::{Index, IndexedChunk, IndexedDocument};
use crate::models::Chunk;

pub const SNAPSHOT_FILE: &str = "index.sqlite";

/// Bumped whenever the table layout or its meaning changes.
pub const FORMAT_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot at {}", .0.display())]
    Missing(PathBuf),
    #[error("snapshot unreadable: {0}")]
    Unreadable(#[from] sqlx::Error),
    #[error("snapshot format version {found} is not supported (expected {expected})")]
    FormatVersion { found: i64, expected: i64 },
    #[error(
        "snapshot embeddings come from '{found}' ({found_dims} dims) but the configured model is '{expected}' ({expected_dims} dims)"
    )]
    EmbeddingMismatch {
        found: String,
        found_dims: usize,
        expected: String,
        expected_dims: usize,
    },
    #[error("snapshot is invalid: {0}")]
    Invalid(String),
}

/// Path of the snapshot database inside `store_dir`.
pub fn snapshot_path(store_dir: &Path) -> PathBuf {
    store_dir.join(SNAPSHOT_FILE)
}

async fn open(path: &Path, create: bool) -> Result<SqlitePool, sqlx::Error> {
    let mut options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .read_only(!create);
    if create {
        options = options.journal_mode(SqliteJournalMode::Delete);
    }

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Load an index from `store_dir`.
///
/// `expected_model`/`expected_dims` describe the configured embedding
/// provider; vectors from any other model are refused.
pub async fn load(
    store_dir: &Path,
    expected_model: &str,
    expected_dims: usize,
) -> Result<Index, SnapshotError> {
    let path = snapshot_path(store_dir);
    if !path.is_file() {
        return Err(SnapshotError::Missing(path));
    }

    let pool = open(&path, false).await?;
    let result = read_index(&pool, expected_model, expected_dims).await;
    pool.close().await;
    result
}

async fn read_index(
    pool: &SqlitePool,
    expected_model: &str,
    expected_dims: usize,
) -> Result<Index, SnapshotError> {
    let meta: HashMap<String, String> = sqlx::query("SELECT key, value FROM meta")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| -> Result<(String, String), sqlx::Error> {
            Ok((row.try_get("key")?, row.try_get("value")?))
        })
        .collect::<Result<_, sqlx::Error>>()?;

    let meta_field = |key: &str| {
        meta.get(key)
            .cloned()
            .ok_or_else(|| SnapshotError::Invalid(format!("meta.{} missing", key)))
    };

    let found_version: i64 = meta_field("format_version")?
        .parse()
        .map_err(|_| SnapshotError::Invalid("meta.format_version is not a number".into()))?;
    if found_version != FORMAT_VERSION {
        return Err(SnapshotError::FormatVersion {
            found: found_version,
            expected: FORMAT_VERSION,
        });
    }

    let model = meta_field("embedding_model")?;
    let dims: usize = meta_field("embedding_dims")?
        .parse()
        .map_err(|_| SnapshotError::Invalid("meta.embedding_dims is not a number".into()))?;
    if model != expected_model || dims != expected_dims {
        return Err(SnapshotError::EmbeddingMismatch {
            found: model,
            found_dims: dims,
            expected: expected_model.to_string(),
            expected_dims,
        });
    }

    let documents = sqlx::query(
        "SELECT source_id, title, content_type, modified_at FROM documents ORDER BY source_id",
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| -> Result<IndexedDocument, sqlx::Error> {
        Ok(IndexedDocument {
            source_id: row.try_get("source_id")?,
            title: row.try_get("title")?,
            content_type: row.try_get("content_type")?,
            modified_at: row.try_get("modified_at")?,
        })
    })
    .collect::<Result<Vec<_>, sqlx::Error>>()?;

    let rows = sqlx::query(
        "SELECT id, source_id, chunk_index, text, hash, embedding FROM chunks ORDER BY source_id, chunk_index",
    )
    .fetch_all(pool)
    .await?;

    let mut chunks = Vec::with_capacity(rows.len());
    for row in &rows {
        let chunk = Chunk {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            chunk_index: row.try_get("chunk_index")?,
            text: row.try_get("text")?,
            hash: row.try_get("hash")?,
        };
        if sha256_hex(&chunk.text) != chunk.hash {
            return Err(SnapshotError::Invalid(format!(
                "chunk {} text does not match its hash",
                chunk.id
            )));
        }
        let blob: Option<Vec<u8>> = row.try_get("embedding")?;
        chunks.push(IndexedChunk {
            chunk,
            vector: blob.map(|b| blob_to_vec(&b)),
        });
    }

    let index = Index::from_parts(model, dims, documents, chunks)
        .map_err(|e| SnapshotError::Invalid(e.to_string()))?;

    info!(
        snapshot_id = meta.get("snapshot_id").map(String::as_str).unwrap_or("?"),
        created_at = meta.get("created_at").map(String::as_str).unwrap_or("?"),
        documents = index.documents().len(),
        chunks = index.chunks().len(),
        "Loaded index snapshot"
    );
    Ok(index)
}

/// Persist `index` to `store_dir`, replacing any previous snapshot.
///
/// Returns the final snapshot path.
pub async fn save(index: &Index, store_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(store_dir)
        .with_context(|| format!("Failed to create index store: {}", store_dir.display()))?;

    let final_path = snapshot_path(store_dir);
    let snapshot_id = Uuid::new_v4();
    let tmp_path = store_dir.join(format!("{}.{}.tmp", SNAPSHOT_FILE, snapshot_id));

    if let Err(e) = write_and_swap(index, &tmp_path, &final_path, snapshot_id).await {
        if let Err(rm) = std::fs::remove_file(&tmp_path) {
            if rm.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp_path.display(), error = %rm, "Failed to remove temporary snapshot");
            }
        }
        return Err(e);
    }

    debug!(path = %final_path.display(), %snapshot_id, "Saved index snapshot");
    Ok(final_path)
}

async fn write_and_swap(
    index: &Index,
    tmp_path: &Path,
    final_path: &Path,
    snapshot_id: Uuid,
) -> anyhow::Result<()> {
    let pool = open(tmp_path, true)
        .await
        .with_context(|| format!("Failed to create snapshot: {}", tmp_path.display()))?;
    let written = write_index(&pool, index, snapshot_id).await;
    pool.close().await;
    written.with_context(|| format!("Failed to write snapshot: {}", tmp_path.display()))?;

    std::fs::rename(tmp_path, final_path).with_context(|| {
        format!(
            "Failed to move snapshot into place: {}",
            final_path.display()
        )
    })
}

async fn write_index(pool: &SqlitePool, index: &Index, snapshot_id: Uuid) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        CREATE TABLE documents (
            source_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content_type TEXT NOT NULL,
            modified_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE chunks (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB,
            UNIQUE(source_id, chunk_index),
            FOREIGN KEY (source_id) REFERENCES documents(source_id)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let meta = [
        ("format_version", FORMAT_VERSION.to_string()),
        ("embedding_model", index.embedding_model().to_string()),
        ("embedding_dims", index.dims().to_string()),
        ("snapshot_id", snapshot_id.to_string()),
        ("created_at", Utc::now().to_rfc3339()),
    ];
    for (key, value) in meta {
        sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    for doc in index.documents() {
        sqlx::query(
            "INSERT INTO documents (source_id, title, content_type, modified_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&doc.source_id)
        .bind(&doc.title)
        .bind(&doc.content_type)
        .bind(doc.modified_at)
        .execute(&mut *tx)
        .await?;
    }

    for c in index.chunks() {
        sqlx::query(
            "INSERT INTO chunks (id, source_id, chunk_index, text, hash, embedding) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&c.chunk.id)
        .bind(&c.chunk.source_id)
        .bind(c.chunk.chunk_index)
        .bind(&c.chunk.text)
        .bind(&c.chunk.hash)
        .bind(c.vector.as_deref().map(vec_to_blob))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use tempfile::TempDir;

    fn sample_index(model: &str, dims: usize) -> Index {
        let docs = vec![
            IndexedDocument {
                source_id: "a.md".into(),
                title: "a.md".into(),
                content_type: "text/markdown".into(),
                modified_at: 1_700_000_000,
            },
            IndexedDocument {
                source_id: "b.txt".into(),
                title: "b.txt".into(),
                content_type: "text/plain".into(),
                modified_at: 1_700_000_100,
            },
        ];
        let vector = |i: usize| (dims > 0).then(|| vec![i as f32; dims]);
        let mut chunks = Vec::new();
        for (i, c) in chunk_text("a.md", "Alpha one.\n\nAlpha two.", 3, 0)
            .into_iter()
            .chain(chunk_text("b.txt", "Beta.", 3, 0))
            .enumerate()
        {
            chunks.push(IndexedChunk {
                chunk: c,
                vector: vector(i),
            });
        }
        Index::from_parts(model, dims, docs, chunks).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_restores_everything() {
        let tmp = TempDir::new().unwrap();
        let index = sample_index("test-model", 3);
        let path = save(&index, tmp.path()).await.unwrap();
        assert_eq!(path, tmp.path().join(SNAPSHOT_FILE));

        let loaded = load(tmp.path(), "test-model", 3).await.unwrap();
        assert_eq!(loaded.documents(), index.documents());
        assert_eq!(loaded.chunks(), index.chunks());
        assert_eq!(loaded.embedding_model(), "test-model");
    }

    #[tokio::test]
    async fn save_leaves_no_temporary_files() {
        let tmp = TempDir::new().unwrap();
        save(&sample_index("disabled", 0), tmp.path()).await.unwrap();
        save(&sample_index("disabled", 0), tmp.path()).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![SNAPSHOT_FILE.to_string()]);
    }

    #[tokio::test]
    async fn failed_save_removes_its_temporary_file() {
        let tmp = TempDir::new().unwrap();
        // A non-empty directory in the snapshot's place makes the rename fail.
        let blocker = snapshot_path(tmp.path());
        std::fs::create_dir_all(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        assert!(save(&sample_index("disabled", 0), tmp.path()).await.is_err());
        assert!(save(&sample_index("disabled", 0), tmp.path()).await.is_err());

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![SNAPSHOT_FILE.to_string()]);
    }

    #[tokio::test]
    async fn missing_snapshot() {
        let tmp = TempDir::new().unwrap();
        let err = load(tmp.path(), "disabled", 0).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Missing(_)));
    }

    #[tokio::test]
    async fn garbage_file_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(snapshot_path(tmp.path()), b"definitely not sqlite, just some bytes").unwrap();
        let err = load(tmp.path(), "disabled", 0).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Unreadable(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn embedding_model_change_is_incompatible() {
        let tmp = TempDir::new().unwrap();
        save(&sample_index("old-model", 3), tmp.path()).await.unwrap();
        let err = load(tmp.path(), "new-model", 3).await.unwrap_err();
        assert!(matches!(err, SnapshotError::EmbeddingMismatch { .. }));
    }

    #[tokio::test]
    async fn future_format_version_is_incompatible() {
        let tmp = TempDir::new().unwrap();
        save(&sample_index("disabled", 0), tmp.path()).await.unwrap();

        let pool = open(&snapshot_path(tmp.path()), true).await.unwrap();
        sqlx::query("UPDATE meta SET value = '99' WHERE key = 'format_version'")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let err = load(tmp.path(), "disabled", 0).await.unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::FormatVersion {
                found: 99,
                expected: FORMAT_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn tampered_chunk_is_invalid() {
        let tmp = TempDir::new().unwrap();
        save(&sample_index("disabled", 0), tmp.path()).await.unwrap();

        let pool = open(&snapshot_path(tmp.path()), true).await.unwrap();
        sqlx::query("UPDATE chunks SET text = 'tampered' WHERE source_id = 'b.txt'")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let err = load(tmp.path(), "disabled", 0).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Invalid(_)));
    }
}
