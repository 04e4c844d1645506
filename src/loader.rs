//! Corpus loader: walks the corpus directory and produces [`Document`]s.
//!
//! Files are selected with include/exclude globs relative to the corpus
//! root, read, and run through [`extract`](crate::extract). Files that
//! cannot be read or extracted are skipped with a warning; a bad file never
//! aborts the load.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::extract;
use crate::models::Document;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Load every matching document under `config.dir`, sorted by relative path.
pub fn load_documents(config: &CorpusConfig) -> Result<Vec<Document>> {
    let root = &config.dir;
    if !root.is_dir() {
        bail!("Corpus directory does not exist: {}", root.display());
    }

    let include_set = build_globset(config.include_globs.iter().map(String::as_str))?;
    let exclude_set = build_globset(
        DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(config.exclude_globs.iter().map(String::as_str)),
    )?;

    let mut documents = Vec::new();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable corpus entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match read_document(path, &rel_str, config.max_extract_bytes) {
            Ok(Some(doc)) => documents.push(doc),
            Ok(None) => {}
            Err(e) => warn!("Skipping {}: {:#}", rel_str, e),
        }
    }

    documents.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Ok(documents)
}

/// Read one file. Returns `Ok(None)` for files that are deliberately skipped.
fn read_document(path: &Path, relative_path: &str, max_extract_bytes: u64) -> Result<Option<Document>> {
    let metadata = std::fs::metadata(path)?;
    let content_type = extract::content_type_for_path(path);

    if extract::is_binary(content_type) && metadata.len() > max_extract_bytes {
        warn!(
            "Skipping {}: {} bytes exceeds max_extract_bytes ({})",
            relative_path,
            metadata.len(),
            max_extract_bytes
        );
        return Ok(None);
    }

    let bytes = std::fs::read(path)?;
    let body = extract::extract_text(&bytes, content_type)?;
    if body.trim().is_empty() {
        debug!("Skipping {}: no extractable text", relative_path);
        return Ok(None);
    }

    let modified_at: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();

    let title = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string());

    Ok(Some(Document {
        source_id: relative_path.to_string(),
        title,
        content_type: content_type.to_string(),
        body,
        modified_at,
    }))
}

fn build_globset<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn corpus(dir: &Path) -> CorpusConfig {
        CorpusConfig {
            dir: dir.to_path_buf(),
            ..CorpusConfig::default()
        }
    }

    #[test]
    fn loads_matching_files_sorted() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.md"), "# Beta\n\nSecond.").unwrap();
        fs::write(tmp.path().join("a.txt"), "First.").unwrap();
        fs::create_dir_all(tmp.path().join("nested")).unwrap();
        fs::write(tmp.path().join("nested/c.md"), "Third.").unwrap();
        fs::write(tmp.path().join("image.png"), [0u8, 1, 2]).unwrap();

        let docs = load_documents(&corpus(tmp.path())).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.md", "nested/c.md"]);
        assert_eq!(docs[1].title, "b.md");
        assert_eq!(docs[1].content_type, extract::MIME_MARKDOWN);
    }

    #[test]
    fn skips_default_and_configured_excludes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join(".git/notes.md"), "hidden").unwrap();
        fs::create_dir_all(tmp.path().join("drafts")).unwrap();
        fs::write(tmp.path().join("drafts/wip.md"), "draft").unwrap();
        fs::write(tmp.path().join("keep.md"), "kept").unwrap();

        let mut config = corpus(tmp.path());
        config.exclude_globs = vec!["drafts/**".to_string()];
        let docs = load_documents(&config).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "keep.md");
    }

    #[test]
    fn broken_and_empty_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("broken.pdf"), "not a pdf").unwrap();
        fs::write(tmp.path().join("blank.txt"), "   \n").unwrap();
        fs::write(tmp.path().join("good.txt"), "Useful text.").unwrap();

        let docs = load_documents(&corpus(tmp.path())).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "good.txt");
    }

    #[test]
    fn oversized_binary_is_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("big.docx"), vec![0u8; 64]).unwrap();
        let mut config = corpus(tmp.path());
        config.max_extract_bytes = 16;
        let docs = load_documents(&config).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_documents(&corpus(&tmp.path().join("absent"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
