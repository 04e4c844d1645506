//! Passage retrieval over an [`Index`]: keyword, semantic, and hybrid.
//!
//! Each channel produces raw-scored chunk candidates. Scores are min-max
//! normalized per channel, blended as `(1 - α)·keyword + α·vector`, capped
//! per document, and ordered deterministically (score desc, source asc,
//! chunk index asc) so the same index and query always ground the answer
//! on the same passages.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::config::{RetrievalConfig, SearchMode};
use crate::embedding::cosine_similarity;
use crate::index::Index;
use crate::models::Passage;

#[derive(Debug, Clone)]
struct ChunkCandidate {
    /// Position of the chunk in [`Index::chunks`].
    pos: usize,
    raw_score: f64,
}

/// Retrieve the top passages for `query`.
///
/// `query_vec` is the query embedding; without it (or without vectors in
/// the index) semantic and hybrid modes degrade to keyword scoring.
pub fn retrieve(
    index: &Index,
    query: &str,
    query_vec: Option<&[f32]>,
    config: &RetrievalConfig,
) -> Vec<Passage> {
    if query.trim().is_empty() {
        return Vec::new();
    }

    let vector_ready = index.has_vectors() && query_vec.is_some();
    let mode = match config.mode {
        SearchMode::Semantic | SearchMode::Hybrid if !vector_ready => SearchMode::Keyword,
        m => m,
    };

    let keyword = if mode != SearchMode::Semantic {
        keyword_candidates(index, query, config.candidate_k)
    } else {
        Vec::new()
    };
    let vector = match (mode, query_vec) {
        (SearchMode::Semantic | SearchMode::Hybrid, Some(qv)) => {
            vector_candidates(index, qv, config.candidate_k)
        }
        _ => Vec::new(),
    };

    let alpha = match mode {
        SearchMode::Keyword => 0.0,
        SearchMode::Semantic => 1.0,
        SearchMode::Hybrid => config.hybrid_alpha,
    };

    let kw_map: HashMap<usize, f64> = normalize_scores(&keyword)
        .into_iter()
        .map(|(c, s)| (c.pos, s))
        .collect();
    let vec_map: HashMap<usize, f64> = normalize_scores(&vector)
        .into_iter()
        .map(|(c, s)| (c.pos, s))
        .collect();

    let positions: HashSet<usize> = kw_map.keys().chain(vec_map.keys()).copied().collect();
    let chunks = index.chunks();

    let mut scored: Vec<(usize, f64)> = positions
        .into_iter()
        .map(|pos| {
            let k = kw_map.get(&pos).copied().unwrap_or(0.0);
            let v = vec_map.get(&pos).copied().unwrap_or(0.0);
            (pos, (1.0 - alpha) * k + alpha * v)
        })
        .collect();

    scored.sort_by(|(pa, sa), (pb, sb)| {
        let ca = &chunks[*pa].chunk;
        let cb = &chunks[*pb].chunk;
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ca.source_id.cmp(&cb.source_id))
            .then(ca.chunk_index.cmp(&cb.chunk_index))
    });

    let mut per_doc: HashMap<&str, usize> = HashMap::new();
    let mut passages = Vec::with_capacity(config.top_k);
    for (pos, score) in scored {
        let chunk = &chunks[pos].chunk;
        let taken = per_doc.entry(chunk.source_id.as_str()).or_insert(0);
        if *taken >= config.max_chunks_per_doc {
            continue;
        }
        *taken += 1;

        let title = index
            .document(&chunk.source_id)
            .map(|d| d.title.clone())
            .unwrap_or_else(|| chunk.source_id.clone());
        passages.push(Passage {
            chunk_id: chunk.id.clone(),
            source_id: chunk.source_id.clone(),
            title,
            chunk_index: chunk.chunk_index,
            score,
            text: chunk.text.clone(),
        });
        if passages.len() >= config.top_k {
            break;
        }
    }

    passages
}

/// Lowercased alphanumeric terms.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// TF-IDF style keyword scoring: rare query terms weigh more than common ones.
fn keyword_candidates(index: &Index, query: &str, candidate_k: usize) -> Vec<ChunkCandidate> {
    // Sorted so every chunk sums its term weights in the same order.
    let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
    if terms.is_empty() {
        return Vec::new();
    }

    let chunk_terms: Vec<HashMap<String, usize>> = index
        .chunks()
        .iter()
        .map(|c| {
            let mut tf: HashMap<String, usize> = HashMap::new();
            for t in tokenize(&c.chunk.text) {
                if terms.contains(&t) {
                    *tf.entry(t).or_insert(0) += 1;
                }
            }
            tf
        })
        .collect();

    let n = chunk_terms.len() as f64;
    let idf: Vec<(&str, f64)> = terms
        .iter()
        .map(|t| {
            let df = chunk_terms.iter().filter(|tf| tf.contains_key(t)).count() as f64;
            (t.as_str(), (1.0 + n / (1.0 + df)).ln())
        })
        .collect();

    let mut candidates: Vec<ChunkCandidate> = chunk_terms
        .iter()
        .enumerate()
        .filter(|(_, tf)| !tf.is_empty())
        .map(|(pos, tf)| {
            let raw_score: f64 = idf
                .iter()
                .filter_map(|(t, w)| tf.get(*t).map(|&count| (1.0 + (count as f64).ln()) * w))
                .sum();
            ChunkCandidate { pos, raw_score }
        })
        .collect();

    top_k(&mut candidates, candidate_k);
    candidates
}

fn vector_candidates(index: &Index, query_vec: &[f32], candidate_k: usize) -> Vec<ChunkCandidate> {
    let mut candidates: Vec<ChunkCandidate> = index
        .chunks()
        .iter()
        .enumerate()
        .filter_map(|(pos, c)| {
            c.vector.as_ref().map(|v| ChunkCandidate {
                pos,
                raw_score: cosine_similarity(query_vec, v) as f64,
            })
        })
        .collect();

    top_k(&mut candidates, candidate_k);
    candidates
}

fn top_k(candidates: &mut Vec<ChunkCandidate>, k: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pos.cmp(&b.pos))
    });
    candidates.truncate(k);
}

/// Min-max normalize scores to `[0, 1]`. Equal scores all normalize to 1.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_text;
    use crate::index::{IndexedChunk, IndexedDocument};

    fn make_candidate(pos: usize, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            pos,
            raw_score: score,
        }
    }

    /// One chunk per document; vectors given explicitly when `dims > 0`.
    fn index_of(docs: &[(&str, &str, Option<Vec<f32>>)]) -> Index {
        let with_vectors = docs.iter().any(|(_, _, v)| v.is_some());
        let mut documents = Vec::new();
        let mut chunks = Vec::new();
        for (id, text, vec) in docs {
            documents.push(IndexedDocument {
                source_id: id.to_string(),
                title: format!("{} title", id),
                content_type: "text/plain".into(),
                modified_at: 0,
            });
            chunks.push(IndexedChunk {
                chunk: chunk_text(id, text, 500, 0).remove(0),
                vector: vec.clone(),
            });
        }
        let (model, dims) = if with_vectors { ("test", 2) } else { ("disabled", 0) };
        Index::from_parts(model, dims, documents, chunks).unwrap()
    }

    fn keyword_config(top_k: usize) -> RetrievalConfig {
        RetrievalConfig {
            mode: SearchMode::Keyword,
            top_k,
            ..RetrievalConfig::default()
        }
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate(0, 10.0),
            make_candidate(1, 5.0),
            make_candidate(2, 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![make_candidate(0, 3.0), make_candidate(1, 3.0)];
        for (_, score) in normalize_scores(&candidates) {
            assert!((score - 1.0).abs() < 1e-9);
        }
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn keyword_prefers_rare_matching_terms() {
        let index = index_of(&[
            ("a.md", "The sky is blue on a clear day.", None),
            ("b.md", "The grass is green.", None),
            ("c.md", "The ocean is deep.", None),
        ]);
        let passages = retrieve(&index, "why is the sky blue", None, &keyword_config(1));
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].source_id, "a.md");
        assert_eq!(passages[0].title, "a.md title");
    }

    #[test]
    fn no_matches_yields_nothing() {
        let index = index_of(&[("a.md", "Rust and cargo.", None)]);
        assert!(retrieve(&index, "kubernetes", None, &keyword_config(3)).is_empty());
        assert!(retrieve(&index, "   ", None, &keyword_config(3)).is_empty());
    }

    #[test]
    fn ties_break_by_source_order() {
        let index = index_of(&[
            ("b.md", "shared term", None),
            ("a.md", "shared term", None),
        ]);
        let passages = retrieve(&index, "shared", None, &keyword_config(2));
        let ids: Vec<&str> = passages.iter().map(|p| p.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.md", "b.md"]);
    }

    #[test]
    fn equal_term_sets_tie_exactly_regardless_of_word_order() {
        let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta"];
        let forward = format!("{} common", words.join(" "));
        let mut reversed_words = words;
        reversed_words.reverse();
        let reversed = format!("{} common", reversed_words.join(" "));
        // Fillers give each query term a different document frequency.
        let fillers: Vec<String> = (0..words.len())
            .map(|i| words[..=i].join(" "))
            .collect();
        let mut docs = vec![("b.md", reversed.as_str(), None), ("a.md", forward.as_str(), None)];
        let names = ["c.md", "d.md", "e.md", "f.md", "g.md", "h.md", "i.md", "j.md"];
        for (name, text) in names.iter().zip(&fillers) {
            docs.push((*name, text.as_str(), None));
        }

        for _ in 0..50 {
            let index = index_of(&docs);
            let passages = retrieve(
                &index,
                "alpha beta gamma delta epsilon zeta eta theta",
                None,
                &keyword_config(3),
            );
            let a = passages.iter().position(|p| p.source_id == "a.md").unwrap();
            let b = passages.iter().position(|p| p.source_id == "b.md").unwrap();
            assert!(a < b, "{:?}", passages);
            assert_eq!(passages[a].score.to_bits(), passages[b].score.to_bits());
        }
    }

    #[test]
    fn semantic_mode_ranks_by_cosine() {
        let index = index_of(&[
            ("east.md", "pointing east", Some(vec![1.0, 0.0])),
            ("north.md", "pointing north", Some(vec![0.0, 1.0])),
        ]);
        let config = RetrievalConfig {
            mode: SearchMode::Semantic,
            top_k: 1,
            ..RetrievalConfig::default()
        };
        let passages = retrieve(&index, "which way", Some(&[0.1, 0.9]), &config);
        assert_eq!(passages[0].source_id, "north.md");
    }

    #[test]
    fn hybrid_without_query_vector_falls_back_to_keyword() {
        let index = index_of(&[
            ("east.md", "pointing east", Some(vec![1.0, 0.0])),
            ("north.md", "pointing north", Some(vec![0.0, 1.0])),
        ]);
        let config = RetrievalConfig {
            mode: SearchMode::Hybrid,
            top_k: 1,
            ..RetrievalConfig::default()
        };
        let passages = retrieve(&index, "north", None, &config);
        assert_eq!(passages[0].source_id, "north.md");
    }

    #[test]
    fn per_document_cap_applies() {
        let text = (0..6)
            .map(|i| format!("apple paragraph {}", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks: Vec<IndexedChunk> = chunk_text("fruit.md", &text, 5, 0)
            .into_iter()
            .map(|chunk| IndexedChunk { chunk, vector: None })
            .collect();
        assert!(chunks.len() > 2);
        let index = Index::from_parts(
            "disabled",
            0,
            vec![IndexedDocument {
                source_id: "fruit.md".into(),
                title: "fruit.md".into(),
                content_type: "text/plain".into(),
                modified_at: 0,
            }],
            chunks,
        )
        .unwrap();
        let config = RetrievalConfig {
            max_chunks_per_doc: 2,
            ..keyword_config(5)
        };
        assert_eq!(retrieve(&index, "apple", None, &config).len(), 2);
    }
}
