//! In-memory nearest-neighbor index over chunk vectors.
//!
//! The index holds immutable *generations*. Readers clone the current
//! generation's `Arc` out of a briefly-held lock and then search entirely
//! lock-free, so any number of searches run concurrently and never observe
//! a half-built index. Writers replace the generation: incremental
//! `add_batch`/`remove_document` copy-on-write the entry list, and
//! [`rebuild`](VectorIndex::rebuild) constructs a complete new generation
//! before swapping it in.
//!
//! Invariants:
//! - every vector in a generation was produced by one embedding-model
//!   version; adding a vector from another version is refused with
//!   [`IndexInconsistencyError::VersionSkew`], the signal to rebuild;
//! - results are ranked by descending cosine similarity, with ties broken
//!   by chunk insertion order so identical inputs rank identically.
//!
//! Entries reference chunks by identifier only; the document data they were
//! built from stays in the store, and deletions purge entries eagerly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::embedding::cosine_similarity;
use crate::error::IndexInconsistencyError;

/// One indexed chunk vector.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub scope: String,
    pub vector: Vec<f32>,
    /// Monotonic insertion counter, the deterministic tie-break.
    seq: u64,
}

/// A record fed into [`VectorIndex::rebuild`], typically loaded from the
/// document store's snapshot of ready documents.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub scope: String,
    pub vector: Vec<f32>,
}

/// A search result: chunk identifier plus similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

#[derive(Debug, Default, Clone)]
struct Generation {
    /// Embedding-model version shared by every vector here. `None` only
    /// while the generation is empty.
    model_version: Option<String>,
    entries: Vec<IndexEntry>,
    next_seq: u64,
}

/// Generation-swapped vector index. Cheap to share behind an `Arc`.
pub struct VectorIndex {
    inner: RwLock<Arc<Generation>>,
    stale: AtomicBool,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Generation::default())),
            stale: AtomicBool::new(false),
        }
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.snapshot().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding-model version of the current generation, if any vectors
    /// are indexed.
    pub fn model_version(&self) -> Option<String> {
        self.snapshot().model_version.clone()
    }

    /// Mark the index as out of sync with the store; cleared by `rebuild`.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Arc<Generation> {
        self.inner.read().expect("index lock poisoned").clone()
    }

    /// Add vectors for one or more chunks.
    ///
    /// All vectors must carry the generation's embedding-model version;
    /// a mismatch refuses the whole batch and the caller should rebuild.
    pub fn add_batch(
        &self,
        model_version: &str,
        records: Vec<IndexRecord>,
    ) -> Result<(), IndexInconsistencyError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut guard = self.inner.write().expect("index lock poisoned");
        if let Some(current) = &guard.model_version {
            if current != model_version {
                return Err(IndexInconsistencyError::VersionSkew {
                    index_version: current.clone(),
                    incoming_version: model_version.to_string(),
                });
            }
        }

        let gen = Arc::make_mut(&mut guard);
        gen.model_version = Some(model_version.to_string());
        for r in records {
            let seq = gen.next_seq;
            gen.next_seq += 1;
            gen.entries.push(IndexEntry {
                chunk_id: r.chunk_id,
                document_id: r.document_id,
                scope: r.scope,
                vector: r.vector,
                seq,
            });
        }
        Ok(())
    }

    /// Add a single chunk vector.
    pub fn add(
        &self,
        model_version: &str,
        record: IndexRecord,
    ) -> Result<(), IndexInconsistencyError> {
        self.add_batch(model_version, vec![record])
    }

    /// Remove a single chunk's entry. Returns whether it was present.
    pub fn remove(&self, chunk_id: &str) -> bool {
        let mut guard = self.inner.write().expect("index lock poisoned");
        let gen = Arc::make_mut(&mut guard);
        let before = gen.entries.len();
        gen.entries.retain(|e| e.chunk_id != chunk_id);
        before != gen.entries.len()
    }

    /// Purge every entry belonging to a document. Returns how many were
    /// removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        let mut guard = self.inner.write().expect("index lock poisoned");
        let gen = Arc::make_mut(&mut guard);
        let before = gen.entries.len();
        gen.entries.retain(|e| e.document_id != document_id);
        before - gen.entries.len()
    }

    /// Top-`k` entries by descending cosine similarity to `query`,
    /// restricted to `scope` when given. Ties rank by insertion order.
    ///
    /// Read-only and lock-free after the generation snapshot is taken;
    /// safe for unlimited concurrent callers.
    pub fn search(&self, query: &[f32], k: usize, scope: Option<&str>) -> Vec<SearchHit> {
        let gen = self.snapshot();

        let mut scored: Vec<(&IndexEntry, f32)> = gen
            .entries
            .iter()
            .filter(|e| scope.map_or(true, |s| e.scope == s))
            .map(|e| (e, cosine_similarity(query, &e.vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.seq.cmp(&b.0.seq))
        });
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(e, score)| SearchHit {
                chunk_id: e.chunk_id.clone(),
                document_id: e.document_id.clone(),
                score,
            })
            .collect()
    }

    /// Replace the whole index with a freshly built generation.
    ///
    /// The new generation is fully populated before the swap, so searches
    /// running concurrently keep reading the old one until it lands.
    pub fn rebuild(&self, model_version: &str, records: Vec<IndexRecord>) {
        let mut gen = Generation {
            model_version: (!records.is_empty()).then(|| model_version.to_string()),
            entries: Vec::with_capacity(records.len()),
            next_seq: 0,
        };
        for r in records {
            let seq = gen.next_seq;
            gen.next_seq += 1;
            gen.entries.push(IndexEntry {
                chunk_id: r.chunk_id,
                document_id: r.document_id,
                scope: r.scope,
                vector: r.vector,
                seq,
            });
        }

        let mut guard = self.inner.write().expect("index lock poisoned");
        *guard = Arc::new(gen);
        self.stale.store(false, Ordering::SeqCst);
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunk: &str, doc: &str, scope: &str, vector: Vec<f32>) -> IndexRecord {
        IndexRecord {
            chunk_id: chunk.to_string(),
            document_id: doc.to_string(),
            scope: scope.to_string(),
            vector,
        }
    }

    fn seeded() -> VectorIndex {
        let index = VectorIndex::new();
        index
            .add_batch(
                "m1",
                vec![
                    record("c1", "d1", "math", vec![1.0, 0.0]),
                    record("c2", "d1", "math", vec![0.0, 1.0]),
                    record("c3", "d2", "history", vec![0.7, 0.7]),
                ],
            )
            .unwrap();
        index
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let index = seeded();
        let hits = index.search(&[1.0, 0.0], 3, None);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_search_scope_filter() {
        let index = seeded();
        let hits = index.search(&[1.0, 0.0], 3, Some("history"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c3");
    }

    #[test]
    fn test_tie_break_is_insertion_order() {
        let index = VectorIndex::new();
        index
            .add_batch(
                "m1",
                vec![
                    record("first", "d1", "s", vec![1.0, 0.0]),
                    record("second", "d1", "s", vec![1.0, 0.0]),
                    record("third", "d1", "s", vec![1.0, 0.0]),
                ],
            )
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 3, None);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        // Stable across repeated calls.
        let again = index.search(&[1.0, 0.0], 3, None);
        assert_eq!(hits, again);
    }

    #[test]
    fn test_remove_single_chunk() {
        let index = seeded();
        assert!(index.remove("c2"));
        assert!(!index.remove("c2"));
        let hits = index.search(&[0.0, 1.0], 10, None);
        assert!(hits.iter().all(|h| h.chunk_id != "c2"));
    }

    #[test]
    fn test_remove_document_purges_entries() {
        let index = seeded();
        assert_eq!(index.remove_document("d1"), 2);
        let hits = index.search(&[1.0, 0.0], 10, None);
        assert!(hits.iter().all(|h| h.document_id != "d1"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_version_skew_refused() {
        let index = seeded();
        let err = index
            .add_batch("m2", vec![record("c9", "d9", "s", vec![1.0, 1.0])])
            .unwrap_err();
        assert!(matches!(
            err,
            IndexInconsistencyError::VersionSkew { .. }
        ));
        // The batch was not partially applied.
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_rebuild_swaps_generation() {
        let index = seeded();
        index.mark_stale();
        index.rebuild("m2", vec![record("n1", "d9", "s", vec![1.0, 0.0])]);
        assert!(!index.is_stale());
        assert_eq!(index.model_version().as_deref(), Some("m2"));
        let hits = index.search(&[1.0, 0.0], 10, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "n1");
    }

    #[test]
    fn test_readers_keep_old_generation() {
        let index = Arc::new(seeded());
        let gen_before = index.snapshot();
        index.rebuild("m2", vec![]);
        // The pre-swap snapshot is still fully intact for its holder.
        assert_eq!(gen_before.entries.len(), 3);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_k_truncation() {
        let index = seeded();
        assert_eq!(index.search(&[1.0, 0.0], 2, None).len(), 2);
        assert_eq!(index.search(&[1.0, 0.0], 0, None).len(), 0);
    }
}
