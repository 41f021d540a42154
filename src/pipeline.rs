//! Query serving pipeline.
//!
//! Per query: `Received → CacheCheck → (CacheHit → Done) | (CacheMiss →
//! Retrieving → Synthesizing → CacheWrite → Done) | Failed`.
//!
//! `Retrieving` embeds the query, searches the vector index with a fixed
//! top-k and a similarity floor, drops hits whose document is no longer
//! `ready` in the store (read-time stale filter), and deduplicates by
//! document. When nothing clears the floor the pipeline answers with a
//! documented insufficient-context message without calling the completion
//! API. `Synthesizing` calls the completion API under a timeout and an
//! optional cancellation token, retrying once with backoff on transient
//! failure; repeated failure degrades to a temporarily-unavailable answer.
//! `CacheWrite` is best-effort.
//!
//! Exactly one [`ActivityEvent`] is emitted per query regardless of
//! outcome, and no lock is held while the completion call is in flight.
//! All collaborators are explicit handles injected at construction.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::activity::{ActivityEvent, ActivitySink, QueryOutcome};
use crate::cache::{fingerprint, CachedAnswer, FingerprintParams, ResponseCache};
use crate::completion::CompletionClient;
use crate::config::{CompletionConfig, RetrievalConfig};
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::CompletionError;
use crate::index::VectorIndex;
use crate::models::{QueryRequest, QueryResponse};
use crate::store::DocumentStore;

/// Answer returned when the corpus has nothing relevant enough to ground a
/// response; produced without calling the completion API.
pub const INSUFFICIENT_CONTEXT_ANSWER: &str =
    "I don't have enough course material to answer that yet. Try rephrasing the question, \
     or check back after more documents have been added.";

/// Answer returned when the completion API keeps failing.
pub const UNAVAILABLE_ANSWER: &str =
    "The answer service is temporarily unavailable. Please try again in a moment.";

/// Tunables for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub top_k: usize,
    pub min_score: f32,
    pub max_tokens: u32,
    pub temperature: f32,
    pub completion_timeout: Duration,
    pub retry_backoff: Duration,
}

impl PipelineOptions {
    pub fn from_config(retrieval: &RetrievalConfig, completion: &CompletionConfig) -> Self {
        Self {
            top_k: retrieval.top_k,
            min_score: retrieval.min_score,
            max_tokens: completion.max_tokens,
            temperature: completion.temperature,
            completion_timeout: Duration::from_secs(completion.timeout_secs),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.25,
            max_tokens: 512,
            temperature: 0.2,
            completion_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
    insufficient_context: AtomicU64,
    latency_total_ms: AtomicU64,
}

/// Point-in-time view of the serving counters.
#[derive(Debug, Clone, Serialize)]
pub struct ServingMetrics {
    pub queries: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub insufficient_context: u64,
    pub cache_hit_rate: f64,
    pub avg_latency_ms: u64,
}

/// The retrieval-and-response pipeline.
///
/// Shared state is read-mostly (index, store) or internally synchronized
/// (cache, counters), so one instance serves any number of concurrent
/// queries; a slow completion call suspends only its own query.
pub struct RetrievalPipeline {
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    cache: Arc<ResponseCache>,
    embedder: Arc<dyn EmbeddingProvider>,
    completion: Arc<dyn CompletionClient>,
    activity: Arc<dyn ActivitySink>,
    opts: PipelineOptions,
    counters: Counters,
}

impl RetrievalPipeline {
    pub fn new(
        store: Arc<DocumentStore>,
        index: Arc<VectorIndex>,
        cache: Arc<ResponseCache>,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionClient>,
        activity: Arc<dyn ActivitySink>,
        opts: PipelineOptions,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            embedder,
            completion,
            activity,
            opts,
            counters: Counters::default(),
        }
    }

    /// Serve one query end to end.
    pub async fn answer(&self, req: QueryRequest) -> QueryResponse {
        self.answer_with_cancel(req, CancellationToken::new()).await
    }

    /// Serve one query; cancelling the token abandons a slow completion
    /// call and degrades the answer.
    pub async fn answer_with_cancel(
        &self,
        req: QueryRequest,
        cancel: CancellationToken,
    ) -> QueryResponse {
        let started = Instant::now();
        let params = FingerprintParams {
            top_k: self.opts.top_k,
            min_score: self.opts.min_score,
            model_version: self.embedder.model_version().to_string(),
        };
        let key = fingerprint(&req.scope, &req.query, &params);

        let (answer, source_document_ids, cache_hit, outcome) =
            self.run(&req, &key, &cancel).await;

        let latency_ms = started.elapsed().as_millis() as u64;

        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        match outcome {
            QueryOutcome::Answered if cache_hit => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            QueryOutcome::Failed => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
            QueryOutcome::InsufficientContext => {
                self.counters
                    .insufficient_context
                    .fetch_add(1, Ordering::Relaxed);
            }
            QueryOutcome::Answered => {}
        }

        // The single emission point: one event per query, whatever happened.
        self.activity.record(ActivityEvent {
            user_id: req.user_id.clone(),
            fingerprint: key,
            cache_hit,
            outcome,
            latency_ms,
            timestamp: Utc::now().timestamp(),
        });

        QueryResponse {
            answer,
            source_document_ids,
            cache_hit,
            latency_ms,
        }
    }

    async fn run(
        &self,
        req: &QueryRequest,
        key: &str,
        cancel: &CancellationToken,
    ) -> (String, Vec<String>, bool, QueryOutcome) {
        if req.query.trim().is_empty() {
            return (
                INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                Vec::new(),
                false,
                QueryOutcome::InsufficientContext,
            );
        }

        // CacheCheck
        if let Some(hit) = self.cache.get(key).await {
            debug!(fingerprint = key, "cache hit");
            return (
                hit.answer,
                hit.source_document_ids,
                true,
                QueryOutcome::Answered,
            );
        }

        // Retrieving
        let query_vec = match embed_query(self.embedder.as_ref(), &req.query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed: {}", e);
                return (
                    UNAVAILABLE_ANSWER.to_string(),
                    Vec::new(),
                    false,
                    QueryOutcome::Failed,
                );
            }
        };

        let mut hits = self
            .index
            .search(&query_vec, self.opts.top_k, Some(&req.scope));
        hits.retain(|h| h.score >= self.opts.min_score);

        // Read-time stale filter: never serve chunks of documents that were
        // deleted or demoted since the index was last updated.
        let ready = match self.store.ready_document_ids(Some(&req.scope)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("document store unavailable during retrieval: {}", e);
                return (
                    UNAVAILABLE_ANSWER.to_string(),
                    Vec::new(),
                    false,
                    QueryOutcome::Failed,
                );
            }
        };
        hits.retain(|h| ready.contains(&h.document_id));

        // Deduplicate by document, keeping the best-scoring chunk of each;
        // hits are already in descending score order.
        let mut seen_docs = HashSet::new();
        hits.retain(|h| seen_docs.insert(h.document_id.clone()));

        if hits.is_empty() {
            return (
                INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                Vec::new(),
                false,
                QueryOutcome::InsufficientContext,
            );
        }

        let chunk_ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let chunks = match self.store.chunks_by_ids(&chunk_ids).await {
            Ok(c) => c,
            Err(e) => {
                warn!("chunk fetch failed: {}", e);
                return (
                    UNAVAILABLE_ANSWER.to_string(),
                    Vec::new(),
                    false,
                    QueryOutcome::Failed,
                );
            }
        };

        // Index entries pointing at chunks the store no longer has mean the
        // index has drifted; flag it for rebuild and serve from what's left.
        let mut contexts: Vec<(String, String, String)> = Vec::new(); // (chunk, doc, text)
        for hit in &hits {
            match chunks.get(&hit.chunk_id) {
                Some(chunk) => contexts.push((
                    hit.chunk_id.clone(),
                    hit.document_id.clone(),
                    chunk.text.clone(),
                )),
                None => {
                    let drift = crate::error::IndexInconsistencyError::MissingChunk {
                        chunk_id: hit.chunk_id.clone(),
                    };
                    warn!("{}; scheduling rebuild", drift);
                    self.index.mark_stale();
                    if let Err(e) = self.store.mark_index_stale(true).await {
                        warn!("failed to persist index staleness: {}", e);
                    }
                }
            }
        }

        if contexts.is_empty() {
            return (
                INSUFFICIENT_CONTEXT_ANSWER.to_string(),
                Vec::new(),
                false,
                QueryOutcome::InsufficientContext,
            );
        }

        let doc_ids: Vec<String> = contexts.iter().map(|(_, d, _)| d.clone()).collect();
        let titles = self.store.document_titles(&doc_ids).await.unwrap_or_default();
        let blocks: Vec<(String, String)> = contexts
            .iter()
            .map(|(_, doc_id, text)| {
                (
                    titles.get(doc_id).cloned().unwrap_or_default(),
                    text.clone(),
                )
            })
            .collect();
        let prompt = build_prompt(&req.query, &blocks);

        // Synthesizing
        let answer = match self.synthesize(&prompt, cancel).await {
            Ok(a) => a,
            Err(e) => {
                warn!("completion failed after retry: {}", e);
                return (
                    UNAVAILABLE_ANSWER.to_string(),
                    Vec::new(),
                    false,
                    QueryOutcome::Failed,
                );
            }
        };

        // CacheWrite (best-effort; failures are logged inside)
        let source_chunk_ids: Vec<String> = contexts.iter().map(|(c, _, _)| c.clone()).collect();
        self.cache
            .put(
                key,
                CachedAnswer {
                    answer: answer.clone(),
                    scope: req.scope.clone(),
                    source_chunk_ids,
                    source_document_ids: doc_ids.clone(),
                    created_at: Utc::now().timestamp(),
                },
            )
            .await;

        (answer, doc_ids, false, QueryOutcome::Answered)
    }

    /// One completion attempt plus a single retry with backoff for
    /// transient failures.
    async fn synthesize(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CompletionError> {
        match self.complete_once(prompt, cancel).await {
            Ok(answer) => Ok(answer),
            Err(e) if e.is_retryable() => {
                debug!("completion attempt failed ({}), retrying once", e);
                tokio::time::sleep(self.opts.retry_backoff).await;
                self.complete_once(prompt, cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_once(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, CompletionError> {
        let call = self
            .completion
            .complete(prompt, self.opts.max_tokens, self.opts.temperature);
        tokio::select! {
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
            res = tokio::time::timeout(self.opts.completion_timeout, call) => match res {
                Ok(inner) => inner,
                Err(_) => Err(CompletionError::Timeout),
            },
        }
    }

    pub fn metrics(&self) -> ServingMetrics {
        let queries = self.counters.queries.load(Ordering::Relaxed);
        let cache_hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let latency_total = self.counters.latency_total_ms.load(Ordering::Relaxed);
        ServingMetrics {
            queries,
            cache_hits,
            failures: self.counters.failures.load(Ordering::Relaxed),
            insufficient_context: self.counters.insufficient_context.load(Ordering::Relaxed),
            cache_hit_rate: if queries > 0 {
                cache_hits as f64 / queries as f64
            } else {
                0.0
            },
            avg_latency_ms: if queries > 0 { latency_total / queries } else { 0 },
        }
    }
}

/// Assemble the completion prompt from retrieved material, best match
/// first.
fn build_prompt(question: &str, blocks: &[(String, String)]) -> String {
    let mut prompt = String::from(
        "You are an educational assistant. Answer the student's question using only \
         the course material below. If the material does not cover the question, say so.\n\n",
    );
    for (i, (title, text)) in blocks.iter().enumerate() {
        if title.is_empty() {
            prompt.push_str(&format!("Material {}:\n{}\n\n", i + 1, text));
        } else {
            prompt.push_str(&format!("Material {} ({}):\n{}\n\n", i + 1, title, text));
        }
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", question));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_orders_material() {
        let blocks = vec![
            ("Cells".to_string(), "Mitochondria make energy.".to_string()),
            (String::new(), "Plants use sunlight.".to_string()),
        ];
        let prompt = build_prompt("what makes energy?", &blocks);

        let first = prompt.find("Mitochondria").unwrap();
        let second = prompt.find("Plants").unwrap();
        assert!(first < second);
        assert!(prompt.contains("Material 1 (Cells):"));
        assert!(prompt.contains("Material 2:\n"));
        assert!(prompt.ends_with("Question: what makes energy?\nAnswer:"));
    }
}
