//! End-to-end scenarios over a real SQLite store with deterministic
//! in-process fakes for the embedder and completion client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use aero::activity::{MemorySink, QueryOutcome};
use aero::cache::{CacheTier, CachedAnswer, MemoryCacheTier, ResponseCache};
use aero::completion::CompletionClient;
use aero::config::ChunkingConfig;
use aero::embedding::{embed_query, EmbeddingProvider};
use aero::error::{CacheUnavailableError, CompletionError, EmbeddingError};
use aero::index::VectorIndex;
use aero::ingest::{IngestRequest, Ingestor};
use aero::models::{IngestStatus, QueryRequest, Role, SourceType};
use aero::pipeline::{
    PipelineOptions, RetrievalPipeline, INSUFFICIENT_CONTEXT_ANSWER, UNAVAILABLE_ANSWER,
};
use aero::store::DocumentStore;
use aero::{db, migrate};

// ============ Deterministic fakes ============

const DIMS: usize = 256;

/// Bag-of-words hashing embedder: same text always maps to the same
/// normalized vector, and shared vocabulary means higher cosine similarity.
/// Short words are dropped so stopwords don't relate unrelated texts.
struct HashEmbedder;

fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
    {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in word.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_version(&self) -> &str {
        "test-embedder-v1"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

/// Completion client that returns a fixed answer and counts calls.
struct CountingCompletion {
    calls: AtomicUsize,
}

impl CountingCompletion {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for CountingCompletion {
    fn model_name(&self) -> &str {
        "test-completion"
    }
    async fn complete(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("The mitochondria produces the cell's energy.".to_string())
    }
}

/// Completion client that always fails with a retryable error.
struct FailingCompletion {
    calls: AtomicUsize,
}

impl FailingCompletion {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for FailingCompletion {
    fn model_name(&self) -> &str {
        "failing-completion"
    }
    async fn complete(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CompletionError::Unavailable {
            status: 503,
            message: "backend down".to_string(),
        })
    }
}

/// Durable tier that is always unreachable.
struct UnreachableTier;

#[async_trait]
impl CacheTier for UnreachableTier {
    async fn get(
        &self,
        _key: &str,
    ) -> Result<Option<(CachedAnswer, Duration)>, CacheUnavailableError> {
        Err(CacheUnavailableError("connection refused".to_string()))
    }
    async fn set(
        &self,
        _key: &str,
        _value: &CachedAnswer,
        _ttl: Duration,
        _tags: &[String],
    ) -> Result<(), CacheUnavailableError> {
        Err(CacheUnavailableError("connection refused".to_string()))
    }
    async fn delete(&self, _key: &str) -> Result<(), CacheUnavailableError> {
        Err(CacheUnavailableError("connection refused".to_string()))
    }
    async fn delete_by_tag(&self, _tag: &str) -> Result<u64, CacheUnavailableError> {
        Err(CacheUnavailableError("connection refused".to_string()))
    }
}

// ============ Harness ============

struct TestApp {
    _tmp: TempDir,
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    ingestor: Arc<Ingestor>,
    pipeline: Arc<RetrievalPipeline>,
    sink: Arc<MemorySink>,
}

async fn setup_with(
    completion: Arc<dyn CompletionClient>,
    durable: Arc<dyn CacheTier>,
) -> TestApp {
    let tmp = TempDir::new().unwrap();
    let db_path: PathBuf = tmp.path().join("aero.sqlite");
    let pool = db::connect(&db_path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let store = Arc::new(DocumentStore::new(pool));
    let index = Arc::new(VectorIndex::new());
    let cache = Arc::new(ResponseCache::new(
        std::num::NonZeroUsize::new(64).unwrap(),
        Duration::from_secs(300),
        durable,
    ));
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedder);
    let sink = Arc::new(MemorySink::new());

    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        index.clone(),
        cache.clone(),
        embedder.clone(),
        ChunkingConfig {
            max_chars: 120,
            overlap: 0.0,
        },
        16,
    ));

    let pipeline = Arc::new(RetrievalPipeline::new(
        store.clone(),
        index.clone(),
        cache,
        embedder,
        completion,
        sink.clone(),
        PipelineOptions {
            top_k: 5,
            min_score: 0.25,
            max_tokens: 256,
            temperature: 0.0,
            completion_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(10),
        },
    ));

    TestApp {
        _tmp: tmp,
        store,
        index,
        ingestor,
        pipeline,
        sink,
    }
}

async fn setup(completion: Arc<dyn CompletionClient>) -> TestApp {
    setup_with(completion, Arc::new(MemoryCacheTier::new())).await
}

/// Three sentences, each under the 120-char window, adjacent pairs over it:
/// chunks split one sentence apiece.
const CELL_DOC: &str = "Photosynthesis converts sunlight into chemical energy inside chloroplasts. \
The mitochondria is the powerhouse of the cell and produces adenosine triphosphate. \
Cell membranes regulate which molecules enter and leave the cytoplasm.";

fn cell_doc_request() -> IngestRequest {
    IngestRequest {
        document_id: None,
        title: "Cell Biology Notes".to_string(),
        source_type: SourceType::Pdf,
        scope: "biology-101".to_string(),
        text: CELL_DOC.to_string(),
    }
}

fn question(scope: &str, query: &str) -> QueryRequest {
    QueryRequest {
        user_id: "student-7".to_string(),
        role: Role::Student,
        scope: scope.to_string(),
        query: query.to_string(),
    }
}

// ============ Scenarios ============

#[tokio::test]
async fn ingest_then_query_hits_the_right_chunk_and_caches() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;

    let report = app.ingestor.ingest(cell_doc_request()).await.unwrap();
    assert_eq!(report.status, IngestStatus::Ready);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.embedded, 3);

    // Top-1 for a phrase verbatim in the second chunk is the second chunk.
    let query = "the mitochondria is the powerhouse of the cell";
    let query_vec = embed_query(&HashEmbedder, query).await.unwrap();
    let hits = app.index.search(&query_vec, 3, Some("biology-101"));
    assert!(!hits.is_empty());
    let chunk_ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
    let chunks = app.store.chunks_by_ids(&chunk_ids).await.unwrap();
    let top = chunks.get(&hits[0].chunk_id).unwrap();
    assert!(top.text.contains("mitochondria"));
    assert_eq!(top.seq, 1);

    // First query: miss, synthesized, one completion call.
    let first = app.pipeline.answer(question("biology-101", query)).await;
    assert!(!first.cache_hit);
    assert_eq!(first.source_document_ids, vec![report.document_id.clone()]);
    assert_eq!(completion.calls(), 1);

    // Identical query within TTL: hit, identical answer and sources, no
    // further completion call.
    let second = app.pipeline.answer(question("biology-101", query)).await;
    assert!(second.cache_hit);
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.source_document_ids, first.source_document_ids);
    assert_eq!(completion.calls(), 1);

    // Exactly one activity event per query.
    let events = app.sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].outcome, QueryOutcome::Answered);
    assert!(!events[0].cache_hit);
    assert!(events[1].cache_hit);
    assert_eq!(events[0].fingerprint, events[1].fingerprint);
}

#[tokio::test]
async fn empty_corpus_short_circuits_without_completion_call() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;

    let response = app
        .pipeline
        .answer(question("biology-101", "what is a mitochondria?"))
        .await;

    assert_eq!(response.answer, INSUFFICIENT_CONTEXT_ANSWER);
    assert!(response.source_document_ids.is_empty());
    assert!(!response.cache_hit);
    assert_eq!(completion.calls(), 0);

    let events = app.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, QueryOutcome::InsufficientContext);
}

#[tokio::test]
async fn scope_partitions_the_knowledge_base() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;
    app.ingestor.ingest(cell_doc_request()).await.unwrap();

    let response = app
        .pipeline
        .answer(question("history-201", "the mitochondria is the powerhouse of the cell"))
        .await;

    assert_eq!(response.answer, INSUFFICIENT_CONTEXT_ANSWER);
    assert_eq!(completion.calls(), 0);
}

#[tokio::test]
async fn deleted_document_never_surfaces_again() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;

    let report = app.ingestor.ingest(cell_doc_request()).await.unwrap();
    let query = "the mitochondria is the powerhouse of the cell";

    // Warm the cache.
    let warm = app.pipeline.answer(question("biology-101", query)).await;
    assert_eq!(warm.source_document_ids, vec![report.document_id.clone()]);

    assert!(app.ingestor.delete(&report.document_id).await.unwrap());

    // Index entries are purged eagerly.
    let query_vec = embed_query(&HashEmbedder, query).await.unwrap();
    assert!(app.index.search(&query_vec, 5, None).is_empty());

    // Dependent cache entries are invalidated, so the answer flips rather
    // than serving the stale sources.
    let after = app.pipeline.answer(question("biology-101", query)).await;
    assert!(!after.cache_hit);
    assert_eq!(after.answer, INSUFFICIENT_CONTEXT_ANSWER);
    assert!(after.source_document_ids.is_empty());
}

#[tokio::test]
async fn demoted_document_is_filtered_at_read_time() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;
    let report = app.ingestor.ingest(cell_doc_request()).await.unwrap();

    // Document drops out of `ready` (re-ingestion in flight) while its
    // entries are still sitting in the index.
    app.store
        .set_status(&report.document_id, IngestStatus::Chunking, None)
        .await
        .unwrap();
    assert_ne!(app.index.len(), 0);

    let response = app
        .pipeline
        .answer(question("biology-101", "the mitochondria is the powerhouse of the cell"))
        .await;
    assert_eq!(response.answer, INSUFFICIENT_CONTEXT_ANSWER);
    assert_eq!(completion.calls(), 0);
}

#[tokio::test]
async fn reingestion_invalidates_dependent_cache_entries() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;

    let report = app.ingestor.ingest(cell_doc_request()).await.unwrap();
    let query = "the mitochondria is the powerhouse of the cell";

    let first = app.pipeline.answer(question("biology-101", query)).await;
    assert!(!first.cache_hit);
    assert_eq!(completion.calls(), 1);

    // Replace the document with unrelated content.
    app.ingestor
        .ingest(IngestRequest {
            document_id: Some(report.document_id.clone()),
            title: "Cell Biology Notes".to_string(),
            source_type: SourceType::Pdf,
            scope: "biology-101".to_string(),
            text: "Sunflowers track the sun across the sky during the day.".to_string(),
        })
        .await
        .unwrap();

    // The cached answer was built on chunks that no longer exist; it must
    // not be served, and the new corpus has nothing relevant.
    let after = app.pipeline.answer(question("biology-101", query)).await;
    assert!(!after.cache_hit);
    assert_eq!(after.answer, INSUFFICIENT_CONTEXT_ANSWER);
}

#[tokio::test]
async fn durable_tier_outage_degrades_but_queries_succeed() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup_with(completion.clone(), Arc::new(UnreachableTier)).await;

    app.ingestor.ingest(cell_doc_request()).await.unwrap();
    let query = "the mitochondria is the powerhouse of the cell";

    let first = app.pipeline.answer(question("biology-101", query)).await;
    assert!(!first.cache_hit);
    assert_ne!(first.answer, UNAVAILABLE_ANSWER);
    assert_eq!(completion.calls(), 1);

    // The local tier still carries the entry despite the durable outage.
    let second = app.pipeline.answer(question("biology-101", query)).await;
    assert!(second.cache_hit);
    assert_eq!(completion.calls(), 1);
}

#[tokio::test]
async fn completion_failure_retries_once_then_degrades() {
    let completion = Arc::new(FailingCompletion::new());
    let app = setup(completion.clone()).await;

    app.ingestor.ingest(cell_doc_request()).await.unwrap();

    let response = app
        .pipeline
        .answer(question("biology-101", "the mitochondria is the powerhouse of the cell"))
        .await;

    assert_eq!(response.answer, UNAVAILABLE_ANSWER);
    assert!(response.source_document_ids.is_empty());
    assert_eq!(completion.calls(), 2);

    // The failure is recorded, and the degraded answer was not cached.
    let events = app.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, QueryOutcome::Failed);

    let again = app
        .pipeline
        .answer(question("biology-101", "the mitochondria is the powerhouse of the cell"))
        .await;
    assert!(!again.cache_hit);
    assert_eq!(completion.calls(), 4);
}

#[tokio::test]
async fn empty_text_marks_document_failed_and_excluded() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;

    let result = app
        .ingestor
        .ingest(IngestRequest {
            document_id: None,
            title: "Blank Scan".to_string(),
            source_type: SourceType::Pdf,
            scope: "biology-101".to_string(),
            text: "   \n".to_string(),
        })
        .await;
    assert!(result.is_err());

    let docs = app.store.list_documents(Some("biology-101")).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status, IngestStatus::Failed);
    assert!(docs[0].error.is_some());

    assert!(app
        .store
        .ready_document_ids(Some("biology-101"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rebuild_reconstructs_index_from_store() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;

    app.ingestor.ingest(cell_doc_request()).await.unwrap();
    let before = app.index.len();
    assert_eq!(before, 3);

    // Wipe the in-memory index (as a fresh process would see it) and
    // rebuild from the store snapshot.
    app.index.rebuild("test-embedder-v1", Vec::new());
    assert_eq!(app.index.len(), 0);
    app.ingestor.load_index().await.unwrap();
    assert_eq!(app.index.len(), before);

    let response = app
        .pipeline
        .answer(question("biology-101", "the mitochondria is the powerhouse of the cell"))
        .await;
    assert_ne!(response.answer, INSUFFICIENT_CONTEXT_ANSWER);
}

#[tokio::test]
async fn concurrent_queries_share_one_pipeline() {
    let completion = Arc::new(CountingCompletion::new());
    let app = setup(completion.clone()).await;
    app.ingestor.ingest(cell_doc_request()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let pipeline = app.pipeline.clone();
        let query = if i % 2 == 0 {
            "the mitochondria is the powerhouse of the cell"
        } else {
            "how do membranes regulate molecules"
        };
        handles.push(tokio::spawn(async move {
            pipeline.answer(question("biology-101", query)).await
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_ne!(response.answer, UNAVAILABLE_ANSWER);
    }

    // One event per query, no more, no fewer.
    assert_eq!(app.sink.events().len(), 8);
    let metrics = app.pipeline.metrics();
    assert_eq!(metrics.queries, 8);
}
