//! Ingestion orchestration.
//!
//! Drives a document through the ingestion state machine: `pending →
//! chunking → embedding → ready`, any state → `failed` on unrecoverable
//! error. Runs independently of query serving — it communicates only
//! through store status transitions and index updates, and holds no lock a
//! query path waits on.
//!
//! After a document becomes `ready` its vectors are added to the index; an
//! embedding-model version skew there triggers a full rebuild from the
//! store snapshot. Cache entries built on the document's previous content
//! are invalidated whenever it is replaced or deleted.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingProvider;
use crate::index::{IndexRecord, VectorIndex};
use crate::models::{IngestStatus, SourceType};
use crate::store::DocumentStore;

/// One document handed over by the extraction stage.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Present when re-ingesting an existing document.
    pub document_id: Option<String>,
    pub title: String,
    pub source_type: SourceType,
    pub scope: String,
    /// Extracted raw text (PDF text, transcript, captions).
    pub text: String,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub status: IngestStatus,
    pub chunks: usize,
    pub embedded: usize,
}

pub struct Ingestor {
    store: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    cache: Arc<ResponseCache>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        store: Arc<DocumentStore>,
        index: Arc<VectorIndex>,
        cache: Arc<ResponseCache>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: ChunkingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            index,
            cache,
            embedder,
            chunking,
            batch_size: batch_size.max(1),
        }
    }

    /// Ingest (or re-ingest) one document end to end.
    ///
    /// On failure the document is left in `failed` state with the detail
    /// recorded on the row; it is excluded from retrieval until
    /// re-ingested.
    pub async fn ingest(&self, req: IngestRequest) -> Result<IngestReport> {
        let doc_id = self.resolve_document(&req).await?;

        // Chunking
        let chunks = match chunk_document(
            &doc_id,
            &req.text,
            self.chunking.max_chars,
            self.chunking.overlap,
        ) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail(&doc_id, &e.to_string()).await;
                return Err(e).context("chunking failed");
            }
        };

        if let Err(e) = self.store.replace_chunks(&doc_id, &chunks).await {
            self.fail(&doc_id, &e.to_string()).await;
            return Err(e);
        }
        self.store
            .set_status(&doc_id, IngestStatus::Embedding, None)
            .await?;

        // Embedding, batched; the provider retries transient failures
        // internally with bounded backoff before giving up.
        let mut vectors: Vec<(String, Vec<f32>)> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match self.embedder.embed(&texts).await {
                Ok(batch_vectors) => {
                    for (chunk, vector) in batch.iter().zip(batch_vectors) {
                        vectors.push((chunk.id.clone(), vector));
                    }
                }
                Err(e) => {
                    self.fail(&doc_id, &e.to_string()).await;
                    // Old cached answers reference chunks that no longer exist.
                    self.cache.invalidate_document(&doc_id).await;
                    return Err(e).context("embedding failed");
                }
            }
        }

        let model = self.embedder.model_version().to_string();
        if let Err(e) = self.store.upsert_vectors(&doc_id, &vectors, &model).await {
            self.fail(&doc_id, &e.to_string()).await;
            return Err(e);
        }

        self.store
            .set_status(&doc_id, IngestStatus::Ready, None)
            .await?;

        // Index update: purge the previous generation of this document's
        // entries, then add the fresh ones.
        self.index.remove_document(&doc_id);
        let records: Vec<IndexRecord> = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, (_, vector))| IndexRecord {
                chunk_id: chunk.id.clone(),
                document_id: doc_id.clone(),
                scope: req.scope.clone(),
                vector: vector.clone(),
            })
            .collect();

        if let Err(skew) = self.index.add_batch(&model, records) {
            warn!("{}; rebuilding index", skew);
            if let Err(e) = self.rebuild_index().await {
                // Leave the flag set so the next rebuild attempt picks it up.
                warn!("index rebuild failed: {}", e);
                self.index.mark_stale();
                self.store.mark_index_stale(true).await.ok();
            }
        }

        // Answers synthesized from the previous content are now stale.
        self.cache.invalidate_document(&doc_id).await;

        info!(
            document_id = %doc_id,
            chunks = chunks.len(),
            "document ingested"
        );

        Ok(IngestReport {
            document_id: doc_id,
            status: IngestStatus::Ready,
            chunks: chunks.len(),
            embedded: vectors.len(),
        })
    }

    /// Delete a document: store row and chunks go atomically, then the
    /// index entries are purged and dependent cache entries invalidated.
    /// Returns false when the document does not exist.
    pub async fn delete(&self, document_id: &str) -> Result<bool> {
        if !self.store.delete_document(document_id).await? {
            return Ok(false);
        }

        self.index.remove_document(document_id);
        self.cache.invalidate_document(document_id).await;

        info!(document_id = %document_id, "document deleted");
        Ok(true)
    }

    /// Rebuild the index from the store snapshot of `ready` documents.
    ///
    /// Builds a complete new generation before swapping it in, so searches
    /// keep running against the old one meanwhile. This is the recovery
    /// path for version skew, drift, and process start.
    pub async fn rebuild_index(&self) -> Result<()> {
        let model = self.embedder.model_version().to_string();

        let other_versions: Vec<String> = self
            .store
            .vector_model_versions()
            .await?
            .into_iter()
            .filter(|v| *v != model)
            .collect();
        if !other_versions.is_empty() {
            warn!(
                "vectors from other embedding model versions present ({}); their documents \
                 need re-ingestion to become searchable",
                other_versions.join(", ")
            );
        }

        let snapshot = self.store.load_index_snapshot(&model).await?;
        let count = snapshot.len();
        self.index.rebuild(&model, snapshot);
        self.store.mark_index_stale(false).await?;

        info!(vectors = count, "index rebuilt");
        Ok(())
    }

    /// Startup path: rebuild the in-memory index from the store.
    pub async fn load_index(&self) -> Result<()> {
        self.rebuild_index().await
    }

    async fn resolve_document(&self, req: &IngestRequest) -> Result<String> {
        if let Some(id) = &req.document_id {
            match self.store.get_document(id).await? {
                Some(doc) => {
                    if !doc.status.can_transition(IngestStatus::Chunking) {
                        bail!(
                            "document {} is mid-ingestion ({}) and cannot be re-ingested yet",
                            id,
                            doc.status.as_str()
                        );
                    }
                    self.store
                        .set_status(id, IngestStatus::Chunking, None)
                        .await?;
                    self.store.set_text_len(id, req.text.len() as i64).await?;
                    return Ok(id.clone());
                }
                None => bail!("document not found: {}", id),
            }
        }

        let doc = self
            .store
            .create_document(
                &req.title,
                req.source_type,
                &req.scope,
                req.text.len() as i64,
            )
            .await?;
        self.store
            .set_status(&doc.id, IngestStatus::Chunking, None)
            .await?;
        Ok(doc.id)
    }

    async fn fail(&self, document_id: &str, detail: &str) {
        if let Err(e) = self
            .store
            .set_status(document_id, IngestStatus::Failed, Some(detail))
            .await
        {
            warn!(
                "could not mark document {} as failed: {}",
                document_id, e
            );
        }
    }
}
