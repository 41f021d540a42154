//! Durable document store over SQLite.
//!
//! Source of truth for documents, chunks, and their embedding vectors; the
//! vector index is (re)built from here. Exposes the ingestion-status state
//! machine, transactional chunk replacement, atomic cascade deletion, and
//! the index-staleness flag used when an index update cannot be confirmed.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::index::IndexRecord;
use crate::models::{Chunk, Document, IngestStatus, SourceType};

const META_INDEX_STALE: &str = "index_stale";

/// Aggregate counts for one source type, for the stats report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceTypeStats {
    pub source_type: String,
    pub documents: i64,
    pub chunks: i64,
    pub text_bytes: i64,
}

pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a document in `pending` state and return it.
    pub async fn create_document(
        &self,
        title: &str,
        source_type: SourceType,
        scope: &str,
        text_len: i64,
    ) -> Result<Document> {
        let now = Utc::now().timestamp();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            source_type,
            scope: scope.to_string(),
            text_len,
            status: IngestStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO documents (id, title, source_type, scope, text_len, status, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(doc.source_type.as_str())
        .bind(&doc.scope)
        .bind(doc.text_len)
        .bind(doc.status.as_str())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(doc)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, title, source_type, scope, text_len, status, error, created_at, updated_at \
             FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_document).transpose()
    }

    /// Documents, optionally restricted to a scope, newest first.
    pub async fn list_documents(&self, scope: Option<&str>) -> Result<Vec<Document>> {
        let rows = match scope {
            Some(s) => {
                sqlx::query(
                    "SELECT id, title, source_type, scope, text_len, status, error, created_at, updated_at \
                     FROM documents WHERE scope = ? ORDER BY created_at DESC, id",
                )
                .bind(s)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, title, source_type, scope, text_len, status, error, created_at, updated_at \
                     FROM documents ORDER BY created_at DESC, id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_document).collect()
    }

    /// Advance a document's ingestion status, validating the transition.
    pub async fn set_status(
        &self,
        id: &str,
        next: IngestStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let current = match current.as_deref().and_then(IngestStatus::parse) {
            Some(s) => s,
            None => bail!("document not found: {}", id),
        };

        if !current.can_transition(next) {
            bail!(
                "invalid ingestion status transition for {}: {} -> {}",
                id,
                current.as_str(),
                next.as_str()
            );
        }

        sqlx::query("UPDATE documents SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(error)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Update the stored raw-text length (set on re-ingestion).
    pub async fn set_text_len(&self, id: &str, text_len: i64) -> Result<()> {
        sqlx::query("UPDATE documents SET text_len = ?, updated_at = ? WHERE id = ?")
            .bind(text_len)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace all chunks for a document in one transaction. Existing
    /// vectors for the document are dropped with the old chunks.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query("INSERT INTO chunks (id, document_id, seq, text, hash) VALUES (?, ?, ?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(chunk.seq)
                .bind(&chunk.text)
                .bind(&chunk.hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Store embedding vectors for a document's chunks, tagged with the
    /// embedding-model version, in one transaction.
    pub async fn upsert_vectors(
        &self,
        document_id: &str,
        vectors: &[(String, Vec<f32>)],
        model: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (chunk_id, vector) in vectors {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, embedding, model, dims)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    embedding = excluded.embedding,
                    model = excluded.model,
                    dims = excluded.dims
                "#,
            )
            .bind(chunk_id)
            .bind(document_id)
            .bind(vec_to_blob(vector))
            .bind(model)
            .bind(vector.len() as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a document together with its chunks and vectors, atomically.
    /// Returns false when the document does not exist.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Identifiers of `ready` documents, optionally restricted to a scope.
    /// Used as the read-time stale-hit filter during retrieval.
    pub async fn ready_document_ids(&self, scope: Option<&str>) -> Result<HashSet<String>> {
        let rows: Vec<String> = match scope {
            Some(s) => {
                sqlx::query_scalar("SELECT id FROM documents WHERE status = 'ready' AND scope = ?")
                    .bind(s)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM documents WHERE status = 'ready'")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().collect())
    }

    /// Fetch chunks by identifier, keyed for lookup.
    pub async fn chunks_by_ids(&self, ids: &[String]) -> Result<HashMap<String, Chunk>> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(
                "SELECT id, document_id, seq, text, hash FROM chunks WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                out.insert(
                    id.clone(),
                    Chunk {
                        id: row.get("id"),
                        document_id: row.get("document_id"),
                        seq: row.get("seq"),
                        text: row.get("text"),
                        hash: row.get("hash"),
                    },
                );
            }
        }
        Ok(out)
    }

    /// Titles for a set of documents, for prompt assembly.
    pub async fn document_titles(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            let title: Option<String> =
                sqlx::query_scalar("SELECT title FROM documents WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(title) = title {
                out.insert(id.clone(), title);
            }
        }
        Ok(out)
    }

    /// Vectors of all `ready` documents for the given embedding-model
    /// version, in deterministic insertion order, for index rebuilds.
    ///
    /// Vectors stored under other model versions are skipped; they become
    /// searchable again once their documents are re-ingested.
    pub async fn load_index_snapshot(&self, model: &str) -> Result<Vec<IndexRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding, d.scope
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            JOIN documents d ON d.id = cv.document_id
            WHERE d.status = 'ready' AND cv.model = ?
            ORDER BY d.created_at, d.id, c.seq
            "#,
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                IndexRecord {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    scope: row.get("scope"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    /// Distinct embedding-model versions present among stored vectors.
    pub async fn vector_model_versions(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT model FROM chunk_vectors ORDER BY model")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Flag the vector index as out of sync with the store, so a rebuild
    /// is scheduled instead of serving from a drifted index.
    pub async fn mark_index_stale(&self, stale: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(META_INDEX_STALE)
        .bind(if stale { "1" } else { "0" })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn index_stale(&self) -> Result<bool> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(META_INDEX_STALE)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.as_deref() == Some("1"))
    }

    // ============ Stats queries ============

    pub async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_embedded_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Per-source-type breakdown of documents, chunks, and text volume.
    pub async fn source_type_stats(&self) -> Result<Vec<SourceTypeStats>> {
        let rows = sqlx::query(
            r#"
            SELECT
                d.source_type,
                COUNT(*) AS documents,
                COALESCE(SUM(cc.n), 0) AS chunks,
                COALESCE(SUM(d.text_len), 0) AS text_bytes
            FROM documents d
            LEFT JOIN (
                SELECT document_id, COUNT(*) AS n FROM chunks GROUP BY document_id
            ) cc ON cc.document_id = d.id
            GROUP BY d.source_type
            ORDER BY documents DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceTypeStats {
                source_type: row.get("source_type"),
                documents: row.get("documents"),
                chunks: row.get("chunks"),
                text_bytes: row.get("text_bytes"),
            })
            .collect())
    }
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        source_type: SourceType::parse(&source_type)
            .ok_or_else(|| anyhow::anyhow!("unknown source type: {}", source_type))?,
        scope: row.get("scope"),
        text_len: row.get("text_len"),
        status: IngestStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown ingestion status: {}", status))?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
