//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, roles, and query payloads
//! that flow through ingestion and retrieval.

use serde::{Deserialize, Serialize};

/// Where a document's raw text came from before extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Video,
    Youtube,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Video => "video",
            SourceType::Youtube => "youtube",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(SourceType::Pdf),
            "video" => Some(SourceType::Video),
            "youtube" => Some(SourceType::Youtube),
            _ => None,
        }
    }
}

/// Ingestion lifecycle state of a document.
///
/// Valid transitions form a forward chain with two re-entry points:
/// `Pending → Chunking → Embedding → Ready`, any state → `Failed`, and
/// `Ready`/`Failed` → `Chunking` when a document is re-ingested. Documents
/// that are not `Ready` are excluded from retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Chunking,
    Embedding,
    Ready,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Chunking => "chunking",
            IngestStatus::Embedding => "embedding",
            IngestStatus::Ready => "ready",
            IngestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IngestStatus::Pending),
            "chunking" => Some(IngestStatus::Chunking),
            "embedding" => Some(IngestStatus::Embedding),
            "ready" => Some(IngestStatus::Ready),
            "failed" => Some(IngestStatus::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition(&self, next: IngestStatus) -> bool {
        use IngestStatus::*;
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Chunking)
                | (Chunking, Embedding)
                | (Embedding, Ready)
                | (Ready, Chunking)
                | (Failed, Chunking)
        )
    }
}

/// A document in the knowledge base.
///
/// The raw body text is consumed at ingestion time (chunked, embedded,
/// stored per chunk); only its length is kept on the document row.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source_type: SourceType,
    /// Knowledge-base partition this document belongs to (e.g. a class tag).
    pub scope: String,
    pub text_len: i64,
    pub status: IngestStatus,
    /// Failure detail when `status == Failed`; operational, never user-facing.
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A bounded text span derived from a document; the unit of retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position within the document. Insertion order is significant and is
    /// the deterministic tie-break for equal-score search results.
    pub seq: i64,
    pub text: String,
    /// SHA-256 of the text, for staleness detection.
    pub hash: String,
}

/// User role, modeled as an enumerated capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    /// Only admins may upload or delete knowledge-base documents.
    pub fn can_manage_documents(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            _ => None,
        }
    }
}

/// A question submitted through the query boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub user_id: String,
    pub role: Role,
    /// Scope restricting which documents may be retrieved from.
    pub scope: String,
    pub query: String,
}

/// The answer returned through the query boundary.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub source_document_ids: Vec<String>,
    pub cache_hit: bool,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_chain() {
        assert!(IngestStatus::Pending.can_transition(IngestStatus::Chunking));
        assert!(IngestStatus::Chunking.can_transition(IngestStatus::Embedding));
        assert!(IngestStatus::Embedding.can_transition(IngestStatus::Ready));
    }

    #[test]
    fn test_any_state_may_fail() {
        for s in [
            IngestStatus::Pending,
            IngestStatus::Chunking,
            IngestStatus::Embedding,
            IngestStatus::Ready,
            IngestStatus::Failed,
        ] {
            assert!(s.can_transition(IngestStatus::Failed));
        }
    }

    #[test]
    fn test_reingest_reentry() {
        assert!(IngestStatus::Ready.can_transition(IngestStatus::Chunking));
        assert!(IngestStatus::Failed.can_transition(IngestStatus::Chunking));
    }

    #[test]
    fn test_no_skipping_states() {
        assert!(!IngestStatus::Pending.can_transition(IngestStatus::Ready));
        assert!(!IngestStatus::Pending.can_transition(IngestStatus::Embedding));
        assert!(!IngestStatus::Chunking.can_transition(IngestStatus::Ready));
        assert!(!IngestStatus::Ready.can_transition(IngestStatus::Pending));
    }

    #[test]
    fn test_status_roundtrip() {
        for s in ["pending", "chunking", "embedding", "ready", "failed"] {
            assert_eq!(IngestStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(IngestStatus::parse("bogus").is_none());
    }

    #[test]
    fn test_role_capabilities() {
        assert!(Role::Admin.can_manage_documents());
        assert!(!Role::Teacher.can_manage_documents());
        assert!(!Role::Student.can_manage_documents());
        assert!(!Role::Parent.can_manage_documents());
    }

    #[test]
    fn test_source_type_roundtrip() {
        for s in ["pdf", "video", "youtube"] {
            assert_eq!(SourceType::parse(s).unwrap().as_str(), s);
        }
    }
}
