//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, and job records that flow
//! through ingestion, and the ephemeral results produced by retrieval.

use chrono::NaiveDate;
use serde::Serialize;

/// An isolated organizational scope. Every data-access call takes one as a
/// mandatory parameter; it is never an optional filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Detected file type of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Text,
    Pdf,
    Docx,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Text => "text",
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
        }
    }

    pub fn parse(s: &str) -> Option<FileType> {
        match s {
            "text" => Some(FileType::Text),
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            _ => None,
        }
    }
}

/// Ingestion stage, used both as the document status and the job's current
/// stage. Transitions are sequential and one-directional; `Failed` is
/// reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Indexing,
    Ready,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Extracting => "extracting",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
            Stage::Ready => "ready",
            Stage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "pending" => Some(Stage::Pending),
            "extracting" => Some(Stage::Extracting),
            "chunking" => Some(Stage::Chunking),
            "embedding" => Some(Stage::Embedding),
            "indexing" => Some(Stage::Indexing),
            "ready" => Some(Stage::Ready),
            "failed" => Some(Stage::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Ready | Stage::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded file. Created on upload acceptance; mutated only by the
/// ingestion pipeline as it advances through stages. The `version` column is
/// monotonic and claimed optimistically at every stage transition, which
/// serializes concurrent runs for the same document.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub tenant_id: TenantId,
    pub filename: String,
    pub file_type: FileType,
    pub byte_size: i64,
    /// SHA-256 hex of the uploaded bytes, used for duplicate detection.
    pub checksum: String,
    pub blob_key: String,
    pub status: Stage,
    pub version: i64,
    /// Optional declared date (e.g. the date a bulletin covers).
    pub doc_date: Option<NaiveDate>,
    pub created_at: i64,
}

/// One contiguous text window of a document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub tenant_id: TenantId,
    /// Zero-based, contiguous, never reordered. Used for citations.
    pub chunk_index: i64,
    /// Char offsets into the extracted text.
    pub start_offset: i64,
    pub end_offset: i64,
    pub text: String,
    /// None until the embedding stage completes.
    pub embedding: Option<Vec<f32>>,
}

/// Unit-of-work record for one document's pipeline run. One row per attempt;
/// prior attempts are kept for audit and the latest is authoritative.
///
/// On failure `stage` stays at the failing stage so operators can tell
/// "stuck at embedding" from "stuck at extraction"; `last_error` carries the
/// cause and `finished_at` marks the run terminal.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub id: String,
    pub document_id: String,
    pub tenant_id: TenantId,
    pub stage: Stage,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl IngestionJob {
    /// A job is failed when it finished without reaching `ready`.
    pub fn is_failed(&self) -> bool {
        self.finished_at.is_some() && self.stage != Stage::Ready
    }
}

/// One ranked hit from hybrid retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub filename: String,
    pub text: String,
    /// Combined score in `[0.0, 1.0]`.
    pub score: f64,
}

/// Ephemeral, never persisted: the ranked candidate set for one query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievalHit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_str() {
        for stage in [
            Stage::Pending,
            Stage::Extracting,
            Stage::Chunking,
            Stage::Embedding,
            Stage::Indexing,
            Stage::Ready,
            Stage::Failed,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("bogus"), None);
    }

    #[test]
    fn terminal_stages() {
        assert!(Stage::Ready.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Embedding.is_terminal());
    }

    #[test]
    fn file_type_round_trips() {
        for ft in [FileType::Text, FileType::Pdf, FileType::Docx] {
            assert_eq!(FileType::parse(ft.as_str()), Some(ft));
        }
    }
}
