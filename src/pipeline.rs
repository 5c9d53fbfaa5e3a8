//! Ingestion pipeline orchestration.
//!
//! Drives one document through extract → chunk → embed → index as a single
//! unit of work tracked by an [`IngestionJob`]. Stages execute strictly in
//! sequence; every transition is an optimistic version claim against the
//! metadata store, which serializes concurrent runs for the same document
//! and lets a run observe mid-flight deletion.
//!
//! The index swap is the last step and is atomic per document, so retrieval
//! sees either the previous chunk set or the complete new one. A
//! re-ingestion that fails at any stage leaves the document `ready` with its
//! old chunks still served; a first ingestion that fails leaves it `failed`
//! and invisible to retrieval.

use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, LimitsConfig};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::extract;
use crate::index::{IndexEntry, SearchIndex};
use crate::models::{Chunk, Document, FileType, IngestionJob, Stage, TenantId};
use crate::store::MetadataStore;

/// An accepted upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    /// Content type declared by the uploader, if any.
    pub declared_type: Option<String>,
    pub bytes: Vec<u8>,
    /// Optional declared date for the document (e.g. a bulletin's Sunday).
    pub doc_date: Option<NaiveDate>,
}

/// Result of running (or short-circuiting) an ingestion.
///
/// Returned once a job record exists, whether the run reached `ready` or
/// `failed`; the job carries the failing stage and cause. Rejections that
/// happen before any record is created (oversize, unsupported format, blob
/// or store failure) surface as `Err` instead.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub document_id: String,
    /// Absent when the upload deduplicated against an existing document.
    pub job_id: Option<String>,
    pub status: Stage,
    pub chunk_count: usize,
    pub deduplicated: bool,
    pub error: Option<String>,
}

pub struct IngestionPipeline {
    store: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn SearchIndex>,
    embedder: Embedder,
    chunking: ChunkingConfig,
    limits: LimitsConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: MetadataStore,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn SearchIndex>,
        embedder: Embedder,
        chunking: ChunkingConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            index,
            embedder,
            chunking,
            limits,
        }
    }

    /// Accept an upload and run it through the pipeline.
    pub async fn ingest(&self, tenant: &TenantId, upload: UploadRequest) -> Result<IngestOutcome> {
        if upload.bytes.len() as u64 > self.limits.max_upload_bytes {
            return Err(Error::FileTooLarge {
                size: upload.bytes.len() as u64,
                limit: self.limits.max_upload_bytes,
            });
        }

        let file_type = extract::detect_file_type(
            upload.declared_type.as_deref(),
            &upload.filename,
            &upload.bytes,
        )?;

        let checksum = hex_sha256(&upload.bytes);

        // Same tenant, same bytes, already ready: reuse the existing chunk
        // and embedding set instead of recomputing it.
        if let Some(existing) = self.store.find_ready_duplicate(tenant, &checksum).await? {
            tracing::info!(
                tenant = %tenant,
                document = %existing.id,
                filename = %upload.filename,
                "duplicate upload, reusing existing document"
            );
            let chunk_count = self.store.chunks(tenant, &existing.id).await?.len();
            return Ok(IngestOutcome {
                document_id: existing.id,
                job_id: None,
                status: Stage::Ready,
                chunk_count,
                deduplicated: true,
                error: None,
            });
        }

        let content_type = upload
            .declared_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let blob_key = self
            .blobs
            .put(tenant, &upload.filename, &upload.bytes, &content_type)
            .await?;

        let now = Utc::now().timestamp();
        let mut doc = Document {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant.clone(),
            filename: upload.filename.clone(),
            file_type,
            byte_size: upload.bytes.len() as i64,
            checksum,
            blob_key,
            status: Stage::Pending,
            version: 0,
            doc_date: upload.doc_date,
            created_at: now,
        };
        self.store.insert_document(&doc).await?;

        let job_id = self.start_job(tenant, &doc.id, 0).await?;
        self.drive(tenant, &mut doc, &job_id, &upload.bytes, false)
            .await
    }

    /// Re-run the pipeline for an existing document from its stored blob.
    /// This is the resubmission path for failed jobs and the refresh path
    /// after configuration changes.
    pub async fn reingest(&self, tenant: &TenantId, document_id: &str) -> Result<IngestOutcome> {
        let mut doc = self.store.document(tenant, document_id).await?;
        let bytes = self.blobs.get(&doc.blob_key).await?;

        let attempt = self.store.job_count(&doc.id).await?;
        let job_id = self.start_job(tenant, &doc.id, attempt).await?;

        let was_ready = doc.status == Stage::Ready;
        self.drive(tenant, &mut doc, &job_id, &bytes, was_ready)
            .await
    }

    /// Remove a document from all three stores. Any in-flight ingestion run
    /// stops at its next version claim and cleans up after itself.
    pub async fn delete_document(&self, tenant: &TenantId, document_id: &str) -> Result<()> {
        let doc = self.store.delete_document(tenant, document_id).await?;
        self.index.delete_document(tenant, document_id).await?;
        self.blobs.delete(&doc.blob_key).await?;
        tracing::info!(tenant = %tenant, document = %document_id, "document deleted");
        Ok(())
    }

    /// Look up a document, tenant-enforced.
    pub async fn document(&self, tenant: &TenantId, document_id: &str) -> Result<Document> {
        self.store.document(tenant, document_id).await
    }

    /// Look up an ingestion job, tenant-enforced.
    pub async fn job(&self, tenant: &TenantId, job_id: &str) -> Result<IngestionJob> {
        self.store.job(tenant, job_id).await
    }

    /// The authoritative job for a document (the most recent attempt).
    pub async fn latest_job(&self, tenant: &TenantId, document_id: &str) -> Result<IngestionJob> {
        self.store.latest_job(tenant, document_id).await
    }

    // ============ Stage machinery ============

    async fn start_job(&self, tenant: &TenantId, document_id: &str, attempt: i64) -> Result<String> {
        let job = IngestionJob {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            tenant_id: tenant.clone(),
            stage: Stage::Pending,
            retry_count: attempt,
            last_error: None,
            started_at: Utc::now().timestamp(),
            finished_at: None,
        };
        self.store.insert_job(&job).await?;
        Ok(job.id)
    }

    /// Run the stages and settle the document and job on failure.
    async fn drive(
        &self,
        tenant: &TenantId,
        doc: &mut Document,
        job_id: &str,
        bytes: &[u8],
        was_ready: bool,
    ) -> Result<IngestOutcome> {
        match self.run_stages(tenant, doc, job_id, bytes).await {
            Ok(chunk_count) => {
                tracing::info!(
                    tenant = %tenant,
                    document = %doc.id,
                    chunks = chunk_count,
                    "ingestion complete"
                );
                Ok(IngestOutcome {
                    document_id: doc.id.clone(),
                    job_id: Some(job_id.to_string()),
                    status: Stage::Ready,
                    chunk_count,
                    deduplicated: false,
                    error: None,
                })
            }
            Err(Error::Cancelled) => {
                // Document rows are gone; the job went with them.
                tracing::info!(tenant = %tenant, document = %doc.id, "ingestion cancelled");
                Err(Error::Cancelled)
            }
            Err(err @ Error::Conflict(_)) => {
                // Another run owns the document now; record this attempt's
                // end without touching the document.
                let _ = self.store.fail_job(job_id, &err.to_string()).await;
                Err(err)
            }
            Err(err) => {
                tracing::error!(
                    tenant = %tenant,
                    document = %doc.id,
                    stage = %doc.status,
                    error = %err,
                    "ingestion failed"
                );
                if let Err(e) = self.store.fail_job(job_id, &err.to_string()).await {
                    tracing::error!(job = %job_id, error = %e, "failed to record job error");
                }
                // A document that served queries before this attempt keeps
                // serving its old chunk set.
                let settle = if was_ready { Stage::Ready } else { Stage::Failed };
                if let Err(e) = self
                    .store
                    .settle_failed(tenant, &doc.id, doc.version, settle)
                    .await
                {
                    tracing::error!(document = %doc.id, error = %e, "failed to settle document status");
                }
                Ok(IngestOutcome {
                    document_id: doc.id.clone(),
                    job_id: Some(job_id.to_string()),
                    status: settle,
                    chunk_count: 0,
                    deduplicated: false,
                    error: Some(err.to_string()),
                })
            }
        }
    }

    async fn run_stages(
        &self,
        tenant: &TenantId,
        doc: &mut Document,
        job_id: &str,
        bytes: &[u8],
    ) -> Result<usize> {
        self.transition(tenant, doc, job_id, Stage::Extracting).await?;
        let text = extract_blocking(bytes.to_vec(), doc.file_type).await?;
        if text.trim().is_empty() {
            return Err(Error::ExtractionFailed(
                "document contains no extractable text".to_string(),
            ));
        }

        self.transition(tenant, doc, job_id, Stage::Chunking).await?;
        let spans = chunk_text(&text, self.chunking.window_chars, self.chunking.overlap_chars);
        if spans.is_empty() {
            return Err(Error::ExtractionFailed(
                "document produced no chunks".to_string(),
            ));
        }

        self.transition(tenant, doc, job_id, Stage::Embedding).await?;
        let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
        let vectors = self.embedder.embed_all(&texts).await?;

        let ingested_at = Utc::now().timestamp();
        let chunks: Vec<Chunk> = spans
            .into_iter()
            .zip(vectors)
            .map(|(span, vector)| Chunk {
                id: Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                tenant_id: tenant.clone(),
                chunk_index: span.index,
                start_offset: span.start as i64,
                end_offset: span.end as i64,
                text: span.text,
                embedding: Some(vector),
            })
            .collect();

        self.transition(tenant, doc, job_id, Stage::Indexing).await?;
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .map(|c| IndexEntry {
                chunk_id: c.id.clone(),
                document_id: c.document_id.clone(),
                chunk_index: c.chunk_index,
                filename: doc.filename.clone(),
                ingested_at,
                text: c.text.clone(),
                vector: c.embedding.clone().unwrap_or_default(),
            })
            .collect();
        self.index.replace_document(tenant, &doc.id, &entries).await?;

        match self
            .store
            .commit_ready(tenant, &doc.id, doc.version, &chunks)
            .await
        {
            Ok(version) => {
                doc.version = version;
                doc.status = Stage::Ready;
            }
            Err(Error::Cancelled) => {
                // The swap already went visible for a document that no
                // longer exists; take it back out before reporting.
                if let Err(e) = self.index.delete_document(tenant, &doc.id).await {
                    tracing::error!(document = %doc.id, error = %e, "failed to clear index after cancellation");
                }
                return Err(Error::Cancelled);
            }
            Err(e) => return Err(e),
        }

        self.store.complete_job(job_id).await?;
        Ok(chunks.len())
    }

    async fn transition(
        &self,
        tenant: &TenantId,
        doc: &mut Document,
        job_id: &str,
        next: Stage,
    ) -> Result<()> {
        doc.version = self
            .store
            .claim_stage(tenant, &doc.id, doc.version, next)
            .await?;
        doc.status = next;
        self.store.update_job_stage(job_id, next).await?;
        tracing::debug!(document = %doc.id, stage = %next, "stage transition");
        Ok(())
    }
}

/// Extraction is CPU-bound library work; keep it off the async runtime.
/// A panic inside a format parser counts as a damaged file, not a crash.
async fn extract_blocking(bytes: Vec<u8>, file_type: FileType) -> Result<String> {
    match tokio::task::spawn_blocking(move || extract::extract_text(&bytes, file_type)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::ExtractionFailed(
            "format parser panicked on malformed input".to_string(),
        )),
        Err(e) => Err(Error::Internal(format!("extraction task failed: {}", e))),
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
