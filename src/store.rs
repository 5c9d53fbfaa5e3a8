//! Transactional metadata store for documents, chunks, and ingestion jobs.
//!
//! Every method takes the tenant as a mandatory parameter and enforces it in
//! SQL; a row that exists under a different tenant surfaces
//! [`Error::TenantScopeViolation`] rather than `NotFound`, so cross-tenant
//! probes are distinguishable and always fatal.
//!
//! Concurrent ingestion runs for one document are serialized through the
//! document's monotonic `version` column: every stage transition is an
//! `UPDATE … WHERE version = ?` claim, and a lost claim tells the caller
//! whether the document was deleted or taken over by another run.

use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{Chunk, Document, FileType, IngestionJob, Stage, TenantId};

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Documents ============

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, tenant_id, filename, file_type, byte_size, checksum,
                 blob_key, status, version, doc_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(doc.tenant_id.as_str())
        .bind(&doc.filename)
        .bind(doc.file_type.as_str())
        .bind(doc.byte_size)
        .bind(&doc.checksum)
        .bind(&doc.blob_key)
        .bind(doc.status.as_str())
        .bind(doc.version)
        .bind(doc.doc_date.map(|d| d.to_string()))
        .bind(doc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch a document, enforcing tenant ownership.
    pub async fn document(&self, tenant: &TenantId, id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Err(Error::NotFound(format!("document {}", id))),
            Some(row) => {
                let owner: String = row.get("tenant_id");
                if owner != tenant.as_str() {
                    return Err(Error::TenantScopeViolation(format!(
                        "document {} belongs to another tenant",
                        id
                    )));
                }
                document_from_row(&row)
            }
        }
    }

    /// Find an already-ingested document with the same content, for the
    /// duplicate-upload short circuit.
    pub async fn find_ready_duplicate(
        &self,
        tenant: &TenantId,
        checksum: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT * FROM documents WHERE tenant_id = ? AND checksum = ? AND status = 'ready' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tenant.as_str())
        .bind(checksum)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| document_from_row(&r)).transpose()
    }

    /// Claim the next stage transition. Succeeds only if `expected_version`
    /// still holds; returns the new version.
    pub async fn claim_stage(
        &self,
        tenant: &TenantId,
        id: &str,
        expected_version: i64,
        next: Stage,
    ) -> Result<i64> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, version = version + 1 \
             WHERE id = ? AND tenant_id = ? AND version = ?",
        )
        .bind(next.as_str())
        .bind(id)
        .bind(tenant.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost_claim(tenant, id).await);
        }
        Ok(expected_version + 1)
    }

    /// Set the document's terminal status after a failed run, but only if
    /// this run still owns the version (another run may have taken over).
    pub async fn settle_failed(
        &self,
        tenant: &TenantId,
        id: &str,
        owned_version: i64,
        status: Stage,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ? WHERE id = ? AND tenant_id = ? AND version = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .bind(tenant.as_str())
        .bind(owned_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically replace the document's chunk set and mark it ready, in one
    /// transaction guarded by the version claim. A retrieval reading the
    /// metadata chunks sees the old set or the new set, never a mix.
    pub async fn commit_ready(
        &self,
        tenant: &TenantId,
        id: &str,
        expected_version: i64,
        chunks: &[Chunk],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE documents SET status = 'ready', version = version + 1 \
             WHERE id = ? AND tenant_id = ? AND version = ?",
        )
        .bind(id)
        .bind(tenant.as_str())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            drop(tx);
            return Err(self.lost_claim(tenant, id).await);
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks
                    (id, document_id, tenant_id, chunk_index, start_offset, end_offset, text, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.tenant_id.as_str())
            .bind(chunk.chunk_index)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(&chunk.text)
            .bind(chunk.embedding.as_ref().map(|v| vec_to_blob(v)))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(expected_version + 1)
    }

    /// Delete a document and its chunks and jobs, returning the deleted
    /// record so the caller can clean up the blob and index entries. An
    /// in-flight ingestion run observes the deletion at its next version
    /// claim.
    pub async fn delete_document(&self, tenant: &TenantId, id: &str) -> Result<Document> {
        let doc = self.document(tenant, id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ingestion_jobs WHERE document_id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(doc)
    }

    /// Chunks for a document in sequence order, tenant-enforced.
    pub async fn chunks(&self, tenant: &TenantId, document_id: &str) -> Result<Vec<Chunk>> {
        // Ownership check first so a cross-tenant probe fails loudly.
        self.document(tenant, document_id).await?;

        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ? AND tenant_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    // ============ Ingestion jobs ============

    pub async fn insert_job(&self, job: &IngestionJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs
                (id, document_id, tenant_id, stage, retry_count, last_error, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.document_id)
        .bind(job.tenant_id.as_str())
        .bind(job.stage.as_str())
        .bind(job.retry_count)
        .bind(&job.last_error)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job_stage(&self, job_id: &str, stage: Stage) -> Result<()> {
        sqlx::query("UPDATE ingestion_jobs SET stage = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a job finished successfully.
    pub async fn complete_job(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE ingestion_jobs SET stage = 'ready', last_error = NULL, finished_at = ? \
             WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a job finished with an error. The stage is left at the failing
    /// stage so the failure point stays visible.
    pub async fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE ingestion_jobs SET last_error = ?, finished_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now().timestamp())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn job(&self, tenant: &TenantId, job_id: &str) -> Result<IngestionJob> {
        let row = sqlx::query("SELECT * FROM ingestion_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Err(Error::NotFound(format!("job {}", job_id))),
            Some(row) => {
                let owner: String = row.get("tenant_id");
                if owner != tenant.as_str() {
                    return Err(Error::TenantScopeViolation(format!(
                        "job {} belongs to another tenant",
                        job_id
                    )));
                }
                job_from_row(&row)
            }
        }
    }

    /// The authoritative (most recent) job for a document.
    pub async fn latest_job(&self, tenant: &TenantId, document_id: &str) -> Result<IngestionJob> {
        self.document(tenant, document_id).await?;

        let row = sqlx::query(
            "SELECT * FROM ingestion_jobs WHERE document_id = ? AND tenant_id = ? \
             ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .bind(document_id)
        .bind(tenant.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Err(Error::NotFound(format!("no jobs for document {}", document_id))),
            Some(row) => job_from_row(&row),
        }
    }

    pub async fn job_count(&self, document_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ingestion_jobs WHERE document_id = ?")
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ============ Internals ============

    /// Disambiguate a lost version claim: the document is gone (deleted) or
    /// another run advanced it first.
    async fn lost_claim(&self, tenant: &TenantId, id: &str) -> Error {
        let exists: std::result::Result<Option<i64>, sqlx::Error> =
            sqlx::query_scalar("SELECT version FROM documents WHERE id = ? AND tenant_id = ?")
                .bind(id)
                .bind(tenant.as_str())
                .fetch_optional(&self.pool)
                .await;

        match exists {
            Ok(None) => Error::Cancelled,
            Ok(Some(v)) => Error::Conflict(format!(
                "document {} was claimed by a concurrent run (version {})",
                id, v
            )),
            Err(e) => Error::Store(e),
        }
    }
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let file_type: String = row.get("file_type");
    let status: String = row.get("status");
    let doc_date: Option<String> = row.get("doc_date");

    Ok(Document {
        id: row.get("id"),
        tenant_id: TenantId::new(row.get::<String, _>("tenant_id")),
        filename: row.get("filename"),
        file_type: FileType::parse(&file_type)
            .ok_or_else(|| Error::Internal(format!("bad file_type '{}'", file_type)))?,
        byte_size: row.get("byte_size"),
        checksum: row.get("checksum"),
        blob_key: row.get("blob_key"),
        status: Stage::parse(&status)
            .ok_or_else(|| Error::Internal(format!("bad status '{}'", status)))?,
        version: row.get("version"),
        doc_date: doc_date
            .map(|d| {
                NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .map_err(|e| Error::Internal(format!("bad doc_date '{}': {}", d, e)))
            })
            .transpose()?,
        created_at: row.get("created_at"),
    })
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        tenant_id: TenantId::new(row.get::<String, _>("tenant_id")),
        chunk_index: row.get("chunk_index"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        text: row.get("text"),
        embedding: embedding.map(|b| blob_to_vec(&b)),
    })
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IngestionJob> {
    let stage: String = row.get("stage");
    Ok(IngestionJob {
        id: row.get("id"),
        document_id: row.get("document_id"),
        tenant_id: TenantId::new(row.get::<String, _>("tenant_id")),
        stage: Stage::parse(&stage)
            .ok_or_else(|| Error::Internal(format!("bad stage '{}'", stage)))?,
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}
