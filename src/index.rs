//! Hybrid (lexical + vector) search index abstraction.
//!
//! The [`SearchIndex`] trait is the boundary to the external search service.
//! Its contract carries the two guarantees the pipeline depends on:
//!
//! - [`replace_document`](SearchIndex::replace_document) swaps a document's
//!   entire entry set atomically: a concurrent query sees all old entries or
//!   all new ones, never a mix.
//! - every query takes the tenant and filters inside the index, so an
//!   unscoped scan is not expressible through this interface.
//!
//! [`SqliteIndex`] is the bundled implementation: FTS5 for the lexical
//! channel and brute-force cosine similarity over stored vectors for the
//! vector channel, with the swap done in a single transaction.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::TenantId;

/// One chunk as written to the index. Document fields are denormalized so
/// queries never reach back into the metadata store.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub filename: String,
    pub ingested_at: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// One candidate returned by a lexical or vector query.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub filename: String,
    pub ingested_at: i64,
    pub text: String,
    /// Raw channel score: BM25 rank negated for lexical, cosine similarity
    /// for vector. Comparable only within one channel.
    pub raw_score: f64,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Atomically replace all entries for a document. An empty `entries`
    /// slice removes the document from the index.
    async fn replace_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
        entries: &[IndexEntry],
    ) -> Result<()>;

    /// Remove all entries for a document.
    async fn delete_document(&self, tenant: &TenantId, document_id: &str) -> Result<()>;

    /// Lexical (keyword) search over chunk text, tenant-filtered.
    async fn keyword_search(
        &self,
        tenant: &TenantId,
        query: &str,
        k: i64,
    ) -> Result<Vec<IndexHit>>;

    /// Vector nearest-neighbor search, tenant-filtered.
    async fn vector_search(
        &self,
        tenant: &TenantId,
        query_vec: &[f32],
        k: i64,
    ) -> Result<Vec<IndexHit>>;
}

// ============ SQLite implementation ============

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn replace_document(
        &self,
        tenant: &TenantId,
        document_id: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::IndexWriteFailed(e.to_string()))?;

        sqlx::query("DELETE FROM search_fts WHERE document_id = ? AND tenant_id = ?")
            .bind(document_id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::IndexWriteFailed(e.to_string()))?;
        sqlx::query("DELETE FROM search_entries WHERE document_id = ? AND tenant_id = ?")
            .bind(document_id)
            .bind(tenant.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::IndexWriteFailed(e.to_string()))?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO search_entries
                    (chunk_id, document_id, tenant_id, chunk_index, filename, ingested_at, text, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(tenant.as_str())
            .bind(entry.chunk_index)
            .bind(&entry.filename)
            .bind(entry.ingested_at)
            .bind(&entry.text)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::IndexWriteFailed(e.to_string()))?;

            sqlx::query(
                "INSERT INTO search_fts (chunk_id, document_id, tenant_id, text) VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(tenant.as_str())
            .bind(&entry.text)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::IndexWriteFailed(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::IndexWriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn delete_document(&self, tenant: &TenantId, document_id: &str) -> Result<()> {
        self.replace_document(tenant, document_id, &[]).await
    }

    async fn keyword_search(
        &self,
        tenant: &TenantId,
        query: &str,
        k: i64,
    ) -> Result<Vec<IndexHit>> {
        let match_expr = match fts_match_expr(query) {
            Some(expr) => expr,
            None => return Ok(Vec::new()),
        };

        let rows = sqlx::query(
            r#"
            SELECT e.chunk_id, e.document_id, e.chunk_index, e.filename,
                   e.ingested_at, e.text, search_fts.rank AS rank
            FROM search_fts
            JOIN search_entries e ON e.chunk_id = search_fts.chunk_id
            WHERE search_fts MATCH ? AND search_fts.tenant_id = ?
            ORDER BY search_fts.rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(tenant.as_str())
        .bind(k)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::IndexUnavailable(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                IndexHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    filename: row.get("filename"),
                    ingested_at: row.get("ingested_at"),
                    text: row.get("text"),
                    raw_score: -rank, // negate so higher = better
                }
            })
            .collect())
    }

    async fn vector_search(
        &self,
        tenant: &TenantId,
        query_vec: &[f32],
        k: i64,
    ) -> Result<Vec<IndexHit>> {
        let rows = sqlx::query(
            "SELECT chunk_id, document_id, chunk_index, filename, ingested_at, text, embedding \
             FROM search_entries WHERE tenant_id = ?",
        )
        .bind(tenant.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::IndexUnavailable(e.to_string()))?;

        let mut hits: Vec<IndexHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                IndexHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    chunk_index: row.get("chunk_index"),
                    filename: row.get("filename"),
                    ingested_at: row.get("ingested_at"),
                    text: row.get("text"),
                    raw_score: cosine_similarity(query_vec, &vec) as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k as usize);
        Ok(hits)
    }
}

/// Turn free-form query text into an FTS5 MATCH expression: terms stripped
/// to alphanumerics, quoted, and OR-joined. Quoting keeps user input from
/// being parsed as FTS syntax; OR keeps a multi-word question from
/// requiring every word in one chunk.
fn fts_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}
