//! End-to-end pipeline tests over a temporary SQLite database, an in-memory
//! blob store, and a deterministic stand-in for the embedding service.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use lectern::blobstore::MemoryBlobStore;
use lectern::config::{ChunkingConfig, LimitsConfig};
use lectern::context::{assemble, AssembledContext};
use lectern::embedding::{Embedder, EmbeddingClient};
use lectern::error::{Error, Result};
use lectern::index::{SearchIndex, SqliteIndex};
use lectern::models::{Stage, TenantId};
use lectern::pipeline::{IngestionPipeline, UploadRequest};
use lectern::retrieve::{RetrievalParams, Retriever};
use lectern::store::MetadataStore;

const DIMS: usize = 32;

/// Deterministic embedder: hashed bag-of-words, L2-normalized. Chunks that
/// share vocabulary with a query land close in cosine space, which is all
/// these tests need from the real service.
struct HashEmbedder;

fn hash_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in token.bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_vector(t)).collect())
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

/// Always fails, as an embedding service outage would after retries.
struct FailingEmbedder;

#[async_trait]
impl EmbeddingClient for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::EmbeddingUnavailable("service down".to_string()))
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

struct Harness {
    _tmp: TempDir,
    store: MetadataStore,
    index: Arc<SqliteIndex>,
    blobs: Arc<MemoryBlobStore>,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = lectern::db::connect(&tmp.path().join("lectern.sqlite"))
            .await
            .unwrap();
        lectern::migrate::run_migrations(&pool).await.unwrap();

        Self {
            _tmp: tmp,
            store: MetadataStore::new(pool.clone()),
            index: Arc::new(SqliteIndex::new(pool)),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    fn pipeline(&self, client: Arc<dyn EmbeddingClient>) -> IngestionPipeline {
        IngestionPipeline::new(
            self.store.clone(),
            self.blobs.clone(),
            self.index.clone(),
            Embedder::new(client, 8),
            ChunkingConfig {
                window_chars: 200,
                overlap_chars: 50,
            },
            LimitsConfig::default(),
        )
    }

    fn retriever(&self, client: Arc<dyn EmbeddingClient>) -> Retriever {
        Retriever::new(
            self.index.clone() as Arc<dyn SearchIndex>,
            Embedder::new(client, 8),
            RetrievalParams::default(),
        )
    }
}

fn text_upload(filename: &str, body: &str) -> UploadRequest {
    UploadRequest {
        filename: filename.to_string(),
        declared_type: Some("text/plain".to_string()),
        bytes: body.as_bytes().to_vec(),
        doc_date: None,
    }
}

fn three_paragraph_body() -> String {
    let paragraph = |topic: &str| format!("This paragraph discusses {}. ", topic).repeat(4);
    format!(
        "{}\n\n{}\n\n{}",
        paragraph("liturgy"),
        paragraph("stewardship"),
        paragraph("music")
    )
}

#[tokio::test]
async fn three_paragraph_upload_reaches_ready() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();

    assert_eq!(outcome.status, Stage::Ready);
    assert!(outcome.error.is_none());
    assert!(
        (2..=3).contains(&outcome.chunk_count),
        "expected 2-3 chunks, got {}",
        outcome.chunk_count
    );

    let doc = pipeline.document(&tenant, &outcome.document_id).await.unwrap();
    assert_eq!(doc.status, Stage::Ready);

    let chunks = harness
        .store
        .chunks(&tenant, &outcome.document_id)
        .await
        .unwrap();
    assert_eq!(chunks.len(), outcome.chunk_count);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        assert!(chunk.embedding.is_some());
        assert!(chunk.text.chars().count() <= 200);
    }

    let job = pipeline
        .latest_job(&tenant, &outcome.document_id)
        .await
        .unwrap();
    assert_eq!(job.stage, Stage::Ready);
    assert!(job.finished_at.is_some());
    assert!(!job.is_failed());
}

#[tokio::test]
async fn query_ranks_matching_paragraph_first_with_citation() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();

    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&tenant, "stewardship", 3).await.unwrap();
    assert!(!result.hits.is_empty());
    assert!(result.hits[0].text.contains("stewardship"));

    // The best hit is the chunk where the topic is densest.
    let chunks = harness
        .store
        .chunks(&tenant, &outcome.document_id)
        .await
        .unwrap();
    let expected = chunks
        .iter()
        .max_by_key(|c| c.text.matches("stewardship").count())
        .unwrap();
    assert_eq!(result.hits[0].chunk_index, expected.chunk_index);

    // Assembly cites the winning chunk.
    match assemble(&result, 2000) {
        AssembledContext::Grounded(block) => {
            assert_eq!(block.citations[0].chunk_index, expected.chunk_index);
            assert_eq!(block.citations[0].filename, "bulletin.txt");
            assert_eq!(block.citations[0].document_id, outcome.document_id);
        }
        AssembledContext::NoRelevantContext => panic!("expected grounded context"),
    }
}

#[tokio::test]
async fn corrupted_pdf_fails_at_extracting_and_stays_invisible() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(
            &tenant,
            UploadRequest {
                filename: "damaged.pdf".to_string(),
                declared_type: Some("application/pdf".to_string()),
                bytes: b"%PDF-1.4 this is not actually a pdf body".to_vec(),
                doc_date: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, Stage::Failed);
    let error = outcome.error.expect("failure must carry its cause");
    assert!(error.contains("extraction failed"), "got: {}", error);

    let doc = pipeline.document(&tenant, &outcome.document_id).await.unwrap();
    assert_eq!(doc.status, Stage::Failed);

    let job = pipeline
        .latest_job(&tenant, &outcome.document_id)
        .await
        .unwrap();
    assert_eq!(job.stage, Stage::Extracting);
    assert!(job.is_failed());
    assert!(job.last_error.unwrap().contains("extraction failed"));

    // Nothing from the failed document is searchable.
    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&tenant, "pdf body", 5).await.unwrap();
    assert!(result.hits.is_empty());
}

#[tokio::test]
async fn unsupported_format_is_rejected_before_any_record() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let err = pipeline
        .ingest(
            &tenant,
            UploadRequest {
                filename: "archive.bin".to_string(),
                declared_type: Some("application/zip".to_string()),
                bytes: b"\x00\x01\x02".to_vec(),
                doc_date: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
    assert!(harness.blobs.is_empty());
}

#[tokio::test]
async fn oversized_upload_is_rejected_fast() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = IngestionPipeline::new(
        harness.store.clone(),
        harness.blobs.clone(),
        harness.index.clone(),
        Embedder::new(Arc::new(HashEmbedder), 8),
        ChunkingConfig::default(),
        LimitsConfig {
            max_upload_bytes: 16,
        },
    );

    let err = pipeline
        .ingest(&tenant, text_upload("big.txt", "this body is larger than sixteen bytes"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { .. }));
    assert!(harness.blobs.is_empty());
}

#[tokio::test]
async fn duplicate_upload_reuses_existing_document() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));
    let body = three_paragraph_body();

    let first = pipeline
        .ingest(&tenant, text_upload("bulletin.txt", &body))
        .await
        .unwrap();
    let second = pipeline
        .ingest(&tenant, text_upload("bulletin-copy.txt", &body))
        .await
        .unwrap();

    assert!(second.deduplicated);
    assert_eq!(second.document_id, first.document_id);
    assert!(second.job_id.is_none());
    assert_eq!(second.chunk_count, first.chunk_count);
    assert_eq!(harness.blobs.len(), 1, "duplicate bytes stored once");

    // Only one document's worth of chunks is indexed: no duplicate hits.
    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&tenant, "stewardship", 10).await.unwrap();
    assert!(!result.hits.is_empty());
    for hit in &result.hits {
        assert_eq!(hit.document_id, first.document_id);
    }
    let mut indices: Vec<i64> = result.hits.iter().map(|h| h.chunk_index).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), result.hits.len(), "no chunk appears twice");
}

#[tokio::test]
async fn reingestion_reproduces_the_same_chunk_set() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();
    let before: Vec<(i64, String)> = harness
        .store
        .chunks(&tenant, &outcome.document_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.chunk_index, c.text))
        .collect();

    let again = pipeline.reingest(&tenant, &outcome.document_id).await.unwrap();
    assert_eq!(again.status, Stage::Ready);

    let after: Vec<(i64, String)> = harness
        .store
        .chunks(&tenant, &outcome.document_id)
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.chunk_index, c.text))
        .collect();
    assert_eq!(before, after, "identical input must produce identical chunks");

    let job = pipeline
        .latest_job(&tenant, &outcome.document_id)
        .await
        .unwrap();
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn failed_reingestion_keeps_serving_the_old_chunk_set() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let good = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = good
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();

    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let before = retriever.retrieve(&tenant, "stewardship", 5).await.unwrap();
    assert!(!before.hits.is_empty());

    // The embedding service goes down; a refresh attempt fails mid-pipeline.
    let broken = harness.pipeline(Arc::new(FailingEmbedder));
    let retry = broken.reingest(&tenant, &outcome.document_id).await.unwrap();
    assert_eq!(retry.status, Stage::Ready, "document stays ready");
    assert!(retry.error.is_some());

    let job = broken
        .latest_job(&tenant, &outcome.document_id)
        .await
        .unwrap();
    assert_eq!(job.stage, Stage::Embedding);
    assert!(job.is_failed());

    // Retrieval still sees the old chunks, unchanged.
    let after = retriever.retrieve(&tenant, "stewardship", 5).await.unwrap();
    let ids = |result: &lectern::models::RetrievalResult| {
        let mut v: Vec<String> = result.hits.iter().map(|h| h.chunk_id.clone()).collect();
        v.sort();
        v
    };
    assert_eq!(ids(&before), ids(&after));
}

#[tokio::test]
async fn first_ingestion_failure_leaves_document_failed() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let broken = harness.pipeline(Arc::new(FailingEmbedder));

    let outcome = broken
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();
    assert_eq!(outcome.status, Stage::Failed);

    let doc = broken.document(&tenant, &outcome.document_id).await.unwrap();
    assert_eq!(doc.status, Stage::Failed);
}

#[tokio::test]
async fn whitespace_only_document_fails_at_extracting() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(&tenant, text_upload("blank.txt", "   \n\n  \t  "))
        .await
        .unwrap();
    assert_eq!(outcome.status, Stage::Failed);

    let job = pipeline
        .latest_job(&tenant, &outcome.document_id)
        .await
        .unwrap();
    assert_eq!(job.stage, Stage::Extracting);
}

#[tokio::test]
async fn tenants_never_see_each_others_documents() {
    let harness = Harness::new().await;
    let t1 = TenantId::new("t1");
    let t2 = TenantId::new("t2");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    // Identical content in both tenants: the strongest confusion case.
    let body = "The eucharist schedule changes in advent.\n\nWeekday mass moves to the chapel.";
    let doc1 = pipeline.ingest(&t1, text_upload("a.txt", body)).await.unwrap();
    let doc2 = pipeline.ingest(&t2, text_upload("b.txt", body)).await.unwrap();
    assert_ne!(doc1.document_id, doc2.document_id);

    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&t1, "eucharist advent", 10).await.unwrap();
    assert!(!result.hits.is_empty());
    for hit in &result.hits {
        assert_eq!(hit.document_id, doc1.document_id);
    }

    // Cross-tenant lookups fail loudly, not with NotFound.
    let err = pipeline.document(&t1, &doc2.document_id).await.unwrap_err();
    assert!(matches!(err, Error::TenantScopeViolation(_)));
    let err = harness
        .store
        .chunks(&t1, &doc2.document_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TenantScopeViolation(_)));
}

#[tokio::test]
async fn delete_document_removes_all_traces() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();
    assert_eq!(harness.blobs.len(), 1);

    pipeline
        .delete_document(&tenant, &outcome.document_id)
        .await
        .unwrap();

    let err = pipeline.document(&tenant, &outcome.document_id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(harness.blobs.is_empty());

    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&tenant, "stewardship", 5).await.unwrap();
    assert!(result.hits.is_empty());
}

#[tokio::test]
async fn empty_query_returns_empty_result() {
    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));
    pipeline
        .ingest(&tenant, text_upload("bulletin.txt", &three_paragraph_body()))
        .await
        .unwrap();

    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&tenant, "   ", 5).await.unwrap();
    assert!(result.hits.is_empty());
}

#[tokio::test]
async fn docx_upload_round_trips_through_the_pipeline() {
    // Minimal but valid OOXML: a ZIP with word/document.xml containing
    // two paragraphs of text runs.
    let document_xml = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>The finance council meets on Tuesday evenings.</w:t></w:r></w:p>
    <w:p><w:r><w:t>Budget requests are due before the first meeting.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    let mut buf = Vec::new();
    {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        writer
            .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(document_xml.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    let harness = Harness::new().await;
    let tenant = TenantId::new("t1");
    let pipeline = harness.pipeline(Arc::new(HashEmbedder));

    let outcome = pipeline
        .ingest(
            &tenant,
            UploadRequest {
                filename: "minutes.docx".to_string(),
                declared_type: None,
                bytes: buf,
                doc_date: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, Stage::Ready);

    let retriever = harness.retriever(Arc::new(HashEmbedder));
    let result = retriever.retrieve(&tenant, "finance council", 3).await.unwrap();
    assert!(!result.hits.is_empty());
    assert!(result.hits[0].text.contains("finance council"));
}
