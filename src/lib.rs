//! # Lectern
//!
//! A tenant-scoped document ingestion and hybrid retrieval pipeline for
//! retrieval-augmented generation.
//!
//! Lectern turns uploaded files into searchable, attributable knowledge:
//! extraction, chunking, embedding, and indexing run as one resumable unit
//! of work per document, and questions are answered by hybrid (keyword +
//! vector) retrieval assembled into a bounded, citable context block.
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ ┌────────────────────────────────────┐
//!           │        IngestionPipeline           │
//!           │ extract ▶ chunk ▶ embed ▶ index    │
//!           └──┬───────────┬──────────────┬──────┘
//!              ▼           ▼              ▼
//!         ┌─────────┐ ┌──────────┐ ┌───────────┐
//!         │BlobStore│ │ Metadata │ │  Search   │
//!         │  (S3)   │ │ (SQLite) │ │   Index   │
//!         └─────────┘ └──────────┘ └─────┬─────┘
//!                                        │
//! question ─▶ Retriever ─▶ ContextAssembler ─▶ caller's completion call
//! ```
//!
//! Every data-access call is scoped by a mandatory [`models::TenantId`]; no
//! tenant's data is reachable from another tenant's operations.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`extract`] | Multi-format text extraction |
//! | [`chunk`] | Overlapping window chunking |
//! | [`embedding`] | Embedding client, batching, vector utilities |
//! | [`blobstore`] | Original-file storage (S3 and in-memory) |
//! | [`store`] | Tenant-scoped metadata store with optimistic versioning |
//! | [`index`] | Hybrid search index (FTS5 + vectors) |
//! | [`pipeline`] | Ingestion state machine |
//! | [`retrieve`] | Hybrid retrieval and ranking |
//! | [`context`] | Bounded context assembly with citations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod blobstore;
pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod retrieve;
pub mod store;

pub use error::{Error, Result};
pub use models::TenantId;
