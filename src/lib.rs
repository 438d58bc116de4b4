//! # Context Index
//!
//! A local-first, incremental semantic index over a directory of documents.
//!
//! Documents are chunked, embedded and stored as vectors. A fingerprint
//! tracker remembers what was processed at which revision and content hash,
//! so repeated runs only touch documents that changed. Retrieval embeds the
//! query, over-fetches nearest neighbours, and reranks them with title,
//! quality and recency signals.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌───────────────┐
//! │  Loader  │──▶│ IndexCoordinator│──▶│  VectorIndex  │
//! │ fs + yaml│   │ chunk → embed   │   │ SQLite/memory │
//! └──────────┘   └───────┬────────┘   └──────┬────────┘
//!                        │                   │
//!                        ▼                   ▼
//!              ┌───────────────────┐  ┌─────────────────┐
//!              │ FingerprintTracker│  │ RetrievalEngine │
//!              │ git + content hash│  │ rerank, snippet │
//!              └───────────────────┘  └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cidx ingest                       # index everything that changed
//! cidx search "gradient descent" --mode hybrid
//! cidx verify                       # compare records with stored chunks
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Documents, chunks, records, scalar metadata |
//! | [`chunk`] | Overlapping paragraph-aware chunking |
//! | [`embedding`] | Embedding gateway and providers |
//! | [`store`] | Vector index trait, SQLite and in-memory backends |
//! | [`fingerprint`] | Processing records and change detection |
//! | [`revision`] | Revision source backed by git |
//! | [`loader`] | Document loading, frontmatter, directory scan |
//! | [`ingest`] | Ingestion coordinator |
//! | [`search`] | Retrieval and reranking |
//! | [`stats`] | Statistics and consistency verification |
//! | [`index`] | `ContextIndex` facade |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod revision;
pub mod search;
pub mod stats;
pub mod store;
