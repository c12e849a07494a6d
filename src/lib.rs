// VecShelf — lib.rs
// Public API, error types, configuration, re-exports.
// Author: d65v <https://github.com/d65v>

pub mod backend;
pub mod embedding;
pub mod ingest;
pub mod local;
pub mod npy;
pub mod partition;
pub mod pipeline;
pub mod processing;
pub mod provision;
pub mod schema;
pub mod search;
pub mod session;
pub mod source;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::backend::{LoadState, VectorBackend};
pub use crate::embedding::Metric;
pub use crate::ingest::{BulkIngestor, IncrementalIngestor, IngestReport};
pub use crate::local::LocalBackend;
pub use crate::partition::{DatasetPartitioner, PartitionPlan, Partitions};
pub use crate::provision::CollectionProvisioner;
pub use crate::schema::{CollectionSchema, IndexKind, IndexSpec, SchemaManager, SchemaSpec};
pub use crate::search::{Hit, SimilaritySearcher};
pub use crate::session::Session;
pub use crate::source::RecordSource;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a single row made an insert batch fail. `position` is the offset of the
/// offending row inside the batch handed to the ingestor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestFault {
    #[error("duplicate id {id} at position {position}")]
    DuplicateId { id: i64, position: usize },

    #[error("negative id {id} at position {position}")]
    NegativeId { id: i64, position: usize },

    #[error("dimension mismatch for id {id} at position {position}: expected {expected}, got {got}")]
    DimensionMismatch {
        id: i64,
        position: usize,
        expected: usize,
        got: usize,
    },

    #[error("label for id {id} at position {position} is {len} bytes, limit is {max}")]
    LabelTooLong {
        id: i64,
        position: usize,
        len: usize,
        max: usize,
    },

    #[error("row at position {position} does not match the schema: {reason}")]
    Malformed { position: usize, reason: String },

    #[error("backend reported {got} inserted rows, expected {expected}")]
    CountMismatch { expected: usize, got: usize },

    #[error("collection does not exist")]
    MissingCollection,
}

#[derive(Debug, Error)]
pub enum ShelfError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Provisioning error during {op} on '{target}': {reason}")]
    Provisioning {
        op: &'static str,
        target: String,
        reason: String,
    },

    #[error("Ingest error on '{collection}': {fault}")]
    Ingest {
        collection: String,
        fault: IngestFault,
    },

    #[error("Query error on '{collection}': {reason}")]
    Query { collection: String, reason: String },

    #[error("Collection '{collection}' is not loaded")]
    NotLoaded { collection: String },

    #[error("Transient backend error during {op}: {reason}")]
    Transient { op: &'static str, reason: String },

    #[error("Record source error: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShelfError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Schema(_) => "SCHEMA_INVALID",
            Self::Provisioning { .. } => "PROVISIONING_REFUSED",
            Self::Ingest { fault, .. } => match fault {
                IngestFault::DuplicateId { .. } => "INGEST_DUPLICATE_ID",
                IngestFault::NegativeId { .. } => "INGEST_NEGATIVE_ID",
                IngestFault::DimensionMismatch { .. } => "INGEST_DIMENSION_MISMATCH",
                IngestFault::LabelTooLong { .. } => "INGEST_LABEL_TOO_LONG",
                IngestFault::Malformed { .. } => "INGEST_MALFORMED_ROW",
                IngestFault::CountMismatch { .. } => "INGEST_COUNT_MISMATCH",
                IngestFault::MissingCollection => "INGEST_MISSING_COLLECTION",
            },
            Self::Query { .. } => "QUERY_INVALID",
            Self::NotLoaded { .. } => "QUERY_NOT_LOADED",
            Self::Transient { .. } => "BACKEND_TRANSIENT",
            Self::Source(_) => "SOURCE_INVALID",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Storage(_) => "STORAGE",
            Self::Io(_) => "IO",
        }
    }

    /// True when re-issuing the same idempotent operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// A duplicate-id rejection after a retried insert means the earlier
    /// attempt already landed.
    pub fn is_already_applied(&self) -> bool {
        matches!(
            self,
            Self::Ingest {
                fault: IngestFault::DuplicateId { .. },
                ..
            }
        )
    }

    pub(crate) fn ingest(collection: &str, fault: IngestFault) -> Self {
        Self::Ingest {
            collection: collection.to_string(),
            fault,
        }
    }

    pub(crate) fn query(collection: &str, reason: impl Into<String>) -> Self {
        Self::Query {
            collection: collection.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn provisioning(
        op: &'static str,
        target: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Provisioning {
            op,
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShelfError>;

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShelfConfig {
    /// Backend endpoint: `local://<dir>` or `memory://`
    pub uri: String,
    /// Opaque credential handed to the backend on connect
    pub token: String,
    pub database: String,
    pub collection: String,
    /// Vectors table (CSV with leading index column, or `.npy`)
    pub vectors_path: String,
    /// Titles table (CSV with a `title` column)
    pub titles_path: String,
    /// Top-K used by the probe search
    pub search_limit: usize,
    /// Attempts for retryable operations after the first failure
    pub max_retries: usize,
    /// Vector index flavour: autoindex | flat | hnsw
    pub index: String,
}

impl Default for ShelfConfig {
    fn default() -> Self {
        Self {
            uri: "local://./data".to_string(),
            token: "root:Milvus".to_string(),
            database: "anime_database".to_string(),
            collection: "anime_embeddings_collection".to_string(),
            vectors_path: "./dataset/embeddings_df.csv".to_string(),
            titles_path: "./dataset/65k_anime_data.csv".to_string(),
            search_limit: 11,
            max_retries: 3,
            index: "autoindex".to_string(),
        }
    }
}

impl ShelfConfig {
    /// Load config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let text = |key: &str, fallback: String| std::env::var(key).unwrap_or(fallback);
        let number = |key: &str, fallback: usize| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            uri: text("VECSHELF_URI", defaults.uri),
            token: text("VECSHELF_TOKEN", defaults.token),
            database: text("VECSHELF_DATABASE", defaults.database),
            collection: text("VECSHELF_COLLECTION", defaults.collection),
            vectors_path: text("VECSHELF_VECTORS_PATH", defaults.vectors_path),
            titles_path: text("VECSHELF_TITLES_PATH", defaults.titles_path),
            search_limit: number("VECSHELF_SEARCH_LIMIT", defaults.search_limit),
            max_retries: number("VECSHELF_MAX_RETRIES", defaults.max_retries),
            index: text("VECSHELF_INDEX", defaults.index),
        }
    }

    /// # Errors
    /// Returns `ShelfError::Config` for empty names, zero limits or an unknown index kind.
    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() || self.collection.trim().is_empty() {
            return Err(ShelfError::Config(
                "database and collection names must not be empty".into(),
            ));
        }
        if self.search_limit == 0 {
            return Err(ShelfError::Config("search limit must be at least 1".into()));
        }
        self.index.parse::<IndexKind>()?;
        Ok(())
    }
}

// ── Core Data Types ───────────────────────────────────────────────────────────

/// One title with its learned embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub label: String,
    pub vector: Vec<f32>,
}

impl Record {
    pub fn new(id: i64, label: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            id,
            label: label.into(),
            vector,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
