// VecShelf — backend.rs
// The narrow interface every vector-storage backend implements.
// Author: d65v <https://github.com/d65v>

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::embedding::Metric;
use crate::schema::{CollectionSchema, FieldValue, IndexSpec, Row};
use crate::Result;

/// Backend-reported readiness of a collection for querying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    NotExist,
    NotLoad,
    Loading,
    Loaded,
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadState::NotExist => "NotExist",
            LoadState::NotLoad => "NotLoad",
            LoadState::Loading => "Loading",
            LoadState::Loaded => "Loaded",
        })
    }
}

/// Schema and index params of an existing collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub schema: CollectionSchema,
    pub indexes: Vec<IndexSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub insert_count: usize,
    pub ids: Vec<i64>,
}

/// One top-K query, possibly carrying several query vectors.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub collection: &'a str,
    pub anns_field: &'a str,
    pub data: &'a [Vec<f32>],
    pub limit: usize,
    pub metric: Metric,
    pub output_fields: &'a [&'a str],
}

/// One hit as returned by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendHit {
    pub id: i64,
    pub distance: f32,
    /// Requested output fields only
    pub entity: Row,
}

impl BackendHit {
    pub fn text(&self, field: &str) -> Option<&str> {
        match self.entity.get(field) {
            Some(FieldValue::VarChar(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Vector-storage backend.
///
/// Calls are blocking and may be long-latency RPCs. Database-scoped calls
/// act on the database chosen with `use_database`.
pub trait VectorBackend: Send {
    /// Authenticate the session. Called once by `Session::open`.
    fn connect(&mut self, token: &str) -> Result<()>;

    fn list_databases(&self) -> Result<Vec<String>>;
    fn create_database(&mut self, name: &str) -> Result<()>;
    /// Only an empty database can be dropped.
    fn drop_database(&mut self, name: &str) -> Result<()>;
    fn use_database(&mut self, name: &str) -> Result<()>;
    fn current_database(&self) -> Option<String>;

    fn list_collections(&self) -> Result<Vec<String>>;
    fn has_collection(&self, name: &str) -> Result<bool>;
    fn create_collection(
        &mut self,
        name: &str,
        schema: &CollectionSchema,
        indexes: &[IndexSpec],
    ) -> Result<()>;
    fn describe_collection(&self, name: &str) -> Result<CollectionInfo>;
    fn drop_collection(&mut self, name: &str) -> Result<()>;

    fn get_load_state(&self, collection: &str) -> Result<LoadState>;
    fn load_collection(&mut self, collection: &str) -> Result<()>;
    fn release_collection(&mut self, collection: &str) -> Result<()>;

    /// Insert all rows or none.
    fn insert(&mut self, collection: &str, rows: &[Row]) -> Result<InsertOutcome>;
    /// Make inserted rows durable and visible to search.
    fn flush(&mut self, collection: &str) -> Result<()>;
    /// Flushed rows only.
    fn row_count(&self, collection: &str) -> Result<usize>;

    /// One hit list per query vector, best first.
    fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<Vec<BackendHit>>>;

    fn close(&mut self) -> Result<()>;
}
