// VecShelf — local.rs
// In-process backend: databases → collections → rows, with an optional
// bincode snapshot on disk.
// Author: d65v <https://github.com/d65v>

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::{
    BackendHit, CollectionInfo, InsertOutcome, LoadState, SearchRequest, VectorBackend,
};
use crate::embedding::reported_score;
use crate::processing::{validate_batch, VectorIndex};
use crate::schema::{CollectionSchema, FieldValue, IndexKind, IndexSpec, Row, SchemaManager};
use crate::{IngestFault, Result, ShelfError};

/// Database every backend starts with; it cannot be dropped.
pub const DEFAULT_DATABASE: &str = "default";

const SNAPSHOT_FILE: &str = "vecshelf.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

// ── Persisted State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionState {
    schema: CollectionSchema,
    indexes: Vec<IndexSpec>,
    /// Flushed rows by primary key
    rows: BTreeMap<i64, Row>,
    loaded: bool,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    databases: BTreeMap<&'a str, BTreeMap<&'a str, &'a CollectionState>>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    databases: BTreeMap<String, BTreeMap<String, CollectionState>>,
}

// ── Live State ────────────────────────────────────────────────────────────────

struct Collection {
    state: CollectionState,
    /// Inserted but not yet flushed
    growing: Vec<(i64, Row)>,
    growing_ids: HashSet<i64>,
    index: VectorIndex,
}

impl Collection {
    fn new(state: CollectionState) -> Result<Self> {
        let metric = SchemaManager::vector_metric(&state.schema, &state.indexes)
            .ok_or_else(|| ShelfError::Schema("vector index has no metric".into()))?;
        let vector_field = state
            .schema
            .vector_field()
            .map(|f| f.name.clone())
            .ok_or_else(|| ShelfError::Schema("no FLOAT_VECTOR field".into()))?;
        let kind = state
            .indexes
            .iter()
            .find(|i| i.field_name == vector_field)
            .map(|i| i.kind)
            .unwrap_or(IndexKind::AutoIndex);

        let mut index = VectorIndex::new(state.schema.dim(), kind, metric);
        for (id, row) in &state.rows {
            if let Some(FieldValue::FloatVector(v)) = row.get(&vector_field) {
                index.insert(*id, v);
            }
        }

        Ok(Self {
            state,
            growing: Vec::new(),
            growing_ids: HashSet::new(),
            index,
        })
    }

    fn contains(&self, id: i64) -> bool {
        self.state.rows.contains_key(&id) || self.growing_ids.contains(&id)
    }

    fn vector_field(&self) -> &str {
        self.state
            .schema
            .vector_field()
            .map(|f| f.name.as_str())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Database {
    collections: BTreeMap<String, Collection>,
}

// ── Local Backend ─────────────────────────────────────────────────────────────

/// Single-process implementation of [`VectorBackend`].
///
/// With a storage directory every create/drop/flush rewrites the snapshot,
/// so separate runs see each other's flushed data.
pub struct LocalBackend {
    root: Option<PathBuf>,
    databases: BTreeMap<String, Database>,
    current: Option<String>,
    required_token: Option<String>,
    connected: bool,
}

impl LocalBackend {
    /// Ephemeral backend; nothing touches disk.
    pub fn in_memory() -> Self {
        let mut databases = BTreeMap::new();
        databases.insert(DEFAULT_DATABASE.to_string(), Database::default());
        Self {
            root: None,
            databases,
            current: Some(DEFAULT_DATABASE.to_string()),
            required_token: None,
            connected: false,
        }
    }

    /// Open (or start) a persistent backend under `root`.
    ///
    /// # Errors
    /// Returns `ShelfError::Io` or `ShelfError::Storage` if an existing
    /// snapshot cannot be read.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut backend = Self::in_memory();
        backend.root = Some(root.clone());

        let path = root.join(SNAPSHOT_FILE);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let snapshot: Snapshot = bincode::deserialize(&bytes)
                .map_err(|e| ShelfError::Storage(format!("{}: {}", path.display(), e)))?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(ShelfError::Storage(format!(
                    "{}: unsupported snapshot version {}",
                    path.display(),
                    snapshot.version
                )));
            }
            for (db_name, collections) in snapshot.databases {
                let mut db = Database::default();
                for (name, state) in collections {
                    db.collections.insert(name, Collection::new(state)?);
                }
                backend.databases.insert(db_name, db);
            }
            log::info!(
                "LocalBackend: restored {} database(s) from {}",
                backend.databases.len(),
                path.display()
            );
        }

        Ok(backend)
    }

    /// Reject `connect` calls whose token differs from `token`.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.required_token = Some(token.into());
        self
    }

    fn ensure_connected(&self, op: &'static str) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(ShelfError::Transient {
                op,
                reason: "session is not connected".into(),
            })
        }
    }

    fn db(&self, op: &'static str) -> Result<&Database> {
        self.ensure_connected(op)?;
        let name = self
            .current
            .as_deref()
            .ok_or_else(|| ShelfError::provisioning(op, "<none>", "no database selected"))?;
        self.databases
            .get(name)
            .ok_or_else(|| ShelfError::provisioning(op, name, "database does not exist"))
    }

    fn db_mut(&mut self, op: &'static str) -> Result<&mut Database> {
        self.ensure_connected(op)?;
        let name = self
            .current
            .clone()
            .ok_or_else(|| ShelfError::provisioning(op, "<none>", "no database selected"))?;
        self.databases
            .get_mut(&name)
            .ok_or_else(|| ShelfError::provisioning(op, &name, "database does not exist"))
    }

    fn collection(&self, op: &'static str, name: &str) -> Result<Option<&Collection>> {
        Ok(self.db(op)?.collections.get(name))
    }

    fn collection_mut(&mut self, op: &'static str, name: &str) -> Result<Option<&mut Collection>> {
        Ok(self.db_mut(op)?.collections.get_mut(name))
    }

    /// Rewrite the snapshot (temp file + rename). No-op when in memory.
    fn persist(&self) -> Result<()> {
        let root = match &self.root {
            Some(r) => r,
            None => return Ok(()),
        };

        let databases: BTreeMap<&str, BTreeMap<&str, &CollectionState>> = self
            .databases
            .iter()
            .map(|(db_name, db)| {
                let collections: BTreeMap<&str, &CollectionState> = db
                    .collections
                    .iter()
                    .map(|(name, c)| (name.as_str(), &c.state))
                    .collect();
                (db_name.as_str(), collections)
            })
            .collect();
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            databases,
        };
        let bytes =
            bincode::serialize(&snapshot).map_err(|e| ShelfError::Storage(e.to_string()))?;

        let tmp = root.join(format!("{}.tmp", SNAPSHOT_FILE));
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, root.join(SNAPSHOT_FILE))?;

        log::debug!("LocalBackend: snapshot written ({} bytes)", bytes.len());
        Ok(())
    }
}

impl VectorBackend for LocalBackend {
    fn connect(&mut self, token: &str) -> Result<()> {
        if let Some(required) = &self.required_token {
            if required != token {
                return Err(ShelfError::Transient {
                    op: "connect",
                    reason: "authentication failed".into(),
                });
            }
        }
        self.connected = true;
        Ok(())
    }

    fn list_databases(&self) -> Result<Vec<String>> {
        self.ensure_connected("list_databases")?;
        Ok(self.databases.keys().cloned().collect())
    }

    fn create_database(&mut self, name: &str) -> Result<()> {
        self.ensure_connected("create_database")?;
        if name.trim().is_empty() {
            return Err(ShelfError::provisioning("create_database", name, "empty name"));
        }
        if self.databases.contains_key(name) {
            return Err(ShelfError::provisioning(
                "create_database",
                name,
                "database already exists",
            ));
        }
        self.databases.insert(name.to_string(), Database::default());
        self.persist()
    }

    fn drop_database(&mut self, name: &str) -> Result<()> {
        self.ensure_connected("drop_database")?;
        if name == DEFAULT_DATABASE {
            return Err(ShelfError::provisioning(
                "drop_database",
                name,
                "the default database cannot be dropped",
            ));
        }
        match self.databases.get(name) {
            None => {
                return Err(ShelfError::provisioning(
                    "drop_database",
                    name,
                    "database does not exist",
                ))
            }
            Some(db) if !db.collections.is_empty() => {
                return Err(ShelfError::provisioning(
                    "drop_database",
                    name,
                    format!("database still holds {} collection(s)", db.collections.len()),
                ))
            }
            Some(_) => {}
        }
        self.databases.remove(name);
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        self.persist()
    }

    fn use_database(&mut self, name: &str) -> Result<()> {
        self.ensure_connected("use_database")?;
        if !self.databases.contains_key(name) {
            return Err(ShelfError::provisioning(
                "use_database",
                name,
                "database does not exist",
            ));
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    fn current_database(&self) -> Option<String> {
        self.current.clone()
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.db("list_collections")?.collections.keys().cloned().collect())
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        self.ensure_connected("has_collection")?;
        Ok(self
            .current
            .as_deref()
            .and_then(|db| self.databases.get(db))
            .map_or(false, |db| db.collections.contains_key(name)))
    }

    fn create_collection(
        &mut self,
        name: &str,
        schema: &CollectionSchema,
        indexes: &[IndexSpec],
    ) -> Result<()> {
        SchemaManager::validate(schema, indexes)?;
        let db = self.db_mut("create_collection")?;
        if db.collections.contains_key(name) {
            return Err(ShelfError::provisioning(
                "create_collection",
                name,
                "collection already exists",
            ));
        }
        let collection = Collection::new(CollectionState {
            schema: schema.clone(),
            indexes: indexes.to_vec(),
            rows: BTreeMap::new(),
            // index params given up front: ready immediately
            loaded: true,
        })?;
        db.collections.insert(name.to_string(), collection);
        self.persist()
    }

    fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
        let c = self.collection("describe_collection", name)?.ok_or_else(|| {
            ShelfError::provisioning("describe_collection", name, "collection does not exist")
        })?;
        Ok(CollectionInfo {
            name: name.to_string(),
            schema: c.state.schema.clone(),
            indexes: c.state.indexes.clone(),
        })
    }

    fn drop_collection(&mut self, name: &str) -> Result<()> {
        let db = self.db_mut("drop_collection")?;
        if db.collections.remove(name).is_none() {
            return Err(ShelfError::provisioning(
                "drop_collection",
                name,
                "collection does not exist",
            ));
        }
        self.persist()
    }

    fn get_load_state(&self, collection: &str) -> Result<LoadState> {
        self.ensure_connected("get_load_state")?;
        let state = match self
            .current
            .as_deref()
            .and_then(|db| self.databases.get(db))
            .and_then(|db| db.collections.get(collection))
        {
            None => LoadState::NotExist,
            Some(c) if c.state.loaded => LoadState::Loaded,
            Some(_) => LoadState::NotLoad,
        };
        Ok(state)
    }

    fn load_collection(&mut self, collection: &str) -> Result<()> {
        let c = self
            .collection_mut("load_collection", collection)?
            .ok_or_else(|| {
                ShelfError::provisioning("load_collection", collection, "collection does not exist")
            })?;
        c.state.loaded = true;
        self.persist()
    }

    fn release_collection(&mut self, collection: &str) -> Result<()> {
        let c = self
            .collection_mut("release_collection", collection)?
            .ok_or_else(|| {
                ShelfError::provisioning(
                    "release_collection",
                    collection,
                    "collection does not exist",
                )
            })?;
        c.state.loaded = false;
        self.persist()
    }

    fn insert(&mut self, collection: &str, rows: &[Row]) -> Result<InsertOutcome> {
        let c = self
            .collection_mut("insert", collection)?
            .ok_or_else(|| ShelfError::ingest(collection, IngestFault::MissingCollection))?;

        let ids = validate_batch(&c.state.schema, rows, |id| c.contains(id))
            .map_err(|fault| ShelfError::ingest(collection, fault))?;

        for (id, row) in ids.iter().zip(rows) {
            c.growing.push((*id, row.clone()));
            c.growing_ids.insert(*id);
        }

        Ok(InsertOutcome {
            insert_count: ids.len(),
            ids,
        })
    }

    fn flush(&mut self, collection: &str) -> Result<()> {
        let c = self
            .collection_mut("flush", collection)?
            .ok_or_else(|| ShelfError::ingest(collection, IngestFault::MissingCollection))?;

        let vector_field = c.vector_field().to_string();
        let sealed = c.growing.len();
        for (id, row) in c.growing.drain(..) {
            if let Some(FieldValue::FloatVector(v)) = row.get(&vector_field) {
                c.index.insert(id, v);
            }
            c.state.rows.insert(id, row);
        }
        c.growing_ids.clear();

        log::debug!("flush '{}': sealed {} row(s)", collection, sealed);
        self.persist()
    }

    fn row_count(&self, collection: &str) -> Result<usize> {
        self.collection("row_count", collection)?
            .map(|c| c.state.rows.len())
            .ok_or_else(|| ShelfError::query(collection, "collection does not exist"))
    }

    fn search(&self, request: &SearchRequest<'_>) -> Result<Vec<Vec<BackendHit>>> {
        let name = request.collection;
        let c = self
            .collection("search", name)?
            .ok_or_else(|| ShelfError::query(name, "collection does not exist"))?;

        if !c.state.loaded {
            return Err(ShelfError::NotLoaded {
                collection: name.to_string(),
            });
        }
        if request.anns_field != c.vector_field() {
            return Err(ShelfError::query(
                name,
                format!("'{}' is not the vector field", request.anns_field),
            ));
        }
        if request.metric != c.index.metric() {
            return Err(ShelfError::query(
                name,
                format!(
                    "metric mismatch: index uses {}, request uses {}",
                    c.index.metric(),
                    request.metric
                ),
            ));
        }
        if request.limit == 0 {
            return Err(ShelfError::query(name, "limit must be at least 1"));
        }
        if let Some(unknown) = request
            .output_fields
            .iter()
            .find(|f| c.state.schema.field(f).is_none())
        {
            return Err(ShelfError::query(
                name,
                format!("unknown output field '{}'", unknown),
            ));
        }

        let dim = c.state.schema.dim();
        let mut all = Vec::with_capacity(request.data.len());
        for query in request.data {
            if query.len() != dim {
                return Err(ShelfError::query(
                    name,
                    format!("query vector has {} components, expected {}", query.len(), dim),
                ));
            }
            if query.iter().any(|x| !x.is_finite()) {
                return Err(ShelfError::query(name, "query vector contains NaN/Inf"));
            }

            let hits = c
                .index
                .search(query, request.limit)
                .into_iter()
                .filter_map(|(id, raw)| {
                    let row = c.state.rows.get(&id)?;
                    let entity = request
                        .output_fields
                        .iter()
                        .filter_map(|f| row.get(*f).map(|v| (f.to_string(), v.clone())))
                        .collect();
                    Some(BackendHit {
                        id,
                        distance: reported_score(c.index.metric(), raw),
                        entity,
                    })
                })
                .collect();
            all.push(hits);
        }

        Ok(all)
    }

    fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.current = None;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Metric;
    use crate::schema::SchemaSpec;
    use crate::Record;

    fn connected() -> LocalBackend {
        let mut b = LocalBackend::in_memory();
        b.connect("root:Milvus").unwrap();
        b
    }

    fn titles(dim: usize) -> (CollectionSchema, Vec<IndexSpec>) {
        SchemaManager::define(&SchemaSpec::titles(dim)).unwrap()
    }

    fn rows(schema: &CollectionSchema, records: &[Record]) -> Vec<Row> {
        records.iter().map(|r| schema.row_for(r).unwrap()).collect()
    }

    #[test]
    fn test_requires_connect() {
        let b = LocalBackend::in_memory();
        let err = b.list_databases().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_token_mismatch_fails_connect() {
        let mut b = LocalBackend::in_memory().with_token("root:Milvus");
        assert!(b.connect("guest:guest").is_err());
        assert!(b.connect("root:Milvus").is_ok());
    }

    #[test]
    fn test_default_database_present_and_protected() {
        let mut b = connected();
        assert_eq!(b.list_databases().unwrap(), vec![DEFAULT_DATABASE.to_string()]);
        let err = b.drop_database(DEFAULT_DATABASE).unwrap_err();
        assert!(matches!(err, ShelfError::Provisioning { .. }));
    }

    #[test]
    fn test_drop_database_requires_empty() {
        let mut b = connected();
        let (schema, indexes) = titles(2);
        b.create_database("shelf").unwrap();
        b.use_database("shelf").unwrap();
        b.create_collection("c", &schema, &indexes).unwrap();
        assert!(b.drop_database("shelf").is_err());
        b.drop_collection("c").unwrap();
        b.drop_database("shelf").unwrap();
        assert_eq!(b.current_database(), None);
    }

    #[test]
    fn test_rows_visible_after_flush_only() {
        let mut b = connected();
        let (schema, indexes) = titles(2);
        b.create_collection("c", &schema, &indexes).unwrap();
        assert_eq!(b.get_load_state("c").unwrap(), LoadState::Loaded);

        let out = b
            .insert("c", &rows(&schema, &[Record::new(1, "a", vec![1.0, 0.0])]))
            .unwrap();
        assert_eq!(out.insert_count, 1);
        assert_eq!(b.row_count("c").unwrap(), 0);

        b.flush("c").unwrap();
        assert_eq!(b.row_count("c").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_rejected_including_unflushed() {
        let mut b = connected();
        let (schema, indexes) = titles(2);
        b.create_collection("c", &schema, &indexes).unwrap();
        b.insert("c", &rows(&schema, &[Record::new(1, "a", vec![1.0, 0.0])]))
            .unwrap();

        let err = b
            .insert(
                "c",
                &rows(
                    &schema,
                    &[Record::new(2, "b", vec![0.0, 1.0]), Record::new(1, "dup", vec![0.5, 0.5])],
                ),
            )
            .unwrap_err();
        assert!(err.is_already_applied());

        // the valid row of the rejected batch was not applied
        b.flush("c").unwrap();
        assert_eq!(b.row_count("c").unwrap(), 1);
    }

    #[test]
    fn test_search_checks_request() {
        let mut b = connected();
        let (schema, indexes) = titles(2);
        b.create_collection("c", &schema, &indexes).unwrap();
        b.insert("c", &rows(&schema, &[Record::new(1, "a", vec![1.0, 0.0])]))
            .unwrap();
        b.flush("c").unwrap();

        let data = vec![vec![1.0, 0.0]];
        let mut req = SearchRequest {
            collection: "c",
            anns_field: "embedding",
            data: &data,
            limit: 3,
            metric: Metric::Cosine,
            output_fields: &["anime_name"],
        };
        let hits = b.search(&req).unwrap();
        assert_eq!(hits[0].len(), 1);
        assert_eq!(hits[0][0].text("anime_name"), Some("a"));

        req.metric = Metric::Euclidean;
        assert!(matches!(b.search(&req), Err(ShelfError::Query { .. })));

        req.metric = Metric::Cosine;
        req.limit = 0;
        assert!(matches!(b.search(&req), Err(ShelfError::Query { .. })));

        let not_finite = vec![vec![f32::NAN, 0.0]];
        req.limit = 3;
        req.data = &not_finite;
        assert!(matches!(b.search(&req), Err(ShelfError::Query { .. })));
        req.data = &data;

        b.release_collection("c").unwrap();
        req.limit = 3;
        assert!(matches!(b.search(&req), Err(ShelfError::NotLoaded { .. })));
        assert_eq!(b.get_load_state("c").unwrap(), LoadState::NotLoad);
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("vecshelf_local_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let (schema, indexes) = titles(3);

        {
            let mut b = LocalBackend::open(&dir).unwrap();
            b.connect("t").unwrap();
            b.create_database("shelf").unwrap();
            b.use_database("shelf").unwrap();
            b.create_collection("c", &schema, &indexes).unwrap();
            b.insert("c", &rows(&schema, &[Record::new(7, "kept", vec![0.0, 1.0, 0.0])]))
                .unwrap();
            b.flush("c").unwrap();
            b.insert("c", &rows(&schema, &[Record::new(8, "lost", vec![1.0, 0.0, 0.0])]))
                .unwrap();
        }

        let mut b = LocalBackend::open(&dir).unwrap();
        b.connect("t").unwrap();
        b.use_database("shelf").unwrap();
        assert_eq!(b.row_count("c").unwrap(), 1);
        assert_eq!(b.describe_collection("c").unwrap().schema, schema);

        let data = vec![vec![0.0, 1.0, 0.0]];
        let hits = b
            .search(&SearchRequest {
                collection: "c",
                anns_field: "embedding",
                data: &data,
                limit: 5,
                metric: Metric::Cosine,
                output_fields: &["anime_name"],
            })
            .unwrap();
        assert_eq!(hits[0][0].id, 7);

        fs::remove_dir_all(&dir).ok();
    }
}
