// VecShelf — provision.rs
// Reconcile a named database + collection to a fresh, empty, loaded state.
// Author: d65v <https://github.com/d65v>

use crate::backend::{LoadState, VectorBackend};
use crate::local::DEFAULT_DATABASE;
use crate::schema::{CollectionSchema, IndexSpec, SchemaManager};
use crate::session::Session;
use crate::{Result, ShelfError};

/// Steps needed to go from what the backend holds to the desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub database: String,
    pub collection: String,
    /// Every collection currently in the database
    pub drop_collections: Vec<String>,
    pub drop_database: bool,
    pub create_database: bool,
}

impl ReconcilePlan {
    /// Work out the plan against the backend's current contents.
    ///
    /// Selects `database` when it exists so its collections can be listed.
    pub fn compute(
        backend: &mut dyn VectorBackend,
        database: &str,
        collection: &str,
    ) -> Result<Self> {
        let exists = backend.list_databases()?.iter().any(|d| d == database);
        let drop_collections = if exists {
            backend.use_database(database)?;
            backend.list_collections()?
        } else {
            Vec::new()
        };
        // the default database is emptied in place
        let is_default = database == DEFAULT_DATABASE;

        Ok(Self {
            database: database.to_string(),
            collection: collection.to_string(),
            drop_collections,
            drop_database: exists && !is_default,
            create_database: !is_default || !exists,
        })
    }

    /// Apply the plan and create the collection.
    pub fn apply(
        &self,
        backend: &mut dyn VectorBackend,
        schema: &CollectionSchema,
        indexes: &[IndexSpec],
    ) -> Result<LoadState> {
        for name in &self.drop_collections {
            log::info!("dropping collection '{}.{}'", self.database, name);
            backend.drop_collection(name)?;
        }
        if self.drop_database {
            log::info!("dropping database '{}'", self.database);
            backend.drop_database(&self.database)?;
        }
        if self.create_database {
            log::info!("creating database '{}'", self.database);
            backend.create_database(&self.database)?;
        }
        backend.use_database(&self.database)?;

        log::info!(
            "creating collection '{}' ({} fields, dim={})",
            self.collection,
            schema.fields.len(),
            schema.dim()
        );
        backend.create_collection(&self.collection, schema, indexes)?;

        let mut state = backend.get_load_state(&self.collection)?;
        if state == LoadState::NotLoad {
            backend.load_collection(&self.collection)?;
            state = backend.get_load_state(&self.collection)?;
        }
        if state != LoadState::Loaded {
            return Err(ShelfError::provisioning(
                "get_load_state",
                &self.collection,
                format!("collection is {} after creation", state),
            ));
        }

        let rows = backend.row_count(&self.collection)?;
        if rows != 0 {
            return Err(ShelfError::provisioning(
                "create_collection",
                &self.collection,
                format!("fresh collection already holds {} row(s)", rows),
            ));
        }

        Ok(state)
    }
}

// ── Collection Provisioner ────────────────────────────────────────────────────

pub struct CollectionProvisioner<'s> {
    session: &'s mut Session,
}

impl<'s> CollectionProvisioner<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    /// Destroy whatever lives under `database` and recreate it with one
    /// empty collection, then select it as current.
    ///
    /// Safe to call repeatedly. Transient failures re-run the whole
    /// reconcile, re-planning from what the backend holds at that point.
    ///
    /// # Errors
    /// `ShelfError::Schema` before any backend call if the schema is invalid;
    /// `ShelfError::Provisioning` if the backend refuses a step.
    pub fn provision(
        &mut self,
        database: &str,
        collection: &str,
        schema: &CollectionSchema,
        indexes: &[IndexSpec],
    ) -> Result<LoadState> {
        SchemaManager::validate(schema, indexes)?;

        let state = self.session.retrying("provision", |backend| {
            let plan = ReconcilePlan::compute(backend, database, collection)?;
            log::debug!("reconcile plan: {:?}", plan);
            plan.apply(backend, schema, indexes)
        })?;

        log::info!(
            "collection '{}.{}' provisioned, load state: {}",
            database,
            collection,
            state
        );
        Ok(state)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
