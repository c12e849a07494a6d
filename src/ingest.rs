// VecShelf — ingest.rs
// Bulk and incremental row insertion, each followed by a flush.
// Author: d65v <https://github.com/d65v>

use std::time::Instant;

use crate::processing::validate_batch;
use crate::schema::Row;
use crate::session::Session;
use crate::{IngestFault, Record, Result, ShelfError};

/// Outcome of one ingestion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub collection: String,
    /// Rows inserted by this call
    pub inserted: usize,
    /// Visible rows in the collection after the flush
    pub row_count: usize,
}

/// Validate, insert as one atomic batch, check the count, flush.
///
/// The insert itself is never retried: a retried insert that had already
/// landed would come back as a duplicate-id error.
fn insert_and_flush(
    session: &mut Session,
    collection: &str,
    records: &[Record],
) -> Result<IngestReport> {
    let exists = session.retrying("has_collection", |b| b.has_collection(collection))?;
    if !exists {
        return Err(ShelfError::ingest(collection, IngestFault::MissingCollection));
    }
    let info = session.retrying("describe_collection", |b| b.describe_collection(collection))?;

    let rows = records
        .iter()
        .map(|r| info.schema.row_for(r))
        .collect::<Result<Vec<Row>>>()?;
    validate_batch(&info.schema, &rows, |_| false)
        .map_err(|fault| ShelfError::ingest(collection, fault))?;

    let t0 = Instant::now();
    let outcome = session.backend_mut().insert(collection, &rows)?;
    if outcome.insert_count != records.len() {
        return Err(ShelfError::ingest(
            collection,
            IngestFault::CountMismatch {
                expected: records.len(),
                got: outcome.insert_count,
            },
        ));
    }
    log::info!(
        "inserted {} rows into '{}' in {}ms",
        outcome.insert_count,
        collection,
        t0.elapsed().as_millis()
    );

    session.retrying("flush", |b| b.flush(collection))?;
    let row_count = session.retrying("row_count", |b| b.row_count(collection))?;
    log::debug!("'{}' holds {} rows after flush", collection, row_count);

    Ok(IngestReport {
        collection: collection.to_string(),
        inserted: outcome.insert_count,
        row_count,
    })
}

// ── Bulk Ingestor ─────────────────────────────────────────────────────────────

/// First load into a freshly provisioned collection.
pub struct BulkIngestor<'s> {
    session: &'s mut Session,
}

impl<'s> BulkIngestor<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    /// Insert every record, then flush.
    ///
    /// # Errors
    /// `ShelfError::Ingest` naming the first offending record; nothing from
    /// the batch is stored in that case.
    pub fn ingest(&mut self, collection: &str, records: &[Record]) -> Result<IngestReport> {
        log::info!("bulk load of {} records into '{}'", records.len(), collection);
        insert_and_flush(self.session, collection, records)
    }
}

// ── Incremental Ingestor ──────────────────────────────────────────────────────

/// Later additions to an existing, populated collection. Never re-provisions.
pub struct IncrementalIngestor<'s> {
    session: &'s mut Session,
}

impl<'s> IncrementalIngestor<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self { session }
    }

    /// Insert `records` alongside the rows already stored, then flush.
    ///
    /// # Errors
    /// `IngestFault::MissingCollection` if the collection was never
    /// provisioned; otherwise as [`BulkIngestor::ingest`].
    pub fn ingest(&mut self, collection: &str, records: &[Record]) -> Result<IngestReport> {
        let before = self
            .session
            .retrying("row_count", |b| b.row_count(collection))
            .map_err(|e| match e {
                ShelfError::Query { .. } => {
                    ShelfError::ingest(collection, IngestFault::MissingCollection)
                }
                other => other,
            })?;
        if before == 0 {
            log::warn!("incremental load into empty collection '{}'", collection);
        }

        log::info!(
            "incremental load of {} records into '{}' ({} rows present)",
            records.len(),
            collection,
            before
        );
        insert_and_flush(self.session, collection, records)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
