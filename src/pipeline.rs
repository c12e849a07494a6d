// VecShelf — pipeline.rs
// The three workflow phases: populate, bring new data, search the probe.
// Author: d65v <https://github.com/d65v>

use crate::ingest::{BulkIngestor, IncrementalIngestor, IngestReport};
use crate::partition::{DatasetPartitioner, Partitions};
use crate::provision::CollectionProvisioner;
use crate::schema::{IndexKind, SchemaManager, SchemaSpec};
use crate::search::{Hit, SimilaritySearcher};
use crate::session::Session;
use crate::source::RecordSource;
use crate::{Record, Result, ShelfConfig, ShelfError};

/// Probe record plus the hits found for it.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub probe: Record,
    pub hits: Vec<Hit>,
}

/// Counts and hits from a full populate → bring-new → search run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub populated: IngestReport,
    pub added: IngestReport,
    pub probe: ProbeResult,
}

pub struct Pipeline<'a> {
    config: &'a ShelfConfig,
    partitioner: DatasetPartitioner,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a ShelfConfig) -> Self {
        Self {
            config,
            partitioner: DatasetPartitioner::default(),
        }
    }

    pub fn with_partitioner(mut self, partitioner: DatasetPartitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    fn split(&self, source: &RecordSource) -> Result<Partitions> {
        if source.is_empty() {
            return Err(ShelfError::Source("record source is empty".into()));
        }
        self.partitioner.partition(source)
    }

    fn select_database(&self, session: &mut Session) -> Result<()> {
        let db = self.config.database.as_str();
        session.retrying("use_database", |b| b.use_database(db))
    }

    /// Reset the collection to an empty, loaded state and bulk-load every
    /// record except the deferred and probe positions.
    pub fn populate(&self, session: &mut Session, source: &RecordSource) -> Result<IngestReport> {
        let parts = self.split(source)?;

        let mut spec = SchemaSpec::titles(source.dim());
        spec.vector_index = self.config.index.parse::<IndexKind>()?;
        let (schema, indexes) = SchemaManager::define(&spec)?;

        CollectionProvisioner::new(session).provision(
            &self.config.database,
            &self.config.collection,
            &schema,
            &indexes,
        )?;

        let report = BulkIngestor::new(session).ingest(&self.config.collection, &parts.bulk)?;
        log::info!(
            "populate done: {} rows in '{}.{}'",
            report.row_count,
            self.config.database,
            self.config.collection
        );
        Ok(report)
    }

    /// Add the deferred records to the populated collection.
    pub fn bring_new_data(
        &self,
        session: &mut Session,
        source: &RecordSource,
    ) -> Result<IngestReport> {
        let parts = self.split(source)?;
        self.select_database(session)?;

        let report = IncrementalIngestor::new(session)
            .ingest(&self.config.collection, &parts.deferred_records())?;
        log::info!(
            "bring-new done: +{} rows, {} total",
            report.inserted,
            report.row_count
        );
        Ok(report)
    }

    /// Query with the never-stored probe record's vector.
    pub fn search_probe(
        &self,
        session: &mut Session,
        source: &RecordSource,
    ) -> Result<ProbeResult> {
        let parts = self.split(source)?;
        self.select_database(session)?;

        let probe = parts.probe_record().clone();
        log::info!("probing with id {} ({:?})", probe.id, probe.label);
        let hits = SimilaritySearcher::new(session).search(
            &self.config.collection,
            &probe.vector,
            self.config.search_limit,
        )?;
        Ok(ProbeResult { probe, hits })
    }

    /// All three phases in order.
    pub fn run(&self, session: &mut Session, source: &RecordSource) -> Result<RunSummary> {
        let populated = self.populate(session, source)?;
        let added = self.bring_new_data(session, source)?;
        let probe = self.search_probe(session, source)?;
        Ok(RunSummary {
            populated,
            added,
            probe,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionPlan;

    fn gen_vec(seed: u64, dim: usize) -> Vec<f32> {
        let mut state = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (0..dim)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32) / (u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    fn source(n: usize, dim: usize) -> RecordSource {
        RecordSource::from_records(
            (0..n)
                .map(|i| Record::new(i as i64, format!("title {}", i), gen_vec(i as u64, dim)))
                .collect(),
        )
        .unwrap()
    }

    fn memory_config() -> ShelfConfig {
        ShelfConfig {
            uri: "memory://".into(),
            ..ShelfConfig::default()
        }
    }

    #[test]
    fn test_full_catalog_scenario() {
        let cfg = memory_config();
        let src = source(65_000, 8);
        let mut session = Session::from_config(&cfg).unwrap();

        let summary = Pipeline::new(&cfg).run(&mut session, &src).unwrap();
        assert_eq!(summary.populated.row_count, 64_996);
        assert_eq!(summary.added.inserted, 3);
        assert_eq!(summary.added.row_count, 64_999);

        let hits = &summary.probe.hits;
        assert_eq!(hits.len(), 11);
        assert_eq!(summary.probe.probe.id, 9);
        assert!(hits.iter().all(|h| h.id != 9));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_deferred_records_are_searchable_after_bring_new() {
        let cfg = memory_config();
        let src = source(40, 4);
        let pipeline = Pipeline::new(&cfg).with_partitioner(DatasetPartitioner::new(PartitionPlan {
            deferred: vec![30, 20],
            probe: 5,
        }));
        let mut session = Session::from_config(&cfg).unwrap();

        assert_eq!(pipeline.populate(&mut session, &src).unwrap().row_count, 37);

        let deferred = src.get(20).unwrap().vector.clone();
        let before = SimilaritySearcher::new(&mut session)
            .search(&cfg.collection, &deferred, 1)
            .unwrap();
        assert_ne!(before[0].id, 20);

        assert_eq!(pipeline.bring_new_data(&mut session, &src).unwrap().row_count, 39);
        let after = SimilaritySearcher::new(&mut session)
            .search(&cfg.collection, &deferred, 1)
            .unwrap();
        assert_eq!(after[0].id, 20);
        assert!((after[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_populate_twice_resets_collection() {
        let cfg = memory_config();
        let src = source(40, 4);
        let pipeline = Pipeline::new(&cfg).with_partitioner(DatasetPartitioner::new(PartitionPlan {
            deferred: vec![1],
            probe: 2,
        }));
        let mut session = Session::from_config(&cfg).unwrap();

        pipeline.run(&mut session, &src).unwrap();
        let again = pipeline.populate(&mut session, &src).unwrap();
        assert_eq!(again.row_count, 38);
    }

    #[test]
    fn test_bring_new_without_populate_fails() {
        let cfg = memory_config();
        let src = source(3000, 4);
        let mut session = Session::from_config(&cfg).unwrap();
        assert!(Pipeline::new(&cfg).bring_new_data(&mut session, &src).is_err());
    }

    #[test]
    fn test_empty_source_rejected() {
        let cfg = memory_config();
        let mut session = Session::from_config(&cfg).unwrap();
        let err = Pipeline::new(&cfg)
            .populate(&mut session, &RecordSource::default())
            .unwrap_err();
        assert!(matches!(err, ShelfError::Source(_)));
    }
}
