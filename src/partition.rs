// VecShelf — partition.rs
// Split the record source into bulk / deferred / probe by source position.
// Author: d65v <https://github.com/d65v>

use std::collections::{BTreeMap, BTreeSet};

use crate::source::RecordSource;
use crate::{Record, Result, ShelfError};

/// Positions held back from the bulk load and inserted later.
pub const DEFERRED_POSITIONS: [usize; 3] = [2790, 1896, 1344];
/// Position never stored; its vector stands in for an unseen title.
pub const PROBE_POSITION: usize = 9;

/// Fixed positions defining the three partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub deferred: Vec<usize>,
    pub probe: usize,
}

impl Default for PartitionPlan {
    fn default() -> Self {
        Self {
            deferred: DEFERRED_POSITIONS.to_vec(),
            probe: PROBE_POSITION,
        }
    }
}

/// The three disjoint groups. Deferred and probe keep their source positions.
#[derive(Debug, Clone)]
pub struct Partitions {
    pub bulk: Vec<Record>,
    pub deferred: BTreeMap<usize, Record>,
    pub probe: (usize, Record),
}

impl Partitions {
    pub fn deferred_records(&self) -> Vec<Record> {
        self.deferred.values().cloned().collect()
    }

    pub fn probe_record(&self) -> &Record {
        &self.probe.1
    }
}

pub struct DatasetPartitioner {
    plan: PartitionPlan,
}

impl DatasetPartitioner {
    pub fn new(plan: PartitionPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    /// Partition `source` against its original positions.
    ///
    /// # Errors
    /// `ShelfError::Config` if a position repeats, the probe is also deferred,
    /// or any position is outside the source.
    pub fn partition(&self, source: &RecordSource) -> Result<Partitions> {
        let n = source.len();
        let deferred: BTreeSet<usize> = self.plan.deferred.iter().copied().collect();

        if deferred.len() != self.plan.deferred.len() {
            return Err(ShelfError::Config(format!(
                "deferred positions repeat: {:?}",
                self.plan.deferred
            )));
        }
        if deferred.contains(&self.plan.probe) {
            return Err(ShelfError::Config(format!(
                "probe position {} is also deferred",
                self.plan.probe
            )));
        }
        if let Some(p) = deferred
            .iter()
            .copied()
            .chain(std::iter::once(self.plan.probe))
            .find(|p| *p >= n)
        {
            return Err(ShelfError::Config(format!(
                "position {} is outside a source of {} records",
                p, n
            )));
        }

        let mut bulk = Vec::with_capacity(n - deferred.len() - 1);
        let mut held = BTreeMap::new();
        let mut probe = None;

        for (position, record) in source.iter() {
            if position == self.plan.probe {
                probe = Some((position, record.clone()));
            } else if deferred.contains(&position) {
                held.insert(position, record.clone());
            } else {
                bulk.push(record.clone());
            }
        }

        let probe = probe.ok_or_else(|| {
            ShelfError::Config(format!("probe position {} not found", self.plan.probe))
        })?;

        log::info!(
            "partitioned {} records: bulk={}, deferred={:?}, probe={}",
            n,
            bulk.len(),
            held.keys().collect::<Vec<_>>(),
            probe.0
        );

        Ok(Partitions {
            bulk,
            deferred: held,
            probe,
        })
    }
}

impl Default for DatasetPartitioner {
    fn default() -> Self {
        Self::new(PartitionPlan::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// id = 1000 + position so ids and positions never coincide
    fn source(n: usize) -> RecordSource {
        RecordSource::from_records(
            (0..n)
                .map(|i| Record::new(1000 + i as i64, format!("title {}", i), vec![i as f32, 1.0]))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_partitions_are_disjoint_and_cover_source() {
        let src = source(3000);
        let parts = DatasetPartitioner::default().partition(&src).unwrap();

        assert_eq!(parts.bulk.len(), 3000 - 4);
        assert_eq!(parts.deferred.len(), 3);

        let bulk: HashSet<i64> = parts.bulk.iter().map(|r| r.id).collect();
        let deferred: HashSet<i64> = parts.deferred.values().map(|r| r.id).collect();
        let probe = parts.probe_record().id;

        assert!(bulk.is_disjoint(&deferred));
        assert!(!bulk.contains(&probe));
        assert!(!deferred.contains(&probe));
        assert_eq!(bulk.len() + deferred.len() + 1, src.len());
    }

    #[test]
    fn test_held_back_records_are_the_intended_positions() {
        let src = source(3000);
        let parts = DatasetPartitioner::default().partition(&src).unwrap();

        assert_eq!(parts.probe.0, 9);
        assert_eq!(parts.probe_record(), src.get(9).unwrap());
        for pos in DEFERRED_POSITIONS {
            assert_eq!(&parts.deferred[&pos], src.get(pos).unwrap());
        }
    }

    #[test]
    fn test_bulk_preserves_source_order() {
        let src = source(3000);
        let parts = DatasetPartitioner::default().partition(&src).unwrap();
        assert!(parts.bulk.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(parts.bulk[9].id, 1010);
    }

    #[test]
    fn test_same_source_same_partitions() {
        let src = source(3000);
        let a = DatasetPartitioner::default().partition(&src).unwrap();
        let b = DatasetPartitioner::default().partition(&src).unwrap();
        assert_eq!(a.bulk, b.bulk);
        assert_eq!(a.deferred, b.deferred);
        assert_eq!(a.probe, b.probe);
    }

    #[test]
    fn test_rejects_overlap_and_out_of_range() {
        let src = source(100);
        let overlap = DatasetPartitioner::new(PartitionPlan {
            deferred: vec![1, 2, 3],
            probe: 2,
        });
        assert!(overlap.partition(&src).is_err());

        let repeat = DatasetPartitioner::new(PartitionPlan {
            deferred: vec![1, 1, 3],
            probe: 9,
        });
        assert!(repeat.partition(&src).is_err());

        // default plan needs at least 2791 records
        assert!(DatasetPartitioner::default().partition(&src).is_err());
    }
}
