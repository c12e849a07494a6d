// VecShelf — processing.rs
// In-memory vector index (flat + HNSW-lite) and all-or-nothing batch checks.
// Author: d65v <https://github.com/d65v>
//
// NOTE: The graph index is a single-layer HNSW-inspired structure. Full HNSW
// adds skip-list layers on top; this keeps the base layer (pruned links, beam
// search) and falls back to an exact scan for small collections.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use ordered_float::OrderedFloat;

use crate::embedding::{normalize, score, Metric};
use crate::schema::{CollectionSchema, IndexKind, Row};
use crate::IngestFault;

// ── Graph Node ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Node {
    vector: Vec<f32>,
    /// Neighbor ids on the base layer
    neighbors: Vec<i64>,
}

// ── Vector Index ──────────────────────────────────────────────────────────────

/// Nearest-neighbor index over one vector field.
/// `Flat` and `AutoIndex` always scan; `Hnsw` walks a neighbor graph once the
/// collection outgrows `BRUTE_THRESHOLD`.
pub struct VectorIndex {
    dim: usize,
    kind: IndexKind,
    metric: Metric,
    nodes: HashMap<i64, Node>,
    /// Maximum neighbors per node
    m: usize,
    /// Entry point for graph traversal
    entry: Option<i64>,
}

const BRUTE_THRESHOLD: usize = 500;
/// Beam width while linking a new node
const EF_CONSTRUCTION: usize = 100;
/// Minimum beam width at query time
const EF_SEARCH: usize = 64;

impl VectorIndex {
    pub fn new(dim: usize, kind: IndexKind, metric: Metric) -> Self {
        Self {
            dim,
            kind,
            metric,
            nodes: HashMap::new(),
            m: 16,
            entry: None,
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Insert a vector. Cosine indexes store the unit vector.
    pub fn insert(&mut self, id: i64, vector: &[f32]) {
        debug_assert_eq!(
            vector.len(),
            self.dim,
            "insert: vector dim {} ≠ index dim {}",
            vector.len(),
            self.dim
        );

        let stored = if self.metric.normalizes() {
            normalize(vector)
        } else {
            vector.to_vec()
        };

        if self.kind != IndexKind::Hnsw || self.nodes.is_empty() {
            self.nodes.insert(
                id,
                Node {
                    vector: stored,
                    neighbors: Vec::new(),
                },
            );
            if self.entry.is_none() {
                self.entry = Some(id);
            }
            return;
        }

        let nearest = self.search_prepared(&stored, self.m, EF_CONSTRUCTION);
        let neighbors: Vec<i64> = nearest.iter().map(|(nid, _)| *nid).collect();

        // Back-link into each neighbor, pruning full lists to their best links.
        // The nearest neighbor always keeps the new node so it stays reachable.
        for (rank, nid) in neighbors.iter().enumerate() {
            let links = match self.nodes.get(nid) {
                Some(node) => self.linked_with(node, id, &stored, rank == 0),
                None => continue,
            };
            if let Some(neighbor) = self.nodes.get_mut(nid) {
                neighbor.neighbors = links;
            }
        }

        self.nodes.insert(
            id,
            Node {
                vector: stored,
                neighbors,
            },
        );
    }

    /// Search for the top-k best-scoring ids, best first.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<(i64, f32)> {
        if query.len() != self.dim {
            log::warn!(
                "search: query dim {} ≠ index dim {}",
                query.len(),
                self.dim
            );
            return vec![];
        }

        let q = if self.metric.normalizes() {
            normalize(query)
        } else {
            query.to_vec()
        };
        self.search_prepared(&q, top_k, EF_SEARCH)
    }

    fn search_prepared(&self, query: &[f32], top_k: usize, ef: usize) -> Vec<(i64, f32)> {
        if self.nodes.is_empty() || top_k == 0 {
            return vec![];
        }

        if self.kind != IndexKind::Hnsw || self.nodes.len() <= BRUTE_THRESHOLD {
            return self.brute_search(query, top_k);
        }

        self.graph_search(query, top_k, ef.max(top_k))
    }

    /// `node`'s links with `new_id` added, cut back to the `2 * m` links that
    /// score best against `node`. With `keep_new` the new link survives the cut.
    fn linked_with(
        &self,
        node: &Node,
        new_id: i64,
        new_vec: &[f32],
        keep_new: bool,
    ) -> Vec<i64> {
        let max_links = self.m * 2;
        let mut links = node.neighbors.clone();
        links.push(new_id);
        if links.len() <= max_links {
            return links;
        }

        let mut scored: Vec<(i64, f32)> = links
            .into_iter()
            .filter_map(|l| {
                let v = if l == new_id {
                    new_vec
                } else {
                    self.nodes.get(&l)?.vector.as_slice()
                };
                Some((l, score(self.metric, &node.vector, v)))
            })
            .collect();
        sort_by_score(&mut scored);

        if keep_new {
            if let Some(pos) = scored.iter().position(|(l, _)| *l == new_id) {
                if pos >= max_links {
                    let link = scored.remove(pos);
                    scored.insert(max_links - 1, link);
                }
            }
        }
        scored.truncate(max_links);
        scored.into_iter().map(|(l, _)| l).collect()
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ── Private: Brute-Force Search ───────────────────────────────────────────

    fn brute_search(&self, query: &[f32], top_k: usize) -> Vec<(i64, f32)> {
        // min-heap of the best k seen so far
        let mut best: BinaryHeap<Reverse<(OrderedFloat<f32>, i64)>> =
            BinaryHeap::with_capacity(top_k + 1);

        for (id, node) in &self.nodes {
            let s = OrderedFloat(score(self.metric, query, &node.vector));
            if best.len() < top_k {
                best.push(Reverse((s, *id)));
                continue;
            }
            let worst = best.peek().map(|Reverse((w, _))| *w);
            if worst.map_or(false, |w| s > w) {
                best.pop();
                best.push(Reverse((s, *id)));
            }
        }

        let mut scored: Vec<(i64, f32)> = best
            .into_iter()
            .map(|Reverse((s, id))| (id, s.into_inner()))
            .collect();
        sort_by_score(&mut scored);
        scored
    }

    // ── Private: Graph-Based Search (HNSW-lite) ───────────────────────────────

    /// Beam search from the entry node. Stops once the best open candidate
    /// cannot improve the `ef` best found so far.
    fn graph_search(&self, query: &[f32], top_k: usize, ef: usize) -> Vec<(i64, f32)> {
        let entry_id = match self.entry {
            Some(e) => e,
            None => return vec![],
        };
        let entry_node = match self.nodes.get(&entry_id) {
            Some(n) => n,
            None => return vec![],
        };

        let mut visited: HashSet<i64> = HashSet::new();
        // open candidates, best first
        let mut candidates: BinaryHeap<(OrderedFloat<f32>, i64)> = BinaryHeap::new();
        // best `ef` found so far, worst on top
        let mut found: BinaryHeap<Reverse<(OrderedFloat<f32>, i64)>> = BinaryHeap::new();

        let s0 = OrderedFloat(score(self.metric, query, &entry_node.vector));
        visited.insert(entry_id);
        candidates.push((s0, entry_id));
        found.push(Reverse((s0, entry_id)));

        while let Some((cur_score, cur_id)) = candidates.pop() {
            let worst = found.peek().map(|Reverse((w, _))| *w);
            if found.len() >= ef && worst.map_or(false, |w| cur_score < w) {
                break;
            }

            let node = match self.nodes.get(&cur_id) {
                Some(n) => n,
                None => continue,
            };
            for nid in &node.neighbors {
                if !visited.insert(*nid) {
                    continue;
                }
                let n = match self.nodes.get(nid) {
                    Some(n) => n,
                    None => continue,
                };
                let s = OrderedFloat(score(self.metric, query, &n.vector));
                let worst = found.peek().map(|Reverse((w, _))| *w);
                if found.len() < ef || worst.map_or(true, |w| s > w) {
                    candidates.push((s, *nid));
                    found.push(Reverse((s, *nid)));
                    if found.len() > ef {
                        found.pop();
                    }
                }
            }
        }

        let mut results: Vec<(i64, f32)> = found
            .into_iter()
            .map(|Reverse((s, id))| (id, s.into_inner()))
            .collect();
        sort_by_score(&mut results);
        results.truncate(top_k);
        results
    }
}

/// Sort descending by score (higher = better).
fn sort_by_score(scored: &mut [(i64, f32)]) {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
}

// ── Batch Processing ──────────────────────────────────────────────────────────

/// Check a whole insert batch before any row is applied.
///
/// Every row must match `schema`, ids must be unique inside the batch, and
/// `exists` must report false for every id. Returns the ids in batch order.
pub fn validate_batch<F>(
    schema: &CollectionSchema,
    rows: &[Row],
    exists: F,
) -> Result<Vec<i64>, IngestFault>
where
    F: Fn(i64) -> bool,
{
    let mut seen = HashSet::with_capacity(rows.len());
    let mut ids = Vec::with_capacity(rows.len());

    for (position, row) in rows.iter().enumerate() {
        let id = schema.check_row(row, position)?;
        if !seen.insert(id) || exists(id) {
            return Err(IngestFault::DuplicateId { id, position });
        }
        ids.push(id);
    }

    Ok(ids)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaManager, SchemaSpec};
    use crate::Record;

    fn gen_vec(seed: u64, dim: usize) -> Vec<f32> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..dim)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32) / (u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_flat_insert_search() {
        let mut idx = VectorIndex::new(3, IndexKind::Flat, Metric::Cosine);
        idx.insert(1, &[1.0, 0.0, 0.0]);
        idx.insert(2, &[0.0, 1.0, 0.0]);
        idx.insert(3, &[0.0, 0.0, 1.0]);

        let results = idx.search(&[2.0, 0.1, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn test_empty_search() {
        let idx = VectorIndex::new(4, IndexKind::AutoIndex, Metric::Cosine);
        assert!(idx.search(&[1.0, 0.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_wrong_dim_query_returns_nothing() {
        let mut idx = VectorIndex::new(2, IndexKind::Flat, Metric::Cosine);
        idx.insert(1, &[1.0, 0.0]);
        assert!(idx.search(&[1.0, 0.0, 0.0], 1).is_empty());
    }

    #[test]
    fn test_brute_search_keeps_top_k_sorted() {
        let mut idx = VectorIndex::new(8, IndexKind::Flat, Metric::Cosine);
        for i in 0..200 {
            idx.insert(i, &gen_vec(i as u64, 8));
        }
        let results = idx.search(&gen_vec(5, 8), 10);
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].0, 5);
        assert!((results[0].1 - 1.0).abs() < 1e-5);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_hnsw_finds_exact_match_in_large_graph() {
        let mut idx = VectorIndex::new(16, IndexKind::Hnsw, Metric::Cosine);
        for i in 0..(BRUTE_THRESHOLD as i64 + 300) {
            idx.insert(i, &gen_vec(i as u64, 16));
        }
        assert_eq!(idx.len(), BRUTE_THRESHOLD + 300);

        let results = idx.search(&gen_vec(0, 16), 5);
        assert_eq!(results[0].0, 0);
        assert!((results[0].1 - 1.0).abs() < 1e-5);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_hnsw_every_stored_vector_finds_itself() {
        let n = 800i64;
        let mut idx = VectorIndex::new(16, IndexKind::Hnsw, Metric::Cosine);
        for i in 0..n {
            idx.insert(i, &gen_vec(i as u64, 16));
        }

        let hits = (0..n)
            .filter(|&i| {
                idx.search(&gen_vec(i as u64, 16), 5)
                    .first()
                    .map_or(false, |(id, _)| *id == i)
            })
            .count();
        assert!(hits as f64 / n as f64 >= 0.9, "self-recall {}/{}", hits, n);
    }

    #[test]
    fn test_hnsw_links_stay_bounded() {
        let mut idx = VectorIndex::new(8, IndexKind::Hnsw, Metric::Cosine);
        for i in 0..700 {
            idx.insert(i, &gen_vec(i as u64, 8));
        }
        assert!(idx.nodes.values().all(|n| n.neighbors.len() <= idx.m * 2));
    }

    #[test]
    fn test_validate_batch_rejects_whole_batch() {
        let (schema, _) = SchemaManager::define(&SchemaSpec::titles(3)).unwrap();
        let rows: Vec<Row> = vec![
            Record::new(1, "a", vec![1.0, 0.0, 0.0]),
            Record::new(2, "b", vec![0.0, 1.0, 0.0]),
            Record::new(3, "bad", vec![1.0, 2.0]),
        ]
        .iter()
        .map(|r| schema.row_for(r).unwrap())
        .collect();

        let err = validate_batch(&schema, &rows, |_| false).unwrap_err();
        assert!(matches!(err, IngestFault::DimensionMismatch { id: 3, position: 2, .. }));
    }

    #[test]
    fn test_validate_batch_duplicates() {
        let (schema, _) = SchemaManager::define(&SchemaSpec::titles(2)).unwrap();
        let rows: Vec<Row> = vec![
            Record::new(1, "a", vec![1.0, 0.0]),
            Record::new(1, "again", vec![0.0, 1.0]),
        ]
        .iter()
        .map(|r| schema.row_for(r).unwrap())
        .collect();

        let err = validate_batch(&schema, &rows, |_| false).unwrap_err();
        assert_eq!(err, IngestFault::DuplicateId { id: 1, position: 1 });

        let err = validate_batch(&schema, &rows[..1], |id| id == 1).unwrap_err();
        assert_eq!(err, IngestFault::DuplicateId { id: 1, position: 0 });

        assert_eq!(validate_batch(&schema, &rows[..1], |_| false).unwrap(), vec![1]);
    }
}
