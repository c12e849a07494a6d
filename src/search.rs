// VecShelf — search.rs
// Top-K cosine similarity queries returning (id, label, score) hits.
// Author: d65v <https://github.com/d65v>

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::backend::{LoadState, SearchRequest};
use crate::embedding::Metric;
use crate::schema::SchemaManager;
use crate::session::Session;
use crate::{Result, ShelfError};

/// A single search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit {
    pub id: i64,
    pub label: String,
    pub score: f32,
}

impl Hit {
    /// Render as `{"id", "distance", "entity": {<label_field>}}`.
    pub fn to_json(&self, label_field: &str) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "distance": self.score,
            "entity": { label_field: self.label },
        })
    }
}

impl fmt::Display for Hit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id={:<8} score={:.6} label={:?}", self.id, self.score, self.label)
    }
}

pub struct SimilaritySearcher<'s> {
    session: &'s mut Session,
    metric: Metric,
}

impl<'s> SimilaritySearcher<'s> {
    /// Cosine searcher.
    pub fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            metric: Metric::Cosine,
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Up to `k` stored records closest to `query`, best first.
    ///
    /// `query` need not belong to a stored record. Equal scores keep the
    /// backend's order, which callers must not rely on. Scores are
    /// similarities (descending) except under L2, where they are distances
    /// (ascending).
    ///
    /// # Errors
    /// `ShelfError::Query` for `k == 0`, a query of the wrong width or with
    /// NaN/Inf components, a metric other than the index's, or a missing
    /// collection.
    pub fn search(&mut self, collection: &str, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        if k == 0 {
            return Err(ShelfError::query(collection, "k must be at least 1"));
        }
        let exists = self
            .session
            .retrying("has_collection", |b| b.has_collection(collection))?;
        if !exists {
            return Err(ShelfError::query(collection, "collection does not exist"));
        }

        let info = self
            .session
            .retrying("describe_collection", |b| b.describe_collection(collection))?;
        let dim = info.schema.dim();
        if query.len() != dim {
            return Err(ShelfError::query(
                collection,
                format!("query vector has {} components, expected {}", query.len(), dim),
            ));
        }
        if let Some(pos) = query.iter().position(|x| !x.is_finite()) {
            return Err(ShelfError::query(
                collection,
                format!("query component {} is not finite", pos),
            ));
        }
        if let Some(index_metric) = SchemaManager::vector_metric(&info.schema, &info.indexes) {
            if index_metric != self.metric {
                return Err(ShelfError::query(
                    collection,
                    format!("index metric is {}, searcher uses {}", index_metric, self.metric),
                ));
            }
        }

        let vector_field = info
            .schema
            .vector_field()
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let label_field = info
            .schema
            .label_field()
            .map(|f| f.name.clone())
            .unwrap_or_default();

        self.ensure_loaded(collection)?;

        let data = vec![query.to_vec()];
        let output_fields = [label_field.as_str()];
        let request = SearchRequest {
            collection,
            anns_field: &vector_field,
            data: &data,
            limit: k,
            metric: self.metric,
            output_fields: &output_fields,
        };

        let t0 = Instant::now();
        let result = match self.session.retrying("search", |b| b.search(&request)) {
            Err(ShelfError::NotLoaded { .. }) => {
                log::warn!("'{}' not loaded at query time, loading and retrying once", collection);
                self.ensure_loaded(collection)?;
                self.session.retrying("search", |b| b.search(&request))?
            }
            other => other?,
        };

        let mut hits: Vec<Hit> = result
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|h| Hit {
                id: h.id,
                label: h.text(&label_field).unwrap_or_default().to_string(),
                score: h.distance,
            })
            .collect();
        // stable: ties keep backend order
        let metric = self.metric;
        hits.sort_by(|a, b| {
            let (near, far) = if metric.distance_ascending() { (a, b) } else { (b, a) };
            near.score.partial_cmp(&far.score).unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);

        log::info!(
            "search '{}' top-{}: {} hit(s) in {}μs",
            collection,
            k,
            hits.len(),
            t0.elapsed().as_micros()
        );
        Ok(hits)
    }

    fn ensure_loaded(&mut self, collection: &str) -> Result<()> {
        let state = self
            .session
            .retrying("get_load_state", |b| b.get_load_state(collection))?;
        match state {
            LoadState::Loaded => Ok(()),
            LoadState::NotExist => Err(ShelfError::query(collection, "collection does not exist")),
            LoadState::NotLoad | LoadState::Loading => {
                log::info!("loading collection '{}' (was {})", collection, state);
                self.session
                    .retrying("load_collection", |b| b.load_collection(collection))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
