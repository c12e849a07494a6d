// VecShelf — schema.rs
// Collection schema, index specs and row shape checks.
// Author: d65v <https://github.com/d65v>

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::embedding::Metric;
use crate::{IngestFault, Record, Result, ShelfError};

/// Longest VARCHAR a collection may declare.
pub const MAX_VARCHAR_LENGTH: usize = 65_535;

// ── Field Types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int64,
    VarChar { max_length: usize },
    FloatVector { dim: usize },
}

impl FieldType {
    pub fn is_vector(&self) -> bool {
        matches!(self, FieldType::FloatVector { .. })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int64 => write!(f, "INT64"),
            FieldType::VarChar { max_length } => write!(f, "VARCHAR({})", max_length),
            FieldType::FloatVector { dim } => write!(f, "FLOAT_VECTOR({})", dim),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub is_primary: bool,
}

/// A single cell value in a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int64(i64),
    VarChar(String),
    FloatVector(Vec<f32>),
}

/// One row keyed by field name, the shape the backend stores.
pub type Row = BTreeMap<String, FieldValue>;

// ── Collection Schema ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub fields: Vec<FieldSchema>,
    /// Primary keys are always caller-supplied.
    pub auto_id: bool,
    /// Accept fields not named in the schema and keep them with the row.
    pub enable_dynamic_field: bool,
}

impl CollectionSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary)
    }

    pub fn vector_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.field_type.is_vector())
    }

    pub fn label_field(&self) -> Option<&FieldSchema> {
        self.fields
            .iter()
            .find(|f| matches!(f.field_type, FieldType::VarChar { .. }))
    }

    /// Declared vector width, 0 when the schema has no vector field.
    pub fn dim(&self) -> usize {
        match self.vector_field().map(|f| f.field_type) {
            Some(FieldType::FloatVector { dim }) => dim,
            _ => 0,
        }
    }

    pub fn label_max_length(&self) -> usize {
        match self.label_field().map(|f| f.field_type) {
            Some(FieldType::VarChar { max_length }) => max_length,
            _ => 0,
        }
    }

    /// Lay a record out as a row of this schema.
    ///
    /// # Errors
    /// Returns `ShelfError::Schema` if the schema lacks a key, label or vector field.
    pub fn row_for(&self, record: &Record) -> Result<Row> {
        let (pk, label, vector) = self.core_fields()?;
        let mut row = Row::new();
        row.insert(pk.to_string(), FieldValue::Int64(record.id));
        row.insert(label.to_string(), FieldValue::VarChar(record.label.clone()));
        row.insert(vector.to_string(), FieldValue::FloatVector(record.vector.clone()));
        Ok(row)
    }

    /// Check one row against the schema, returning its primary key.
    pub fn check_row(&self, row: &Row, position: usize) -> std::result::Result<i64, IngestFault> {
        let malformed = |reason: String| IngestFault::Malformed { position, reason };

        let pk_field = self
            .primary_field()
            .ok_or_else(|| malformed("schema has no primary field".into()))?;
        let id = match row.get(&pk_field.name) {
            Some(FieldValue::Int64(id)) => *id,
            Some(_) => return Err(malformed(format!("'{}' must be INT64", pk_field.name))),
            None => return Err(malformed(format!("missing primary field '{}'", pk_field.name))),
        };
        if id < 0 {
            return Err(IngestFault::NegativeId { id, position });
        }

        for field in &self.fields {
            let value = row
                .get(&field.name)
                .ok_or_else(|| malformed(format!("missing field '{}'", field.name)))?;
            match (field.field_type, value) {
                (FieldType::Int64, FieldValue::Int64(_)) => {}
                (FieldType::VarChar { max_length }, FieldValue::VarChar(text)) => {
                    if text.len() > max_length {
                        return Err(IngestFault::LabelTooLong {
                            id,
                            position,
                            len: text.len(),
                            max: max_length,
                        });
                    }
                }
                (FieldType::FloatVector { dim }, FieldValue::FloatVector(v)) => {
                    if v.len() != dim {
                        return Err(IngestFault::DimensionMismatch {
                            id,
                            position,
                            expected: dim,
                            got: v.len(),
                        });
                    }
                    if v.iter().any(|x| !x.is_finite()) {
                        return Err(malformed(format!("'{}' contains NaN/Inf", field.name)));
                    }
                }
                (expected, _) => {
                    return Err(malformed(format!(
                        "'{}' must be {}",
                        field.name, expected
                    )))
                }
            }
        }

        if !self.enable_dynamic_field {
            if let Some(extra) = row.keys().find(|k| self.field(k).is_none()) {
                return Err(malformed(format!("unknown field '{}'", extra)));
            }
        }

        Ok(id)
    }

    fn core_fields(&self) -> Result<(&str, &str, &str)> {
        let pk = self
            .primary_field()
            .ok_or_else(|| ShelfError::Schema("no primary field".into()))?;
        let label = self
            .label_field()
            .ok_or_else(|| ShelfError::Schema("no VARCHAR label field".into()))?;
        let vector = self
            .vector_field()
            .ok_or_else(|| ShelfError::Schema("no FLOAT_VECTOR field".into()))?;
        Ok((&pk.name, &label.name, &vector.name))
    }
}

// ── Index Specs ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Backend picks; exact search for vectors in the local backend
    AutoIndex,
    /// Exhaustive scan
    Flat,
    /// Graph-based approximate search
    Hnsw,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexKind::AutoIndex => "AUTOINDEX",
            IndexKind::Flat => "FLAT",
            IndexKind::Hnsw => "HNSW",
        })
    }
}

impl FromStr for IndexKind {
    type Err = ShelfError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "autoindex" | "auto" => Ok(IndexKind::AutoIndex),
            "flat" => Ok(IndexKind::Flat),
            "hnsw" => Ok(IndexKind::Hnsw),
            other => Err(ShelfError::Config(format!("unknown index type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub field_name: String,
    pub kind: IndexKind,
    /// Only vector indexes carry a metric.
    pub metric: Option<Metric>,
}

impl IndexSpec {
    pub fn scalar(field_name: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            kind: IndexKind::AutoIndex,
            metric: None,
        }
    }

    pub fn vector(field_name: &str, kind: IndexKind, metric: Metric) -> Self {
        Self {
            field_name: field_name.to_string(),
            kind,
            metric: Some(metric),
        }
    }
}

// ── Schema Manager ────────────────────────────────────────────────────────────

/// Inputs for the three-field title schema.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    pub primary_field: String,
    pub label_field: String,
    pub label_max_length: usize,
    pub vector_field: String,
    pub dim: usize,
    pub metric: Metric,
    pub vector_index: IndexKind,
}

impl SchemaSpec {
    /// Field names used by the title catalog, for a given vector width.
    pub fn titles(dim: usize) -> Self {
        Self {
            primary_field: "anime_index".to_string(),
            label_field: "anime_name".to_string(),
            label_max_length: 512,
            vector_field: "embedding".to_string(),
            dim,
            metric: Metric::Cosine,
            vector_index: IndexKind::AutoIndex,
        }
    }
}

pub struct SchemaManager;

impl SchemaManager {
    /// Build the schema and one index spec per field.
    ///
    /// # Errors
    /// Returns `ShelfError::Schema` for a zero width, a bad label length or
    /// clashing field names.
    pub fn define(spec: &SchemaSpec) -> Result<(CollectionSchema, Vec<IndexSpec>)> {
        let schema = CollectionSchema {
            fields: vec![
                FieldSchema {
                    name: spec.primary_field.clone(),
                    field_type: FieldType::Int64,
                    is_primary: true,
                },
                FieldSchema {
                    name: spec.label_field.clone(),
                    field_type: FieldType::VarChar {
                        max_length: spec.label_max_length,
                    },
                    is_primary: false,
                },
                FieldSchema {
                    name: spec.vector_field.clone(),
                    field_type: FieldType::FloatVector { dim: spec.dim },
                    is_primary: false,
                },
            ],
            auto_id: false,
            enable_dynamic_field: false,
        };

        let indexes = vec![
            IndexSpec::scalar(&spec.primary_field),
            IndexSpec::scalar(&spec.label_field),
            IndexSpec::vector(&spec.vector_field, spec.vector_index, spec.metric),
        ];

        Self::validate(&schema, &indexes)?;
        log::debug!(
            "schema defined: {} fields, dim={}, metric={}",
            schema.fields.len(),
            spec.dim,
            spec.metric
        );
        Ok((schema, indexes))
    }

    /// Check a schema and its index specs for consistency.
    ///
    /// # Errors
    /// Returns `ShelfError::Schema` describing the first problem found.
    pub fn validate(schema: &CollectionSchema, indexes: &[IndexSpec]) -> Result<()> {
        let err = |msg: String| Err(ShelfError::Schema(msg));

        if schema.auto_id {
            return err("auto_id is not supported: ids are caller-supplied".into());
        }

        let mut names = HashSet::new();
        for field in &schema.fields {
            if field.name.trim().is_empty() {
                return err("field names must not be empty".into());
            }
            if !names.insert(field.name.as_str()) {
                return err(format!("duplicate field '{}'", field.name));
            }
            match field.field_type {
                FieldType::FloatVector { dim: 0 } => {
                    return err(format!("vector field '{}' must have dim > 0", field.name))
                }
                FieldType::VarChar { max_length }
                    if max_length == 0 || max_length > MAX_VARCHAR_LENGTH =>
                {
                    return err(format!(
                        "VARCHAR field '{}' max_length must be in 1..={}",
                        field.name, MAX_VARCHAR_LENGTH
                    ))
                }
                _ => {}
            }
        }

        let primaries: Vec<_> = schema.fields.iter().filter(|f| f.is_primary).collect();
        match primaries.as_slice() {
            [pk] if pk.field_type == FieldType::Int64 => {}
            [pk] => return err(format!("primary field '{}' must be INT64", pk.name)),
            [] => return err("schema needs a primary field".into()),
            _ => return err("schema allows exactly one primary field".into()),
        }

        let vectors = schema.fields.iter().filter(|f| f.field_type.is_vector()).count();
        if vectors != 1 {
            return err(format!("schema needs exactly one FLOAT_VECTOR field, found {}", vectors));
        }

        let mut indexed = HashSet::new();
        for index in indexes {
            let field = match schema.field(&index.field_name) {
                Some(f) => f,
                None => return err(format!("index on unknown field '{}'", index.field_name)),
            };
            if !indexed.insert(index.field_name.as_str()) {
                return err(format!("field '{}' indexed twice", index.field_name));
            }
            match (field.field_type.is_vector(), index.metric) {
                (true, None) => {
                    return err(format!("vector index on '{}' needs a metric", field.name))
                }
                (false, Some(m)) => {
                    return err(format!(
                        "scalar index on '{}' cannot carry metric {}",
                        field.name, m
                    ))
                }
                (false, None) if index.kind == IndexKind::Hnsw => {
                    return err(format!(
                        "HNSW index requires a vector field, '{}' is {}",
                        field.name, field.field_type
                    ))
                }
                _ => {}
            }
        }

        let vector_name = schema.vector_field().map(|f| f.name.as_str());
        if !indexes.iter().any(|i| Some(i.field_name.as_str()) == vector_name) {
            return err("vector field must be indexed".into());
        }

        Ok(())
    }

    /// Metric of the vector index, if one is declared.
    pub fn vector_metric(schema: &CollectionSchema, indexes: &[IndexSpec]) -> Option<Metric> {
        let vector = schema.vector_field()?;
        indexes
            .iter()
            .find(|i| i.field_name == vector.name)
            .and_then(|i| i.metric)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_titles_schema() {
        let (schema, indexes) = SchemaManager::define(&SchemaSpec::titles(4)).unwrap();
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.dim(), 4);
        assert_eq!(schema.label_max_length(), 512);
        assert_eq!(schema.primary_field().unwrap().name, "anime_index");
        assert!(!schema.auto_id);
        assert_eq!(indexes.len(), 3);
        assert_eq!(SchemaManager::vector_metric(&schema, &indexes), Some(Metric::Cosine));
        assert!(indexes[0].metric.is_none());
        assert!(indexes[1].metric.is_none());
    }

    #[test]
    fn test_zero_dim_rejected() {
        let err = SchemaManager::define(&SchemaSpec::titles(0)).unwrap_err();
        assert!(matches!(err, ShelfError::Schema(_)));
    }

    #[test]
    fn test_non_numeric_vector_field_rejected() {
        let (mut schema, indexes) = SchemaManager::define(&SchemaSpec::titles(4)).unwrap();
        schema.fields[2].field_type = FieldType::VarChar { max_length: 16 };
        assert!(SchemaManager::validate(&schema, &indexes).is_err());
    }

    #[test]
    fn test_metric_on_scalar_index_rejected() {
        let (schema, mut indexes) = SchemaManager::define(&SchemaSpec::titles(4)).unwrap();
        indexes[1].metric = Some(Metric::Cosine);
        assert!(SchemaManager::validate(&schema, &indexes).is_err());
    }

    #[test]
    fn test_clashing_field_names_rejected() {
        let mut spec = SchemaSpec::titles(4);
        spec.label_field = spec.primary_field.clone();
        assert!(SchemaManager::define(&spec).is_err());
    }

    #[test]
    fn test_check_row_reports_each_fault() {
        let (schema, _) = SchemaManager::define(&SchemaSpec::titles(3)).unwrap();

        let ok = schema.row_for(&Record::new(1, "a", vec![0.1, 0.2, 0.3])).unwrap();
        assert_eq!(schema.check_row(&ok, 0), Ok(1));

        let short = schema.row_for(&Record::new(2, "b", vec![0.1])).unwrap();
        assert!(matches!(
            schema.check_row(&short, 5),
            Err(IngestFault::DimensionMismatch { id: 2, position: 5, expected: 3, got: 1 })
        ));

        let long = schema
            .row_for(&Record::new(3, "x".repeat(513), vec![0.0; 3]))
            .unwrap();
        assert!(matches!(
            schema.check_row(&long, 0),
            Err(IngestFault::LabelTooLong { len: 513, max: 512, .. })
        ));

        let negative = schema.row_for(&Record::new(-1, "n", vec![0.0; 3])).unwrap();
        assert!(matches!(
            schema.check_row(&negative, 0),
            Err(IngestFault::NegativeId { id: -1, .. })
        ));

        let mut extra = ok.clone();
        extra.insert("genre".into(), FieldValue::VarChar("mecha".into()));
        assert!(matches!(
            schema.check_row(&extra, 0),
            Err(IngestFault::Malformed { .. })
        ));
    }

    #[test]
    fn test_extra_keys_follow_dynamic_field_flag() {
        let (mut schema, _) = SchemaManager::define(&SchemaSpec::titles(2)).unwrap();
        assert!(!schema.enable_dynamic_field);

        let mut row = schema.row_for(&Record::new(4, "Kanon", vec![0.1, 0.2])).unwrap();
        row.insert("year".into(), FieldValue::Int64(2006));
        assert!(matches!(
            schema.check_row(&row, 0),
            Err(IngestFault::Malformed { position: 0, .. })
        ));

        schema.enable_dynamic_field = true;
        assert_eq!(schema.check_row(&row, 0), Ok(4));
    }

    #[test]
    fn test_index_kind_parse() {
        assert_eq!("HNSW".parse::<IndexKind>().unwrap(), IndexKind::Hnsw);
        assert_eq!("autoindex".parse::<IndexKind>().unwrap(), IndexKind::AutoIndex);
        assert!("ivf".parse::<IndexKind>().is_err());
    }
}
