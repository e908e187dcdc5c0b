//! Minimal typed tabular containers shared by every resolver.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Runtime type of a [`Column`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Int,
    Float,
    Text,
    Timestamp,
}

impl DType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }
}

/// A single named column's cells. `None` is the null marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Timestamp(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Int(_) => DType::Int,
            Self::Float(_) => DType::Float,
            Self::Text(_) => DType::Text,
            Self::Timestamp(_) => DType::Timestamp,
        }
    }

    pub fn null_count(&self) -> usize {
        match self {
            Self::Int(v) => v.iter().filter(|c| c.is_none()).count(),
            Self::Float(v) => v.iter().filter(|c| c.is_none()).count(),
            Self::Text(v) => v.iter().filter(|c| c.is_none()).count(),
            Self::Timestamp(v) => v.iter().filter(|c| c.is_none()).count(),
        }
    }

    fn digest_into(&self, hasher: &mut Sha256) {
        hasher.update(self.dtype().as_str().as_bytes());
        match self {
            Self::Int(v) => {
                for cell in v {
                    match cell {
                        Some(x) => {
                            hasher.update([1u8]);
                            hasher.update(x.to_le_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            Self::Float(v) => {
                for cell in v {
                    match cell {
                        Some(x) => {
                            hasher.update([1u8]);
                            hasher.update(x.to_bits().to_le_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            Self::Text(v) => {
                for cell in v {
                    match cell {
                        Some(x) => {
                            hasher.update([1u8]);
                            hasher.update((x.len() as u64).to_le_bytes());
                            hasher.update(x.as_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
            Self::Timestamp(v) => {
                for cell in v {
                    match cell {
                        Some(x) => {
                            hasher.update([1u8]);
                            hasher.update(x.timestamp_micros().to_le_bytes());
                        }
                        None => hasher.update([0u8]),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("required column '{column}' is missing; available columns: {available:?}")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },
    #[error("column '{column}' must be a temporal column, got dtype '{}'", .actual.as_str())]
    NotTemporal { column: String, actual: DType },
    #[error("column '{column}' must be an integer entity-id column, got dtype '{}'", .actual.as_str())]
    NotEntityId { column: String, actual: DType },
    #[error("column '{column}' has unsupported dtype '{}' for event values", .actual.as_str())]
    UnsupportedValueDType { column: String, actual: DType },
    #[error("column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("column '{column}' contains a null at row {row}, which is not allowed for key columns")]
    NullKey { column: String, row: usize },
}

/// A small ordered collection of equally long named columns.
///
/// This is not a general dataframe; it carries exactly the structure the
/// flattening engine needs and validates dtypes at the boundaries where
/// loaders hand data in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    columns: Vec<(String, Column)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column append. Fails on length mismatch with columns
    /// already present.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<Self, SchemaError> {
        self.push_column(name, column)?;
        Ok(self)
    }

    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<(), SchemaError> {
        let name = name.into();
        if let Some((_, first)) = self.columns.first() {
            if first.len() != column.len() {
                return Err(SchemaError::LengthMismatch {
                    column: name,
                    expected: first.len(),
                    actual: column.len(),
                });
            }
        }
        self.columns.push((name, column));
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map(|(_, c)| c.len()).unwrap_or(0)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, SchemaError> {
        self.column(name).ok_or_else(|| SchemaError::MissingColumn {
            column: name.to_string(),
            available: self.column_names(),
        })
    }

    /// Fetch a timestamp column, rejecting non-null-free cells and any
    /// non-temporal dtype masquerading as a date.
    pub fn require_timestamps(&self, name: &str) -> Result<Vec<DateTime<Utc>>, SchemaError> {
        match self.require_column(name)? {
            Column::Timestamp(cells) => collect_non_null(name, cells),
            other => Err(SchemaError::NotTemporal {
                column: name.to_string(),
                actual: other.dtype(),
            }),
        }
    }

    /// Fetch an entity-id column; ids must be integers with no nulls.
    pub fn require_entity_ids(&self, name: &str) -> Result<Vec<i64>, SchemaError> {
        match self.require_column(name)? {
            Column::Int(cells) => collect_non_null(name, cells),
            other => Err(SchemaError::NotEntityId {
                column: name.to_string(),
                actual: other.dtype(),
            }),
        }
    }

    /// Stable digest over every cell of every column, in column order.
    ///
    /// Used as the source-identity part of feature fingerprints so that a
    /// silently replaced dataset never produces a false cache hit.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.columns.len() as u64).to_le_bytes());
        for (name, column) in &self.columns {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((column.len() as u64).to_le_bytes());
            column.digest_into(&mut hasher);
        }
        hex::encode(hasher.finalize())
    }
}

fn collect_non_null<T: Clone>(name: &str, cells: &[Option<T>]) -> Result<Vec<T>, SchemaError> {
    let mut out = Vec::with_capacity(cells.len());
    for (row, cell) in cells.iter().enumerate() {
        match cell {
            Some(value) => out.push(value.clone()),
            None => {
                return Err(SchemaError::NullKey {
                    column: name.to_string(),
                    row,
                })
            }
        }
    }
    Ok(out)
}
