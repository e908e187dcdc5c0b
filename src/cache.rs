//! Content-addressed persistence of computed feature columns.
//!
//! Entries are keyed by the spec fingerprint (which covers the source-event
//! contents, not just their shape). Two backends: one CSV artifact + JSON
//! meta sidecar per fingerprint, or a single sqlite file. Both write
//! atomically so a concurrent reader never observes a partial entry.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::frame::{Column, DType};
use crate::spec::FeatureSpec;

pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("no cache entry for fingerprint {fingerprint}")]
    EntryMissing { fingerprint: String },
    #[error("corrupt cache entry for fingerprint {fingerprint}: {reason}")]
    Corrupt { fingerprint: String, reason: String },
}

/// A persisted feature column, keyed row-by-row by `prediction_time_uuid`
/// so the engine can join it back regardless of row removals.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFeature {
    pub col_name: String,
    pub uuids: Vec<String>,
    pub values: Column,
}

/// Persistence contract consumed by the engine. A miss is never an error;
/// it only triggers recomputation.
pub trait FeatureCache: Send + Sync {
    /// Whether a usable entry exists. `expected_base_rows` is the working
    /// table's row count at this spec's point in the run; in validate mode
    /// an entry recorded against a different base is stale and reported as
    /// a miss, forcing recomputation.
    fn feature_exists(
        &self,
        spec: &FeatureSpec,
        expected_base_rows: usize,
    ) -> Result<bool, CacheError>;

    fn read_feature(&self, spec: &FeatureSpec) -> Result<CachedFeature, CacheError>;

    fn write_feature(
        &self,
        spec: &FeatureSpec,
        base_rows: usize,
        feature: &CachedFeature,
    ) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheEntryMeta {
    schema_version: u32,
    fingerprint: String,
    col_name: String,
    dtype: String,
    /// Row count of the working table when the entry was computed.
    base_rows: usize,
    /// Row count of the persisted column (smaller than `base_rows` for
    /// incident outcomes, which shrink the row set).
    artifact_rows: usize,
}

fn dtype_from_tag(fingerprint: &str, tag: &str) -> Result<DType, CacheError> {
    match tag {
        "int" => Ok(DType::Int),
        "float" => Ok(DType::Float),
        "text" => Ok(DType::Text),
        "timestamp" => Ok(DType::Timestamp),
        other => Err(CacheError::Corrupt {
            fingerprint: fingerprint.to_string(),
            reason: format!("unknown dtype tag '{other}'"),
        }),
    }
}

/// Write bytes under a temp name, fsync, then rename into place. Readers
/// either see the previous entry or the complete new one.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| CacheError::Corrupt {
            fingerprint: String::new(),
            reason: format!("invalid cache path: {}", path.display()),
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Disk cache: `<dir>/<fingerprint>.csv` + `<dir>/<fingerprint>.json`.
#[derive(Debug, Clone)]
pub struct DiskFeatureCache {
    dir: PathBuf,
    validate: bool,
}

impl DiskFeatureCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            validate: true,
        })
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.csv"))
    }

    fn meta_path(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    fn read_meta(&self, fingerprint: &str) -> Result<Option<CacheEntryMeta>, CacheError> {
        let path = self.meta_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let meta: CacheEntryMeta = serde_json::from_slice(&bytes)?;
        Ok(Some(meta))
    }
}

impl FeatureCache for DiskFeatureCache {
    fn feature_exists(
        &self,
        spec: &FeatureSpec,
        expected_base_rows: usize,
    ) -> Result<bool, CacheError> {
        let fingerprint = spec.fingerprint();
        let Some(meta) = self.read_meta(&fingerprint)? else {
            return Ok(false);
        };
        if meta.schema_version != CACHE_SCHEMA_VERSION {
            return Ok(false);
        }
        if self.validate && meta.base_rows != expected_base_rows {
            warn!(
                component = "feature_cache",
                event = "cache.stale_entry",
                col_name = %meta.col_name,
                fingerprint = %fingerprint,
                cached_base_rows = meta.base_rows,
                expected_base_rows = expected_base_rows
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn read_feature(&self, spec: &FeatureSpec) -> Result<CachedFeature, CacheError> {
        let fingerprint = spec.fingerprint();
        let meta = self
            .read_meta(&fingerprint)?
            .ok_or_else(|| CacheError::EntryMissing {
                fingerprint: fingerprint.clone(),
            })?;
        let dtype = dtype_from_tag(&fingerprint, &meta.dtype)?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(self.data_path(&fingerprint))?;

        let mut uuids = Vec::with_capacity(meta.artifact_rows);
        let mut cells: Vec<Option<String>> = Vec::with_capacity(meta.artifact_rows);
        for record in reader.records() {
            let record = record?;
            let uuid = record.get(0).unwrap_or_default().to_string();
            let is_null = record.get(1).unwrap_or_default() == "1";
            let raw = record.get(2).unwrap_or_default();
            uuids.push(uuid);
            cells.push(if is_null { None } else { Some(raw.to_string()) });
        }

        if cells.len() != meta.artifact_rows {
            return Err(CacheError::Corrupt {
                fingerprint,
                reason: format!(
                    "artifact has {} rows, meta records {}",
                    cells.len(),
                    meta.artifact_rows
                ),
            });
        }

        let values = parse_cells(&fingerprint, dtype, &cells)?;
        info!(
            component = "feature_cache",
            event = "cache.hit",
            backend = "disk",
            col_name = %meta.col_name,
            fingerprint = %fingerprint,
            rows = meta.artifact_rows
        );
        Ok(CachedFeature {
            col_name: meta.col_name,
            uuids,
            values,
        })
    }

    fn write_feature(
        &self,
        spec: &FeatureSpec,
        base_rows: usize,
        feature: &CachedFeature,
    ) -> Result<(), CacheError> {
        let fingerprint = spec.fingerprint();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["prediction_time_uuid", "is_null", "value"])?;
        for (uuid, cell) in feature.uuids.iter().zip(render_cells(&feature.values)) {
            match cell {
                Some(raw) => writer.write_record([uuid.as_str(), "0", raw.as_str()])?,
                None => writer.write_record([uuid.as_str(), "1", ""])?,
            }
        }
        let data = writer
            .into_inner()
            .map_err(|e| CacheError::Corrupt {
                fingerprint: fingerprint.clone(),
                reason: format!("CSV buffer error: {e}"),
            })?;

        let meta = CacheEntryMeta {
            schema_version: CACHE_SCHEMA_VERSION,
            fingerprint: fingerprint.clone(),
            col_name: feature.col_name.clone(),
            dtype: feature.values.dtype().as_str().to_string(),
            base_rows,
            artifact_rows: feature.uuids.len(),
        };

        // Data first, meta last: an entry is visible only once complete.
        write_atomic(&self.data_path(&fingerprint), &data)?;
        write_atomic(&self.meta_path(&fingerprint), &serde_json::to_vec_pretty(&meta)?)?;

        info!(
            component = "feature_cache",
            event = "cache.write",
            backend = "disk",
            col_name = %feature.col_name,
            fingerprint = %fingerprint,
            rows = feature.uuids.len()
        );
        Ok(())
    }
}

fn render_cells(values: &Column) -> Vec<Option<String>> {
    match values {
        Column::Int(cells) => cells.iter().map(|c| c.map(|v| v.to_string())).collect(),
        // Shortest-round-trip float formatting; parses back bit-exactly.
        Column::Float(cells) => cells.iter().map(|c| c.map(|v| format!("{v}"))).collect(),
        Column::Text(cells) => cells.clone(),
        Column::Timestamp(cells) => cells
            .iter()
            .map(|c| c.map(|v| v.timestamp_micros().to_string()))
            .collect(),
    }
}

fn parse_cells(
    fingerprint: &str,
    dtype: DType,
    cells: &[Option<String>],
) -> Result<Column, CacheError> {
    let corrupt = |raw: &str| CacheError::Corrupt {
        fingerprint: fingerprint.to_string(),
        reason: format!("unparseable cell '{raw}' for dtype '{}'", dtype.as_str()),
    };
    match dtype {
        DType::Int => {
            let mut out = Vec::with_capacity(cells.len());
            for cell in cells {
                out.push(match cell {
                    Some(raw) => Some(raw.parse::<i64>().map_err(|_| corrupt(raw))?),
                    None => None,
                });
            }
            Ok(Column::Int(out))
        }
        DType::Float => {
            let mut out = Vec::with_capacity(cells.len());
            for cell in cells {
                out.push(match cell {
                    Some(raw) => Some(raw.parse::<f64>().map_err(|_| corrupt(raw))?),
                    None => None,
                });
            }
            Ok(Column::Float(out))
        }
        DType::Text => Ok(Column::Text(cells.to_vec())),
        DType::Timestamp => {
            let mut out = Vec::with_capacity(cells.len());
            for cell in cells {
                out.push(match cell {
                    Some(raw) => {
                        let micros = raw.parse::<i64>().map_err(|_| corrupt(raw))?;
                        Some(
                            chrono::DateTime::from_timestamp_micros(micros)
                                .ok_or_else(|| corrupt(raw))?,
                        )
                    }
                    None => None,
                });
            }
            Ok(Column::Timestamp(out))
        }
    }
}

/// Sqlite cache: every entry in one database file, written transactionally.
#[derive(Debug, Clone)]
pub struct SqliteFeatureCache {
    path: PathBuf,
    validate: bool,
}

impl SqliteFeatureCache {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let cache = Self {
            path,
            validate: true,
        };
        let conn = cache.open()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS feature_meta (
                fingerprint TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                col_name TEXT NOT NULL,
                dtype TEXT NOT NULL,
                base_rows INTEGER NOT NULL,
                artifact_rows INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS feature_cells (
                fingerprint TEXT NOT NULL,
                row_idx INTEGER NOT NULL,
                prediction_time_uuid TEXT NOT NULL,
                int_value INTEGER,
                float_value REAL,
                text_value TEXT,
                ts_micros INTEGER,
                PRIMARY KEY (fingerprint, row_idx)
            ) WITHOUT ROWID;
            ",
        )?;
        Ok(cache)
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    fn open(&self) -> Result<Connection, CacheError> {
        Ok(Connection::open(&self.path)?)
    }

    fn read_meta(
        &self,
        conn: &Connection,
        fingerprint: &str,
    ) -> Result<Option<CacheEntryMeta>, CacheError> {
        let meta = conn
            .query_row(
                "
                SELECT schema_version, col_name, dtype, base_rows, artifact_rows
                FROM feature_meta
                WHERE fingerprint = ?1
                ",
                params![fingerprint],
                |row| {
                    Ok(CacheEntryMeta {
                        schema_version: row.get(0)?,
                        fingerprint: fingerprint.to_string(),
                        col_name: row.get(1)?,
                        dtype: row.get(2)?,
                        base_rows: row.get::<_, i64>(3)? as usize,
                        artifact_rows: row.get::<_, i64>(4)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }
}

impl FeatureCache for SqliteFeatureCache {
    fn feature_exists(
        &self,
        spec: &FeatureSpec,
        expected_base_rows: usize,
    ) -> Result<bool, CacheError> {
        let fingerprint = spec.fingerprint();
        let conn = self.open()?;
        let Some(meta) = self.read_meta(&conn, &fingerprint)? else {
            return Ok(false);
        };
        if meta.schema_version != CACHE_SCHEMA_VERSION {
            return Ok(false);
        }
        if self.validate && meta.base_rows != expected_base_rows {
            warn!(
                component = "feature_cache",
                event = "cache.stale_entry",
                col_name = %meta.col_name,
                fingerprint = %fingerprint,
                cached_base_rows = meta.base_rows,
                expected_base_rows = expected_base_rows
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn read_feature(&self, spec: &FeatureSpec) -> Result<CachedFeature, CacheError> {
        let fingerprint = spec.fingerprint();
        let conn = self.open()?;
        let meta = self
            .read_meta(&conn, &fingerprint)?
            .ok_or_else(|| CacheError::EntryMissing {
                fingerprint: fingerprint.clone(),
            })?;
        let dtype = dtype_from_tag(&fingerprint, &meta.dtype)?;

        let mut stmt = conn.prepare(
            "
            SELECT prediction_time_uuid, int_value, float_value, text_value, ts_micros
            FROM feature_cells
            WHERE fingerprint = ?1
            ORDER BY row_idx ASC
            ",
        )?;
        let mut rows = stmt.query(params![fingerprint])?;

        let mut uuids = Vec::with_capacity(meta.artifact_rows);
        let mut ints = Vec::new();
        let mut floats = Vec::new();
        let mut texts = Vec::new();
        let mut timestamps = Vec::new();
        while let Some(row) = rows.next()? {
            uuids.push(row.get::<_, String>(0)?);
            match dtype {
                DType::Int => ints.push(row.get::<_, Option<i64>>(1)?),
                DType::Float => floats.push(row.get::<_, Option<f64>>(2)?),
                DType::Text => texts.push(row.get::<_, Option<String>>(3)?),
                DType::Timestamp => {
                    let micros = row.get::<_, Option<i64>>(4)?;
                    timestamps.push(match micros {
                        Some(m) => Some(chrono::DateTime::from_timestamp_micros(m).ok_or_else(
                            || CacheError::Corrupt {
                                fingerprint: fingerprint.clone(),
                                reason: format!("invalid timestamp micros {m}"),
                            },
                        )?),
                        None => None,
                    });
                }
            }
        }

        let values = match dtype {
            DType::Int => Column::Int(ints),
            DType::Float => Column::Float(floats),
            DType::Text => Column::Text(texts),
            DType::Timestamp => Column::Timestamp(timestamps),
        };
        if uuids.len() != meta.artifact_rows {
            return Err(CacheError::Corrupt {
                fingerprint,
                reason: format!(
                    "entry has {} rows, meta records {}",
                    uuids.len(),
                    meta.artifact_rows
                ),
            });
        }

        info!(
            component = "feature_cache",
            event = "cache.hit",
            backend = "sqlite",
            col_name = %meta.col_name,
            fingerprint = %fingerprint,
            rows = meta.artifact_rows
        );
        Ok(CachedFeature {
            col_name: meta.col_name,
            uuids,
            values,
        })
    }

    fn write_feature(
        &self,
        spec: &FeatureSpec,
        base_rows: usize,
        feature: &CachedFeature,
    ) -> Result<(), CacheError> {
        let fingerprint = spec.fingerprint();
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM feature_cells WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        tx.execute(
            "DELETE FROM feature_meta WHERE fingerprint = ?1",
            params![fingerprint],
        )?;
        tx.execute(
            "
            INSERT INTO feature_meta (
                fingerprint, schema_version, col_name, dtype, base_rows, artifact_rows
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                fingerprint,
                CACHE_SCHEMA_VERSION,
                feature.col_name,
                feature.values.dtype().as_str(),
                base_rows as i64,
                feature.uuids.len() as i64
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO feature_cells (
                    fingerprint, row_idx, prediction_time_uuid,
                    int_value, float_value, text_value, ts_micros
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
            )?;
            for (row_idx, uuid) in feature.uuids.iter().enumerate() {
                let (int_value, float_value, text_value, ts_micros) = match &feature.values {
                    Column::Int(cells) => (cells[row_idx], None, None, None),
                    Column::Float(cells) => (None, cells[row_idx], None, None),
                    Column::Text(cells) => (None, None, cells[row_idx].clone(), None),
                    Column::Timestamp(cells) => {
                        (None, None, None, cells[row_idx].map(|v| v.timestamp_micros()))
                    }
                };
                stmt.execute(params![
                    fingerprint,
                    row_idx as i64,
                    uuid,
                    int_value,
                    float_value,
                    text_value,
                    ts_micros
                ])?;
            }
        }

        tx.commit()?;
        info!(
            component = "feature_cache",
            event = "cache.write",
            backend = "sqlite",
            col_name = %feature.col_name,
            fingerprint = %fingerprint,
            rows = feature.uuids.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{AggregationFn, Fallback, PredictorSpec};
    use tempfile::tempdir;

    fn spec() -> FeatureSpec {
        let frame = crate::frame::Frame::new()
            .with_column("entity_id", Column::Int(vec![Some(1)]))
            .unwrap()
            .with_column(
                "timestamp",
                Column::Timestamp(vec![Some(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)]),
            )
            .unwrap()
            .with_column(crate::spec::VALUE_COL, Column::Float(vec![Some(1.0)]))
            .unwrap();
        FeatureSpec::predictor(PredictorSpec {
            source_events: frame,
            feature_base_name: "hba1c".to_string(),
            window_days: 2.0,
            aggregation_fn: AggregationFn::Mean,
            fallback: Fallback::Nan,
            allowed_nan_fraction: 1.0,
            prefix: "pred".to_string(),
        })
        .expect("valid spec")
    }

    fn feature() -> CachedFeature {
        CachedFeature {
            col_name: "pred_hba1c_within_2_days_mean_fallback_nan".to_string(),
            uuids: vec![
                "1-2021-12-31-00-00-00".to_string(),
                "2-2021-12-31-00-00-00".to_string(),
            ],
            // 0.1 exercises shortest-round-trip float formatting.
            values: Column::Float(vec![Some(0.1), None]),
        }
    }

    #[test]
    fn disk_round_trips_values_and_null_markers() {
        let dir = tempdir().expect("temp dir");
        let cache = DiskFeatureCache::new(dir.path()).expect("cache init");
        let spec = spec();

        assert!(!cache.feature_exists(&spec, 2).expect("exists check"));
        cache.write_feature(&spec, 2, &feature()).expect("write");
        assert!(cache.feature_exists(&spec, 2).expect("exists check"));

        let read = cache.read_feature(&spec).expect("read");
        assert_eq!(read, feature());
    }

    #[test]
    fn disk_stale_base_rows_is_a_miss_in_validate_mode() {
        let dir = tempdir().expect("temp dir");
        let cache = DiskFeatureCache::new(dir.path()).expect("cache init");
        let spec = spec();
        cache.write_feature(&spec, 2, &feature()).expect("write");

        assert!(!cache.feature_exists(&spec, 3).expect("exists check"));
        let lax = DiskFeatureCache::new(dir.path())
            .expect("cache init")
            .with_validation(false);
        assert!(lax.feature_exists(&spec, 3).expect("exists check"));
    }

    #[test]
    fn sqlite_round_trips_values_and_null_markers() {
        let dir = tempdir().expect("temp dir");
        let cache =
            SqliteFeatureCache::new(dir.path().join("cache.sqlite")).expect("cache init");
        let spec = spec();

        assert!(!cache.feature_exists(&spec, 2).expect("exists check"));
        cache.write_feature(&spec, 2, &feature()).expect("write");
        assert!(cache.feature_exists(&spec, 2).expect("exists check"));

        let read = cache.read_feature(&spec).expect("read");
        assert_eq!(read, feature());
    }

    #[test]
    fn sqlite_rewrite_replaces_the_entry() {
        let dir = tempdir().expect("temp dir");
        let cache =
            SqliteFeatureCache::new(dir.path().join("cache.sqlite")).expect("cache init");
        let spec = spec();
        cache.write_feature(&spec, 2, &feature()).expect("write");

        let mut updated = feature();
        updated.values = Column::Float(vec![Some(9.5), Some(2.25)]);
        cache.write_feature(&spec, 2, &updated).expect("rewrite");

        let read = cache.read_feature(&spec).expect("read");
        assert_eq!(read, updated);
    }

    #[test]
    fn text_columns_keep_empty_string_distinct_from_null() {
        let dir = tempdir().expect("temp dir");
        let cache = DiskFeatureCache::new(dir.path()).expect("cache init");
        let spec = spec();
        let text = CachedFeature {
            col_name: "pred_notes".to_string(),
            uuids: vec!["1-a".to_string(), "2-b".to_string()],
            values: Column::Text(vec![Some(String::new()), None]),
        };
        cache.write_feature(&spec, 2, &text).expect("write");
        let read = cache.read_feature(&spec).expect("read");
        assert_eq!(read.values, Column::Text(vec![Some(String::new()), None]));
    }
}
