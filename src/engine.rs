//! Orchestration: spec registration, the incident barrier, parallel
//! dispatch, and assembly of the flat output table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::{aggregate_windows, check_nan_fraction, DataQualityError};
use crate::cache::{CacheError, CachedFeature, FeatureCache};
use crate::frame::{Column, Frame, SchemaError};
use crate::incident::resolve_incident_outcome;
use crate::spec::{FeatureSpec, SpecError, VALUE_COL};
use crate::window::{resolve_window, window_duration, EventSeries, LookDirection};

/// Stable join key present in every output and cache artifact.
pub const PREDICTION_TIME_UUID_COL: &str = "prediction_time_uuid";

/// Configuration surface consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenConfig {
    pub id_col_name: String,
    pub timestamp_col_name: String,
    pub n_workers: usize,
    /// Drop prediction times whose window would extend outside the observed
    /// event range for that entity, instead of resolving them to fallback.
    pub drop_pred_times_with_insufficient_look_distance: bool,
}

impl Default for FlattenConfig {
    fn default() -> Self {
        Self {
            id_col_name: "entity_id".to_string(),
            timestamp_col_name: "timestamp".to_string(),
            n_workers: 1,
            drop_pred_times_with_insufficient_look_distance: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlattenError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("two feature specs resolve to the same output column '{col_name}'")]
    DuplicateSpec { col_name: String },
    #[error("duplicate prediction time for entity {entity_id} at {timestamp}")]
    DuplicatePredictionTime {
        entity_id: i64,
        timestamp: DateTime<Utc>,
    },
    #[error(transparent)]
    DataQuality(#[from] DataQualityError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to build worker pool: {0}")]
    PoolBuild(String),
}

/// Flattens per-entity event streams into one wide table aligned to
/// prediction times.
///
/// Construction validates the base table and fixes the prediction-time rows
/// and their uuids for the life of the run; `compute` never mutates the
/// engine and is idempotent against an unchanged cache.
pub struct FlattenEngine {
    config: FlattenConfig,
    entity_ids: Vec<i64>,
    timestamps: Vec<DateTime<Utc>>,
    uuids: Vec<String>,
    specs: Vec<FeatureSpec>,
    cache: Option<Arc<dyn FeatureCache>>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for FlattenEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlattenEngine")
            .field("config", &self.config)
            .field("entity_ids", &self.entity_ids)
            .field("timestamps", &self.timestamps)
            .field("uuids", &self.uuids)
            .field("specs", &self.specs)
            .field("cache", &self.cache.as_ref().map(|_| "<cache>"))
            .finish_non_exhaustive()
    }
}

impl FlattenEngine {
    pub fn new(prediction_times: &Frame, config: FlattenConfig) -> Result<Self, FlattenError> {
        let entity_ids = prediction_times.require_entity_ids(&config.id_col_name)?;
        let timestamps = prediction_times.require_timestamps(&config.timestamp_col_name)?;

        let mut uuids = Vec::with_capacity(entity_ids.len());
        let mut seen = HashSet::with_capacity(entity_ids.len());
        for (&entity_id, &timestamp) in entity_ids.iter().zip(&timestamps) {
            let uuid = prediction_time_uuid(entity_id, timestamp);
            if !seen.insert(uuid.clone()) {
                return Err(FlattenError::DuplicatePredictionTime {
                    entity_id,
                    timestamp,
                });
            }
            uuids.push(uuid);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_workers.max(1))
            .build()
            .map_err(|e| FlattenError::PoolBuild(e.to_string()))?;

        info!(
            component = "flatten_engine",
            event = "engine.init",
            rows = entity_ids.len(),
            n_workers = config.n_workers
        );

        Ok(Self {
            config,
            entity_ids,
            timestamps,
            uuids,
            specs: Vec::new(),
            cache: None,
            pool,
        })
    }

    pub fn with_cache(mut self, cache: impl FeatureCache + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn add_specs(&mut self, specs: Vec<FeatureSpec>) -> Result<(), FlattenError> {
        for spec in specs {
            self.add_spec(spec)?;
        }
        Ok(())
    }

    /// Register one spec. Schema and unique-entity invariants are enforced
    /// here, before any computation is dispatched.
    pub fn add_spec(&mut self, spec: FeatureSpec) -> Result<(), FlattenError> {
        spec.validate_value_dtype()?;

        let source = spec.source_events();
        let source_ids = source.require_entity_ids(&self.config.id_col_name)?;
        source.require_column(VALUE_COL)?;
        if spec.window_days().is_some() {
            source.require_timestamps(&self.config.timestamp_col_name)?;
        }

        // Incident outcomes and static info require at most one row per
        // entity in the source.
        if spec.is_incident_outcome() || matches!(spec, FeatureSpec::Static(_)) {
            let mut seen = HashSet::with_capacity(source_ids.len());
            for entity_id in source_ids {
                if !seen.insert(entity_id) {
                    return Err(SpecError::DuplicateEntity {
                        name: spec.feature_base_name().to_string(),
                        entity_id,
                    }
                    .into());
                }
            }
        }

        let col_name = spec.output_col_name();
        if self.specs.iter().any(|s| s.output_col_name() == col_name) {
            return Err(FlattenError::DuplicateSpec { col_name });
        }

        info!(
            component = "flatten_engine",
            event = "engine.spec_added",
            col_name = %col_name,
            fingerprint = %spec.fingerprint()
        );
        self.specs.push(spec);
        Ok(())
    }

    /// Compute every registered feature and assemble the wide table.
    ///
    /// Incident outcomes run first and shrink the shared row set; remaining
    /// specs run in parallel on the worker pool. Spec-level failures are
    /// collected and surfaced after all dispatched specs finish.
    pub fn compute(&self) -> Result<Frame, FlattenError> {
        info!(
            component = "flatten_engine",
            event = "flatten.compute.start",
            rows = self.entity_ids.len(),
            n_specs = self.specs.len()
        );

        let mut work = WorkingSet {
            entity_ids: self.entity_ids.clone(),
            timestamps: self.timestamps.clone(),
            uuids: self.uuids.clone(),
        };

        let mut features: Vec<Option<CachedFeature>> = vec![None; self.specs.len()];

        // Barrier: incident outcomes shrink the row set shared by every
        // other spec in this run, so they resolve before any dispatch.
        for (idx, spec) in self.specs.iter().enumerate() {
            if spec.is_incident_outcome() {
                let (feature, origin) = self.resolve_incident_spec(spec, &mut work)?;
                log_spec_done(&feature.col_name, origin);
                features[idx] = Some(feature);
            }
        }

        if self.config.drop_pred_times_with_insufficient_look_distance {
            self.drop_insufficient_look_distance(&mut work)?;
        }

        let pending: Vec<usize> = (0..self.specs.len())
            .filter(|&idx| features[idx].is_none())
            .collect();
        let outcomes: Vec<(usize, Result<(CachedFeature, FeatureOrigin), FlattenError>)> =
            self.pool.install(|| {
                pending
                    .par_iter()
                    .map(|&idx| (idx, self.compute_spec(&self.specs[idx], &work)))
                    .collect()
            });

        let mut first_error: Option<FlattenError> = None;
        for (idx, outcome) in outcomes {
            match outcome {
                Ok((feature, origin)) => {
                    log_spec_done(&feature.col_name, origin);
                    features[idx] = Some(feature);
                }
                Err(err) => {
                    warn!(
                        component = "flatten_engine",
                        event = "flatten.spec_failed",
                        col_name = %self.specs[idx].output_col_name(),
                        error = %err
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let mut out = Frame::new();
        out.push_column(
            self.config.id_col_name.clone(),
            Column::Int(work.entity_ids.iter().map(|&v| Some(v)).collect()),
        )?;
        out.push_column(
            self.config.timestamp_col_name.clone(),
            Column::Timestamp(work.timestamps.iter().map(|&v| Some(v)).collect()),
        )?;
        out.push_column(
            PREDICTION_TIME_UUID_COL,
            Column::Text(work.uuids.iter().map(|v| Some(v.clone())).collect()),
        )?;
        for feature in features.into_iter().flatten() {
            let aligned = align_to_rows(&feature, &work.uuids);
            out.push_column(feature.col_name, aligned)?;
        }

        info!(
            component = "flatten_engine",
            event = "flatten.compute.finish",
            rows = out.rows(),
            columns = out.column_names().len()
        );
        Ok(out)
    }

    fn resolve_incident_spec(
        &self,
        spec: &FeatureSpec,
        work: &mut WorkingSet,
    ) -> Result<(CachedFeature, FeatureOrigin), FlattenError> {
        let base_rows = work.len();

        if let Some(cache) = &self.cache {
            if cache.feature_exists(spec, base_rows)? {
                let cached = cache.read_feature(spec)?;
                let kept: HashSet<&str> = cached.uuids.iter().map(String::as_str).collect();
                work.retain(|uuid| kept.contains(uuid));
                return Ok((cached, FeatureOrigin::Cache));
            }
        }

        let FeatureSpec::Outcome(outcome) = spec else {
            unreachable!("incident resolution is only reached for outcome specs");
        };
        let events = EventSeries::from_frame(
            &outcome.source_events,
            &self.config.id_col_name,
            &self.config.timestamp_col_name,
        )?;
        let resolution = resolve_incident_outcome(
            &work.entity_ids,
            &work.timestamps,
            &events,
            outcome.window_days,
            outcome.fallback,
        );

        let col_name = spec.output_col_name();
        check_nan_fraction(&col_name, &resolution.values, outcome.allowed_nan_fraction)?;

        let keep = resolution.keep;
        let kept_uuids: Vec<String> = work
            .uuids
            .iter()
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        work.apply_mask(&keep);

        info!(
            component = "flatten_engine",
            event = "flatten.incident_resolved",
            col_name = %col_name,
            removed_rows = base_rows - work.len()
        );

        let feature = CachedFeature {
            col_name,
            uuids: kept_uuids,
            values: resolution.values,
        };
        if let Some(cache) = &self.cache {
            cache.write_feature(spec, base_rows, &feature)?;
        }
        Ok((feature, FeatureOrigin::Computed))
    }

    /// Remove rows whose window would reach outside the event range
    /// observed for that entity in any temporal spec's source. Entities
    /// absent from a source are left alone; their rows resolve to fallback.
    fn drop_insufficient_look_distance(&self, work: &mut WorkingSet) -> Result<(), FlattenError> {
        let mut keep = vec![true; work.len()];
        for spec in &self.specs {
            let Some(window_days) = spec.window_days() else {
                continue;
            };
            let events = EventSeries::from_frame(
                spec.source_events(),
                &self.config.id_col_name,
                &self.config.timestamp_col_name,
            )?;
            let window = window_duration(window_days);
            let ahead = matches!(spec, FeatureSpec::Outcome(_));

            for (row, (&entity_id, &t)) in
                work.entity_ids.iter().zip(&work.timestamps).enumerate()
            {
                let Some((first, last)) = events.entity_time_range(entity_id) else {
                    continue;
                };
                let out_of_range = if ahead {
                    t + window > last
                } else {
                    t - window < first
                };
                if out_of_range {
                    keep[row] = false;
                }
            }
        }

        let removed = keep.iter().filter(|&&k| !k).count();
        if removed > 0 {
            info!(
                component = "flatten_engine",
                event = "flatten.insufficient_look_distance",
                removed_rows = removed
            );
            work.apply_mask(&keep);
        }
        Ok(())
    }

    fn compute_spec(
        &self,
        spec: &FeatureSpec,
        work: &WorkingSet,
    ) -> Result<(CachedFeature, FeatureOrigin), FlattenError> {
        let base_rows = work.len();
        if let Some(cache) = &self.cache {
            if cache.feature_exists(spec, base_rows)? {
                return Ok((cache.read_feature(spec)?, FeatureOrigin::Cache));
            }
        }

        let col_name = spec.output_col_name();
        let values = match spec {
            FeatureSpec::Static(static_spec) => {
                join_static(&static_spec.source_events, &self.config.id_col_name, work)?
            }
            FeatureSpec::Predictor(p) => {
                let events = EventSeries::from_frame(
                    &p.source_events,
                    &self.config.id_col_name,
                    &self.config.timestamp_col_name,
                )?;
                let matched = resolve_window(
                    &work.entity_ids,
                    &work.timestamps,
                    &events,
                    LookDirection::Behind,
                    p.window_days,
                );
                let values = aggregate_windows(&events, &matched, p.aggregation_fn, p.fallback);
                check_nan_fraction(&col_name, &values, p.allowed_nan_fraction)?;
                values
            }
            FeatureSpec::TextPredictor(t) => {
                let events = EventSeries::from_frame(
                    &t.source_events,
                    &self.config.id_col_name,
                    &self.config.timestamp_col_name,
                )?;
                let matched = resolve_window(
                    &work.entity_ids,
                    &work.timestamps,
                    &events,
                    LookDirection::Behind,
                    t.window_days,
                );
                let values = aggregate_windows(
                    &events,
                    &matched,
                    t.aggregation_fn,
                    crate::spec::Fallback::Nan,
                );
                check_nan_fraction(&col_name, &values, t.allowed_nan_fraction)?;
                values
            }
            FeatureSpec::Outcome(o) => {
                let events = EventSeries::from_frame(
                    &o.source_events,
                    &self.config.id_col_name,
                    &self.config.timestamp_col_name,
                )?;
                let matched = resolve_window(
                    &work.entity_ids,
                    &work.timestamps,
                    &events,
                    LookDirection::Ahead,
                    o.window_days,
                );
                let values = aggregate_windows(&events, &matched, o.aggregation_fn, o.fallback);
                check_nan_fraction(&col_name, &values, o.allowed_nan_fraction)?;
                values
            }
        };

        let feature = CachedFeature {
            col_name,
            uuids: work.uuids.clone(),
            values,
        };
        if let Some(cache) = &self.cache {
            cache.write_feature(spec, base_rows, &feature)?;
        }
        Ok((feature, FeatureOrigin::Computed))
    }
}

/// Where a spec's column came from in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeatureOrigin {
    Cache,
    Computed,
}

impl FeatureOrigin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Computed => "computed",
        }
    }
}

/// Emitted on the coordinating thread so per-spec completion is visible in
/// one place regardless of which worker ran the spec.
fn log_spec_done(col_name: &str, origin: FeatureOrigin) {
    info!(
        component = "flatten_engine",
        event = "flatten.spec_done",
        col_name = %col_name,
        origin = origin.as_str()
    );
}

fn prediction_time_uuid(entity_id: i64, timestamp: DateTime<Utc>) -> String {
    format!("{entity_id}-{}", timestamp.format("%Y-%m-%d-%H-%M-%S"))
}

/// The mutable row set of one compute run. Shrunk only by incident
/// resolution and the look-distance filter, both before parallel dispatch.
struct WorkingSet {
    entity_ids: Vec<i64>,
    timestamps: Vec<DateTime<Utc>>,
    uuids: Vec<String>,
}

impl WorkingSet {
    fn len(&self) -> usize {
        self.entity_ids.len()
    }

    fn apply_mask(&mut self, keep: &[bool]) {
        let mut idx = 0;
        self.entity_ids.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
        let mut idx = 0;
        self.timestamps.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
        let mut idx = 0;
        self.uuids.retain(|_| {
            let k = keep[idx];
            idx += 1;
            k
        });
    }

    fn retain(&mut self, f: impl Fn(&str) -> bool) {
        let keep: Vec<bool> = self.uuids.iter().map(|uuid| f(uuid)).collect();
        self.apply_mask(&keep);
    }
}

/// Static info join: one value per entity replicated across that entity's
/// prediction rows; entities missing from the source get nulls.
fn join_static(source: &Frame, id_col: &str, work: &WorkingSet) -> Result<Column, FlattenError> {
    let source_ids = source.require_entity_ids(id_col)?;
    let values = source.require_column(VALUE_COL)?;

    let index: HashMap<i64, usize> = source_ids
        .iter()
        .enumerate()
        .map(|(idx, &entity_id)| (entity_id, idx))
        .collect();

    let lookup = |entity_id: i64| index.get(&entity_id).copied();
    let column = match values {
        Column::Int(cells) => Column::Int(
            work.entity_ids
                .iter()
                .map(|&e| lookup(e).and_then(|i| cells[i]))
                .collect(),
        ),
        Column::Float(cells) => Column::Float(
            work.entity_ids
                .iter()
                .map(|&e| lookup(e).and_then(|i| cells[i]))
                .collect(),
        ),
        Column::Text(cells) => Column::Text(
            work.entity_ids
                .iter()
                .map(|&e| lookup(e).and_then(|i| cells[i].clone()))
                .collect(),
        ),
        Column::Timestamp(cells) => Column::Timestamp(
            work.entity_ids
                .iter()
                .map(|&e| lookup(e).and_then(|i| cells[i]))
                .collect(),
        ),
    };
    Ok(column)
}

/// Left-join a feature column onto the final row set by uuid. Rows without
/// a matching entry (removed after the feature was computed, or computed
/// before a later shrink) become nulls.
fn align_to_rows(feature: &CachedFeature, final_uuids: &[String]) -> Column {
    let index: HashMap<&str, usize> = feature
        .uuids
        .iter()
        .enumerate()
        .map(|(idx, uuid)| (uuid.as_str(), idx))
        .collect();
    let lookup = |uuid: &str| index.get(uuid).copied();

    match &feature.values {
        Column::Int(cells) => Column::Int(
            final_uuids
                .iter()
                .map(|u| lookup(u).and_then(|i| cells[i]))
                .collect(),
        ),
        Column::Float(cells) => Column::Float(
            final_uuids
                .iter()
                .map(|u| lookup(u).and_then(|i| cells[i]))
                .collect(),
        ),
        Column::Text(cells) => Column::Text(
            final_uuids
                .iter()
                .map(|u| lookup(u).and_then(|i| cells[i].clone()))
                .collect(),
        ),
        Column::Timestamp(cells) => Column::Timestamp(
            final_uuids
                .iter()
                .map(|u| lookup(u).and_then(|i| cells[i]))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_format_matches_the_flat_output_scheme() {
        let t = chrono::NaiveDateTime::parse_from_str("2021-11-05 00:00:00", "%Y-%m-%d %H:%M:%S")
            .expect("valid timestamp")
            .and_utc();
        assert_eq!(prediction_time_uuid(1, t), "1-2021-11-05-00-00-00");
    }

    #[test]
    fn working_set_mask_keeps_rows_aligned() {
        let t = chrono::DateTime::<Utc>::UNIX_EPOCH;
        let mut work = WorkingSet {
            entity_ids: vec![1, 2, 3],
            timestamps: vec![t, t, t],
            uuids: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        };
        work.apply_mask(&[true, false, true]);
        assert_eq!(work.entity_ids, vec![1, 3]);
        assert_eq!(work.uuids, vec!["a".to_string(), "c".to_string()]);
    }
}
