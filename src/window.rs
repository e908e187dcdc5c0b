//! Window selection: per-entity event lookup relative to prediction times.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::frame::{Column, Frame, SchemaError};
use crate::spec::VALUE_COL;

/// Direction of a temporal window relative to a prediction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookDirection {
    /// Predictor windows look behind: events in `(t - w, t)`.
    Behind,
    /// Outcome windows look ahead: events in `(t, t + w]`.
    Ahead,
}

/// A typed event value. Integer source columns are widened to floats.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Float(f64),
    Text(String),
}

/// A validated, entity-indexed view over one source-event frame.
///
/// Construction is the schema boundary: the loader guarantees column
/// presence but not dtypes, so a numeric or string column masquerading as a
/// timestamp fails here with a typed error instead of silently mis-sorting.
#[derive(Debug, Clone)]
pub struct EventSeries {
    pub entity_ids: Vec<i64>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<Option<EventValue>>,
    /// `Float` or `Text` after integer widening.
    pub value_dtype: crate::frame::DType,
    by_entity: HashMap<i64, Vec<usize>>,
}

impl EventSeries {
    pub fn from_frame(frame: &Frame, id_col: &str, ts_col: &str) -> Result<Self, SchemaError> {
        let entity_ids = frame.require_entity_ids(id_col)?;
        let timestamps = frame.require_timestamps(ts_col)?;
        let (value_dtype, values) = extract_values(frame)?;

        let mut by_entity: HashMap<i64, Vec<usize>> = HashMap::new();
        for (idx, &entity_id) in entity_ids.iter().enumerate() {
            by_entity.entry(entity_id).or_default().push(idx);
        }
        for indices in by_entity.values_mut() {
            indices.sort_by_key(|&idx| timestamps[idx]);
        }

        Ok(Self {
            entity_ids,
            timestamps,
            values,
            value_dtype,
            by_entity,
        })
    }

    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    /// First and last event timestamp observed for an entity.
    pub fn entity_time_range(&self, entity_id: i64) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let indices = self.by_entity.get(&entity_id)?;
        let first = self.timestamps[*indices.first()?];
        let last = self.timestamps[*indices.last()?];
        Some((first, last))
    }

    /// Event indices of one entity, ordered by timestamp.
    fn sorted_indices(&self, entity_id: i64) -> Option<&[usize]> {
        self.by_entity.get(&entity_id).map(Vec::as_slice)
    }
}

fn extract_values(
    frame: &Frame,
) -> Result<(crate::frame::DType, Vec<Option<EventValue>>), SchemaError> {
    use crate::frame::DType;
    match frame.require_column(VALUE_COL)? {
        Column::Float(cells) => Ok((
            DType::Float,
            cells.iter().map(|c| c.map(EventValue::Float)).collect(),
        )),
        Column::Int(cells) => Ok((
            DType::Float,
            cells
                .iter()
                .map(|c| c.map(|v| EventValue::Float(v as f64)))
                .collect(),
        )),
        Column::Text(cells) => Ok((
            DType::Text,
            cells.iter().map(|c| c.clone().map(EventValue::Text)).collect(),
        )),
        other => Err(SchemaError::UnsupportedValueDType {
            column: VALUE_COL.to_string(),
            actual: other.dtype(),
        }),
    }
}

/// Fractional days to a millisecond-precision duration.
pub fn window_duration(window_days: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((window_days * 86_400_000.0).round() as i64)
}

/// For each prediction row, the indices of the entity's events inside the
/// window. Rows whose entity is absent from the events, or has nothing in
/// range, get an empty multiset; fallback resolution happens downstream.
///
/// Boundary semantics: an event exactly at `t - w` (behind) or exactly at
/// `t` is excluded; an event exactly at `t + w` (ahead) is included.
pub fn resolve_window(
    pred_entity_ids: &[i64],
    pred_timestamps: &[DateTime<Utc>],
    events: &EventSeries,
    direction: LookDirection,
    window_days: f64,
) -> Vec<Vec<usize>> {
    let window = window_duration(window_days);
    let mut matched = Vec::with_capacity(pred_entity_ids.len());

    for (&entity_id, &t) in pred_entity_ids.iter().zip(pred_timestamps) {
        let Some(indices) = events.sorted_indices(entity_id) else {
            matched.push(Vec::new());
            continue;
        };

        let (start, end) = match direction {
            LookDirection::Behind => {
                let lo = t - window;
                let start = indices.partition_point(|&idx| events.timestamps[idx] <= lo);
                let end = indices.partition_point(|&idx| events.timestamps[idx] < t);
                (start, end)
            }
            LookDirection::Ahead => {
                let hi = t + window;
                let start = indices.partition_point(|&idx| events.timestamps[idx] <= t);
                let end = indices.partition_point(|&idx| events.timestamps[idx] <= hi);
                (start, end)
            }
        };

        matched.push(indices[start..end].to_vec());
    }

    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn ts(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .expect("valid test timestamp")
            .and_utc()
    }

    fn series(rows: &[(i64, &str, f64)]) -> EventSeries {
        let frame = Frame::new()
            .with_column(
                "entity_id",
                Column::Int(rows.iter().map(|r| Some(r.0)).collect()),
            )
            .unwrap()
            .with_column(
                "timestamp",
                Column::Timestamp(rows.iter().map(|r| Some(ts(r.1))).collect()),
            )
            .unwrap()
            .with_column(
                VALUE_COL,
                Column::Float(rows.iter().map(|r| Some(r.2)).collect()),
            )
            .unwrap();
        EventSeries::from_frame(&frame, "entity_id", "timestamp").expect("valid series")
    }

    #[test]
    fn behind_window_excludes_exact_boundary_and_prediction_time() {
        // Window of exactly 2 days behind 2022-01-03 00:00:00.
        let events = series(&[
            (1, "2022-01-01 00:00:00", 1.0), // exactly t - w: excluded
            (1, "2022-01-01 00:00:01", 2.0), // t - w + 1s: included
            (1, "2022-01-02 23:59:59", 3.0), // t - 1s: included
            (1, "2022-01-03 00:00:00", 4.0), // exactly t: excluded
        ]);
        let matched = resolve_window(
            &[1],
            &[ts("2022-01-03 00:00:00")],
            &events,
            LookDirection::Behind,
            2.0,
        );
        assert_eq!(matched, vec![vec![1, 2]]);
    }

    #[test]
    fn ahead_window_excludes_prediction_time_and_includes_far_boundary() {
        let events = series(&[
            (1, "2022-01-03 00:00:00", 1.0), // exactly t: excluded
            (1, "2022-01-03 00:00:01", 2.0), // t + 1s: included
            (1, "2022-01-05 00:00:00", 3.0), // exactly t + w: included
            (1, "2022-01-05 00:00:01", 4.0), // t + w + 1s: excluded
        ]);
        let matched = resolve_window(
            &[1],
            &[ts("2022-01-03 00:00:00")],
            &events,
            LookDirection::Ahead,
            2.0,
        );
        assert_eq!(matched, vec![vec![1, 2]]);
    }

    #[test]
    fn fractional_windows_resolve_to_sub_day_spans() {
        let events = series(&[
            (1, "2022-01-02 11:59:59", 1.0), // 12h + 1s behind: excluded
            (1, "2022-01-02 12:00:01", 2.0), // within half a day: included
        ]);
        let matched = resolve_window(
            &[1],
            &[ts("2022-01-03 00:00:00")],
            &events,
            LookDirection::Behind,
            0.5,
        );
        assert_eq!(matched, vec![vec![1]]);
    }

    #[test]
    fn duplicate_timestamps_match_without_row_blowup() {
        let events = series(&[
            (1, "2022-01-02 00:00:00", 1.0),
            (1, "2022-01-02 00:00:00", 2.0),
        ]);
        let matched = resolve_window(
            &[1, 1],
            &[ts("2022-01-03 00:00:00"), ts("2022-01-03 00:00:00")],
            &events,
            LookDirection::Behind,
            2.0,
        );
        // Two prediction rows at the same time each match both events.
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].len(), 2);
        assert_eq!(matched[1].len(), 2);
    }

    #[test]
    fn absent_entity_yields_empty_multiset() {
        let events = series(&[(7, "2022-01-02 00:00:00", 1.0)]);
        let matched = resolve_window(
            &[1],
            &[ts("2022-01-03 00:00:00")],
            &events,
            LookDirection::Behind,
            2.0,
        );
        assert_eq!(matched, vec![Vec::<usize>::new()]);
    }

    #[test]
    fn non_temporal_timestamp_column_is_a_typed_error() {
        let frame = Frame::new()
            .with_column("entity_id", Column::Int(vec![Some(1)]))
            .unwrap()
            .with_column("timestamp", Column::Float(vec![Some(1_640_995_200.0)]))
            .unwrap()
            .with_column(VALUE_COL, Column::Float(vec![Some(1.0)]))
            .unwrap();
        let err = EventSeries::from_frame(&frame, "entity_id", "timestamp").unwrap_err();
        assert!(matches!(err, SchemaError::NotTemporal { .. }));
    }
}
