//! Incident-outcome fast path: earliest-occurrence resolution and
//! prediction-time removal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::frame::Column;
use crate::spec::Fallback;
use crate::window::{window_duration, EventSeries, EventValue};

/// Result of resolving one incident outcome against the current prediction
/// rows.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentResolution {
    /// Mask over the input prediction rows; `false` rows occur at or after
    /// the entity's outcome and must leave the working table entirely.
    pub keep: Vec<bool>,
    /// Outcome column aligned to the kept rows, in input order.
    pub values: Column,
}

impl IncidentResolution {
    pub fn removed_rows(&self) -> usize {
        self.keep.iter().filter(|&&k| !k).count()
    }
}

/// Resolve an outcome that each entity can experience at most once.
///
/// A single comparison against the entity's outcome time replaces the full
/// interval join: prediction times at or after the outcome are removed
/// (the entity has already graduated), earlier ones inside the lookahead
/// window get the outcome value, the rest get the fallback. Entities with
/// no outcome keep all rows with the fallback.
///
/// The unique-entity invariant of the source is validated at spec
/// registration; this resolver relies on it.
pub fn resolve_incident_outcome(
    pred_entity_ids: &[i64],
    pred_timestamps: &[DateTime<Utc>],
    events: &EventSeries,
    window_days: f64,
    fallback: Fallback,
) -> IncidentResolution {
    let mut outcome_by_entity: HashMap<i64, (DateTime<Utc>, Option<f64>)> =
        HashMap::with_capacity(events.len());
    for (idx, &entity_id) in events.entity_ids.iter().enumerate() {
        let value = match events.values[idx] {
            Some(EventValue::Float(v)) if !v.is_nan() => Some(v),
            _ => None,
        };
        outcome_by_entity.insert(entity_id, (events.timestamps[idx], value));
    }

    let window = window_duration(window_days);
    let mut keep = Vec::with_capacity(pred_entity_ids.len());
    let mut cells = Vec::new();

    for (&entity_id, &t_pred) in pred_entity_ids.iter().zip(pred_timestamps) {
        match outcome_by_entity.get(&entity_id) {
            Some(&(t_out, value)) => {
                if t_pred >= t_out {
                    keep.push(false);
                    continue;
                }
                keep.push(true);
                if t_out - t_pred <= window {
                    cells.push(value);
                } else {
                    cells.push(fallback.as_float_cell());
                }
            }
            None => {
                keep.push(true);
                cells.push(fallback.as_float_cell());
            }
        }
    }

    IncidentResolution {
        keep,
        values: Column::Float(cells),
    }
}
