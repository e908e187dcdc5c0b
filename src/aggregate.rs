//! Aggregation of matched event multisets into one value per prediction row.

use thiserror::Error;

use crate::frame::{Column, DType};
use crate::spec::{AggregationFn, Fallback};
use crate::window::{EventSeries, EventValue};

#[derive(Debug, Error, PartialEq)]
pub enum DataQualityError {
    #[error(
        "column '{col_name}': aggregated NaN fraction {actual:.4} exceeds allowed {allowed:.4}"
    )]
    NanFractionExceeded {
        col_name: String,
        actual: f64,
        allowed: f64,
    },
}

/// Reduce the matched multisets from window resolution to one value per
/// prediction row.
///
/// An empty multiset resolves to the fallback without invoking the
/// aggregation function. Null source values are skipped inside a group; a
/// group whose values are all null aggregates to null. `matched` rows are
/// expected in timestamp order (the window resolver's contract), which is
/// what gives `Earliest`/`Latest` and `Concatenate` their meaning.
pub fn aggregate_windows(
    events: &EventSeries,
    matched: &[Vec<usize>],
    aggregation_fn: AggregationFn,
    fallback: Fallback,
) -> Column {
    let text_output = aggregation_fn.produces_text()
        || (matches!(
            aggregation_fn,
            AggregationFn::Earliest | AggregationFn::Latest
        ) && events.value_dtype == DType::Text);

    if text_output {
        let cells = matched
            .iter()
            .map(|rows| {
                if rows.is_empty() {
                    text_fallback(fallback)
                } else {
                    aggregate_text(events, rows, aggregation_fn)
                }
            })
            .collect();
        Column::Text(cells)
    } else {
        let cells = matched
            .iter()
            .map(|rows| {
                if rows.is_empty() {
                    float_fallback(fallback)
                } else {
                    aggregate_floats(events, rows, aggregation_fn)
                }
            })
            .collect();
        Column::Float(cells)
    }
}

/// NaN-rate guard: fail the whole spec when the aggregated column is mostly
/// missing. A guard against silently shipping empty features, not a per-row
/// behavior.
pub fn check_nan_fraction(
    col_name: &str,
    values: &Column,
    allowed: f64,
) -> Result<(), DataQualityError> {
    let rows = values.len();
    if rows == 0 {
        return Ok(());
    }
    let actual = values.null_count() as f64 / rows as f64;
    if actual > allowed {
        return Err(DataQualityError::NanFractionExceeded {
            col_name: col_name.to_string(),
            actual,
            allowed,
        });
    }
    Ok(())
}

fn float_fallback(fallback: Fallback) -> Option<f64> {
    fallback.as_float_cell()
}

fn text_fallback(fallback: Fallback) -> Option<String> {
    match fallback {
        Fallback::Value(v) => Some(Fallback::Value(v).label()),
        Fallback::Nan => None,
    }
}

fn float_at(events: &EventSeries, row: usize) -> Option<f64> {
    match events.values[row] {
        Some(EventValue::Float(v)) if !v.is_nan() => Some(v),
        _ => None,
    }
}

fn text_at(events: &EventSeries, row: usize) -> Option<&str> {
    match &events.values[row] {
        Some(EventValue::Text(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn aggregate_floats(events: &EventSeries, rows: &[usize], agg: AggregationFn) -> Option<f64> {
    match agg {
        AggregationFn::Count => {
            let n = rows.iter().filter(|&&r| float_at(events, r).is_some()).count();
            Some(n as f64)
        }
        AggregationFn::BoolUnion => Some(1.0),
        AggregationFn::Earliest => rows.first().and_then(|&r| float_at(events, r)),
        AggregationFn::Latest => rows.last().and_then(|&r| float_at(events, r)),
        AggregationFn::Mean => {
            let present: Vec<f64> = rows.iter().filter_map(|&r| float_at(events, r)).collect();
            if present.is_empty() {
                None
            } else {
                Some(present.iter().sum::<f64>() / present.len() as f64)
            }
        }
        AggregationFn::Sum => {
            let present: Vec<f64> = rows.iter().filter_map(|&r| float_at(events, r)).collect();
            if present.is_empty() {
                None
            } else {
                Some(present.iter().sum())
            }
        }
        AggregationFn::Max => rows
            .iter()
            .filter_map(|&r| float_at(events, r))
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v)))),
        AggregationFn::Min => rows
            .iter()
            .filter_map(|&r| float_at(events, r))
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.min(v)))),
        AggregationFn::Concatenate => None,
    }
}

fn aggregate_text(events: &EventSeries, rows: &[usize], agg: AggregationFn) -> Option<String> {
    match agg {
        AggregationFn::Concatenate => {
            let parts: Vec<&str> = rows.iter().filter_map(|&r| text_at(events, r)).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        AggregationFn::Earliest => rows
            .first()
            .and_then(|&r| text_at(events, r))
            .map(str::to_string),
        AggregationFn::Latest => rows
            .last()
            .and_then(|&r| text_at(events, r))
            .map(str::to_string),
        _ => None,
    }
}
