//! Feature specifications and deterministic output-column naming.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::frame::{Column, DType, Frame, SchemaError};

/// Fixed name of the value column in every source-event frame.
pub const VALUE_COL: &str = "value";

pub const DEFAULT_PREDICTOR_PREFIX: &str = "pred";
pub const DEFAULT_OUTCOME_PREFIX: &str = "outc";

/// The aggregation catalogue. An explicit enum rather than a name-to-function
/// registry: every spec carries a concrete aggregation identity from the
/// moment it is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationFn {
    Mean,
    Max,
    Min,
    Sum,
    Count,
    Earliest,
    Latest,
    BoolUnion,
    Concatenate,
}

impl AggregationFn {
    /// Name used in output-column generation and fingerprints.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Earliest => "earliest",
            Self::Latest => "latest",
            Self::BoolUnion => "bool",
            Self::Concatenate => "concatenate",
        }
    }

    pub fn requires_numeric_values(self) -> bool {
        matches!(self, Self::Mean | Self::Max | Self::Min | Self::Sum)
    }

    pub fn requires_text_values(self) -> bool {
        matches!(self, Self::Concatenate)
    }

    /// Whether the aggregated output is a text column.
    pub fn produces_text(self) -> bool {
        matches!(self, Self::Concatenate)
    }
}

/// Value substituted when a window contains no events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Fallback {
    Value(f64),
    Nan,
}

impl Fallback {
    /// Label used in output-column names; integers print without a decimal
    /// point, matching the naming scheme of the flattened output.
    pub fn label(self) -> String {
        match self {
            Self::Value(v) => format_number(v),
            Self::Nan => "nan".to_string(),
        }
    }

    /// The cell this fallback contributes to a float column.
    pub fn as_float_cell(self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(v),
            Self::Nan => None,
        }
    }
}

/// Print a float as an integer when losslessly coercible.
fn format_number(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SpecError {
    #[error("invalid feature spec '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error("source events for '{name}' contain entity {entity_id} more than once, but at most one row per entity is required")]
    DuplicateEntity { name: String, entity_id: i64 },
    #[error("group spec '{name}' expands to an empty product: '{field}' is empty")]
    EmptyGroupProduct { name: String, field: &'static str },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Static per-entity information; one value per entity, no time dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticSpec {
    pub source_events: Frame,
    pub feature_base_name: String,
    pub prefix: String,
}

/// Lookbehind aggregation over a numeric event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorSpec {
    pub source_events: Frame,
    pub feature_base_name: String,
    pub window_days: f64,
    pub aggregation_fn: AggregationFn,
    pub fallback: Fallback,
    pub allowed_nan_fraction: f64,
    pub prefix: String,
}

/// Lookahead aggregation over an outcome event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeSpec {
    pub source_events: Frame,
    pub feature_base_name: String,
    pub window_days: f64,
    pub aggregation_fn: AggregationFn,
    pub fallback: Fallback,
    pub allowed_nan_fraction: f64,
    /// Whether the entity can experience the outcome at most once. Enables
    /// the incident fast path and row removal; requires a unique-entity
    /// source, which is validated before any computation.
    pub incident: bool,
    pub prefix: String,
}

/// Lookbehind concatenation over a text event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPredictorSpec {
    pub source_events: Frame,
    pub feature_base_name: String,
    pub window_days: f64,
    pub aggregation_fn: AggregationFn,
    pub allowed_nan_fraction: f64,
    pub prefix: String,
}

/// One declared feature. Immutable once constructed; every `resolve`-style
/// indirection (aggregation identity, fallback) is already concrete.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureSpec {
    Static(StaticSpec),
    Predictor(PredictorSpec),
    Outcome(OutcomeSpec),
    TextPredictor(TextPredictorSpec),
}

impl FeatureSpec {
    pub fn static_info(spec: StaticSpec) -> Result<Self, SpecError> {
        let spec = Self::Static(spec);
        spec.validate_shape()?;
        Ok(spec)
    }

    pub fn predictor(spec: PredictorSpec) -> Result<Self, SpecError> {
        let spec = Self::Predictor(spec);
        spec.validate_shape()?;
        Ok(spec)
    }

    pub fn outcome(spec: OutcomeSpec) -> Result<Self, SpecError> {
        let spec = Self::Outcome(spec);
        spec.validate_shape()?;
        Ok(spec)
    }

    pub fn text_predictor(spec: TextPredictorSpec) -> Result<Self, SpecError> {
        let spec = Self::TextPredictor(spec);
        spec.validate_shape()?;
        Ok(spec)
    }

    pub fn feature_base_name(&self) -> &str {
        match self {
            Self::Static(s) => &s.feature_base_name,
            Self::Predictor(s) => &s.feature_base_name,
            Self::Outcome(s) => &s.feature_base_name,
            Self::TextPredictor(s) => &s.feature_base_name,
        }
    }

    pub fn prefix(&self) -> &str {
        match self {
            Self::Static(s) => &s.prefix,
            Self::Predictor(s) => &s.prefix,
            Self::Outcome(s) => &s.prefix,
            Self::TextPredictor(s) => &s.prefix,
        }
    }

    pub fn source_events(&self) -> &Frame {
        match self {
            Self::Static(s) => &s.source_events,
            Self::Predictor(s) => &s.source_events,
            Self::Outcome(s) => &s.source_events,
            Self::TextPredictor(s) => &s.source_events,
        }
    }

    pub fn window_days(&self) -> Option<f64> {
        match self {
            Self::Static(_) => None,
            Self::Predictor(s) => Some(s.window_days),
            Self::Outcome(s) => Some(s.window_days),
            Self::TextPredictor(s) => Some(s.window_days),
        }
    }

    pub fn aggregation_fn(&self) -> Option<AggregationFn> {
        match self {
            Self::Static(_) => None,
            Self::Predictor(s) => Some(s.aggregation_fn),
            Self::Outcome(s) => Some(s.aggregation_fn),
            Self::TextPredictor(s) => Some(s.aggregation_fn),
        }
    }

    pub fn fallback(&self) -> Option<Fallback> {
        match self {
            Self::Static(_) => None,
            Self::Predictor(s) => Some(s.fallback),
            Self::Outcome(s) => Some(s.fallback),
            Self::TextPredictor(_) => Some(Fallback::Nan),
        }
    }

    pub fn allowed_nan_fraction(&self) -> Option<f64> {
        match self {
            Self::Static(_) => None,
            Self::Predictor(s) => Some(s.allowed_nan_fraction),
            Self::Outcome(s) => Some(s.allowed_nan_fraction),
            Self::TextPredictor(s) => Some(s.allowed_nan_fraction),
        }
    }

    pub fn is_incident_outcome(&self) -> bool {
        matches!(self, Self::Outcome(s) if s.incident)
    }

    /// Deterministic output column name:
    /// `{prefix}_{base}_within_{window}_days_{agg}_fallback_{fallback}`,
    /// with `_dichotomous` appended for two-level outcomes. Static features
    /// are named `{prefix}_{base}`.
    pub fn output_col_name(&self) -> String {
        match self {
            Self::Static(s) => format!("{}_{}", s.prefix, s.feature_base_name),
            Self::Predictor(s) => temporal_col_name(
                &s.prefix,
                &s.feature_base_name,
                s.window_days,
                s.aggregation_fn,
                s.fallback,
            ),
            Self::TextPredictor(s) => temporal_col_name(
                &s.prefix,
                &s.feature_base_name,
                s.window_days,
                s.aggregation_fn,
                Fallback::Nan,
            ),
            Self::Outcome(s) => {
                let mut name = temporal_col_name(
                    &s.prefix,
                    &s.feature_base_name,
                    s.window_days,
                    s.aggregation_fn,
                    s.fallback,
                );
                if is_dichotomous(&s.source_events) {
                    name.push_str("_dichotomous");
                }
                name
            }
        }
    }

    /// Scalar-field invariants. Frame-schema and unique-entity invariants
    /// need the configured column names and are enforced by the engine at
    /// registration, before any computation.
    fn validate_shape(&self) -> Result<(), SpecError> {
        let name = self.feature_base_name().to_string();
        if name.is_empty() {
            return Err(SpecError::Invalid {
                name,
                reason: "feature_base_name must not be empty".to_string(),
            });
        }
        if self.prefix().is_empty() {
            return Err(SpecError::Invalid {
                name,
                reason: "prefix must not be empty".to_string(),
            });
        }
        if let Some(window) = self.window_days() {
            if !window.is_finite() || window <= 0.0 {
                return Err(SpecError::Invalid {
                    name,
                    reason: format!("window_days must be finite and > 0, got {window}"),
                });
            }
        }
        if let Some(fraction) = self.allowed_nan_fraction() {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(SpecError::Invalid {
                    name,
                    reason: format!("allowed_nan_fraction must be in [0, 1], got {fraction}"),
                });
            }
        }
        if let Some(Fallback::Value(v)) = self.fallback() {
            if !v.is_finite() {
                return Err(SpecError::Invalid {
                    name,
                    reason: "non-finite fallback must use Fallback::Nan".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Aggregation/value-dtype compatibility against the source frame.
    pub fn validate_value_dtype(&self) -> Result<(), SpecError> {
        let Some(agg) = self.aggregation_fn() else {
            return Ok(());
        };
        let name = self.feature_base_name().to_string();
        let values = self.source_events().require_column(VALUE_COL)?;
        let dtype = values.dtype();
        let numeric = matches!(dtype, DType::Int | DType::Float);
        if agg.requires_numeric_values() && !numeric {
            return Err(SpecError::Invalid {
                name,
                reason: format!(
                    "aggregation '{}' requires a numeric value column, got dtype '{}'",
                    agg.name(),
                    dtype.as_str()
                ),
            });
        }
        if agg.requires_text_values() && dtype != DType::Text {
            return Err(SpecError::Invalid {
                name,
                reason: format!(
                    "aggregation '{}' requires a text value column, got dtype '{}'",
                    agg.name(),
                    dtype.as_str()
                ),
            });
        }
        if self.is_incident_outcome() && !numeric {
            return Err(SpecError::Invalid {
                name,
                reason: format!(
                    "incident outcomes require a numeric value column, got dtype '{}'",
                    dtype.as_str()
                ),
            });
        }
        Ok(())
    }

    /// Stable fingerprint over every field that affects the computed column,
    /// including the full content of the source events. Two specs with equal
    /// fingerprints are interchangeable to the engine.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let variant = match self {
            Self::Static(_) => "static",
            Self::Predictor(_) => "predictor",
            Self::Outcome(_) => "outcome",
            Self::TextPredictor(_) => "text_predictor",
        };
        hasher.update(variant.as_bytes());
        hasher.update([b';']);
        hasher.update(self.prefix().as_bytes());
        hasher.update([b';']);
        hasher.update(self.feature_base_name().as_bytes());
        hasher.update([b';']);
        if let Some(window) = self.window_days() {
            hasher.update(window.to_bits().to_le_bytes());
        }
        if let Some(agg) = self.aggregation_fn() {
            hasher.update(agg.name().as_bytes());
        }
        match self.fallback() {
            Some(Fallback::Value(v)) => {
                hasher.update([1u8]);
                hasher.update(v.to_bits().to_le_bytes());
            }
            Some(Fallback::Nan) => hasher.update([2u8]),
            None => hasher.update([0u8]),
        }
        if let Some(fraction) = self.allowed_nan_fraction() {
            hasher.update(fraction.to_bits().to_le_bytes());
        }
        hasher.update([u8::from(self.is_incident_outcome())]);
        hasher.update(self.source_events().content_digest().as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn temporal_col_name(
    prefix: &str,
    base: &str,
    window_days: f64,
    aggregation_fn: AggregationFn,
    fallback: Fallback,
) -> String {
    format!(
        "{prefix}_{base}_within_{}_days_{}_fallback_{}",
        format_number(window_days),
        aggregation_fn.name(),
        fallback.label()
    )
}

/// An outcome with at most two distinct non-null source values.
fn is_dichotomous(source_events: &Frame) -> bool {
    let Some(values) = source_events.column(VALUE_COL) else {
        return false;
    };
    distinct_non_null(values) <= 2
}

fn distinct_non_null(values: &Column) -> usize {
    use std::collections::HashSet;
    match values {
        Column::Int(cells) => cells.iter().flatten().collect::<HashSet<_>>().len(),
        Column::Float(cells) => cells
            .iter()
            .flatten()
            .map(|v| v.to_bits())
            .collect::<HashSet<_>>()
            .len(),
        Column::Text(cells) => cells.iter().flatten().collect::<HashSet<_>>().len(),
        Column::Timestamp(cells) => cells.iter().flatten().collect::<HashSet<_>>().len(),
    }
}

/// Cartesian-product generator for predictor specs. Pure; rejects any empty
/// factor rather than silently expanding to nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorGroupSpec {
    pub source_events: Frame,
    pub feature_base_name: String,
    pub window_days: Vec<f64>,
    pub aggregation_fns: Vec<AggregationFn>,
    pub fallbacks: Vec<Fallback>,
    pub allowed_nan_fractions: Vec<f64>,
    pub prefix: String,
}

impl PredictorGroupSpec {
    pub fn expand(&self) -> Result<Vec<FeatureSpec>, SpecError> {
        check_factor(&self.feature_base_name, "window_days", &self.window_days)?;
        check_factor(
            &self.feature_base_name,
            "aggregation_fns",
            &self.aggregation_fns,
        )?;
        check_factor(&self.feature_base_name, "fallbacks", &self.fallbacks)?;
        check_factor(
            &self.feature_base_name,
            "allowed_nan_fractions",
            &self.allowed_nan_fractions,
        )?;

        let mut out = Vec::new();
        for &window_days in &self.window_days {
            for &aggregation_fn in &self.aggregation_fns {
                for &fallback in &self.fallbacks {
                    for &allowed_nan_fraction in &self.allowed_nan_fractions {
                        out.push(FeatureSpec::predictor(PredictorSpec {
                            source_events: self.source_events.clone(),
                            feature_base_name: self.feature_base_name.clone(),
                            window_days,
                            aggregation_fn,
                            fallback,
                            allowed_nan_fraction,
                            prefix: self.prefix.clone(),
                        })?);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Cartesian-product generator for outcome specs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeGroupSpec {
    pub source_events: Frame,
    pub feature_base_name: String,
    pub window_days: Vec<f64>,
    pub aggregation_fns: Vec<AggregationFn>,
    pub fallbacks: Vec<Fallback>,
    pub allowed_nan_fractions: Vec<f64>,
    pub incident: Vec<bool>,
    pub prefix: String,
}

impl OutcomeGroupSpec {
    pub fn expand(&self) -> Result<Vec<FeatureSpec>, SpecError> {
        check_factor(&self.feature_base_name, "window_days", &self.window_days)?;
        check_factor(
            &self.feature_base_name,
            "aggregation_fns",
            &self.aggregation_fns,
        )?;
        check_factor(&self.feature_base_name, "fallbacks", &self.fallbacks)?;
        check_factor(
            &self.feature_base_name,
            "allowed_nan_fractions",
            &self.allowed_nan_fractions,
        )?;
        check_factor(&self.feature_base_name, "incident", &self.incident)?;

        let mut out = Vec::new();
        for &window_days in &self.window_days {
            for &aggregation_fn in &self.aggregation_fns {
                for &fallback in &self.fallbacks {
                    for &allowed_nan_fraction in &self.allowed_nan_fractions {
                        for &incident in &self.incident {
                            out.push(FeatureSpec::outcome(OutcomeSpec {
                                source_events: self.source_events.clone(),
                                feature_base_name: self.feature_base_name.clone(),
                                window_days,
                                aggregation_fn,
                                fallback,
                                allowed_nan_fraction,
                                incident,
                                prefix: self.prefix.clone(),
                            })?);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn check_factor<T>(name: &str, field: &'static str, factor: &[T]) -> Result<(), SpecError> {
    if factor.is_empty() {
        return Err(SpecError::EmptyGroupProduct {
            name: name.to_string(),
            field,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    fn events(values: Column) -> Frame {
        let n = values.len();
        Frame::new()
            .with_column("entity_id", Column::Int(vec![Some(1); n]))
            .unwrap()
            .with_column(
                "timestamp",
                Column::Timestamp(vec![Some(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH); n]),
            )
            .unwrap()
            .with_column(VALUE_COL, values)
            .unwrap()
    }

    fn predictor(window_days: f64, fallback: Fallback) -> FeatureSpec {
        FeatureSpec::predictor(PredictorSpec {
            source_events: events(Column::Float(vec![Some(1.0)])),
            feature_base_name: "hba1c".to_string(),
            window_days,
            aggregation_fn: AggregationFn::Max,
            fallback,
            allowed_nan_fraction: 0.0,
            prefix: DEFAULT_PREDICTOR_PREFIX.to_string(),
        })
        .expect("valid spec")
    }

    #[test]
    fn temporal_names_coerce_integers_losslessly() {
        assert_eq!(
            predictor(2.0, Fallback::Value(0.0)).output_col_name(),
            "pred_hba1c_within_2_days_max_fallback_0"
        );
        assert_eq!(
            predictor(2.5, Fallback::Nan).output_col_name(),
            "pred_hba1c_within_2.5_days_max_fallback_nan"
        );
    }

    #[test]
    fn outcome_with_two_levels_gains_dichotomous_suffix() {
        let spec = FeatureSpec::outcome(OutcomeSpec {
            source_events: events(Column::Float(vec![Some(1.0), Some(0.0), Some(1.0)])),
            feature_base_name: "t2d".to_string(),
            window_days: 2.0,
            aggregation_fn: AggregationFn::Max,
            fallback: Fallback::Value(0.0),
            allowed_nan_fraction: 0.0,
            incident: false,
            prefix: DEFAULT_OUTCOME_PREFIX.to_string(),
        })
        .expect("valid spec");
        assert_eq!(
            spec.output_col_name(),
            "outc_t2d_within_2_days_max_fallback_0_dichotomous"
        );
    }

    #[test]
    fn outcome_with_many_levels_has_no_suffix() {
        let spec = FeatureSpec::outcome(OutcomeSpec {
            source_events: events(Column::Float(vec![Some(1.0), Some(2.0), Some(3.0)])),
            feature_base_name: "score".to_string(),
            window_days: 2.0,
            aggregation_fn: AggregationFn::Max,
            fallback: Fallback::Value(0.0),
            allowed_nan_fraction: 0.0,
            incident: false,
            prefix: DEFAULT_OUTCOME_PREFIX.to_string(),
        })
        .expect("valid spec");
        assert_eq!(
            spec.output_col_name(),
            "outc_score_within_2_days_max_fallback_0"
        );
    }

    #[test]
    fn invalid_scalars_are_rejected_at_construction() {
        let base = events(Column::Float(vec![Some(1.0)]));
        let err = FeatureSpec::predictor(PredictorSpec {
            source_events: base.clone(),
            feature_base_name: "x".to_string(),
            window_days: 0.0,
            aggregation_fn: AggregationFn::Mean,
            fallback: Fallback::Nan,
            allowed_nan_fraction: 0.0,
            prefix: "pred".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, SpecError::Invalid { .. }));

        let err = FeatureSpec::predictor(PredictorSpec {
            source_events: base,
            feature_base_name: "x".to_string(),
            window_days: 1.0,
            aggregation_fn: AggregationFn::Mean,
            fallback: Fallback::Nan,
            allowed_nan_fraction: 1.5,
            prefix: "pred".to_string(),
        })
        .unwrap_err();
        assert!(matches!(err, SpecError::Invalid { .. }));
    }

    #[test]
    fn numeric_aggregation_over_text_values_is_rejected() {
        let spec = FeatureSpec::predictor(PredictorSpec {
            source_events: events(Column::Text(vec![Some("note".to_string())])),
            feature_base_name: "notes".to_string(),
            window_days: 1.0,
            aggregation_fn: AggregationFn::Mean,
            fallback: Fallback::Nan,
            allowed_nan_fraction: 0.0,
            prefix: "pred".to_string(),
        })
        .expect("scalar shape is valid");
        assert!(matches!(
            spec.validate_value_dtype(),
            Err(SpecError::Invalid { .. })
        ));
    }

    #[test]
    fn group_expansion_is_the_full_product() {
        let group = PredictorGroupSpec {
            source_events: events(Column::Float(vec![Some(1.0)])),
            feature_base_name: "hba1c".to_string(),
            window_days: vec![1.0, 30.0, 365.0],
            aggregation_fns: vec![AggregationFn::Mean, AggregationFn::Max],
            fallbacks: vec![Fallback::Nan],
            allowed_nan_fractions: vec![0.0],
            prefix: "pred".to_string(),
        };
        let specs = group.expand().expect("expansion succeeds");
        assert_eq!(specs.len(), 6);

        let names: std::collections::HashSet<String> =
            specs.iter().map(|s| s.output_col_name()).collect();
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn empty_group_factor_is_rejected() {
        let group = PredictorGroupSpec {
            source_events: events(Column::Float(vec![Some(1.0)])),
            feature_base_name: "hba1c".to_string(),
            window_days: vec![],
            aggregation_fns: vec![AggregationFn::Mean],
            fallbacks: vec![Fallback::Nan],
            allowed_nan_fractions: vec![0.0],
            prefix: "pred".to_string(),
        };
        assert!(matches!(
            group.expand().unwrap_err(),
            SpecError::EmptyGroupProduct {
                field: "window_days",
                ..
            }
        ));
    }

    #[test]
    fn fingerprint_tracks_source_content_not_just_shape() {
        let a = predictor(2.0, Fallback::Nan);
        let b = predictor(2.0, Fallback::Nan);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let changed = FeatureSpec::predictor(PredictorSpec {
            source_events: events(Column::Float(vec![Some(2.0)])),
            feature_base_name: "hba1c".to_string(),
            window_days: 2.0,
            aggregation_fn: AggregationFn::Max,
            fallback: Fallback::Nan,
            allowed_nan_fraction: 0.0,
            prefix: "pred".to_string(),
        })
        .expect("valid spec");
        assert_ne!(a.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn fingerprint_differs_across_every_output_affecting_field() {
        let base = predictor(2.0, Fallback::Nan);
        assert_ne!(
            base.fingerprint(),
            predictor(3.0, Fallback::Nan).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            predictor(2.0, Fallback::Value(0.0)).fingerprint()
        );
    }
}
