//! tsflat: flattens irregular per-entity event streams into one wide table
//! aligned to prediction times, for use as machine-learning features.
//!
//! For each (entity, prediction-time) pair and each declared feature spec,
//! the engine finds the events inside a lookbehind or lookahead window,
//! aggregates them, substitutes a fallback when nothing qualifies, and
//! joins every resulting column onto the base table by a stable row uuid.
//! Computed columns are persisted in a fingerprint-keyed cache so repeated
//! runs with unchanged specs are free.

mod aggregate;
mod cache;
mod engine;
mod frame;
mod incident;
mod observability;
mod spec;
mod window;

pub use aggregate::{aggregate_windows, check_nan_fraction, DataQualityError};
pub use cache::{
    CacheError, CachedFeature, DiskFeatureCache, FeatureCache, SqliteFeatureCache,
    CACHE_SCHEMA_VERSION,
};
pub use engine::{FlattenConfig, FlattenEngine, FlattenError, PREDICTION_TIME_UUID_COL};
pub use frame::{Column, DType, Frame, SchemaError};
pub use incident::{resolve_incident_outcome, IncidentResolution};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use spec::{
    AggregationFn, Fallback, FeatureSpec, OutcomeGroupSpec, OutcomeSpec, PredictorGroupSpec,
    PredictorSpec, SpecError, StaticSpec, TextPredictorSpec, DEFAULT_OUTCOME_PREFIX,
    DEFAULT_PREDICTOR_PREFIX, VALUE_COL,
};
pub use window::{resolve_window, window_duration, EventSeries, EventValue, LookDirection};
