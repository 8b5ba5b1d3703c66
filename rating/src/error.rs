//! Error types for the rating calculation subsystem.
//!
//! This module defines a hierarchy of error types following best practices:
//!
//! - [`ConfigError`] - release configuration errors (non-retryable)
//! - [`MappingError`] - answer-table mapping errors
//! - [`EngineError`] - failures reported by a calculation engine instance
//! - [`PoolError`] - instance pool acquisition errors
//! - [`CalculationError`] - top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries. [`CalculationError::kind`]
//! classifies every failure into the taxonomy callers branch on:
//! configuration errors must not be retried, resource errors surface pool
//! exhaustion, and output-validation errors always carry both answer
//! tables as pasteable diagnostics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Diagnostics
// =============================================================================

/// Structured diagnostic payload attached to engine and output-validation
/// failures.
///
/// Entries are ordered key/value strings. For any failure that happens after
/// the answer tables were built, the payload includes both tables rendered
/// as tab-delimited text so the failing calculation can be reproduced by
/// pasting them straight into the workbook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: BTreeMap<String, String>,
}

impl Diagnostics {
    /// Empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, builder-style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Look up an entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Configuration Errors (non-retryable)
// =============================================================================

/// Errors indicating the release configuration itself is broken.
///
/// These are never retried: the same release will fail the same way until
/// it is repaired and re-promoted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No calculation configuration exists for the requested release.
    #[error("no calculation configuration for release '{release_id}' ({app_type}) in {environment}")]
    ReleaseNotFound {
        release_id: String,
        app_type: String,
        environment: String,
    },

    /// The release has no workbook payload in the current environment.
    #[error("workbook payload missing for release '{release_id}' in {environment}")]
    WorkbookMissing {
        release_id: String,
        environment: String,
    },

    /// A repeating question set has no workbook range bound to it.
    #[error("repeating question set '{set_key}' has no workbook range binding")]
    RepeatingRangeMissing { set_key: String },

    /// The engine pool could not be located and recreating it from the
    /// release workbook also failed. Indicates internal inconsistency
    /// between the release cache and the pool registry.
    #[error("engine pool for '{key}' could not be located or recreated: {message}")]
    PoolUnavailable { key: String, message: String },
}

// =============================================================================
// Mapping Errors
// =============================================================================

/// Errors while mapping form answers into positional answer tables.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The form model was not a JSON object.
    #[error("form model is not a JSON object")]
    FormNotObject,

    /// More repeating instances were submitted than the release allows.
    /// Truncating silently would drop user answers, so this is fatal.
    #[error("repeating question set '{set_key}' has {submitted} instances, exceeding the configured maximum of {max}")]
    TooManyInstances {
        set_key: String,
        submitted: usize,
        max: usize,
    },
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Failures reported by a calculation engine instance.
///
/// The engine is an external collaborator; these wrap whatever it reports
/// for the three operations the subsystem drives.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workbook payload was rejected while seeding a new instance.
    #[error("workbook rejected by engine: {0}")]
    WorkbookRejected(String),

    /// A positional write failed.
    #[error("write to {range} failed: {message}")]
    WriteFailed { range: String, message: String },

    /// Applying rating-factor overrides failed.
    #[error("rating factor update failed: {0}")]
    RatingFactorsFailed(String),

    /// Reading the computed output failed.
    #[error("read of {range} failed: {message}")]
    ReadFailed { range: String, message: String },
}

// =============================================================================
// Pool Errors
// =============================================================================

/// Errors from the engine instance pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No instance became free within the bounded wait. Not retried
    /// internally; the caller decides whether to surface or re-queue.
    #[error("engine pool '{key}' exhausted: no instance became free within {waited_ms} ms")]
    Exhausted { key: String, waited_ms: u64 },

    /// Constructing a new instance from the workbook seed failed.
    #[error("failed to construct engine instance: {0}")]
    Build(#[from] EngineError),

    /// The pool was shut down while a caller was waiting.
    #[error("engine pool '{key}' is shut down")]
    Closed { key: String },
}

// =============================================================================
// Output Validation
// =============================================================================

/// How the engine output failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputValidationKind {
    /// A property name was present but its value was missing.
    MissingPropertyValue,
    /// Any other malformation the sanitizer did not repair.
    MalformedJson,
}

impl std::fmt::Display for OutputValidationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingPropertyValue => write!(f, "missing property value"),
            Self::MalformedJson => write!(f, "malformed JSON"),
        }
    }
}

// =============================================================================
// Calculation Errors (top-level)
// =============================================================================

/// Classification of a [`CalculationError`] for caller branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The release is broken; do not retry.
    Configuration,
    /// Pool exhaustion or shutdown; caller decides whether to re-queue.
    Resource,
    /// The engine failed mid-protocol.
    Engine,
    /// The engine produced output that failed validation.
    OutputValidation,
}

/// Top-level calculation orchestration errors.
///
/// This is the main error type returned by
/// [`crate::calculation::CalculationOrchestrator`]. It wraps all
/// lower-level errors and adds protocol-stage context.
#[derive(Debug, Error)]
pub enum CalculationError {
    /// Release configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Answer mapping error.
    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// Pool acquisition error.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// The engine failed during the write/compute/read protocol. Carries
    /// the protocol stage and the answer tables that were in flight.
    #[error("engine failure during {stage}: {source}")]
    Engine {
        stage: &'static str,
        source: EngineError,
        diagnostics: Diagnostics,
    },

    /// The engine output failed the development-environment validation.
    #[error("output validation failed: {kind}: {message}")]
    OutputValidation {
        kind: OutputValidationKind,
        message: String,
        diagnostics: Diagnostics,
    },
}

impl CalculationError {
    /// Classify this error into the caller-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalculationError::Config(_) => ErrorKind::Configuration,
            // An instance-count overflow means the release allows fewer
            // instances than the form collects: release breakage.
            CalculationError::Mapping(MappingError::TooManyInstances { .. }) => {
                ErrorKind::Configuration
            }
            CalculationError::Mapping(MappingError::FormNotObject) => ErrorKind::Configuration,
            CalculationError::Pool(PoolError::Build(_)) => ErrorKind::Configuration,
            CalculationError::Pool(_) => ErrorKind::Resource,
            CalculationError::Engine { .. } => ErrorKind::Engine,
            CalculationError::OutputValidation { .. } => ErrorKind::OutputValidation,
        }
    }

    /// The diagnostic payload, if this failure carries one.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            CalculationError::Engine { diagnostics, .. }
            | CalculationError::OutputValidation { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for configuration lookups.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for mapping operations.
pub type MappingResult<T> = Result<T, MappingError>;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Result type for calculations.
pub type CalcResult<T> = Result<T, CalculationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_chain() {
        // PoolError -> CalculationError
        let pool_err = PoolError::Exhausted {
            key: "acme/home/production/r42/quote".into(),
            waited_ms: 30_000,
        };
        let calc_err: CalculationError = pool_err.into();
        assert_eq!(calc_err.kind(), ErrorKind::Resource);
        assert!(calc_err.to_string().contains("30000 ms"));

        // MappingError -> CalculationError
        let map_err = MappingError::TooManyInstances {
            set_key: "drivers".into(),
            submitted: 7,
            max: 5,
        };
        let calc_err: CalculationError = map_err.into();
        assert_eq!(calc_err.kind(), ErrorKind::Configuration);
        assert!(calc_err.to_string().contains("drivers"));
    }

    #[test]
    fn test_diagnostics_ordering_and_lookup() {
        let diag = Diagnostics::new()
            .with("questionSetAnswers", "Value\n30")
            .with("calculationId", "abc");
        assert_eq!(diag.get("calculationId"), Some("abc"));
        let keys: Vec<&str> = diag.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["calculationId", "questionSetAnswers"]);
    }

    #[test]
    fn test_output_validation_carries_diagnostics() {
        let err = CalculationError::OutputValidation {
            kind: OutputValidationKind::MissingPropertyValue,
            message: "expected value at line 1 column 9".into(),
            diagnostics: Diagnostics::new().with("questionSetAnswers", "Value\n30"),
        };
        assert_eq!(err.kind(), ErrorKind::OutputValidation);
        assert!(err.diagnostics().is_some());
        assert!(err.to_string().contains("missing property value"));
    }
}
