//! # Rating Engine - pooled workbook calculations for quotes and claims
//!
//! The platform's premiums and claim amounts are computed by an external
//! spreadsheet-based engine that is expensive to build, stateful, and
//! addressed positionally by sheet/row coordinates. This crate is the
//! subsystem that makes that engine usable from a task-parallel service:
//!
//! ```text
//! ┌────────────┐     ┌──────────────┐     ┌──────────────┐     ┌────────────┐
//! │ Form JSON  │────▶│   Mappers    │────▶│ EngineLease  │────▶│ Output     │
//! │ (answers)  │     │ (positional  │     │ (exclusive,  │     │ (repaired, │
//! │            │     │  tables)     │     │  pooled)     │     │  validated)│
//! └────────────┘     └──────────────┘     └──────────────┘     └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rating_engine::{
//!     CalculationInput, CalculationOrchestrator, PoolConfig, PoolRegistry,
//!     ReleaseContext, Environment,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(PoolRegistry::new(engine_factory, PoolConfig::from_env()));
//!     let orchestrator = CalculationOrchestrator::new(release_store, registry);
//!
//!     let ctx = ReleaseContext::new("acme", "home", Environment::Production, "r42");
//!     let outcome = orchestrator
//!         .quote_calculation(&ctx, CalculationInput::from_form(form_json))
//!         .await
//!         .unwrap();
//!     println!("premium from release {}: {}", outcome.release_id, outcome.calculation_json);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`error`] - Hierarchical error types and diagnostics payloads
//! - [`model`] - Release-owned field metadata and the configuration seam
//! - [`table`] - Positional answer tables
//! - [`mapping`] - Form JSON → answer table mappers
//! - [`engine`] - The external calculation engine seam
//! - [`pool`] - Exclusive instance pooling and the keyed pool registry
//! - [`calculation`] - End-to-end orchestration
//! - [`sanitize`] - Engine output repair
//! - [`validation`] - Development-environment output validation
//! - [`logs`] - Calculation event broadcasting

// Core modules
pub mod error;
pub mod model;

// Answer tables & mapping
pub mod mapping;
pub mod table;

// Engine seam & pooling
pub mod engine;
pub mod pool;

// Orchestration
pub mod calculation;

// Output handling
pub mod sanitize;
pub mod validation;

// Eventing
pub mod logs;

// =============================================================================
// Re-exports - Error types
// =============================================================================

pub use error::{
    CalcResult, CalculationError, ConfigError, Diagnostics, EngineError, ErrorKind, MappingError,
    OutputValidationKind, PoolError,
};

// =============================================================================
// Re-exports - Model
// =============================================================================

pub use model::{
    AppType, CalculationConfig, CellLocation, DataStoringField, DataType, Environment, Field,
    OtherField, QuestionSet, RangeRef, ReleaseContext, ReleaseStore, RepeatingField,
    RepeatingQuestionSet, HEADING_ROW_OFFSET,
};

// =============================================================================
// Re-exports - Tables & Mapping
// =============================================================================

pub use mapping::{map_question_sets, map_repeating_set};
pub use table::AnswerTable;

// =============================================================================
// Re-exports - Engine & Pool
// =============================================================================

pub use engine::{CalculationEngine, EngineFactory};
pub use pool::{EngineLease, EnginePool, PoolConfig, PoolKey, PoolRegistry, PoolStats};

// =============================================================================
// Re-exports - Calculation
// =============================================================================

pub use calculation::{CalculationInput, CalculationOrchestrator, CalculationOutcome};

// =============================================================================
// Re-exports - Output handling
// =============================================================================

pub use sanitize::sanitize_output;
pub use validation::{check_well_formed, is_well_formed};

// =============================================================================
// Re-exports - Logs
// =============================================================================

pub use logs::{log_error, log_info, log_success, log_warning, LogBroadcaster, LogEntry, LogLevel};
