//! Domain model for the rating calculation subsystem.
//!
//! This module contains the release-owned metadata the mappers and the
//! orchestrator consume:
//!
//! - [`Field`] - closed union of field kinds (DataStoring, Repeating, Other)
//! - [`QuestionSet`] / [`RepeatingQuestionSet`] - ordered field groups
//! - [`CellLocation`] - workbook (sheet, row) coordinates of a field
//! - [`ReleaseContext`] / [`AppType`] / [`Environment`] - calculation scope
//! - [`CalculationConfig`] - everything one release needs to calculate
//! - [`ReleaseStore`] - the configuration provider seam
//!
//! All of it is immutable once a release is built; the provider hands out
//! shared snapshots and the mappers never modify them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigResult;

/// Number of heading rows above the first answer row in every workbook.
///
/// Row N (N >= 1) of an answer table lands on workbook row
/// `HEADING_ROW_OFFSET + N`.
pub const HEADING_ROW_OFFSET: u32 = 4;

// =============================================================================
// Calculation Scope
// =============================================================================

/// Which calculation a workbook instance performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppType {
    Quote,
    Claim,
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppType::Quote => write!(f, "quote"),
            AppType::Claim => write!(f, "claim"),
        }
    }
}

/// Deployment environment a release is promoted to.
///
/// Output validation only runs in `Development`; the other environments
/// skip it for throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Identifies the release a calculation runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseContext {
    pub tenant_id: String,
    pub product_id: String,
    pub environment: Environment,
    pub release_id: String,
}

impl ReleaseContext {
    pub fn new(
        tenant_id: impl Into<String>,
        product_id: impl Into<String>,
        environment: Environment,
        release_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            product_id: product_id.into(),
            environment,
            release_id: release_id.into(),
        }
    }
}

// =============================================================================
// Field Metadata
// =============================================================================

/// Data type a field stores, deciding its default answer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    String,
    Number,
    Date,
}

impl DataType {
    /// The value written when the form carries no usable answer:
    /// `false` for booleans, the empty string for everything else.
    pub fn default_value(&self) -> Value {
        match self {
            DataType::Boolean => Value::Bool(false),
            _ => Value::String(String::new()),
        }
    }
}

/// Workbook coordinates of a field's answer cell.
///
/// Sheets and rows are addressed positionally; the workbook has no named
/// cells for answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellLocation {
    pub sheet_index: u32,
    pub row_index: u32,
}

impl CellLocation {
    pub fn new(sheet_index: u32, row_index: u32) -> Self {
        Self {
            sheet_index,
            row_index,
        }
    }

    /// Composite ordering key: `sheet_index * 100000 + row_index`.
    ///
    /// Fields without a location order with key 0, before everything
    /// located. That matches the workbook layouts releases are authored
    /// against; the mapper warns when it sees a location-less data field.
    pub fn sort_key(location: Option<&CellLocation>) -> u64 {
        match location {
            Some(loc) => u64::from(loc.sheet_index) * 100_000 + u64::from(loc.row_index),
            None => 0,
        }
    }
}

/// A field that stores one answer at a workbook location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoringField {
    pub key: String,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<CellLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl DataStoringField {
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        Self {
            key: key.into(),
            data_type,
            location: None,
            displayable: None,
            required: None,
        }
    }

    /// Place the field at a workbook cell, builder-style.
    pub fn at(mut self, sheet_index: u32, row_index: u32) -> Self {
        self.location = Some(CellLocation::new(sheet_index, row_index));
        self
    }

    /// Mark the field as required within its group.
    pub fn required(mut self) -> Self {
        self.required = Some(true);
        self
    }

    fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }
}

/// A field summarizing whether a repeating group is completely filled in.
///
/// Its answer cell receives `"complete"` or `"incomplete"`; the group's
/// per-instance answers are written separately through
/// [`crate::mapping::map_repeating_set`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatingField {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<CellLocation>,
    pub question_set: RepeatingQuestionSet,
}

impl RepeatingField {
    pub fn new(key: impl Into<String>, question_set: RepeatingQuestionSet) -> Self {
        Self {
            key: key.into(),
            location: None,
            question_set,
        }
    }

    pub fn at(mut self, sheet_index: u32, row_index: u32) -> Self {
        self.location = Some(CellLocation::new(sheet_index, row_index));
        self
    }
}

/// A field with no workbook presence (display-only, derived, etc.).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtherField {
    pub key: String,
    pub data_type: DataType,
}

/// Closed union of field kinds.
///
/// Matched exhaustively everywhere; adding a kind is a compile-visible
/// change rather than a runtime type test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Field {
    DataStoring(DataStoringField),
    Repeating(RepeatingField),
    Other(OtherField),
}

impl Field {
    /// The form-model key this field's answer lives under.
    pub fn key(&self) -> &str {
        match self {
            Field::DataStoring(f) => &f.key,
            Field::Repeating(f) => &f.key,
            Field::Other(f) => &f.key,
        }
    }

    /// The workbook location, if the field has one.
    pub fn location(&self) -> Option<&CellLocation> {
        match self {
            Field::DataStoring(f) => f.location.as_ref(),
            Field::Repeating(f) => f.location.as_ref(),
            Field::Other(_) => None,
        }
    }

    /// Composite ordering key (see [`CellLocation::sort_key`]).
    pub fn sort_key(&self) -> u64 {
        CellLocation::sort_key(self.location())
    }

    /// Whether an answer must be present for an instance to count as
    /// complete. Only data-storing fields can be required.
    pub fn is_required(&self) -> bool {
        match self {
            Field::DataStoring(f) => f.is_required(),
            Field::Repeating(_) | Field::Other(_) => false,
        }
    }
}

// =============================================================================
// Question Sets
// =============================================================================

/// An ordered group of fields answered once per form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSet {
    pub key: String,
    pub fields: Vec<Field>,
}

impl QuestionSet {
    pub fn new(key: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

/// An ordered group of fields repeated once per user-added instance.
///
/// `max_quantity` is the workbook's column budget for the group; a form
/// submitting more instances than this is a configuration error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatingQuestionSet {
    pub key: String,
    pub fields: Vec<Field>,
    pub max_quantity: usize,
}

impl RepeatingQuestionSet {
    pub fn new(key: impl Into<String>, fields: Vec<Field>, max_quantity: usize) -> Self {
        Self {
            key: key.into(),
            fields,
            max_quantity,
        }
    }
}

// =============================================================================
// Workbook Ranges & Calculation Configuration
// =============================================================================

/// Names one writable or readable range inside the workbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRef {
    pub worksheet: String,
    pub table: String,
    pub column: String,
}

impl RangeRef {
    pub fn new(
        worksheet: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self {
            worksheet: worksheet.into(),
            table: table.into(),
            column: column.into(),
        }
    }
}

impl std::fmt::Display for RangeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}!{}[{}]", self.worksheet, self.table, self.column)
    }
}

/// Everything one (release, app type) needs to run a calculation.
///
/// Built by the release pipeline when a release is promoted; immutable
/// afterwards. The workbook payload seeds the engine pool for this key.
#[derive(Debug, Clone)]
pub struct CalculationConfig {
    /// Ordered question sets whose answers go into the single-column
    /// answer range.
    pub question_sets: Vec<QuestionSet>,
    /// Where simple answers are written.
    pub answer_range: RangeRef,
    /// Where each repeating set's column-per-instance table is written,
    /// keyed by the repeating set key.
    pub repeating_ranges: HashMap<String, RangeRef>,
    /// Where the computed output is read from.
    pub output_range: RangeRef,
    /// The workbook binary for this release and app type.
    pub workbook: Vec<u8>,
}

impl CalculationConfig {
    /// All repeating fields across the question sets, in declaration order.
    pub fn repeating_fields(&self) -> impl Iterator<Item = &RepeatingField> {
        self.question_sets.iter().flat_map(|qs| {
            qs.fields.iter().filter_map(|f| match f {
                Field::Repeating(rf) => Some(rf),
                _ => None,
            })
        })
    }
}

/// Release configuration provider seam.
///
/// The platform's release cache implements this; tests use an in-memory
/// store. Lookups are cheap (configurations are cached snapshots), so the
/// trait stays synchronous.
pub trait ReleaseStore: Send + Sync {
    /// The calculation configuration for a release and app type.
    fn calculation_config(
        &self,
        ctx: &ReleaseContext,
        app_type: AppType,
    ) -> ConfigResult<Arc<CalculationConfig>>;
}
