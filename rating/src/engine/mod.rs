//! The calculation engine seam.
//!
//! The engine is an external spreadsheet-based component. It is expensive
//! to instantiate, stateful, and not safe for concurrent use, so the
//! subsystem only ever talks to it through an exclusively checked-out
//! [`crate::pool::EngineLease`]. Exactly three operations are consumed;
//! everything else about the engine is out of scope.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::EngineResult;
use crate::table::AnswerTable;

/// One stateful workbook instance.
///
/// Implementations are not reentrant: the pool guarantees a single caller
/// between acquire and release, and that caller drives the fixed
/// write→write→write→read protocol. Cell state is NOT assumed clean
/// between calls; every calculation rewrites all of its ranges.
pub trait CalculationEngine: Send {
    /// Write a positional table into a named range.
    fn patch_data(
        &mut self,
        worksheet: &str,
        table: &str,
        column: &str,
        values: &AnswerTable,
    ) -> EngineResult<()>;

    /// Apply optional rating-factor overrides.
    fn update_additional_rating_factors(
        &mut self,
        factors: &HashMap<String, Value>,
    ) -> EngineResult<()>;

    /// Read the computed output table as raw text.
    fn read_table_text_as_string(&mut self, worksheet: &str, table: &str) -> EngineResult<String>;
}

/// Builds engine instances from a release's workbook payload.
///
/// One factory serves every pool; the workbook bytes passed in decide
/// which release the instance computes for.
pub trait EngineFactory: Send + Sync {
    fn build(&self, workbook: &[u8]) -> EngineResult<Box<dyn CalculationEngine>>;
}
