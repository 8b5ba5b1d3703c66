//! Positional answer tables.
//!
//! An [`AnswerTable`] is the unit written into and read out of a workbook
//! range: ordered rows of ordered cells, with row 0 always a header row.
//! Row N (N >= 1) corresponds to workbook row
//! [`HEADING_ROW_OFFSET`](crate::model::HEADING_ROW_OFFSET)` + N`. Tables
//! are built fresh per calculation and discarded after use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An ordered, rectangular-after-padding table of answer cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerTable {
    pub rows: Vec<Vec<Value>>,
}

impl AnswerTable {
    /// A table containing only the given header row.
    pub fn with_header(header: Vec<Value>) -> Self {
        Self { rows: vec![header] }
    }

    /// A single-column table of `height` rows (header included), every
    /// data cell initialized to the empty-string default.
    ///
    /// The no-gaps invariant starts here: rows that no field ends up
    /// touching keep their default.
    pub fn single_column(height: usize) -> Self {
        let mut rows = Vec::with_capacity(height.max(1));
        rows.push(vec![Value::String("Value".to_string())]);
        for _ in 1..height {
            rows.push(vec![Value::String(String::new())]);
        }
        Self { rows }
    }

    /// Number of rows, header included.
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    /// Width of the widest row.
    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Overwrite a single cell. Rows outside the table are ignored; the
    /// caller bounds its writes against the height it asked for.
    pub fn set(&mut self, row: usize, col: usize, value: Value) {
        if let Some(cells) = self.rows.get_mut(row) {
            if col < cells.len() {
                cells[col] = value;
            } else {
                while cells.len() < col {
                    cells.push(Value::String(String::new()));
                }
                cells.push(value);
            }
        }
    }

    /// Append a data row.
    pub fn push_row(&mut self, cells: Vec<Value>) {
        self.rows.push(cells);
    }

    /// Pad every row to exactly `width` cells with empty strings.
    pub fn pad_rows(&mut self, width: usize) {
        for cells in &mut self.rows {
            while cells.len() < width {
                cells.push(Value::String(String::new()));
            }
        }
    }

    /// Render as tab-delimited text, one line per row.
    ///
    /// This is the pasteable form attached to failure diagnostics: drop it
    /// into the workbook's answer range to reproduce a failing calculation
    /// by hand.
    pub fn to_tab_delimited(&self) -> String {
        self.rows
            .iter()
            .map(|cells| {
                cells
                    .iter()
                    .map(cell_text)
                    .collect::<Vec<_>>()
                    .join("\t")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Text form of a cell for tab-delimited rendering. Strings stay raw
/// (no JSON quoting); everything else uses its JSON notation.
fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
