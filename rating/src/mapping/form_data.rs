//! Simple-field answer mapping.
//!
//! Produces the single-column answer table for all non-repeating fields of
//! a release: every data-storing field's answer (or its type default)
//! lands at table row `row_index - HEADING_ROW_OFFSET`, and every
//! repeating group contributes one toggle cell telling the workbook
//! whether the group is completely filled in.

use serde_json::{Map, Value};

use crate::error::{MappingError, MappingResult};
use crate::logs::log_warning;
use crate::model::{
    CellLocation, DataStoringField, Field, QuestionSet, RepeatingField, HEADING_ROW_OFFSET,
};
use crate::table::AnswerTable;

use super::is_blank;

/// Map a form model onto the simple-field answer table.
///
/// Pure over its inputs: identical (form, metadata) pairs always produce
/// identical tables. Fields are flattened across all question sets and
/// walked in composite-key order; fields without a usable location are
/// skipped with a warning rather than silently dropped.
pub fn map_question_sets(
    question_sets: &[QuestionSet],
    form_model: &Value,
) -> MappingResult<AnswerTable> {
    let form = form_model.as_object().ok_or(MappingError::FormNotObject)?;

    let mut fields: Vec<&Field> = question_sets
        .iter()
        .flat_map(|qs| qs.fields.iter())
        .collect();
    fields.sort_by_key(|f| f.sort_key());

    // Height runs to the last located field in composite order; with no
    // locations at all there is nothing to align to, so fall back to the
    // field count.
    let height = match fields.iter().rev().find_map(|f| f.location()) {
        Some(last) => (last.row_index as usize).saturating_sub(HEADING_ROW_OFFSET as usize) + 1,
        None => fields.len(),
    };

    let mut table = AnswerTable::single_column(height);

    for field in fields {
        match field {
            Field::DataStoring(f) => {
                if let Some(target) = target_row(field.key(), f.location.as_ref(), height) {
                    table.set(target, 0, answer_value(f, form));
                }
            }
            Field::Repeating(f) => {
                if let Some(target) = target_row(field.key(), f.location.as_ref(), height) {
                    table.set(target, 0, Value::String(toggle_state(f, form).to_string()));
                }
            }
            // No workbook presence.
            Field::Other(_) => {}
        }
    }

    Ok(table)
}

/// Table row for a located field, or `None` (with a warning) when the
/// field cannot be placed. Row 0 is the header and never a target.
fn target_row(key: &str, location: Option<&CellLocation>, height: usize) -> Option<usize> {
    let Some(loc) = location else {
        log_warning(format!(
            "field '{key}' stores data but has no workbook location; answer not written"
        ));
        return None;
    };
    if loc.row_index <= HEADING_ROW_OFFSET {
        log_warning(format!(
            "field '{key}' is located at heading row {}; answer not written",
            loc.row_index
        ));
        return None;
    }
    let target = (loc.row_index - HEADING_ROW_OFFSET) as usize;
    if target >= height {
        log_warning(format!(
            "field '{key}' at workbook row {} falls outside the answer range; answer not written",
            loc.row_index
        ));
        return None;
    }
    Some(target)
}

/// The cell value for a data-storing field: the form answer when present,
/// non-blank and not an array; otherwise the type default.
fn answer_value(field: &DataStoringField, form: &Map<String, Value>) -> Value {
    match form.get(&field.key) {
        Some(v) if !v.is_array() && !is_blank(v) => v.clone(),
        _ => field.data_type.default_value(),
    }
}

/// Toggle cell for a repeating group.
///
/// `"complete"` when the group was never answered, or when every submitted
/// instance has a non-blank answer for every required sub-field;
/// `"incomplete"` otherwise.
fn toggle_state(field: &RepeatingField, form: &Map<String, Value>) -> &'static str {
    let Some(instances) = form.get(&field.key).and_then(Value::as_array) else {
        return "complete";
    };

    let required: Vec<&str> = field
        .question_set
        .fields
        .iter()
        .filter(|f| f.is_required())
        .map(Field::key)
        .collect();

    let all_satisfied = instances.iter().all(|instance| {
        required
            .iter()
            .all(|key| instance.get(*key).is_some_and(|v| !is_blank(v)))
    });

    if all_satisfied {
        "complete"
    } else {
        "incomplete"
    }
}
