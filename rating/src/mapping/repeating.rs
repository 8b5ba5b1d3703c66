//! Repeating-group answer mapping.
//!
//! A repeating question set collects one column of answers per user-added
//! instance. The workbook reads the group as a fixed-width block of
//! `max_quantity` columns, so the table is padded out to exactly that
//! width and row alignment is kept by inserting filler rows for workbook
//! rows with no configured field.

use serde_json::Value;

use crate::error::{MappingError, MappingResult};
use crate::logs::log_warning;
use crate::model::{DataStoringField, Field, RepeatingQuestionSet, HEADING_ROW_OFFSET};
use crate::table::AnswerTable;

use super::is_blank;

/// Map one repeating question set's submitted instances onto its
/// column-per-instance answer table.
///
/// Fails with [`MappingError::TooManyInstances`] when the form holds more
/// instances than the workbook has columns for; truncating would silently
/// drop user answers, so the release has to be fixed instead.
pub fn map_repeating_set(
    set: &RepeatingQuestionSet,
    form_model: &Value,
) -> MappingResult<AnswerTable> {
    let form = form_model.as_object().ok_or(MappingError::FormNotObject)?;

    let empty = Vec::new();
    let instances = form
        .get(&set.key)
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    if instances.len() > set.max_quantity {
        return Err(MappingError::TooManyInstances {
            set_key: set.key.clone(),
            submitted: instances.len(),
            max: set.max_quantity,
        });
    }

    let mut fields: Vec<&Field> = set.fields.iter().collect();
    fields.sort_by_key(|f| f.sort_key());

    let header = (1..=set.max_quantity)
        .map(|i| Value::String(format!("Value {i}")))
        .collect();
    let mut table = AnswerTable::with_header(header);

    // Walk fields in workbook order, inserting one filler row per row the
    // workbook has but the release does not configure a field for.
    let mut cursor = HEADING_ROW_OFFSET + 1;
    for field in fields {
        let data_field = match field {
            Field::DataStoring(f) => f,
            Field::Repeating(_) | Field::Other(_) => {
                log_warning(format!(
                    "repeating set '{}': field '{}' stores no per-instance data; skipped",
                    set.key,
                    field.key()
                ));
                continue;
            }
        };
        let Some(location) = data_field.location else {
            log_warning(format!(
                "repeating set '{}': field '{}' has no workbook location; skipped",
                set.key, data_field.key
            ));
            continue;
        };

        for _ in cursor..location.row_index {
            table.push_row(Vec::new());
        }

        let row = instances
            .iter()
            .map(|instance| instance_value(data_field, instance))
            .collect();
        table.push_row(row);

        cursor = cursor.max(location.row_index + 1);
    }

    table.pad_rows(set.max_quantity);
    Ok(table)
}

/// One instance's cell for a field: the instance answer when present and
/// non-blank, otherwise the field's type default.
fn instance_value(field: &DataStoringField, instance: &Value) -> Value {
    match instance.get(&field.key) {
        Some(v) if !v.is_array() && !is_blank(v) => v.clone(),
        _ => field.data_type.default_value(),
    }
}
