//! Form-answer mapping.
//!
//! Pure functions from a submitted form model (JSON) plus release field
//! metadata to positional [`AnswerTable`](crate::table::AnswerTable)s laid
//! out exactly the way the workbook expects them:
//!
//! - [`map_question_sets`] - one single-column table for all simple fields
//! - [`map_repeating_set`] - one column-per-instance table for a repeating
//!   question set
//!
//! Both sort fields by the composite `sheet * 100000 + row` key and honor
//! the no-gaps invariant: every row between the first and last in-range
//! row is present, defaulting to the empty string.

pub mod form_data;
pub mod repeating;

pub use form_data::map_question_sets;
pub use repeating::map_repeating_set;

use serde_json::Value;

/// Whether a form value counts as "no answer".
///
/// Null and whitespace-only strings are blank. Arrays are handled
/// separately: a simple field answered with an array coerces to its type
/// default.
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&Value::Null));
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!("   ")));
        assert!(!is_blank(&json!("x")));
        assert!(!is_blank(&json!(0)));
        assert!(!is_blank(&json!(false)));
        assert!(!is_blank(&json!([])));
    }
}
