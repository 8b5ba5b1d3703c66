//! Calculation output validation.
//!
//! Only the Development environment parses engine output; Staging and
//! Production skip the check for throughput and trust the engine (plus
//! the claim-path sanitizer) instead. The one condition release authors
//! hit often enough to deserve its own error is a property with no value
//! (a workbook cell that computed to nothing), so that parse failure is
//! translated to a dedicated kind. Callers attach both answer tables to
//! whatever comes back here.

use serde_json::Value;

use crate::error::OutputValidationKind;

/// Check that engine output is well-formed JSON.
///
/// On failure returns the classification plus the parser's message. A
/// value missing after `:` or `,` surfaces from the parser as an
/// "expected value" syntax error somewhere inside the document; the same
/// message at line 1 column 1 just means the output is not JSON at all.
pub fn check_well_formed(raw: &str) -> Result<(), (OutputValidationKind, String)> {
    match serde_json::from_str::<Value>(raw) {
        Ok(_) => Ok(()),
        Err(err) => {
            let message = err.to_string();
            let inside_document = err.line() > 1 || err.column() > 1;
            let kind = if message.starts_with("expected value") && inside_document {
                OutputValidationKind::MissingPropertyValue
            } else {
                OutputValidationKind::MalformedJson
            };
            Err((kind, message))
        }
    }
}

/// Quick boolean form.
pub fn is_well_formed(raw: &str) -> bool {
    check_well_formed(raw).is_ok()
}
