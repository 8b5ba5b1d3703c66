//! Engine output repair.
//!
//! The calculation engine's text output is JSON in shape but sometimes
//! carries a trailing comma before a closing brace or bracket. The
//! sanitizer strips exactly that malformation and nothing else; valid
//! JSON passes through unchanged.

use once_cell::sync::Lazy;
use regex::Regex;

/// A comma followed (possibly through whitespace) by `}` or `]`.
static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("trailing-comma pattern is valid"));

/// Remove trailing commas before closing braces/brackets.
///
/// Pure text transform; the input is not required to parse. Applied to
/// claim-calculation output before it is returned or validated.
pub fn sanitize_output(raw: &str) -> String {
    TRAILING_COMMA.replace_all(raw, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_trailing_comma_in_object() {
        assert_eq!(sanitize_output(r#"{"a":1,}"#), r#"{"a":1}"#);
    }

    #[test]
    fn test_strips_trailing_comma_in_array() {
        assert_eq!(sanitize_output("[1,2,]"), "[1,2]");
    }

    #[test]
    fn test_strips_nested_trailing_commas() {
        assert_eq!(sanitize_output(r#"{"a":[1,],}"#), r#"{"a":[1]}"#);
    }

    #[test]
    fn test_strips_comma_through_whitespace() {
        assert_eq!(
            sanitize_output("{\"a\": 1,\n  }\n"),
            "{\"a\": 1\n  }\n"
        );
    }

    #[test]
    fn test_valid_json_unchanged() {
        let valid = r#"{"premium": 1234.5, "bands": [1, 2, 3], "notes": ""}"#;
        assert_eq!(sanitize_output(valid), valid);
    }

    #[test]
    fn test_non_json_text_passes_through() {
        assert_eq!(sanitize_output("#VALUE!"), "#VALUE!");
    }
}
