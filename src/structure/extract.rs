//! Pull the structured proposal out of raw model output.

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("model output is not valid JSON: {0}")]
    JsonParse(String),
    #[error("model output has no top-level \"proposal\" object")]
    MissingProposal,
}

/// Parse model output and return its `proposal` object.
///
/// JSON mode is requested from the provider, but some models still wrap the object in
/// prose or code fences, so the outermost object is located first.
pub fn parse_proposal(raw: &str) -> Result<Map<String, Value>, ExtractError> {
    let json = extract_json(raw);
    let value: Value =
        serde_json::from_str(json).map_err(|e| ExtractError::JsonParse(e.to_string()))?;
    match value {
        Value::Object(mut root) => match root.remove("proposal") {
            Some(Value::Object(proposal)) => Ok(proposal),
            _ => Err(ExtractError::MissingProposal),
        },
        _ => Err(ExtractError::MissingProposal),
    }
}

/// Return the first balanced `{...}` in `raw`, or the trimmed input if there is none.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Byte offset just past the brace closing the first `{`, skipping braces in strings.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
