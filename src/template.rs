//! Prompt template renderer.
//!
//! Supports two constructs:
//! - `{{name}}` substitutes the string form of a variable (absent or null → empty).
//! - `{{#if name}} ... {{/if}}` keeps its body when `name` is present.
//!
//! Conditionals are matched in a single non-greedy pass, so nested `{{#if}}` blocks are
//! not supported: the first `{{/if}}` closes the outermost open block. Templates in this
//! crate never nest them.
//!
//! Whatever `{{...}}` tokens survive substitution are stripped from the output and
//! reported in [`RenderReport::unresolved`]; rendering itself never fails.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::debug;

static CONDITIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{#if\s+([A-Za-z0-9_.]+)\s*\}\}(.*?)\{\{/if\}\}")
        .expect("Invalid conditional regex")
});

static VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("Invalid variable regex"));

static LEFTOVER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{\{.*?\}\}").expect("Invalid leftover regex"));

/// Variable bag for [`render`]. JSON values so callers can pass strings, numbers,
/// booleans or structured data without a bespoke enum.
pub type Variables = Map<String, Value>;

/// Rendered text plus what the renderer had to paper over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderReport {
    pub text: String,
    /// Variables referenced by `{{name}}` that were absent or null.
    pub missing: Vec<String>,
    /// Raw tokens stripped after substitution (malformed or unbalanced syntax).
    pub unresolved: Vec<String>,
}

/// Render `template` with `vars`. See the module docs for the supported syntax.
pub fn render(template: &str, vars: &Variables) -> String {
    render_with_report(template, vars).text
}

/// Like [`render`], but also returns the diagnostics.
pub fn render_with_report(template: &str, vars: &Variables) -> RenderReport {
    let mut missing = Vec::new();
    let mut unresolved = Vec::new();

    let text = CONDITIONAL.replace_all(template, |caps: &Captures<'_>| {
        if is_present(vars.get(&caps[1])) {
            caps[2].to_string()
        } else {
            String::new()
        }
    });

    let text = VARIABLE.replace_all(&text, |caps: &Captures<'_>| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) if !value.is_null() => value_to_string(value),
            _ => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    // Stripping can splice new tokens together ("{{a{{b}}}}"), so repeat until clean.
    let mut text = text.into_owned();
    while LEFTOVER.is_match(&text) {
        text = LEFTOVER
            .replace_all(&text, |caps: &Captures<'_>| {
                unresolved.push(caps[0].to_string());
                String::new()
            })
            .into_owned();
    }

    if !missing.is_empty() {
        debug!(missing = ?missing, "template variables absent; rendered as empty");
    }
    if !unresolved.is_empty() {
        debug!(unresolved = ?unresolved, "stripped unresolved template tokens");
    }

    RenderReport {
        text: text.trim().to_string(),
        missing,
        unresolved,
    }
}

/// A conditional's variable is present unless it is absent, null, `""` or `false`.
fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
