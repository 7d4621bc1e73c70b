//! Terminal rendering for proposals and the review queue.

use std::collections::BTreeMap;

use serde_json::Value;

use super::store::{Proposal, ProposalStatus, SquadStore, StoreError, Suggestion, SuggestionStatus};

const SEPARATOR: &str =
    "================================================================================";
const RULE: &str = "────────────────────────────────────────────────────────────────";

// =============================================================================
// Dashboard
// =============================================================================

/// Squad overview: status, proposals, the pending queue and recent model calls.
pub async fn render_dashboard(store: &SquadStore, squad_id: i64) -> Result<String, StoreError> {
    let squad = store.get_squad(squad_id).await?;
    let proposals = store.list_proposals(squad_id).await?;
    let pending = store.list_pending_suggestions(squad_id).await?;
    let executions = store.recent_executions(5).await?;

    let mut out = Vec::new();
    out.push(SEPARATOR.to_string());
    out.push(format!(" SQUAD #{} {}", squad.id, truncate_str(&squad.name, 60)));
    out.push(SEPARATOR.to_string());
    let drafts = proposals
        .iter()
        .filter(|p| p.status == ProposalStatus::Draft)
        .count();
    out.push(format!(
        " Status: {} | {} proposals ({} draft) | {} pending suggestions",
        squad.status.as_str(),
        proposals.len(),
        drafts,
        pending.len()
    ));
    out.push(String::new());

    out.push("--- Proposals ---".into());
    if proposals.is_empty() {
        out.push("  No proposals yet.".into());
    }
    for p in proposals.iter().take(10) {
        out.push(format!(
            " {:8} {:10} {:8} {}",
            format!("#{}", p.id),
            p.status.as_str(),
            p.source_context.as_str(),
            truncate_str(&p.model, 40)
        ));
    }
    out.push(String::new());

    out.push(format!("--- Pending Suggestions ({}) ---", pending.len()));
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for s in &pending {
        *by_type.entry(s.suggestion_type.as_str()).or_default() += 1;
    }
    if by_type.is_empty() {
        out.push("  Nothing to review.".into());
    }
    for (kind, n) in by_type {
        out.push(format!("  {kind:24} {n}"));
    }

    if !executions.is_empty() {
        out.push(String::new());
        out.push("--- Recent Model Calls ---".into());
        for e in &executions {
            let status = match e.success {
                Some(true) => "ok",
                Some(false) => "failed",
                None => "?",
            };
            let tokens = e
                .total_tokens
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into());
            out.push(format!(
                " {:6} {:8} {:>8} tokens {}",
                format!("#{}", e.id),
                status,
                tokens,
                e.error_message
                    .as_deref()
                    .map(|m| truncate_str(m, 48))
                    .unwrap_or_default()
            ));
        }
    }
    out.push(SEPARATOR.to_string());
    Ok(out.join("\n"))
}

// =============================================================================
// Detail rendering
// =============================================================================

pub fn render_proposal(p: &Proposal, suggestions: &[Suggestion]) -> String {
    let mut out = vec![
        RULE.to_string(),
        format!("Proposal #{}", p.id),
        RULE.to_string(),
        format!("Squad:   #{}", p.squad_id),
        format!("Status:  {}", p.status.as_str()),
        format!("Source:  {}", p.source_context.as_str()),
        format!("Model:   {}", p.model),
        format!("By:      {}", p.created_by),
    ];
    if let Some(by) = &p.decided_by {
        out.push(format!("Decided: {by}"));
    }
    out.push(String::new());
    out.push(render_suggestion_list(suggestions));
    out.push(RULE.to_string());
    out.join("\n")
}

pub fn render_suggestion(s: &Suggestion) -> String {
    let payload = s.edited_payload.as_ref().unwrap_or(&s.payload);
    let pretty = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    let mut out = vec![
        RULE.to_string(),
        format!("Suggestion #{} ({})", s.id, s.suggestion_type),
        RULE.to_string(),
        format!("Proposal: #{}", s.proposal_id),
        format!("Order:    {}", s.display_order),
        format!("Status:   {}", s.status.as_str()),
    ];
    if let Some(reason) = &s.decision_reason {
        out.push(format!("Reason:   {}", strip_ansi(reason)));
    }
    out.push(String::new());
    out.push(strip_ansi(&pretty));
    out.push(RULE.to_string());
    out.join("\n")
}

/// Table for `review --list`.
pub fn render_suggestion_list(suggestions: &[Suggestion]) -> String {
    if suggestions.is_empty() {
        return "No suggestions found.".into();
    }
    let mut out = vec![
        format!(
            " {:8} {:4} {:24} {:20} {}",
            "ID", "Ord", "Type", "Status", "Summary"
        ),
        "-".repeat(94),
    ];
    for s in suggestions {
        out.push(format!(
            " {:8} {:4} {:24} {:20} {}",
            format!("#{}", s.id),
            s.display_order,
            s.suggestion_type,
            status_label(s.status),
            truncate_str(&headline(&s.payload), 40)
        ));
    }
    out.push(String::new());
    out.push(format!("{} suggestions total", suggestions.len()));
    out.join("\n")
}

// =============================================================================
// Helpers
// =============================================================================

fn status_label(status: SuggestionStatus) -> &'static str {
    match status {
        SuggestionStatus::Pending => "pending",
        SuggestionStatus::Approved => "approved",
        SuggestionStatus::ApprovedWithEdits => "approved (edited)",
        SuggestionStatus::Rejected => "rejected",
    }
}

/// One-line summary of a payload: its most name-like field, else compact JSON.
fn headline(payload: &Value) -> String {
    const KEYS: &[&str] = &["name", "title", "label", "role", "statement", "level", "summary"];
    if let Some(s) = payload.as_str() {
        return s.to_string();
    }
    if let Some(items) = payload.as_array() {
        let names: Vec<String> = items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => headline(other),
            })
            .collect();
        return names.join(", ");
    }
    KEYS.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(String::from)
        .unwrap_or_else(|| payload.to_string())
}

fn truncate_str(s: &str, max: usize) -> String {
    let clean = strip_ansi(s);
    if clean.chars().count() <= max {
        clean
    } else {
        let truncated: String = clean.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

/// Strip ANSI escape sequences from model-generated text before it reaches a terminal.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // Parameter and intermediate bytes, then one final byte.
                while chars.next_if(|n| ('\x20'..='\x3f').contains(n)).is_some() {}
                chars.next_if(|n| ('\x40'..='\x7e').contains(n));
            } else if chars.peek() == Some(&']') {
                // OSC runs to BEL or ESC-backslash.
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\x07' {
                        break;
                    }
                    if next == '\x1b' && chars.next_if_eq(&'\\').is_some() {
                        break;
                    }
                }
            }
        } else if c < '\x20' && c != '\n' && c != '\t' {
            continue;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn suggestion(kind: &str, payload: Value) -> Suggestion {
        Suggestion {
            id: 3,
            proposal_id: 1,
            squad_id: 1,
            suggestion_type: kind.into(),
            payload,
            display_order: 2,
            status: SuggestionStatus::Pending,
            edited_payload: None,
            decision_reason: None,
            decided_by: None,
            decided_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn strip_ansi_removes_escapes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("\x1b]52;c;base64data\x07rest"), "rest");
        assert_eq!(strip_ansi("a\x01b\nc"), "ab\nc");
    }

    #[test]
    fn headline_prefers_name_fields() {
        assert_eq!(headline(&json!({"name": "Finance admin", "x": 1})), "Finance admin");
        assert_eq!(headline(&json!([{"name": "Discover"}, "Build"])), "Discover, Build");
        assert_eq!(headline(&json!({"ready_to_build": true})), r#"{"ready_to_build":true}"#);
    }

    #[test]
    fn list_shows_one_row_per_suggestion() {
        let rendered = render_suggestion_list(&[
            suggestion("persona", json!({"name": "Finance admin"})),
            suggestion("phase", json!([{"name": "Discover"}])),
        ]);
        assert!(rendered.contains("Finance admin"));
        assert!(rendered.contains("2 suggestions total"));
        assert_eq!(render_suggestion_list(&[]), "No suggestions found.");
    }

    #[test]
    fn detail_prefers_edited_payload() {
        let mut s = suggestion("persona", json!({"name": "Original"}));
        s.edited_payload = Some(json!({"name": "Edited"}));
        let rendered = render_suggestion(&s);
        assert!(rendered.contains("Edited"));
        assert!(!rendered.contains("Original"));
    }
}
