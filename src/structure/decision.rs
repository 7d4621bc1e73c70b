//! Typed view of the squad decision log.
//!
//! Rows are append-only `(title, body)` pairs. The title selects the body shape; the
//! one in-place mutation is the maturity patch on the latest Problem Statement.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::now_epoch;

pub const PROBLEM_STATEMENT_TITLE: &str = "Problem Statement";

const DECISION_CONTEXT_TITLE: &str = "Decision Context";
const GOVERNANCE_TITLE: &str = "Governance";
const CRITICAL_UNKNOWN_TITLE: &str = "Critical Unknown";
const EXECUTION_MODEL_TITLE: &str = "Execution Model";
const VALIDATION_STRATEGY_TITLE: &str = "Validation Strategy";
const SUGGESTION_APPROVED_TITLE: &str = "Suggestion Approved";
const SUGGESTION_EDITED_TITLE: &str = "Suggestion Approved With Edits";
const SUGGESTION_REJECTED_TITLE: &str = "Suggestion Rejected";
const PROPOSAL_CONFIRMED_TITLE: &str = "Structure Proposal Confirmed";
const PROPOSAL_DISCARDED_TITLE: &str = "Structure Proposal Discarded";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemStatement {
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity_rationale: Option<String>,
}

/// Audit entry written for every approve / reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionAudit {
    pub suggestion_id: i64,
    pub proposal_id: i64,
    pub suggestion_type: String,
    pub display_order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// What the dispatcher wrote, for approvals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalAudit {
    pub proposal_id: i64,
    pub model: String,
    pub suggestion_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionRecord {
    DecisionContext(Value),
    Governance(Value),
    CriticalUnknown(Value),
    ExecutionModel(Value),
    ValidationStrategy(Value),
    ProblemStatement(ProblemStatement),
    SuggestionApproved(SuggestionAudit),
    SuggestionApprovedWithEdits(SuggestionAudit),
    SuggestionRejected(SuggestionAudit),
    ProposalConfirmed(ProposalAudit),
    ProposalDiscarded(ProposalAudit),
}

impl DecisionRecord {
    pub fn title(&self) -> &'static str {
        match self {
            Self::DecisionContext(_) => DECISION_CONTEXT_TITLE,
            Self::Governance(_) => GOVERNANCE_TITLE,
            Self::CriticalUnknown(_) => CRITICAL_UNKNOWN_TITLE,
            Self::ExecutionModel(_) => EXECUTION_MODEL_TITLE,
            Self::ValidationStrategy(_) => VALIDATION_STRATEGY_TITLE,
            Self::ProblemStatement(_) => PROBLEM_STATEMENT_TITLE,
            Self::SuggestionApproved(_) => SUGGESTION_APPROVED_TITLE,
            Self::SuggestionApprovedWithEdits(_) => SUGGESTION_EDITED_TITLE,
            Self::SuggestionRejected(_) => SUGGESTION_REJECTED_TITLE,
            Self::ProposalConfirmed(_) => PROPOSAL_CONFIRMED_TITLE,
            Self::ProposalDiscarded(_) => PROPOSAL_DISCARDED_TITLE,
        }
    }

    pub fn body(&self) -> Value {
        let encoded = match self {
            Self::DecisionContext(v)
            | Self::Governance(v)
            | Self::CriticalUnknown(v)
            | Self::ExecutionModel(v)
            | Self::ValidationStrategy(v) => Ok(v.clone()),
            Self::ProblemStatement(p) => serde_json::to_value(p),
            Self::SuggestionApproved(a)
            | Self::SuggestionApprovedWithEdits(a)
            | Self::SuggestionRejected(a) => serde_json::to_value(a),
            Self::ProposalConfirmed(a) | Self::ProposalDiscarded(a) => serde_json::to_value(a),
        };
        // Plain data structs always serialize.
        encoded.unwrap_or(Value::Null)
    }

    /// Rebuild a typed record from a stored row. `None` for titles this crate did not
    /// write or bodies that no longer match their shape.
    pub fn from_parts(title: &str, body: Value) -> Option<Self> {
        let record = match title {
            DECISION_CONTEXT_TITLE => Self::DecisionContext(body),
            GOVERNANCE_TITLE => Self::Governance(body),
            CRITICAL_UNKNOWN_TITLE => Self::CriticalUnknown(body),
            EXECUTION_MODEL_TITLE => Self::ExecutionModel(body),
            VALIDATION_STRATEGY_TITLE => Self::ValidationStrategy(body),
            PROBLEM_STATEMENT_TITLE => Self::ProblemStatement(serde_json::from_value(body).ok()?),
            SUGGESTION_APPROVED_TITLE => Self::SuggestionApproved(serde_json::from_value(body).ok()?),
            SUGGESTION_EDITED_TITLE => {
                Self::SuggestionApprovedWithEdits(serde_json::from_value(body).ok()?)
            }
            SUGGESTION_REJECTED_TITLE => Self::SuggestionRejected(serde_json::from_value(body).ok()?),
            PROPOSAL_CONFIRMED_TITLE => Self::ProposalConfirmed(serde_json::from_value(body).ok()?),
            PROPOSAL_DISCARDED_TITLE => Self::ProposalDiscarded(serde_json::from_value(body).ok()?),
            _ => return None,
        };
        Some(record)
    }
}

/// Append a record to the squad's decision log.
pub fn append(
    conn: &Connection,
    squad_id: i64,
    record: &DecisionRecord,
    actor: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO decisions (squad_id, title, body, created_by, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            squad_id,
            record.title(),
            record.body().to_string(),
            actor,
            now_epoch(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn problem_statement_round_trips_through_parts() {
        let record = DecisionRecord::ProblemStatement(ProblemStatement {
            statement: "Onboarding takes two weeks".into(),
            ..Default::default()
        });
        let back = DecisionRecord::from_parts(record.title(), record.body());
        assert_eq!(back, Some(record));
    }

    #[test]
    fn free_form_titles_keep_body() {
        let body = json!({"decision_model": "consent"});
        let record = DecisionRecord::from_parts("Governance", body.clone()).unwrap();
        assert_eq!(record.body(), body);
        assert!(DecisionRecord::from_parts("Retro notes", body).is_none());
    }

    #[test]
    fn audit_omits_empty_fields() {
        let record = DecisionRecord::SuggestionRejected(SuggestionAudit {
            suggestion_id: 4,
            proposal_id: 1,
            suggestion_type: "persona".into(),
            display_order: 2,
            reason: None,
            outcome: None,
        });
        let body = record.body();
        assert!(body.get("reason").is_none());
        assert_eq!(body["suggestion_id"], 4);
        assert_eq!(record.title(), "Suggestion Rejected");
    }
}
