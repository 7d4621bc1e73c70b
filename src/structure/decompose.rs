//! Split a structure proposal into independently reviewable suggestion units.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Types
// =============================================================================

/// The closed set of suggestion kinds a proposal decomposes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionType {
    DecisionContext,
    ProblemMaturity,
    Persona,
    Governance,
    SquadStructureRole,
    Phase,
    CriticalUnknown,
    ExecutionModel,
    ValidationStrategy,
    ReadinessAssessment,
}

impl SuggestionType {
    pub const ALL: [SuggestionType; 10] = [
        Self::DecisionContext,
        Self::ProblemMaturity,
        Self::Persona,
        Self::Governance,
        Self::SquadStructureRole,
        Self::Phase,
        Self::CriticalUnknown,
        Self::ExecutionModel,
        Self::ValidationStrategy,
        Self::ReadinessAssessment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecisionContext => "decision_context",
            Self::ProblemMaturity => "problem_maturity",
            Self::Persona => "persona",
            Self::Governance => "governance",
            Self::SquadStructureRole => "squad_structure_role",
            Self::Phase => "phase",
            Self::CriticalUnknown => "critical_unknown",
            Self::ExecutionModel => "execution_model",
            Self::ValidationStrategy => "validation_strategy",
            Self::ReadinessAssessment => "readiness_assessment",
        }
    }
}

impl fmt::Display for SuggestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown suggestion type: {0}")]
pub struct UnknownSuggestionType(pub String);

impl FromStr for SuggestionType {
    type Err = UnknownSuggestionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownSuggestionType(s.to_string()))
    }
}

/// One suggestion before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuggestionDraft {
    #[serde(rename = "type")]
    pub kind: SuggestionType,
    pub payload: Value,
    pub display_order: i64,
}

// =============================================================================
// Decomposition
// =============================================================================

enum Section {
    /// `payload[key]` becomes one unit when present.
    Single(&'static str),
    /// Each element of the array at `path` becomes one unit.
    Each(&'static [&'static str]),
    /// The whole array at `path` becomes one unit.
    Batch(&'static [&'static str]),
}

const SECTIONS: [(SuggestionType, Section); 10] = [
    (SuggestionType::DecisionContext, Section::Single("decision_context")),
    (SuggestionType::ProblemMaturity, Section::Single("problem_maturity")),
    (SuggestionType::Persona, Section::Each(&["personas"])),
    (SuggestionType::Governance, Section::Single("governance")),
    (
        SuggestionType::SquadStructureRole,
        Section::Each(&["squad_structure", "roles"]),
    ),
    (
        SuggestionType::Phase,
        Section::Batch(&["recommended_flow", "phases"]),
    ),
    (SuggestionType::CriticalUnknown, Section::Each(&["critical_unknowns"])),
    (SuggestionType::ExecutionModel, Section::Single("execution_model")),
    (
        SuggestionType::ValidationStrategy,
        Section::Single("validation_strategy"),
    ),
    (
        SuggestionType::ReadinessAssessment,
        Section::Single("readiness_assessment"),
    ),
];

/// Decompose a proposal body into ordered drafts.
///
/// Never fails: absent or malformed sections are skipped, so `{}` or a non-object
/// yields an empty list. `display_order` is zero-based and follows section order, then
/// array order within a section.
pub fn decompose(proposal: &Value) -> Vec<SuggestionDraft> {
    let mut drafts = Vec::new();
    if !proposal.is_object() {
        return drafts;
    }

    let mut push = |kind: SuggestionType, payload: &Value| {
        let display_order = drafts.len() as i64;
        drafts.push(SuggestionDraft {
            kind,
            payload: payload.clone(),
            display_order,
        });
    };

    for (kind, section) in &SECTIONS {
        match section {
            Section::Single(key) => {
                if let Some(value) = present(proposal.get(*key)) {
                    push(*kind, value);
                }
            }
            Section::Each(path) => {
                if let Some(Value::Array(items)) = lookup(proposal, path) {
                    for item in items {
                        push(*kind, item);
                    }
                }
            }
            Section::Batch(path) => {
                if let Some(value @ Value::Array(_)) = lookup(proposal, path) {
                    push(*kind, value);
                }
            }
        }
    }

    drafts
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(root, |node, key| node.as_object()?.get(*key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(drafts: &[SuggestionDraft]) -> Vec<SuggestionType> {
        drafts.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn empty_payload_yields_nothing() {
        assert!(decompose(&json!({})).is_empty());
        assert!(decompose(&json!(null)).is_empty());
        assert!(decompose(&json!(["not", "an", "object"])).is_empty());
    }

    #[test]
    fn order_follows_sections_then_elements() {
        let drafts = decompose(&json!({
            "governance": {"cadence": "weekly"},
            "personas": [{"name": "A"}, {"name": "B"}],
            "decision_context": {"summary": "s"},
        }));
        assert_eq!(
            kinds(&drafts),
            vec![
                SuggestionType::DecisionContext,
                SuggestionType::Persona,
                SuggestionType::Persona,
                SuggestionType::Governance,
            ]
        );
        let orders: Vec<i64> = drafts.iter().map(|d| d.display_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
        assert_eq!(drafts[1].payload["name"], "A");
        assert_eq!(drafts[2].payload["name"], "B");
    }

    #[test]
    fn phases_are_one_unit() {
        let drafts = decompose(&json!({
            "recommended_flow": {"phases": [{"name": "Discovery"}, {"name": "Build"}]}
        }));
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].kind, SuggestionType::Phase);
        assert_eq!(drafts[0].payload.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn malformed_sections_are_skipped() {
        let drafts = decompose(&json!({
            "personas": {"name": "not an array"},
            "squad_structure": {"roles": "lead"},
            "recommended_flow": [],
            "critical_unknowns": [null, {"question": "who pays?"}],
            "execution_model": null,
            "readiness_assessment": {"ready_to_build": false},
        }));
        assert_eq!(
            kinds(&drafts),
            vec![
                SuggestionType::CriticalUnknown,
                SuggestionType::CriticalUnknown,
                SuggestionType::ReadinessAssessment,
            ]
        );
        assert!(drafts[0].payload.is_null());
        assert_eq!(drafts[2].display_order, 2);
    }

    #[test]
    fn empty_phase_list_is_still_one_unit() {
        let drafts = decompose(&json!({"recommended_flow": {"phases": []}}));
        assert_eq!(kinds(&drafts), vec![SuggestionType::Phase]);
        assert_eq!(drafts[0].payload, json!([]));

        assert!(decompose(&json!({"recommended_flow": {"phases": null}})).is_empty());
    }

    #[test]
    fn full_payload_covers_every_type() {
        let drafts = decompose(&json!({
            "decision_context": {},
            "problem_maturity": {"level": "hypothesis"},
            "personas": [{"name": "Ops lead"}],
            "governance": {},
            "squad_structure": {"roles": [{"label": "Tech Lead"}, {"label": "Designer"}]},
            "recommended_flow": {"phases": ["Discovery"]},
            "critical_unknowns": [{"question": "q"}],
            "execution_model": {},
            "validation_strategy": {},
            "readiness_assessment": {"ready_to_build": true},
        }));
        assert_eq!(drafts.len(), 11);
        for kind in SuggestionType::ALL {
            assert!(drafts.iter().any(|d| d.kind == kind), "missing {kind}");
        }
        for (i, d) in drafts.iter().enumerate() {
            assert_eq!(d.display_order, i as i64);
        }
    }

    #[test]
    fn type_tags_parse_back() {
        for kind in SuggestionType::ALL {
            assert_eq!(kind.as_str().parse::<SuggestionType>(), Ok(kind));
        }
        assert!("team_charter".parse::<SuggestionType>().is_err());
    }
}
