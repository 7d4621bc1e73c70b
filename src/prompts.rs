//! Prompt templates for squad structure proposals.
//!
//! The built-in template is seeded into the `prompt_versions` table on store open, so
//! operators can ship new versions without a release. Rendering goes through
//! [`crate::template`].

use crate::template::{render_with_report, RenderReport, Variables};

// =============================================================================
// Prompt templates
// =============================================================================

/// Key under which structure-proposal prompt versions are stored.
pub const STRUCTURE_PROPOSAL_KEY: &str = "squad_structure_proposal";

/// A prompt template with `{{...}}` placeholders in the user part.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub key: &'static str,
    pub version: i64,
    pub system: &'static str,
    pub user: &'static str,
}

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub system: String,
    pub user: String,
    pub report: RenderReport,
}

impl PromptInstance {
    /// Render a (system, user-template) pair. The system text is used verbatim.
    pub fn render(system: &str, user_template: &str, vars: &Variables) -> Self {
        let report = render_with_report(user_template, vars);
        Self {
            system: system.trim().to_string(),
            user: report.text.clone(),
            report,
        }
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const STRUCTURE_PROPOSAL_V1: PromptTemplate = PromptTemplate {
    key: STRUCTURE_PROPOSAL_KEY,
    version: 1,
    system: r#"You are an organizational designer for product squads. Given what a squad knows about its problem and backlog, you propose how the squad should be structured: who it serves, who is on it, how it decides, how work flows, and what is still unknown.

Output only valid JSON of the form {"proposal": {...}} with these optional sections:
- decision_context: {summary, key_decisions[], constraints[]}
- problem_maturity: {level: "idea"|"hypothesis"|"validated"|"proven", rationale}
- personas: [{name, description, goals[], pain_points[]}]
- governance: {decision_model, cadence, escalation}
- squad_structure: {roles: [{label, responsibilities[], allocation}]}
- recommended_flow: {phases: [{name, description, objectives[]}]}
- critical_unknowns: [{question, impact, how_to_learn}]
- execution_model: {approach, rituals[], working_agreements[]}
- validation_strategy: {hypotheses[], experiments[], success_metrics[]}
- readiness_assessment: {ready_to_build: true|false, reasoning, blockers[]}
Omit a section rather than inventing content for it."#,
    user: r#"Squad: {{squad_name}}
{{#if squad_description}}
Description:
{{squad_description}}
{{/if}}
Context source: {{source_context}}
{{#if problem_statement}}
<problem_statement>
{{problem_statement}}
</problem_statement>
{{/if}}
{{#if backlog}}
<backlog>
{{backlog}}
</backlog>
{{/if}}
{{#if existing_personas}}
Personas already attached to this squad (reuse names where they fit): {{existing_personas}}
{{/if}}
{{#if existing_roles}}
Roles already active in this squad: {{existing_roles}}
{{/if}}
{{#if existing_phases}}
Phases already defined (do not repeat them): {{existing_phases}}
{{/if}}

Return the JSON proposal.
json:"#,
};

pub const DEFAULT_PROMPT: PromptTemplate = STRUCTURE_PROPOSAL_V1;

// =============================================================================
// TESTS
// =============================================================================
