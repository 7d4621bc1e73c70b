//! What the model sees when proposing a squad structure.

use serde_json::{json, Value};

use crate::template::Variables;

use super::store::{BacklogItem, SourceContext, Squad, SquadStore, StoreError};

/// Inputs gathered for one generation.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub squad: Squad,
    pub problem_statement: Option<String>,
    pub backlog: Vec<BacklogItem>,
    pub personas: Vec<String>,
    pub roles: Vec<String>,
    pub phases: Vec<String>,
}

impl GenerationContext {
    pub async fn gather(store: &SquadStore, squad: Squad) -> Result<Self, StoreError> {
        let problem_statement = store
            .latest_problem_statement(squad.id)
            .await?
            .and_then(|d| {
                ["statement", "problem_statement", "description"]
                    .iter()
                    .find_map(|key| d.body.get(*key).and_then(Value::as_str))
                    .map(|s| s.trim().to_string())
            })
            .filter(|s| !s.is_empty());

        let backlog = store.list_backlog(squad.id).await?;
        let personas = store
            .squad_personas(squad.id)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();
        let roles = store
            .squad_roles(squad.id)
            .await?
            .into_iter()
            .map(|r| r.label)
            .collect();
        let phases = store
            .squad_phases(squad.id)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();

        Ok(Self {
            squad,
            problem_statement,
            backlog,
            personas,
            roles,
            phases,
        })
    }

    /// `None` when there is neither a problem statement nor backlog to work from.
    pub fn source(&self) -> Option<SourceContext> {
        match (self.problem_statement.is_some(), !self.backlog.is_empty()) {
            (true, true) => Some(SourceContext::Both),
            (true, false) => Some(SourceContext::Problem),
            (false, true) => Some(SourceContext::Backlog),
            (false, false) => None,
        }
    }

    pub fn backlog_text(&self) -> String {
        self.backlog
            .iter()
            .map(|item| match item.description.as_deref().map(str::trim) {
                Some(desc) if !desc.is_empty() => format!("- {}: {}", item.title, desc),
                _ => format!("- {}", item.title),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Template variables for the proposal prompt.
    pub fn variables(&self, source: SourceContext) -> Variables {
        let mut vars = Variables::new();
        vars.insert("squad_name".into(), json!(self.squad.name));
        vars.insert(
            "squad_description".into(),
            json!(self.squad.description.as_deref().map(str::trim)),
        );
        vars.insert("source_context".into(), json!(source.as_str()));
        vars.insert("problem_statement".into(), json!(self.problem_statement));
        vars.insert("backlog".into(), json!(self.backlog_text()));
        vars.insert("existing_personas".into(), json!(self.personas.join(", ")));
        vars.insert("existing_roles".into(), json!(self.roles.join(", ")));
        vars.insert("existing_phases".into(), json!(self.phases.join(", ")));
        vars
    }

    /// Snapshot stored with the proposal so a later reader knows what the model saw.
    pub fn snapshot(&self, source: SourceContext) -> Value {
        json!({
            "squad_id": self.squad.id,
            "squad_name": self.squad.name,
            "squad_description": self.squad.description,
            "source_context": source.as_str(),
            "problem_statement": self.problem_statement,
            "backlog": self.backlog.iter().map(|item| json!({
                "id": item.id,
                "title": item.title,
                "description": item.description,
            })).collect::<Vec<_>>(),
            "existing_personas": self.personas,
            "existing_roles": self.roles,
            "existing_phases": self.phases,
            "generated_at": chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::store::SquadStatus;

    fn context(problem: Option<&str>, backlog: &[&str]) -> GenerationContext {
        GenerationContext {
            squad: Squad {
                id: 1,
                workspace_id: 1,
                name: "Payments".into(),
                description: None,
                status: SquadStatus::Forming,
                created_at: 0,
                updated_at: 0,
            },
            problem_statement: problem.map(String::from),
            backlog: backlog
                .iter()
                .enumerate()
                .map(|(i, title)| BacklogItem {
                    id: i as i64 + 1,
                    squad_id: 1,
                    title: title.to_string(),
                    description: None,
                    created_at: 0,
                })
                .collect(),
            personas: vec![],
            roles: vec!["Tech Lead".into()],
            phases: vec![],
        }
    }

    #[test]
    fn source_tag_reflects_inputs() {
        assert_eq!(context(Some("p"), &[]).source(), Some(SourceContext::Problem));
        assert_eq!(context(None, &["a"]).source(), Some(SourceContext::Backlog));
        assert_eq!(context(Some("p"), &["a"]).source(), Some(SourceContext::Both));
        assert_eq!(context(None, &[]).source(), None);
    }

    #[test]
    fn empty_lists_are_absent_in_templates() {
        let vars = context(None, &["Ship refunds"]).variables(SourceContext::Backlog);
        assert_eq!(vars["existing_personas"], json!(""));
        assert_eq!(vars["existing_roles"], json!("Tech Lead"));
        assert_eq!(vars["backlog"], json!("- Ship refunds"));
        assert!(vars["problem_statement"].is_null());
    }

    #[test]
    fn snapshot_records_generation_time() {
        let snap = context(Some("p"), &[]).snapshot(SourceContext::Problem);
        assert_eq!(snap["source_context"], "PROBLEM");
        assert!(snap["generated_at"].as_str().is_some());
    }
}
