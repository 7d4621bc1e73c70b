//! Squad structure proposals: generate, decompose into suggestions, review.
//!
//! The flow: gather context → render prompt → model call → store DRAFT proposal →
//! decompose into pending suggestions → per-suggestion approve / reject, where each
//! approval dispatches the payload into the squad's domain tables.

pub mod context;
pub mod dashboard;
pub mod decision;
pub mod decompose;
pub mod execution_log;
pub mod extract;
pub mod persist;
pub mod store;

use std::sync::Arc;

use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::{GenerateRequest, ModelGateway};
use crate::prompts::{PromptInstance, STRUCTURE_PROPOSAL_KEY};

use self::context::GenerationContext;
use self::decision::{DecisionRecord, ProposalAudit, SuggestionAudit};
use self::decompose::decompose;
use self::execution_log::{ExecutionLogger, ExecutionRecord};
use self::extract::parse_proposal;
use self::persist::{persist_tagged, PersistContext, PersistError, PersistOutcome};
use self::store::{
    count_suggestions, insert_suggestions, is_unique_violation, load_proposal, load_squad,
    load_suggestion, now_epoch, NewProposal, Proposal, ProposalStatus, SquadStore, StoreError,
    Suggestion, SuggestionStatus,
};

const UPSTREAM_MESSAGE: &str = "The model did not return a usable structure proposal. Please try again.";

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("caller identity required")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// Model failure; the message is safe to show and the cause is in the execution log.
    #[error("{0}")]
    Upstream(String),
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl ServiceError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::Persist(PersistError::InvalidPayload { .. }) => 400,
            Self::Unauthorized => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) | Self::Persist(PersistError::SquadNotFound(_)) => 404,
            Self::Conflict(_) => 409,
            Self::Upstream(_) | Self::Persist(_) | Self::Store(_) => 500,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other),
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(e))
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedProposal {
    pub proposal: Proposal,
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecidedSuggestion {
    pub suggestion: Suggestion,
    /// What the approval wrote; absent for rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PersistOutcome>,
}

/// Model settings used when the active prompt version does not pin its own.
#[derive(Debug, Clone)]
struct GenerationSettings {
    model: String,
    temperature: f32,
    max_tokens: u32,
}

// =============================================================================
// Service
// =============================================================================

#[derive(Clone)]
pub struct StructureService {
    store: SquadStore,
    gateway: Arc<dyn ModelGateway>,
    logger: ExecutionLogger,
    settings: GenerationSettings,
}

impl StructureService {
    pub fn new(store: SquadStore, gateway: Arc<dyn ModelGateway>, config: &Config) -> Self {
        let logger = ExecutionLogger::new(store.clone());
        Self::with_logger(store, gateway, logger, config)
    }

    pub fn with_logger(
        store: SquadStore,
        gateway: Arc<dyn ModelGateway>,
        logger: ExecutionLogger,
        config: &Config,
    ) -> Self {
        Self {
            store,
            gateway,
            logger,
            settings: GenerationSettings {
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
        }
    }

    pub fn store(&self) -> &SquadStore {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Generation
    // -------------------------------------------------------------------------

    /// Generate a DRAFT proposal for a squad and store its pending suggestions.
    pub async fn generate_proposal(
        &self,
        squad_id: i64,
        actor: &str,
    ) -> Result<GeneratedProposal, ServiceError> {
        let squad = self.store.get_squad(squad_id).await?;
        self.ensure_member(squad.workspace_id, actor).await?;
        let workspace_id = squad.workspace_id;

        let ctx = GenerationContext::gather(&self.store, squad).await?;
        let source = ctx.source().ok_or_else(|| {
            ServiceError::InvalidInput(
                "squad needs a problem statement or backlog items before proposing a structure"
                    .into(),
            )
        })?;

        let prompt = self
            .store
            .active_prompt(STRUCTURE_PROPOSAL_KEY)
            .await
            .map_err(ServiceError::Store)?;
        let rendered = PromptInstance::render(
            &prompt.system_instructions,
            &prompt.user_template,
            &ctx.variables(source),
        );
        if !rendered.report.unresolved.is_empty() {
            warn!(
                prompt_version = prompt.version,
                unresolved = ?rendered.report.unresolved,
                "prompt template left unresolved tokens"
            );
        }

        let model = prompt
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());
        let temperature = prompt
            .temperature
            .map(|t| t as f32)
            .unwrap_or(self.settings.temperature);
        let request = GenerateRequest::new(
            model,
            rendered.system,
            rendered.user,
            "structure_proposal",
        )
        .temperature(temperature)
        .max_tokens(self.settings.max_tokens)
        .json();

        let attempt = ExecutionRecord {
            prompt_version_id: Some(prompt.id),
            workspace_id: Some(workspace_id),
            executed_by: Some(actor.to_string()),
            ..Default::default()
        };

        let response = match self.gateway.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    squad_id,
                    error = %e,
                    code = e.code(),
                    request_id = ?e.request_id(),
                    "proposal generation failed"
                );
                self.logger
                    .log(ExecutionRecord {
                        success: false,
                        error_message: Some(e.to_string()),
                        ..attempt
                    })
                    .await;
                return Err(ServiceError::Upstream(UPSTREAM_MESSAGE.into()));
            }
        };

        let body = match parse_proposal(&response.content) {
            Ok(body) => Value::Object(body),
            Err(e) => {
                warn!(squad_id, error = %e, "failed to parse proposal from model output");
                self.logger
                    .log(ExecutionRecord {
                        usage: Some(response.usage),
                        execution_time_ms: Some(response.execution_time_ms),
                        success: false,
                        error_message: Some(e.to_string()),
                        ..attempt
                    })
                    .await;
                return Err(ServiceError::Upstream(UPSTREAM_MESSAGE.into()));
            }
        };

        let drafts = decompose(&body);
        let proposal_id = self
            .store
            .insert_proposal(NewProposal {
                squad_id,
                workspace_id,
                source_context: source,
                input_snapshot: ctx.snapshot(source),
                proposal: body,
                model: response.model.clone(),
                prompt_version_id: Some(prompt.id),
                created_by: actor.to_string(),
            })
            .await?;

        self.logger
            .log(ExecutionRecord {
                proposal_id: Some(proposal_id),
                usage: Some(response.usage),
                execution_time_ms: Some(response.execution_time_ms),
                success: true,
                ..attempt
            })
            .await;

        let created = self
            .store
            .run(move |conn| -> Result<usize, ServiceError> {
                let tx = conn.unchecked_transaction()?;
                let n = insert_suggestions(&tx, proposal_id, squad_id, &drafts)?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        info!(
            squad_id,
            proposal_id,
            suggestions = created,
            source = source.as_str(),
            "structure proposal generated"
        );

        Ok(GeneratedProposal {
            proposal: self.store.get_proposal(proposal_id).await?,
            suggestions: self.store.list_suggestions(proposal_id).await?,
        })
    }

    // -------------------------------------------------------------------------
    // Proposal lifecycle
    // -------------------------------------------------------------------------

    pub async fn confirm_proposal(
        &self,
        proposal_id: i64,
        actor: &str,
    ) -> Result<Proposal, ServiceError> {
        self.close_proposal(proposal_id, actor, ProposalStatus::Confirmed)
            .await
    }

    pub async fn discard_proposal(
        &self,
        proposal_id: i64,
        actor: &str,
    ) -> Result<Proposal, ServiceError> {
        self.close_proposal(proposal_id, actor, ProposalStatus::Discarded)
            .await
    }

    async fn close_proposal(
        &self,
        proposal_id: i64,
        actor: &str,
        status: ProposalStatus,
    ) -> Result<Proposal, ServiceError> {
        let actor = actor.to_string();
        let proposal = self
            .store
            .run(move |conn| -> Result<Proposal, ServiceError> {
                let proposal = load_proposal(conn, proposal_id)?;
                let squad = load_squad(conn, proposal.squad_id)?;
                ensure_member(conn, squad.workspace_id, &actor)?;

                let tx = conn.unchecked_transaction()?;
                let rows = tx.execute(
                    "UPDATE structure_proposals SET status = ?1, decided_by = ?2, \
                     decided_at = ?3, updated_at = ?3 WHERE id = ?4 AND status = ?5",
                    params![
                        status.as_str(),
                        actor,
                        now_epoch(),
                        proposal_id,
                        ProposalStatus::Draft.as_str()
                    ],
                )?;
                if rows == 0 {
                    return Err(ServiceError::Conflict(format!(
                        "proposal {proposal_id} is {}, not DRAFT",
                        proposal.status.as_str()
                    )));
                }

                let audit = ProposalAudit {
                    proposal_id,
                    model: proposal.model.clone(),
                    suggestion_count: count_suggestions(&tx, proposal_id)?,
                };
                let record = match status {
                    ProposalStatus::Discarded => DecisionRecord::ProposalDiscarded(audit),
                    _ => DecisionRecord::ProposalConfirmed(audit),
                };
                decision::append(&tx, squad.id, &record, Some(&actor))?;
                tx.commit()?;
                Ok(load_proposal(conn, proposal_id)?)
            })
            .await?;
        info!(proposal_id, status = status.as_str(), "structure proposal closed");
        Ok(proposal)
    }

    /// Decompose an existing proposal into pending suggestions. At most once per
    /// proposal; returns the number created.
    pub async fn breakdown(&self, proposal_id: i64, actor: &str) -> Result<usize, ServiceError> {
        let actor = actor.to_string();
        let created = self
            .store
            .run(move |conn| -> Result<usize, ServiceError> {
                let proposal = load_proposal(conn, proposal_id)?;
                let squad = load_squad(conn, proposal.squad_id)?;
                ensure_member(conn, squad.workspace_id, &actor)?;
                if proposal.status == ProposalStatus::Discarded {
                    return Err(ServiceError::Conflict(format!(
                        "proposal {proposal_id} was discarded"
                    )));
                }

                let tx = conn.unchecked_transaction()?;
                if count_suggestions(&tx, proposal_id)? > 0 {
                    return Err(ServiceError::Conflict(format!(
                        "proposal {proposal_id} already has suggestions"
                    )));
                }
                let drafts = decompose(&proposal.proposal);
                let created = match insert_suggestions(&tx, proposal_id, squad.id, &drafts) {
                    Ok(n) => n,
                    Err(e) if is_unique_violation(&e) => {
                        return Err(ServiceError::Conflict(format!(
                            "proposal {proposal_id} already has suggestions"
                        )))
                    }
                    Err(e) => return Err(e.into()),
                };
                tx.commit()?;
                Ok(created)
            })
            .await?;
        info!(proposal_id, created, "proposal broken down into suggestions");
        Ok(created)
    }

    // -------------------------------------------------------------------------
    // Suggestion review
    // -------------------------------------------------------------------------

    pub async fn list_pending(
        &self,
        squad_id: i64,
        actor: &str,
    ) -> Result<Vec<Suggestion>, ServiceError> {
        let squad = self.store.get_squad(squad_id).await?;
        self.ensure_member(squad.workspace_id, actor).await?;
        Ok(self.store.list_pending_suggestions(squad_id).await?)
    }

    /// Approve a pending suggestion, dispatching either its own payload or
    /// `edited_payload`. The status flip, the dispatch and the audit record commit
    /// together; on any failure the suggestion stays pending.
    pub async fn approve(
        &self,
        suggestion_id: i64,
        actor: &str,
        edited_payload: Option<Value>,
    ) -> Result<DecidedSuggestion, ServiceError> {
        let actor = actor.to_string();
        let decided = self
            .store
            .run(move |conn| approve_in(conn, suggestion_id, &actor, edited_payload))
            .await?;
        info!(
            suggestion_id,
            kind = %decided.suggestion.suggestion_type,
            status = decided.suggestion.status.as_str(),
            "suggestion approved"
        );
        Ok(decided)
    }

    pub async fn reject(
        &self,
        suggestion_id: i64,
        actor: &str,
        reason: Option<String>,
    ) -> Result<DecidedSuggestion, ServiceError> {
        let actor = actor.to_string();
        let decided = self
            .store
            .run(move |conn| reject_in(conn, suggestion_id, &actor, reason))
            .await?;
        info!(
            suggestion_id,
            kind = %decided.suggestion.suggestion_type,
            "suggestion rejected"
        );
        Ok(decided)
    }

    async fn ensure_member(&self, workspace_id: i64, actor: &str) -> Result<(), ServiceError> {
        if actor.trim().is_empty() {
            return Err(ServiceError::Unauthorized);
        }
        if !self.store.is_member(workspace_id, actor).await? {
            return Err(ServiceError::Forbidden(format!(
                "not a member of workspace {workspace_id}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Transactional steps
// =============================================================================

fn ensure_member(conn: &Connection, workspace_id: i64, actor: &str) -> Result<(), ServiceError> {
    if actor.trim().is_empty() {
        return Err(ServiceError::Unauthorized);
    }
    if !store::is_member(conn, workspace_id, actor)? {
        return Err(ServiceError::Forbidden(format!(
            "not a member of workspace {workspace_id}"
        )));
    }
    Ok(())
}

/// Load a suggestion for a decision and check the caller may decide it.
fn open_for_decision(
    conn: &Connection,
    suggestion_id: i64,
    actor: &str,
) -> Result<(Suggestion, Proposal), ServiceError> {
    let suggestion = load_suggestion(conn, suggestion_id)?;
    let proposal = load_proposal(conn, suggestion.proposal_id)?;
    ensure_member(conn, proposal.workspace_id, actor)?;
    if suggestion.status.is_terminal() {
        return Err(ServiceError::Conflict(format!(
            "suggestion {suggestion_id} is already {}",
            suggestion.status.as_str()
        )));
    }
    if proposal.status == ProposalStatus::Discarded {
        return Err(ServiceError::Conflict(format!(
            "proposal {} was discarded",
            proposal.id
        )));
    }
    Ok((suggestion, proposal))
}

/// Flip `pending` to `status` only if still pending. Returns false when another
/// decision got there first.
fn mark_decided(
    conn: &Connection,
    suggestion_id: i64,
    status: SuggestionStatus,
    edited_payload: Option<&Value>,
    reason: Option<&str>,
    actor: &str,
) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "UPDATE proposal_suggestions SET status = ?1, edited_payload = ?2, \
         decision_reason = ?3, decided_by = ?4, decided_at = ?5 \
         WHERE id = ?6 AND status = ?7",
        params![
            status.as_str(),
            edited_payload.map(Value::to_string),
            reason,
            actor,
            now_epoch(),
            suggestion_id,
            SuggestionStatus::Pending.as_str(),
        ],
    )?;
    Ok(rows == 1)
}

fn approve_in(
    conn: &Connection,
    suggestion_id: i64,
    actor: &str,
    edited_payload: Option<Value>,
) -> Result<DecidedSuggestion, ServiceError> {
    let (suggestion, proposal) = open_for_decision(conn, suggestion_id, actor)?;
    let status = if edited_payload.is_some() {
        SuggestionStatus::ApprovedWithEdits
    } else {
        SuggestionStatus::Approved
    };

    let tx = conn.unchecked_transaction()?;
    if !mark_decided(&tx, suggestion_id, status, edited_payload.as_ref(), None, actor)? {
        return Err(ServiceError::Conflict(format!(
            "suggestion {suggestion_id} was decided concurrently"
        )));
    }

    let payload = edited_payload.as_ref().unwrap_or(&suggestion.payload);
    let ctx = PersistContext {
        squad_id: suggestion.squad_id,
        workspace_id: proposal.workspace_id,
        actor,
    };
    let outcome = persist_tagged(&tx, &suggestion.suggestion_type, payload, &ctx)?;

    let audit = SuggestionAudit {
        suggestion_id,
        proposal_id: suggestion.proposal_id,
        suggestion_type: suggestion.suggestion_type.clone(),
        display_order: suggestion.display_order,
        reason: None,
        outcome: serde_json::to_value(&outcome).ok(),
    };
    let record = match status {
        SuggestionStatus::ApprovedWithEdits => DecisionRecord::SuggestionApprovedWithEdits(audit),
        _ => DecisionRecord::SuggestionApproved(audit),
    };
    decision::append(&tx, suggestion.squad_id, &record, Some(actor))?;
    tx.commit()?;

    Ok(DecidedSuggestion {
        suggestion: load_suggestion(conn, suggestion_id)?,
        outcome: Some(outcome),
    })
}

fn reject_in(
    conn: &Connection,
    suggestion_id: i64,
    actor: &str,
    reason: Option<String>,
) -> Result<DecidedSuggestion, ServiceError> {
    let (suggestion, _) = open_for_decision(conn, suggestion_id, actor)?;
    let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());

    let tx = conn.unchecked_transaction()?;
    if !mark_decided(
        &tx,
        suggestion_id,
        SuggestionStatus::Rejected,
        None,
        reason.as_deref(),
        actor,
    )? {
        return Err(ServiceError::Conflict(format!(
            "suggestion {suggestion_id} was decided concurrently"
        )));
    }
    let audit = SuggestionAudit {
        suggestion_id,
        proposal_id: suggestion.proposal_id,
        suggestion_type: suggestion.suggestion_type.clone(),
        display_order: suggestion.display_order,
        reason,
        outcome: None,
    };
    decision::append(
        &tx,
        suggestion.squad_id,
        &DecisionRecord::SuggestionRejected(audit),
        Some(actor),
    )?;
    tx.commit()?;

    Ok(DecidedSuggestion {
        suggestion: load_suggestion(conn, suggestion_id)?,
        outcome: None,
    })
}
