//! Type-dispatched, idempotent persistence of approved suggestions.
//!
//! Every function takes a plain `&Connection` so the caller decides the transaction
//! boundary. Approval runs the whole dispatch plus the status flip in one transaction,
//! so a failure here leaves the suggestion pending.
//!
//! Identity rules per target:
//! - decision-log kinds append a new record on every approval.
//! - persona: case-insensitive trimmed name within the workspace.
//! - role: case-insensitive label across global then workspace roles, then the
//!   derived code within the workspace.
//! - phase: case-insensitive trimmed name within the squad; appended after the
//!   current maximum order index.
//!
//! Link rows are written insert-or-ignore and then re-read; a missing link after the
//! write is a hard failure.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::decision::{self, DecisionRecord, PROBLEM_STATEMENT_TITLE};
use super::decompose::{SuggestionType, UnknownSuggestionType};
use super::store::{now_epoch, SquadStatus};

static NON_CODE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9\s_-]").expect("Invalid role code regex"));

static CODE_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s_-]+").expect("Invalid role separator regex"));

// =============================================================================
// Types
// =============================================================================

/// Who and where an approved suggestion is persisted for.
#[derive(Debug, Clone, Copy)]
pub struct PersistContext<'a> {
    pub squad_id: i64,
    pub workspace_id: i64,
    pub actor: &'a str,
}

/// What a dispatch wrote. Embedded in the approval's audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PersistOutcome {
    DecisionRecorded {
        decision_id: i64,
    },
    MaturityPatched {
        decision_id: i64,
    },
    /// No Problem Statement exists for the squad; nothing was written.
    MaturitySkipped,
    PersonaLinked {
        persona_id: i64,
        created: bool,
        linked: bool,
    },
    RoleLinked {
        global_role_id: Option<i64>,
        workspace_role_id: Option<i64>,
        created: bool,
        linked: bool,
    },
    PhasesAppended {
        inserted: Vec<String>,
        skipped: Vec<String>,
    },
    ReadinessSet {
        status: SquadStatus,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    UnknownType(#[from] UnknownSuggestionType),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        kind: SuggestionType,
        reason: String,
    },
    #[error("post-write verification failed: {0}")]
    VerificationFailed(String),
    #[error("squad {0} not found")]
    SquadNotFound(i64),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PersistError {
    fn invalid(kind: SuggestionType, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatch on a stored type tag. An unrecognised tag is a hard failure.
pub fn persist_tagged(
    conn: &Connection,
    tag: &str,
    payload: &Value,
    ctx: &PersistContext<'_>,
) -> Result<PersistOutcome, PersistError> {
    let kind: SuggestionType = tag.parse()?;
    persist(conn, kind, payload, ctx)
}

pub fn persist(
    conn: &Connection,
    kind: SuggestionType,
    payload: &Value,
    ctx: &PersistContext<'_>,
) -> Result<PersistOutcome, PersistError> {
    debug!(kind = %kind, squad_id = ctx.squad_id, "persisting suggestion");
    match kind {
        SuggestionType::DecisionContext => {
            append(conn, ctx, DecisionRecord::DecisionContext(payload.clone()))
        }
        SuggestionType::Governance => append(conn, ctx, DecisionRecord::Governance(payload.clone())),
        SuggestionType::CriticalUnknown => {
            append(conn, ctx, DecisionRecord::CriticalUnknown(payload.clone()))
        }
        SuggestionType::ExecutionModel => {
            append(conn, ctx, DecisionRecord::ExecutionModel(payload.clone()))
        }
        SuggestionType::ValidationStrategy => {
            append(conn, ctx, DecisionRecord::ValidationStrategy(payload.clone()))
        }
        SuggestionType::ProblemMaturity => patch_problem_maturity(conn, ctx, payload),
        SuggestionType::Persona => persist_persona(conn, ctx, payload),
        SuggestionType::SquadStructureRole => persist_role(conn, ctx, payload),
        SuggestionType::Phase => persist_phases(conn, ctx, payload),
        SuggestionType::ReadinessAssessment => set_readiness(conn, ctx, payload),
    }
}

fn append(
    conn: &Connection,
    ctx: &PersistContext<'_>,
    record: DecisionRecord,
) -> Result<PersistOutcome, PersistError> {
    let decision_id = decision::append(conn, ctx.squad_id, &record, Some(ctx.actor))?;
    Ok(PersistOutcome::DecisionRecorded { decision_id })
}

// =============================================================================
// Problem maturity
// =============================================================================

fn patch_problem_maturity(
    conn: &Connection,
    ctx: &PersistContext<'_>,
    payload: &Value,
) -> Result<PersistOutcome, PersistError> {
    let level = first_str(payload, &["level", "maturity_level"]);
    let rationale = first_str(payload, &["rationale", "justification", "maturity_rationale"]);
    if level.is_none() && rationale.is_none() {
        return Err(PersistError::invalid(
            SuggestionType::ProblemMaturity,
            "expected a level or rationale",
        ));
    }

    let statement_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM decisions WHERE squad_id = ?1 AND title = ?2 \
             ORDER BY id DESC LIMIT 1",
            params![ctx.squad_id, PROBLEM_STATEMENT_TITLE],
            |row| row.get(0),
        )
        .optional()?;

    let Some(decision_id) = statement_id else {
        warn!(
            squad_id = ctx.squad_id,
            "no Problem Statement decision; skipping maturity update"
        );
        return Ok(PersistOutcome::MaturitySkipped);
    };

    // Only present fields are set; absent ones are left untouched (or absent).
    let mut paths = Vec::new();
    let mut args: Vec<&dyn ToSql> = Vec::new();
    if let Some(level) = &level {
        paths.push("'$.maturity_level', ?");
        args.push(level);
    }
    if let Some(rationale) = &rationale {
        paths.push("'$.maturity_rationale', ?");
        args.push(rationale);
    }
    args.push(&decision_id);
    conn.execute(
        &format!(
            "UPDATE decisions SET body = json_set(body, {}) WHERE id = ?",
            paths.join(", ")
        ),
        args.as_slice(),
    )?;
    Ok(PersistOutcome::MaturityPatched { decision_id })
}

// =============================================================================
// Persona
// =============================================================================

fn persist_persona(
    conn: &Connection,
    ctx: &PersistContext<'_>,
    payload: &Value,
) -> Result<PersistOutcome, PersistError> {
    let name = name_field(payload, &["name"])
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| PersistError::invalid(SuggestionType::Persona, "missing name"))?;

    let (persona_id, created) = match find_persona(conn, ctx.workspace_id, name)? {
        Some(id) => (id, false),
        None => {
            conn.execute(
                "INSERT INTO personas (workspace_id, name, description, details, created_by, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ctx.workspace_id,
                    name,
                    first_str(payload, &["description"]),
                    payload.to_string(),
                    ctx.actor,
                    now_epoch(),
                ],
            )?;
            (conn.last_insert_rowid(), true)
        }
    };

    let linked = conn.execute(
        "INSERT INTO squad_personas (squad_id, persona_id, created_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(squad_id, persona_id) DO NOTHING",
        params![ctx.squad_id, persona_id, now_epoch()],
    )? == 1;

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM squad_personas WHERE squad_id = ?1 AND persona_id = ?2)",
        params![ctx.squad_id, persona_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(PersistError::VerificationFailed(format!(
            "persona {persona_id} not linked to squad {}",
            ctx.squad_id
        )));
    }

    Ok(PersistOutcome::PersonaLinked {
        persona_id,
        created,
        linked,
    })
}

fn find_persona(
    conn: &Connection,
    workspace_id: i64,
    name: &str,
) -> Result<Option<i64>, PersistError> {
    let key = identity_key(name);
    let mut stmt =
        conn.prepare("SELECT id, name FROM personas WHERE workspace_id = ?1 ORDER BY id")?;
    let mut rows = stmt.query(params![workspace_id])?;
    while let Some(row) = rows.next()? {
        let existing: String = row.get(1)?;
        if identity_key(&existing) == key {
            return Ok(Some(row.get(0)?));
        }
    }
    Ok(None)
}

// =============================================================================
// Roles
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleRef {
    Global(i64),
    Workspace(i64),
}

impl RoleRef {
    fn columns(self) -> (Option<i64>, Option<i64>) {
        match self {
            Self::Global(id) => (Some(id), None),
            Self::Workspace(id) => (None, Some(id)),
        }
    }
}

fn persist_role(
    conn: &Connection,
    ctx: &PersistContext<'_>,
    payload: &Value,
) -> Result<PersistOutcome, PersistError> {
    let label = name_field(payload, &["label", "role", "name"])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| PersistError::invalid(SuggestionType::SquadStructureRole, "missing label"))?;

    let code = derive_role_code(label);
    let (role, created) = match find_role(conn, ctx.workspace_id, label, &code)? {
        Some(role) => (role, false),
        None => {
            conn.execute(
                "INSERT INTO workspace_roles (workspace_id, code, label, description, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ctx.workspace_id,
                    code,
                    label,
                    first_str(payload, &["description"]),
                    now_epoch(),
                ],
            )?;
            (RoleRef::Workspace(conn.last_insert_rowid()), true)
        }
    };

    let (global_role_id, workspace_role_id) = role.columns();
    let linked = if squad_role_exists(conn, ctx.squad_id, role)? {
        false
    } else {
        let responsibilities = payload
            .get("responsibilities")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        conn.execute(
            "INSERT INTO squad_roles (squad_id, global_role_id, workspace_role_id, \
             responsibilities, created_at) VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT DO NOTHING",
            params![
                ctx.squad_id,
                global_role_id,
                workspace_role_id,
                responsibilities.to_string(),
                now_epoch(),
            ],
        )? == 1
    };

    if !squad_role_exists(conn, ctx.squad_id, role)? {
        return Err(PersistError::VerificationFailed(format!(
            "role {role:?} not active in squad {}",
            ctx.squad_id
        )));
    }

    Ok(PersistOutcome::RoleLinked {
        global_role_id,
        workspace_role_id,
        created,
        linked,
    })
}

/// Label match across global then workspace roles, then a code match within the
/// workspace so the (workspace, code) constraint never rejects a create.
fn find_role(
    conn: &Connection,
    workspace_id: i64,
    label: &str,
    code: &str,
) -> Result<Option<RoleRef>, PersistError> {
    let key = identity_key(label);

    let mut stmt = conn.prepare("SELECT id, label FROM global_roles ORDER BY id")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if identity_key(&row.get::<_, String>(1)?) == key {
            return Ok(Some(RoleRef::Global(row.get(0)?)));
        }
    }

    let mut stmt =
        conn.prepare("SELECT id, label, code FROM workspace_roles WHERE workspace_id = ?1 ORDER BY id")?;
    let mut by_code = None;
    let mut rows = stmt.query(params![workspace_id])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        if identity_key(&row.get::<_, String>(1)?) == key {
            return Ok(Some(RoleRef::Workspace(id)));
        }
        if by_code.is_none() && row.get::<_, String>(2)? == code {
            by_code = Some(RoleRef::Workspace(id));
        }
    }
    Ok(by_code)
}

fn squad_role_exists(conn: &Connection, squad_id: i64, role: RoleRef) -> rusqlite::Result<bool> {
    let (sql, role_id) = match role {
        RoleRef::Global(id) => (
            "SELECT EXISTS(SELECT 1 FROM squad_roles WHERE squad_id = ?1 AND global_role_id = ?2)",
            id,
        ),
        RoleRef::Workspace(id) => (
            "SELECT EXISTS(SELECT 1 FROM squad_roles WHERE squad_id = ?1 AND workspace_role_id = ?2)",
            id,
        ),
    };
    conn.query_row(sql, params![squad_id, role_id], |row| row.get(0))
}

/// Machine code for a role label: lower-case, punctuation dropped, runs of
/// whitespace / `_` / `-` collapsed to one `_`. Falls back to a time-based code when
/// nothing survives.
pub fn derive_role_code(label: &str) -> String {
    let lower = label.to_lowercase();
    let stripped = NON_CODE_CHARS.replace_all(&lower, "");
    let collapsed = CODE_SEPARATORS.replace_all(&stripped, "_");
    let code = collapsed.trim_matches('_');
    if code.is_empty() {
        fallback_role_code()
    } else {
        code.to_string()
    }
}

fn fallback_role_code() -> String {
    format!(
        "role_{}_{:08x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

// =============================================================================
// Phases
// =============================================================================

fn persist_phases(
    conn: &Connection,
    ctx: &PersistContext<'_>,
    payload: &Value,
) -> Result<PersistOutcome, PersistError> {
    let items = payload
        .as_array()
        .ok_or_else(|| PersistError::invalid(SuggestionType::Phase, "expected an array"))?;

    let mut stmt = conn.prepare(
        "SELECT name, order_index FROM squad_phases WHERE squad_id = ?1 \
         ORDER BY order_index DESC",
    )?;
    let existing = stmt
        .query_map(params![ctx.squad_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let max_order = existing.first().map(|(_, order)| *order).unwrap_or(0);
    let mut known: HashSet<String> = existing.iter().map(|(name, _)| identity_key(name)).collect();

    let mut inserted = Vec::new();
    let mut skipped = Vec::new();
    for item in items {
        let (name, description) = match item {
            Value::String(name) => (Some(name.as_str()), None),
            Value::Object(_) => (
                first_str(item, &["name", "phase"]),
                first_str(item, &["description"]),
            ),
            _ => (None, None),
        };
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            warn!(squad_id = ctx.squad_id, "skipping phase without a name");
            continue;
        };
        if !known.insert(identity_key(name)) {
            skipped.push(name.to_string());
            continue;
        }
        let order_index = max_order + inserted.len() as i64 + 1;
        conn.execute(
            "INSERT INTO squad_phases (squad_id, name, description, order_index, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ctx.squad_id, name, description, order_index, now_epoch()],
        )?;
        inserted.push(name.to_string());
    }

    Ok(PersistOutcome::PhasesAppended { inserted, skipped })
}

// =============================================================================
// Readiness
// =============================================================================

fn set_readiness(
    conn: &Connection,
    ctx: &PersistContext<'_>,
    payload: &Value,
) -> Result<PersistOutcome, PersistError> {
    let ready = ["ready_to_build", "readyToBuild"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_bool))
        .unwrap_or(false);
    let status = if ready {
        SquadStatus::ReadyToBuild
    } else {
        SquadStatus::NeedsDiscovery
    };

    let rows = conn.execute(
        "UPDATE squads SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_epoch(), ctx.squad_id],
    )?;
    if rows == 0 {
        return Err(PersistError::SquadNotFound(ctx.squad_id));
    }
    Ok(PersistOutcome::ReadinessSet { status })
}

// =============================================================================
// Helpers
// =============================================================================

fn identity_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn first_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
}

/// A bare string payload is the name itself.
fn name_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    match payload {
        Value::String(name) => Some(name),
        _ => first_str(payload, keys),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::decision::ProblemStatement;
    use crate::structure::store::SquadStore;
    use serde_json::json;

    /// In-memory connection with the store's schema and one workspace + squad.
    fn fixture() -> (Connection, i64, i64) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("persist.sqlite");
        drop(SquadStore::new(&path).expect("schema"));
        let conn = Connection::open(&path).expect("open");
        std::mem::forget(dir);
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        conn.execute("INSERT INTO workspaces (name, created_at) VALUES ('Acme', 0)", [])
            .unwrap();
        let ws = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO squads (workspace_id, name, created_at, updated_at) VALUES (?1, 'Payments', 0, 0)",
            params![ws],
        )
        .unwrap();
        let squad = conn.last_insert_rowid();
        (conn, ws, squad)
    }

    fn ctx(ws: i64, squad: i64) -> PersistContext<'static> {
        PersistContext {
            squad_id: squad,
            workspace_id: ws,
            actor: "u-1",
        }
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn role_code_derivation() {
        assert_eq!(derive_role_code("Tech Lead!"), "tech_lead");
        assert_eq!(derive_role_code("  Front-end -- Dev "), "front_end_dev");
        assert_eq!(derive_role_code("QA_/_Release"), "qa_release");

        let a = derive_role_code("");
        let b = derive_role_code("!!!");
        assert!(a.starts_with("role_") && a.len() > "role_".len());
        assert!(b.starts_with("role_"));
        assert_ne!(derive_role_code(""), derive_role_code(""));
    }

    #[test]
    fn persona_dedup_is_case_and_space_insensitive() {
        let (conn, ws, squad) = fixture();
        let c = ctx(ws, squad);

        let first = persist(&conn, SuggestionType::Persona, &json!({"name": "Ops Lead"}), &c).unwrap();
        let second =
            persist(&conn, SuggestionType::Persona, &json!({"name": "  ops lead "}), &c).unwrap();

        match (first, second) {
            (
                PersistOutcome::PersonaLinked { persona_id: a, created: true, linked: true },
                PersistOutcome::PersonaLinked { persona_id: b, created: false, linked: false },
            ) => assert_eq!(a, b),
            other => panic!("unexpected outcomes: {other:?}"),
        }
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM personas"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM squad_personas"), 1);
    }

    #[test]
    fn bare_string_payloads_name_persona_and_role() {
        let (conn, ws, squad) = fixture();
        let c = ctx(ws, squad);

        let persona = persist(&conn, SuggestionType::Persona, &json!("Ops"), &c).unwrap();
        assert!(matches!(persona, PersistOutcome::PersonaLinked { created: true, .. }));
        let name: String = conn
            .query_row("SELECT name FROM personas", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Ops");

        let role =
            persist(&conn, SuggestionType::SquadStructureRole, &json!("Data Steward"), &c).unwrap();
        assert!(matches!(role, PersistOutcome::RoleLinked { created: true, .. }));
        let code: String = conn
            .query_row("SELECT code FROM workspace_roles", [], |r| r.get(0))
            .unwrap();
        assert_eq!(code, "data_steward");

        assert!(persist(&conn, SuggestionType::Persona, &json!(7), &c).is_err());
    }

    #[test]
    fn persona_requires_name() {
        let (conn, ws, squad) = fixture();
        let err = persist(&conn, SuggestionType::Persona, &json!({"name": "  "}), &ctx(ws, squad))
            .unwrap_err();
        assert!(matches!(err, PersistError::InvalidPayload { .. }));
    }

    #[test]
    fn role_reuses_global_by_label() {
        let (conn, ws, squad) = fixture();
        let c = ctx(ws, squad);
        let outcome =
            persist(&conn, SuggestionType::SquadStructureRole, &json!({"label": "tech lead"}), &c)
                .unwrap();
        assert!(matches!(
            outcome,
            PersistOutcome::RoleLinked { global_role_id: Some(_), workspace_role_id: None, created: false, linked: true }
        ));
        let again =
            persist(&conn, SuggestionType::SquadStructureRole, &json!({"label": "Tech Lead"}), &c)
                .unwrap();
        assert!(matches!(again, PersistOutcome::RoleLinked { linked: false, .. }));
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM squad_roles"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM workspace_roles"), 0);
    }

    #[test]
    fn role_creates_workspace_role_once() {
        let (conn, ws, squad) = fixture();
        let c = ctx(ws, squad);
        persist(&conn, SuggestionType::SquadStructureRole, &json!({"label": "Growth Hacker"}), &c)
            .unwrap();
        // Same code, different label spelling.
        let outcome = persist(
            &conn,
            SuggestionType::SquadStructureRole,
            &json!({"role": "growth-hacker"}),
            &c,
        )
        .unwrap();
        assert!(matches!(
            outcome,
            PersistOutcome::RoleLinked { workspace_role_id: Some(_), created: false, linked: false, .. }
        ));
        let code: String = conn
            .query_row("SELECT code FROM workspace_roles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(code, "growth_hacker");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM squad_roles"), 1);
    }

    #[test]
    fn phases_append_after_existing_max() {
        let (conn, ws, squad) = fixture();
        conn.execute(
            "INSERT INTO squad_phases (squad_id, name, order_index, created_at) VALUES (?1, 'Discovery', 1, 0)",
            params![squad],
        )
        .unwrap();

        let outcome = persist(
            &conn,
            SuggestionType::Phase,
            &json!(["Discovery", {"name": "Build"}, "build", {"description": "no name"}]),
            &ctx(ws, squad),
        )
        .unwrap();
        assert_eq!(
            outcome,
            PersistOutcome::PhasesAppended {
                inserted: vec!["Build".into()],
                skipped: vec!["Discovery".into(), "build".into()],
            }
        );
        let order: i64 = conn
            .query_row("SELECT order_index FROM squad_phases WHERE name = 'Build'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(order, 2);
    }

    #[test]
    fn phases_on_empty_squad_start_at_one() {
        let (conn, ws, squad) = fixture();
        persist(&conn, SuggestionType::Phase, &json!(["A", "B", "C"]), &ctx(ws, squad)).unwrap();
        let orders: Vec<i64> = conn
            .prepare("SELECT order_index FROM squad_phases ORDER BY order_index")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn maturity_patches_latest_problem_statement() {
        let (conn, ws, squad) = fixture();
        let c = ctx(ws, squad);

        let skipped =
            persist(&conn, SuggestionType::ProblemMaturity, &json!({"level": "idea"}), &c).unwrap();
        assert_eq!(skipped, PersistOutcome::MaturitySkipped);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM decisions"), 0);

        let record = DecisionRecord::ProblemStatement(ProblemStatement {
            statement: "Churn is rising".into(),
            ..Default::default()
        });
        let id = decision::append(&conn, squad, &record, None).unwrap();
        let patched = persist(
            &conn,
            SuggestionType::ProblemMaturity,
            &json!({"level": "validated", "rationale": "3 interviews"}),
            &c,
        )
        .unwrap();
        assert_eq!(patched, PersistOutcome::MaturityPatched { decision_id: id });

        let body: String = conn
            .query_row("SELECT body FROM decisions WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["statement"], "Churn is rising");
        assert_eq!(body["maturity_level"], "validated");
        assert_eq!(body["maturity_rationale"], "3 interviews");
    }

    #[test]
    fn maturity_patch_leaves_absent_fields_alone() {
        let (conn, ws, squad) = fixture();
        let record = DecisionRecord::ProblemStatement(ProblemStatement {
            statement: "Churn is rising".into(),
            ..Default::default()
        });
        let id = decision::append(&conn, squad, &record, None).unwrap();
        persist(
            &conn,
            SuggestionType::ProblemMaturity,
            &json!({"justification": "support tickets"}),
            &ctx(ws, squad),
        )
        .unwrap();

        let body: String = conn
            .query_row("SELECT body FROM decisions WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["maturity_rationale"], "support tickets");
        assert!(body.get("maturity_level").is_none(), "{body}");
    }

    #[test]
    fn decision_kinds_always_append() {
        let (conn, ws, squad) = fixture();
        let c = ctx(ws, squad);
        let payload = json!({"decision_model": "consent"});
        persist(&conn, SuggestionType::Governance, &payload, &c).unwrap();
        persist(&conn, SuggestionType::Governance, &payload, &c).unwrap();
        assert_eq!(
            count(&conn, "SELECT COUNT(*) FROM decisions WHERE title = 'Governance'"),
            2
        );
    }

    #[test]
    fn readiness_sets_squad_status() {
        let (conn, ws, squad) = fixture();
        let outcome = persist(
            &conn,
            SuggestionType::ReadinessAssessment,
            &json!({"readyToBuild": true}),
            &ctx(ws, squad),
        )
        .unwrap();
        assert_eq!(
            outcome,
            PersistOutcome::ReadinessSet { status: SquadStatus::ReadyToBuild }
        );

        let err = persist(
            &conn,
            SuggestionType::ReadinessAssessment,
            &json!({"ready_to_build": false}),
            &ctx(ws, squad + 100),
        )
        .unwrap_err();
        assert!(matches!(err, PersistError::SquadNotFound(_)));
    }

    #[test]
    fn unknown_tag_fails_loudly() {
        let (conn, ws, squad) = fixture();
        let err = persist_tagged(&conn, "team_charter", &json!({}), &ctx(ws, squad)).unwrap_err();
        assert!(matches!(err, PersistError::UnknownType(_)));
    }
}
