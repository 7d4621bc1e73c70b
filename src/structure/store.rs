//! SQLite-backed store for squads, structure proposals, suggestions and the domain
//! tables approved suggestions land in.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

use crate::prompts::DEFAULT_PROMPT;

use super::decision::{self, DecisionRecord, PROBLEM_STATEMENT_TITLE};
use super::decompose::SuggestionDraft;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Draft,
    Confirmed,
    Discarded,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Confirmed => "CONFIRMED",
            Self::Discarded => "DISCARDED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "CONFIRMED" => Self::Confirmed,
            "DISCARDED" => Self::Discarded,
            _ => Self::Draft,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    ApprovedWithEdits,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::ApprovedWithEdits => "approved_with_edits",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "approved_with_edits" => Self::ApprovedWithEdits,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Which inputs a proposal was generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceContext {
    Problem,
    Backlog,
    Both,
}

impl SourceContext {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Problem => "PROBLEM",
            Self::Backlog => "BACKLOG",
            Self::Both => "BOTH",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PROBLEM" => Self::Problem,
            "BACKLOG" => Self::Backlog,
            _ => Self::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SquadStatus {
    Forming,
    ReadyToBuild,
    NeedsDiscovery,
}

impl SquadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::ReadyToBuild => "ready_to_build",
            Self::NeedsDiscovery => "needs_discovery",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ready_to_build" => Self::ReadyToBuild,
            "needs_discovery" => Self::NeedsDiscovery,
            _ => Self::Forming,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Squad {
    pub id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: SquadStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: i64,
    pub squad_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    pub squad_id: i64,
    pub title: String,
    pub body: Value,
    pub created_by: Option<String>,
    pub created_at: i64,
}

impl Decision {
    pub fn record(&self) -> Option<DecisionRecord> {
        DecisionRecord::from_parts(&self.title, self.body.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: i64,
    pub workspace_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub details: Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRole {
    pub id: i64,
    pub workspace_id: i64,
    pub code: String,
    pub label: String,
    pub created_at: i64,
}

/// A role activated in a squad, resolved to its label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadRole {
    pub id: i64,
    pub squad_id: i64,
    pub global_role_id: Option<i64>,
    pub workspace_role_id: Option<i64>,
    pub code: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: i64,
    pub squad_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub order_index: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: i64,
    pub prompt_key: String,
    pub version: i64,
    pub system_instructions: String,
    pub user_template: String,
    /// Overrides the configured model when set.
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: i64,
    pub squad_id: i64,
    pub workspace_id: i64,
    pub source_context: SourceContext,
    pub input_snapshot: Value,
    pub proposal: Value,
    pub status: ProposalStatus,
    pub model: String,
    pub prompt_version_id: Option<i64>,
    pub created_by: String,
    pub decided_by: Option<String>,
    pub decided_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields supplied when a proposal is first stored.
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub squad_id: i64,
    pub workspace_id: i64,
    pub source_context: SourceContext,
    pub input_snapshot: Value,
    pub proposal: Value,
    pub model: String,
    pub prompt_version_id: Option<i64>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: i64,
    pub proposal_id: i64,
    pub squad_id: i64,
    /// Stored tag; parsed at dispatch time so an unrecognised tag fails loudly there.
    pub suggestion_type: String,
    pub payload: Value,
    pub display_order: i64,
    pub status: SuggestionStatus,
    pub edited_payload: Option<Value>,
    pub decision_reason: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<i64>,
    pub created_at: i64,
}

/// One row of the execution log, read back with the full column set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: i64,
    pub prompt_version_id: i64,
    pub proposal_id: Option<i64>,
    pub workspace_id: Option<i64>,
    pub total_tokens: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub executed_by: Option<String>,
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store gate closed")]
    Closed,
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Store
// =============================================================================

const GLOBAL_ROLES: &[(&str, &str)] = &[
    ("product_manager", "Product Manager"),
    ("tech_lead", "Tech Lead"),
    ("engineer", "Engineer"),
    ("product_designer", "Product Designer"),
    ("qa_engineer", "QA Engineer"),
    ("data_analyst", "Data Analyst"),
];

#[derive(Clone)]
pub struct SquadStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread waits on the
    /// mutex at a time.
    sem: Arc<Semaphore>,
}

impl SquadStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Self::seed(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SQUAD_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".squad_harness.sqlite")
    }

    /// Lock the connection, recovering from poisoning: the SQLite connection is
    /// still usable after a panic in another holder.
    fn with_conn<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Callers that need several statements to commit together open a transaction
    /// inside `f`; everything in one call is serialized against other store work.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let store = self.clone();
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        self.run(f).await
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workspaces (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               name TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS workspace_members (\
               workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,\
               user_id TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               PRIMARY KEY (workspace_id, user_id)\
             );\
             CREATE TABLE IF NOT EXISTS squads (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,\
               name TEXT NOT NULL,\
               description TEXT,\
               status TEXT NOT NULL DEFAULT 'forming',\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS backlog_items (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               squad_id INTEGER NOT NULL REFERENCES squads(id) ON DELETE CASCADE,\
               title TEXT NOT NULL,\
               description TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS prompt_versions (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               prompt_key TEXT NOT NULL,\
               version INTEGER NOT NULL,\
               system_instructions TEXT NOT NULL,\
               user_template TEXT NOT NULL,\
               model TEXT,\
               temperature REAL,\
               is_active INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL,\
               UNIQUE(prompt_key, version)\
             );\
             CREATE TABLE IF NOT EXISTS prompt_executions (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               prompt_version_id INTEGER NOT NULL REFERENCES prompt_versions(id),\
               proposal_id INTEGER,\
               workspace_id INTEGER,\
               input_tokens INTEGER,\
               output_tokens INTEGER,\
               total_tokens INTEGER,\
               execution_time_ms INTEGER,\
               success INTEGER,\
               error_message TEXT,\
               executed_by TEXT,\
               created_at INTEGER\
             );\
             CREATE TABLE IF NOT EXISTS structure_proposals (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               squad_id INTEGER NOT NULL REFERENCES squads(id) ON DELETE CASCADE,\
               workspace_id INTEGER NOT NULL,\
               source_context TEXT NOT NULL,\
               input_snapshot TEXT NOT NULL,\
               proposal TEXT NOT NULL,\
               status TEXT NOT NULL DEFAULT 'DRAFT',\
               model TEXT NOT NULL,\
               prompt_version_id INTEGER REFERENCES prompt_versions(id),\
               created_by TEXT NOT NULL,\
               decided_by TEXT,\
               decided_at INTEGER,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS proposal_suggestions (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               proposal_id INTEGER NOT NULL REFERENCES structure_proposals(id) ON DELETE CASCADE,\
               squad_id INTEGER NOT NULL,\
               suggestion_type TEXT NOT NULL,\
               payload TEXT NOT NULL,\
               display_order INTEGER NOT NULL,\
               status TEXT NOT NULL DEFAULT 'pending',\
               edited_payload TEXT,\
               decision_reason TEXT,\
               decided_by TEXT,\
               decided_at INTEGER,\
               created_at INTEGER NOT NULL,\
               UNIQUE(proposal_id, display_order)\
             );\
             CREATE TABLE IF NOT EXISTS decisions (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               squad_id INTEGER NOT NULL REFERENCES squads(id) ON DELETE CASCADE,\
               title TEXT NOT NULL,\
               body TEXT NOT NULL,\
               created_by TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS personas (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,\
               name TEXT NOT NULL,\
               description TEXT,\
               details TEXT NOT NULL DEFAULT '{}',\
               created_by TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS squad_personas (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               squad_id INTEGER NOT NULL REFERENCES squads(id) ON DELETE CASCADE,\
               persona_id INTEGER NOT NULL REFERENCES personas(id) ON DELETE CASCADE,\
               created_at INTEGER NOT NULL,\
               UNIQUE(squad_id, persona_id)\
             );\
             CREATE TABLE IF NOT EXISTS global_roles (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               code TEXT NOT NULL UNIQUE,\
               label TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS workspace_roles (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,\
               code TEXT NOT NULL,\
               label TEXT NOT NULL,\
               description TEXT,\
               created_at INTEGER NOT NULL,\
               UNIQUE(workspace_id, code)\
             );\
             CREATE TABLE IF NOT EXISTS squad_roles (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               squad_id INTEGER NOT NULL REFERENCES squads(id) ON DELETE CASCADE,\
               global_role_id INTEGER REFERENCES global_roles(id),\
               workspace_role_id INTEGER REFERENCES workspace_roles(id),\
               responsibilities TEXT NOT NULL DEFAULT '[]',\
               created_at INTEGER NOT NULL,\
               CHECK ((global_role_id IS NULL) <> (workspace_role_id IS NULL))\
             );\
             CREATE TABLE IF NOT EXISTS squad_phases (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               squad_id INTEGER NOT NULL REFERENCES squads(id) ON DELETE CASCADE,\
               name TEXT NOT NULL,\
               description TEXT,\
               order_index INTEGER NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE UNIQUE INDEX IF NOT EXISTS idx_squad_roles_global \
               ON squad_roles(squad_id, global_role_id) WHERE global_role_id IS NOT NULL;\
             CREATE UNIQUE INDEX IF NOT EXISTS idx_squad_roles_workspace \
               ON squad_roles(squad_id, workspace_role_id) WHERE workspace_role_id IS NOT NULL;\
             CREATE INDEX IF NOT EXISTS idx_squads_workspace ON squads(workspace_id);\
             CREATE INDEX IF NOT EXISTS idx_decisions_squad ON decisions(squad_id, title);\
             CREATE INDEX IF NOT EXISTS idx_personas_workspace ON personas(workspace_id);\
             CREATE INDEX IF NOT EXISTS idx_phases_squad ON squad_phases(squad_id, order_index);\
             CREATE INDEX IF NOT EXISTS idx_proposals_squad ON structure_proposals(squad_id);\
             CREATE INDEX IF NOT EXISTS idx_suggestions_squad ON proposal_suggestions(squad_id, status);\
             CREATE INDEX IF NOT EXISTS idx_executions_version ON prompt_executions(prompt_version_id);",
        )?;
        Ok(())
    }

    /// Insert the built-in roles and prompt. Idempotent across opens.
    fn seed(conn: &Connection) -> Result<(), StoreError> {
        for (code, label) in GLOBAL_ROLES {
            conn.execute(
                "INSERT OR IGNORE INTO global_roles (code, label) VALUES (?1, ?2)",
                params![code, label],
            )?;
        }
        let has_active: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM prompt_versions WHERE prompt_key = ?1 AND is_active = 1)",
            params![DEFAULT_PROMPT.key],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO prompt_versions (prompt_key, version, system_instructions, \
             user_template, model, temperature, is_active, created_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6)",
            params![
                DEFAULT_PROMPT.key,
                DEFAULT_PROMPT.version,
                DEFAULT_PROMPT.system,
                DEFAULT_PROMPT.user,
                !has_active,
                now_epoch(),
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Workspaces & squads
    // -------------------------------------------------------------------------

    pub async fn create_workspace(&self, name: &str) -> Result<i64, StoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO workspaces (name, created_at) VALUES (?1, ?2)",
                params![name, now_epoch()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn add_member(&self, workspace_id: i64, user_id: &str) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO workspace_members (workspace_id, user_id, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![workspace_id, user_id, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn is_member(&self, workspace_id: i64, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| is_member(conn, workspace_id, &user_id))
            .await
    }

    pub async fn create_squad(
        &self,
        workspace_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<i64, StoreError> {
        let name = name.to_string();
        let description = description.map(String::from);
        self.call(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO squads (workspace_id, name, description, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    workspace_id,
                    name,
                    description,
                    SquadStatus::Forming.as_str(),
                    now,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_squad(&self, squad_id: i64) -> Result<Squad, StoreError> {
        self.call(move |conn| load_squad(conn, squad_id)).await
    }

    pub async fn add_backlog_item(
        &self,
        squad_id: i64,
        title: &str,
        description: Option<&str>,
    ) -> Result<i64, StoreError> {
        let title = title.to_string();
        let description = description.map(String::from);
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO backlog_items (squad_id, title, description, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![squad_id, title, description, now_epoch()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn list_backlog(&self, squad_id: i64) -> Result<Vec<BacklogItem>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, squad_id, title, description, created_at FROM backlog_items \
                 WHERE squad_id = ?1 ORDER BY id",
            )?;
            let items = stmt
                .query_map(params![squad_id], |row| {
                    Ok(BacklogItem {
                        id: row.get(0)?,
                        squad_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    pub async fn record_decision(
        &self,
        squad_id: i64,
        record: DecisionRecord,
        actor: Option<&str>,
    ) -> Result<i64, StoreError> {
        let actor = actor.map(String::from);
        self.call(move |conn| Ok(decision::append(conn, squad_id, &record, actor.as_deref())?))
            .await
    }

    /// Decision log for a squad, oldest first.
    pub async fn list_decisions(&self, squad_id: i64) -> Result<Vec<Decision>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, squad_id, title, body, created_by, created_at FROM decisions \
                 WHERE squad_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![squad_id], row_to_decision)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn latest_problem_statement(
        &self,
        squad_id: i64,
    ) -> Result<Option<Decision>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, squad_id, title, body, created_by, created_at FROM decisions \
                     WHERE squad_id = ?1 AND title = ?2 ORDER BY id DESC LIMIT 1",
                    params![squad_id, PROBLEM_STATEMENT_TITLE],
                    row_to_decision,
                )
                .optional()?)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Personas, roles, phases
    // -------------------------------------------------------------------------

    pub async fn list_personas(&self, workspace_id: i64) -> Result<Vec<Persona>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, name, description, details, created_at FROM personas \
                 WHERE workspace_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![workspace_id], row_to_persona)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn squad_personas(&self, squad_id: i64) -> Result<Vec<Persona>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.workspace_id, p.name, p.description, p.details, p.created_at \
                 FROM personas p JOIN squad_personas sp ON sp.persona_id = p.id \
                 WHERE sp.squad_id = ?1 ORDER BY sp.id",
            )?;
            let rows = stmt
                .query_map(params![squad_id], row_to_persona)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn workspace_roles(&self, workspace_id: i64) -> Result<Vec<WorkspaceRole>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, code, label, created_at FROM workspace_roles \
                 WHERE workspace_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![workspace_id], |row| {
                    Ok(WorkspaceRole {
                        id: row.get(0)?,
                        workspace_id: row.get(1)?,
                        code: row.get(2)?,
                        label: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn squad_roles(&self, squad_id: i64) -> Result<Vec<SquadRole>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sr.id, sr.squad_id, sr.global_role_id, sr.workspace_role_id, \
                   COALESCE(g.code, w.code), COALESCE(g.label, w.label) \
                 FROM squad_roles sr \
                 LEFT JOIN global_roles g ON g.id = sr.global_role_id \
                 LEFT JOIN workspace_roles w ON w.id = sr.workspace_role_id \
                 WHERE sr.squad_id = ?1 ORDER BY sr.id",
            )?;
            let rows = stmt
                .query_map(params![squad_id], |row| {
                    Ok(SquadRole {
                        id: row.get(0)?,
                        squad_id: row.get(1)?,
                        global_role_id: row.get(2)?,
                        workspace_role_id: row.get(3)?,
                        code: row.get(4)?,
                        label: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn add_phase(
        &self,
        squad_id: i64,
        name: &str,
        order_index: i64,
    ) -> Result<i64, StoreError> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO squad_phases (squad_id, name, order_index, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![squad_id, name, order_index, now_epoch()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Phases of a squad in their manual order.
    pub async fn squad_phases(&self, squad_id: i64) -> Result<Vec<Phase>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, squad_id, name, description, order_index, created_at \
                 FROM squad_phases WHERE squad_id = ?1 ORDER BY order_index, id",
            )?;
            let rows = stmt
                .query_map(params![squad_id], |row| {
                    Ok(Phase {
                        id: row.get(0)?,
                        squad_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        order_index: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Prompt versions & execution log
    // -------------------------------------------------------------------------

    pub async fn active_prompt(&self, prompt_key: &str) -> Result<PromptVersion, StoreError> {
        let prompt_key = prompt_key.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, prompt_key, version, system_instructions, user_template, model, \
                 temperature, is_active FROM prompt_versions \
                 WHERE prompt_key = ?1 AND is_active = 1 ORDER BY version DESC LIMIT 1",
                params![prompt_key],
                |row| {
                    Ok(PromptVersion {
                        id: row.get(0)?,
                        prompt_key: row.get(1)?,
                        version: row.get(2)?,
                        system_instructions: row.get(3)?,
                        user_template: row.get(4)?,
                        model: row.get(5)?,
                        temperature: row.get(6)?,
                        is_active: row.get(7)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("active prompt {prompt_key}")))
        })
        .await
    }

    /// Store a new prompt version as the next version number. With `activate`, it
    /// becomes the only active version of its key.
    pub async fn add_prompt_version(
        &self,
        prompt_key: &str,
        system_instructions: &str,
        user_template: &str,
        model: Option<&str>,
        temperature: Option<f64>,
        activate: bool,
    ) -> Result<i64, StoreError> {
        let prompt_key = prompt_key.to_string();
        let system_instructions = system_instructions.to_string();
        let user_template = user_template.to_string();
        let model = model.map(String::from);
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_versions WHERE prompt_key = ?1",
                params![prompt_key],
                |row| row.get(0),
            )?;
            if activate {
                tx.execute(
                    "UPDATE prompt_versions SET is_active = 0 WHERE prompt_key = ?1",
                    params![prompt_key],
                )?;
            }
            tx.execute(
                "INSERT INTO prompt_versions (prompt_key, version, system_instructions, \
                 user_template, model, temperature, is_active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    prompt_key,
                    next,
                    system_instructions,
                    user_template,
                    model,
                    temperature,
                    activate,
                    now_epoch()
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Most recent execution-log rows. Assumes the full column set.
    pub async fn recent_executions(&self, limit: i64) -> Result<Vec<ExecutionRow>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, prompt_version_id, proposal_id, workspace_id, total_tokens, success, \
                 error_message, executed_by FROM prompt_executions ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(ExecutionRow {
                        id: row.get(0)?,
                        prompt_version_id: row.get(1)?,
                        proposal_id: row.get(2)?,
                        workspace_id: row.get(3)?,
                        total_tokens: row.get(4)?,
                        success: row.get::<_, Option<i64>>(5)?.map(|v| v != 0),
                        error_message: row.get(6)?,
                        executed_by: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Proposals & suggestions
    // -------------------------------------------------------------------------

    pub async fn insert_proposal(&self, new: NewProposal) -> Result<i64, StoreError> {
        self.call(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO structure_proposals (squad_id, workspace_id, source_context, \
                 input_snapshot, proposal, status, model, prompt_version_id, created_by, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.squad_id,
                    new.workspace_id,
                    new.source_context.as_str(),
                    new.input_snapshot.to_string(),
                    new.proposal.to_string(),
                    ProposalStatus::Draft.as_str(),
                    new.model,
                    new.prompt_version_id,
                    new.created_by,
                    now,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_proposal(&self, proposal_id: i64) -> Result<Proposal, StoreError> {
        self.call(move |conn| load_proposal(conn, proposal_id)).await
    }

    pub async fn list_proposals(&self, squad_id: i64) -> Result<Vec<Proposal>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROPOSAL_COLUMNS} FROM structure_proposals WHERE squad_id = ?1 \
                 ORDER BY id DESC"
            ))?;
            let rows = stmt
                .query_map(params![squad_id], row_to_proposal)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_suggestion(&self, suggestion_id: i64) -> Result<Suggestion, StoreError> {
        self.call(move |conn| load_suggestion(conn, suggestion_id))
            .await
    }

    /// Every suggestion of a proposal in display order.
    pub async fn list_suggestions(&self, proposal_id: i64) -> Result<Vec<Suggestion>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUGGESTION_COLUMNS} FROM proposal_suggestions WHERE proposal_id = ?1 \
                 ORDER BY display_order"
            ))?;
            let rows = stmt
                .query_map(params![proposal_id], row_to_suggestion)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Pending suggestions of a squad, grouped by proposal in display order.
    pub async fn list_pending_suggestions(
        &self,
        squad_id: i64,
    ) -> Result<Vec<Suggestion>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUGGESTION_COLUMNS} FROM proposal_suggestions \
                 WHERE squad_id = ?1 AND status = ?2 ORDER BY proposal_id, display_order"
            ))?;
            let rows = stmt
                .query_map(
                    params![squad_id, SuggestionStatus::Pending.as_str()],
                    row_to_suggestion,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

// =============================================================================
// Connection-level helpers (usable inside a transaction)
// =============================================================================

const PROPOSAL_COLUMNS: &str = "id, squad_id, workspace_id, source_context, input_snapshot, \
     proposal, status, model, prompt_version_id, created_by, decided_by, decided_at, \
     created_at, updated_at";

const SUGGESTION_COLUMNS: &str = "id, proposal_id, squad_id, suggestion_type, payload, \
     display_order, status, edited_payload, decision_reason, decided_by, decided_at, created_at";

pub(crate) fn is_member(
    conn: &Connection,
    workspace_id: i64,
    user_id: &str,
) -> Result<bool, StoreError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM workspace_members WHERE workspace_id = ?1 AND user_id = ?2)",
        params![workspace_id, user_id],
        |row| row.get(0),
    )?)
}

pub(crate) fn load_squad(conn: &Connection, squad_id: i64) -> Result<Squad, StoreError> {
    conn.query_row(
        "SELECT id, workspace_id, name, description, status, created_at, updated_at \
         FROM squads WHERE id = ?1",
        params![squad_id],
        |row| {
            Ok(Squad {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
                status: SquadStatus::from_str(&row.get::<_, String>(4)?),
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("squad {squad_id}")))
}

pub(crate) fn load_proposal(conn: &Connection, proposal_id: i64) -> Result<Proposal, StoreError> {
    conn.query_row(
        &format!("SELECT {PROPOSAL_COLUMNS} FROM structure_proposals WHERE id = ?1"),
        params![proposal_id],
        row_to_proposal,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("proposal {proposal_id}")))
}

pub(crate) fn load_suggestion(
    conn: &Connection,
    suggestion_id: i64,
) -> Result<Suggestion, StoreError> {
    conn.query_row(
        &format!("SELECT {SUGGESTION_COLUMNS} FROM proposal_suggestions WHERE id = ?1"),
        params![suggestion_id],
        row_to_suggestion,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("suggestion {suggestion_id}")))
}

pub(crate) fn count_suggestions(conn: &Connection, proposal_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM proposal_suggestions WHERE proposal_id = ?1",
        params![proposal_id],
        |row| row.get(0),
    )
}

/// Insert drafts as pending suggestions. The caller owns the transaction.
pub(crate) fn insert_suggestions(
    conn: &Connection,
    proposal_id: i64,
    squad_id: i64,
    drafts: &[SuggestionDraft],
) -> rusqlite::Result<usize> {
    let now = now_epoch();
    let mut stmt = conn.prepare(
        "INSERT INTO proposal_suggestions (proposal_id, squad_id, suggestion_type, payload, \
         display_order, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for draft in drafts {
        stmt.execute(params![
            proposal_id,
            squad_id,
            draft.kind.as_str(),
            draft.payload.to_string(),
            draft.display_order,
            SuggestionStatus::Pending.as_str(),
            now,
        ])?;
    }
    Ok(drafts.len())
}

/// UNIQUE or PRIMARY KEY conflicts only; FK, CHECK and NOT NULL failures are not.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Row mapping
// =============================================================================

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn row_to_decision(row: &Row<'_>) -> rusqlite::Result<Decision> {
    Ok(Decision {
        id: row.get(0)?,
        squad_id: row.get(1)?,
        title: row.get(2)?,
        body: json_column(row, 3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_persona(row: &Row<'_>) -> rusqlite::Result<Persona> {
    Ok(Persona {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        details: json_column(row, 4).unwrap_or(Value::Null),
        created_at: row.get(5)?,
    })
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    Ok(Proposal {
        id: row.get(0)?,
        squad_id: row.get(1)?,
        workspace_id: row.get(2)?,
        source_context: SourceContext::from_str(&row.get::<_, String>(3)?),
        input_snapshot: json_column(row, 4)?,
        proposal: json_column(row, 5)?,
        status: ProposalStatus::from_str(&row.get::<_, String>(6)?),
        model: row.get(7)?,
        prompt_version_id: row.get(8)?,
        created_by: row.get(9)?,
        decided_by: row.get(10)?,
        decided_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn row_to_suggestion(row: &Row<'_>) -> rusqlite::Result<Suggestion> {
    Ok(Suggestion {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        squad_id: row.get(2)?,
        suggestion_type: row.get(3)?,
        payload: json_column(row, 4)?,
        display_order: row.get(5)?,
        status: SuggestionStatus::from_str(&row.get::<_, String>(6)?),
        edited_payload: opt_json_column(row, 7)?,
        decision_reason: row.get(8)?,
        decided_by: row.get(9)?,
        decided_at: row.get(10)?,
        created_at: row.get(11)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::decision::ProblemStatement;
    use crate::structure::decompose::SuggestionType;
    use serde_json::json;

    fn temp_store() -> SquadStore {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("test_squads.sqlite");
        // Leak the TempDir so it persists for the test
        std::mem::forget(dir);
        SquadStore::new(path).expect("create store")
    }

    #[tokio::test]
    async fn test_squad_and_membership() {
        let store = temp_store();
        let ws = store.create_workspace("Acme").await.unwrap();
        let squad = store.create_squad(ws, "Payments", Some("checkout")).await.unwrap();
        store.add_member(ws, "u-1").await.unwrap();
        store.add_member(ws, "u-1").await.unwrap();

        let s = store.get_squad(squad).await.unwrap();
        assert_eq!(s.name, "Payments");
        assert_eq!(s.status, SquadStatus::Forming);
        assert!(store.is_member(ws, "u-1").await.unwrap());
        assert!(!store.is_member(ws, "u-2").await.unwrap());
        assert!(matches!(
            store.get_squad(999).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.sqlite");
        let first = SquadStore::new(&path).unwrap();
        let v1 = first.active_prompt(DEFAULT_PROMPT.key).await.unwrap();
        drop(first);

        let second = SquadStore::new(&path).unwrap();
        let again = second.active_prompt(DEFAULT_PROMPT.key).await.unwrap();
        assert_eq!(v1.id, again.id);
        assert_eq!(again.version, 1);
        assert!(again.model.is_none());
    }

    #[tokio::test]
    async fn test_new_prompt_version_takes_over() {
        let store = temp_store();
        let id = store
            .add_prompt_version(DEFAULT_PROMPT.key, "sys", "user {{squad_name}}", Some("m"), Some(0.1), true)
            .await
            .unwrap();
        let active = store.active_prompt(DEFAULT_PROMPT.key).await.unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.version, 2);
        assert_eq!(active.model.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_problem_statement_lookup_picks_latest() {
        let store = temp_store();
        let ws = store.create_workspace("Acme").await.unwrap();
        let squad = store.create_squad(ws, "Payments", None).await.unwrap();
        assert!(store.latest_problem_statement(squad).await.unwrap().is_none());

        for text in ["first", "second"] {
            store
                .record_decision(
                    squad,
                    DecisionRecord::ProblemStatement(ProblemStatement {
                        statement: text.into(),
                        ..Default::default()
                    }),
                    Some("u-1"),
                )
                .await
                .unwrap();
        }
        let latest = store.latest_problem_statement(squad).await.unwrap().unwrap();
        assert_eq!(latest.body["statement"], "second");
        assert!(matches!(latest.record(), Some(DecisionRecord::ProblemStatement(_))));
    }

    #[tokio::test]
    async fn test_suggestion_order_is_unique_per_proposal() {
        let store = temp_store();
        let ws = store.create_workspace("Acme").await.unwrap();
        let squad = store.create_squad(ws, "Payments", None).await.unwrap();
        let proposal = store
            .insert_proposal(NewProposal {
                squad_id: squad,
                workspace_id: ws,
                source_context: SourceContext::Problem,
                input_snapshot: json!({}),
                proposal: json!({}),
                model: "m".into(),
                prompt_version_id: None,
                created_by: "u-1".into(),
            })
            .await
            .unwrap();

        let drafts = vec![SuggestionDraft {
            kind: SuggestionType::Governance,
            payload: json!({"cadence": "weekly"}),
            display_order: 0,
        }];
        let again = drafts.clone();
        store
            .run(move |conn| -> Result<usize, StoreError> {
                Ok(insert_suggestions(conn, proposal, squad, &drafts)?)
            })
            .await
            .unwrap();
        let err = store
            .run(move |conn| -> Result<usize, StoreError> {
                Ok(insert_suggestions(conn, proposal, squad, &again)?)
            })
            .await
            .unwrap_err();
        match err {
            StoreError::Sqlite(e) => assert!(is_unique_violation(&e)),
            other => panic!("expected constraint violation, got {other:?}"),
        }

        let orphan = vec![SuggestionDraft {
            kind: SuggestionType::Governance,
            payload: json!({}),
            display_order: 0,
        }];
        let err = store
            .run(move |conn| -> Result<usize, StoreError> {
                Ok(insert_suggestions(conn, proposal + 100, squad, &orphan)?)
            })
            .await
            .unwrap_err();
        match err {
            StoreError::Sqlite(e) => assert!(!is_unique_violation(&e), "FK failure: {e}"),
            other => panic!("expected foreign key violation, got {other:?}"),
        }

        let pending = store.list_pending_suggestions(squad).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].suggestion_type, "governance");
        assert_eq!(pending[0].status, SuggestionStatus::Pending);
        assert_eq!(
            store.get_proposal(proposal).await.unwrap().status,
            ProposalStatus::Draft
        );
    }

    #[test]
    fn test_status_strings() {
        for s in [
            SuggestionStatus::Pending,
            SuggestionStatus::Approved,
            SuggestionStatus::ApprovedWithEdits,
            SuggestionStatus::Rejected,
        ] {
            assert_eq!(SuggestionStatus::from_str(s.as_str()), s);
        }
        assert!(!SuggestionStatus::Pending.is_terminal());
        assert_eq!(ProposalStatus::from_str("DISCARDED"), ProposalStatus::Discarded);
        assert_eq!(SquadStatus::from_str("needs_discovery").as_str(), "needs_discovery");
    }
}
