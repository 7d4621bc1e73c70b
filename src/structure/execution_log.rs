//! Best-effort audit log of generation attempts.
//!
//! The logger writes whatever subset of its fields the `prompt_executions` table
//! actually has, so older or trimmed deployments of the schema keep working. The
//! column set is read from the catalog once per process and kept for its lifetime:
//! schema changes after the first read are not observed unless
//! [`ColumnCache::invalidate`] is called.
//!
//! Logging never fails the caller. Every problem ends up as a `warn!` and a
//! [`LogOutcome`] that callers may ignore.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use crate::gateway::TokenUsage;

use super::store::{now_epoch, SquadStore, StoreError};

pub const EXECUTION_LOG_TABLE: &str = "prompt_executions";

/// Column without which a row is not worth writing.
const REQUIRED_COLUMN: &str = "prompt_version_id";

static GLOBAL_CACHE: Lazy<Arc<ColumnCache>> = Lazy::new(|| Arc::new(ColumnCache::new()));

// =============================================================================
// Column cache
// =============================================================================

/// Lazily loaded set of column names of the execution-log table.
///
/// Concurrent first uses may each read the catalog; the first writer wins and the
/// result is the same either way.
#[derive(Debug, Default)]
pub struct ColumnCache {
    columns: RwLock<Option<Arc<BTreeSet<String>>>>,
}

impl ColumnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> Arc<Self> {
        GLOBAL_CACHE.clone()
    }

    pub fn cached(&self) -> Option<Arc<BTreeSet<String>>> {
        self.columns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get_or_load(&self, conn: &Connection) -> rusqlite::Result<Arc<BTreeSet<String>>> {
        if let Some(columns) = self.cached() {
            return Ok(columns);
        }
        let loaded = Arc::new(table_columns(conn, EXECUTION_LOG_TABLE)?);
        debug!(columns = loaded.len(), "loaded execution log columns");
        let mut slot = self
            .columns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(slot.get_or_insert(loaded).clone())
    }

    /// Forget the cached column set; the next write re-reads the catalog.
    pub fn invalidate(&self) {
        *self
            .columns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut columns = BTreeSet::new();
    while let Some(row) = rows.next()? {
        columns.insert(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

// =============================================================================
// Records
// =============================================================================

/// One generation attempt. Unset fields are simply not written.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRecord {
    pub prompt_version_id: Option<i64>,
    pub proposal_id: Option<i64>,
    pub workspace_id: Option<i64>,
    pub usage: Option<TokenUsage>,
    pub execution_time_ms: Option<u64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub executed_by: Option<String>,
}

impl ExecutionRecord {
    fn candidates(&self) -> Vec<(&'static str, SqlValue)> {
        let mut fields = Vec::with_capacity(11);
        let int = |v: i64| SqlValue::Integer(v);

        if let Some(id) = self.prompt_version_id {
            fields.push(("prompt_version_id", int(id)));
        }
        if let Some(id) = self.proposal_id {
            fields.push(("proposal_id", int(id)));
        }
        if let Some(id) = self.workspace_id {
            fields.push(("workspace_id", int(id)));
        }
        if let Some(usage) = self.usage {
            fields.push(("input_tokens", int(i64::from(usage.input))));
            fields.push(("output_tokens", int(i64::from(usage.output))));
            fields.push(("total_tokens", int(i64::from(usage.total))));
        }
        if let Some(ms) = self.execution_time_ms {
            fields.push(("execution_time_ms", int(i64::try_from(ms).unwrap_or(i64::MAX))));
        }
        fields.push(("success", int(i64::from(self.success))));
        if let Some(message) = &self.error_message {
            fields.push(("error_message", SqlValue::Text(message.clone())));
        }
        if let Some(actor) = &self.executed_by {
            fields.push(("executed_by", SqlValue::Text(actor.clone())));
        }
        fields.push(("created_at", int(now_epoch())));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    Written(i64),
    Skipped(&'static str),
    Failed(String),
}

// =============================================================================
// Logger
// =============================================================================

#[derive(Clone)]
pub struct ExecutionLogger {
    store: SquadStore,
    cache: Arc<ColumnCache>,
}

impl ExecutionLogger {
    /// Logger backed by the process-wide column cache.
    pub fn new(store: SquadStore) -> Self {
        Self::with_cache(store, ColumnCache::global())
    }

    pub fn with_cache(store: SquadStore, cache: Arc<ColumnCache>) -> Self {
        Self { store, cache }
    }

    pub async fn log(&self, record: ExecutionRecord) -> LogOutcome {
        let cache = self.cache.clone();
        let result = self
            .store
            .run(move |conn| -> Result<LogOutcome, StoreError> { Ok(write_record(conn, &cache, &record)) })
            .await;
        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "execution log write failed");
                LogOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Write `record` on `conn`. Never returns an error; see [`LogOutcome`].
pub fn write_record(conn: &Connection, cache: &ColumnCache, record: &ExecutionRecord) -> LogOutcome {
    let columns = match cache.get_or_load(conn) {
        Ok(columns) => columns,
        Err(e) => {
            warn!(error = %e, "execution log schema lookup failed");
            return LogOutcome::Failed(e.to_string());
        }
    };
    if columns.is_empty() {
        warn!(table = EXECUTION_LOG_TABLE, "execution log table not found; skipping");
        return LogOutcome::Skipped("table not found");
    }

    let fields: Vec<(&str, SqlValue)> = record
        .candidates()
        .into_iter()
        .filter(|(name, _)| columns.contains(*name))
        .collect();

    if !fields.iter().any(|(name, _)| *name == REQUIRED_COLUMN) {
        warn!(
            column = REQUIRED_COLUMN,
            "execution log row lacks its prompt version; skipping"
        );
        return LogOutcome::Skipped("missing prompt_version_id");
    }

    let names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {EXECUTION_LOG_TABLE} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );

    match conn.execute(&sql, params_from_iter(fields.into_iter().map(|(_, value)| value))) {
        Ok(_) => LogOutcome::Written(conn.last_insert_rowid()),
        Err(e) => {
            warn!(error = %e, "execution log insert failed");
            LogOutcome::Failed(e.to_string())
        }
    }
}
