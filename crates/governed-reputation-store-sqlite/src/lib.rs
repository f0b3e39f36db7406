#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! `SQLite` ledger of reported task outcomes.
//!
//! Rows are append-only: the schema installs triggers that fail any `UPDATE`
//! or `DELETE` on `task_outcomes`, and every write is a single
//! `BEGIN IMMEDIATE` transaction so concurrent reporters either commit a whole
//! row or nothing.

use std::path::Path;

use anyhow::{Context, Result};
use governed_reputation_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, summarize_agent, AgentStats, ReputationError,
    TaskOutcome, TaskReport,
};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{debug, info};

const REPUTATION_MIGRATION_VERSION: i64 = 1;
const BUSY_TIMEOUT_MS: u32 = 5_000;

const SCHEMA_REPUTATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS task_outcomes (
  outcome_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL CHECK (length(trim(task_id)) > 0),
  agent_id TEXT NOT NULL CHECK (length(trim(agent_id)) > 0),
  objective TEXT NOT NULL,
  status TEXT NOT NULL CHECK (length(trim(status)) > 0),
  score REAL NOT NULL CHECK (score BETWEEN 0.0 AND 1.0),
  details TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_task_outcomes_no_update
BEFORE UPDATE ON task_outcomes
BEGIN
  SELECT RAISE(FAIL, 'task_outcomes is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_task_outcomes_no_delete
BEFORE DELETE ON task_outcomes
BEGIN
  SELECT RAISE(FAIL, 'task_outcomes is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_task_outcomes_agent_seq
  ON task_outcomes(agent_id, outcome_seq);
CREATE INDEX IF NOT EXISTS idx_task_outcomes_task_seq
  ON task_outcomes(task_id, outcome_seq);
";

const OUTCOME_COLUMNS: &str =
    "outcome_seq, task_id, agent_id, objective, status, score, details, recorded_at";

pub struct SqliteReputationStore {
    conn: Connection,
}

impl SqliteReputationStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| {
                persistence(format!(
                    "failed to open sqlite database at {}",
                    path.display()
                ))
            })?;

        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;"
        ))
        .with_context(|| persistence("failed to configure sqlite pragmas"))?;

        debug!(path = %path.display(), "opened reputation store");
        Ok(Self { conn })
    }

    /// Creates the ledger schema if it is missing. Safe to call repeatedly.
    pub fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .with_context(|| persistence("failed to ensure schema_migrations exists"))?;

        self.conn
            .execute_batch(SCHEMA_REPUTATION_V1)
            .with_context(|| persistence("failed to apply reputation schema"))?;

        let now = format_rfc3339(now_utc()).map_err(|err| persistence(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![REPUTATION_MIGRATION_VERSION, now],
            )
            .with_context(|| persistence("failed to register reputation schema migration"))?;

        debug!(
            version = REPUTATION_MIGRATION_VERSION,
            "reputation schema ready"
        );
        Ok(())
    }

    /// Scores and appends one outcome row.
    ///
    /// Validation failures surface as [`ReputationError::Validation`] inside
    /// the returned error and nothing is written. Storage failures carry
    /// [`ReputationError::Persistence`].
    pub fn record(
        &mut self,
        task_id: &str,
        agent_id: &str,
        objective: &str,
        status: &str,
        details: &str,
    ) -> Result<TaskOutcome> {
        self.record_report(&TaskReport {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            objective: objective.to_string(),
            status: status.to_string(),
            details: details.to_string(),
        })
    }

    pub fn record_report(&mut self, report: &TaskReport) -> Result<TaskOutcome> {
        report.validate()?;

        let score = report.score();
        let recorded_at = now_utc();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| persistence("failed to start outcome transaction"))?;

        tx.execute(
            "INSERT INTO task_outcomes(
                task_id, agent_id, objective, status, score, details, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.task_id,
                report.agent_id,
                report.objective,
                report.status,
                score,
                report.details,
                format_rfc3339(recorded_at).map_err(|err| persistence(err.to_string()))?,
            ],
        )
        .with_context(|| persistence("failed to append task outcome"))?;

        let outcome_seq = tx.last_insert_rowid();
        tx.commit().with_context(|| persistence("failed to commit outcome transaction"))?;

        info!(
            outcome_seq,
            task_id = %report.task_id,
            agent_id = %report.agent_id,
            status = %report.status,
            score,
            "recorded task outcome"
        );

        Ok(TaskOutcome {
            outcome_seq,
            task_id: report.task_id.clone(),
            agent_id: report.agent_id.clone(),
            objective: report.objective.clone(),
            status: report.status.clone(),
            score,
            details: report.details.clone(),
            recorded_at,
        })
    }

    /// Most recent outcomes for `agent_id`, newest first, at most `limit` rows.
    pub fn get_task_history(&self, agent_id: &str, limit: usize) -> Result<Vec<TaskOutcome>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {OUTCOME_COLUMNS}
                 FROM task_outcomes
                 WHERE agent_id = ?1
                 ORDER BY outcome_seq DESC
                 LIMIT ?2"
            ))
            .with_context(|| persistence("failed to prepare task history query"))?;

        let rows = stmt
            .query_map(params![agent_id, limit], parse_outcome_row)
            .with_context(|| persistence("failed to query task history"))?;
        let outcomes = collect_rows(rows)?;

        debug!(agent_id, rows = outcomes.len(), "loaded task history");
        Ok(outcomes)
    }

    /// Every outcome reported under `task_id`, newest first.
    pub fn get_task(&self, task_id: &str) -> Result<Vec<TaskOutcome>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {OUTCOME_COLUMNS}
                 FROM task_outcomes
                 WHERE task_id = ?1
                 ORDER BY outcome_seq DESC"
            ))
            .with_context(|| persistence("failed to prepare task lookup query"))?;

        let rows = stmt
            .query_map(params![task_id], parse_outcome_row)
            .with_context(|| persistence("failed to query task outcomes"))?;
        collect_rows(rows)
    }

    pub fn get_agent_stats(&self, agent_id: &str) -> Result<AgentStats> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {OUTCOME_COLUMNS}
                 FROM task_outcomes
                 WHERE agent_id = ?1
                 ORDER BY outcome_seq ASC"
            ))
            .with_context(|| persistence("failed to prepare agent stats query"))?;

        let rows = stmt
            .query_map(params![agent_id], parse_outcome_row)
            .with_context(|| persistence("failed to query agent outcomes"))?;
        let outcomes = collect_rows(rows)?;

        Ok(summarize_agent(agent_id, &outcomes))
    }

    pub fn count_outcomes(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM task_outcomes", [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| persistence("failed to count task outcomes"))?;
        usize::try_from(count)
            .with_context(|| persistence(format!("invalid task outcome count: {count}")))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn persistence(message: impl Into<String>) -> ReputationError {
    ReputationError::Persistence(message.into())
}

fn parse_outcome_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskOutcome> {
    let recorded_at_raw: String = row.get(7)?;
    let recorded_at = parse_rfc3339_utc(&recorded_at_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid recorded_at: {err}"),
            )),
        )
    })?;

    Ok(TaskOutcome {
        outcome_seq: row.get(0)?,
        task_id: row.get(1)?,
        agent_id: row.get(2)?,
        objective: row.get(3)?,
        status: row.get(4)?,
        score: row.get(5)?,
        details: row.get(6)?,
        recorded_at,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.with_context(|| persistence("failed to read task outcome row"))?);
    }
    Ok(values)
}

#[cfg(test)]
fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to query sqlite_master for {table_name}"))?;
    Ok(count > 0)
}

#[cfg(test)]
fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect columns for {table_name}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    collect_rows(rows)
}
