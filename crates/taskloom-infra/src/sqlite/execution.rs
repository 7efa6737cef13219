//! SQLite execution repository implementation.
//!
//! Implements `ExecutionRepository` from `taskloom-core` using sqlx with
//! split read/write pools. Inputs, outputs and transition metadata are
//! stored as JSON text. Transitions keep their insertion order through an
//! autoincrement `seq` column.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use taskloom_core::repository::SortOrder;
use taskloom_core::repository::execution::ExecutionRepository;
use taskloom_types::error::RepositoryError;
use taskloom_types::execution::{
    ExecutionRecord, ExecutionStatus, TransitionRecord, TransitionType,
};
use taskloom_types::task::Cursor;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionRepository`.
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    task_id: String,
    agent_id: String,
    user_id: Option<String>,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            agent_id: row.try_get("agent_id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord, RepositoryError> {
        let status: ExecutionStatus =
            serde_json::from_value(Value::String(self.status.clone())).map_err(|_| {
                RepositoryError::Query(format!("invalid execution status: {}", self.status))
            })?;

        Ok(ExecutionRecord {
            id: parse_uuid(&self.id)?,
            task_id: parse_uuid(&self.task_id)?,
            agent_id: parse_uuid(&self.agent_id)?,
            user_id: self.user_id.as_deref().map(parse_uuid).transpose()?,
            status,
            input: parse_json(&self.input, "input")?,
            output: self
                .output
                .as_deref()
                .map(|s| parse_json(s, "output"))
                .transpose()?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct TransitionRow {
    id: String,
    execution_id: String,
    transition_type: String,
    current_workflow: String,
    current_step: i64,
    next_workflow: Option<String>,
    next_step: Option<i64>,
    output: String,
    metadata: String,
    created_at: String,
}

impl TransitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            transition_type: row.try_get("type")?,
            current_workflow: row.try_get("current_workflow")?,
            current_step: row.try_get("current_step")?,
            next_workflow: row.try_get("next_workflow")?,
            next_step: row.try_get("next_step")?,
            output: row.try_get("output")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<TransitionRecord, RepositoryError> {
        let transition_type: TransitionType =
            serde_json::from_value(Value::String(self.transition_type.clone())).map_err(|_| {
                RepositoryError::Query(format!("invalid transition type: {}", self.transition_type))
            })?;

        let next = match (self.next_workflow, self.next_step) {
            (Some(workflow), Some(step)) => Some(Cursor::new(workflow, parse_step(step)?)),
            _ => None,
        };
        let metadata: BTreeMap<String, Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| RepositoryError::Query(format!("invalid transition metadata: {e}")))?;

        Ok(TransitionRecord {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            transition_type,
            current: Cursor::new(self.current_workflow, parse_step(self.current_step)?),
            next,
            output: parse_json(&self.output, "output")?,
            metadata,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json(s: &str, field: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {field} JSON: {e}")))
}

fn to_json(value: &Value) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn parse_step(step: i64) -> Result<usize, RepositoryError> {
    usize::try_from(step).map_err(|_| RepositoryError::Query(format!("invalid step index: {step}")))
}

/// Serde name of a snake_case unit enum (status, transition type).
fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_value(value)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RepositoryError::Query("enum did not serialize to a string".to_string()))
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, execution: &ExecutionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, task_id, agent_id, user_id, status, input, output, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.task_id.to_string())
        .bind(execution.agent_id.to_string())
        .bind(execution.user_id.map(|id| id.to_string()))
        .bind(enum_str(&execution.status)?)
        .bind(to_json(&execution.input)?)
        .bind(execution.output.as_ref().map(to_json).transpose()?)
        .bind(&execution.error)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("execution '{}' already exists", execution.id)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution_status(
        &self,
        id: &Uuid,
        status: ExecutionStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions SET
                 status = ?,
                 output = COALESCE(?, output),
                 error = COALESCE(?, error),
                 updated_at = ?
               WHERE id = ?"#,
        )
        .bind(enum_str(&status)?)
        .bind(output.map(to_json).transpose()?)
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn append_transition(&self, transition: &TransitionRecord) -> Result<(), RepositoryError> {
        let status = enum_str(&transition.transition_type.execution_status())?;
        let metadata = serde_json::to_string(&transition.metadata)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // INSERT transition + UPDATE executions.status in one transaction
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let updated = sqlx::query("UPDATE executions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(&status)
            .bind(format_datetime(&Utc::now()))
            .bind(transition.execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            r#"INSERT INTO transitions
               (id, execution_id, type, current_workflow, current_step,
                next_workflow, next_step, output, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(transition.id.to_string())
        .bind(transition.execution_id.to_string())
        .bind(enum_str(&transition.transition_type)?)
        .bind(&transition.current.workflow)
        .bind(transition.current.step as i64)
        .bind(transition.next.as_ref().map(|c| c.workflow.clone()))
        .bind(transition.next.as_ref().map(|c| c.step as i64))
        .bind(to_json(&transition.output)?)
        .bind(&metadata)
        .bind(format_datetime(&transition.created_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.message().contains("UNIQUE") {
                    return RepositoryError::Conflict(format!(
                        "transition '{}' already exists",
                        transition.id
                    ));
                }
            }
            RepositoryError::Query(e.to_string())
        })?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn list_transitions(
        &self,
        execution_id: &Uuid,
        order: SortOrder,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let sql = match order {
            SortOrder::Asc => "SELECT * FROM transitions WHERE execution_id = ? ORDER BY seq ASC",
            SortOrder::Desc => "SELECT * FROM transitions WHERE execution_id = ? ORDER BY seq DESC",
        };
        let rows = sqlx::query(sql)
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut transitions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = TransitionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            transitions.push(r.into_record()?);
        }
        Ok(transitions)
    }

    async fn latest_transition(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<TransitionRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM transitions WHERE execution_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = TransitionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }
}
