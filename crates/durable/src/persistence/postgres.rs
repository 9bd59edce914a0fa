//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers
//! - Row locking on the workflow instance while appending
//! - Event sourcing for workflow replay

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{WorkflowError, WorkflowEvent};

/// PostgreSQL implementation of WorkflowEventStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use txflow_durable::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/txflow").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, input))]
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO durable_workflow_instances (id, workflow_type, status, input)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .bind(&input)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            StoreError::Database(e.to_string())
        })?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::AlreadyExists(workflow_id));
        }

        debug!(%workflow_id, %workflow_type, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input, result, error, created_at, updated_at
            FROM durable_workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow info: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow_info_from_row(&row)
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_sequence: i32,
        events: Vec<WorkflowEvent>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        // Serialize writers on the instance row
        sqlx::query("SELECT id FROM durable_workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS next_seq
            FROM durable_workflow_events
            WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let current_sequence = row.get::<i64, _>("next_seq") as i32;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let sequence = current_sequence + records.len() as i32;
            let event_data = serde_json::to_value(&event)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            let recorded_at: DateTime<Utc> = sqlx::query_scalar(
                r#"
                INSERT INTO durable_workflow_events (workflow_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                RETURNING recorded_at
                "#,
            )
            .bind(workflow_id)
            .bind(sequence)
            .bind(event.event_type())
            .bind(&event_data)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            records.push(EventRecord {
                sequence,
                event,
                recorded_at,
            });
        }

        sqlx::query("UPDATE durable_workflow_instances SET updated_at = NOW() WHERE id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%workflow_id, count = records.len(), "appended events");
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data, recorded_at
            FROM durable_workflow_events
            WHERE workflow_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load events: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if rows.is_empty() {
            // Distinguish an empty log from an unknown workflow
            self.get_workflow_info(workflow_id).await?;
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent = serde_json::from_value(data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            events.push(EventRecord {
                sequence: row.get("sequence_num"),
                event,
                recorded_at: row.get("recorded_at"),
            });
        }

        Ok(events)
    }

    #[instrument(skip(self, result, error))]
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let completed_at: Option<DateTime<Utc>> = status.is_terminal().then(Utc::now);

        let updated = sqlx::query(
            r#"
            UPDATE durable_workflow_instances
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                completed_at = COALESCE($5, completed_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update workflow status: {}", e);
            StoreError::Database(e.to_string())
        })?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        debug!(%workflow_id, %status, "updated workflow status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_workflows(
        &self,
        statuses: &[WorkflowStatus],
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let rows = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input, result, error, created_at, updated_at
            FROM durable_workflow_instances
            WHERE status = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list workflows: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(workflow_info_from_row).collect()
    }
}

fn workflow_info_from_row(row: &PgRow) -> Result<WorkflowInfo, StoreError> {
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");
    let error = error_json
        .map(serde_json::from_value::<WorkflowError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(WorkflowInfo {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        status: status.parse()?,
        input: row.get("input"),
        result: row.get("result"),
        error,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
