use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow, types::Json};
use tracing::info;
use uuid::Uuid;

use crate::{
    checkpoint::{CheckpointStatus, CheckpointType, FlowCheckpoint},
    error::{FlowError, Result},
    storage::{CheckpointStorage, Session, SessionStorage},
    store::StateSnapshot,
};

const MAX_CONNECTIONS: u32 = 5;

async fn connect_pool(database_url: &str) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(database_url)
        .await?)
}

/// Browser sessions stored as one JSONB document per session id.
#[derive(Clone)]
pub struct PostgresSessionStorage {
    pool: PgPool,
}

impl PostgresSessionStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let storage = Self::from_pool(connect_pool(database_url).await?);
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS lead_flow_sessions (
                id TEXT PRIMARY KEY,
                data JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        info!("Session table ready");
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for PostgresSessionStorage {
    async fn save(&self, session: Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO lead_flow_sessions (id, data, updated_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE
             SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at",
        )
        .bind(&session.id)
        .bind(Json(&session.data))
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT id, data, updated_at FROM lead_flow_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Session> {
            let Json(data): Json<Map<String, Value>> = row.try_get("data")?;
            Ok(Session {
                id: row.try_get("id")?,
                data,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM lead_flow_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Checkpoints with their snapshot in a JSONB column.
#[derive(Clone)]
pub struct PostgresCheckpointStorage {
    pool: PgPool,
}

impl PostgresCheckpointStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let storage = Self::from_pool(connect_pool(database_url).await?);
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS lead_flow_checkpoints (
                unique_id UUID PRIMARY KEY,
                checkpoint_type TEXT NOT NULL,
                status TEXT NOT NULL,
                ca_session_id TEXT NOT NULL,
                config_id BIGINT NOT NULL,
                flow_id BIGINT NOT NULL,
                step_id BIGINT NOT NULL,
                data JSONB NOT NULL,
                created TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        info!("Checkpoint table ready");
        Ok(())
    }

    fn from_row(row: PgRow) -> Result<FlowCheckpoint> {
        let raw_type: String = row.try_get("checkpoint_type")?;
        let raw_status: String = row.try_get("status")?;
        let Json(data): Json<StateSnapshot> = row.try_get("data")?;
        let created: DateTime<Utc> = row.try_get("created")?;

        Ok(FlowCheckpoint {
            unique_id: row.try_get("unique_id")?,
            checkpoint_type: CheckpointType::parse(&raw_type).ok_or_else(|| {
                FlowError::StorageError(format!("unknown checkpoint type {raw_type}"))
            })?,
            status: CheckpointStatus::parse(&raw_status).ok_or_else(|| {
                FlowError::StorageError(format!("unknown checkpoint status {raw_status}"))
            })?,
            ca_session_id: row.try_get("ca_session_id")?,
            config_id: row.try_get("config_id")?,
            flow_id: row.try_get("flow_id")?,
            step_id: row.try_get("step_id")?,
            data,
            created,
        })
    }
}

#[async_trait]
impl CheckpointStorage for PostgresCheckpointStorage {
    async fn insert(&self, checkpoint: FlowCheckpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO lead_flow_checkpoints
                (unique_id, checkpoint_type, status, ca_session_id, config_id, flow_id, step_id, data, created)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(checkpoint.unique_id)
        .bind(checkpoint.checkpoint_type.as_str())
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.ca_session_id)
        .bind(checkpoint.config_id)
        .bind(checkpoint.flow_id)
        .bind(checkpoint.step_id)
        .bind(Json(&checkpoint.data))
        .bind(checkpoint.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, unique_id: Uuid) -> Result<Option<FlowCheckpoint>> {
        sqlx::query("SELECT * FROM lead_flow_checkpoints WHERE unique_id = $1")
            .bind(unique_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Self::from_row)
            .transpose()
    }

    async fn consume(&self, unique_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE lead_flow_checkpoints SET status = $2
             WHERE unique_id = $1 AND status = $3",
        )
        .bind(unique_id)
        .bind(CheckpointStatus::Consumed.as_str())
        .bind(CheckpointStatus::Active.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
