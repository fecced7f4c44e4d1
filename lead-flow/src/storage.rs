use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    checkpoint::{CheckpointStatus, FlowCheckpoint},
    config::FlowConfig,
    error::Result,
    flow::Flow,
};

/// A visitor's browser session. Flow state lives under namespaced keys in `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Map::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Trait for storing and retrieving flow and config definitions
#[async_trait]
pub trait FlowStorage: Send + Sync {
    async fn save_flow(&self, flow: Arc<Flow>) -> Result<()>;
    async fn get_flow(&self, id: i64) -> Result<Option<Arc<Flow>>>;
    async fn save_config(&self, config: Arc<FlowConfig>) -> Result<()>;
    async fn get_config(&self, id: i64) -> Result<Option<Arc<FlowConfig>>>;
}

/// Trait for storing and retrieving browser sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Trait for persisting checkpoints
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    async fn insert(&self, checkpoint: FlowCheckpoint) -> Result<()>;
    async fn get(&self, unique_id: Uuid) -> Result<Option<FlowCheckpoint>>;
    /// Flip `active` to `consumed`. Returns false when the checkpoint was
    /// missing or already consumed, so only one caller can win.
    async fn consume(&self, unique_id: Uuid) -> Result<bool>;
}

/// In-memory implementation of FlowStorage
pub struct InMemoryFlowStorage {
    flows: Arc<DashMap<i64, Arc<Flow>>>,
    configs: Arc<DashMap<i64, Arc<FlowConfig>>>,
}

impl InMemoryFlowStorage {
    pub fn new() -> Self {
        Self {
            flows: Arc::new(DashMap::new()),
            configs: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryFlowStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowStorage for InMemoryFlowStorage {
    async fn save_flow(&self, flow: Arc<Flow>) -> Result<()> {
        self.flows.insert(flow.id, flow);
        Ok(())
    }

    async fn get_flow(&self, id: i64) -> Result<Option<Arc<Flow>>> {
        Ok(self.flows.get(&id).map(|entry| entry.clone()))
    }

    async fn save_config(&self, config: Arc<FlowConfig>) -> Result<()> {
        self.configs.insert(config.id, config);
        Ok(())
    }

    async fn get_config(&self, id: i64) -> Result<Option<Arc<FlowConfig>>> {
        Ok(self.configs.get(&id).map(|entry| entry.clone()))
    }
}

/// In-memory implementation of SessionStorage
pub struct InMemorySessionStorage {
    sessions: Arc<DashMap<String, Session>>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemorySessionStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save(&self, session: Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }
}

/// In-memory implementation of CheckpointStorage
pub struct InMemoryCheckpointStorage {
    checkpoints: Arc<DashMap<Uuid, FlowCheckpoint>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self {
            checkpoints: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryCheckpointStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn insert(&self, checkpoint: FlowCheckpoint) -> Result<()> {
        self.checkpoints.insert(checkpoint.unique_id, checkpoint);
        Ok(())
    }

    async fn get(&self, unique_id: Uuid) -> Result<Option<FlowCheckpoint>> {
        Ok(self
            .checkpoints
            .get(&unique_id)
            .map(|entry| entry.clone()))
    }

    async fn consume(&self, unique_id: Uuid) -> Result<bool> {
        // The shard write lock makes the status check and flip one step.
        match self.checkpoints.get_mut(&unique_id) {
            Some(mut entry) if entry.status == CheckpointStatus::Active => {
                entry.status = CheckpointStatus::Consumed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
