//! Per-visitor flow state: `answers`, `metadata` and `control`, namespaced by
//! config id inside the visitor's browser session.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

use crate::{error::Result, storage::Session, storage::SessionStorage};

pub const ANSWERS: &str = "answers";
pub const METADATA: &str = "metadata";
pub const CONTROL: &str = "control";

/// Control keys the engine itself maintains.
pub mod control_keys {
    pub const STEPS_VISITED: &str = "steps_visited";
    pub const LEAD_ID: &str = "lead_id";
    pub const DISTRIBUTION_STEP: &str = "distribution_step";
    pub const RESUMED_CHECKPOINT: &str = "resumed_checkpoint";
    pub const MATCH_CHECKPOINT: &str = "match_checkpoint";
}

pub const BRAND_RESPONSES: &str = "brand_responses";

static EMPTY: LazyLock<Map<String, Value>> = LazyLock::new(Map::new);

/// The three partitions copied into a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub answers: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub control: Map<String, Value>,
}

/// Flow state for one (browser session, config) pair.
///
/// The store is an explicit value: load it at the start of a request, pass it
/// to every operation that reads or writes visitor state, then save it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSessionStore {
    session_id: String,
    config_id: i64,
    data: Map<String, Value>,
}

impl FlowSessionStore {
    /// Empty state for `config_id`, as created on first access.
    pub fn new(session_id: impl Into<String>, config_id: i64) -> Self {
        Self {
            session_id: session_id.into(),
            config_id,
            data: Self::initial_data(),
        }
    }

    pub fn session_key(config_id: i64) -> String {
        format!("data_v2:{config_id}")
    }

    /// Load the state for `config_id`, creating it lazily when absent.
    pub async fn load(
        storage: &dyn SessionStorage,
        session_id: &str,
        config_id: i64,
    ) -> Result<Self> {
        let key = Self::session_key(config_id);
        let stored = storage
            .get(session_id)
            .await?
            .and_then(|mut session| session.data.remove(&key));

        let data = match stored {
            Some(Value::Object(data)) => data,
            _ => {
                debug!(session_id, config_id, "Initializing flow session state");
                Self::initial_data()
            }
        };

        Ok(Self {
            session_id: session_id.to_string(),
            config_id,
            data,
        })
    }

    /// Write the state back under its namespaced key, keeping any other
    /// config's state in the same browser session. A wiped state removes the key.
    pub async fn save(&self, storage: &dyn SessionStorage) -> Result<()> {
        let mut session = storage
            .get(&self.session_id)
            .await?
            .unwrap_or_else(|| Session::new(self.session_id.clone()));

        let key = Self::session_key(self.config_id);
        if self.data.is_empty() {
            session.data.remove(&key);
        } else {
            session.data.insert(key, Value::Object(self.data.clone()));
        }
        session.touch();

        storage.save(session).await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config_id(&self) -> i64 {
        self.config_id
    }

    /// The whole namespaced structure, partitions included.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn answers(&self) -> &Map<String, Value> {
        self.partition(ANSWERS)
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        self.partition(METADATA)
    }

    pub fn control(&self) -> &Map<String, Value> {
        self.partition(CONTROL)
    }

    pub fn answers_mut(&mut self) -> &mut Map<String, Value> {
        self.partition_mut(ANSWERS)
    }

    pub fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        self.partition_mut(METADATA)
    }

    pub fn control_mut(&mut self) -> &mut Map<String, Value> {
        self.partition_mut(CONTROL)
    }

    /// Overlay `answers` onto the stored answers.
    pub fn merge_answers(&mut self, answers: &Map<String, Value>) {
        let stored = self.answers_mut();
        for (key, value) in answers {
            stored.insert(key.clone(), value.clone());
        }
    }

    pub fn get_control<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.control()
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_control(&mut self, key: &str, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.control_mut().insert(key.to_string(), value);
        Ok(())
    }

    /// Merge `entries` into the top-level mapping stored under `key`,
    /// leaving unrelated keys of that mapping in place.
    pub fn merge_data(&mut self, key: &str, entries: Map<String, Value>) {
        let slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(existing) = slot {
            existing.extend(entries);
        }
    }

    /// Record `order` as visited, keeping the history free of repeats.
    pub fn visit_step(&mut self, order: i32) {
        let visited = self
            .control_mut()
            .entry(control_keys::STEPS_VISITED.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(orders) = visited {
            let order = Value::from(order);
            if !orders.contains(&order) {
                orders.push(order);
            }
        }
    }

    pub fn steps_visited(&self) -> Vec<i32> {
        self.get_control(control_keys::STEPS_VISITED)
            .unwrap_or_default()
    }

    /// Reset navigation bookkeeping only; answers and metadata survive.
    pub fn clear(&mut self) {
        self.data
            .insert(CONTROL.to_string(), Value::Object(Map::new()));
    }

    /// Drop the entire state for this config.
    pub fn wipe_clean(&mut self) {
        self.data.clear();
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            answers: self.answers().clone(),
            metadata: self.metadata().clone(),
            control: self.control().clone(),
        }
    }

    /// Replace the three partitions with a checkpoint's copy.
    pub fn restore(&mut self, snapshot: &StateSnapshot) {
        self.data
            .insert(ANSWERS.to_string(), Value::Object(snapshot.answers.clone()));
        self.data
            .insert(METADATA.to_string(), Value::Object(snapshot.metadata.clone()));
        self.data
            .insert(CONTROL.to_string(), Value::Object(snapshot.control.clone()));
    }

    fn initial_data() -> Map<String, Value> {
        let mut data = Map::new();
        for partition in [ANSWERS, METADATA, CONTROL] {
            data.insert(partition.to_string(), Value::Object(Map::new()));
        }
        data
    }

    fn partition(&self, name: &str) -> &Map<String, Value> {
        self.data
            .get(name)
            .and_then(Value::as_object)
            .unwrap_or(&EMPTY)
    }

    fn partition_mut(&mut self, name: &str) -> &mut Map<String, Value> {
        let slot = self
            .data
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(map) => map,
            _ => unreachable!("partition was just normalized to an object"),
        }
    }
}
