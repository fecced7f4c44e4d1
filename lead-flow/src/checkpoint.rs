//! Abandon and match checkpoints: link-addressable snapshots of a visitor's
//! flow state that can be redeemed later to resume or recap a session.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::FlowConfig,
    error::Result,
    flow::{Flow, Step},
    settings::FlowSettings,
    storage::CheckpointStorage,
    store::{FlowSessionStore, StateSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Abandon,
    Match,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Abandon => "abandon",
            CheckpointType::Match => "match",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "abandon" => Some(CheckpointType::Abandon),
            "match" => Some(CheckpointType::Match),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Active,
    Consumed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Active => "active",
            CheckpointStatus::Consumed => "consumed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CheckpointStatus::Active),
            "consumed" => Some(CheckpointStatus::Consumed),
            _ => None,
        }
    }
}

/// Persisted snapshot of a visitor's state at a given step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    pub unique_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub status: CheckpointStatus,
    pub ca_session_id: String,
    pub config_id: i64,
    pub flow_id: i64,
    pub step_id: i64,
    pub data: StateSnapshot,
    pub created: DateTime<Utc>,
}

impl FlowCheckpoint {
    /// Status only; expiry is judged when the checkpoint is resolved.
    pub fn is_active(&self) -> bool {
        self.status == CheckpointStatus::Active
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created
    }

    pub fn link(&self, config: &FlowConfig) -> Result<String> {
        config.continue_link(&self.unique_id.to_string())
    }
}

/// Why a checkpoint could not be used. Rendered verbatim to visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointRejection {
    InvalidUniqueId,
    DoesNotExist,
    DifferentConfig,
    MatchLinkExpired,
    AbandonLinkExpired,
    AlreadyMatched,
    /// Lost the race to redeem a match checkpoint.
    AlreadyUsed,
}

impl fmt::Display for CheckpointRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CheckpointRejection::InvalidUniqueId => "Invalid unique id",
            CheckpointRejection::DoesNotExist => "Checkpoint does not exist",
            CheckpointRejection::DifferentConfig => "Checkpoint used for different config",
            CheckpointRejection::MatchLinkExpired => "Match link expired",
            CheckpointRejection::AbandonLinkExpired => "Abandon link expired",
            CheckpointRejection::AlreadyMatched => "Checkpoint already matched",
            CheckpointRejection::AlreadyUsed => "Checkpoint already used",
        };
        f.write_str(reason)
    }
}

/// Result of looking up a checkpoint by its link id.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointLookup {
    /// No id was supplied; nothing to resume.
    NotRequested,
    Found(FlowCheckpoint),
    Rejected(CheckpointRejection),
}

impl CheckpointLookup {
    /// `(checkpoint, reason)` pair for callers that render both.
    pub fn into_parts(self) -> (Option<FlowCheckpoint>, Option<String>) {
        match self {
            CheckpointLookup::NotRequested => (None, None),
            CheckpointLookup::Found(checkpoint) => (Some(checkpoint), None),
            CheckpointLookup::Rejected(reason) => (None, Some(reason.to_string())),
        }
    }
}

/// Expiry windows per checkpoint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointTtl {
    pub match_link: Duration,
    pub abandon_link: Duration,
}

impl CheckpointTtl {
    pub fn from_settings(settings: &FlowSettings) -> Self {
        Self {
            match_link: Duration::days(settings.match_link_ttl_days),
            abandon_link: Duration::days(settings.abandon_link_ttl_days),
        }
    }

    pub fn for_type(&self, checkpoint_type: CheckpointType) -> Duration {
        match checkpoint_type {
            CheckpointType::Match => self.match_link,
            CheckpointType::Abandon => self.abandon_link,
        }
    }
}

/// Creates, resolves and consumes checkpoints.
#[derive(Clone)]
pub struct CheckpointService {
    storage: Arc<dyn CheckpointStorage>,
    ttl: CheckpointTtl,
}

impl CheckpointService {
    pub fn new(storage: Arc<dyn CheckpointStorage>, ttl: CheckpointTtl) -> Self {
        Self { storage, ttl }
    }

    /// Snapshot the visitor's state at `step` so an abandon link can resume it.
    ///
    /// Without a session correlation id the visitor cannot be re-identified,
    /// so nothing is created.
    pub async fn create_abandon_checkpoint(
        &self,
        ca_session_id: Option<&str>,
        store: &FlowSessionStore,
        config: &FlowConfig,
        flow: &Flow,
        step: &Step,
    ) -> Result<Option<FlowCheckpoint>> {
        self.create(CheckpointType::Abandon, ca_session_id, store, config, flow, step)
            .await
    }

    /// Snapshot the visitor's state once distribution produced a match.
    pub async fn create_match_checkpoint(
        &self,
        ca_session_id: Option<&str>,
        store: &FlowSessionStore,
        config: &FlowConfig,
        flow: &Flow,
        step: &Step,
    ) -> Result<Option<FlowCheckpoint>> {
        self.create(CheckpointType::Match, ca_session_id, store, config, flow, step)
            .await
    }

    async fn create(
        &self,
        checkpoint_type: CheckpointType,
        ca_session_id: Option<&str>,
        store: &FlowSessionStore,
        config: &FlowConfig,
        flow: &Flow,
        step: &Step,
    ) -> Result<Option<FlowCheckpoint>> {
        let Some(ca_session_id) = ca_session_id.filter(|id| !id.is_empty()) else {
            warn!(
                checkpoint_type = checkpoint_type.as_str(),
                config_id = config.id,
                step = step.order,
                "Checkpoint requested without ca_session_id"
            );
            return Ok(None);
        };

        let checkpoint = FlowCheckpoint {
            unique_id: Uuid::new_v4(),
            checkpoint_type,
            status: CheckpointStatus::Active,
            ca_session_id: ca_session_id.to_string(),
            config_id: config.id,
            flow_id: flow.id,
            step_id: step.id,
            data: store.snapshot(),
            created: Utc::now(),
        };

        self.storage.insert(checkpoint.clone()).await?;

        info!(
            checkpoint_id = %checkpoint.unique_id,
            checkpoint_type = checkpoint_type.as_str(),
            config_id = config.id,
            step = step.order,
            "Checkpoint created"
        );

        Ok(Some(checkpoint))
    }

    pub async fn resolve_checkpoint(
        &self,
        unique_id: Option<&str>,
        expected_config_id: Option<i64>,
    ) -> Result<CheckpointLookup> {
        self.resolve_at(unique_id, expected_config_id, Utc::now())
            .await
    }

    /// Resolve against an explicit clock. The first failing check wins.
    pub async fn resolve_at(
        &self,
        unique_id: Option<&str>,
        expected_config_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<CheckpointLookup> {
        let Some(raw_id) = unique_id.filter(|id| !id.is_empty()) else {
            return Ok(CheckpointLookup::NotRequested);
        };

        let Ok(id) = Uuid::parse_str(raw_id) else {
            return Ok(CheckpointLookup::Rejected(CheckpointRejection::InvalidUniqueId));
        };

        let Some(checkpoint) = self.storage.get(id).await? else {
            return Ok(CheckpointLookup::Rejected(CheckpointRejection::DoesNotExist));
        };

        let rejection = if expected_config_id.is_some_and(|expected| expected != checkpoint.config_id)
        {
            Some(CheckpointRejection::DifferentConfig)
        } else if checkpoint.checkpoint_type == CheckpointType::Match
            && checkpoint.age(now) > self.ttl.match_link
        {
            Some(CheckpointRejection::MatchLinkExpired)
        } else if checkpoint.checkpoint_type == CheckpointType::Abandon
            && checkpoint.age(now) > self.ttl.abandon_link
        {
            Some(CheckpointRejection::AbandonLinkExpired)
        } else if checkpoint.checkpoint_type == CheckpointType::Abandon && !checkpoint.is_active() {
            Some(CheckpointRejection::AlreadyMatched)
        } else {
            None
        };

        match rejection {
            Some(reason) => {
                info!(checkpoint_id = %id, reason = %reason, "Checkpoint rejected");
                Ok(CheckpointLookup::Rejected(reason))
            }
            None => Ok(CheckpointLookup::Found(checkpoint)),
        }
    }

    /// Atomically flip the checkpoint to consumed. Returns false if another
    /// request got there first.
    pub async fn consume(&self, unique_id: Uuid) -> Result<bool> {
        let consumed = self.storage.consume(unique_id).await?;
        if consumed {
            info!(checkpoint_id = %unique_id, "Checkpoint consumed");
        }
        Ok(consumed)
    }

    /// Resolve and, for match links, consume in one go. The restored state is
    /// the checkpoint's snapshot.
    pub async fn redeem(
        &self,
        unique_id: Option<&str>,
        expected_config_id: Option<i64>,
    ) -> Result<CheckpointLookup> {
        let lookup = self
            .resolve_checkpoint(unique_id, expected_config_id)
            .await?;

        match lookup {
            CheckpointLookup::Found(mut checkpoint)
                if checkpoint.checkpoint_type == CheckpointType::Match =>
            {
                if !self.consume(checkpoint.unique_id).await? {
                    return Ok(CheckpointLookup::Rejected(CheckpointRejection::AlreadyUsed));
                }
                checkpoint.status = CheckpointStatus::Consumed;
                Ok(CheckpointLookup::Found(checkpoint))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Endpoint,
        flow::{FlowBuilder, StepType},
        storage::InMemoryCheckpointStorage,
    };
    use serde_json::json;

    fn config(id: i64) -> FlowConfig {
        FlowConfig {
            id,
            flow_id: 1,
            category_id: None,
            endpoint: Endpoint {
                host: "t.es.t".into(),
                path: "path/".into(),
            },
            brand_ids: vec![],
        }
    }

    fn service() -> (CheckpointService, Arc<InMemoryCheckpointStorage>) {
        let storage = Arc::new(InMemoryCheckpointStorage::new());
        let ttl = CheckpointTtl {
            match_link: Duration::days(30),
            abandon_link: Duration::days(30),
        };
        (CheckpointService::new(storage.clone(), ttl), storage)
    }

    fn checkpoint(checkpoint_type: CheckpointType, age_days: i64) -> FlowCheckpoint {
        FlowCheckpoint {
            unique_id: Uuid::new_v4(),
            checkpoint_type,
            status: CheckpointStatus::Active,
            ca_session_id: "d88d1916-20e0-45b7-a186-e342b4a42531".into(),
            config_id: 1,
            flow_id: 1,
            step_id: 1,
            data: StateSnapshot::default(),
            created: Utc::now() - Duration::days(age_days),
        }
    }

    async fn resolve(service: &CheckpointService, id: &str, config: Option<i64>) -> (Option<FlowCheckpoint>, Option<String>) {
        service.resolve_checkpoint(Some(id), config).await.unwrap().into_parts()
    }

    #[tokio::test]
    async fn test_create_abandon_with_ca_session_id() {
        let (service, _) = service();
        let flow = FlowBuilder::new(1, "f")
            .add_step(Step::new(11, 0, StepType::Question))
            .build();
        let step = &flow.steps[0];

        let mut store = FlowSessionStore::new("browser", 1);
        store.answers_mut().insert("5".into(), json!("6"));
        store.metadata_mut().insert("a".into(), json!("b"));
        store.control_mut().insert("banana".into(), json!("apple"));

        let created = service
            .create_abandon_checkpoint(
                Some("d88d1916-20e0-45b7-a186-e342b4a42531"),
                &store,
                &config(1),
                &flow,
                step,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(created.ca_session_id, "d88d1916-20e0-45b7-a186-e342b4a42531");
        assert_eq!(created.checkpoint_type, CheckpointType::Abandon);
        assert_eq!(created.config_id, 1);
        assert_eq!(created.flow_id, 1);
        assert_eq!(created.step_id, 11);
        assert_eq!(
            serde_json::to_value(&created.data).unwrap(),
            json!({"answers": {"5": "6"}, "metadata": {"a": "b"}, "control": {"banana": "apple"}})
        );
    }

    #[tokio::test]
    async fn test_create_abandon_without_ca_session_id() {
        let (service, _) = service();
        let flow = FlowBuilder::new(1, "f")
            .add_step(Step::new(11, 0, StepType::Question))
            .build();
        let store = FlowSessionStore::new("browser", 1);

        let created = service
            .create_abandon_checkpoint(None, &store, &config(1), &flow, &flow.steps[0])
            .await
            .unwrap();
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn test_no_unique_id() {
        let (service, _) = service();
        for id in [None, Some("")] {
            let lookup = service.resolve_checkpoint(id, None).await.unwrap();
            assert_eq!(lookup, CheckpointLookup::NotRequested);
            assert_eq!(lookup.into_parts(), (None, None));
        }

        let blank = service.resolve_checkpoint(Some("  "), None).await.unwrap();
        assert_eq!(blank, CheckpointLookup::Rejected(CheckpointRejection::InvalidUniqueId));
    }

    #[tokio::test]
    async fn test_ttl_boundary_is_inclusive() {
        let (service, storage) = service();
        let ttl = Duration::days(30);

        for (checkpoint_type, expired) in [
            (CheckpointType::Match, CheckpointRejection::MatchLinkExpired),
            (CheckpointType::Abandon, CheckpointRejection::AbandonLinkExpired),
        ] {
            let link = checkpoint(checkpoint_type, 0);
            storage.insert(link.clone()).await.unwrap();
            let id = link.unique_id.to_string();

            let at_limit = service
                .resolve_at(Some(&id), None, link.created + ttl)
                .await
                .unwrap();
            assert_eq!(at_limit, CheckpointLookup::Found(link.clone()));

            let past_limit = service
                .resolve_at(Some(&id), None, link.created + ttl + Duration::seconds(1))
                .await
                .unwrap();
            assert_eq!(past_limit, CheckpointLookup::Rejected(expired));
        }
    }

    #[tokio::test]
    async fn test_rejections_in_precedence_order() {
        let (service, storage) = service();

        assert_eq!(
            resolve(&service, "hello", None).await,
            (None, Some("Invalid unique id".to_string()))
        );
        assert_eq!(
            resolve(&service, &Uuid::new_v4().to_string(), None).await,
            (None, Some("Checkpoint does not exist".to_string()))
        );

        let fresh_match = checkpoint(CheckpointType::Match, 0);
        storage.insert(fresh_match.clone()).await.unwrap();
        let id = fresh_match.unique_id.to_string();
        assert_eq!(resolve(&service, &id, None).await, (Some(fresh_match.clone()), None));
        assert_eq!(
            resolve(&service, &id, Some(2)).await,
            (None, Some("Checkpoint used for different config".to_string()))
        );

        let old_match = checkpoint(CheckpointType::Match, 90);
        storage.insert(old_match.clone()).await.unwrap();
        assert_eq!(
            resolve(&service, &old_match.unique_id.to_string(), None).await,
            (None, Some("Match link expired".to_string()))
        );
        // A config mismatch outranks expiry.
        assert_eq!(
            resolve(&service, &old_match.unique_id.to_string(), Some(2)).await,
            (None, Some("Checkpoint used for different config".to_string()))
        );

        let old_abandon = checkpoint(CheckpointType::Abandon, 90);
        storage.insert(old_abandon.clone()).await.unwrap();
        assert_eq!(
            resolve(&service, &old_abandon.unique_id.to_string(), None).await,
            (None, Some("Abandon link expired".to_string()))
        );

        let mut matched = checkpoint(CheckpointType::Abandon, 0);
        matched.status = CheckpointStatus::Consumed;
        storage.insert(matched.clone()).await.unwrap();
        assert_eq!(
            resolve(&service, &matched.unique_id.to_string(), None).await,
            (None, Some("Checkpoint already matched".to_string()))
        );
    }

    #[tokio::test]
    async fn test_consumed_match_still_resolves() {
        let (service, storage) = service();
        let mut consumed = checkpoint(CheckpointType::Match, 1);
        consumed.status = CheckpointStatus::Consumed;
        storage.insert(consumed.clone()).await.unwrap();

        let (found, reason) = resolve(&service, &consumed.unique_id.to_string(), Some(1)).await;
        assert!(reason.is_none());
        assert!(!found.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_match_redeemed_once() {
        let (service, storage) = service();
        let link = checkpoint(CheckpointType::Match, 0);
        storage.insert(link.clone()).await.unwrap();
        let id = link.unique_id.to_string();

        let first = service.redeem(Some(&id), Some(1)).await.unwrap();
        assert!(matches!(first, CheckpointLookup::Found(ref c) if !c.is_active()));

        let second = service.redeem(Some(&id), Some(1)).await.unwrap();
        assert_eq!(
            second,
            CheckpointLookup::Rejected(CheckpointRejection::AlreadyUsed)
        );
    }

    #[test]
    fn test_is_active_and_link() {
        let mut link = checkpoint(CheckpointType::Abandon, 0);
        assert!(link.is_active());
        assert_eq!(
            link.link(&config(1)).unwrap(),
            format!("https://t.es.t/path/?continue={}", link.unique_id)
        );

        link.status = CheckpointStatus::Consumed;
        assert!(!link.is_active());
    }
}
