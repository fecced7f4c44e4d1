//! FlowRunner – orchestrates one visitor request at a time: load the visitor's
//! [`FlowSessionStore`], act on it, and persist it back to session storage.
//!
//! ## Request lifecycle
//! Every public method follows the same _load → act → save_ pattern:
//! 1. resolve the [`FlowConfig`] and its [`Flow`] from [`FlowStorage`],
//! 2. load the per-config state for the browser session,
//! 3. perform exactly one operation (submit a step, poll a lead, ...),
//! 4. save the state so the next request starts where this one left off.
//!
//! The runner keeps no per-visitor state of its own, so a single instance can
//! be shared across all requests:
//! ```rust,ignore
//! struct AppState {
//!     runner: FlowRunner,
//! }
//!
//! let outcome = state.runner.submit_step(request).await?;
//! ```
//!
//! ## Polling
//! Lead polling is driven by the caller. [`FlowRunner::poll_lead`] performs a
//! single poll; a `processing` outcome means "ask again later".

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    checkpoint::{CheckpointLookup, CheckpointRejection, CheckpointService, CheckpointTtl, CheckpointType},
    config::FlowConfig,
    cross_sell::{CrossSellSelection, CrossSellSource, StepDataCrossSellSource, select_cross_sell},
    distribution::{DistributionEngine, DistributionOutcome, LeadDistributionClient, PollOutcome},
    enrichment::{Enricher, prepopulate_answers},
    error::{FlowError, Result},
    flow::{Flow, Step},
    recap::recap_answers,
    settings::FlowSettings,
    storage::{CheckpointStorage, FlowStorage, SessionStorage},
    store::{FlowSessionStore, control_keys},
    validator::{FieldErrors, StepValidator},
};

/// Answers submitted for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub session_id: String,
    pub ca_session_id: Option<String>,
    pub config_id: i64,
    pub step_order: i32,
    pub answers: Map<String, Value>,
}

/// What the caller should show after a step submission.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Answers rejected; the step is shown again with these errors.
    Invalid { step: i32, errors: FieldErrors },
    Next { step: i32 },
    /// Entered a distribution step and submitted the lead. Poll next.
    Distributing { step: i32, lead_id: String },
    /// Entered a distribution step of a flow with leads disabled.
    DistributionSkipped { step: i32 },
    /// Reached a terminal step, or ran off the end of the flow. State is wiped.
    Finished { step: Option<i32> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub outcome: PollOutcome,
    /// Step to route to once the lead is done.
    pub next_step: Option<i32>,
    /// Resume link for a matched visitor.
    pub match_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    NotRequested,
    Rejected(CheckpointRejection),
    Resumed {
        checkpoint_type: CheckpointType,
        step: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbandonLink {
    pub checkpoint_id: Uuid,
    pub link: String,
}

/// High-level helper that runs flow operations against pluggable storage and
/// integrations.
#[derive(Clone)]
pub struct FlowRunner {
    flows: Arc<dyn FlowStorage>,
    sessions: Arc<dyn SessionStorage>,
    checkpoints: CheckpointService,
    distribution: Option<DistributionEngine>,
    enricher: Enricher,
    cross_sell_source: Arc<dyn CrossSellSource>,
}

impl FlowRunner {
    pub fn new(
        flows: Arc<dyn FlowStorage>,
        sessions: Arc<dyn SessionStorage>,
        checkpoints: Arc<dyn CheckpointStorage>,
        settings: &FlowSettings,
    ) -> Self {
        Self {
            flows,
            sessions,
            checkpoints: CheckpointService::new(checkpoints, CheckpointTtl::from_settings(settings)),
            distribution: None,
            enricher: Enricher::without_providers(settings),
            cross_sell_source: Arc::new(StepDataCrossSellSource),
        }
    }

    pub fn with_distribution(mut self, client: Arc<dyn LeadDistributionClient>) -> Self {
        self.distribution = Some(DistributionEngine::new(client));
        self
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_cross_sell_source(mut self, source: Arc<dyn CrossSellSource>) -> Self {
        self.cross_sell_source = source;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointService {
        &self.checkpoints
    }

    async fn resolve(&self, config_id: i64) -> Result<(Arc<FlowConfig>, Arc<Flow>)> {
        let config = self
            .flows
            .get_config(config_id)
            .await?
            .ok_or(FlowError::ConfigNotFound(config_id))?;
        let flow = self
            .flows
            .get_flow(config.flow_id)
            .await?
            .ok_or(FlowError::FlowNotFound(config.flow_id))?;
        Ok((config, flow))
    }

    async fn load_store(&self, session_id: &str, config_id: i64) -> Result<FlowSessionStore> {
        FlowSessionStore::load(self.sessions.as_ref(), session_id, config_id).await
    }

    /// Validate and record one step's answers, then move the visitor on.
    pub async fn submit_step(&self, request: StepRequest) -> Result<StepOutcome> {
        let (config, flow) = self.resolve(request.config_id).await?;
        let step = flow.require_step(request.step_order)?;

        let validator = StepValidator::new(step, &request.answers)?;
        if !validator.is_valid() {
            info!(
                session_id = %request.session_id,
                config_id = config.id,
                step = step.order,
                "Step answers rejected"
            );
            return Ok(StepOutcome::Invalid {
                step: step.order,
                errors: validator.into_errors(),
            });
        }

        let mut store = self.load_store(&request.session_id, config.id).await?;
        store.merge_answers(&request.answers);
        store.visit_step(step.order);
        self.enricher
            .add_missing_fields(&mut store, &flow, step)
            .await?;

        let outcome = match flow.next_step(step, store.answers()) {
            None => {
                store.wipe_clean();
                StepOutcome::Finished { step: None }
            }
            Some(next) if next.is_last() => {
                store.wipe_clean();
                StepOutcome::Finished {
                    step: Some(next.order),
                }
            }
            Some(next) if next.is_distribution() => {
                self.enter_distribution(&flow, &config, next, &mut store, request.ca_session_id.as_deref())
                    .await?
            }
            Some(next) => StepOutcome::Next { step: next.order },
        };

        store.save(self.sessions.as_ref()).await?;

        debug!(
            session_id = %request.session_id,
            config_id = config.id,
            step = step.order,
            ?outcome,
            "Step submitted"
        );
        Ok(outcome)
    }

    async fn enter_distribution(
        &self,
        flow: &Flow,
        config: &FlowConfig,
        step: &Step,
        store: &mut FlowSessionStore,
        ca_session_id: Option<&str>,
    ) -> Result<StepOutcome> {
        store.visit_step(step.order);

        if flow.disable_leads {
            info!(flow_id = flow.id, step = step.order, "Leads disabled, skipping distribution");
            return Ok(StepOutcome::DistributionSkipped { step: step.order });
        }

        let engine = self.distribution.as_ref().ok_or_else(|| {
            FlowError::DistributionError("no lead distribution client configured".to_string())
        })?;

        match engine.distribute(flow, config, step, store, ca_session_id).await? {
            DistributionOutcome::Skipped => Ok(StepOutcome::DistributionSkipped { step: step.order }),
            DistributionOutcome::Submitted { lead_id } => Ok(StepOutcome::Distributing {
                step: step.order,
                lead_id,
            }),
        }
    }

    /// Poll the visitor's submitted lead once and route on the result.
    pub async fn poll_lead(
        &self,
        session_id: &str,
        ca_session_id: Option<&str>,
        config_id: i64,
    ) -> Result<PollResult> {
        let (config, flow) = self.resolve(config_id).await?;
        let mut store = self.load_store(session_id, config.id).await?;

        let engine = self.distribution.as_ref().ok_or_else(|| {
            FlowError::DistributionError("no lead distribution client configured".to_string())
        })?;
        let lead_id: String = store
            .get_control(control_keys::LEAD_ID)
            .ok_or_else(|| FlowError::NotFound(format!("no lead submitted for session {session_id}")))?;

        let distribution_step = store
            .get_control::<i32>(control_keys::DISTRIBUTION_STEP)
            .and_then(|order| flow.step_by_order(order))
            .or_else(|| flow.first_distribution_step());

        let outcome = engine
            .poll(&lead_id, ca_session_id, distribution_step, Some(&mut store))
            .await?;

        let (next_step, match_link) = match &outcome {
            PollOutcome::Done { matched, .. } if !matched.is_empty() => {
                let next = distribution_step.and_then(|step| flow.next_step(step, store.answers()));
                let link = self
                    .record_match(&flow, &config, distribution_step, &mut store, ca_session_id)
                    .await?;
                (next.map(|step| step.order), link)
            }
            PollOutcome::Done { .. } => {
                let fallback = flow.cross_sell_step().or_else(|| flow.no_match_step());
                (fallback.map(|step| step.order), None)
            }
            PollOutcome::Processing | PollOutcome::BadRequest => (None, None),
        };

        if outcome != PollOutcome::BadRequest {
            store.save(self.sessions.as_ref()).await?;
        }

        Ok(PollResult {
            outcome,
            next_step,
            match_link,
        })
    }

    async fn record_match(
        &self,
        flow: &Flow,
        config: &FlowConfig,
        distribution_step: Option<&Step>,
        store: &mut FlowSessionStore,
        ca_session_id: Option<&str>,
    ) -> Result<Option<String>> {
        // One match link per submitted lead; later polls hand back the same one.
        if let Some(existing) = store.get_control::<Uuid>(control_keys::MATCH_CHECKPOINT) {
            debug!(checkpoint_id = %existing, "Match checkpoint already recorded");
            return Ok(Some(config.continue_link(&existing.to_string())?));
        }

        if let Some(resumed) = store.get_control::<Uuid>(control_keys::RESUMED_CHECKPOINT) {
            if !self.checkpoints.consume(resumed).await? {
                debug!(checkpoint_id = %resumed, "Resumed checkpoint was already consumed");
            }
        }

        let Some(step) = distribution_step.or_else(|| flow.first_step()) else {
            return Ok(None);
        };
        let Some(checkpoint) = self
            .checkpoints
            .create_match_checkpoint(ca_session_id, store, config, flow, step)
            .await?
        else {
            return Ok(None);
        };

        store.set_control(control_keys::MATCH_CHECKPOINT, checkpoint.unique_id)?;
        Ok(Some(checkpoint.link(config)?))
    }

    /// Snapshot the visitor at the step they last reached and hand back the
    /// resume link. `None` when the visitor cannot be re-identified.
    pub async fn abandon(
        &self,
        session_id: &str,
        ca_session_id: Option<&str>,
        config_id: i64,
    ) -> Result<Option<AbandonLink>> {
        let (config, flow) = self.resolve(config_id).await?;
        let store = self.load_store(session_id, config.id).await?;

        let step = store
            .steps_visited()
            .last()
            .and_then(|order| flow.step_by_order(*order))
            .or_else(|| flow.first_step())
            .ok_or_else(|| FlowError::StepNotFound(format!("flow {} has no steps", flow.id)))?;

        let Some(checkpoint) = self
            .checkpoints
            .create_abandon_checkpoint(ca_session_id, &store, &config, &flow, step)
            .await?
        else {
            return Ok(None);
        };

        Ok(Some(AbandonLink {
            checkpoint_id: checkpoint.unique_id,
            link: checkpoint.link(&config)?,
        }))
    }

    /// Restore the visitor's state from a `continue` link.
    pub async fn resume(
        &self,
        session_id: &str,
        config_id: i64,
        unique_id: Option<&str>,
    ) -> Result<ResumeOutcome> {
        let (config, flow) = self.resolve(config_id).await?;

        let checkpoint = match self.checkpoints.redeem(unique_id, Some(config.id)).await? {
            CheckpointLookup::NotRequested => return Ok(ResumeOutcome::NotRequested),
            CheckpointLookup::Rejected(reason) => {
                warn!(session_id, config_id = config.id, %reason, "Resume rejected");
                return Ok(ResumeOutcome::Rejected(reason));
            }
            CheckpointLookup::Found(checkpoint) => checkpoint,
        };

        let step = flow.step_by_id(checkpoint.step_id).ok_or_else(|| {
            FlowError::StepNotFound(format!("flow {} step id {}", flow.id, checkpoint.step_id))
        })?;

        let mut store = self.load_store(session_id, config.id).await?;
        store.restore(&checkpoint.data);
        if checkpoint.checkpoint_type == CheckpointType::Abandon {
            store.set_control(control_keys::RESUMED_CHECKPOINT, checkpoint.unique_id)?;
        }
        store.save(self.sessions.as_ref()).await?;

        info!(
            session_id,
            config_id = config.id,
            checkpoint_id = %checkpoint.unique_id,
            step = step.order,
            "Session resumed from checkpoint"
        );

        Ok(ResumeOutcome::Resumed {
            checkpoint_type: checkpoint.checkpoint_type,
            step: step.order,
        })
    }

    /// Pick a cross-sell brand for a visitor sitting on `step_order`.
    pub async fn cross_sell(
        &self,
        config_id: i64,
        step_order: i32,
        brand_id: i64,
    ) -> Result<CrossSellSelection> {
        let (_, flow) = self.resolve(config_id).await?;
        select_cross_sell(&flow, step_order, brand_id, self.cross_sell_source.as_ref()).await
    }

    /// Recap lines for the visitor's answers using the `recap` mapping of the
    /// step at `step_order`.
    pub async fn recap(&self, session_id: &str, config_id: i64, step_order: i32) -> Result<Vec<String>> {
        let (config, flow) = self.resolve(config_id).await?;
        let step = flow.require_step(step_order)?;
        let store = self.load_store(session_id, config.id).await?;

        let recap = step
            .data
            .get("recap")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(recap_answers(store.answers(), &recap))
    }

    /// Seed answers from posted landing-page data.
    pub async fn prepopulate(
        &self,
        session_id: &str,
        config_id: i64,
        posted: &Map<String, Value>,
    ) -> Result<usize> {
        let (config, flow) = self.resolve(config_id).await?;
        let mut store = self.load_store(session_id, config.id).await?;
        let copied = prepopulate_answers(&mut store, &flow, posted);
        store.save(self.sessions.as_ref()).await?;
        Ok(copied)
    }
}
