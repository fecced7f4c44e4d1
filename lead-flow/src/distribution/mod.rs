//! Lead distribution: submit a visitor's answers to the external service,
//! poll for referrals and classify them.

#[cfg(feature = "leads-api")]
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    config::FlowConfig,
    error::Result,
    flow::{Flow, Step},
    store::{BRAND_RESPONSES, FlowSessionStore, control_keys},
};

#[cfg(feature = "leads-api")]
pub use http::HttpLeadsClient;

/// A brand's delivery status as reported by the distribution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReferralStatus {
    Duplicate,
    DeliveredOk,
    DeliveredRejected,
    Other(String),
}

impl From<String> for ReferralStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Duplicate" => ReferralStatus::Duplicate,
            "Delivered-OK" => ReferralStatus::DeliveredOk,
            "Delivered-Rejected" => ReferralStatus::DeliveredRejected,
            _ => ReferralStatus::Other(value),
        }
    }
}

impl From<ReferralStatus> for String {
    fn from(status: ReferralStatus) -> Self {
        match status {
            ReferralStatus::Duplicate => "Duplicate".to_string(),
            ReferralStatus::DeliveredOk => "Delivered-OK".to_string(),
            ReferralStatus::DeliveredRejected => "Delivered-Rejected".to_string(),
            ReferralStatus::Other(other) => other,
        }
    }
}

/// One brand's response to a submitted lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    #[serde(default)]
    pub brand_id: Option<i64>,
    #[serde(default)]
    pub status: Option<ReferralStatus>,
    #[serde(default)]
    pub billable: bool,
    #[serde(default)]
    pub deliveries: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadStatus {
    Processing,
    Done,
}

/// A lead record as returned by a poll.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolledLead {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ca_session_id: Option<String>,
    #[serde(default)]
    pub referrals: Vec<Referral>,
}

impl PolledLead {
    /// Anything other than `done`, including a missing status, is still processing.
    pub fn lead_status(&self) -> LeadStatus {
        match self.status.as_deref() {
            Some("done") => LeadStatus::Done,
            _ => LeadStatus::Processing,
        }
    }
}

/// Payload sent to the distribution service when a visitor enters a
/// distribution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSubmission {
    pub ca_session_id: Option<String>,
    pub config_id: i64,
    pub flow_id: i64,
    pub category_id: Option<i64>,
    pub brand_ids: Vec<i64>,
    pub answers: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// Client for the external lead distribution service.
#[async_trait]
pub trait LeadDistributionClient: Send + Sync {
    /// Submit a lead, returning the id used to poll it.
    async fn submit(&self, submission: &LeadSubmission) -> Result<String>;

    /// Fetch the current state of a submitted lead.
    async fn poll(&self, lead_id: &str) -> Result<PolledLead>;
}

/// True iff there is at least one referral and every one of them is a duplicate.
pub fn is_lead_duplicate(lead: &PolledLead) -> bool {
    !lead.referrals.is_empty()
        && lead
            .referrals
            .iter()
            .all(|referral| referral.status == Some(ReferralStatus::Duplicate))
}

/// How referrals of a finished lead are classified as matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingPolicy {
    /// Ping tree: only billable referrals count as matches.
    BillableOnly,
    /// Every referral counts.
    AllReferrals,
}

impl MatchingPolicy {
    /// Policy when the distribution step is missing or leaves `ping_tree` unset.
    pub const FALLBACK: MatchingPolicy = MatchingPolicy::AllReferrals;

    pub fn for_step(step: Option<&Step>) -> Self {
        match step.and_then(Step::ping_tree) {
            Some(true) => MatchingPolicy::BillableOnly,
            Some(false) => MatchingPolicy::AllReferrals,
            None => Self::FALLBACK,
        }
    }

    pub fn is_matching(&self) -> bool {
        *self == MatchingPolicy::BillableOnly
    }

    pub fn matched_brands(&self, referrals: &[Referral]) -> Vec<Referral> {
        match self {
            MatchingPolicy::BillableOnly => referrals
                .iter()
                .filter(|referral| referral.billable)
                .cloned()
                .collect(),
            MatchingPolicy::AllReferrals => referrals.to_vec(),
        }
    }
}

/// Record each referral's delivery responses under `brand_responses`, keyed
/// by brand id. Earlier responses for other brands are kept.
pub fn store_delivery_responses(lead: &PolledLead, store: Option<&mut FlowSessionStore>) {
    let Some(store) = store else {
        return;
    };

    let responses: Map<String, Value> = lead
        .referrals
        .iter()
        .filter_map(|referral| {
            referral
                .brand_id
                .map(|id| (id.to_string(), Value::Array(referral.deliveries.clone())))
        })
        .collect();

    store.merge_data(BRAND_RESPONSES, responses);
}

#[derive(Debug, Clone, PartialEq)]
pub enum DistributionOutcome {
    /// The flow has leads disabled; nothing was sent.
    Skipped,
    Submitted { lead_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Processing,
    /// The polled lead belongs to a different visitor.
    BadRequest,
    Done {
        matched: Vec<Referral>,
        duplicate: bool,
        referrals: Vec<Referral>,
    },
}

impl PollOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            PollOutcome::Processing => "processing",
            PollOutcome::BadRequest => "bad request",
            PollOutcome::Done { .. } => "done",
        }
    }
}

/// Drives submit and poll against a [`LeadDistributionClient`].
#[derive(Clone)]
pub struct DistributionEngine {
    client: Arc<dyn LeadDistributionClient>,
}

impl DistributionEngine {
    pub fn new(client: Arc<dyn LeadDistributionClient>) -> Self {
        Self { client }
    }

    /// Submit the visitor's answers when entering `step`.
    pub async fn distribute(
        &self,
        flow: &Flow,
        config: &FlowConfig,
        step: &Step,
        store: &mut FlowSessionStore,
        ca_session_id: Option<&str>,
    ) -> Result<DistributionOutcome> {
        if flow.disable_leads {
            info!(flow_id = flow.id, step = step.order, "Leads disabled, skipping distribution");
            return Ok(DistributionOutcome::Skipped);
        }

        let submission = LeadSubmission {
            ca_session_id: ca_session_id.map(str::to_string),
            config_id: config.id,
            flow_id: flow.id,
            category_id: config.category_id.or(flow.category_id),
            brand_ids: config.brand_ids.clone(),
            answers: store.answers().clone(),
            metadata: store.metadata().clone(),
        };

        let lead_id = self.client.submit(&submission).await?;
        store.set_control(control_keys::LEAD_ID, &lead_id)?;
        store.set_control(control_keys::DISTRIBUTION_STEP, step.order)?;
        store.control_mut().shift_remove(control_keys::MATCH_CHECKPOINT);

        info!(
            session_id = store.session_id(),
            config_id = config.id,
            step = step.order,
            lead_id = %lead_id,
            "Lead submitted"
        );

        Ok(DistributionOutcome::Submitted { lead_id })
    }

    /// Poll once. Retrying is up to the caller.
    pub async fn poll(
        &self,
        lead_id: &str,
        caller_ca_session_id: Option<&str>,
        distribution_step: Option<&Step>,
        store: Option<&mut FlowSessionStore>,
    ) -> Result<PollOutcome> {
        let lead = self.client.poll(lead_id).await?;

        let owned = matches!(
            (lead.ca_session_id.as_deref(), caller_ca_session_id),
            (Some(polled), Some(caller)) if polled == caller
        );
        if !owned {
            warn!(lead_id, "Polled lead does not belong to this session");
            return Ok(PollOutcome::BadRequest);
        }

        if lead.lead_status() == LeadStatus::Processing {
            debug!(lead_id, status = ?lead.status, "Lead still processing");
            return Ok(PollOutcome::Processing);
        }

        store_delivery_responses(&lead, store);

        let policy = MatchingPolicy::for_step(distribution_step);
        let matched = policy.matched_brands(&lead.referrals);
        let duplicate = is_lead_duplicate(&lead);

        info!(
            lead_id,
            referrals = lead.referrals.len(),
            matched = matched.len(),
            duplicate,
            ?policy,
            "Lead distribution done"
        );

        Ok(PollOutcome::Done {
            matched,
            duplicate,
            referrals: lead.referrals,
        })
    }
}
