//! Derived fields computed after a step is submitted, plus answer
//! prepopulation from posted landing-page data.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    error::Result,
    flow::{Flow, Step},
    settings::FlowSettings,
    store::FlowSessionStore,
};

const BIRTH_DATE_KEYS: [&str; 3] = ["birth_date", "birthdate", "date_of_birth"];
const FULL_SSN_DIGITS: usize = 9;

/// Zip code geography.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn county_for_zip(&self, zip: &str) -> Result<Option<String>>;
    async fn zip_for_city(&self, city: &str, state: &str) -> Result<Option<String>>;
}

/// Credit bureau lookup. `request` carries `ssn`, `first_name`, `last_name`,
/// `street`, `state` and `zip_code` when known.
#[async_trait]
pub trait CreditRatingProvider: Send + Sync {
    async fn credit_rating(&self, request: &Map<String, Value>) -> Result<Option<i64>>;
}

#[async_trait]
pub trait EmailMarketing: Send + Sync {
    async fn subscribe(&self, payload: &Map<String, Value>) -> Result<()>;
}

/// Per-domain email marketing opt-in.
#[async_trait]
pub trait DomainDirectory: Send + Sync {
    /// `None` when the host is unknown.
    async fn send_data_to_email_marketing(&self, host: &str) -> Result<Option<bool>>;
}

/// Providers that never know anything. Enrichment falls back to defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProviders;

#[async_trait]
impl GeoLookup for NoProviders {
    async fn county_for_zip(&self, _zip: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn zip_for_city(&self, _city: &str, _state: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
impl CreditRatingProvider for NoProviders {
    async fn credit_rating(&self, _request: &Map<String, Value>) -> Result<Option<i64>> {
        Ok(None)
    }
}

#[async_trait]
impl EmailMarketing for NoProviders {
    async fn subscribe(&self, _payload: &Map<String, Value>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DomainDirectory for NoProviders {
    async fn send_data_to_email_marketing(&self, _host: &str) -> Result<Option<bool>> {
        Ok(None)
    }
}

/// Unknown hosts subscribe.
pub async fn is_email_subscription(directory: &dyn DomainDirectory, host: &str) -> Result<bool> {
    Ok(directory
        .send_data_to_email_marketing(host)
        .await?
        .unwrap_or(true))
}

#[derive(Clone)]
pub struct Enricher {
    geo: Arc<dyn GeoLookup>,
    credit: Arc<dyn CreditRatingProvider>,
    email: Arc<dyn EmailMarketing>,
    default_credit_rating: i64,
    email_list_id: Option<String>,
}

impl Enricher {
    pub fn new(
        geo: Arc<dyn GeoLookup>,
        credit: Arc<dyn CreditRatingProvider>,
        email: Arc<dyn EmailMarketing>,
        settings: &FlowSettings,
    ) -> Self {
        Self {
            geo,
            credit,
            email,
            default_credit_rating: settings.default_credit_rating,
            email_list_id: settings.email_list_id.clone(),
        }
    }

    pub fn without_providers(settings: &FlowSettings) -> Self {
        let none = Arc::new(NoProviders);
        Self::new(none.clone(), none.clone(), none, settings)
    }

    /// Fill in metadata derived from the answers just submitted for `step`
    /// and drop answers that must never be stored.
    pub async fn add_missing_fields(
        &self,
        store: &mut FlowSessionStore,
        flow: &Flow,
        step: &Step,
    ) -> Result<()> {
        if step.has_field("zip") {
            if let Some(zip) = store.answers().get("zip").and_then(scalar_text) {
                if let Some(county) = self.geo.county_for_zip(&zip).await? {
                    store
                        .metadata_mut()
                        .insert("county".to_string(), Value::String(county));
                }
            }
        }

        self.fill_destination_zip(store).await?;

        if step.has_field("ssn") {
            self.rate_credit(store).await?;
        }

        let answers = store.answers_mut();
        for key in BIRTH_DATE_KEYS {
            answers.shift_remove(key);
        }

        if step.has_field("email") && flow.subscribe_email && store.answers().contains_key("email") {
            let mut payload = store.answers().clone();
            payload.insert("category_id".to_string(), flow.category_id.into());
            if let Some(list_id) = &self.email_list_id {
                payload.insert("list_id".to_string(), Value::String(list_id.clone()));
            }
            self.email.subscribe(&payload).await?;
            info!(flow_id = flow.id, step = step.order, "Subscribed visitor to email marketing");
        }

        Ok(())
    }

    async fn fill_destination_zip(&self, store: &mut FlowSessionStore) -> Result<()> {
        let metadata = store.metadata();
        if metadata.contains_key("to_zip") {
            return Ok(());
        }
        let (Some(city), Some(state)) = (
            metadata.get("to_city").and_then(scalar_text),
            metadata.get("to_state").and_then(scalar_text),
        ) else {
            return Ok(());
        };

        if let Some(zip) = self.geo.zip_for_city(&city, &state).await? {
            store
                .metadata_mut()
                .insert("to_zip".to_string(), Value::String(zip));
        }
        Ok(())
    }

    async fn rate_credit(&self, store: &mut FlowSessionStore) -> Result<()> {
        let answers = store.answers();
        let ssn = answers.get("ssn").and_then(scalar_text).unwrap_or_default();

        let mut request = Map::new();
        let sources = [
            ("ssn", &["ssn"][..]),
            ("first_name", &["first_name"][..]),
            ("last_name", &["last_name"][..]),
            ("street", &["address"][..]),
            ("state", &["state", "address_autocomplete_state_name"][..]),
            ("zip_code", &["zip"][..]),
        ];
        for (target, keys) in sources {
            if let Some(value) = keys
                .iter()
                .find_map(|key| answers.get(*key).filter(|v| !v.is_null()))
            {
                request.insert(target.to_string(), value.clone());
            }
        }

        let rating = self.credit.credit_rating(&request).await?;
        let digits = ssn.chars().filter(char::is_ascii_digit).count();

        let metadata = store.metadata_mut();
        match rating {
            Some(rating) => {
                metadata.insert("credit_rating".to_string(), rating.into());
                metadata.insert("using_default_rating".to_string(), false.into());
                metadata.insert(
                    "using_partial_ssn".to_string(),
                    (digits < FULL_SSN_DIGITS).into(),
                );
            }
            None => {
                debug!("No credit rating found, using default");
                metadata.insert("credit_rating".to_string(), self.default_credit_rating.into());
                metadata.insert("using_default_rating".to_string(), true.into());
                metadata.insert("using_partial_ssn".to_string(), false.into());
            }
        }
        Ok(())
    }
}

/// Copy posted values into `answers` when they name a field of `flow` and
/// pass that field's validation. Returns how many were copied.
pub fn prepopulate_answers(
    store: &mut FlowSessionStore,
    flow: &Flow,
    posted: &Map<String, Value>,
) -> usize {
    let fields = flow.flow_fields();
    let mut copied = 0;

    for (key, value) in posted {
        if !fields.contains(key) {
            continue;
        }
        let accepted = flow
            .find_field(key)
            .is_some_and(|field| field.accepts(value));
        if accepted {
            store.answers_mut().insert(key.clone(), value.clone());
            copied += 1;
        }
    }

    debug!(flow_id = flow.id, copied, "Prepopulated answers");
    copied
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
