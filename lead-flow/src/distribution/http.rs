//! REST client for the lead distribution service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{LeadDistributionClient, LeadSubmission, PolledLead};
use crate::error::{FlowError, Result};

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    lead_id: serde_json::Value,
}

pub struct HttpLeadsClient {
    base_url: Url,
    client: Client,
}

impl HttpLeadsClient {
    pub fn new(base_url: &str) -> Result<Self> {
        // A trailing slash keeps `join` from dropping the last path segment.
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| FlowError::InvalidUrl(format!("{base_url}: {e}")))?;

        Ok(Self {
            base_url,
            client: Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| FlowError::InvalidUrl(format!("{path}: {e}")))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        Err(FlowError::DistributionError(format!("{status}: {text}")))
    }
}

#[async_trait]
impl LeadDistributionClient for HttpLeadsClient {
    async fn submit(&self, submission: &LeadSubmission) -> Result<String> {
        let url = self.endpoint("leads/")?;
        debug!("POST {}", url);

        let response = self.client.post(url).json(submission).send().await?;
        let body: SubmitResponse = Self::check(response).await?.json().await?;

        match body.lead_id {
            serde_json::Value::String(id) => Ok(id),
            serde_json::Value::Number(id) => Ok(id.to_string()),
            other => Err(FlowError::DistributionError(format!(
                "unexpected lead id {other}"
            ))),
        }
    }

    async fn poll(&self, lead_id: &str) -> Result<PolledLead> {
        let url = self.endpoint(&format!("leads/{lead_id}/"))?;
        debug!("GET {}", url);

        let response = self.client.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn submission() -> LeadSubmission {
        let mut answers = Map::new();
        answers.insert("zip".into(), json!("12345"));
        LeadSubmission {
            ca_session_id: Some("snickerdoodle".into()),
            config_id: 1,
            flow_id: 2,
            category_id: Some(3),
            brand_ids: vec![7],
            answers,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_returns_lead_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/leads/"))
            .and(body_partial_json(json!({"ca_session_id": "snickerdoodle", "answers": {"zip": "12345"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"lead_id": 123})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpLeadsClient::new(&format!("{}/api", server.uri())).unwrap();
        assert_eq!(client.submit(&submission()).await.unwrap(), "123");
    }

    #[tokio::test]
    async fn test_poll_parses_referrals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/leads/123/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "done",
                "ca_session_id": "snickerdoodle",
                "referrals": [{"brand_id": 1, "status": "Duplicate", "billable": false, "deliveries": []}]
            })))
            .mount(&server)
            .await;

        let client = HttpLeadsClient::new(&format!("{}/api/", server.uri())).unwrap();
        let lead = client.poll("123").await.unwrap();

        assert_eq!(lead.status.as_deref(), Some("done"));
        assert_eq!(lead.referrals.len(), 1);
        assert!(super::super::is_lead_duplicate(&lead));
    }

    #[tokio::test]
    async fn test_error_status_is_distribution_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leads/9/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let client = HttpLeadsClient::new(&server.uri()).unwrap();
        let err = client.poll("9").await.unwrap_err();
        assert!(matches!(err, FlowError::DistributionError(ref msg) if msg.contains("down")));
    }
}
