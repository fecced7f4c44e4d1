use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FlowError, Result};

/// Public address a flow is served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub path: String,
}

/// Binding of a flow to an endpoint and the brands eligible for its leads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub id: i64,
    pub flow_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<i64>,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub brand_ids: Vec<i64>,
}

impl FlowConfig {
    /// Canonical `https://<host>/<path>` address of the endpoint.
    pub fn external_url(&self) -> Result<Url> {
        let path = self.endpoint.path.trim_start_matches('/');
        let raw = format!("https://{}/{}", self.endpoint.host, path);
        Url::parse(&raw).map_err(|e| FlowError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// Resume link pointing back at this config's endpoint.
    pub fn continue_link(&self, unique_id: &str) -> Result<String> {
        let mut url = self.external_url()?;
        url.query_pairs_mut().append_pair("continue", unique_id);
        Ok(url.to_string())
    }
}
