use std::str::FromStr;

use crate::error::{FlowError, Result};

pub const DEFAULT_MATCH_LINK_TTL_DAYS: i64 = 30;
pub const DEFAULT_ABANDON_LINK_TTL_DAYS: i64 = 30;
pub const DEFAULT_CREDIT_RATING: i64 = 2;

/// Runtime settings for the flow engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSettings {
    pub match_link_ttl_days: i64,
    pub abandon_link_ttl_days: i64,
    /// Rating recorded when the credit lookup finds nothing.
    pub default_credit_rating: i64,
    pub email_list_id: Option<String>,
    /// Base URL of the lead distribution service.
    pub leads_api_url: Option<String>,
    pub database_url: Option<String>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            match_link_ttl_days: DEFAULT_MATCH_LINK_TTL_DAYS,
            abandon_link_ttl_days: DEFAULT_ABANDON_LINK_TTL_DAYS,
            default_credit_rating: DEFAULT_CREDIT_RATING,
            email_list_id: None,
            leads_api_url: None,
            database_url: None,
        }
    }
}

impl FlowSettings {
    /// Load settings from the environment, reading `.env` first when present.
    ///
    /// | Env Var                           | Default |
    /// |-----------------------------------|---------|
    /// | `LEAD_FLOW_MATCH_LINK_TTL_DAYS`   | `30`    |
    /// | `LEAD_FLOW_ABANDON_LINK_TTL_DAYS` | `30`    |
    /// | `LEAD_FLOW_DEFAULT_CREDIT_RATING` | `2`     |
    /// | `LEAD_FLOW_EMAIL_LIST_ID`         | unset   |
    /// | `LEADS_API_URL`                   | unset   |
    /// | `DATABASE_URL`                    | unset   |
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Ok(Self {
            match_link_ttl_days: parse_or(
                "LEAD_FLOW_MATCH_LINK_TTL_DAYS",
                text("LEAD_FLOW_MATCH_LINK_TTL_DAYS"),
                defaults.match_link_ttl_days,
            )?,
            abandon_link_ttl_days: parse_or(
                "LEAD_FLOW_ABANDON_LINK_TTL_DAYS",
                text("LEAD_FLOW_ABANDON_LINK_TTL_DAYS"),
                defaults.abandon_link_ttl_days,
            )?,
            default_credit_rating: parse_or(
                "LEAD_FLOW_DEFAULT_CREDIT_RATING",
                text("LEAD_FLOW_DEFAULT_CREDIT_RATING"),
                defaults.default_credit_rating,
            )?,
            email_list_id: text("LEAD_FLOW_EMAIL_LIST_ID"),
            leads_api_url: text("LEADS_API_URL"),
            database_url: text("DATABASE_URL"),
        })
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| FlowError::Settings(format!("{key}={raw}: {e}"))),
    }
}
