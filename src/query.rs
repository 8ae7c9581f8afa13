//! Read-only queries against Mixpanel's JQL API.
//!
//! Independent of [`Track`](crate::Track): no shared state, no vocabulary
//! checks. Needs `mixpanel.api_secret`.

use crate::config::{ConfigError, MixpanelConfig};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Mixpanel JQL endpoint
pub const JQL_ENDPOINT: &str = "https://mixpanel.com/api/2.0/jql";

/// Errors that can occur while querying Mixpanel.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Found more than one Profile for email '{email}': {distinct_ids:?}")]
    MultipleProfiles {
        email: String,
        distinct_ids: Vec<String>,
    },
}

/// Query Mixpanel for events and profiles.
#[derive(Debug, Clone)]
pub struct MixpanelQuery {
    api_secret: String,
    endpoint: String,
    client: Client,
}

impl MixpanelQuery {
    pub fn new(api_secret: impl Into<String>) -> Self {
        Self {
            api_secret: api_secret.into(),
            endpoint: JQL_ENDPOINT.to_string(),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &MixpanelConfig) -> Result<Self, ConfigError> {
        config
            .api_secret()
            .map(Self::new)
            .ok_or_else(|| ConfigError::MissingField("mixpanel.api_secret".to_string()))
    }

    /// Point at a different JQL endpoint, e.g. a mock server.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Run a JQL script and return its result rows.
    ///
    /// Scripts can be tried out in the JQL console of the Mixpanel project.
    pub async fn jql(&self, script: &str) -> Result<Vec<Value>, QueryError> {
        debug!(endpoint = %self.endpoint, "Running JQL query");

        let rows: Vec<Value> = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.api_secret, Some(""))
            .form(&[("script", script)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(rows)
    }

    /// The profile with the given e-mail, if there is exactly one.
    pub async fn profile_by_email(&self, email: &str) -> Result<Option<Value>, QueryError> {
        let mut profiles = self.jql(&profile_by_email_script(email)).await?;

        match profiles.len() {
            0 => Ok(None),
            1 => Ok(profiles.pop()),
            _ => Err(QueryError::MultipleProfiles {
                email: email.to_string(),
                distinct_ids: profiles
                    .iter()
                    .map(|p| match &p["distinct_id"] {
                        Value::String(id) => id.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            }),
        }
    }
}

fn profile_by_email_script(email: &str) -> String {
    // A JSON string is a valid JavaScript string literal
    let email = Value::String(email.to_string()).to_string();
    format!(
        r#"
function main() {{
  return People()
    .filter(function(profile) {{
      return profile.properties.$email == {email};
    }})
    .map(function(profile) {{
      return {{
        distinct_id: profile.distinct_id,
        email: profile.properties.$email,
      }};
    }});
}}
"#
    )
}
