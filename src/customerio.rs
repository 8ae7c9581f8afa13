//! customer.io mirroring - the optional secondary sink.
//!
//! When all three `[customerio]` credentials are configured,
//! [`Track::track`](crate::Track::track) and
//! [`Track::profile_set`](crate::Track::profile_set) mirror their calls to
//! customer.io's track API. Field names lose Mixpanel's `$` marker on the
//! way (`$email` becomes `email`).
//!
//! Mirrored calls travel through the consumer like every other message, as
//! [`SecondaryCall`] envelopes on [`Endpoint::CustomerIo`], and are delivered
//! through a [`SecondarySink`] on flush.
//!
//! # Example
//!
//! ```rust,ignore
//! use mixtrack::customerio::{CustomerIo, Region};
//!
//! let cio = CustomerIo::new("site-id", "api-key", Region::Eu)
//!     .with_timeout(Duration::from_secs(5));
//! ```

use crate::config::{ConfigError, CustomerIoConfig};
use crate::consumer::{DeliveryError, Endpoint, Message};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Default timeout for customer.io requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// customer.io data center a workspace lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu,
    Us,
}

impl Region {
    /// Base URL of the track API for this region.
    pub fn track_url(&self) -> &'static str {
        match self {
            Self::Eu => "https://track-eu.customer.io",
            Self::Us => "https://track.customer.io",
        }
    }
}

impl FromStr for Region {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eu" => Ok(Self::Eu),
            "us" => Ok(Self::Us),
            other => Err(ConfigError::UnknownRegion(other.to_string())),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eu => f.write_str("eu"),
            Self::Us => f.write_str("us"),
        }
    }
}

/// A mirrored call, as carried in a [`Message`] payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SecondaryCall {
    /// Create or update a customer with flat attributes.
    Identify {
        id: String,
        attributes: Map<String, Value>,
    },

    /// Record an event for a customer.
    Track {
        customer_id: String,
        name: String,
        data: Map<String, Value>,
    },
}

impl SecondaryCall {
    /// Wrap this call into a consumer message.
    pub fn into_message(self) -> Message {
        let payload = match self {
            Self::Identify { id, attributes } => json!({
                "id": id,
                "attributes": attributes,
            }),
            Self::Track {
                customer_id,
                name,
                data,
            } => json!({
                "customer_id": customer_id,
                "name": name,
                "data": data,
            }),
        };

        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Message::new(Endpoint::CustomerIo, payload)
    }

    /// Parse a payload produced by [`SecondaryCall::into_message`].
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self, DeliveryError> {
        let object = |key: &str| match payload.get(key) {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Err(DeliveryError::Malformed(format!(
                "customer.io message without '{}' object",
                key
            ))),
        };
        let string = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        if let Some(customer_id) = string("customer_id") {
            let name = string("name").ok_or_else(|| {
                DeliveryError::Malformed("customer.io track without 'name'".into())
            })?;
            return Ok(Self::Track {
                customer_id,
                name,
                data: object("data")?,
            });
        }

        if let Some(id) = string("id") {
            return Ok(Self::Identify {
                id,
                attributes: object("attributes")?,
            });
        }

        Err(DeliveryError::Malformed(
            "customer.io message is neither identify nor track".into(),
        ))
    }
}

/// The secondary sink capability.
#[async_trait]
pub trait SecondarySink: Send + Sync {
    /// Returns the name of this sink (e.g. "customer.io")
    fn name(&self) -> &str;

    /// Create or update a customer.
    async fn identify(
        &self,
        id: &str,
        attributes: &Map<String, Value>,
    ) -> Result<(), DeliveryError>;

    /// Record an event for a customer.
    async fn track(
        &self,
        customer_id: &str,
        name: &str,
        data: &Map<String, Value>,
    ) -> Result<(), DeliveryError>;

    /// Deliver a mirrored call.
    async fn deliver(&self, call: &SecondaryCall) -> Result<(), DeliveryError> {
        match call {
            SecondaryCall::Identify { id, attributes } => self.identify(id, attributes).await,
            SecondaryCall::Track {
                customer_id,
                name,
                data,
            } => self.track(customer_id, name, data).await,
        }
    }
}

/// HTTP client for customer.io's track API.
#[derive(Debug, Clone)]
pub struct CustomerIo {
    site_id: String,
    api_key: String,
    base_url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    timeout: Duration,
}

impl CustomerIo {
    pub fn new(site_id: impl Into<String>, api_key: impl Into<String>, region: Region) -> Self {
        Self {
            site_id: site_id.into(),
            api_key: api_key.into(),
            base_url: region.track_url().to_string(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build from configuration.
    ///
    /// Returns `Ok(None)` unless site id, API key and region are all set.
    pub fn from_config(
        config: &CustomerIoConfig,
        client: Client,
    ) -> Result<Option<Self>, ConfigError> {
        let Some((site_id, api_key, region)) = config.credentials() else {
            return Ok(None);
        };

        let mut cio = Self::new(site_id, api_key, region.parse()?).with_client(client);
        if let Some(url) = &config.url {
            cio = cio.with_base_url(url);
        }
        Ok(Some(cio))
    }

    /// Talk to a different host, e.g. a mock server.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Share an existing HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `<base>/api/v1/customers/<id>[/<suffix>]`, with `id` percent-encoded.
    fn customer_url(&self, id: &str, suffix: Option<&str>) -> Result<Url, DeliveryError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| DeliveryError::Malformed(format!("invalid customer.io URL: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| DeliveryError::Malformed("customer.io URL cannot be a base".into()))?;
            segments.pop_if_empty().extend(["api", "v1", "customers", id]);
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        Ok(url)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<(), DeliveryError> {
        let response = request
            .basic_auth(&self.site_id, Some(&self.api_key))
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        debug!(url = %url, status = %status, "customer.io call delivered");
        Ok(())
    }
}

#[async_trait]
impl SecondarySink for CustomerIo {
    fn name(&self) -> &str {
        "customer.io"
    }

    async fn identify(
        &self,
        id: &str,
        attributes: &Map<String, Value>,
    ) -> Result<(), DeliveryError> {
        let url = self.customer_url(id, None)?;
        let request = self.client.put(url.clone()).json(attributes);
        self.execute(request, &url).await
    }

    async fn track(
        &self,
        customer_id: &str,
        name: &str,
        data: &Map<String, Value>,
    ) -> Result<(), DeliveryError> {
        let url = self.customer_url(customer_id, Some("events"))?;
        let request = self
            .client
            .post(url.clone())
            .json(&json!({"name": name, "data": data}));
        self.execute(request, &url).await
    }
}
