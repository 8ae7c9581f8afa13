//! Polite Buffered Consumer - batches messages and sends them on flush.
//!
//! Messages are buffered per [`Endpoint`] and only leave the process when
//! [`Consumer::flush`] is called, normally once at the end of a request.
//! Mixpanel endpoints receive form-encoded batches of up to
//! [`MAX_BATCH_SIZE`] messages; mirrored customer.io calls go through the
//! configured [`SecondarySink`] one by one.
//!
//! Delivery failures never escape `flush`. They are logged as a single
//! `"It seems like Mixpanel is down."` error and the failed messages are
//! dropped, so an analytics outage cannot break the request that produced
//! them.

use super::{Consumer, ConsumerContext, ConsumerKind, DeliveryError, Endpoint, Message};
use crate::customerio::{SecondaryCall, SecondarySink};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Mixpanel accepts at most this many messages per request
pub const MAX_BATCH_SIZE: usize = 50;

/// Default timeout for Mixpanel requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A consumer that buffers messages and never raises on delivery.
pub struct PoliteBufferedConsumer {
    /// Mixpanel API base URL
    api_host: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    customerio: Option<Arc<dyn SecondarySink>>,

    buffers: HashMap<Endpoint, Vec<Map<String, Value>>>,

    max_batch_size: usize,

    timeout: Duration,
}

impl PoliteBufferedConsumer {
    pub fn new(api_host: impl Into<String>) -> Self {
        Self {
            api_host: api_host.into(),
            client: Client::new(),
            customerio: None,
            buffers: HashMap::new(),
            max_batch_size: MAX_BATCH_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build from a factory context.
    pub fn from_context(ctx: &ConsumerContext) -> Self {
        let consumer = Self::new(&ctx.api_host).with_client(ctx.http.clone());
        match &ctx.customerio {
            Some(sink) => consumer.with_secondary(sink.clone()),
            None => consumer,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Deliver [`Endpoint::CustomerIo`] messages through this sink.
    pub fn with_secondary(mut self, sink: Arc<dyn SecondarySink>) -> Self {
        self.customerio = Some(sink);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of messages waiting for `endpoint`.
    pub fn buffered(&self, endpoint: Endpoint) -> usize {
        self.buffers.get(&endpoint).map_or(0, Vec::len)
    }

    /// POST one batch to `<api_host>/<track|engage>`.
    async fn send_batch(
        &self,
        endpoint: Endpoint,
        path: &str,
        batch: &[Map<String, Value>],
    ) -> Result<(), DeliveryError> {
        let url = format!("{}/{}", self.api_host.trim_end_matches('/'), path);
        let data = serde_json::to_string(batch)?;

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .form(&[("data", data.as_str()), ("verbose", "1"), ("ip", "0")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        // verbose=1 makes Mixpanel answer {"status": 1|0, "error": ...}
        let body: Value = response.json().await?;
        if body.get("status").and_then(Value::as_i64) != Some(1) {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(DeliveryError::Rejected {
                endpoint,
                error: reason,
            });
        }

        debug!(
            endpoint = %endpoint,
            messages = batch.len(),
            "Mixpanel batch delivered"
        );
        Ok(())
    }

    async fn send_mixpanel(
        &self,
        endpoint: Endpoint,
        payloads: Vec<Map<String, Value>>,
        failures: &mut Vec<DeliveryError>,
    ) {
        let Some(path) = endpoint.mixpanel_path() else {
            return;
        };

        for batch in payloads.chunks(self.max_batch_size) {
            if let Err(e) = self.send_batch(endpoint, path, batch).await {
                // Remaining batches for this endpoint would most likely fail too
                failures.push(e);
                return;
            }
        }
    }

    async fn send_secondary(
        &self,
        payloads: Vec<Map<String, Value>>,
        failures: &mut Vec<DeliveryError>,
    ) {
        let Some(sink) = &self.customerio else {
            if !payloads.is_empty() {
                failures.push(DeliveryError::Malformed(format!(
                    "{} customer.io message(s) but no customer.io client configured",
                    payloads.len()
                )));
            }
            return;
        };

        for payload in &payloads {
            let result = match SecondaryCall::from_payload(payload) {
                Ok(call) => sink.deliver(&call).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                failures.push(e);
            }
        }
    }
}

#[async_trait]
impl Consumer for PoliteBufferedConsumer {
    fn name(&self) -> &str {
        "PoliteBufferedConsumer"
    }

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Buffered
    }

    fn send(&mut self, message: Message) {
        self.buffers
            .entry(message.endpoint)
            .or_default()
            .push(message.payload);
    }

    async fn flush(&mut self) {
        // Take everything up front so a failed flush leaves nothing behind
        let mut buffers = std::mem::take(&mut self.buffers);
        let mut failures = Vec::new();

        if let Some(payloads) = buffers.remove(&Endpoint::CustomerIo) {
            self.send_secondary(payloads, &mut failures).await;
        }
        for endpoint in [Endpoint::Events, Endpoint::People] {
            if let Some(payloads) = buffers.remove(&endpoint) {
                self.send_mixpanel(endpoint, payloads, &mut failures).await;
            }
        }

        if let Some(first) = failures.first() {
            error!(
                error = %first,
                failures = failures.len(),
                "It seems like Mixpanel is down."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customerio::{CustomerIo, Region};
    use crate::test_support::capture_logs;
    use serde_json::json;
    use tracing::Level;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(endpoint: Endpoint, payload: Value) -> Message {
        Message::new(endpoint, payload.as_object().cloned().unwrap())
    }

    fn event(name: &str) -> Message {
        message(
            Endpoint::Events,
            json!({"event": name, "properties": {"distinct_id": "foo"}}),
        )
    }

    async fn mount_ok(server: &MockServer, route: &str, expected_requests: u64) {
        Mock::given(method("POST"))
            .and(path(route))
            .and(body_string_contains("verbose=1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "error": null})),
            )
            .expect(expected_requests)
            .mount(server)
            .await;
    }

    #[test]
    fn test_send_buffers_per_endpoint() {
        let mut consumer = PoliteBufferedConsumer::new("https://api.mixpanel.com");

        consumer.send(event("Page Viewed"));
        consumer.send(event("User Logged In"));
        consumer.send(message(Endpoint::People, json!({"$set": {}})));

        assert_eq!(consumer.buffered(Endpoint::Events), 2);
        assert_eq!(consumer.buffered(Endpoint::People), 1);
        assert_eq!(consumer.buffered(Endpoint::CustomerIo), 0);
        assert_eq!(consumer.kind(), ConsumerKind::Buffered);
    }

    #[tokio::test]
    async fn test_flush_sends_events_and_people() {
        let server = MockServer::start().await;
        mount_ok(&server, "/track", 1).await;
        mount_ok(&server, "/engage", 1).await;

        let mut consumer = PoliteBufferedConsumer::new(server.uri());
        consumer.send(event("Page Viewed"));
        consumer.send(message(
            Endpoint::People,
            json!({"$distinct_id": "foo", "$set": {"$name": "Bob"}}),
        ));

        let (logs, _guard) = capture_logs();
        consumer.flush().await;

        assert_eq!(consumer.buffered(Endpoint::Events), 0);
        assert_eq!(consumer.buffered(Endpoint::People), 0);
        assert!(logs.at_level(Level::ERROR).is_empty());
    }

    #[tokio::test]
    async fn test_flush_batches_large_buffers() {
        let server = MockServer::start().await;
        mount_ok(&server, "/track", 2).await;

        let mut consumer = PoliteBufferedConsumer::new(server.uri());
        for i in 0..60 {
            consumer.send(event(&format!("Event {}", i)));
        }

        consumer.flush().await;
        // MockServer verifies the two expected requests on drop
    }

    #[tokio::test]
    async fn test_flush_honours_max_batch_size() {
        let server = MockServer::start().await;
        mount_ok(&server, "/track", 3).await;

        let mut consumer = PoliteBufferedConsumer::new(server.uri()).with_max_batch_size(2);
        for i in 0..5 {
            consumer.send(event(&format!("Event {}", i)));
        }
        consumer.flush().await;

        let sizes: Vec<usize> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                let body = String::from_utf8_lossy(&r.body).into_owned();
                let url = reqwest::Url::parse(&format!("http://form/?{}", body)).unwrap();
                let data = url
                    .query_pairs()
                    .find(|(k, _)| k == "data")
                    .map(|(_, v)| v.into_owned())
                    .unwrap();
                serde_json::from_str::<Vec<Value>>(&data).unwrap().len()
            })
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_flush_logs_when_mixpanel_is_down() {
        let mut consumer = PoliteBufferedConsumer::new("http://127.0.0.1:1")
            .with_timeout(Duration::from_secs(2));
        consumer.send(event("Page Viewed"));
        consumer.send(message(Endpoint::People, json!({"$set": {}})));

        let (logs, _guard) = capture_logs();
        consumer.flush().await;

        let errors = logs.at_level(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "It seems like Mixpanel is down.");
        assert_eq!(errors[0].fields.get("failures").map(String::as_str), Some("2"));
        assert!(errors[0].target.starts_with("mixtrack"));

        // Failed messages are dropped, not retried on the next flush
        assert_eq!(consumer.buffered(Endpoint::Events), 0);
        assert_eq!(consumer.buffered(Endpoint::People), 0);
    }

    #[tokio::test]
    async fn test_flush_logs_rejected_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/track"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "error": "token missing"})),
            )
            .mount(&server)
            .await;

        let mut consumer = PoliteBufferedConsumer::new(server.uri());
        consumer.send(event("Page Viewed"));

        let (logs, _guard) = capture_logs();
        consumer.flush().await;

        let errors = logs.at_level(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .fields
            .get("error")
            .is_some_and(|e| e.contains("token missing")));
    }

    #[tokio::test]
    async fn test_flush_delivers_customerio_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/customers/foo/events"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let cio = CustomerIo::new("site", "key", Region::Eu).with_base_url(server.uri());
        let mut consumer =
            PoliteBufferedConsumer::new(server.uri()).with_secondary(Arc::new(cio));

        consumer.send(
            SecondaryCall::Track {
                customer_id: "foo".into(),
                name: "Page Viewed".into(),
                data: Map::new(),
            }
            .into_message(),
        );

        let (logs, _guard) = capture_logs();
        consumer.flush().await;

        assert!(logs.at_level(Level::ERROR).is_empty());
    }

    #[tokio::test]
    async fn test_flush_with_nothing_buffered() {
        let mut consumer = PoliteBufferedConsumer::new("http://127.0.0.1:1");

        let (logs, _guard) = capture_logs();
        consumer.flush().await;

        assert!(logs.at_level(Level::ERROR).is_empty());
    }
}
