//! Consumers deliver shaped messages to Mixpanel (and customer.io).
//!
//! [`Track`](crate::Track) validates and shapes every message, then hands it
//! to a [`Consumer`]. Consumers never validate anything; they record, queue
//! or transmit what they are given.
//!
//! ## Built-in Consumers
//!
//! - [`MockedConsumer`]: records messages in memory, for tests and for
//!   deployments without a Mixpanel token
//! - [`PoliteBufferedConsumer`]: buffers per endpoint and transmits on
//!   [`Consumer::flush`], logging (never raising) delivery failures
//! - [`QueuedConsumer`]: forwards messages to an application task queue
//!
//! ## Creating Custom Consumers
//!
//! ```rust,ignore
//! use mixtrack::consumer::{Consumer, ConsumerKind, Message};
//! use async_trait::async_trait;
//!
//! struct StdoutConsumer;
//!
//! #[async_trait]
//! impl Consumer for StdoutConsumer {
//!     fn name(&self) -> &str {
//!         "StdoutConsumer"
//!     }
//!
//!     fn kind(&self) -> ConsumerKind {
//!         ConsumerKind::Buffered
//!     }
//!
//!     fn send(&mut self, message: Message) {
//!         println!("{} {}", message.endpoint, serde_json::Value::Object(message.payload));
//!     }
//!
//!     async fn flush(&mut self) {}
//! }
//! ```

pub mod buffered;
pub mod mocked;
pub mod queued;

use crate::customerio::SecondarySink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use buffered::PoliteBufferedConsumer;
pub use mocked::{MockedConsumer, Recording};
pub use queued::QueuedConsumer;

/// Errors that can occur while transmitting messages.
///
/// These never escape [`Consumer::flush`]; they are logged there.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Network-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote API answered with a non-success status
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    /// Mixpanel accepted the request but rejected its content
    #[error("Mixpanel rejected {endpoint} batch: {error}")]
    Rejected { endpoint: Endpoint, error: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A buffered message does not have the expected shape
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Destination category of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// Mixpanel event stream (`/track`)
    #[serde(rename = "events")]
    Events,

    /// Mixpanel profile writes (`/engage`)
    #[serde(rename = "people")]
    People,

    /// Mirrored customer.io calls
    #[serde(rename = "customer.io")]
    CustomerIo,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::People => "people",
            Self::CustomerIo => "customer.io",
        }
    }

    /// Path below the Mixpanel API host, if this endpoint goes to Mixpanel.
    pub fn mixpanel_path(&self) -> Option<&'static str> {
        match self {
            Self::Events => Some("track"),
            Self::People => Some("engage"),
            Self::CustomerIo => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shaped message: destination plus payload using display names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub endpoint: Endpoint,
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(endpoint: Endpoint, payload: Map<String, Value>) -> Self {
        Self { endpoint, payload }
    }
}

/// How a consumer delivers, which decides whether it needs a flush at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Holds messages until [`Consumer::flush`]
    Buffered,

    /// In-memory recorder, nothing leaves the process
    Mocked,

    /// Hands messages to an external task queue immediately
    Queued,
}

impl ConsumerKind {
    /// Whether request teardown has to call [`Consumer::flush`].
    pub fn requires_flush(&self) -> bool {
        !matches!(self, Self::Queued)
    }
}

/// The core Consumer trait.
///
/// A consumer is owned by exactly one [`Track`](crate::Track), so `send`
/// takes `&mut self` and needs no internal locking.
#[async_trait]
pub trait Consumer: Send {
    /// Returns the name of this consumer (e.g. "PoliteBufferedConsumer")
    fn name(&self) -> &str;

    fn kind(&self) -> ConsumerKind;

    /// Accept one message for delivery.
    fn send(&mut self, message: Message);

    /// Deliver everything accepted since the last flush.
    ///
    /// Must not fail: delivery problems are logged and the messages dropped.
    async fn flush(&mut self);

    /// Handle to recorded messages, for consumers that record them.
    fn recording(&self) -> Option<Recording> {
        None
    }
}

/// Process-wide transports shared by every per-request consumer.
#[derive(Debug, Clone, Default)]
pub struct Transports {
    /// Pooled HTTP client
    pub http: reqwest::Client,

    /// Sending half of the application's background task queue
    pub queue: Option<mpsc::UnboundedSender<Message>>,
}

/// Everything a consumer factory may need to build a consumer.
#[derive(Clone)]
pub struct ConsumerContext {
    /// Mixpanel project token (`"testing"` in testing mode)
    pub token: String,

    /// Mixpanel API base URL
    pub api_host: String,

    pub http: reqwest::Client,

    /// customer.io client, if mirroring is configured
    pub customerio: Option<Arc<dyn SecondarySink>>,

    pub queue: Option<mpsc::UnboundedSender<Message>>,

    /// Make [`MockedConsumer`] drop token, time, insert id and library fields
    pub strip_bookkeeping: bool,
}

impl fmt::Debug for ConsumerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerContext")
            .field("api_host", &self.api_host)
            .field("customerio", &self.customerio.is_some())
            .field("queue", &self.queue.is_some())
            .field("strip_bookkeeping", &self.strip_bookkeeping)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> ConsumerContext {
    ConsumerContext {
        token: crate::TESTING_TOKEN.to_string(),
        api_host: crate::config::DEFAULT_API_HOST.to_string(),
        http: reqwest::Client::new(),
        customerio: None,
        queue: None,
        strip_bookkeeping: false,
    }
}
