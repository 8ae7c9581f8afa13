//! Mocked Consumer - records messages instead of sending them.
//!
//! Used in unit tests and whenever no Mixpanel token is configured. Every
//! [`MockedConsumer`] owns its own [`Recording`]; clone the handle returned
//! by [`MockedConsumer::recording`] to inspect messages after the consumer
//! has been moved into a [`Track`](crate::Track).
//!
//! # Example
//!
//! ```rust,ignore
//! use mixtrack::consumer::{Consumer, MockedConsumer};
//!
//! let consumer = MockedConsumer::new().with_stripped_bookkeeping();
//! let recording = consumer.recording();
//! ```

use super::{Consumer, ConsumerContext, ConsumerKind, Endpoint, Message};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Event properties the Mixpanel client adds on its own.
const EVENT_BOOKKEEPING: [&str; 5] = ["token", "time", "$insert_id", "mp_lib", "$lib_version"];

/// Top-level profile fields the Mixpanel client adds on its own.
const PEOPLE_BOOKKEEPING: [&str; 2] = ["$token", "$time"];

#[derive(Debug, Default)]
struct RecordingState {
    messages: Vec<Message>,
    flushed: bool,
}

/// Observable, ordered log of the messages a [`MockedConsumer`] received.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    state: Arc<Mutex<RecordingState>>,
}

impl Recording {
    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All recorded messages, in the order they were sent.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Recorded messages for one endpoint.
    pub fn messages_for(&self, endpoint: Endpoint) -> Vec<Message> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.endpoint == endpoint)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Whether [`Consumer::flush`] has been called.
    pub fn flushed(&self) -> bool {
        self.lock().flushed
    }

    fn push(&self, message: Message) {
        self.lock().messages.push(message);
    }

    fn mark_flushed(&self) {
        self.lock().flushed = true;
    }
}

/// A consumer that saves messages in memory.
#[derive(Debug, Default)]
pub struct MockedConsumer {
    recording: Recording,
    strip_bookkeeping: bool,
}

impl MockedConsumer {
    /// Create a consumer with a fresh, empty recording.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a factory context, honouring `strip_bookkeeping`.
    pub fn from_context(ctx: &ConsumerContext) -> Self {
        let consumer = Self::new();
        if ctx.strip_bookkeeping {
            consumer.with_stripped_bookkeeping()
        } else {
            consumer
        }
    }

    /// Drop fields the Mixpanel client fills in itself (token, time, insert
    /// id, library name and version) so assertions can focus on payloads.
    pub fn with_stripped_bookkeeping(mut self) -> Self {
        self.strip_bookkeeping = true;
        self
    }

    /// Handle to this consumer's recording.
    pub fn recording(&self) -> Recording {
        self.recording.clone()
    }
}

fn strip_bookkeeping(message: &mut Message) {
    match message.endpoint {
        Endpoint::Events => {
            if let Some(Value::Object(properties)) = message.payload.get_mut("properties") {
                for key in EVENT_BOOKKEEPING {
                    properties.remove(key);
                }
            }
        }
        Endpoint::People => {
            for key in PEOPLE_BOOKKEEPING {
                message.payload.remove(key);
            }
        }
        Endpoint::CustomerIo => {}
    }
}

#[async_trait]
impl Consumer for MockedConsumer {
    fn name(&self) -> &str {
        "MockedConsumer"
    }

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Mocked
    }

    fn send(&mut self, mut message: Message) {
        if self.strip_bookkeeping {
            strip_bookkeeping(&mut message);
        }
        debug!(endpoint = %message.endpoint, "Recording mocked message");
        self.recording.push(message);
    }

    async fn flush(&mut self) {
        debug!(recorded = self.recording.len(), "Mocked flush, nothing sent");
        self.recording.mark_flushed();
    }

    fn recording(&self) -> Option<Recording> {
        Some(self.recording.clone())
    }
}
