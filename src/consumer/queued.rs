//! Queued Consumer - hands messages to an application task queue.
//!
//! Instead of talking to Mixpanel during the request, every message is
//! pushed onto the sending half of a channel owned by the application
//! ([`Transports::queue`](super::Transports::queue)). A background task
//! drains the channel and delivers the messages, usually through a
//! [`PoliteBufferedConsumer`](super::PoliteBufferedConsumer).
//!
//! Queued consumers report [`ConsumerKind::Queued`], so request teardown
//! skips their flush.

use super::{Consumer, ConsumerContext, ConsumerKind, Message};
use crate::config::ConfigError;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

/// A consumer that enqueues messages for out-of-request delivery.
#[derive(Debug, Clone)]
pub struct QueuedConsumer {
    queue: UnboundedSender<Message>,
}

impl QueuedConsumer {
    pub fn new(queue: UnboundedSender<Message>) -> Self {
        Self { queue }
    }

    /// Build from a factory context; fails when no queue was provided.
    pub fn from_context(ctx: &ConsumerContext) -> Result<Self, ConfigError> {
        ctx.queue.clone().map(Self::new).ok_or_else(|| {
            ConfigError::ValidationError(
                "QueuedConsumer needs a task queue, none was configured".to_string(),
            )
        })
    }
}

#[async_trait]
impl Consumer for QueuedConsumer {
    fn name(&self) -> &str {
        "QueuedConsumer"
    }

    fn kind(&self) -> ConsumerKind {
        ConsumerKind::Queued
    }

    fn send(&mut self, message: Message) {
        let endpoint = message.endpoint;
        match self.queue.send(message) {
            Ok(()) => debug!(endpoint = %endpoint, "Message queued"),
            Err(_) => error!(endpoint = %endpoint, "Task queue is closed, message dropped"),
        }
    }

    async fn flush(&mut self) {}
}
