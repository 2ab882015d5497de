//! Event Bridge: State Store pub/sub → [`EventSink`].
//!
//! The bridge owns its subscription. When the subscription cannot be
//! established, or the stream ends because the connection dropped, it
//! resubscribes with exponential backoff until cancelled. Events published
//! while it is disconnected are lost; viewers recover by re-reading the
//! job record.

use std::sync::Arc;

use futures::StreamExt;
use opsdeck_core::events::{JobEvent, EVENT_CHANNEL_PATTERN};
use opsdeck_store::{PubSubMessage, StateStore, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::reconnect::{next_delay, ReconnectConfig};
use crate::sink::EventSink;

/// How a forwarding session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    StreamClosed,
}

pub struct EventBridge {
    store: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,
    reconnect: ReconnectConfig,
    pattern: String,
}

impl EventBridge {
    pub fn new(store: Arc<dyn StateStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
            reconnect: ReconnectConfig::default(),
            pattern: EVENT_CHANNEL_PATTERN.to_string(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Run the bridge on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Subscribe and forward until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut delay = self.reconnect.initial_delay;
        let mut attempt = 0u32;

        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.store.psubscribe(&self.pattern) => result,
            };

            match subscribed {
                Ok(subscription) => {
                    tracing::info!(pattern = %self.pattern, "Event bridge subscribed");
                    delay = self.reconnect.initial_delay;
                    attempt = 0;

                    if self.forward(subscription, &cancel).await == SessionEnd::Cancelled {
                        break;
                    }
                    tracing::warn!("Event subscription closed, resubscribing");
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Event bridge subscribe failed",
                    );
                }
            }

            // Wait before the next attempt, respecting cancellation.
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_delay(delay, &self.reconnect);
        }

        tracing::info!("Event bridge stopped");
    }

    async fn forward(&self, mut subscription: Subscription, cancel: &CancellationToken) -> SessionEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                message = subscription.next() => match message {
                    Some(message) => self.handle(message).await,
                    None => return SessionEnd::StreamClosed,
                },
            }
        }
    }

    async fn handle(&self, message: PubSubMessage) {
        match JobEvent::from_json(&message.payload) {
            Ok(event) => self.sink.dispatch(event).await,
            Err(e) => {
                tracing::warn!(
                    channel = %message.channel,
                    error = %e,
                    "Skipping malformed event",
                );
            }
        }
    }
}
