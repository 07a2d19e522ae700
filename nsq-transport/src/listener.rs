//! Worker failure listeners
//!
//! The host bus dispatches a [`MessageFailedEvent`] whenever handling an
//! envelope fails. Listeners run in priority order, highest first. The retry
//! policy decides `will_retry`; [`AckUnrecoverableMessageListener`] runs last
//! and finishes messages the bus has given up on, otherwise nsqd would keep
//! redelivering them after every message timeout.

use crate::ack::Acknowledger;
use crate::envelope::Envelope;
use crate::stamp::NsqReceivedStamp;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Handling of an envelope failed
#[derive(Debug)]
pub struct MessageFailedEvent {
    envelope: Envelope,
    error: String,
    will_retry: bool,
}

impl MessageFailedEvent {
    /// Create event; nothing is retried until a listener says so
    pub fn new(envelope: Envelope, error: impl Into<String>) -> Self {
        Self {
            envelope,
            error: error.into(),
            will_retry: false,
        }
    }

    /// Failed envelope
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Failure description
    pub fn error(&self) -> &str {
        &self.error
    }

    /// Whether the bus will redeliver the envelope
    pub fn will_retry(&self) -> bool {
        self.will_retry
    }

    /// Mark the envelope for redelivery
    pub fn set_for_retry(&mut self) {
        self.will_retry = true;
    }

    /// Take the envelope back
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Reacts to failed envelopes
pub trait FailureListener: Send + Sync {
    /// Higher runs earlier
    fn priority(&self) -> i32 {
        0
    }

    /// Handle the event
    fn on_message_failed(&self, event: &mut MessageFailedEvent) -> Result<()>;
}

/// Ordered set of failure listeners
#[derive(Default, Clone)]
pub struct FailureDispatcher {
    listeners: Vec<Arc<dyn FailureListener>>,
}

impl FailureDispatcher {
    /// Empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; equal priorities keep registration order
    pub fn subscribe(&mut self, listener: Arc<dyn FailureListener>) {
        self.listeners.push(listener);
        self.listeners.sort_by_key(|l| std::cmp::Reverse(l.priority()));
    }

    /// Run every listener in order, stopping at the first error
    pub fn dispatch(&self, event: &mut MessageFailedEvent) -> Result<()> {
        for listener in &self.listeners {
            listener.on_message_failed(event)?;
        }
        Ok(())
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Finishes NSQ messages whose failure will not be retried
#[derive(Clone)]
pub struct AckUnrecoverableMessageListener {
    acknowledger: Acknowledger,
}

impl AckUnrecoverableMessageListener {
    /// Runs after every other listener
    pub const PRIORITY: i32 = i32::MIN;

    /// Create listener
    pub fn new(acknowledger: Acknowledger) -> Self {
        Self { acknowledger }
    }
}

impl FailureListener for AckUnrecoverableMessageListener {
    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn on_message_failed(&self, event: &mut MessageFailedEvent) -> Result<()> {
        if event.will_retry() {
            return Ok(());
        }

        let stamp = NsqReceivedStamp::from_envelope(event.envelope())?;
        if self.acknowledger.finish(stamp, "abandoned")? {
            info!(
                "Finished abandoned message {} after {} attempts: {}",
                stamp.message().id(),
                stamp.message().attempts(),
                event.error()
            );
        } else {
            debug!("Abandoned message {} was already finished", stamp.message().id());
        }
        Ok(())
    }
}
