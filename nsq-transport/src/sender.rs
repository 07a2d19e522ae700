//! Outgoing envelopes
//!
//! A fresh envelope becomes PUB, or DPUB when it carries a [`DelayStamp`].
//! An envelope that was received from NSQ and is being sent again for retry
//! becomes REQ on the original message, which keeps nsqd's attempt counter
//! and avoids a duplicate logical message.

use crate::broker::{BrokerClient, Producer};
use crate::envelope::{DelayStamp, Envelope};
use crate::metrics::{self, SEND_DURATION};
use crate::rendezvous::Rendezvous;
use crate::serializer::{to_wire, Serializer};
use crate::stamp::NsqReceivedStamp;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Publishes envelopes to one topic
pub struct NsqSender {
    address: String,
    topic: String,
    broker: Arc<dyn BrokerClient>,
    serializer: Arc<dyn Serializer>,
    rendezvous: Rendezvous,
    producer: Option<Box<dyn Producer>>,
}

impl NsqSender {
    /// Create sender; the connection is opened on first send
    pub fn new(
        address: impl Into<String>,
        topic: impl Into<String>,
        broker: Arc<dyn BrokerClient>,
        serializer: Arc<dyn Serializer>,
        rendezvous: Rendezvous,
    ) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
            broker,
            serializer,
            rendezvous,
            producer: None,
        }
    }

    /// Topic this sender publishes to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Send an envelope, returning it unchanged
    pub fn send(&mut self, envelope: Envelope) -> Result<Envelope> {
        let start = Instant::now();
        let delay = envelope.last::<DelayStamp>().map(DelayStamp::delay);

        let result = match envelope.last::<NsqReceivedStamp>() {
            Some(stamp) => self.requeue(stamp, delay.unwrap_or_default()),
            None => self.publish(&envelope, delay),
        };

        SEND_DURATION
            .with_label_values(&[&self.topic])
            .observe(start.elapsed().as_secs_f64());

        result.map(|_| envelope)
    }

    fn requeue(&self, stamp: &NsqReceivedStamp, delay: std::time::Duration) -> Result<()> {
        let message = stamp.message();
        if message.is_processed() {
            debug!(
                "Message {} already processed, not requeueing stale redelivery",
                message.id()
            );
            metrics::record(stamp.topic(), "skipped");
            return Ok(());
        }

        self.rendezvous.wait("REQ", message.requeue(delay))?;
        debug!(
            "Requeued message {} (attempt {}) with delay {:?}",
            message.id(),
            message.attempts(),
            delay
        );
        metrics::record(stamp.topic(), "requeued");
        Ok(())
    }

    fn publish(&mut self, envelope: &Envelope, delay: Option<std::time::Duration>) -> Result<()> {
        let encoded = self
            .serializer
            .encode(&envelope.without_all::<NsqReceivedStamp>())?;
        let body = to_wire(&encoded)?;

        let rendezvous = self.rendezvous.clone();
        let topic = self.topic.clone();
        let result = rendezvous.wait("PUB", async {
            let producer = self.producer().await?;
            match delay {
                Some(delay) => producer.publish_deferred(&topic, body, delay).await,
                None => producer.publish(&topic, body).await,
            }
        });

        if let Err(e) = &result {
            warn!("Publish to {} failed, dropping connection: {}", topic, e);
            self.producer = None;
            return result;
        }

        let outcome = if delay.is_some() { "deferred" } else { "published" };
        debug!("Message {} to {}", outcome, topic);
        metrics::record(&topic, outcome);
        Ok(())
    }

    async fn producer(&mut self) -> Result<&mut Box<dyn Producer>> {
        if self.producer.is_none() {
            let producer = self.broker.connect_producer(&self.address).await?;
            info!("✅ Producer connected to {}", self.address);
            self.producer = Some(producer);
        }

        self.producer
            .as_mut()
            .ok_or_else(|| Error::TransportUnavailable("producer not connected".to_string()))
    }
}
