//! Incoming envelopes
//!
//! Each poll waits up to the poll timeout for one NSQ message, decodes it and
//! returns it as an envelope carrying:
//! - [`NsqReceivedStamp`] pointing back at the NSQ message
//! - [`TransportMessageIdStamp`] with the NSQ message ID
//! - [`RedeliveryStamp`] with `attempts - 1`
//!
//! A message that cannot be decoded is finished immediately so nsqd does not
//! redeliver it forever, then reported as [`crate::Error::DecodingFailed`].

use crate::ack::Acknowledger;
use crate::broker::{BrokerClient, BrokerMessage, Consumer, Subscription};
use crate::envelope::{Envelope, RedeliveryStamp, TransportMessageIdStamp};
use crate::metrics::{self, HEARTBEAT_FAILURES_TOTAL};
use crate::rendezvous::Rendezvous;
use crate::serializer::{from_wire, Serializer};
use crate::stamp::NsqReceivedStamp;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// nsqd address
    pub address: String,

    /// Topic and channel to consume
    pub subscription: Subscription,

    /// Upper bound on a single poll
    pub poll_timeout: Duration,

    /// Keepalive interval for an idle consumer
    pub heartbeat_interval: Duration,
}

enum Wake {
    Message(Result<BrokerMessage>),
    Heartbeat,
    Timeout,
}

/// Consumes one topic/channel
pub struct NsqReceiver {
    config: ReceiverConfig,
    broker: Arc<dyn BrokerClient>,
    serializer: Arc<dyn Serializer>,
    rendezvous: Rendezvous,
    acknowledger: Acknowledger,
    consumer: Option<Box<dyn Consumer>>,
    last_heartbeat: Instant,
}

impl NsqReceiver {
    /// Create receiver; the subscription is opened on first poll
    pub fn new(
        config: ReceiverConfig,
        broker: Arc<dyn BrokerClient>,
        serializer: Arc<dyn Serializer>,
        rendezvous: Rendezvous,
    ) -> Self {
        Self {
            config,
            broker,
            serializer,
            acknowledger: Acknowledger::new(rendezvous.clone()),
            rendezvous,
            consumer: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Subscription this receiver consumes
    pub fn subscription(&self) -> &Subscription {
        &self.config.subscription
    }

    /// Acknowledger sharing this receiver's runtime
    pub fn acknowledger(&self) -> &Acknowledger {
        &self.acknowledger
    }

    /// Poll with the configured timeout
    pub fn get(&mut self) -> Result<Option<Envelope>> {
        self.poll(self.config.poll_timeout)
    }

    /// Wait up to `timeout` for the next envelope.
    ///
    /// `Ok(None)` when nothing arrived in time or a heartbeat was due first.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Envelope>> {
        let rendezvous = self.rendezvous.clone();
        let Some(message) = rendezvous.block_on(self.fetch(timeout))? else {
            return Ok(None);
        };

        let topic = &self.config.subscription.topic;
        match self.decode(&message) {
            Ok(envelope) => {
                debug!(
                    "Received message {} from {} (attempt {})",
                    message.id(),
                    topic,
                    message.attempts()
                );
                metrics::record(topic, "received");
                Ok(Some(envelope))
            }
            Err(e) => {
                warn!("Poison message {} on {}: {}", message.id(), topic, e);
                if let Err(fin_err) = self.acknowledger.finish_message(&message) {
                    error!("Failed to finish poison message {}: {}", message.id(), fin_err);
                }
                metrics::record(topic, "poison");
                Err(e)
            }
        }
    }

    /// Processing succeeded
    pub fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.acknowledger.acknowledge(envelope)
    }

    /// Processing will not be completed
    pub fn reject(&self, envelope: &Envelope) -> Result<()> {
        self.acknowledger.reject(envelope)
    }

    async fn fetch(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>> {
        if self.consumer.is_none() {
            let connect = self
                .broker
                .connect_consumer(&self.config.address, &self.config.subscription);
            let consumer = bounded(self.rendezvous.operation_timeout(), "SUB", connect).await?;
            info!(
                "✅ Subscribed to {}/{} on {}",
                self.config.subscription.topic, self.config.subscription.channel, self.config.address
            );
            self.consumer = Some(consumer);
            self.last_heartbeat = Instant::now();
        }
        let Some(consumer) = self.consumer.as_mut() else {
            return Ok(None);
        };

        let deadline = Instant::now() + timeout;
        let heartbeat_at = self.last_heartbeat + self.config.heartbeat_interval;

        let wake = tokio::select! {
            biased;
            message = consumer.next_message() => Wake::Message(message),
            _ = tokio::time::sleep_until(heartbeat_at) => Wake::Heartbeat,
            _ = tokio::time::sleep_until(deadline) => Wake::Timeout,
        };

        match wake {
            Wake::Message(Ok(message)) => Ok(Some(message)),
            Wake::Message(Err(e)) => {
                warn!("Consumer connection lost, reconnecting on next poll: {}", e);
                self.consumer = None;
                Err(e)
            }
            Wake::Heartbeat => {
                self.heartbeat().await;
                Ok(None)
            }
            Wake::Timeout => Ok(None),
        }
    }

    // Heartbeat failures never surface; the next poll reconnects.
    async fn heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        let Some(consumer) = self.consumer.as_mut() else {
            return;
        };

        let timeout = self.rendezvous.operation_timeout();
        let result = bounded(timeout, "heartbeat", consumer.heartbeat()).await;
        match result {
            Ok(()) => debug!("Heartbeat sent on {}", self.config.subscription.topic),
            Err(e) => {
                warn!(
                    "Heartbeat failed on {}/{}: {}",
                    self.config.subscription.topic, self.config.subscription.channel, e
                );
                HEARTBEAT_FAILURES_TOTAL
                    .with_label_values(&[&self.config.subscription.topic])
                    .inc();
                self.consumer = None;
            }
        }
    }

    fn decode(&self, message: &BrokerMessage) -> Result<Envelope> {
        let encoded = from_wire(message.body())?;
        let envelope = self.serializer.decode(encoded)?;

        Ok(envelope
            .with(NsqReceivedStamp::new(
                message.clone(),
                self.config.subscription.topic.clone(),
            ))
            .with(TransportMessageIdStamp::new(message.id()))
            .with(RedeliveryStamp::new(u32::from(message.attempts()).saturating_sub(1))))
    }
}

async fn bounded<T>(
    timeout: Duration,
    operation: &str,
    future: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, future).await.unwrap_or_else(|_| {
        Err(Error::TransportUnavailable(format!(
            "{} timed out after {:?}",
            operation, timeout
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BrokerCall, InMemoryBroker};
    use crate::broker::Producer;
    use crate::serializer::JsonSerializer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Connects after `connect_delay`; its consumers never deliver and take
    // `heartbeat_delay` to answer a heartbeat
    struct StallingBroker {
        connect_delay: Duration,
        heartbeat_delay: Duration,
        connects: Arc<AtomicUsize>,
    }

    struct StallingConsumer {
        heartbeat_delay: Duration,
    }

    #[async_trait]
    impl BrokerClient for StallingBroker {
        async fn connect_producer(&self, _address: &str) -> Result<Box<dyn Producer>> {
            Err(Error::TransportUnavailable("consumer only".into()))
        }

        async fn connect_consumer(
            &self,
            _address: &str,
            _subscription: &Subscription,
        ) -> Result<Box<dyn Consumer>> {
            tokio::time::sleep(self.connect_delay).await;
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StallingConsumer {
                heartbeat_delay: self.heartbeat_delay,
            }))
        }
    }

    #[async_trait]
    impl Consumer for StallingConsumer {
        async fn next_message(&mut self) -> Result<BrokerMessage> {
            std::future::pending().await
        }

        async fn heartbeat(&mut self) -> Result<()> {
            tokio::time::sleep(self.heartbeat_delay).await;
            Ok(())
        }
    }

    fn stalling_receiver(broker: StallingBroker, heartbeat_interval: Duration) -> NsqReceiver {
        NsqReceiver::new(
            ReceiverConfig {
                address: "tcp://nsqd:4150".into(),
                subscription: Subscription {
                    topic: "orders".into(),
                    channel: "billing".into(),
                    rdy_count: 1,
                },
                poll_timeout: Duration::from_millis(50),
                heartbeat_interval,
            },
            Arc::new(broker),
            Arc::new(JsonSerializer),
            Rendezvous::new(Duration::from_millis(100)).unwrap(),
        )
    }

    fn receiver(broker: &InMemoryBroker, heartbeat_interval: Duration) -> NsqReceiver {
        NsqReceiver::new(
            ReceiverConfig {
                address: "tcp://nsqd:4150".into(),
                subscription: Subscription {
                    topic: "orders".into(),
                    channel: "billing".into(),
                    rdy_count: 1,
                },
                poll_timeout: Duration::from_millis(50),
                heartbeat_interval,
            },
            Arc::new(broker.clone()),
            Arc::new(JsonSerializer),
            Rendezvous::new(Duration::from_secs(1)).unwrap(),
        )
    }

    fn finishes(broker: &InMemoryBroker) -> usize {
        broker
            .calls()
            .iter()
            .filter(|c| matches!(c, BrokerCall::Finish { .. }))
            .count()
    }

    #[test]
    fn test_empty_poll_times_out() {
        let broker = InMemoryBroker::new();
        let mut receiver = receiver(&broker, Duration::from_secs(30));

        assert!(receiver.get().unwrap().is_none());
        assert_eq!(broker.consumer_connections(), 1);

        assert!(receiver.get().unwrap().is_none());
        assert_eq!(broker.consumer_connections(), 1);
    }

    #[test]
    fn test_received_envelope_is_stamped() {
        let broker = InMemoryBroker::new();
        broker.inject("orders", r#"{"body":{"id":1}}"#);
        let mut receiver = receiver(&broker, Duration::from_secs(30));

        let envelope = receiver.get().unwrap().unwrap();
        let stamp = envelope.last::<NsqReceivedStamp>().unwrap();

        assert_eq!(envelope.message(), &json!({"id": 1}));
        assert_eq!(envelope.last::<RedeliveryStamp>().unwrap().retry_count(), 0);
        assert_eq!(
            envelope.last::<TransportMessageIdStamp>().unwrap().id(),
            stamp.message().id()
        );
        assert!(!stamp.message().is_processed());
    }

    #[test]
    fn test_malformed_body_is_finished() {
        let broker = InMemoryBroker::new();
        broker.inject("orders", "{not json");
        let mut receiver = receiver(&broker, Duration::from_secs(30));

        let err = receiver.get().unwrap_err();

        assert!(matches!(err, Error::DecodingFailed(_)));
        assert_eq!(finishes(&broker), 1);
        assert_eq!(broker.in_flight("orders", "billing"), 0);
        assert!(receiver.get().unwrap().is_none());
    }

    #[test]
    fn test_unknown_shape_is_finished() {
        let broker = InMemoryBroker::new();
        broker.inject("orders", r#"{"payload":{"id":1}}"#);
        let mut receiver = receiver(&broker, Duration::from_secs(30));

        assert!(matches!(receiver.get(), Err(Error::DecodingFailed(_))));
        assert_eq!(finishes(&broker), 1);
    }

    #[test]
    fn test_idle_consumer_sends_heartbeat() {
        let broker = InMemoryBroker::new();
        let mut receiver = receiver(&broker, Duration::from_millis(10));

        assert!(receiver.poll(Duration::from_secs(1)).unwrap().is_none());
        assert_eq!(broker.heartbeats(), 1);
    }

    #[test]
    fn test_heartbeat_failure_is_swallowed_and_reconnects() {
        let broker = InMemoryBroker::new();
        broker.fail_heartbeats(true);
        let mut receiver = receiver(&broker, Duration::from_millis(10));

        assert!(receiver.poll(Duration::from_secs(1)).unwrap().is_none());
        assert_eq!(broker.heartbeats(), 0);

        broker.fail_heartbeats(false);
        broker.inject("orders", r#"{"body":"after"}"#);
        let envelope = receiver.poll(Duration::from_secs(1)).unwrap().unwrap();

        assert_eq!(envelope.message(), &json!("after"));
        assert_eq!(broker.consumer_connections(), 2);
    }

    #[test]
    fn test_unavailable_broker_surfaces_error() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut receiver = receiver(&broker, Duration::from_secs(30));

        assert!(matches!(receiver.get(), Err(Error::TransportUnavailable(_))));
        assert!(matches!(receiver.get(), Err(Error::TransportUnavailable(_))));

        broker.set_available(true);
        assert!(receiver.get().unwrap().is_none());
    }

    #[test]
    fn test_stalled_connect_is_bounded() {
        let connects = Arc::new(AtomicUsize::new(0));
        let mut receiver = stalling_receiver(
            StallingBroker {
                connect_delay: Duration::from_secs(3),
                heartbeat_delay: Duration::ZERO,
                connects: connects.clone(),
            },
            Duration::from_secs(30),
        );

        let started = std::time::Instant::now();
        let result = receiver.poll(Duration::from_millis(50));

        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stalled_heartbeat_drops_consumer() {
        let connects = Arc::new(AtomicUsize::new(0));
        let mut receiver = stalling_receiver(
            StallingBroker {
                connect_delay: Duration::ZERO,
                heartbeat_delay: Duration::from_secs(5),
                connects: connects.clone(),
            },
            Duration::from_millis(10),
        );

        let started = std::time::Instant::now();
        assert!(receiver.poll(Duration::from_millis(50)).unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        // dropped by the timed-out heartbeat, reopened here
        let _ = receiver.poll(Duration::from_millis(50)).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }
}
