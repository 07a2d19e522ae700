//! In-process broker with NSQ delivery semantics
//!
//! Used by the test suite and the demo binary in place of a real nsqd:
//! - a topic fans each message out to every channel
//! - messages published before any channel exists wait on the topic
//! - deliveries increment the attempt counter and move the message in flight
//! - REQ and DPUB hide the message until its delay elapses
//! - at most `rdy_count` messages are in flight per channel
//!
//! Every publish/finish/requeue that reaches the broker is journaled.

use crate::broker::{BrokerClient, BrokerMessage, Consumer, MessageAcker, Producer, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// A broker operation observed by the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    /// PUB
    Publish {
        /// Topic
        topic: String,
        /// Payload
        body: Bytes,
    },
    /// DPUB
    PublishDeferred {
        /// Topic
        topic: String,
        /// Payload
        body: Bytes,
        /// Delay
        delay: Duration,
    },
    /// FIN
    Finish {
        /// Message ID
        id: String,
    },
    /// REQ
    Requeue {
        /// Message ID
        id: String,
        /// Delay
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    body: Bytes,
    attempts: u16,
    timestamp: DateTime<Utc>,
    visible_at: Instant,
}

impl Pending {
    fn new(body: Bytes, delay: Duration) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(16);

        Self {
            id,
            body,
            attempts: 0,
            timestamp: Utc::now(),
            visible_at: Instant::now() + delay,
        }
    }
}

#[derive(Default)]
struct ChannelState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<String, Pending>,
    notify: Arc<Notify>,
}

impl ChannelState {
    fn push(&mut self, pending: Pending) {
        self.ready.push_back(pending);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct TopicState {
    backlog: Vec<Pending>,
    channels: HashMap<String, ChannelState>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicState>,
    calls: Vec<BrokerCall>,
    unavailable: bool,
    failing_heartbeats: bool,
    producer_connections: usize,
    consumer_connections: usize,
    heartbeats: usize,
}

impl State {
    fn ensure_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::TransportUnavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn channel_mut(&mut self, topic: &str, channel: &str) -> Option<&mut ChannelState> {
        self.topics.get_mut(topic)?.channels.get_mut(channel)
    }

    fn enqueue(&mut self, topic: &str, pending: Pending) {
        let topic = self.topics.entry(topic.to_string()).or_default();
        if topic.channels.is_empty() {
            topic.backlog.push(pending);
            return;
        }
        for channel in topic.channels.values_mut() {
            channel.push(pending.clone());
        }
    }
}

/// In-process NSQ stand-in
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a raw payload on a topic without journaling it
    pub fn inject(&self, topic: &str, body: impl Into<Bytes>) {
        self.state.lock().enqueue(topic, Pending::new(body.into(), Duration::ZERO));
    }

    /// Simulate a network partition: every operation fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Make heartbeats fail while leaving everything else working
    pub fn fail_heartbeats(&self, failing: bool) {
        self.state.lock().failing_heartbeats = failing;
    }

    /// Put every in-flight message of a channel back on the queue, as nsqd
    /// does when a message times out. Returns the number redelivered.
    pub fn redeliver_in_flight(&self, topic: &str, channel: &str) -> usize {
        let mut state = self.state.lock();
        let Some(channel) = state.channel_mut(topic, channel) else {
            return 0;
        };

        let mut timed_out: Vec<Pending> = channel.in_flight.drain().map(|(_, p)| p).collect();
        timed_out.sort_by_key(|p| p.timestamp);
        let count = timed_out.len();
        for mut pending in timed_out {
            pending.visible_at = Instant::now();
            channel.push(pending);
        }
        count
    }

    /// Journal of broker calls, oldest first
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().calls.clone()
    }

    /// Forget the journal
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Messages waiting (visible or deferred) on a channel
    pub fn depth(&self, topic: &str, channel: &str) -> usize {
        self.state
            .lock()
            .channel_mut(topic, channel)
            .map_or(0, |c| c.ready.len())
    }

    /// Messages delivered but neither finished nor requeued
    pub fn in_flight(&self, topic: &str, channel: &str) -> usize {
        self.state
            .lock()
            .channel_mut(topic, channel)
            .map_or(0, |c| c.in_flight.len())
    }

    /// Producer connections opened so far
    pub fn producer_connections(&self) -> usize {
        self.state.lock().producer_connections
    }

    /// Consumer connections opened so far
    pub fn consumer_connections(&self) -> usize {
        self.state.lock().consumer_connections
    }

    /// Successful heartbeats so far
    pub fn heartbeats(&self) -> usize {
        self.state.lock().heartbeats
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn connect_producer(&self, address: &str) -> Result<Box<dyn Producer>> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.producer_connections += 1;
        debug!("In-memory producer connected ({})", address);

        Ok(Box::new(InMemoryProducer {
            broker: self.clone(),
        }))
    }

    async fn connect_consumer(
        &self,
        address: &str,
        subscription: &Subscription,
    ) -> Result<Box<dyn Consumer>> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.consumer_connections += 1;

        let topic = state.topics.entry(subscription.topic.clone()).or_default();
        let backlog = std::mem::take(&mut topic.backlog);
        let channel = topic.channels.entry(subscription.channel.clone()).or_default();
        for pending in backlog {
            channel.push(pending);
        }

        debug!(
            "In-memory consumer subscribed to {}/{} ({})",
            subscription.topic, subscription.channel, address
        );

        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            subscription: subscription.clone(),
            acker: Arc::new(ChannelAcker {
                broker: self.clone(),
                topic: subscription.topic.clone(),
                channel: subscription.channel.clone(),
            }),
        }))
    }
}

struct InMemoryProducer {
    broker: InMemoryBroker,
}

impl InMemoryProducer {
    fn put(&self, topic: &str, body: Bytes, delay: Option<Duration>) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_available()?;

        state.calls.push(match delay {
            Some(delay) => BrokerCall::PublishDeferred {
                topic: topic.to_string(),
                body: body.clone(),
                delay,
            },
            None => BrokerCall::Publish {
                topic: topic.to_string(),
                body: body.clone(),
            },
        });
        state.enqueue(topic, Pending::new(body, delay.unwrap_or_default()));
        Ok(())
    }
}

#[async_trait]
impl Producer for InMemoryProducer {
    async fn publish(&mut self, topic: &str, body: Bytes) -> Result<()> {
        self.put(topic, body, None)
    }

    async fn publish_deferred(&mut self, topic: &str, body: Bytes, delay: Duration) -> Result<()> {
        self.put(topic, body, Some(delay))
    }
}

struct InMemoryConsumer {
    broker: InMemoryBroker,
    subscription: Subscription,
    acker: Arc<ChannelAcker>,
}

enum Delivery {
    Ready(BrokerMessage),
    Wait(Arc<Notify>, Option<Instant>),
}

impl InMemoryConsumer {
    fn try_deliver(&self) -> Result<Delivery> {
        let mut state = self.broker.state.lock();
        state.ensure_available()?;

        let channel = state
            .channel_mut(&self.subscription.topic, &self.subscription.channel)
            .ok_or_else(|| Error::TransportUnavailable("subscription closed".to_string()))?;

        let now = Instant::now();
        let rdy = self.subscription.rdy_count as usize;
        if channel.in_flight.len() >= rdy {
            return Ok(Delivery::Wait(channel.notify.clone(), None));
        }

        match channel.ready.iter().position(|p| p.visible_at <= now) {
            Some(pos) => {
                let Some(mut pending) = channel.ready.remove(pos) else {
                    return Ok(Delivery::Wait(channel.notify.clone(), None));
                };
                pending.attempts = pending.attempts.saturating_add(1);
                channel.in_flight.insert(pending.id.clone(), pending.clone());

                Ok(Delivery::Ready(BrokerMessage::new(
                    pending.id,
                    pending.body,
                    pending.attempts,
                    pending.timestamp,
                    self.acker.clone(),
                )))
            }
            None => {
                let next_visible = channel.ready.iter().map(|p| p.visible_at).min();
                Ok(Delivery::Wait(channel.notify.clone(), next_visible))
            }
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next_message(&mut self) -> Result<BrokerMessage> {
        loop {
            match self.try_deliver()? {
                Delivery::Ready(message) => return Ok(message),
                Delivery::Wait(notify, Some(at)) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                    }
                }
                Delivery::Wait(notify, None) => notify.notified().await,
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_available()?;
        if state.failing_heartbeats {
            return Err(Error::TransportUnavailable("heartbeat not acknowledged".to_string()));
        }
        state.heartbeats += 1;
        Ok(())
    }
}

struct ChannelAcker {
    broker: InMemoryBroker,
    topic: String,
    channel: String,
}

#[async_trait]
impl MessageAcker for ChannelAcker {
    async fn finish(&self, id: &str) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_available()?;
        state.calls.push(BrokerCall::Finish { id: id.to_string() });

        state
            .channel_mut(&self.topic, &self.channel)
            .and_then(|c| {
                let finished = c.in_flight.remove(id);
                c.notify.notify_one();
                finished
            })
            .map(|_| ())
            .ok_or_else(|| Error::TransportUnavailable(format!("E_FIN_FAILED {}", id)))
    }

    async fn requeue(&self, id: &str, delay: Duration) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.ensure_available()?;
        state.calls.push(BrokerCall::Requeue {
            id: id.to_string(),
            delay,
        });

        let channel = state
            .channel_mut(&self.topic, &self.channel)
            .ok_or_else(|| Error::TransportUnavailable(format!("E_REQ_FAILED {}", id)))?;
        let mut pending = channel
            .in_flight
            .remove(id)
            .ok_or_else(|| Error::TransportUnavailable(format!("E_REQ_FAILED {}", id)))?;

        pending.visible_at = Instant::now() + delay;
        channel.push(pending);
        Ok(())
    }
}
