//! Broker client seam
//!
//! The NSQ wire protocol lives behind these traits. A [`BrokerClient`] opens
//! producer and consumer connections; a [`Consumer`] yields [`BrokerMessage`]
//! handles whose finish/requeue calls travel back through a [`MessageAcker`].

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Topic/channel pair a consumer subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic
    pub topic: String,
    /// Channel
    pub channel: String,
    /// Max in-flight messages (RDY)
    pub rdy_count: u32,
}

/// Opens connections to nsqd
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open a publishing connection
    async fn connect_producer(&self, address: &str) -> Result<Box<dyn Producer>>;

    /// Open a subscribed consumer connection
    async fn connect_consumer(
        &self,
        address: &str,
        subscription: &Subscription,
    ) -> Result<Box<dyn Consumer>>;
}

/// Publishing side of a connection
#[async_trait]
pub trait Producer: Send {
    /// PUB
    async fn publish(&mut self, topic: &str, body: Bytes) -> Result<()>;

    /// DPUB: message becomes visible after `delay`
    async fn publish_deferred(&mut self, topic: &str, body: Bytes, delay: Duration) -> Result<()>;
}

/// Consuming side of a connection
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivered message.
    ///
    /// Must be cancel-safe: dropping the future before completion loses no message.
    async fn next_message(&mut self) -> Result<BrokerMessage>;

    /// Keepalive round trip
    async fn heartbeat(&mut self) -> Result<()>;
}

/// Sends FIN/REQ for delivered messages
#[async_trait]
pub trait MessageAcker: Send + Sync {
    /// FIN
    async fn finish(&self, id: &str) -> Result<()>;

    /// REQ
    async fn requeue(&self, id: &str, delay: Duration) -> Result<()>;
}

struct MessageInner {
    id: String,
    body: Bytes,
    attempts: u16,
    timestamp: DateTime<Utc>,
    processed: AtomicBool,
    acker: Arc<dyn MessageAcker>,
}

/// Handle to one in-flight NSQ message.
///
/// Clones share the processed flag, so once any clone finishes or requeues
/// the message no further FIN/REQ is sent for it.
#[derive(Clone)]
pub struct BrokerMessage {
    inner: Arc<MessageInner>,
}

impl BrokerMessage {
    /// Create handle for a delivered message
    pub fn new(
        id: impl Into<String>,
        body: Bytes,
        attempts: u16,
        timestamp: DateTime<Utc>,
        acker: Arc<dyn MessageAcker>,
    ) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                id: id.into(),
                body,
                attempts,
                timestamp,
                processed: AtomicBool::new(false),
                acker,
            }),
        }
    }

    /// Broker-assigned message ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Raw payload
    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    /// Delivery attempts, 1 on first delivery
    pub fn attempts(&self) -> u16 {
        self.inner.attempts
    }

    /// Publish time reported by the broker
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.inner.timestamp
    }

    /// Whether FIN or REQ has been sent
    pub fn is_processed(&self) -> bool {
        self.inner.processed.load(Ordering::Acquire)
    }

    /// Send FIN. No-op once processed.
    ///
    /// The message only counts as processed once nsqd accepted the FIN; a
    /// failed or cancelled call leaves it open for another attempt.
    pub async fn finish(&self) -> Result<()> {
        let Some(claim) = self.claim() else {
            return Ok(());
        };

        self.inner.acker.finish(&self.inner.id).await?;
        claim.commit();
        Ok(())
    }

    /// Send REQ with delay. No-op once processed.
    pub async fn requeue(&self, delay: Duration) -> Result<()> {
        let Some(claim) = self.claim() else {
            return Ok(());
        };

        self.inner.acker.requeue(&self.inner.id, delay).await?;
        claim.commit();
        Ok(())
    }

    fn claim(&self) -> Option<Claim<'_>> {
        if self.inner.processed.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(Claim {
            processed: &self.inner.processed,
            committed: false,
        })
    }
}

// Holds the processed flag while FIN/REQ is in flight. Dropped without
// commit (error or cancelled future) it hands the flag back.
struct Claim<'a> {
    processed: &'a AtomicBool,
    committed: bool,
}

impl Claim<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.processed.store(false, Ordering::Release);
        }
    }
}

impl fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerMessage")
            .field("id", &self.inner.id)
            .field("attempts", &self.inner.attempts)
            .field("body_len", &self.inner.body.len())
            .field("processed", &self.is_processed())
            .finish()
    }
}
